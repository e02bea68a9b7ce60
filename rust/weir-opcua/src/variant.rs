//! OPC UA value variants and their conversion into series.

use weir_core::errors::{self, Error};
use weir_core::series::{DataType, Series};

/// A scalar OPC UA value, already decoded from the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Boolean(bool),
    SByte(i8),
    Byte(u8),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    /// 100ns intervals since the UA epoch, converted to Unix nanoseconds by
    /// the client layer.
    DateTime(i64),
}

impl Value {
    fn as_f64(&self) -> Option<f64> {
        Some(match self {
            Value::Boolean(v) => u8::from(*v) as f64,
            Value::SByte(v) => *v as f64,
            Value::Byte(v) => *v as f64,
            Value::Int16(v) => *v as f64,
            Value::UInt16(v) => *v as f64,
            Value::Int32(v) => *v as f64,
            Value::UInt32(v) => *v as f64,
            Value::Int64(v) => *v as f64,
            Value::UInt64(v) => *v as f64,
            Value::Float(v) => *v as f64,
            Value::Double(v) => *v,
            Value::DateTime(v) => *v as f64,
            Value::String(_) => return None,
        })
    }

    fn type_name(&self) -> &'static str {
        match self {
            Value::Boolean(_) => "Boolean",
            Value::SByte(_) => "SByte",
            Value::Byte(_) => "Byte",
            Value::Int16(_) => "Int16",
            Value::UInt16(_) => "UInt16",
            Value::Int32(_) => "Int32",
            Value::UInt32(_) => "UInt32",
            Value::Int64(_) => "Int64",
            Value::UInt64(_) => "UInt64",
            Value::Float(_) => "Float",
            Value::Double(_) => "Double",
            Value::String(_) => "String",
            Value::DateTime(_) => "DateTime",
        }
    }
}

/// A possibly-array response for one read target.
#[derive(Debug, Clone, PartialEq)]
pub enum Variant {
    /// The server returned no value.
    Null,
    Scalar(Value),
    Array(Vec<Value>),
    /// The response could not be decoded; carries the reason.
    Malformed(String),
}

/// Writes one scalar into a series, coercing numerics to the series type.
pub fn write_value_to_series(series: &mut Series, value: &Value) -> errors::Result<()> {
    if series.data_type().is_variable() {
        return match value {
            Value::String(s) => series.push_string(s.clone()),
            other => Err(Error::new(
                errors::VALIDATION,
                format!("cannot convert {} to {}", other.type_name(), series.data_type().name()),
            )),
        };
    }
    match value.as_f64() {
        Some(v) => series.push_f64(v),
        None => Err(Error::new(
            errors::VALIDATION,
            format!("cannot convert {} to {}", value.type_name(), series.data_type().name()),
        )),
    }
}

/// Writes up to `array_size` elements of an array response into a series.
/// Returns the number of samples written; malformed or inconvertible input
/// is an error and the caller discards the frame.
pub fn write_array_to_series(
    series: &mut Series,
    variant: &Variant,
    array_size: usize,
    channel_name: &str,
) -> errors::Result<usize> {
    match variant {
        Variant::Null => Err(Error::new(
            errors::VALIDATION,
            format!("no value returned for channel {channel_name}"),
        )),
        Variant::Malformed(reason) => Err(Error::new(
            errors::VALIDATION,
            format!("invalid OPC UA data for channel {channel_name}: {reason}"),
        )),
        Variant::Scalar(value) => {
            write_value_to_series(series, value).map_err(|e| annotate(e, channel_name))?;
            Ok(1)
        }
        Variant::Array(values) => {
            let take = values.len().min(array_size);
            for value in &values[..take] {
                write_value_to_series(series, value).map_err(|e| annotate(e, channel_name))?;
            }
            Ok(take)
        }
    }
}

fn annotate(err: Error, channel_name: &str) -> Error {
    err.with_data(format!("channel {channel_name}: {}", err.data))
}
