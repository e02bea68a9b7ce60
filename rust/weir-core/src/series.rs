//! Typed, contiguous sample buffers.
//!
//! A [`Series`] owns one buffer of samples of a single [`DataType`]. Buffers
//! are sized once at task startup and then cleared and rewritten on every
//! acquisition cycle, so the hot path never reallocates.

use serde::{Deserialize, Serialize};

use crate::errors::{self, Error};
use crate::telem::{TimeSpan, TimeStamp};

/// Sample data types understood by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Float64,
    Float32,
    Int64,
    Int32,
    Int16,
    Int8,
    Uint64,
    Uint32,
    Uint16,
    Uint8,
    Timestamp,
    String,
    Json,
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Float64
    }
}

impl DataType {
    /// Bytes per sample; zero for variable-density types.
    pub fn density(&self) -> usize {
        match self {
            DataType::Float64 | DataType::Int64 | DataType::Uint64 | DataType::Timestamp => 8,
            DataType::Float32 | DataType::Int32 | DataType::Uint32 => 4,
            DataType::Int16 | DataType::Uint16 => 2,
            DataType::Int8 | DataType::Uint8 => 1,
            DataType::String | DataType::Json => 0,
        }
    }

    pub fn is_variable(&self) -> bool {
        self.density() == 0
    }

    pub fn is_numeric(&self) -> bool {
        !matches!(self, DataType::String | DataType::Json)
    }

    pub fn name(&self) -> &'static str {
        match self {
            DataType::Float64 => "float64",
            DataType::Float32 => "float32",
            DataType::Int64 => "int64",
            DataType::Int32 => "int32",
            DataType::Int16 => "int16",
            DataType::Int8 => "int8",
            DataType::Uint64 => "uint64",
            DataType::Uint32 => "uint32",
            DataType::Uint16 => "uint16",
            DataType::Uint8 => "uint8",
            DataType::Timestamp => "timestamp",
            DataType::String => "string",
            DataType::Json => "json",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
enum Samples {
    F64(Vec<f64>),
    F32(Vec<f32>),
    I64(Vec<i64>),
    I32(Vec<i32>),
    I16(Vec<i16>),
    I8(Vec<i8>),
    U64(Vec<u64>),
    U32(Vec<u32>),
    U16(Vec<u16>),
    U8(Vec<u8>),
    Str(Vec<String>),
}

/// Dispatches over every numeric storage variant, binding the buffer to `$v`.
macro_rules! numeric_op {
    ($samples:expr, $v:ident => $body:expr, $str_case:expr) => {
        match $samples {
            Samples::F64($v) => $body,
            Samples::F32($v) => $body,
            Samples::I64($v) => $body,
            Samples::I32($v) => $body,
            Samples::I16($v) => $body,
            Samples::I8($v) => $body,
            Samples::U64($v) => $body,
            Samples::U32($v) => $body,
            Samples::U16($v) => $body,
            Samples::U8($v) => $body,
            Samples::Str($v) => $str_case,
        }
    };
}

/// A contiguous buffer of samples with a fixed data type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    data_type: DataType,
    samples: Samples,
}

impl Series {
    /// An empty series of the given type.
    pub fn empty(data_type: DataType) -> Self {
        Self::with_capacity(data_type, 0)
    }

    /// An empty series with buffer space for `cap` samples.
    pub fn with_capacity(data_type: DataType, cap: usize) -> Self {
        let samples = match data_type {
            DataType::Float64 => Samples::F64(Vec::with_capacity(cap)),
            DataType::Float32 => Samples::F32(Vec::with_capacity(cap)),
            DataType::Int64 | DataType::Timestamp => Samples::I64(Vec::with_capacity(cap)),
            DataType::Int32 => Samples::I32(Vec::with_capacity(cap)),
            DataType::Int16 => Samples::I16(Vec::with_capacity(cap)),
            DataType::Int8 => Samples::I8(Vec::with_capacity(cap)),
            DataType::Uint64 => Samples::U64(Vec::with_capacity(cap)),
            DataType::Uint32 => Samples::U32(Vec::with_capacity(cap)),
            DataType::Uint16 => Samples::U16(Vec::with_capacity(cap)),
            DataType::Uint8 => Samples::U8(Vec::with_capacity(cap)),
            DataType::String | DataType::Json => Samples::Str(Vec::with_capacity(cap)),
        };
        Self { data_type, samples }
    }

    pub fn from_f64s(values: Vec<f64>) -> Self {
        Self { data_type: DataType::Float64, samples: Samples::F64(values) }
    }

    pub fn from_u64s(values: Vec<u64>) -> Self {
        Self { data_type: DataType::Uint64, samples: Samples::U64(values) }
    }

    pub fn from_strings(data_type: DataType, values: Vec<String>) -> Self {
        debug_assert!(data_type.is_variable());
        Self { data_type, samples: Samples::Str(values) }
    }

    pub fn from_timestamps(values: Vec<TimeStamp>) -> Self {
        Self {
            data_type: DataType::Timestamp,
            samples: Samples::I64(values.into_iter().map(|t| t.nanos()).collect()),
        }
    }

    /// A timestamp series of `n` values linearly spaced across
    /// `[start, end)`, or `[start, end]` when `inclusive`.
    pub fn linspace(start: TimeStamp, end: TimeStamp, n: usize, inclusive: bool) -> Self {
        let mut out = Self::with_capacity(DataType::Timestamp, n);
        if n == 0 {
            return out;
        }
        let denom = if inclusive { (n - 1).max(1) } else { n };
        let span = (end - start).nanos() as f64;
        for i in 0..n {
            let offset = TimeSpan((span * i as f64 / denom as f64) as i64);
            let _ = out.push_timestamp(start + offset);
        }
        out
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn len(&self) -> usize {
        numeric_op!(&self.samples, v => v.len(), v.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        numeric_op!(&self.samples, v => v.capacity(), v.capacity())
    }

    /// Drops all samples while keeping the allocated buffer.
    pub fn clear(&mut self) {
        numeric_op!(&mut self.samples, v => v.clear(), v.clear());
    }

    /// Appends a numeric sample, casting into the storage type.
    pub fn push_f64(&mut self, value: f64) -> errors::Result<()> {
        match &mut self.samples {
            Samples::F64(v) => v.push(value),
            Samples::F32(v) => v.push(value as f32),
            Samples::I64(v) => v.push(value as i64),
            Samples::I32(v) => v.push(value as i32),
            Samples::I16(v) => v.push(value as i16),
            Samples::I8(v) => v.push(value as i8),
            Samples::U64(v) => v.push(value as u64),
            Samples::U32(v) => v.push(value as u32),
            Samples::U16(v) => v.push(value as u16),
            Samples::U8(v) => v.push(value as u8),
            Samples::Str(_) => return Err(self.variable_density_err()),
        }
        Ok(())
    }

    /// Appends an unsigned integer sample without a float round trip.
    pub fn push_u64(&mut self, value: u64) -> errors::Result<()> {
        match &mut self.samples {
            Samples::U64(v) => v.push(value),
            Samples::U32(v) => v.push(value as u32),
            Samples::U16(v) => v.push(value as u16),
            Samples::U8(v) => v.push(value as u8),
            Samples::I64(v) => v.push(value as i64),
            Samples::I32(v) => v.push(value as i32),
            Samples::I16(v) => v.push(value as i16),
            Samples::I8(v) => v.push(value as i8),
            Samples::F64(v) => v.push(value as f64),
            Samples::F32(v) => v.push(value as f32),
            Samples::Str(_) => return Err(self.variable_density_err()),
        }
        Ok(())
    }

    /// Appends a signed integer sample without a float round trip.
    pub fn push_i64(&mut self, value: i64) -> errors::Result<()> {
        match &mut self.samples {
            Samples::I64(v) => v.push(value),
            Samples::I32(v) => v.push(value as i32),
            Samples::I16(v) => v.push(value as i16),
            Samples::I8(v) => v.push(value as i8),
            Samples::U64(v) => v.push(value as u64),
            Samples::U32(v) => v.push(value as u32),
            Samples::U16(v) => v.push(value as u16),
            Samples::U8(v) => v.push(value as u8),
            Samples::F64(v) => v.push(value as f64),
            Samples::F32(v) => v.push(value as f32),
            Samples::Str(_) => return Err(self.variable_density_err()),
        }
        Ok(())
    }

    pub fn push_timestamp(&mut self, value: TimeStamp) -> errors::Result<()> {
        self.push_i64(value.nanos())
    }

    pub fn push_string(&mut self, value: String) -> errors::Result<()> {
        match &mut self.samples {
            Samples::Str(v) => {
                v.push(value);
                Ok(())
            }
            _ => Err(Error::new(
                errors::VALIDATION,
                format!("cannot write a string into a {} series", self.data_type.name()),
            )),
        }
    }

    /// Appends a slice of samples, casting each into the storage type.
    pub fn write_casted(&mut self, values: &[f64]) -> errors::Result<()> {
        for v in values {
            self.push_f64(*v)?;
        }
        Ok(())
    }

    /// The sample at `i` widened to f64, or `None` when out of bounds or
    /// variable-density.
    pub fn at_f64(&self, i: usize) -> Option<f64> {
        match &self.samples {
            Samples::F64(v) => v.get(i).copied(),
            Samples::F32(v) => v.get(i).map(|x| *x as f64),
            Samples::I64(v) => v.get(i).map(|x| *x as f64),
            Samples::I32(v) => v.get(i).map(|x| *x as f64),
            Samples::I16(v) => v.get(i).map(|x| *x as f64),
            Samples::I8(v) => v.get(i).map(|x| *x as f64),
            Samples::U64(v) => v.get(i).map(|x| *x as f64),
            Samples::U32(v) => v.get(i).map(|x| *x as f64),
            Samples::U16(v) => v.get(i).map(|x| *x as f64),
            Samples::U8(v) => v.get(i).map(|x| *x as f64),
            Samples::Str(_) => None,
        }
    }

    /// The sample at `i` as an unsigned integer.
    pub fn at_u64(&self, i: usize) -> Option<u64> {
        match &self.samples {
            Samples::U64(v) => v.get(i).copied(),
            Samples::U32(v) => v.get(i).map(|x| *x as u64),
            Samples::U16(v) => v.get(i).map(|x| *x as u64),
            Samples::U8(v) => v.get(i).map(|x| *x as u64),
            Samples::I64(v) => v.get(i).map(|x| *x as u64),
            Samples::I32(v) => v.get(i).map(|x| *x as u64),
            Samples::I16(v) => v.get(i).map(|x| *x as u64),
            Samples::I8(v) => v.get(i).map(|x| *x as u64),
            Samples::F64(v) => v.get(i).map(|x| *x as u64),
            Samples::F32(v) => v.get(i).map(|x| *x as u64),
            Samples::Str(_) => None,
        }
    }

    pub fn at_timestamp(&self, i: usize) -> Option<TimeStamp> {
        match &self.samples {
            Samples::I64(v) => v.get(i).map(|x| TimeStamp(*x)),
            _ => None,
        }
    }

    /// The backing strings of a variable-density series.
    pub fn strings(&self) -> Option<&[String]> {
        match &self.samples {
            Samples::Str(v) => Some(v),
            _ => None,
        }
    }

    /// All samples widened to u64. Empty for variable-density series.
    pub fn u64s(&self) -> Vec<u64> {
        (0..self.len()).filter_map(|i| self.at_u64(i)).collect()
    }

    /// The arithmetic mean of the samples, widened to f64.
    pub fn average(&self) -> f64 {
        let n = self.len();
        if n == 0 {
            return 0.0;
        }
        let sum: f64 = (0..n).filter_map(|i| self.at_f64(i)).sum();
        sum / n as f64
    }

    /// Applies `f` to every sample in place, round-tripping through f64.
    pub fn apply_f64<F: Fn(f64) -> f64>(&mut self, f: F) -> errors::Result<()> {
        match &mut self.samples {
            Samples::F64(v) => v.iter_mut().for_each(|x| *x = f(*x)),
            Samples::F32(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as f32),
            Samples::I64(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as i64),
            Samples::I32(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as i32),
            Samples::I16(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as i16),
            Samples::I8(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as i8),
            Samples::U64(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as u64),
            Samples::U32(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as u32),
            Samples::U16(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as u16),
            Samples::U8(v) => v.iter_mut().for_each(|x| *x = f(*x as f64) as u8),
            Samples::Str(_) => return Err(self.variable_density_err()),
        }
        Ok(())
    }

    pub fn add_scalar(&mut self, s: f64) -> errors::Result<()> {
        self.apply_f64(|x| x + s)
    }

    pub fn sub_scalar(&mut self, s: f64) -> errors::Result<()> {
        self.apply_f64(|x| x - s)
    }

    pub fn mul_scalar(&mut self, s: f64) -> errors::Result<()> {
        self.apply_f64(|x| x * s)
    }

    pub fn div_scalar(&mut self, s: f64) -> errors::Result<()> {
        self.apply_f64(|x| x / s)
    }

    fn variable_density_err(&self) -> Error {
        Error::new(
            errors::VALIDATION,
            format!("numeric operation on {} series", self.data_type.name()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::telem::SECOND;
    use test_case::test_case;

    #[test]
    fn clear_preserves_capacity() {
        let mut s = Series::with_capacity(DataType::Float32, 64);
        for i in 0..64 {
            s.push_f64(i as f64).unwrap();
        }
        let cap = s.capacity();
        s.clear();
        assert_eq!(s.len(), 0);
        assert_eq!(s.capacity(), cap);
    }

    #[test]
    fn casted_writes_land_in_storage_type() {
        let mut s = Series::empty(DataType::Int16);
        s.write_casted(&[1.7, -2.2, 300.0]).unwrap();
        assert_eq!(s.at_f64(0), Some(1.0));
        assert_eq!(s.at_f64(1), Some(-2.0));
        assert_eq!(s.at_f64(2), Some(300.0));
    }

    #[test]
    fn average_widens() {
        let mut s = Series::empty(DataType::Uint8);
        s.write_casted(&[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(s.average(), 2.5);
    }

    #[test]
    fn numeric_op_on_string_series_fails() {
        let mut s = Series::empty(DataType::String);
        assert!(s.push_f64(1.0).is_err());
        assert!(s.add_scalar(1.0).is_err());
        s.push_string("ok".to_string()).unwrap();
        assert_eq!(s.strings().unwrap(), &["ok".to_string()]);
    }

    #[test]
    fn linspace_exclusive_spacing() {
        let start = TimeStamp(0);
        let end = start + SECOND;
        let s = Series::linspace(start, end, 4, false);
        assert_eq!(s.len(), 4);
        assert_eq!(s.at_timestamp(0), Some(TimeStamp(0)));
        assert_eq!(s.at_timestamp(1), Some(TimeStamp(250_000_000)));
        assert_eq!(s.at_timestamp(3), Some(TimeStamp(750_000_000)));
    }

    #[test]
    fn linspace_inclusive_hits_endpoint() {
        let start = TimeStamp(0);
        let end = start + SECOND;
        let s = Series::linspace(start, end, 5, true);
        assert_eq!(s.len(), 5);
        assert_eq!(s.at_timestamp(4), Some(TimeStamp(SECOND.0)));
    }

    #[test_case(DataType::Float64, 8)]
    #[test_case(DataType::Uint16, 2)]
    #[test_case(DataType::Timestamp, 8)]
    #[test_case(DataType::Json, 0)]
    fn densities(dt: DataType, expected: usize) {
        assert_eq!(dt.density(), expected);
    }

    #[test]
    fn scalar_ops_in_place() {
        let mut s = Series::from_f64s(vec![1.0, 2.0, 3.0]);
        s.mul_scalar(2.0).unwrap();
        s.add_scalar(1.0).unwrap();
        assert_eq!(s.at_f64(0), Some(3.0));
        assert_eq!(s.at_f64(2), Some(7.0));
    }
}
