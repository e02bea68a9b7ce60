//! In-place frame transforms applied between hardware reads and the cluster
//! writer: tare first, then per-channel scaling.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;

use weir_cluster::Channel;
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::series::DataType;

/// An ordered, in-place data transform.
pub trait Transform: Send + Sync {
    fn transform(&self, frame: &mut Frame) -> errors::Result<()>;
}

/// Applies transforms in registration order.
#[derive(Default, Clone)]
pub struct Chain {
    transforms: Vec<Arc<dyn Transform>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, transform: Arc<dyn Transform>) {
        self.transforms.push(transform);
    }
}

impl Transform for Chain {
    fn transform(&self, frame: &mut Frame) -> errors::Result<()> {
        for t in &self.transforms {
            t.transform(frame)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct TareState {
    /// Per-channel offsets subtracted from every frame.
    values: HashMap<ChannelKey, f64>,
    /// Channels whose offsets are captured from the next frame.
    pending: HashSet<ChannelKey>,
    /// Capture offsets for every channel on the next frame.
    pending_all: bool,
}

#[derive(Deserialize)]
struct TareArgs {
    #[serde(default)]
    keys: Vec<ChannelKey>,
}

/// Zeroes channels around their current readings.
///
/// `tare` marks channels; the next `transform` call captures each marked
/// channel's average as its offset, and every subsequent frame has the
/// offsets subtracted in place. Re-taring overrides the pending state.
pub struct Tare {
    channels: HashSet<ChannelKey>,
    state: Mutex<TareState>,
}

impl Tare {
    pub fn new(channels: &[Channel]) -> Self {
        Self {
            channels: channels.iter().map(|c| c.key).collect(),
            state: Mutex::new(TareState::default()),
        }
    }

    /// Marks channels for taring. An empty or missing key list tares every
    /// configured channel.
    pub fn tare(&self, args: &serde_json::Value) -> errors::Result<()> {
        let args: TareArgs = serde_json::from_value(args.clone())
            .map_err(|e| Error::new(errors::VALIDATION, format!("invalid tare args: {e}")))?;
        let mut state = self.state.lock();
        if args.keys.is_empty() {
            state.pending_all = true;
            state.pending.clear();
            return Ok(());
        }
        for key in &args.keys {
            if !self.channels.contains(key) {
                return Err(Error::new(
                    errors::VALIDATION,
                    format!("channel {key} is not a configured channel to tare"),
                ));
            }
        }
        state.pending = args.keys.into_iter().collect();
        state.pending_all = false;
        Ok(())
    }
}

impl Transform for Tare {
    fn transform(&self, frame: &mut Frame) -> errors::Result<()> {
        let mut state = self.state.lock();
        if state.pending_all || !state.pending.is_empty() {
            let capture_all = state.pending_all;
            let mut captured = Vec::new();
            for (key, series) in frame.iter() {
                if capture_all || state.pending.contains(&key) {
                    captured.push((key, series.average()));
                }
            }
            for (key, avg) in captured {
                state.values.insert(key, avg);
            }
            state.pending_all = false;
            state.pending.clear();
        }
        for (key, series) in frame.iter_mut() {
            if let Some(offset) = state.values.get(&key) {
                series.sub_scalar(*offset)?;
            }
        }
        Ok(())
    }
}

/// `v * slope + offset`, validated against the channel's data type.
pub struct UnaryLinearScale {
    pub slope: f64,
    pub offset: f64,
    data_type: DataType,
}

impl UnaryLinearScale {
    fn apply(&self, series: &mut weir_core::series::Series) -> errors::Result<()> {
        check_dtype(self.data_type, series.data_type())?;
        series.mul_scalar(self.slope)?;
        series.add_scalar(self.offset)
    }
}

/// Maps `[pre_scaled_min, pre_scaled_max]` onto `[scaled_min, scaled_max]`.
pub struct UnaryMapScale {
    pub pre_scaled_min: f64,
    pub pre_scaled_max: f64,
    pub scaled_min: f64,
    pub scaled_max: f64,
    data_type: DataType,
}

impl UnaryMapScale {
    fn apply(&self, series: &mut weir_core::series::Series) -> errors::Result<()> {
        check_dtype(self.data_type, series.data_type())?;
        series.sub_scalar(self.pre_scaled_min)?;
        series.div_scalar(self.pre_scaled_max - self.pre_scaled_min)?;
        series.mul_scalar(self.scaled_max - self.scaled_min)?;
        series.add_scalar(self.scaled_min)
    }
}

fn check_dtype(expected: DataType, actual: DataType) -> errors::Result<()> {
    if expected != actual {
        return Err(Error::new(
            errors::VALIDATION,
            format!(
                "series data type {} does not match scale data type {}",
                actual.name(),
                expected.name()
            ),
        ));
    }
    Ok(())
}

enum UnaryScale {
    Linear(UnaryLinearScale),
    Map(UnaryMapScale),
}

#[derive(Deserialize)]
struct ScaleChannelEntry {
    channel: ChannelKey,
    #[serde(default = "default_enabled")]
    enabled: bool,
    #[serde(default)]
    scale: Option<ScaleEntry>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ScaleEntry {
    Linear { slope: f64, offset: f64 },
    Map {
        pre_scaled_min: f64,
        pre_scaled_max: f64,
        scaled_min: f64,
        scaled_max: f64,
    },
    None,
}

/// Per-channel scaling parsed from a read task's `channels` configuration.
pub struct Scale {
    scales: HashMap<ChannelKey, UnaryScale>,
}

impl Scale {
    /// Builds scales from the task config's `channels` list. Entries without
    /// a `scale` object, disabled entries, and `type: none` are skipped.
    pub fn parse(
        config: &serde_json::Value,
        channels: &HashMap<ChannelKey, Channel>,
    ) -> errors::Result<Self> {
        let mut scales = HashMap::new();
        let entries = match config.get("channels") {
            Some(v) => v.clone(),
            None => return Ok(Self { scales }),
        };
        let entries: Vec<ScaleChannelEntry> = serde_json::from_value(entries)
            .map_err(|e| Error::new(errors::VALIDATION, format!("invalid channels config: {e}")))?;
        for entry in entries {
            if !entry.enabled {
                continue;
            }
            let Some(scale) = entry.scale else { continue };
            let channel = channels.get(&entry.channel).ok_or_else(|| {
                Error::new(
                    errors::VALIDATION,
                    format!("channel {} is not a configured channel", entry.channel),
                )
            })?;
            let unary = match scale {
                ScaleEntry::Linear { slope, offset } => UnaryScale::Linear(UnaryLinearScale {
                    slope,
                    offset,
                    data_type: channel.data_type,
                }),
                ScaleEntry::Map {
                    pre_scaled_min,
                    pre_scaled_max,
                    scaled_min,
                    scaled_max,
                } => UnaryScale::Map(UnaryMapScale {
                    pre_scaled_min,
                    pre_scaled_max,
                    scaled_min,
                    scaled_max,
                    data_type: channel.data_type,
                }),
                ScaleEntry::None => continue,
            };
            scales.insert(entry.channel, unary);
        }
        Ok(Self { scales })
    }

    pub fn is_empty(&self) -> bool {
        self.scales.is_empty()
    }
}

impl Transform for Scale {
    fn transform(&self, frame: &mut Frame) -> errors::Result<()> {
        for (key, series) in frame.iter_mut() {
            match self.scales.get(&key) {
                Some(UnaryScale::Linear(s)) => s.apply(series)?,
                Some(UnaryScale::Map(s)) => s.apply(series)?,
                None => {}
            }
        }
        Ok(())
    }
}
