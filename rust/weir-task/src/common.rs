//! Configuration and frame plumbing shared by the hardware read tasks.

use std::collections::{BTreeSet, HashMap};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use weir_cluster::{Channel, Client};
use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::series::{DataType, Series};
use weir_core::telem::Rate;

use crate::clock::TimingConfig;

/// Parses a task's JSON config into a typed structure, mapping failures to
/// configuration errors. An absent config is treated as the empty object.
pub fn parse_config<T: DeserializeOwned>(config: &serde_json::Value) -> errors::Result<T> {
    let config = if config.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        config.clone()
    };
    serde_json::from_value(config)
        .map_err(|e| Error::new(errors::CONFIGURATION, format!("invalid task configuration: {e}")))
}

/// Read task parameters common across integrations.
#[derive(Debug, Clone, Deserialize)]
pub struct BaseReadTaskConfig {
    /// Persist written frames rather than only streaming them.
    #[serde(default = "default_data_saving")]
    pub data_saving: bool,
    /// Hardware sampling rate in Hz.
    pub sample_rate: f64,
    /// Rate at which accumulated samples are streamed to the cluster.
    #[serde(default)]
    pub stream_rate: f64,
    #[serde(default)]
    pub enable_skew_correction: Option<bool>,
}

fn default_data_saving() -> bool {
    true
}

impl BaseReadTaskConfig {
    /// Validates rates: `sample_rate > 0` always, and when a stream rate is
    /// required, `sample_rate >= stream_rate > 0`.
    pub fn validate(&self, stream_rate_required: bool) -> errors::Result<()> {
        if self.sample_rate <= 0.0 {
            return Err(Error::new(errors::CONFIGURATION, "sample_rate must be greater than 0"));
        }
        if stream_rate_required {
            if self.stream_rate <= 0.0 {
                return Err(Error::new(
                    errors::CONFIGURATION,
                    "stream_rate must be greater than 0",
                ));
            }
            if self.sample_rate < self.stream_rate {
                return Err(Error::new(
                    errors::CONFIGURATION,
                    "sample_rate must be greater than or equal to stream_rate",
                ));
            }
        }
        Ok(())
    }

    pub fn sample_rate(&self) -> Rate {
        Rate::hz(self.sample_rate)
    }

    pub fn stream_rate(&self) -> Rate {
        Rate::hz(self.stream_rate)
    }

    pub fn timing(&self) -> TimingConfig {
        TimingConfig {
            enable_skew_correction: self.enable_skew_correction.unwrap_or(true),
        }
    }

    /// Samples accumulated per channel per stream cycle.
    pub fn samples_per_chan(&self) -> usize {
        if self.stream_rate <= 0.0 {
            return 1;
        }
        ((self.sample_rate / self.stream_rate) as usize).max(1)
    }
}

/// Resolves the data channels of a read task plus the index channels they
/// reference. Index channels that are themselves in the data set are not
/// duplicated.
pub fn resolve_channels(
    client: &dyn Client,
    keys: &[ChannelKey],
) -> errors::Result<(Vec<Channel>, BTreeSet<ChannelKey>)> {
    let channels = client.retrieve_channels(keys)?;
    let mut index_keys: BTreeSet<ChannelKey> = channels
        .iter()
        .filter(|ch| ch.index != 0)
        .map(|ch| ch.index)
        .collect();
    for ch in &channels {
        if ch.is_index {
            index_keys.remove(&ch.key);
        }
    }
    Ok((channels, index_keys))
}

/// Map form of a channel list, keyed by channel key.
pub fn channel_map(channels: &[Channel]) -> HashMap<ChannelKey, Channel> {
    channels.iter().map(|ch| (ch.key, ch.clone())).collect()
}

/// Initializes a reused frame with one correctly-typed slot per data
/// channel plus one timestamp slot per index channel. A no-op once sized.
pub fn initialize_frame(
    frame: &mut Frame,
    channels: &[Channel],
    index_keys: &BTreeSet<ChannelKey>,
    samples_per_chan: usize,
) {
    if frame.len() == channels.len() + index_keys.len() {
        return;
    }
    frame.clear();
    for ch in channels {
        frame.push(ch.key, Series::with_capacity(ch.data_type, samples_per_chan));
    }
    for idx in index_keys {
        frame.push(*idx, Series::with_capacity(DataType::Timestamp, samples_per_chan));
    }
}

/// Warning surfaced when the driver trails the hardware's acquisition.
pub fn skew_warning(skew: usize) -> String {
    format!(
        "Weir driver can't keep up with hardware data acquisition, and is trailing \
         {skew} samples behind. Lower the stream rate for the task."
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use weir_cluster::mock::MockCluster;

    #[test]
    fn base_config_validation() {
        let cfg: BaseReadTaskConfig =
            parse_config(&json!({ "sample_rate": 100.0, "stream_rate": 10.0 })).unwrap();
        cfg.validate(true).unwrap();
        assert_eq!(cfg.samples_per_chan(), 10);
        assert!(cfg.data_saving);

        let cfg: BaseReadTaskConfig =
            parse_config(&json!({ "sample_rate": 5.0, "stream_rate": 10.0 })).unwrap();
        let err = cfg.validate(true).unwrap_err();
        assert!(err.matches(errors::CONFIGURATION));

        let cfg: BaseReadTaskConfig =
            parse_config(&json!({ "sample_rate": 0.0, "stream_rate": 1.0 })).unwrap();
        assert!(cfg.validate(false).is_err());
    }

    #[test]
    fn stream_rate_optional_when_not_required() {
        let cfg: BaseReadTaskConfig = parse_config(&json!({ "sample_rate": 100.0 })).unwrap();
        cfg.validate(false).unwrap();
        assert_eq!(cfg.samples_per_chan(), 1);
    }

    #[test]
    fn resolve_channels_collects_indexes() {
        let cluster = MockCluster::new();
        let idx = cluster
            .create_channel(Channel {
                name: "time".to_string(),
                data_type: DataType::Timestamp,
                is_index: true,
                ..Channel::default()
            })
            .unwrap();
        let data = cluster
            .create_channel(Channel {
                name: "ai_0".to_string(),
                data_type: DataType::Float64,
                index: idx.key,
                ..Channel::default()
            })
            .unwrap();
        let (channels, index_keys) = resolve_channels(&cluster, &[data.key]).unwrap();
        assert_eq!(channels.len(), 1);
        assert_eq!(index_keys.iter().copied().collect::<Vec<_>>(), vec![idx.key]);

        // An index channel in the data set is not duplicated.
        let (_, index_keys) = resolve_channels(&cluster, &[data.key, idx.key]).unwrap();
        assert!(index_keys.is_empty());
    }

    #[test]
    fn frame_initialization_is_idempotent() {
        let channels = vec![Channel {
            key: 1,
            name: "ai_0".to_string(),
            data_type: DataType::Float32,
            ..Channel::default()
        }];
        let index_keys: BTreeSet<ChannelKey> = [9].into_iter().collect();
        let mut frame = Frame::new();
        initialize_frame(&mut frame, &channels, &index_keys, 8);
        assert_eq!(frame.len(), 2);
        assert_eq!(frame.get(1).unwrap().capacity(), 8);
        let before = frame.get(9).unwrap() as *const Series;
        initialize_frame(&mut frame, &channels, &index_keys, 8);
        assert_eq!(frame.get(9).unwrap() as *const Series, before);
    }
}
