//! Descriptor types retrieved from and created on the cluster.

use serde::{Deserialize, Serialize};

use weir_core::frame::ChannelKey;
use weir_core::series::DataType;

use crate::keys::{RackKey, TaskKey};

/// A host running the driver.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rack {
    pub key: RackKey,
    pub name: String,
}

/// An immutable task descriptor created by the cluster and materialized by a
/// factory on the rack.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub key: TaskKey,
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub config: serde_json::Value,
    /// Key of the status message stream for this task.
    #[serde(default)]
    pub status_key: u64,
    /// Internal tasks are factory-owned and never surfaced for editing.
    #[serde(default)]
    pub internal: bool,
    #[serde(default)]
    pub snapshot: bool,
}

/// A telemetry channel descriptor.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    pub key: ChannelKey,
    pub name: String,
    pub data_type: DataType,
    /// Key of this channel's index channel; zero for none.
    #[serde(default)]
    pub index: ChannelKey,
    #[serde(default)]
    pub is_index: bool,
    #[serde(default)]
    pub is_virtual: bool,
}

/// A hardware device discovered by a scan task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Stable identifier, typically a serial number or address.
    pub key: String,
    pub name: String,
    pub rack: RackKey,
    /// Where the device lives: resource name, bus position, or URL.
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub make: String,
    #[serde(default)]
    pub model: String,
    /// Integration-specific properties consumed by task configuration.
    #[serde(default)]
    pub properties: serde_json::Value,
    #[serde(default)]
    pub configured: bool,
}
