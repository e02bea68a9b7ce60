// weir-cluster: the driver's view of the Weir cluster
//
// The cluster is an external collaborator. This crate pins down the narrow
// interface the driver consumes: descriptor types, key packing, the
// writer/streamer contracts, an in-memory mock used throughout the test
// suites, and a minimal framed-JSON TCP client for live deployments.

pub mod client;
pub mod keys;
pub mod mock;
pub mod remote;
pub mod types;

pub use client::{Client, Streamer, StreamerConfig, Writer, WriterConfig, WriterMode};
pub use keys::{local_task_key, rack_key, task_key, task_rack_key, RackKey, TaskKey};
pub use types::{Channel, Device, Rack, Task};

/// Channel names the driver requires on every cluster.
pub const TASK_SET_CHANNEL: &str = "weir_task_set";
pub const TASK_DELETE_CHANNEL: &str = "weir_task_delete";
pub const TASK_CMD_CHANNEL: &str = "weir_task_cmd";
pub const TASK_STATE_CHANNEL: &str = "weir_task_state";
pub const RACK_HEARTBEAT_CHANNEL: &str = "weir_rack_heartbeat";
