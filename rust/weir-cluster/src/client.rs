//! The client contract every cluster backend implements.
//!
//! The driver never talks to a transport directly: pipelines and the task
//! manager are written against these traits, the mock cluster implements
//! them in-process for tests, and `remote` implements them over a socket.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use weir_core::errors;
use weir_core::frame::{ChannelKey, Frame};

use crate::keys::{RackKey, TaskKey};
use crate::types::{Channel, Device, Rack, Task};

/// Whether written frames are persisted or only fanned out to live readers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriterMode {
    PersistStream,
    StreamOnly,
}

/// The writer mode implied by a task's `data_saving` flag.
pub fn data_saving_writer_mode(data_saving: bool) -> WriterMode {
    if data_saving {
        WriterMode::PersistStream
    } else {
        WriterMode::StreamOnly
    }
}

/// Configuration for opening a frame writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriterConfig {
    pub channels: Vec<ChannelKey>,
    /// Control subject name shown in the cluster UI; tasks default this to
    /// their own name.
    #[serde(default)]
    pub subject_name: String,
    pub mode: WriterMode,
}

impl WriterConfig {
    pub fn new(channels: Vec<ChannelKey>) -> Self {
        Self { channels, subject_name: String::new(), mode: WriterMode::PersistStream }
    }
}

/// Configuration for opening a frame streamer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamerConfig {
    pub channels: Vec<ChannelKey>,
}

/// A handle writing frames into the cluster. Owned by exactly one thread.
pub trait Writer: Send {
    fn write(&mut self, frame: &Frame) -> errors::Result<()>;

    /// Adjusts write authority on a subset of this writer's channels.
    fn set_authority(&mut self, keys: &[ChannelKey], authorities: &[u8]) -> errors::Result<()>;

    fn close(&mut self) -> errors::Result<()>;
}

impl std::fmt::Debug for dyn Writer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Writer").finish_non_exhaustive()
    }
}

/// A handle receiving frames from the cluster.
///
/// `read` blocks and is typically called from a dedicated worker thread;
/// `close_send` may be called from any thread and causes a blocked `read` to
/// return `freighter.eof`, which callers treat as clean shutdown.
pub trait Streamer: Send + Sync {
    fn read(&self) -> errors::Result<Frame>;

    fn close_send(&self);
}

/// The cluster registry and telemetry surface the driver consumes.
pub trait Client: Send + Sync {
    fn retrieve_channel(&self, name: &str) -> errors::Result<Channel>;

    fn retrieve_channels(&self, keys: &[ChannelKey]) -> errors::Result<Vec<Channel>>;

    fn create_channel(&self, channel: Channel) -> errors::Result<Channel>;

    fn retrieve_rack(&self, key: RackKey) -> errors::Result<Rack>;

    fn create_rack(&self, name: &str) -> errors::Result<Rack>;

    fn retrieve_task(&self, key: TaskKey) -> errors::Result<Task>;

    /// All tasks on the given rack.
    fn retrieve_rack_tasks(&self, rack: RackKey) -> errors::Result<Vec<Task>>;

    fn create_task(&self, task: &Task) -> errors::Result<Task>;

    fn retrieve_device(&self, key: &str) -> errors::Result<Device>;

    fn retrieve_rack_devices(&self, rack: RackKey) -> errors::Result<Vec<Device>>;

    fn create_device(&self, device: &Device) -> errors::Result<Device>;

    fn delete_device(&self, key: &str) -> errors::Result<()>;

    fn open_writer(&self, config: WriterConfig) -> errors::Result<Box<dyn Writer>>;

    fn open_streamer(&self, config: StreamerConfig) -> errors::Result<Arc<dyn Streamer>>;
}
