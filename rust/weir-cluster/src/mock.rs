//! In-memory cluster used by the test suites and local bring-up.
//!
//! Behaves like a single-node cluster: a channel/rack/task/device registry,
//! writers that fan frames out to live streamers, and hooks for injecting
//! transport failures so retry paths can be exercised deterministically.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;

use weir_core::errors::{self, Error};
use weir_core::frame::{ChannelKey, Frame};
use weir_core::series::{DataType, Series};

use crate::client::{Client, Streamer, StreamerConfig, Writer, WriterConfig};
use crate::keys::{rack_key, RackKey, TaskKey};
use crate::types::{Channel, Device, Rack, Task};
use crate::{
    RACK_HEARTBEAT_CHANNEL, TASK_CMD_CHANNEL, TASK_DELETE_CHANNEL, TASK_SET_CHANNEL,
    TASK_STATE_CHANNEL,
};

enum Msg {
    Frame(Frame),
    Eof,
}

struct Subscriber {
    channels: Vec<ChannelKey>,
    tx: Sender<Msg>,
}

#[derive(Default)]
struct Registry {
    channels: HashMap<ChannelKey, Channel>,
    channel_names: HashMap<String, ChannelKey>,
    racks: HashMap<RackKey, Rack>,
    tasks: HashMap<TaskKey, Task>,
    devices: HashMap<String, Device>,
}

#[derive(Default)]
struct Faults {
    open_writer: Vec<Error>,
    open_streamer: Vec<Error>,
    write: Vec<Error>,
}

struct Inner {
    registry: Mutex<Registry>,
    subscribers: Mutex<Vec<Subscriber>>,
    written: Mutex<Vec<Frame>>,
    faults: Mutex<Faults>,
    next_channel_key: AtomicU32,
    next_local_task: AtomicU64,
}

/// A process-local cluster.
#[derive(Clone)]
pub struct MockCluster {
    inner: Arc<Inner>,
}

impl Default for MockCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCluster {
    pub fn new() -> Self {
        let cluster = Self {
            inner: Arc::new(Inner {
                registry: Mutex::new(Registry::default()),
                subscribers: Mutex::new(Vec::new()),
                written: Mutex::new(Vec::new()),
                faults: Mutex::new(Faults::default()),
                next_channel_key: AtomicU32::new(1),
                next_local_task: AtomicU64::new(1),
            }),
        };
        for (name, data_type) in [
            (TASK_SET_CHANNEL, DataType::Uint64),
            (TASK_DELETE_CHANNEL, DataType::Uint64),
            (TASK_CMD_CHANNEL, DataType::String),
            (TASK_STATE_CHANNEL, DataType::Json),
            (RACK_HEARTBEAT_CHANNEL, DataType::Uint64),
        ] {
            let channel = Channel {
                key: 0,
                name: name.to_string(),
                data_type,
                ..Channel::default()
            };
            cluster
                .create_channel(channel)
                .unwrap_or_else(|_| unreachable!("builtin channel creation is infallible"));
        }
        cluster
    }

    /// Queues errors returned by the next `open_writer` calls, oldest first.
    pub fn fail_next_writer_opens(&self, errs: Vec<Error>) {
        self.inner.faults.lock().open_writer = errs;
    }

    /// Queues errors returned by the next `open_streamer` calls.
    pub fn fail_next_streamer_opens(&self, errs: Vec<Error>) {
        self.inner.faults.lock().open_streamer = errs;
    }

    /// Queues errors returned by the next writer `write` calls, across all
    /// open writers.
    pub fn fail_next_writes(&self, errs: Vec<Error>) {
        self.inner.faults.lock().write = errs;
    }

    /// Fans a frame out to live streamers without going through a writer.
    /// Tests use this to emulate the cluster pushing `task_set` / `task_cmd`.
    pub fn push_frame(&self, frame: Frame) {
        self.distribute(&frame);
    }

    /// Every frame written by the driver, in write order.
    pub fn written(&self) -> Vec<Frame> {
        self.inner.written.lock().clone()
    }

    /// All series written to the given channel, in write order.
    pub fn written_to(&self, key: ChannelKey) -> Vec<Series> {
        self.inner
            .written
            .lock()
            .iter()
            .filter_map(|f| f.get(key).cloned())
            .collect()
    }

    /// Parsed task-state payloads emitted by the driver, in order.
    pub fn task_states(&self) -> Vec<serde_json::Value> {
        let key = match self.retrieve_channel(TASK_STATE_CHANNEL) {
            Ok(ch) => ch.key,
            Err(_) => return Vec::new(),
        };
        self.written_to(key)
            .iter()
            .flat_map(|s| s.strings().unwrap_or(&[]).to_vec())
            .filter_map(|s| serde_json::from_str(&s).ok())
            .collect()
    }

    fn distribute(&self, frame: &Frame) {
        let mut subs = self.inner.subscribers.lock();
        subs.retain(|sub| {
            let filtered: Frame = {
                let mut f = Frame::with_capacity(frame.len());
                for (key, series) in frame.iter() {
                    if sub.channels.contains(&key) {
                        f.push(key, series.clone());
                    }
                }
                f
            };
            if filtered.is_empty() {
                return true;
            }
            sub.tx.send(Msg::Frame(filtered)).is_ok()
        });
    }
}

impl Client for MockCluster {
    fn retrieve_channel(&self, name: &str) -> errors::Result<Channel> {
        let registry = self.inner.registry.lock();
        registry
            .channel_names
            .get(name)
            .and_then(|k| registry.channels.get(k))
            .cloned()
            .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("channel {name} not found")))
    }

    fn retrieve_channels(&self, keys: &[ChannelKey]) -> errors::Result<Vec<Channel>> {
        let registry = self.inner.registry.lock();
        keys.iter()
            .map(|k| {
                registry
                    .channels
                    .get(k)
                    .cloned()
                    .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("channel {k} not found")))
            })
            .collect()
    }

    fn create_channel(&self, mut channel: Channel) -> errors::Result<Channel> {
        let mut registry = self.inner.registry.lock();
        if channel.key == 0 {
            channel.key = self.inner.next_channel_key.fetch_add(1, Ordering::Relaxed);
        }
        registry.channel_names.insert(channel.name.clone(), channel.key);
        registry.channels.insert(channel.key, channel.clone());
        Ok(channel)
    }

    fn retrieve_rack(&self, key: RackKey) -> errors::Result<Rack> {
        self.inner
            .registry
            .lock()
            .racks
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("rack {key} not found")))
    }

    fn create_rack(&self, name: &str) -> errors::Result<Rack> {
        let mut registry = self.inner.registry.lock();
        let key = rack_key(1, registry.racks.len() as u32 + 1);
        let rack = Rack { key, name: name.to_string() };
        registry.racks.insert(key, rack.clone());
        Ok(rack)
    }

    fn retrieve_task(&self, key: TaskKey) -> errors::Result<Task> {
        self.inner
            .registry
            .lock()
            .tasks
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("task {key} not found")))
    }

    fn retrieve_rack_tasks(&self, rack: RackKey) -> errors::Result<Vec<Task>> {
        Ok(self
            .inner
            .registry
            .lock()
            .tasks
            .values()
            .filter(|t| crate::keys::task_rack_key(t.key) == rack)
            .cloned()
            .collect())
    }

    fn create_task(&self, task: &Task) -> errors::Result<Task> {
        let mut created = task.clone();
        if crate::keys::local_task_key(created.key) == 0 {
            let local = self.inner.next_local_task.fetch_add(1, Ordering::Relaxed);
            created.key |= local;
        }
        self.inner.registry.lock().tasks.insert(created.key, created.clone());
        Ok(created)
    }

    fn retrieve_device(&self, key: &str) -> errors::Result<Device> {
        self.inner
            .registry
            .lock()
            .devices
            .get(key)
            .cloned()
            .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("device {key} not found")))
    }

    fn retrieve_rack_devices(&self, rack: RackKey) -> errors::Result<Vec<Device>> {
        Ok(self
            .inner
            .registry
            .lock()
            .devices
            .values()
            .filter(|d| d.rack == rack)
            .cloned()
            .collect())
    }

    fn create_device(&self, device: &Device) -> errors::Result<Device> {
        self.inner
            .registry
            .lock()
            .devices
            .insert(device.key.clone(), device.clone());
        Ok(device.clone())
    }

    fn delete_device(&self, key: &str) -> errors::Result<()> {
        self.inner.registry.lock().devices.remove(key);
        Ok(())
    }

    fn open_writer(&self, config: WriterConfig) -> errors::Result<Box<dyn Writer>> {
        {
            let mut faults = self.inner.faults.lock();
            if !faults.open_writer.is_empty() {
                return Err(faults.open_writer.remove(0));
            }
        }
        Ok(Box::new(MockWriter { cluster: self.clone(), channels: config.channels }))
    }

    fn open_streamer(&self, config: StreamerConfig) -> errors::Result<Arc<dyn Streamer>> {
        {
            let mut faults = self.inner.faults.lock();
            if !faults.open_streamer.is_empty() {
                return Err(faults.open_streamer.remove(0));
            }
        }
        let (tx, rx) = unbounded();
        self.inner
            .subscribers
            .lock()
            .push(Subscriber { channels: config.channels, tx: tx.clone() });
        Ok(Arc::new(MockStreamer { tx, rx }))
    }
}

struct MockWriter {
    cluster: MockCluster,
    channels: Vec<ChannelKey>,
}

impl Writer for MockWriter {
    fn write(&mut self, frame: &Frame) -> errors::Result<()> {
        {
            let mut faults = self.cluster.inner.faults.lock();
            if !faults.write.is_empty() {
                return Err(faults.write.remove(0));
            }
        }
        for key in frame.keys() {
            if !self.channels.contains(key) {
                return Err(Error::new(
                    errors::VALIDATION,
                    format!("channel {key} is not part of this writer"),
                ));
            }
        }
        self.cluster.inner.written.lock().push(frame.clone());
        self.cluster.distribute(frame);
        Ok(())
    }

    fn set_authority(&mut self, keys: &[ChannelKey], authorities: &[u8]) -> errors::Result<()> {
        if keys.len() != authorities.len() {
            return Err(Error::new(
                errors::VALIDATION,
                "authority count does not match channel count",
            ));
        }
        Ok(())
    }

    fn close(&mut self) -> errors::Result<()> {
        Ok(())
    }
}

struct MockStreamer {
    tx: Sender<Msg>,
    rx: Receiver<Msg>,
}

impl Streamer for MockStreamer {
    fn read(&self) -> errors::Result<Frame> {
        match self.rx.recv() {
            Ok(Msg::Frame(frame)) => Ok(frame),
            Ok(Msg::Eof) | Err(_) => Err(Error::new(errors::EOF, "stream closed")),
        }
    }

    fn close_send(&self) {
        let _ = self.tx.send(Msg::Eof);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_channels_exist() {
        let cluster = MockCluster::new();
        for name in [
            TASK_SET_CHANNEL,
            TASK_DELETE_CHANNEL,
            TASK_CMD_CHANNEL,
            TASK_STATE_CHANNEL,
            RACK_HEARTBEAT_CHANNEL,
        ] {
            assert!(cluster.retrieve_channel(name).is_ok(), "missing {name}");
        }
    }

    #[test]
    fn writes_reach_subscribed_streamers() {
        let cluster = MockCluster::new();
        let ch = cluster
            .create_channel(Channel {
                name: "ai_0".to_string(),
                data_type: DataType::Float64,
                ..Channel::default()
            })
            .unwrap();
        let streamer = cluster
            .open_streamer(StreamerConfig { channels: vec![ch.key] })
            .unwrap();
        let mut writer = cluster.open_writer(WriterConfig::new(vec![ch.key])).unwrap();

        writer
            .write(&Frame::single(ch.key, Series::from_f64s(vec![1.0, 2.0])))
            .unwrap();
        let frame = streamer.read().unwrap();
        assert_eq!(frame.get(ch.key).unwrap().len(), 2);

        streamer.close_send();
        let err = streamer.read().unwrap_err();
        assert!(err.matches(errors::EOF));
    }

    #[test]
    fn injected_faults_pop_in_order() {
        let cluster = MockCluster::new();
        cluster.fail_next_writer_opens(vec![Error::new(errors::UNREACHABLE, "down")]);
        let err = cluster.open_writer(WriterConfig::new(vec![1])).unwrap_err();
        assert!(err.matches(errors::UNREACHABLE));
        assert!(cluster.open_writer(WriterConfig::new(vec![1])).is_ok());
    }

    #[test]
    fn rack_task_round_trip() {
        let cluster = MockCluster::new();
        let rack = cluster.create_rack("test-rack").unwrap();
        let task = cluster
            .create_task(&Task {
                key: crate::keys::task_key(rack.key, 0),
                name: "hb".to_string(),
                task_type: "heartbeat".to_string(),
                internal: true,
                ..Task::default()
            })
            .unwrap();
        assert_ne!(crate::keys::local_task_key(task.key), 0);
        let tasks = cluster.retrieve_rack_tasks(rack.key).unwrap();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].task_type, "heartbeat");
    }
}
