//! Runtime state shared between the scheduler and the I/O thread.
//!
//! The I/O thread pushes channel samples into a bounded input queue and
//! drains setpoints from a bounded output queue; the scheduler touches both
//! only at cycle boundaries. All port storage is registered at load time so
//! the cycle path never allocates.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use weir_core::errors::{self, Error};
use weir_core::frame::ChannelKey;

/// One scalar telemetry sample crossing the I/O boundary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub channel: ChannelKey,
    pub value: f64,
}

/// Default bound on the input and output queues.
pub const DEFAULT_QUEUE_DEPTH: usize = 1024;

#[derive(Debug)]
pub struct State {
    /// Node output ports, keyed `node:param`. Registered at load time.
    ports: HashMap<String, f64>,
    /// Latest value per subscribed channel.
    channels: HashMap<ChannelKey, f64>,
    /// Channels updated by the most recent input-queue drain.
    updated: Vec<ChannelKey>,
    input: Arc<ArrayQueue<Sample>>,
    output: Arc<ArrayQueue<Sample>>,
}

impl Default for State {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_DEPTH)
    }
}

impl State {
    pub fn new(queue_depth: usize) -> Self {
        Self {
            ports: HashMap::new(),
            channels: HashMap::new(),
            updated: Vec::with_capacity(queue_depth),
            input: Arc::new(ArrayQueue::new(queue_depth)),
            output: Arc::new(ArrayQueue::new(queue_depth)),
        }
    }

    /// Registers a node output port. Load-time only.
    pub fn register_port(&mut self, name: String) {
        self.ports.entry(name).or_insert(0.0);
    }

    /// Subscribes a channel so samples for it are retained. Load-time only.
    pub fn register_channel(&mut self, channel: ChannelKey) {
        self.channels.entry(channel).or_insert(0.0);
    }

    pub fn port(&self, name: &str) -> errors::Result<f64> {
        self.ports
            .get(name)
            .copied()
            .ok_or_else(|| Error::new(errors::NOT_FOUND, format!("port {name} is not registered")))
    }

    pub fn set_port(&mut self, name: &str, value: f64) -> errors::Result<()> {
        match self.ports.get_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::new(errors::NOT_FOUND, format!("port {name} is not registered"))),
        }
    }

    /// Latest retained value of a subscribed channel.
    pub fn channel(&self, channel: ChannelKey) -> Option<f64> {
        self.channels.get(&channel).copied()
    }

    /// Whether the last input drain carried a sample for this channel.
    pub fn channel_updated(&self, channel: ChannelKey) -> bool {
        self.updated.contains(&channel)
    }

    /// Handle the I/O thread uses to push samples in.
    pub fn input_handle(&self) -> Arc<ArrayQueue<Sample>> {
        self.input.clone()
    }

    /// Handle the I/O thread uses to pull emitted setpoints out.
    pub fn output_handle(&self) -> Arc<ArrayQueue<Sample>> {
        self.output.clone()
    }

    /// Queues a setpoint for the I/O thread. Samples are dropped when the
    /// queue is full; the channel write node re-emits on the next change.
    pub fn emit(&mut self, sample: Sample) -> bool {
        self.output.push(sample).is_ok()
    }

    /// Drains the input queue into channel state, recording which channels
    /// changed. Called at the top of every scheduler cycle.
    pub(crate) fn process_input_queue(&mut self) {
        self.updated.clear();
        while let Some(sample) = self.input.pop() {
            if let Some(slot) = self.channels.get_mut(&sample.channel) {
                *slot = sample.value;
                if !self.updated.contains(&sample.channel) {
                    self.updated.push(sample.channel);
                }
            }
        }
    }

    /// Clears the per-cycle updated markers. Called at the end of every
    /// cycle.
    pub(crate) fn clear_cycle(&mut self) {
        self.updated.clear();
    }
}
