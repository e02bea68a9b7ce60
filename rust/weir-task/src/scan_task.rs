//! The periodic device-discovery task template.
//!
//! Each integration supplies a [`Scanner`]; the task runs it on a timer,
//! posts newly discovered devices to the cluster registry, withdraws
//! devices that disappeared, and surfaces scan failures as warnings.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tracing::{debug, warn};

use weir_cluster::{Device, RackKey, Task as ClusterTask};
use weir_core::breaker::{self, Breaker};
use weir_core::errors;
use weir_core::telem::Rate;
use weir_core::timer::Timer;

use crate::status::StatusHandler;
use crate::task::{Command, Context, Task, SCAN_CMD_TYPE, START_CMD_TYPE, STOP_CMD_TYPE};

/// Integration-specific device discovery.
pub trait Scanner: Send {
    fn scan(&mut self) -> errors::Result<Vec<Device>>;
}

struct ScanShared {
    ctx: Arc<Context>,
    rack: RackKey,
    scanner: Mutex<Box<dyn Scanner>>,
    status: Mutex<StatusHandler>,
    /// Devices currently posted to the cluster, keyed by device key.
    known: Mutex<HashMap<String, Device>>,
}

impl ScanShared {
    /// Runs one scan cycle and reconciles the cluster device registry.
    fn scan_once(&self) {
        let scanned = {
            let mut scanner = self.scanner.lock();
            scanner.scan()
        };
        let devices = match scanned {
            Ok(devices) => devices,
            Err(err) => {
                warn!(error = %err, "device scan failed");
                self.status.lock().send_warning(&err.data);
                return;
            }
        };
        let mut known = self.known.lock();
        let mut current: HashMap<String, Device> = HashMap::with_capacity(devices.len());
        for mut device in devices {
            device.rack = self.rack;
            let changed = known.get(&device.key).map(|d| d != &device).unwrap_or(true);
            if changed {
                if let Err(err) = self.ctx.client.create_device(&device) {
                    warn!(device = %device.key, error = %err, "failed to post device");
                    self.status.lock().send_warning(&err.data);
                    continue;
                }
                debug!(device = %device.key, "posted device");
            }
            current.insert(device.key.clone(), device);
        }
        for key in known.keys() {
            if !current.contains_key(key) {
                if let Err(err) = self.ctx.client.delete_device(key) {
                    warn!(device = %key, error = %err, "failed to withdraw device");
                }
            }
        }
        *known = current;
    }
}

/// A periodic probe loop discovering an integration's devices.
pub struct ScanTask {
    name: String,
    shared: Arc<ScanShared>,
    rate: Rate,
    breaker: Breaker,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ScanTask {
    pub fn new(
        ctx: &Arc<Context>,
        task: &ClusterTask,
        rack: RackKey,
        scanner: Box<dyn Scanner>,
        rate: Rate,
        breaker_config: breaker::Config,
    ) -> Self {
        let shared = Arc::new(ScanShared {
            ctx: ctx.clone(),
            rack,
            scanner: Mutex::new(scanner),
            status: Mutex::new(StatusHandler::new(ctx.clone(), task)),
            known: Mutex::new(HashMap::new()),
        });
        Self {
            name: task.name.clone(),
            shared,
            rate,
            breaker: Breaker::new(breaker_config),
            running: Arc::new(AtomicBool::new(false)),
            thread: None,
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&mut self, cmd_key: &str) {
        if self.running.swap(true, Ordering::AcqRel) {
            return;
        }
        self.breaker.reset();
        self.breaker.start();
        let shared = self.shared.clone();
        let running = self.running.clone();
        let breaker = self.breaker.clone();
        let rate = self.rate;
        self.thread = Some(std::thread::spawn(move || {
            let mut timer = Timer::from_rate(rate);
            // First scan fires immediately so devices appear at startup.
            shared.scan_once();
            while running.load(Ordering::Acquire) {
                timer.wait(&breaker);
                if !running.load(Ordering::Acquire) {
                    break;
                }
                shared.scan_once();
            }
        }));
        self.shared.status.lock().send_start(cmd_key);
    }

    fn stop_inner(&mut self, cmd_key: &str, propagate_state: bool) {
        let was_running = self.running.swap(false, Ordering::AcqRel);
        self.breaker.stop();
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
        if was_running && propagate_state {
            self.shared.status.lock().send_stop(cmd_key);
        }
    }
}

impl Task for ScanTask {
    fn name(&self) -> &str {
        &self.name
    }

    fn exec(&mut self, cmd: &Command) {
        match cmd.cmd_type.as_str() {
            START_CMD_TYPE => self.start(&cmd.key),
            STOP_CMD_TYPE => self.stop_inner(&cmd.key, true),
            SCAN_CMD_TYPE => self.shared.scan_once(),
            _ => {}
        }
    }

    fn stop(&mut self, will_reconfigure: bool) {
        self.stop_inner("", !will_reconfigure);
    }
}

impl Drop for ScanTask {
    fn drop(&mut self) {
        self.stop_inner("", false);
    }
}
