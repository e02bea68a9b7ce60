//! Task status aggregation.
//!
//! A status handler latches at most one error. Warnings pass through only
//! while no error is latched; start/stop messages always reflect the latched
//! error when one exists.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use weir_cluster::{Task as ClusterTask, TaskKey};
use weir_core::errors::Error;

use crate::task::Context;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    #[default]
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusDetails {
    pub task: TaskKey,
    pub running: bool,
    #[serde(default)]
    pub cmd: String,
}

/// The wire payload written to the task state channel.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatus {
    pub key: u64,
    pub name: String,
    pub variant: Variant,
    pub message: String,
    pub details: StatusDetails,
}

/// Accumulates task health and emits status messages.
pub struct StatusHandler {
    ctx: Arc<Context>,
    task: ClusterTask,
    accumulated: Error,
    status: TaskStatus,
}

impl StatusHandler {
    pub fn new(ctx: Arc<Context>, task: &ClusterTask) -> Self {
        let status = TaskStatus {
            key: task.status_key,
            name: task.name.clone(),
            variant: Variant::Success,
            message: String::new(),
            details: StatusDetails { task: task.key, running: false, cmd: String::new() },
        };
        Self { ctx, task: task.clone(), accumulated: Error::nil(), status }
    }

    pub fn task(&self) -> &ClusterTask {
        &self.task
    }

    /// Restores the handler to its initial state.
    pub fn reset(&mut self) {
        self.status.variant = Variant::Success;
        self.accumulated = Error::nil();
    }

    /// Latches the error and marks the error variant. Nil errors are ignored
    /// and return false.
    pub fn error(&mut self, err: Error) -> bool {
        if err.ok() {
            return false;
        }
        self.status.variant = Variant::Error;
        self.accumulated = err;
        true
    }

    pub fn has_error(&self) -> bool {
        !self.accumulated.ok()
    }

    /// Emits a warning. When an error is latched, the latched error is
    /// emitted instead and the warning dropped.
    pub fn send_warning(&mut self, warning: &str) {
        self.status.key = self.task.status_key;
        if self.accumulated.ok() {
            self.status.variant = Variant::Warning;
            self.status.message = warning.to_string();
        } else {
            self.status.message = self.accumulated.data.clone();
        }
        self.ctx.set_status(&self.status);
    }

    /// Restores the success variant, but only from the warning variant.
    pub fn clear_warning(&mut self) {
        if self.status.variant != Variant::Warning {
            return;
        }
        self.status.variant = Variant::Success;
        self.status.message = "Task running".to_string();
        self.ctx.set_status(&self.status);
    }

    /// Emits the running-state message for a start command. A latched error
    /// forces the error variant with `running = false`.
    pub fn send_start(&mut self, cmd_key: &str) {
        self.status.key = self.task.status_key;
        self.status.details.cmd = cmd_key.to_string();
        if self.accumulated.ok() {
            self.status.details.running = true;
            self.status.message = "Task started successfully".to_string();
        } else {
            self.status.variant = Variant::Error;
            self.status.details.running = false;
            self.status.message = self.accumulated.data.clone();
        }
        self.ctx.set_status(&self.status);
    }

    /// Emits the stopped-state message for a stop command. The task is
    /// marked not running regardless of error state.
    pub fn send_stop(&mut self, cmd_key: &str) {
        self.status.key = self.task.status_key;
        self.status.details.cmd = cmd_key.to_string();
        self.status.details.running = false;
        if self.accumulated.ok() {
            self.status.message = "Task stopped successfully".to_string();
        } else {
            self.status.variant = Variant::Error;
            self.status.message = self.accumulated.data.clone();
        }
        self.ctx.set_status(&self.status);
    }
}
