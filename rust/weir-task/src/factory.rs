//! The factory registry: translating task descriptors into running tasks.

use std::sync::Arc;

use tracing::{info, warn};

use weir_cluster::{Rack, Task as ClusterTask};
use weir_core::errors::Error;

use crate::status::{StatusDetails, TaskStatus, Variant};
use crate::task::{Command, ConfigureResult, Context, Task, START_CMD_TYPE};

/// Translates task configuration into running tasks for one integration.
pub trait Factory: Send + Sync {
    fn name(&self) -> &'static str;

    /// Configures a task when this factory claims its type. `None` means
    /// the type is not handled and the next factory is consulted.
    fn configure_task(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Option<Result<ConfigureResult, Error>>;

    /// Materializes factory-owned tasks the cluster does not create
    /// explicitly (scan tasks, the heartbeat). Returns the tasks to insert
    /// into the manager's registry.
    fn configure_initial_tasks(
        &self,
        _ctx: &Arc<Context>,
        _rack: &Rack,
    ) -> Vec<(ClusterTask, Box<dyn Task>)> {
        Vec::new()
    }
}

/// Converts a claimed configuration outcome into either an auto-started
/// task or a configuration-error status report.
pub fn handle_config_err(
    ctx: &Arc<Context>,
    task: &ClusterTask,
    result: Result<ConfigureResult, Error>,
) -> Option<Box<dyn Task>> {
    let mut status = TaskStatus {
        key: task.status_key,
        name: task.name.clone(),
        variant: Variant::Success,
        message: String::new(),
        details: StatusDetails { task: task.key, running: false, cmd: String::new() },
    };
    match result {
        Err(err) => {
            warn!(task = %task.name, error = %err, "task configuration failed");
            status.variant = Variant::Error;
            status.message = err.data;
            ctx.set_status(&status);
            None
        }
        Ok(configured) => {
            let mut boxed = configured.task;
            if configured.auto_start {
                let start = Command::new(task.key, START_CMD_TYPE, serde_json::Value::Null);
                boxed.exec(&start);
            } else {
                status.message = "Task configured successfully".to_string();
                ctx.set_status(&status);
            }
            Some(boxed)
        }
    }
}

/// Composes per-integration factories, consulting them in registration
/// order. More specific factories go first.
pub struct MultiFactory {
    factories: Vec<Arc<dyn Factory>>,
}

impl MultiFactory {
    pub fn new(factories: Vec<Arc<dyn Factory>>) -> Self {
        Self { factories }
    }

    /// Configures a task, returning `None` when no factory claims the type
    /// or when the claiming factory reported a configuration error (the
    /// error is surfaced as a task status by `handle_config_err`).
    pub fn configure_task(
        &self,
        ctx: &Arc<Context>,
        task: &ClusterTask,
    ) -> Option<Box<dyn Task>> {
        for factory in &self.factories {
            if let Some(result) = factory.configure_task(ctx, task) {
                return handle_config_err(ctx, task, result);
            }
        }
        warn!(task = %task.name, task_type = %task.task_type, "no factory claims task type");
        None
    }

    /// Materializes the initial tasks of every registered integration.
    pub fn configure_initial_tasks(
        &self,
        ctx: &Arc<Context>,
        rack: &Rack,
    ) -> Vec<(ClusterTask, Box<dyn Task>)> {
        let mut tasks = Vec::new();
        for factory in &self.factories {
            let initial = factory.configure_initial_tasks(ctx, rack);
            if !initial.is_empty() {
                info!(
                    integration = factory.name(),
                    count = initial.len(),
                    "materialized initial tasks"
                );
            }
            tasks.extend(initial);
        }
        tasks
    }
}
