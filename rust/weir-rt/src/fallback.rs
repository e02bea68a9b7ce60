//! Fallback backend for platforms without an RT implementation in this
//! build (Windows MMCSS enrollment included). Every capability reports
//! unsupported and `apply_config` degrades to a logged warning.

use tracing::warn;

use crate::{Capabilities, Capability, Config};

pub fn probe() -> Capabilities {
    Capabilities {
        priority_scheduling: Capability::of(false, false),
        deadline_scheduling: Capability::of(false, false),
        time_constraint: Capability::of(false, false),
        mmcss: Capability::of(false, false),
        cpu_affinity: Capability::of(false, false),
        memory_locking: Capability::of(false, false),
    }
}

pub fn apply_config(cfg: &Config) {
    if cfg.enabled || cfg.lock_memory || cfg.target_cpu().is_some() {
        warn!("real-time thread configuration is not supported on this platform");
    }
}

pub fn permissions_guidance(_caps: &Capabilities) -> String {
    String::new()
}
