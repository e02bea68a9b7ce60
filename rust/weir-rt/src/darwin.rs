//! macOS backend: QoS class plus pthread priority.
//!
//! The mach time-constraint policy requires the mach thread APIs, which this
//! build does not link; the capability report marks it unsupported and the
//! QoS + priority path below is what acquisition threads get.

use std::mem;

use tracing::{debug, warn};

use crate::{Capabilities, Capability, Config};

fn errno_message() -> String {
    std::io::Error::last_os_error().to_string()
}

fn test_pthread_priority() -> bool {
    unsafe {
        let thread = libc::pthread_self();
        let mut policy: libc::c_int = 0;
        let mut param: libc::sched_param = mem::zeroed();
        if libc::pthread_getschedparam(thread, &mut policy, &mut param) != 0 {
            return false;
        }
        let orig = param.sched_priority;
        param.sched_priority = 1;
        if libc::pthread_setschedparam(thread, libc::SCHED_FIFO, &param) == 0 {
            param.sched_priority = orig;
            libc::pthread_setschedparam(thread, policy, &param);
            return true;
        }
        false
    }
}

fn test_mlockall() -> bool {
    unsafe {
        if libc::mlockall(libc::MCL_CURRENT) == 0 {
            libc::munlockall();
            return true;
        }
        false
    }
}

pub fn probe() -> Capabilities {
    Capabilities {
        priority_scheduling: Capability::of(true, test_pthread_priority()),
        deadline_scheduling: Capability::of(false, false),
        time_constraint: Capability::of(false, false),
        mmcss: Capability::of(false, false),
        // No hard pinning on this platform; affinity is advisory only.
        cpu_affinity: Capability::of(false, false),
        memory_locking: Capability::of(true, test_mlockall()),
    }
}

pub fn apply_config(cfg: &Config) {
    if cfg.enabled {
        unsafe {
            if libc::pthread_set_qos_class_self_np(libc::QOS_CLASS_USER_INTERACTIVE, 0) != 0 {
                warn!(error = %errno_message(), "failed to set QoS class");
            } else {
                debug!("set QoS class to user-interactive");
            }
            let param = libc::sched_param { sched_priority: cfg.priority };
            if libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param) != 0 {
                warn!(
                    priority = cfg.priority,
                    error = %errno_message(),
                    "failed to set pthread priority"
                );
            } else {
                debug!(priority = cfg.priority, "set pthread priority");
            }
        }
    }

    if cfg.target_cpu().is_some() {
        warn!("hard CPU affinity is not supported on this platform");
    }

    if cfg.lock_memory {
        if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } == -1 {
            warn!(error = %errno_message(), "failed to lock memory");
        } else {
            debug!("locked memory pages");
        }
    }
}

pub fn permissions_guidance(caps: &Capabilities) -> String {
    if caps.priority_scheduling.missing_permissions() {
        return "To enable real-time features:\n  Run the driver from an account allowed \
                to raise thread scheduling priority."
            .to_string();
    }
    String::new()
}
