//! Linux backend: SCHED_DEADLINE / SCHED_FIFO, sched_setaffinity, mlockall.

use std::mem;

use tracing::{debug, warn};

use crate::{Capabilities, Capability, Config};

const SCHED_DEADLINE: u32 = 6;

/// Matches the kernel's `struct sched_attr` for `sched_setattr(2)`.
#[repr(C)]
#[derive(Default)]
struct SchedAttr {
    size: u32,
    sched_policy: u32,
    sched_flags: u64,
    sched_nice: i32,
    sched_priority: u32,
    sched_runtime: u64,
    sched_deadline: u64,
    sched_period: u64,
}

fn sched_setattr(attr: &SchedAttr) -> i32 {
    unsafe { libc::syscall(libc::SYS_sched_setattr, 0, attr as *const SchedAttr, 0) as i32 }
}

fn errno_message() -> String {
    std::io::Error::last_os_error().to_string()
}

fn test_sched_fifo() -> bool {
    unsafe {
        let orig_policy = libc::sched_getscheduler(0);
        let mut orig_param: libc::sched_param = mem::zeroed();
        libc::sched_getparam(0, &mut orig_param);
        let param = libc::sched_param { sched_priority: 1 };
        if libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) == 0 {
            libc::sched_setscheduler(0, orig_policy, &orig_param);
            return true;
        }
        false
    }
}

fn test_sched_deadline() -> bool {
    let attr = SchedAttr {
        size: mem::size_of::<SchedAttr>() as u32,
        sched_policy: SCHED_DEADLINE,
        sched_runtime: 100_000,
        sched_deadline: 500_000,
        sched_period: 1_000_000,
        ..SchedAttr::default()
    };
    if sched_setattr(&attr) == 0 {
        unsafe {
            let param = libc::sched_param { sched_priority: 0 };
            libc::sched_setscheduler(0, libc::SCHED_OTHER, &param);
        }
        return true;
    }
    false
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
        priority_scheduling: Capability::of(true, test_sched_fifo()),
        deadline_scheduling: Capability::of(true, test_sched_deadline()),
        time_constraint: Capability::of(false, false),
        mmcss: Capability::of(false, false),
        cpu_affinity: Capability::of(true, true),
        memory_locking: Capability::of(true, test_mlockall()),
    }
}

fn apply_deadline_scheduler(cfg: &Config) -> bool {
    let attr = SchedAttr {
        size: mem::size_of::<SchedAttr>() as u32,
        sched_policy: SCHED_DEADLINE,
        sched_runtime: cfg.computation.nanos().max(0) as u64,
        sched_deadline: cfg.deadline.nanos().max(0) as u64,
        sched_period: cfg.period.nanos().max(0) as u64,
        ..SchedAttr::default()
    };
    if sched_setattr(&attr) == 0 {
        debug!(
            period = %cfg.period,
            computation = %cfg.computation,
            deadline = %cfg.deadline,
            "set SCHED_DEADLINE"
        );
        return true;
    }
    warn!(
        error = %errno_message(),
        "failed to set SCHED_DEADLINE, falling back to SCHED_FIFO"
    );
    false
}

fn apply_sched_fifo(priority: i32) {
    let param = libc::sched_param { sched_priority: priority };
    if unsafe { libc::sched_setscheduler(0, libc::SCHED_FIFO, &param) } == -1 {
        warn!(
            priority,
            error = %errno_message(),
            "failed to set SCHED_FIFO (requires CAP_SYS_NICE or root)"
        );
    } else {
        debug!(priority, "set SCHED_FIFO priority");
    }
}

pub fn apply_config(cfg: &Config) {
    if cfg.enabled {
        let mut used_deadline = false;
        if cfg.prefer_deadline_scheduler && cfg.has_timing() {
            used_deadline = apply_deadline_scheduler(cfg);
        }
        if !used_deadline {
            apply_sched_fifo(cfg.priority);
        }
    }

    if let Some(core) = cfg.target_cpu() {
        unsafe {
            let mut set: libc::cpu_set_t = mem::zeroed();
            libc::CPU_ZERO(&mut set);
            libc::CPU_SET(core, &mut set);
            if libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) == -1 {
                warn!(core, error = %errno_message(), "failed to set CPU affinity");
            } else {
                debug!(core, "pinned to CPU");
            }
        }
    }

    if cfg.lock_memory {
        if unsafe { libc::mlockall(libc::MCL_CURRENT | libc::MCL_FUTURE) } == -1 {
            warn!(
                error = %errno_message(),
                "failed to lock memory (requires CAP_IPC_LOCK)"
            );
        } else {
            debug!("locked memory pages");
        }
    }
}

pub fn permissions_guidance(caps: &Capabilities) -> String {
    let mut guidance = String::new();
    if caps.priority_scheduling.missing_permissions() {
        guidance.push_str("  To enable RT scheduling, either:\n");
        guidance.push_str("    - Run as root (not recommended)\n");
        guidance.push_str("    - Grant capability: sudo setcap cap_sys_nice+ep <binary>\n");
        guidance.push_str("    - Add to /etc/security/limits.conf:\n");
        guidance.push_str("        @realtime  -  rtprio  99\n");
    }
    if caps.memory_locking.missing_permissions() {
        guidance.push_str("  To enable memory locking:\n");
        guidance.push_str("    - Grant capability: sudo setcap cap_ipc_lock+ep <binary>\n");
        guidance.push_str("    - Or add to /etc/security/limits.conf:\n");
        guidance.push_str("        @realtime  -  memlock  unlimited\n");
    }
    if !guidance.is_empty() {
        guidance = format!("To enable real-time features:\n{guidance}");
        guidance.push_str("  After editing limits.conf, log out and back in.");
    }
    guidance
}
