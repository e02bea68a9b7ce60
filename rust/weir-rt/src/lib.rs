// weir-rt: real-time thread policy for acquisition and control loops
//
// Applies priority / deadline scheduling, CPU pinning, and memory locking to
// the calling thread, and probes what the platform actually permits so the
// driver can report actionable guidance instead of failing silently.

use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use weir_core::errors;
use weir_core::telem::{TimeSpan, MICROSECOND, MILLISECOND};

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
use linux as platform;

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "macos")]
use darwin as platform;

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod fallback;
#[cfg(not(any(target_os = "linux", target_os = "macos")))]
use fallback as platform;

/// Default real-time priority (Linux SCHED_FIFO range 1-99).
pub const DEFAULT_PRIORITY: i32 = 47;

/// Sentinel: pin to the last available core.
pub const CPU_AFFINITY_AUTO: i32 = -1;
/// Sentinel: CPU pinning explicitly disabled.
pub const CPU_AFFINITY_NONE: i32 = -2;

/// Default cycle period for deadline scheduling (1 ms).
pub const DEFAULT_PERIOD: TimeSpan = MILLISECOND;
/// Default CPU budget per period (200 us).
pub const DEFAULT_COMPUTATION: TimeSpan = TimeSpan(200 * MICROSECOND.0);
/// Default deadline within the period (500 us).
pub const DEFAULT_DEADLINE: TimeSpan = TimeSpan(500 * MICROSECOND.0);

/// A single RT feature: whether the platform has it at all, and whether this
/// process is currently allowed to use it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capability {
    pub supported: bool,
    pub permitted: bool,
}

impl Capability {
    pub const fn of(supported: bool, permitted: bool) -> Self {
        Self { supported, permitted }
    }

    pub fn ok(&self) -> bool {
        self.supported && self.permitted
    }

    pub fn missing_permissions(&self) -> bool {
        self.supported && !self.permitted
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.supported {
            write!(f, "not supported")
        } else if self.permitted {
            write!(f, "yes")
        } else {
            write!(f, "no (missing permissions)")
        }
    }
}

/// The platform's RT feature matrix, probed non-destructively.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Capabilities {
    /// Priority-based scheduling (Linux SCHED_FIFO, Windows thread priority).
    pub priority_scheduling: Capability,
    /// Deadline-based scheduling (Linux SCHED_DEADLINE).
    pub deadline_scheduling: Capability,
    /// Time-constraint policy (macOS).
    pub time_constraint: Capability,
    /// Multimedia class scheduler (Windows MMCSS).
    pub mmcss: Capability,
    /// Hard CPU pinning.
    pub cpu_affinity: Capability,
    /// Memory page locking (mlockall).
    pub memory_locking: Capability,
}

impl Capabilities {
    /// True when any RT scheduling feature is usable.
    pub fn any(&self) -> bool {
        self.priority_scheduling.ok()
            || self.deadline_scheduling.ok()
            || self.time_constraint.ok()
            || self.mmcss.ok()
    }

    /// True when timing-aware scheduling (deadline / time constraint) is
    /// usable.
    pub fn timing_aware(&self) -> bool {
        self.deadline_scheduling.ok() || self.time_constraint.ok()
    }

    pub fn has_permission_issues(&self) -> bool {
        self.priority_scheduling.missing_permissions()
            || self.deadline_scheduling.missing_permissions()
            || self.memory_locking.missing_permissions()
    }

    /// Platform-specific guidance for enabling features that are supported
    /// but not currently permitted. Empty when nothing is missing.
    pub fn permissions_guidance(&self) -> String {
        platform::permissions_guidance(self)
    }
}

impl fmt::Display for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "real-time capabilities:")?;
        writeln!(f, "  priority scheduling: {}", self.priority_scheduling)?;
        writeln!(f, "  deadline scheduling: {}", self.deadline_scheduling)?;
        writeln!(f, "  time constraint: {}", self.time_constraint)?;
        writeln!(f, "  mmcss: {}", self.mmcss)?;
        writeln!(f, "  cpu affinity: {}", self.cpu_affinity)?;
        write!(f, "  memory locking: {}", self.memory_locking)?;
        let guidance = self.permissions_guidance();
        if !guidance.is_empty() {
            write!(f, "\n{guidance}")?;
        }
        Ok(())
    }
}

/// Queries platform RT capabilities. Probes run once; the result is cached
/// for the life of the process.
pub fn capabilities() -> Capabilities {
    static CAPS: OnceLock<Capabilities> = OnceLock::new();
    *CAPS.get_or_init(platform::probe)
}

/// Per-thread real-time configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Whether to request real-time scheduling at all.
    pub enabled: bool,
    /// Priority for SCHED_FIFO-style scheduling (1-99, higher wins).
    pub priority: i32,
    /// Core to pin to, or `CPU_AFFINITY_AUTO` / `CPU_AFFINITY_NONE`.
    pub cpu_affinity: i32,
    /// Lock current and future pages to prevent faults mid-cycle.
    pub lock_memory: bool,
    /// Cycle period, used for deadline scheduling.
    pub period: TimeSpan,
    /// CPU budget per period.
    pub computation: TimeSpan,
    /// Deadline within the period.
    pub deadline: TimeSpan,
    /// Linux: prefer SCHED_DEADLINE over SCHED_FIFO when timing is set.
    pub prefer_deadline_scheduler: bool,
    /// Windows: enroll in the MMCSS Pro Audio class.
    pub use_mmcss: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: false,
            priority: DEFAULT_PRIORITY,
            cpu_affinity: CPU_AFFINITY_NONE,
            lock_memory: false,
            period: TimeSpan::ZERO,
            computation: TimeSpan::ZERO,
            deadline: TimeSpan::ZERO,
            prefer_deadline_scheduler: false,
            use_mmcss: false,
        }
    }
}

impl Config {
    pub fn has_timing(&self) -> bool {
        self.period > TimeSpan::ZERO
    }

    /// A copy with default timing values filled in when none are specified.
    pub fn with_timing_defaults(&self) -> Self {
        let mut cfg = self.clone();
        if !cfg.has_timing() {
            cfg.period = DEFAULT_PERIOD;
            cfg.computation = DEFAULT_COMPUTATION;
            cfg.deadline = DEFAULT_DEADLINE;
        }
        cfg
    }

    /// Resolves the affinity sentinel into a concrete core, if any.
    pub fn target_cpu(&self) -> Option<usize> {
        match self.cpu_affinity {
            CPU_AFFINITY_NONE => None,
            CPU_AFFINITY_AUTO => {
                let n = num_cpus::get();
                if n > 1 {
                    Some(n - 1)
                } else {
                    None
                }
            }
            core if core >= 0 => Some(core as usize),
            _ => None,
        }
    }
}

/// Applies the configuration to the calling thread. Individual feature
/// failures are logged as warnings rather than aborting the thread; only a
/// malformed configuration is an error.
pub fn apply_config(cfg: &Config) -> errors::Result<()> {
    if cfg.enabled && !(1..=99).contains(&cfg.priority) {
        return Err(errors::Error::new(
            errors::VALIDATION,
            format!("rt priority {} outside 1-99", cfg.priority),
        ));
    }
    platform::apply_config(cfg);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_display() {
        assert_eq!(Capability::of(false, false).to_string(), "not supported");
        assert_eq!(Capability::of(true, true).to_string(), "yes");
        assert_eq!(Capability::of(true, false).to_string(), "no (missing permissions)");
    }

    #[test]
    fn timing_defaults_fill_only_when_missing() {
        let bare = Config { enabled: true, ..Config::default() };
        let filled = bare.with_timing_defaults();
        assert_eq!(filled.period, DEFAULT_PERIOD);
        assert_eq!(filled.computation, DEFAULT_COMPUTATION);
        assert_eq!(filled.deadline, DEFAULT_DEADLINE);

        let custom = Config { period: MILLISECOND * 4, ..Config::default() };
        assert_eq!(custom.with_timing_defaults().period, MILLISECOND * 4);
        assert_eq!(custom.with_timing_defaults().computation, TimeSpan::ZERO);
    }

    #[test]
    fn affinity_sentinels() {
        let none = Config { cpu_affinity: CPU_AFFINITY_NONE, ..Config::default() };
        assert_eq!(none.target_cpu(), None);

        let pinned = Config { cpu_affinity: 0, ..Config::default() };
        assert_eq!(pinned.target_cpu(), Some(0));

        let auto = Config { cpu_affinity: CPU_AFFINITY_AUTO, ..Config::default() };
        if num_cpus::get() > 1 {
            assert_eq!(auto.target_cpu(), Some(num_cpus::get() - 1));
        } else {
            assert_eq!(auto.target_cpu(), None);
        }
    }

    #[test]
    fn invalid_priority_rejected() {
        let cfg = Config { enabled: true, priority: 0, ..Config::default() };
        assert!(apply_config(&cfg).is_err());
        let cfg = Config { enabled: true, priority: 100, ..Config::default() };
        assert!(apply_config(&cfg).is_err());
    }

    #[test]
    fn disabled_config_applies_cleanly() {
        apply_config(&Config::default()).unwrap();
    }

    #[test]
    fn probe_is_cached_and_consistent() {
        let a = capabilities();
        let b = capabilities();
        assert_eq!(a.priority_scheduling, b.priority_scheduling);
        assert_eq!(a.memory_locking, b.memory_locking);
    }

    #[test]
    fn serde_round_trip() {
        let cfg = Config {
            enabled: true,
            priority: 80,
            cpu_affinity: CPU_AFFINITY_AUTO,
            lock_memory: true,
            prefer_deadline_scheduler: true,
            ..Config::default()
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.priority, 80);
        assert!(back.prefer_deadline_scheduler);
    }
}
