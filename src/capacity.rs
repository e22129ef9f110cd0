//! Pressure model: raw resource samples, derived capacity snapshots, and the
//! threshold classification that turns one into the other.

use serde::Serialize;

/// Discrete resource headroom classification.
/// Ordered by severity; transitions are threshold-driven, not order-driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum PressureLevel {
    Nominal,
    Warning,
    Critical,
}

impl PressureLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PressureLevel::Nominal => "nominal",
            PressureLevel::Warning => "warning",
            PressureLevel::Critical => "critical",
        }
    }
}

impl std::fmt::Display for PressureLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One raw measurement pass, as reported by a platform stats provider.
/// All derived fields in `SystemCapacity` come from a single `RawStats`
/// value; nothing is refreshed independently.
#[derive(Debug, Clone, Default)]
pub struct RawStats {
    /// Total physical memory in bytes.
    pub total_memory: u64,
    /// Memory available for new work in bytes.
    pub available_memory: u64,
    /// Swap space in use, bytes (0 where the platform only reports activity).
    pub swap_used: u64,
    /// Total swap space, bytes (0 when none configured).
    pub swap_total: u64,
    /// Swap-in/out activity since the previous sample. macOS reports swap
    /// as this binary signal, derived from pager counter deltas.
    pub swap_active: bool,
    /// Direct "percent of memory still free" figure when the platform
    /// supplies one (macOS memory_pressure). Preferred for classification.
    pub free_percent: Option<f64>,
    /// 1-minute load average.
    pub load_avg_1m: f64,
    /// Logical CPU count (>= 1).
    pub cpu_count: usize,
}

/// Ratio substituted for a bare activity flag: enough to classify warning
/// and veto new workers, without pinning the host at critical.
const SWAP_ACTIVE_RATIO: f64 = 0.6;

impl RawStats {
    pub fn used_memory(&self) -> u64 {
        self.total_memory.saturating_sub(self.available_memory)
    }

    /// used / total, 0 when total is unknown.
    pub fn memory_ratio(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        self.used_memory() as f64 / self.total_memory as f64
    }

    /// available / total, 0 when total is unknown.
    pub fn available_ratio(&self) -> f64 {
        if self.total_memory == 0 {
            return 0.0;
        }
        self.available_memory as f64 / self.total_memory as f64
    }

    /// swap used / swap total; platforms that only report a binary activity
    /// flag map to a warning-grade ratio while active.
    pub fn swap_ratio(&self) -> f64 {
        if self.swap_total > 0 {
            self.swap_used as f64 / self.swap_total as f64
        } else if self.swap_active {
            SWAP_ACTIVE_RATIO
        } else {
            0.0
        }
    }
}

/// Raw inputs kept alongside the derived snapshot for observability.
#[derive(Debug, Clone, Serialize)]
pub struct CapacityDetails {
    pub total_memory: u64,
    pub available_memory: u64,
    pub used_memory: u64,
    pub swap_used: u64,
    pub swap_total: u64,
    pub swap_active: bool,
    pub load_avg_1m: f64,
    pub cpu_count: usize,
}

/// Immutable capacity snapshot. Every field is derived from the same
/// measurement pass; see `SystemCapacity::from_stats`.
#[derive(Debug, Clone, Serialize)]
pub struct SystemCapacity {
    pub can_spawn_worker: bool,
    /// 0..=100.
    pub cpu_utilization: f64,
    /// 0..=100.
    pub memory_utilization: f64,
    pub pressure_level: PressureLevel,
    pub details: CapacityDetails,
}

/// CPU utilization above which new workers are vetoed.
const SPAWN_CPU_LIMIT: f64 = 70.0;
/// Minimum available-memory ratio required to spawn.
const SPAWN_AVAIL_FLOOR: f64 = 0.15;
/// Swap ratio above which new workers are vetoed.
const SPAWN_SWAP_LIMIT: f64 = 0.4;

impl SystemCapacity {
    /// Derive a snapshot from one raw sample.
    pub fn from_stats(stats: &RawStats) -> Self {
        let cpu_utilization = cpu_utilization(stats.load_avg_1m, stats.cpu_count);
        let memory_utilization = (stats.memory_ratio() * 100.0).clamp(0.0, 100.0);
        let pressure_level = classify_pressure(stats);

        // A conjunction: any single red flag vetoes new work.
        let can_spawn_worker = cpu_utilization < SPAWN_CPU_LIMIT
            && stats.available_ratio() > SPAWN_AVAIL_FLOOR
            && stats.swap_ratio() < SPAWN_SWAP_LIMIT
            && pressure_level != PressureLevel::Critical;

        Self {
            can_spawn_worker,
            cpu_utilization,
            memory_utilization,
            pressure_level,
            details: CapacityDetails {
                total_memory: stats.total_memory,
                available_memory: stats.available_memory,
                used_memory: stats.used_memory(),
                swap_used: stats.swap_used,
                swap_total: stats.swap_total,
                swap_active: stats.swap_active,
                load_avg_1m: stats.load_avg_1m,
                cpu_count: stats.cpu_count,
            },
        }
    }

    /// Degraded-monitoring capacity: assume the most permissive safe state
    /// so a broken probe never blocks the host's work.
    pub fn fail_open() -> Self {
        Self {
            can_spawn_worker: true,
            cpu_utilization: 0.0,
            memory_utilization: 0.0,
            pressure_level: PressureLevel::Nominal,
            details: CapacityDetails {
                total_memory: 0,
                available_memory: 0,
                used_memory: 0,
                swap_used: 0,
                swap_total: 0,
                swap_active: false,
                load_avg_1m: 0.0,
                cpu_count: 0,
            },
        }
    }
}

/// min(100, load1 / cpus * 100), never negative, 0 when cpu count is unknown.
pub fn cpu_utilization(load_avg_1m: f64, cpu_count: usize) -> f64 {
    if cpu_count == 0 {
        return 0.0;
    }
    (load_avg_1m / cpu_count as f64 * 100.0).clamp(0.0, 100.0)
}

/// Free-percent thresholds used when the platform reports one directly.
const FREE_PERCENT_WARNING: f64 = 20.0;
const FREE_PERCENT_CRITICAL: f64 = 5.0;

/// Ratio thresholds for platforms without a direct free-percent figure.
const SWAP_WARNING: f64 = 0.5;
const SWAP_CRITICAL: f64 = 0.75;
const MEM_WARNING: f64 = 0.85;
const MEM_CRITICAL: f64 = 0.95;

pub fn classify_pressure(stats: &RawStats) -> PressureLevel {
    if let Some(free) = stats.free_percent {
        if free < FREE_PERCENT_CRITICAL {
            return PressureLevel::Critical;
        }
        if free < FREE_PERCENT_WARNING {
            return PressureLevel::Warning;
        }
        return PressureLevel::Nominal;
    }

    let swap = stats.swap_ratio();
    let mem = stats.memory_ratio();
    if swap > SWAP_CRITICAL || mem > MEM_CRITICAL {
        PressureLevel::Critical
    } else if swap > SWAP_WARNING || mem > MEM_WARNING {
        PressureLevel::Warning
    } else {
        PressureLevel::Nominal
    }
}

/// One-shot concurrency recommendation for call sites that do not run a
/// persistent watchdog.
pub fn recommended_concurrency(
    level: PressureLevel,
    static_limit: usize,
    min: usize,
    max: usize,
) -> usize {
    match level {
        PressureLevel::Critical => min,
        PressureLevel::Warning => ((static_limit / 2).max(min)).min(max),
        PressureLevel::Nominal => static_limit.min(max),
    }
}
