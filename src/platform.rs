//! Platform stats providers: raw CPU/memory collection behind a small seam
//! so tests can inject canned samples instead of depending on real OS state.
//!
//! Linux reads the /proc virtual files directly; macOS shells out to
//! `sysctl`, `memory_pressure`, and `vm_stat` with a page-counter fallback
//! when the pressure tool is unavailable.

use std::process::Command;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};

use crate::capacity::RawStats;

/// Source of raw resource samples. Implementations must be cheap enough to
/// call once per cache window; the probe runs them on the blocking pool.
pub trait StatsProvider: Send + Sync {
    fn sample(&self) -> Result<RawStats>;
}

/// Pick the provider for the current OS once at startup. Unrecognized
/// platforms get a provider that always errors, which the probe fail-opens.
pub fn default_provider() -> Box<dyn StatsProvider> {
    match std::env::consts::OS {
        "linux" => Box::new(LinuxStatsProvider),
        "macos" => Box::new(MacStatsProvider::default()),
        other => Box::new(UnsupportedProvider {
            os: other.to_string(),
        }),
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

// ============================================================================
// Linux
// ============================================================================

pub struct LinuxStatsProvider;

impl StatsProvider for LinuxStatsProvider {
    fn sample(&self) -> Result<RawStats> {
        let meminfo = std::fs::read_to_string("/proc/meminfo")
            .context("reading /proc/meminfo")?;
        let loadavg = std::fs::read_to_string("/proc/loadavg")
            .context("reading /proc/loadavg")?;
        let mut stats = parse_meminfo(&meminfo)?;
        stats.load_avg_1m = parse_loadavg(&loadavg)?;
        stats.cpu_count = cpu_count();
        Ok(stats)
    }
}

/// Parse /proc/meminfo. Prefers MemAvailable; very old kernels lack it and
/// fall back to MemFree.
pub fn parse_meminfo(text: &str) -> Result<RawStats> {
    let mut total = None;
    let mut available = None;
    let mut free = None;
    let mut swap_total = None;
    let mut swap_free = None;

    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let kb: u64 = match rest.split_whitespace().next().and_then(|v| v.parse().ok()) {
            Some(v) => v,
            None => continue,
        };
        match key.trim() {
            "MemTotal" => total = Some(kb),
            "MemAvailable" => available = Some(kb),
            "MemFree" => free = Some(kb),
            "SwapTotal" => swap_total = Some(kb),
            "SwapFree" => swap_free = Some(kb),
            _ => {}
        }
    }

    let total = total.ok_or_else(|| anyhow!("meminfo missing MemTotal"))? * 1024;
    let available = available
        .or(free)
        .ok_or_else(|| anyhow!("meminfo missing MemAvailable and MemFree"))?
        * 1024;
    let swap_total = swap_total.unwrap_or(0) * 1024;
    let swap_used = swap_total.saturating_sub(swap_free.unwrap_or(0) * 1024);

    Ok(RawStats {
        total_memory: total,
        available_memory: available,
        swap_used,
        swap_total,
        swap_active: swap_used > 0,
        free_percent: None,
        load_avg_1m: 0.0,
        cpu_count: 0,
    })
}

/// Parse /proc/loadavg ("0.52 0.41 0.30 1/123 4567"), taking the 1-minute
/// figure.
pub fn parse_loadavg(text: &str) -> Result<f64> {
    text.split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("unparseable loadavg: {text:?}"))
}

// ============================================================================
// macOS
// ============================================================================

#[derive(Default)]
pub struct MacStatsProvider {
    swap_counters: Mutex<Option<(u64, u64)>>,
}

impl MacStatsProvider {
    /// Fold a fresh (swapins, swapouts) reading into the baseline and report
    /// whether either counter advanced since the previous sample. The
    /// vm_stat counters are cumulative since boot, so only a delta indicates
    /// recent activity; the first sample has no baseline and reports
    /// inactive.
    pub fn swap_activity(&self, current: (u64, u64)) -> bool {
        let mut last = self.swap_counters.lock().unwrap();
        let active = match *last {
            Some((ins, outs)) => current.0 > ins || current.1 > outs,
            None => false,
        };
        *last = Some(current);
        active
    }
}

impl StatsProvider for MacStatsProvider {
    fn sample(&self) -> Result<RawStats> {
        let total_memory = sysctl_u64("hw.memsize")?;

        // Prefer the live free-percentage from memory_pressure; fall back to
        // summing vm_stat page counters when the tool is unavailable.
        let (available_memory, free_percent) = match memory_pressure_free_percent() {
            Ok(pct) => (((pct / 100.0) * total_memory as f64) as u64, Some(pct)),
            Err(err) => {
                tracing::debug!("memory_pressure unavailable, using vm_stat: {err:#}");
                let vm = run_tool("vm_stat", &[])?;
                (parse_vm_stat_available(&vm)?, None)
            }
        };

        // macOS exposes no simple swap-size figure; report recent swap
        // activity as a binary flag from vm_stat pager counter deltas.
        let swap_active = match run_tool("vm_stat", &[]) {
            Ok(out) => self.swap_activity(parse_vm_stat_swap_counters(&out)),
            Err(_) => false,
        };

        let loadavg = run_tool("sysctl", &["-n", "vm.loadavg"])?;
        let load_avg_1m = parse_sysctl_loadavg(&loadavg)?;

        Ok(RawStats {
            total_memory,
            available_memory,
            swap_used: 0,
            swap_total: 0,
            swap_active,
            free_percent,
            load_avg_1m,
            cpu_count: cpu_count(),
        })
    }
}

fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .with_context(|| format!("spawning {program}"))?;
    if !output.status.success() {
        return Err(anyhow!("{program} exited with {}", output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn sysctl_u64(key: &str) -> Result<u64> {
    let out = run_tool("sysctl", &["-n", key])?;
    out.trim()
        .parse()
        .with_context(|| format!("parsing sysctl {key}: {out:?}"))
}

fn memory_pressure_free_percent() -> Result<f64> {
    let out = run_tool("memory_pressure", &[])?;
    parse_memory_pressure(&out)
}

/// Extract the free percentage from `memory_pressure` output, e.g.
/// "System-wide memory free percentage: 43%".
pub fn parse_memory_pressure(text: &str) -> Result<f64> {
    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("System-wide memory free percentage:") {
            let value = rest.trim().trim_end_matches('%');
            return value
                .parse()
                .with_context(|| format!("parsing free percentage {value:?}"));
        }
    }
    Err(anyhow!("memory_pressure output missing free percentage"))
}

/// Approximate available memory from vm_stat page counters:
/// (free + inactive + purgeable) * page size.
pub fn parse_vm_stat_available(text: &str) -> Result<u64> {
    let page_size = parse_vm_stat_page_size(text)?;
    let free = vm_stat_counter(text, "Pages free");
    let inactive = vm_stat_counter(text, "Pages inactive");
    let purgeable = vm_stat_counter(text, "Pages purgeable");
    Ok((free + inactive + purgeable) * page_size)
}

fn parse_vm_stat_page_size(text: &str) -> Result<u64> {
    // Header: "Mach Virtual Memory Statistics: (page size of 16384 bytes)"
    text.lines()
        .next()
        .and_then(|line| {
            let rest = line.split("page size of").nth(1)?;
            rest.split_whitespace().next()?.parse().ok()
        })
        .ok_or_else(|| anyhow!("vm_stat output missing page size"))
}

fn vm_stat_counter(text: &str, name: &str) -> u64 {
    for line in text.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        if key.trim() == name {
            return rest
                .trim()
                .trim_end_matches('.')
                .parse()
                .unwrap_or(0);
        }
    }
    0
}

/// Cumulative (swapins, swapouts) pager counters from vm_stat output.
pub fn parse_vm_stat_swap_counters(text: &str) -> (u64, u64) {
    (
        vm_stat_counter(text, "Swapins"),
        vm_stat_counter(text, "Swapouts"),
    )
}

/// Parse `sysctl -n vm.loadavg` output: "{ 1.52 1.20 1.00 }".
pub fn parse_sysctl_loadavg(text: &str) -> Result<f64> {
    text.trim()
        .trim_start_matches('{')
        .split_whitespace()
        .next()
        .and_then(|v| v.parse().ok())
        .ok_or_else(|| anyhow!("unparseable vm.loadavg: {text:?}"))
}

// ============================================================================
// Unsupported platforms
// ============================================================================

struct UnsupportedProvider {
    os: String,
}

impl StatsProvider for UnsupportedProvider {
    fn sample(&self) -> Result<RawStats> {
        Err(anyhow!("no stats provider for platform {:?}", self.os))
    }
}

/// Canned provider for deterministic tests.
pub struct FixedStatsProvider {
    pub stats: RawStats,
}

impl StatsProvider for FixedStatsProvider {
    fn sample(&self) -> Result<RawStats> {
        Ok(self.stats.clone())
    }
}

/// Always-failing provider, for exercising the fail-open path.
pub struct FailingStatsProvider;

impl StatsProvider for FailingStatsProvider {
    fn sample(&self) -> Result<RawStats> {
        Err(anyhow!("simulated provider failure"))
    }
}
