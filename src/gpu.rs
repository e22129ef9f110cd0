//! On-demand GPU capability discovery. This is a heavier, one-shot probe,
//! separate from the periodic pressure loop, and must not be polled at the
//! same cadence. Failures degrade to `available: false` with the error text.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Serialize)]
pub struct GpuCapabilities {
    pub available: bool,
    pub adapter_name: Option<String>,
    pub total_memory_bytes: Option<u64>,
    pub error: Option<String>,
}

impl GpuCapabilities {
    fn unavailable(error: String) -> Self {
        Self {
            available: false,
            adapter_name: None,
            total_memory_bytes: None,
            error: Some(error),
        }
    }
}

/// Query for a usable graphics adapter. Never fails; absence of a GPU or of
/// the query tools reports as unavailable.
pub async fn probe_gpu() -> GpuCapabilities {
    match detect().await {
        Ok(caps) => caps,
        Err(err) => {
            debug!("gpu probe failed: {err:#}");
            GpuCapabilities::unavailable(format!("{err:#}"))
        }
    }
}

async fn detect() -> Result<GpuCapabilities> {
    match std::env::consts::OS {
        "linux" => detect_linux().await,
        "macos" => detect_macos().await,
        other => Err(anyhow!("no gpu probe for platform {other:?}")),
    }
}

async fn detect_linux() -> Result<GpuCapabilities> {
    // Prefer nvidia-smi for a name and memory figure; fall back to the DRM
    // device directory, which proves an adapter exists without sizing it.
    if let Ok(out) = run_tool(
        "nvidia-smi",
        &["--query-gpu=name,memory.total", "--format=csv,noheader,nounits"],
    )
    .await
    {
        let (name, memory_bytes) = parse_nvidia_smi(&out)?;
        return Ok(GpuCapabilities {
            available: true,
            adapter_name: Some(name),
            total_memory_bytes: Some(memory_bytes),
            error: None,
        });
    }

    let mut entries = tokio::fs::read_dir("/sys/class/drm")
        .await
        .context("reading /sys/class/drm")?;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with("card") && !name.contains('-') {
            return Ok(GpuCapabilities {
                available: true,
                adapter_name: Some(name.into_owned()),
                total_memory_bytes: None,
                error: None,
            });
        }
    }
    Err(anyhow!("no drm adapter found"))
}

async fn detect_macos() -> Result<GpuCapabilities> {
    let out = run_tool("system_profiler", &["SPDisplaysDataType"]).await?;
    let name = parse_system_profiler_chipset(&out)
        .ok_or_else(|| anyhow!("system_profiler output missing chipset model"))?;
    Ok(GpuCapabilities {
        available: true,
        adapter_name: Some(name),
        total_memory_bytes: None,
        error: None,
    })
}

async fn run_tool(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("spawning {program}"))?;
    if !output.status.success() {
        return Err(anyhow!("{program} exited with {}", output.status));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Parse one nvidia-smi CSV line, e.g. "NVIDIA A100-SXM4-40GB, 40960".
/// Memory is reported in MiB.
pub fn parse_nvidia_smi(text: &str) -> Result<(String, u64)> {
    let line = text
        .lines()
        .next()
        .ok_or_else(|| anyhow!("empty nvidia-smi output"))?;
    let (name, mem) = line
        .rsplit_once(',')
        .ok_or_else(|| anyhow!("unparseable nvidia-smi line: {line:?}"))?;
    let mib: u64 = mem
        .trim()
        .parse()
        .with_context(|| format!("parsing gpu memory {mem:?}"))?;
    Ok((name.trim().to_string(), mib * 1024 * 1024))
}

/// Extract the chipset model from `system_profiler SPDisplaysDataType`.
pub fn parse_system_profiler_chipset(text: &str) -> Option<String> {
    for line in text.lines() {
        if let Some(rest) = line.trim().strip_prefix("Chipset Model:") {
            return Some(rest.trim().to_string());
        }
    }
    None
}
