//! Resource probing: decide per dispatch whether the accelerated tier is usable.
//!
//! The probe is an explicit value handed to the invoker instead of a global
//! check, so tests substitute a [`StaticProbe`] and production uses
//! [`CachedProbe`] over [`NvidiaSmiProbe`].
//!
//! A stale snapshot only costs performance: the tier changes how fast the
//! engine runs, never what it produces.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::process::Command;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

/// Execution mode for the extraction engine.
///
/// Ordered so that `Fallback < Accelerated`; retries only ever move down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    /// General-purpose CPU execution.
    Fallback,
    /// Hardware-assisted (GPU) execution.
    Accelerated,
}

impl fmt::Display for ExecutionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fallback => write!(f, "fallback"),
            Self::Accelerated => write!(f, "accelerated"),
        }
    }
}

/// Per-device reading from the backing signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceReading {
    pub index: u32,
    pub temperature_c: u32,
    pub memory_total_mb: u64,
    pub memory_used_mb: u64,
}

impl DeviceReading {
    pub fn memory_free_mb(&self) -> u64 {
        self.memory_total_mb.saturating_sub(self.memory_used_mb)
    }
}

/// A point-in-time view of accelerator availability.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub devices: Vec<DeviceReading>,
}

/// Thresholds a snapshot must meet for the accelerated tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierThresholds {
    pub min_free_mb: u64,
    pub max_temp_c: u32,
}

impl ResourceSnapshot {
    /// No accelerator present.
    pub fn unavailable() -> Self {
        Self::default()
    }

    pub fn accelerated_available(&self) -> bool {
        !self.devices.is_empty()
    }

    /// Free memory on the tightest device, the capacity estimate.
    pub fn free_capacity_mb(&self) -> u64 {
        self.devices
            .iter()
            .map(DeviceReading::memory_free_mb)
            .min()
            .unwrap_or(0)
    }

    /// Accelerated only when every device is cool enough and has room.
    pub fn select_tier(&self, thresholds: TierThresholds) -> ExecutionTier {
        if !self.accelerated_available() {
            return ExecutionTier::Fallback;
        }
        for d in &self.devices {
            if d.temperature_c >= thresholds.max_temp_c {
                debug!(
                    device = d.index,
                    temp_c = d.temperature_c,
                    "device above temperature threshold"
                );
                return ExecutionTier::Fallback;
            }
            if d.memory_free_mb() < thresholds.min_free_mb {
                debug!(
                    device = d.index,
                    free_mb = d.memory_free_mb(),
                    "device below free-memory threshold"
                );
                return ExecutionTier::Fallback;
            }
        }
        ExecutionTier::Accelerated
    }

    /// Worker-pool size for a tier: accelerated work serialises per device,
    /// fallback work spreads over the available cores.
    pub fn worker_capacity(&self, tier: ExecutionTier) -> usize {
        match tier {
            ExecutionTier::Accelerated => self.devices.len().max(1),
            ExecutionTier::Fallback => std::thread::available_parallelism()
                .map(|n| (n.get() / 4).max(1))
                .unwrap_or(1),
        }
    }
}

/// Source of the capacity signal. Called from a blocking context.
pub trait ResourceProbe: Send + Sync {
    fn snapshot(&self) -> ResourceSnapshot;
}

/// Reads GPU state from `nvidia-smi`.
///
/// Missing binary or a non-zero exit both mean "no accelerator".
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    program: String,
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self {
            program: "nvidia-smi".to_string(),
        }
    }
}

impl NvidiaSmiProbe {
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl ResourceProbe for NvidiaSmiProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        let output = Command::new(&self.program)
            .args([
                "--query-gpu=index,temperature.gpu,memory.total,memory.used",
                "--format=csv,noheader,nounits",
            ])
            .output();

        match output {
            Ok(out) if out.status.success() => ResourceSnapshot {
                devices: parse_nvidia_smi(&String::from_utf8_lossy(&out.stdout)),
            },
            Ok(out) => {
                debug!(
                    "{} exited with {}: {}",
                    self.program,
                    out.status,
                    String::from_utf8_lossy(&out.stderr).trim()
                );
                ResourceSnapshot::unavailable()
            }
            Err(e) => {
                debug!("{} unavailable: {}", self.program, e);
                ResourceSnapshot::unavailable()
            }
        }
    }
}

/// Parse `index, temp, total, used` CSV lines; malformed lines are skipped.
pub fn parse_nvidia_smi(stdout: &str) -> Vec<DeviceReading> {
    stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 4 {
                return None;
            }
            Some(DeviceReading {
                index: parts[0].parse().ok()?,
                temperature_c: parts[1].parse().ok()?,
                memory_total_mb: parts[2].parse().ok()?,
                memory_used_mb: parts[3].parse().ok()?,
            })
        })
        .collect()
}

/// Wraps a probe and re-reads it at most once per `refresh`.
///
/// Shared read-only by all concurrent dispatches.
pub struct CachedProbe<P> {
    inner: P,
    refresh: Duration,
    cached: Mutex<Option<(Instant, ResourceSnapshot)>>,
}

impl<P: ResourceProbe> CachedProbe<P> {
    pub fn new(inner: P, refresh: Duration) -> Self {
        Self {
            inner,
            refresh,
            cached: Mutex::new(None),
        }
    }
}

impl<P: ResourceProbe> ResourceProbe for CachedProbe<P> {
    fn snapshot(&self) -> ResourceSnapshot {
        if let Ok(guard) = self.cached.lock() {
            if let Some((at, snap)) = guard.as_ref() {
                if at.elapsed() < self.refresh {
                    return snap.clone();
                }
            }
        }
        let fresh = self.inner.snapshot();
        if let Ok(mut guard) = self.cached.lock() {
            *guard = Some((Instant::now(), fresh.clone()));
        }
        fresh
    }
}

/// A probe that always reports the same snapshot.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe(pub ResourceSnapshot);

impl StaticProbe {
    /// One idle device with plenty of memory.
    pub fn accelerated() -> Self {
        Self(ResourceSnapshot {
            devices: vec![DeviceReading {
                index: 0,
                temperature_c: 40,
                memory_total_mb: 24_000,
                memory_used_mb: 1_000,
            }],
        })
    }

    pub fn fallback() -> Self {
        Self(ResourceSnapshot::unavailable())
    }
}

impl ResourceProbe for StaticProbe {
    fn snapshot(&self) -> ResourceSnapshot {
        self.0.clone()
    }
}
