use std::path::Path;
use std::sync::{Mutex, OnceLock};

use anyhow::Result;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use serde::{Deserialize, Serialize};
use sysinfo::{Disks, System};

use crate::sync_ext::MutexExt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuUsageSnapshot {
    pub overall: f32,
    pub per_core: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuUsageSnapshot {
    pub available: bool,
    pub gpu_percent: Option<u32>,
    pub memory_percent: Option<u32>,
    pub error: Option<String>,
}

impl GpuUsageSnapshot {
    /// Saturated means the admission scheduler should steer `auto`-device
    /// jobs onto the CPU resource class instead.
    pub fn is_saturated(&self, util_max: f64, mem_max_ratio: f64) -> bool {
        if !self.available {
            return false;
        }
        let util_hot = self
            .gpu_percent
            .map(|p| f64::from(p) / 100.0 >= util_max)
            .unwrap_or(false);
        let mem_hot = self
            .memory_percent
            .map(|p| f64::from(p) / 100.0 >= mem_max_ratio)
            .unwrap_or(false);
        util_hot || mem_hot
    }
}

pub fn sample_cpu_usage() -> CpuUsageSnapshot {
    // One shared System keeps sysinfo's usage baselines warm instead of
    // paying initialization on every sample.
    static SYSTEM: OnceLock<Mutex<System>> = OnceLock::new();

    let mut sys = SYSTEM
        .get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_cpu_usage();
            Mutex::new(sys)
        })
        .lock_unpoisoned();
    sys.refresh_cpu_usage();

    let per_core: Vec<f32> = sys.cpus().iter().map(|c| c.cpu_usage()).collect();
    let overall = if per_core.is_empty() {
        0.0
    } else {
        per_core.iter().copied().sum::<f32>() / per_core.len() as f32
    };

    CpuUsageSnapshot { overall, per_core }
}

fn try_sample_gpu_usage() -> Result<GpuUsageSnapshot, NvmlError> {
    // NVML initialization is expensive and fails permanently on hosts without
    // an NVIDIA driver; initialize once and reuse.
    static NVML_INSTANCE: OnceLock<Mutex<Option<Nvml>>> = OnceLock::new();

    let mutex = NVML_INSTANCE.get_or_init(|| Mutex::new(None));
    let mut guard = mutex.lock_unpoisoned();
    if guard.is_none() {
        *guard = Some(Nvml::init()?);
    }

    let nvml = guard.as_ref().expect("NVML instance initialized above");
    let device_count = nvml.device_count()?;
    if device_count == 0 {
        return Ok(GpuUsageSnapshot {
            available: false,
            gpu_percent: None,
            memory_percent: None,
            error: Some("No NVIDIA GPUs detected".to_string()),
        });
    }

    let device = nvml.device_by_index(0)?;
    let util = device.utilization_rates()?;
    let memory = device.memory_info()?;
    let memory_percent = if memory.total > 0 {
        Some(((memory.used as f64 / memory.total as f64) * 100.0).round() as u32)
    } else {
        None
    };

    Ok(GpuUsageSnapshot {
        available: true,
        gpu_percent: Some(util.gpu),
        memory_percent,
        error: None,
    })
}

pub fn sample_gpu_usage() -> GpuUsageSnapshot {
    match try_sample_gpu_usage() {
        Ok(snapshot) => snapshot,
        Err(e) => GpuUsageSnapshot {
            available: false,
            gpu_percent: None,
            memory_percent: None,
            error: Some(format!("{e}")),
        },
    }
}

/// Free bytes on the filesystem holding `path`, best effort. Picks the
/// longest mount-point prefix so nested mounts resolve correctly.
pub fn free_bytes_for_path(path: &Path) -> Option<u64> {
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cpu_snapshot_has_sane_bounds() {
        let snapshot = sample_cpu_usage();
        assert!(snapshot.overall >= 0.0);
        for core in &snapshot.per_core {
            assert!(*core >= 0.0);
        }
    }

    #[test]
    fn gpu_sampling_never_panics_without_hardware() {
        let snapshot = sample_gpu_usage();
        if !snapshot.available {
            assert!(snapshot.gpu_percent.is_none());
        }
    }

    #[test]
    fn saturation_thresholds_apply_only_when_available() {
        let missing = GpuUsageSnapshot {
            available: false,
            gpu_percent: Some(100),
            memory_percent: Some(100),
            error: None,
        };
        assert!(!missing.is_saturated(0.95, 0.92));

        let hot = GpuUsageSnapshot {
            available: true,
            gpu_percent: Some(99),
            memory_percent: Some(10),
            error: None,
        };
        assert!(hot.is_saturated(0.95, 0.92));
        assert!(!hot.is_saturated(1.0, 0.99999));
    }
}
