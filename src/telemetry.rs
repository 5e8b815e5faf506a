//! Samples RAM, VRAM, CPU, and GPU temperature for the host this agent runs
//! on. Never blocks indefinitely and never propagates an error: any failure
//! in the underlying OS/GPU interface degrades to conservative defaults.

use std::sync::Mutex;

use sysinfo::{CpuRefreshKind, MemoryRefreshKind, RefreshKind, System};

#[derive(Debug, Clone, Copy)]
pub struct TelemetrySample {
    pub total_ram_mb: u64,
    pub free_ram_mb: u64,
    pub total_vram_mb: u64,
    pub free_vram_mb: u64,
    pub cpu_percent: f32,
    pub gpu_temperature: Option<i32>,
    pub sample_timestamp: i64,
}

const CONSERVATIVE_TOTAL_RAM_MB: u64 = 4096;
const CONSERVATIVE_FREE_RAM_MB: u64 = 2048;

/// Holds the process-wide resource handles (the `sysinfo::System` and, with
/// the `gpu` feature, the NVML handle). Both are expensive to (re)initialize
/// and meant to be constructed once and shared via `Arc` for the process
/// lifetime, not recreated per sample.
pub struct TelemetryProbe {
    sys: Mutex<System>,
    #[cfg(feature = "gpu")]
    nvml: Option<nvml_wrapper::Nvml>,
}

impl TelemetryProbe {
    pub fn new() -> Self {
        let refresh = RefreshKind::new()
            .with_memory(MemoryRefreshKind::everything())
            .with_cpu(CpuRefreshKind::everything());
        let sys = Mutex::new(System::new_with_specifics(refresh));

        #[cfg(feature = "gpu")]
        {
            let nvml = nvml_wrapper::Nvml::init()
                .map_err(|e| {
                    tracing::warn!(error = %e, "NVIDIA GPU monitoring not available");
                })
                .ok();
            Self { sys, nvml }
        }
        #[cfg(not(feature = "gpu"))]
        {
            Self { sys }
        }
    }

    /// Samples current system resources by refreshing the persistent
    /// `System` in place. CPU usage is computed by sysinfo across successive
    /// refreshes, so this never sleeps or blocks the caller — the first
    /// sample after start-up may read 0% CPU until a second refresh lands.
    pub fn sample(&self) -> TelemetrySample {
        let mut sys = self.sys.lock().expect("telemetry mutex poisoned");
        sys.refresh_memory();
        sys.refresh_cpu_specifics(CpuRefreshKind::everything());

        let total_ram_mb = sys.total_memory() / (1024 * 1024);
        let free_ram_mb = sys.available_memory() / (1024 * 1024);

        let (total_ram_mb, free_ram_mb) = if total_ram_mb == 0 {
            tracing::warn!("sysinfo reported zero total memory, using conservative defaults");
            (CONSERVATIVE_TOTAL_RAM_MB, CONSERVATIVE_FREE_RAM_MB)
        } else {
            (total_ram_mb, free_ram_mb.min(total_ram_mb))
        };

        let cpu_percent = if sys.cpus().is_empty() {
            0.0
        } else {
            sys.cpus().iter().map(|c| c.cpu_usage()).sum::<f32>() / sys.cpus().len() as f32
        };
        drop(sys);

        let (total_vram_mb, free_vram_mb, gpu_temperature) = self.sample_gpu();

        TelemetrySample {
            total_ram_mb,
            free_ram_mb,
            total_vram_mb,
            free_vram_mb,
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            gpu_temperature,
            sample_timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    #[cfg(feature = "gpu")]
    fn sample_gpu(&self) -> (u64, u64, Option<i32>) {
        let Some(nvml) = &self.nvml else {
            return (0, 0, None);
        };
        let Ok(device) = nvml.device_by_index(0) else {
            return (0, 0, None);
        };
        let mem = device.memory_info().ok();
        let temp = device
            .temperature(nvml_wrapper::enum_wrappers::device::TemperatureSensor::Gpu)
            .ok()
            .map(|t| t as i32);
        match mem {
            Some(mem) => (
                mem.total / (1024 * 1024),
                mem.free / (1024 * 1024),
                temp,
            ),
            None => (0, 0, temp),
        }
    }

    #[cfg(not(feature = "gpu"))]
    fn sample_gpu(&self) -> (u64, u64, Option<i32>) {
        (0, 0, None)
    }

    /// True when the NVML handle initialized successfully at start-up.
    #[cfg(feature = "gpu")]
    pub fn has_gpu(&self) -> bool {
        self.nvml.is_some()
    }

    #[cfg(not(feature = "gpu"))]
    pub fn has_gpu(&self) -> bool {
        false
    }
}

impl Default for TelemetryProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_never_violates_invariants() {
        let probe = TelemetryProbe::new();
        let sample = probe.sample();
        assert!(sample.free_ram_mb <= sample.total_ram_mb);
        assert!(sample.free_vram_mb <= sample.total_vram_mb);
        assert!(sample.cpu_percent >= 0.0 && sample.cpu_percent <= 100.0);
    }

    #[test]
    fn sample_reports_zero_vram_without_gpu_feature() {
        let probe = TelemetryProbe::new();
        let sample = probe.sample();
        #[cfg(not(feature = "gpu"))]
        {
            assert_eq!(sample.total_vram_mb, 0);
            assert_eq!(sample.free_vram_mb, 0);
            assert!(sample.gpu_temperature.is_none());
            assert!(!probe.has_gpu());
        }
        let _ = sample;
    }

    #[test]
    fn repeated_samples_reuse_the_same_system_handle() {
        let probe = TelemetryProbe::new();
        let first = probe.sample();
        let second = probe.sample();
        assert!(second.total_ram_mb == first.total_ram_mb || second.total_ram_mb > 0);
    }
}
