//! Memory monitor (C3): samples process RSS via `getrusage` and publishes
//! a lock-free snapshot background tasks and the admission controller read
//! without ever blocking on the sampler.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::types::PressureLevel;

#[derive(Debug, Clone, Copy)]
pub struct MemorySample {
    pub timestamp: DateTime<Utc>,
    pub peak_rss_bytes: u64,
    pub pressure: PressureLevel,
}

/// Read `ru_maxrss` via `getrusage(RUSAGE_SELF)`. Linux reports kilobytes;
/// macOS reports bytes directly — the conversion below accounts for both.
pub fn get_peak_rss_bytes() -> u64 {
    // Safety: `rusage` is a plain-old-data struct; `getrusage` only writes
    // through the pointer we give it.
    unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return 0;
        }
        let raw = usage.ru_maxrss as u64;
        if cfg!(target_os = "macos") {
            raw
        } else {
            raw * 1024
        }
    }
}

pub struct MemoryMonitorConfig {
    pub max_memory_bytes: u64,
    pub warning_ratio: f64,
    pub critical_ratio: f64,
    pub sample_interval: Duration,
}

pub struct MemoryMonitor {
    config: MemoryMonitorConfig,
    snapshot: ArcSwap<MemorySample>,
}

impl MemoryMonitor {
    pub fn new(config: MemoryMonitorConfig) -> Arc<Self> {
        let initial = MemorySample {
            timestamp: Utc::now(),
            peak_rss_bytes: get_peak_rss_bytes(),
            pressure: PressureLevel::Normal,
        };
        Arc::new(Self {
            config,
            snapshot: ArcSwap::from_pointee(initial),
        })
    }

    fn classify(&self, rss: u64) -> PressureLevel {
        let ratio = rss as f64 / self.config.max_memory_bytes as f64;
        if ratio >= self.config.critical_ratio {
            PressureLevel::Critical
        } else if ratio >= self.config.warning_ratio {
            PressureLevel::Warning
        } else {
            PressureLevel::Normal
        }
    }

    pub fn current(&self) -> MemorySample {
        **self.snapshot.load()
    }

    /// Whether admitting a request that will need `bytes_required` more
    /// resident memory is safe given the most recent sample.
    pub fn can_admit(&self, bytes_required: u64) -> bool {
        let sample = self.current();
        let projected = sample.peak_rss_bytes.saturating_add(bytes_required);
        self.classify(projected) != PressureLevel::Critical
    }

    fn sample_once(&self) -> MemorySample {
        let rss = get_peak_rss_bytes();
        let pressure = self.classify(rss);
        let sample = MemorySample {
            timestamp: Utc::now(),
            peak_rss_bytes: rss,
            pressure,
        };
        self.snapshot.store(Arc::new(sample));
        sample
    }

    /// Background sampling loop, spawned once at boot: a fixed-interval
    /// tick with no drift accumulation, running for the lifetime of the
    /// process.
    pub async fn run(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.config.sample_interval);
        let mut last_pressure = PressureLevel::Normal;
        loop {
            interval.tick().await;
            let sample = self.sample_once();
            debug!(rss = sample.peak_rss_bytes, pressure = %sample.pressure, "memory sample");

            if sample.pressure != last_pressure {
                match sample.pressure {
                    PressureLevel::Warning => warn!(rss = sample.peak_rss_bytes, "memory pressure: warning"),
                    PressureLevel::Critical => warn!(rss = sample.peak_rss_bytes, "memory pressure: critical"),
                    PressureLevel::Normal => info!(rss = sample.peak_rss_bytes, "memory pressure back to normal"),
                }
                last_pressure = sample.pressure;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(max_memory_bytes: u64) -> Arc<MemoryMonitor> {
        MemoryMonitor::new(MemoryMonitorConfig {
            max_memory_bytes,
            warning_ratio: 0.7,
            critical_ratio: 0.9,
            sample_interval: Duration::from_secs(3600),
        })
    }

    #[test]
    fn classify_normal_below_warning_ratio() {
        let m = monitor(1_000_000_000);
        assert_eq!(m.classify(100_000_000), PressureLevel::Normal);
    }

    #[test]
    fn classify_warning_between_ratios() {
        let m = monitor(1_000_000_000);
        assert_eq!(m.classify(750_000_000), PressureLevel::Warning);
    }

    #[test]
    fn classify_critical_above_critical_ratio() {
        let m = monitor(1_000_000_000);
        assert_eq!(m.classify(950_000_000), PressureLevel::Critical);
    }

    #[test]
    fn can_admit_rejects_when_projection_is_critical() {
        let m = monitor(1_000_000_000);
        m.snapshot.store(Arc::new(MemorySample {
            timestamp: Utc::now(),
            peak_rss_bytes: 800_000_000,
            pressure: PressureLevel::Warning,
        }));
        assert!(!m.can_admit(200_000_000));
        assert!(m.can_admit(10_000_000));
    }

    #[test]
    fn peak_rss_is_nonzero_on_a_running_process() {
        assert!(get_peak_rss_bytes() > 0);
    }
}
