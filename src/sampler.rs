//! The sampling capability the host runtime provides.
//!
//! The probe only ever drives one sampler at a time and treats its output as
//! opaque pprof bytes. Hosts plug in their own implementation; the
//! `pprof-sampler` feature ships a CPU sampler backed by the `pprof` crate.

use anyhow::Result;

/// CPU and heap sampling hooks.
///
/// `start_cpu` must fail when a CPU sampler is already running. The probe
/// resets the profile rate to zero before re-arming it, and skips the re-arm
/// entirely when the requested rate is the runtime default, to avoid
/// spurious rate-change warnings from the runtime.
pub trait Sampler: Send + 'static {
    /// Pre-arm the CPU sample rate. Zero clears a previously armed rate.
    fn set_cpu_profile_rate(&mut self, rate_hz: u32);

    /// Begin CPU sampling at the given rate.
    fn start_cpu(&mut self, rate_hz: u32) -> Result<()>;

    /// Stop CPU sampling and return the raw profile bytes collected.
    fn stop_cpu(&mut self) -> Vec<u8>;

    /// Capture a heap snapshot. Called right after `stop_cpu` within the
    /// same transition.
    fn dump_heap(&mut self) -> Result<Vec<u8>>;
}

/// Sampler that collects nothing. Profiles produced with it are empty and
/// are skipped at emission time.
#[derive(Debug, Default)]
pub struct NullSampler {
    running: bool,
}

impl Sampler for NullSampler {
    fn set_cpu_profile_rate(&mut self, _rate_hz: u32) {}

    fn start_cpu(&mut self, _rate_hz: u32) -> Result<()> {
        if self.running {
            anyhow::bail!("CPU sampler is already running");
        }
        self.running = true;
        Ok(())
    }

    fn stop_cpu(&mut self) -> Vec<u8> {
        self.running = false;
        Vec::new()
    }

    fn dump_heap(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Sampler replaying pre-recorded pprof blobs, one per enable/disable
/// cycle. Useful for tests and for feeding externally captured profiles
/// through the probe pipeline.
#[derive(Debug, Default)]
pub struct StaticSampler {
    cpu_blobs: Vec<Vec<u8>>,
    heap_blobs: Vec<Vec<u8>>,
    running: bool,
}

impl StaticSampler {
    pub fn new(cpu_blobs: Vec<Vec<u8>>, heap_blobs: Vec<Vec<u8>>) -> Self {
        Self {
            cpu_blobs,
            heap_blobs,
            running: false,
        }
    }
}

impl Sampler for StaticSampler {
    fn set_cpu_profile_rate(&mut self, _rate_hz: u32) {}

    fn start_cpu(&mut self, _rate_hz: u32) -> Result<()> {
        if self.running {
            anyhow::bail!("CPU sampler is already running");
        }
        self.running = true;
        Ok(())
    }

    fn stop_cpu(&mut self) -> Vec<u8> {
        self.running = false;
        if self.cpu_blobs.is_empty() {
            Vec::new()
        } else {
            self.cpu_blobs.remove(0)
        }
    }

    fn dump_heap(&mut self) -> Result<Vec<u8>> {
        if self.heap_blobs.is_empty() {
            Ok(Vec::new())
        } else {
            Ok(self.heap_blobs.remove(0))
        }
    }
}

/// CPU sampler backed by the `pprof` crate. Heap dumps are not supported by
/// the backend and come back empty.
#[cfg(feature = "pprof-sampler")]
pub struct PprofSampler {
    guard: Option<pprof::ProfilerGuard<'static>>,
    armed_rate_hz: u32,
}

#[cfg(feature = "pprof-sampler")]
impl Default for PprofSampler {
    fn default() -> Self {
        Self {
            guard: None,
            armed_rate_hz: 0,
        }
    }
}

#[cfg(feature = "pprof-sampler")]
impl Sampler for PprofSampler {
    fn set_cpu_profile_rate(&mut self, rate_hz: u32) {
        self.armed_rate_hz = rate_hz;
    }

    fn start_cpu(&mut self, rate_hz: u32) -> Result<()> {
        if self.guard.is_some() {
            anyhow::bail!("CPU sampler is already running");
        }

        let rate = if self.armed_rate_hz > 0 {
            self.armed_rate_hz
        } else {
            rate_hz
        };
        let frequency = i32::try_from(rate.max(1)).unwrap_or(i32::MAX);

        let guard = pprof::ProfilerGuardBuilder::default()
            .frequency(frequency)
            .build()
            .map_err(|e| anyhow::anyhow!("building profiler guard: {e}"))?;
        self.guard = Some(guard);
        Ok(())
    }

    fn stop_cpu(&mut self) -> Vec<u8> {
        use pprof::protos::Message;

        let Some(guard) = self.guard.take() else {
            return Vec::new();
        };

        let profile = guard
            .report()
            .build()
            .and_then(|report| report.pprof());

        match profile {
            Ok(profile) => {
                let mut buf = Vec::with_capacity(profile.encoded_len());
                if let Err(e) = profile.encode(&mut buf) {
                    tracing::warn!(error = %e, "encoding CPU profile failed");
                    return Vec::new();
                }
                buf
            }
            Err(e) => {
                tracing::warn!(error = %e, "building CPU profile report failed");
                Vec::new()
            }
        }
    }

    fn dump_heap(&mut self) -> Result<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_sampler_rejects_double_start() {
        let mut sampler = NullSampler::default();
        sampler.start_cpu(100).expect("first start");
        assert!(sampler.start_cpu(100).is_err());

        assert!(sampler.stop_cpu().is_empty());
        sampler.start_cpu(100).expect("restart after stop");
    }

    #[test]
    fn test_static_sampler_replays_blobs_in_order() {
        let mut sampler = StaticSampler::new(
            vec![b"cpu-1".to_vec(), b"cpu-2".to_vec()],
            vec![b"heap-1".to_vec()],
        );

        sampler.start_cpu(100).expect("start");
        assert_eq!(sampler.stop_cpu(), b"cpu-1");
        assert_eq!(sampler.dump_heap().expect("heap"), b"heap-1");

        sampler.start_cpu(100).expect("restart");
        assert_eq!(sampler.stop_cpu(), b"cpu-2");
        assert!(sampler.dump_heap().expect("heap").is_empty());
    }
}
