//! In-process continuous-profiling probe for the Blackfire platform.
//!
//! The probe samples CPU and heap data from the running host program,
//! folds the samples into a call graph, encodes it in the Blackfire line
//! format, and ships it to the local agent daemon over a stream socket.
//!
//! Most hosts interact through the process-global facade:
//!
//! ```no_run
//! # async fn example() -> Result<(), blackfire_probe::ProbeError> {
//! let ender = blackfire_probe::enable().await?;
//! // ... the code to profile ...
//! ender.end().await?;
//! # Ok(())
//! # }
//! ```
//!
//! The facade requires a tokio runtime: the probe runs its trigger
//! coordination and agent I/O on background tasks.

pub mod agent;
pub mod config;
pub mod error;
pub mod format;
pub mod graph;
pub mod http;
pub mod log;
pub mod options;
pub mod pprof;
pub mod probe;
pub mod sampler;
#[cfg(unix)]
pub mod signal;
pub mod sysinfo;

use std::sync::OnceLock;
use std::time::Duration;

pub use config::Configuration;
pub use error::ProbeError;
pub use options::ProbeOptions;
pub use probe::{Probe, ProbeState};
pub use sampler::{NullSampler, Sampler, StaticSampler};

#[cfg(feature = "pprof-sampler")]
pub use sampler::PprofSampler;

static GLOBAL_PROBE: OnceLock<Probe> = OnceLock::new();

/// Handle returned by the enable facade, supporting the
/// `let ender = enable().await?; ... ender.end().await` idiom.
pub struct Ender {
    probe: Probe,
}

impl Ender {
    /// End the profile and block until the upload finishes.
    pub async fn end(&self) -> Result<(), ProbeError> {
        self.probe.end().await
    }

    /// End the profile without awaiting the upload.
    pub async fn end_no_wait(&self) -> Result<(), ProbeError> {
        self.probe.end_no_wait().await
    }
}

/// Install the process-wide probe with an explicit configuration and
/// sampler. Fails if one is already installed.
pub fn configure(
    config: Configuration,
    sampler: Box<dyn Sampler>,
) -> Result<Probe, ProbeError> {
    let probe = Probe::new(config, sampler)?;
    GLOBAL_PROBE.set(probe.clone()).map_err(|_| {
        ProbeError::ConfigInvalid("the process-wide probe is already configured".to_string())
    })?;
    Ok(probe)
}

/// The process-wide probe, built on first use from the environment and the
/// default sampler.
pub fn global_probe() -> Result<Probe, ProbeError> {
    if let Some(probe) = GLOBAL_PROBE.get() {
        return Ok(probe.clone());
    }
    let config = Configuration::from_environment()?;
    let probe = Probe::new(config, default_sampler())?;
    Ok(GLOBAL_PROBE.get_or_init(|| probe).clone())
}

fn default_sampler() -> Box<dyn Sampler> {
    #[cfg(feature = "pprof-sampler")]
    {
        Box::new(sampler::PprofSampler::default())
    }
    #[cfg(not(feature = "pprof-sampler"))]
    {
        Box::new(NullSampler::default())
    }
}

/// Start profiling in on-demand-only mode: without a query the probe stays
/// a no-op.
pub async fn enable() -> Result<Ender, ProbeError> {
    let probe = global_probe()?;
    probe.enable().await?;
    Ok(Ender { probe })
}

/// Start profiling immediately for the maximum profile duration.
pub async fn enable_now() -> Result<Ender, ProbeError> {
    let probe = global_probe()?;
    probe.enable_now().await?;
    Ok(Ender { probe })
}

/// Start profiling immediately for `duration` (clamped to the maximum).
pub async fn enable_now_for(duration: Duration) -> Result<Ender, ProbeError> {
    let probe = global_probe()?;
    probe.enable_now_for(duration).await?;
    Ok(Ender { probe })
}

/// Stop sampling without emitting a profile.
pub async fn disable() -> Result<(), ProbeError> {
    global_probe()?.disable().await
}

/// End the current profile and block until it is uploaded.
pub async fn end() -> Result<(), ProbeError> {
    global_probe()?.end().await
}

/// End the current profile without awaiting the upload.
pub async fn end_no_wait() -> Result<(), ProbeError> {
    global_probe()?.end_no_wait().await
}

/// True while sampling is live or an upload is in flight.
pub fn is_profiling() -> bool {
    GLOBAL_PROBE.get().map(Probe::is_profiling).unwrap_or(false)
}

/// Title attached to the next emitted profile.
pub fn set_current_title(title: impl Into<String>) -> Result<(), ProbeError> {
    global_probe()?.set_current_title(title);
    Ok(())
}

/// Derive a sub-profile query from the current one.
pub async fn generate_sub_profile_query() -> Result<String, ProbeError> {
    global_probe()?.generate_sub_profile_query().await
}
