//! Unix-signal trigger surface.
//!
//! Each registration spawns a listener task that re-arms across repeated
//! signals and forwards into the probe. Errors from the probe are logged
//! and swallowed so a signal can never take the host down.

use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::ProbeError;
use crate::probe::Probe;

/// Handle for a registered signal trigger. Dropping it does not stop the
/// listener; call [`SignalTrigger::stop`] to deregister.
pub struct SignalTrigger {
    cancel: CancellationToken,
}

impl SignalTrigger {
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Start profiling for `duration` whenever `kind` is received.
pub fn enable_on_signal(
    probe: Probe,
    kind: SignalKind,
    duration: Duration,
) -> Result<SignalTrigger, ProbeError> {
    info!(signal = kind.as_raw_value(), seconds = duration.as_secs_f64(), "signal triggers profiling");
    listen(kind, move || {
        let probe = probe.clone();
        async move {
            info!("signal received, enabling profiling");
            if let Err(e) = probe.enable_now_for(duration).await {
                error!(error = %e, "enable on signal failed");
            }
        }
    })
}

/// Stop profiling (without emitting) whenever `kind` is received.
pub fn disable_on_signal(probe: Probe, kind: SignalKind) -> Result<SignalTrigger, ProbeError> {
    info!(signal = kind.as_raw_value(), "signal stops profiling");
    listen(kind, move || {
        let probe = probe.clone();
        async move {
            info!("signal received, disabling profiling");
            if let Err(e) = probe.disable().await {
                error!(error = %e, "disable on signal failed");
            }
        }
    })
}

/// End the current profile and ship it whenever `kind` is received.
pub fn end_on_signal(probe: Probe, kind: SignalKind) -> Result<SignalTrigger, ProbeError> {
    info!(signal = kind.as_raw_value(), "signal ends the current profile");
    listen(kind, move || {
        let probe = probe.clone();
        async move {
            info!("signal received, ending profile");
            if let Err(e) = probe.end_no_wait().await {
                error!(error = %e, "end on signal failed");
            }
        }
    })
}

fn listen<F, Fut>(kind: SignalKind, action: F) -> Result<SignalTrigger, ProbeError>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send,
{
    let mut stream = signal(kind)?;
    let cancel = CancellationToken::new();
    let child = cancel.clone();

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = child.cancelled() => return,
                received = stream.recv() => {
                    if received.is_none() {
                        return;
                    }
                    action().await;
                }
            }
        }
    });

    Ok(SignalTrigger { cancel })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Configuration;
    use crate::probe::ProbeState;
    use crate::sampler::NullSampler;
    use serial_test::serial;

    fn test_probe() -> Probe {
        let config = Configuration {
            agent_socket: "tcp://127.0.0.1:0".to_string(),
            blackfire_query: Some("expires=9999&signature=sig".to_string()),
            ..Default::default()
        };
        Probe::new(config, Box::new(NullSampler::default())).expect("probe")
    }

    fn raise(signal_name: &str) {
        let status = std::process::Command::new("kill")
            .arg(format!("-{signal_name}"))
            .arg(std::process::id().to_string())
            .status()
            .expect("kill");
        assert!(status.success());
    }

    #[tokio::test]
    #[serial]
    async fn test_signal_enables_and_rearms() {
        let probe = test_probe();
        let trigger =
            enable_on_signal(probe.clone(), SignalKind::user_defined1(), Duration::from_secs(60))
                .expect("register");

        raise("USR1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.current_state(), ProbeState::Enabled);

        // A second signal while enabled is swallowed (wrong state, logged).
        raise("USR1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.current_state(), ProbeState::Enabled);

        trigger.stop();
    }

    #[tokio::test]
    #[serial]
    async fn test_signal_disable_roundtrip() {
        let probe = test_probe();
        let enable =
            enable_on_signal(probe.clone(), SignalKind::user_defined1(), Duration::from_secs(60))
                .expect("register enable");
        let disable =
            disable_on_signal(probe.clone(), SignalKind::user_defined2()).expect("register disable");

        raise("USR1");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.current_state(), ProbeState::Enabled);

        raise("USR2");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.current_state(), ProbeState::Disabled);

        enable.stop();
        disable.stop();
    }
}
