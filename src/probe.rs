//! The probe state machine and its trigger coordination.
//!
//! One coarse lock serializes every transition; sampler start/stop and agent
//! I/O happen while holding it, so state is never observed mid-transition.
//! Timers and external triggers funnel through a single rearm-loop task that
//! swaps the trigger channel after each handled signal, orphaning stale
//! duration timers.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

use crate::agent::{AgentClient, ProfileHandle};
use crate::config::{Configuration, RUNTIME_DEFAULT_CPU_SAMPLE_RATE_HZ};
use crate::error::ProbeError;
use crate::graph::ProfileBuilder;
use crate::sampler::Sampler;
use crate::sysinfo;

/// Capacity of the auto-disable trigger channel. Large enough that the rare
/// burst of triggers racing a channel swap never blocks a sender.
const TRIGGER_CAPACITY: usize = 100;

/// Externally observable probe lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProbeState {
    Off = 0,
    Enabled = 1,
    Disabled = 2,
    Sending = 3,
}

impl ProbeState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ProbeState::Enabled,
            2 => ProbeState::Disabled,
            3 => ProbeState::Sending,
            _ => ProbeState::Off,
        }
    }
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProbeState::Off => "off",
            ProbeState::Enabled => "enabled",
            ProbeState::Disabled => "disabled",
            ProbeState::Sending => "sending",
        };
        f.write_str(name)
    }
}

/// The in-process profiler. Cheap to clone; all clones share one state
/// machine.
#[derive(Clone)]
pub struct Probe {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Probe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Probe").finish_non_exhaustive()
    }
}

struct Inner {
    config: Configuration,
    core: Mutex<Core>,
    /// Lock-free mirror of `Core::state` for pre-lock guard checks.
    state_hint: AtomicU8,
    poisoned: AtomicBool,
    on_demand_only: AtomicBool,
    trigger: parking_lot::Mutex<mpsc::Sender<bool>>,
    title: parking_lot::Mutex<String>,
}

/// State mutated only under the transition lock.
struct Core {
    state: ProbeState,
    sampler: Box<dyn Sampler>,
    buffers: SampleBufferSet,
    agent: Option<AgentClient>,
    cpu_sample_rate_hz: u32,
}

/// Raw CPU and heap buffers accumulated across the enable/disable cycles of
/// one profile round.
#[derive(Default)]
struct SampleBufferSet {
    cpu: Vec<Vec<u8>>,
    mem: Vec<Vec<u8>>,
}

impl SampleBufferSet {
    fn reset(&mut self) {
        self.cpu.clear();
        self.mem.clear();
    }
}

impl Probe {
    /// Build a probe from a validated configuration and the host's sampler.
    pub fn new(config: Configuration, sampler: Box<dyn Sampler>) -> Result<Self, ProbeError> {
        config.validate()?;

        let (tx, rx) = mpsc::channel(TRIGGER_CAPACITY);
        let inner = Arc::new(Inner {
            config,
            core: Mutex::new(Core {
                state: ProbeState::Off,
                sampler,
                buffers: SampleBufferSet::default(),
                agent: None,
                cpu_sample_rate_hz: 0,
            }),
            state_hint: AtomicU8::new(ProbeState::Off as u8),
            poisoned: AtomicBool::new(false),
            on_demand_only: AtomicBool::new(false),
            trigger: parking_lot::Mutex::new(tx),
            title: parking_lot::Mutex::new(String::new()),
        });

        Inner::spawn_rearm_loop(Arc::downgrade(&inner), rx);

        Ok(Self { inner })
    }

    /// Start sampling immediately for `duration`. Zero or anything above
    /// the configured maximum clamps to the maximum.
    pub async fn enable_now_for(&self, duration: Duration) -> Result<(), ProbeError> {
        self.shielded("enable profiling", move |inner| async move {
            inner.enable_for(duration).await
        })
        .await
    }

    /// Start sampling immediately for the maximum profile duration.
    pub async fn enable_now(&self) -> Result<(), ProbeError> {
        self.enable_now_for(self.inner.config.max_profile_duration)
            .await
    }

    /// Like [`Probe::enable_now`], but puts the probe in on-demand-only
    /// mode: without a query every operation is a silent no-op.
    pub async fn enable(&self) -> Result<(), ProbeError> {
        self.inner.on_demand_only.store(true, Ordering::Relaxed);
        self.enable_now().await
    }

    /// Stop sampling without emitting. Buffers are kept so the profile can
    /// still be ended later.
    pub async fn disable(&self) -> Result<(), ProbeError> {
        self.shielded("disable profiling", |inner| async move {
            inner.disable_via_trigger().await
        })
        .await
    }

    /// End the current profile and ship it without awaiting the upload.
    pub async fn end_no_wait(&self) -> Result<(), ProbeError> {
        self.shielded("end profiling", |inner| async move {
            inner.end_via_trigger().await
        })
        .await
    }

    /// End the current profile and block until the upload finishes or fails.
    pub async fn end(&self) -> Result<(), ProbeError> {
        self.shielded("end profiling", |inner| async move {
            inner.end_and_wait().await
        })
        .await
    }

    /// True while sampling is live or an upload is in flight.
    pub fn is_profiling(&self) -> bool {
        if self.inner.poisoned.load(Ordering::Acquire) || !self.inner.can_profile() {
            return false;
        }
        matches!(
            self.inner.state(),
            ProbeState::Enabled | ProbeState::Sending
        )
    }

    /// The current lifecycle state.
    pub fn current_state(&self) -> ProbeState {
        self.inner.state()
    }

    /// Title attached to the next emitted profile.
    pub fn set_current_title(&self, title: impl Into<String>) {
        *self.inner.title.lock() = title.into();
    }

    /// Derive a child query from the current one (see the agent module).
    pub async fn generate_sub_profile_query(&self) -> Result<String, ProbeError> {
        self.shielded("generate sub-profile query", |inner| async move {
            let mut core = inner.core.lock().await;
            inner.prepare_agent(&mut core)?;
            let Some(agent) = core.agent.as_mut() else {
                return Err(ProbeError::ConfigInvalid(
                    "agent client unavailable".to_string(),
                ));
            };
            let query = agent.current_blackfire_query().await?;
            crate::agent::derive_sub_profile_query(&query)
        })
        .await
    }

    /// The ring of recently signed profiles, refreshed lazily.
    pub async fn last_profiles(&self) -> Vec<ProfileHandle> {
        let mut core = self.inner.core.lock().await;
        match core.agent.as_mut() {
            Some(agent) => agent.last_profiles().await,
            None => Vec::new(),
        }
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    /// Run a probe operation inside the panic shield. A panic anywhere in
    /// the operation poisons the probe permanently.
    async fn shielded<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T, ProbeError>
    where
        F: FnOnce(Arc<Inner>) -> Fut,
        Fut: std::future::Future<Output = Result<T, ProbeError>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.poisoned.load(Ordering::Acquire) {
            return Err(ProbeError::DisabledFromPanic);
        }

        match tokio::spawn(f(Arc::clone(&self.inner))).await {
            Ok(result) => result,
            Err(join_error) => {
                if join_error.is_panic() {
                    let message = panic_message(join_error.into_panic());
                    self.inner.poisoned.store(true, Ordering::Release);
                    error!(
                        operation,
                        panic = message.as_str(),
                        "unexpected panic, probe is now permanently disabled",
                    );
                }
                Err(ProbeError::DisabledFromPanic)
            }
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

impl Inner {
    fn state(&self) -> ProbeState {
        ProbeState::from_u8(self.state_hint.load(Ordering::Acquire))
    }

    fn set_state(&self, core: &mut Core, state: ProbeState) {
        core.state = state;
        self.state_hint.store(state as u8, Ordering::Release);
    }

    fn can_profile(&self) -> bool {
        if self.inner_on_demand() {
            self.config.blackfire_query.is_some()
        } else {
            true
        }
    }

    fn inner_on_demand(&self) -> bool {
        self.config.on_demand_only || self.on_demand_only.load(Ordering::Relaxed)
    }

    // --- Guards ---
    //
    // Every public transition checks its guard twice: once against the
    // lock-free state mirror to skip needless contention, and again under
    // the lock to close the race. Both checks reject the same states.

    fn guard_enable(&self, state: ProbeState) -> Result<(), ProbeError> {
        match state {
            ProbeState::Off | ProbeState::Disabled => Ok(()),
            ProbeState::Enabled | ProbeState::Sending => {
                debug!(%state, "wrong profiler state for enable");
                Err(ProbeError::AlreadyProfiling)
            }
        }
    }

    fn guard_disable(&self, state: ProbeState) -> Result<(), ProbeError> {
        match state {
            ProbeState::Enabled => Ok(()),
            _ => {
                debug!(%state, "wrong profiler state for disable");
                Err(ProbeError::WrongState {
                    operation: "disable profiling",
                    state,
                })
            }
        }
    }

    fn guard_end(&self, state: ProbeState) -> Result<(), ProbeError> {
        match state {
            ProbeState::Enabled | ProbeState::Disabled => Ok(()),
            _ => {
                debug!(%state, "wrong profiler state for end");
                Err(ProbeError::WrongState {
                    operation: "end profiling",
                    state,
                })
            }
        }
    }

    // --- Public transition bodies ---

    async fn enable_for(self: Arc<Self>, mut duration: Duration) -> Result<(), ProbeError> {
        if !self.can_profile() {
            return Ok(());
        }

        self.guard_enable(self.state())?;
        let mut core = self.core.lock().await;
        self.guard_enable(core.state)?;

        if duration.is_zero() || duration > self.config.max_profile_duration {
            duration = self.config.max_profile_duration;
        }

        self.start_sampling(&mut core)?;
        self.set_state(&mut core, ProbeState::Enabled);

        // The auto-stop timer is bound to the trigger channel that is
        // current right now; a later channel swap cancels it.
        let trigger = self.trigger.lock().clone();
        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = trigger.try_send(false);
        });

        Ok(())
    }

    async fn disable_via_trigger(self: Arc<Self>) -> Result<(), ProbeError> {
        if !self.can_profile() {
            return Ok(());
        }
        self.guard_disable(self.state())?;
        let core = self.core.lock().await;
        self.guard_disable(core.state)?;
        self.send_trigger(false);
        Ok(())
    }

    async fn end_via_trigger(self: Arc<Self>) -> Result<(), ProbeError> {
        if !self.can_profile() {
            return Ok(());
        }
        self.guard_end(self.state())?;
        let core = self.core.lock().await;
        self.guard_end(core.state)?;
        self.send_trigger(true);
        Ok(())
    }

    async fn end_and_wait(self: Arc<Self>) -> Result<(), ProbeError> {
        if !self.can_profile() {
            return Ok(());
        }

        self.guard_end(self.state())?;
        let mut core = self.core.lock().await;
        self.guard_end(core.state)?;

        debug!("ending the current profile and blocking until it is uploaded");
        let result = self.end_profile(&mut core).await;
        if let Err(e) = &result {
            error!(error = %e, "end profile failed");
        } else {
            debug!("profile uploaded");
        }
        result
    }

    fn send_trigger(&self, should_end: bool) {
        let trigger = self.trigger.lock().clone();
        if let Err(e) = trigger.try_send(should_end) {
            debug!(error = %e, "trigger signal dropped");
        }
    }

    // --- Trigger rearm loop ---

    fn spawn_rearm_loop(weak: Weak<Inner>, mut rx: mpsc::Receiver<bool>) {
        tokio::spawn(async move {
            loop {
                let Some(should_end) = rx.recv().await else {
                    return;
                };
                let Some(inner) = weak.upgrade() else {
                    return;
                };

                inner.on_disable_triggered(should_end).await;

                // Reinstall a fresh channel; timers still holding the old
                // sender are thereby cancelled.
                let (tx, new_rx) = mpsc::channel(TRIGGER_CAPACITY);
                *inner.trigger.lock() = tx;
                rx = new_rx;
            }
        });
    }

    async fn on_disable_triggered(&self, should_end: bool) {
        debug!(should_end, "received profile disable trigger");
        let mut core = self.core.lock().await;

        if should_end {
            if let Err(e) = self.end_profile(&mut core).await {
                error!(error = %e, "end profile failed");
            }
        } else if let Err(e) = self.stop_sampling(&mut core) {
            error!(error = %e, "stop profiling failed");
        }
    }

    // --- Internal transitions (idempotent, called under the lock) ---

    fn start_sampling(&self, core: &mut Core) -> Result<(), ProbeError> {
        debug!("start profiling");

        if core.cpu_sample_rate_hz == 0 {
            core.cpu_sample_rate_hz = self.config.cpu_sample_rate_hz;
        }

        // Arm the sample rate before starting. A stale armed rate must be
        // cleared first; re-arming is skipped at the runtime default so the
        // runtime does not warn about a redundant change.
        core.sampler.set_cpu_profile_rate(0);
        if core.cpu_sample_rate_hz != RUNTIME_DEFAULT_CPU_SAMPLE_RATE_HZ {
            core.sampler.set_cpu_profile_rate(core.cpu_sample_rate_hz);
        }

        core.sampler
            .start_cpu(core.cpu_sample_rate_hz)
            .map_err(|e| ProbeError::Sampler(e.to_string()))?;
        Ok(())
    }

    fn stop_sampling(&self, core: &mut Core) -> Result<(), ProbeError> {
        if core.state != ProbeState::Enabled {
            return Ok(());
        }
        debug!("stop profiling");

        let cpu = core.sampler.stop_cpu();
        core.buffers.cpu.push(cpu);

        let heap = core.sampler.dump_heap();
        self.set_state(core, ProbeState::Disabled);

        match heap {
            Ok(heap) => {
                core.buffers.mem.push(heap);
                Ok(())
            }
            Err(e) => {
                core.buffers.mem.push(Vec::new());
                Err(ProbeError::Sampler(e.to_string()))
            }
        }
    }

    async fn end_profile(&self, core: &mut Core) -> Result<(), ProbeError> {
        if self.guard_end(core.state).is_err() {
            return Ok(());
        }
        debug!("end profile");

        self.stop_sampling(core)?;
        self.prepare_agent(core)?;

        self.set_state(core, ProbeState::Sending);
        let result = self.encode_and_send(core).await;
        self.set_state(core, ProbeState::Off);
        result
    }

    async fn encode_and_send(&self, core: &mut Core) -> Result<(), ProbeError> {
        if let Some(dir) = &self.config.pprof_dump_dir {
            debug!(dir = %dir.display(), "dumping pprof profiles");
            if let Err(e) = dump_profiles(&core.buffers.cpu, &core.buffers.mem, dir) {
                warn!(error = %e, "pprof dump failed");
            }
        }

        let profile = ProfileBuilder::from_buffers(
            &core.buffers.cpu,
            &core.buffers.mem,
            core.cpu_sample_rate_hz,
        )?;
        core.buffers.reset();

        if !profile.has_data() {
            debug!("no samples recorded");
            return Ok(());
        }

        let title = self.title.lock().clone();
        match core.agent.as_mut() {
            Some(agent) => agent.send_profile(&profile, &title).await,
            None => Err(ProbeError::ConfigInvalid(
                "agent client unavailable".to_string(),
            )),
        }
    }

    fn prepare_agent(&self, core: &mut Core) -> Result<(), ProbeError> {
        if core.agent.is_none() {
            core.agent = Some(AgentClient::new(&self.config)?);
        }
        Ok(())
    }
}

/// Dump the raw sampler buffers as `<exe>-cpu-<n>.pprof` / `<exe>-mem-<n>.pprof`,
/// continuing from the first unused index in the directory.
fn dump_profiles(cpu: &[Vec<u8>], mem: &[Vec<u8>], dir: &Path) -> std::io::Result<()> {
    let prefix = dir.join(sysinfo::exe_basename());
    let prefix = prefix.to_string_lossy();

    let cpu_path = |index: usize| format!("{prefix}-cpu-{index}.pprof");
    let mem_path = |index: usize| format!("{prefix}-mem-{index}.pprof");

    let mut start = 1;
    while Path::new(&cpu_path(start)).exists() || Path::new(&mem_path(start)).exists() {
        start += 1;
    }

    for (i, buffer) in cpu.iter().enumerate() {
        std::fs::write(cpu_path(start + i), buffer)?;
    }
    for (i, buffer) in mem.iter().enumerate() {
        std::fs::write(mem_path(start + i), buffer)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sampler::{NullSampler, StaticSampler};

    fn test_config(max_duration: Duration) -> Configuration {
        Configuration {
            agent_socket: "tcp://127.0.0.1:0".to_string(),
            blackfire_query: Some("expires=9999&userId=u&signature=sig".to_string()),
            max_profile_duration: max_duration,
            ..Default::default()
        }
    }

    fn test_probe() -> Probe {
        Probe::new(
            test_config(Duration::from_secs(600)),
            Box::new(NullSampler::default()),
        )
        .expect("probe")
    }

    /// Sampler whose start panics, for exercising the panic shield.
    #[derive(Default)]
    struct PanickingSampler;

    impl Sampler for PanickingSampler {
        fn set_cpu_profile_rate(&mut self, _rate_hz: u32) {}
        fn start_cpu(&mut self, _rate_hz: u32) -> anyhow::Result<()> {
            panic!("sampler exploded");
        }
        fn stop_cpu(&mut self) -> Vec<u8> {
            Vec::new()
        }
        fn dump_heap(&mut self) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_enable_disable_end_walk() {
        let probe = test_probe();
        assert_eq!(probe.current_state(), ProbeState::Off);
        assert!(!probe.is_profiling());

        probe.enable_now().await.expect("enable");
        assert_eq!(probe.current_state(), ProbeState::Enabled);
        assert!(probe.is_profiling());

        probe.disable().await.expect("disable");
        // The transition happens on the rearm loop; give it a tick.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.current_state(), ProbeState::Disabled);
        assert!(!probe.is_profiling());

        // Ending from Disabled is allowed; with no samples nothing is sent.
        probe.end().await.expect("end");
        assert_eq!(probe.current_state(), ProbeState::Off);
    }

    #[tokio::test]
    async fn test_enable_twice_reports_already_profiling() {
        let probe = test_probe();
        probe.enable_now().await.expect("enable");

        let err = probe.enable_now().await.expect_err("second enable");
        assert!(matches!(err, ProbeError::AlreadyProfiling));
    }

    #[tokio::test]
    async fn test_disable_in_wrong_state_errors() {
        let probe = test_probe();
        let err = probe.disable().await.expect_err("disable while off");
        assert!(matches!(err, ProbeError::WrongState { .. }));

        // Repeated disable after a successful one is rejected the same way.
        probe.enable_now().await.expect("enable");
        probe.disable().await.expect("disable");
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = probe.disable().await.expect_err("double disable");
        assert!(matches!(err, ProbeError::WrongState { .. }));
    }

    #[tokio::test]
    async fn test_end_in_off_and_sending_is_rejected() {
        let probe = test_probe();
        let err = probe.end().await.expect_err("end while off");
        assert!(matches!(err, ProbeError::WrongState { .. }));
        let err = probe.end_no_wait().await.expect_err("end_no_wait while off");
        assert!(matches!(err, ProbeError::WrongState { .. }));
    }

    #[tokio::test]
    async fn test_auto_stop_after_duration() {
        let probe = Probe::new(
            test_config(Duration::from_secs(600)),
            Box::new(NullSampler::default()),
        )
        .expect("probe");

        probe
            .enable_now_for(Duration::from_millis(30))
            .await
            .expect("enable");
        assert_eq!(probe.current_state(), ProbeState::Enabled);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(probe.current_state(), ProbeState::Disabled);
    }

    #[tokio::test]
    async fn test_zero_and_oversized_durations_clamp_to_max() {
        // max 40ms; duration 0 clamps to it and auto-stops.
        let probe = Probe::new(
            test_config(Duration::from_millis(40)),
            Box::new(NullSampler::default()),
        )
        .expect("probe");

        probe.enable_now_for(Duration::ZERO).await.expect("enable");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.current_state(), ProbeState::Disabled);

        // An hour clamps to 40ms as well.
        probe
            .enable_now_for(Duration::from_secs(3600))
            .await
            .expect("re-enable");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(probe.current_state(), ProbeState::Disabled);
    }

    #[tokio::test]
    async fn test_disable_cancels_pending_auto_stop() {
        let probe = test_probe();
        probe
            .enable_now_for(Duration::from_millis(80))
            .await
            .expect("enable");
        probe.disable().await.expect("disable");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(probe.current_state(), ProbeState::Disabled);

        // Re-enable; the stale timer from the first round must not stop it.
        probe.enable_now().await.expect("re-enable");
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(probe.current_state(), ProbeState::Enabled);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_enables_have_one_winner() {
        let probe = test_probe();

        let mut tasks = Vec::new();
        for _ in 0..100 {
            let probe = probe.clone();
            tasks.push(tokio::spawn(async move { probe.enable_now().await }));
        }

        let mut successes = 0;
        let mut already = 0;
        for task in tasks {
            match task.await.expect("join") {
                Ok(()) => successes += 1,
                Err(ProbeError::AlreadyProfiling) => already += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }

        assert_eq!(successes, 1);
        assert_eq!(already, 99);
    }

    #[tokio::test]
    async fn test_panic_poisons_probe_permanently() {
        let probe = Probe::new(
            test_config(Duration::from_secs(600)),
            Box::new(PanickingSampler),
        )
        .expect("probe");

        let err = probe.enable_now().await.expect_err("panicking enable");
        assert!(matches!(err, ProbeError::DisabledFromPanic));

        for _ in 0..3 {
            let err = probe.enable_now().await.expect_err("poisoned");
            assert!(matches!(err, ProbeError::DisabledFromPanic));
            let err = probe.disable().await.expect_err("poisoned");
            assert!(matches!(err, ProbeError::DisabledFromPanic));
            let err = probe.end().await.expect_err("poisoned");
            assert!(matches!(err, ProbeError::DisabledFromPanic));
        }
        assert!(!probe.is_profiling());
    }

    #[tokio::test]
    async fn test_on_demand_only_without_query_is_a_noop() {
        let config = Configuration {
            agent_socket: "tcp://127.0.0.1:0".to_string(),
            client_id: "id".to_string(),
            client_token: "token".to_string(),
            ..Default::default()
        };
        let probe =
            Probe::new(config, Box::new(NullSampler::default())).expect("probe");

        probe.enable().await.expect("no-op enable");
        assert_eq!(probe.current_state(), ProbeState::Off);
        assert!(!probe.is_profiling());

        probe.disable().await.expect("no-op disable");
        probe.end().await.expect("no-op end");
        assert_eq!(probe.current_state(), ProbeState::Off);
    }

    #[tokio::test]
    async fn test_buffers_survive_auto_stop_for_later_end() {
        // A static sampler with a recorded blob; after auto-stop the round
        // can still be ended (and fails on the unreachable agent, proving
        // the buffered samples made it to the send path).
        let parsed = crate::pprof::Profile {
            string_table: vec!["".into(), "main".into()],
            function: vec![crate::pprof::Function {
                id: 1,
                name: 1,
                ..Default::default()
            }],
            location: vec![crate::pprof::Location {
                id: 1,
                line: vec![crate::pprof::Line {
                    function_id: 1,
                    line: 1,
                }],
                ..Default::default()
            }],
            sample: vec![crate::pprof::Sample {
                location_id: vec![1],
                value: vec![1, 10_000_000],
            }],
            ..Default::default()
        };
        let mut blob = Vec::new();
        use prost::Message;
        parsed.encode(&mut blob).expect("encode");

        let probe = Probe::new(
            test_config(Duration::from_secs(600)),
            Box::new(StaticSampler::new(vec![blob], vec![])),
        )
        .expect("probe");

        probe
            .enable_now_for(Duration::from_millis(30))
            .await
            .expect("enable");
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(probe.current_state(), ProbeState::Disabled);

        // Port 0 is unreachable: the send fails, which means the retained
        // buffers produced a non-empty profile.
        let err = probe.end().await.expect_err("send fails");
        assert!(!matches!(err, ProbeError::WrongState { .. }));
        assert_eq!(probe.current_state(), ProbeState::Off);
    }

    #[tokio::test]
    async fn test_dump_profiles_picks_next_free_index() {
        let dir = tempfile::tempdir().expect("tempdir");
        let exe = crate::sysinfo::exe_basename();

        // Occupy index 1.
        std::fs::write(dir.path().join(format!("{exe}-cpu-1.pprof")), b"old")
            .expect("seed");

        dump_profiles(
            &[b"cpu-a".to_vec(), b"cpu-b".to_vec()],
            &[b"mem-a".to_vec()],
            dir.path(),
        )
        .expect("dump");

        assert!(dir.path().join(format!("{exe}-cpu-2.pprof")).is_file());
        assert!(dir.path().join(format!("{exe}-cpu-3.pprof")).is_file());
        assert!(dir.path().join(format!("{exe}-mem-2.pprof")).is_file());
    }
}
