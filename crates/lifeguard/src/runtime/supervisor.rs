//! Supervisor: per-service lifecycle state machine
//!
//! Each service has a lifecycle lock serializing `start`/`stop`/`restart`
//! and the commit of readiness results and automatic restarts, and a record
//! behind a short-lived `RwLock` that status queries read without waiting on
//! lifecycle operations. Notifications from background tasks carry the spawn
//! generation they belong to and are dropped once it is stale. `start`,
//! `stop` and `restart` run on their own task, so dropping the caller's
//! future never leaves a transition half applied.

use crate::config::SupervisorSettings;
use crate::registry::{Registry, ServiceDescriptor};
use crate::runtime::events::{StatusEvent, DEFAULT_EVENT_CAPACITY};
use crate::runtime::output::{LogForwarder, LogSink, OutputBuffer, OutputLine};
use crate::runtime::process::{ExitOutcome, ExitWatch, ProcessError, ProcessHandle};
use crate::runtime::readiness::{ReadinessChecker, ReadinessTarget, DEFAULT_PROBE_INTERVAL};
use crate::runtime::restart::RestartDecision;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::time::Instant;

/// How long to wait for a process to disappear after SIGKILL
const KILL_WAIT: Duration = Duration::from_secs(2);

/// Poll interval while `start_all` waits for dependencies
const DEPENDENCY_POLL: Duration = Duration::from_millis(100);

/// Slack on top of a dependency's readiness timeout
const DEPENDENCY_GRACE: Duration = Duration::from_secs(1);

/// Lifecycle state of a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ServiceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceState::Stopped => "stopped",
            ServiceState::Starting => "starting",
            ServiceState::Running => "running",
            ServiceState::Stopping => "stopping",
            ServiceState::Failed => "failed",
        }
    }

    /// Whether a fresh `start` may be issued from this state
    pub fn can_start(&self) -> bool {
        matches!(self, ServiceState::Stopped | ServiceState::Failed)
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor-wide timing configuration
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Grace period between SIGTERM and SIGKILL
    pub stop_timeout: Duration,
    /// Overall deadline for `shutdown`
    pub shutdown_timeout: Duration,
    /// Delay between readiness probes
    pub readiness_interval: Duration,
    /// Captured output lines kept per service
    pub output_buffer_lines: usize,
    /// Capacity of the status event channel
    pub event_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(30),
            readiness_interval: DEFAULT_PROBE_INTERVAL,
            output_buffer_lines: 200,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl SupervisorConfig {
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            stop_timeout: Duration::from_millis(settings.stop_timeout_ms),
            shutdown_timeout: Duration::from_millis(settings.shutdown_timeout_ms),
            readiness_interval: Duration::from_millis(settings.readiness_interval_ms),
            output_buffer_lines: settings.output_buffer_lines,
            ..Default::default()
        }
    }
}

/// Point-in-time view of one service
#[derive(Debug, Clone)]
pub struct ServiceStatus {
    pub name: String,
    pub state: ServiceState,
    pub pid: Option<u32>,
    pub uptime: Option<Duration>,
    pub last_exit_code: Option<i32>,
    pub last_signal: Option<i32>,
    pub last_error: Option<String>,
    /// Consecutive failures of the current crash loop
    pub restart_count: u32,
    /// Port of the readiness target, if any
    pub port: Option<u16>,
    pub description: Option<String>,
}

#[derive(Debug)]
struct ServiceRecord {
    state: ServiceState,
    handle: Option<ProcessHandle>,
    generation: u64,
    consecutive_failures: u32,
    last_exit: Option<ExitOutcome>,
    last_error: Option<String>,
    /// An automatic restart is scheduled for the current generation
    restart_pending: bool,
    /// The current spawn is an automatic restart
    retrying: bool,
    /// Set when a stop escalated to SIGKILL, reported when it completes
    forced_stop: Option<String>,
}

impl Default for ServiceRecord {
    fn default() -> Self {
        Self {
            state: ServiceState::Stopped,
            handle: None,
            generation: 0,
            consecutive_failures: 0,
            last_exit: None,
            last_error: None,
            restart_pending: false,
            retrying: false,
            forced_stop: None,
        }
    }
}

struct ServiceSlot {
    descriptor: Arc<ServiceDescriptor>,
    lifecycle: Mutex<()>,
    record: RwLock<ServiceRecord>,
    output: OutputBuffer,
}

impl ServiceSlot {
    fn new(descriptor: Arc<ServiceDescriptor>, output_lines: usize) -> Self {
        Self {
            descriptor,
            lifecycle: Mutex::new(()),
            record: RwLock::new(ServiceRecord::default()),
            output: OutputBuffer::new(output_lines),
        }
    }

    fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// Owns every supervised service and drives its lifecycle
pub struct Supervisor {
    registry: Arc<Registry>,
    config: SupervisorConfig,
    readiness: ReadinessChecker,
    slots: HashMap<String, Arc<ServiceSlot>>,
    /// Names in the order they were last started
    start_order: std::sync::Mutex<Vec<String>>,
    shutting_down: AtomicBool,
    event_tx: broadcast::Sender<StatusEvent>,
    log_sink: Arc<dyn LogSink>,
}

impl Supervisor {
    /// Create a supervisor that forwards child output to the log
    pub fn new(
        registry: Arc<Registry>,
        config: SupervisorConfig,
    ) -> Result<Arc<Self>, SupervisorError> {
        Self::with_log_sink(registry, config, Arc::new(LogForwarder))
    }

    /// Create a supervisor with a custom sink for child output
    pub fn with_log_sink(
        registry: Arc<Registry>,
        config: SupervisorConfig,
        log_sink: Arc<dyn LogSink>,
    ) -> Result<Arc<Self>, SupervisorError> {
        let readiness = ReadinessChecker::new(config.readiness_interval)?;
        let slots = registry
            .all()
            .map(|descriptor| {
                (
                    descriptor.name.clone(),
                    Arc::new(ServiceSlot::new(
                        descriptor.clone(),
                        config.output_buffer_lines,
                    )),
                )
            })
            .collect();
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        Ok(Arc::new(Self {
            registry,
            config,
            readiness,
            slots,
            start_order: std::sync::Mutex::new(Vec::new()),
            shutting_down: AtomicBool::new(false),
            event_tx,
            log_sink,
        }))
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Receive every state transition from now on
    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.event_tx.subscribe()
    }

    fn slot(&self, name: &str) -> Result<&Arc<ServiceSlot>, SupervisorError> {
        self.slots
            .get(name)
            .ok_or_else(|| SupervisorError::NotFound(name.to_string()))
    }

    fn ensure_accepting(&self) -> Result<(), SupervisorError> {
        if self.is_shutting_down() {
            Err(SupervisorError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Start a service.
    ///
    /// Returns once `Starting` (or `Running`, without a readiness target) is
    /// committed. A service that is already starting, running or stopping
    /// is left alone and its current state returned.
    pub async fn start(self: &Arc<Self>, name: &str) -> Result<ServiceState, SupervisorError> {
        let slot = self.slot(name)?.clone();
        self.ensure_accepting()?;

        let supervisor = Arc::clone(self);
        Self::detached(async move {
            let _guard = slot.lifecycle.lock().await;
            supervisor.start_locked(&slot).await
        })
        .await
    }

    /// Stop a service: SIGTERM, then SIGKILL after the stop timeout.
    ///
    /// Resolves once the process is gone. A failed service waiting for an
    /// automatic restart has the restart cancelled.
    pub async fn stop(self: &Arc<Self>, name: &str) -> Result<ServiceState, SupervisorError> {
        let slot = self.slot(name)?.clone();

        let supervisor = Arc::clone(self);
        Self::detached(async move {
            let _guard = slot.lifecycle.lock().await;
            supervisor.stop_locked(&slot).await
        })
        .await
    }

    /// Stop then start as one serialized operation
    pub async fn restart(self: &Arc<Self>, name: &str) -> Result<ServiceState, SupervisorError> {
        let slot = self.slot(name)?.clone();
        self.ensure_accepting()?;

        let supervisor = Arc::clone(self);
        Self::detached(async move {
            let _guard = slot.lifecycle.lock().await;
            supervisor.stop_locked(&slot).await?;
            supervisor.start_locked(&slot).await
        })
        .await
    }

    /// Run a lifecycle operation on its own task.
    ///
    /// The operation completes even if the caller's future is dropped
    /// (client disconnect, outer timeout), so a spawned process is always
    /// recorded and a stop always reaches `Stopped`.
    async fn detached<F>(operation: F) -> Result<ServiceState, SupervisorError>
    where
        F: Future<Output = Result<ServiceState, SupervisorError>> + Send + 'static,
    {
        match tokio::spawn(operation).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // Only happens while the runtime itself is shutting down
            Err(_) => Err(SupervisorError::ShuttingDown),
        }
    }

    pub async fn status(&self, name: &str) -> Result<ServiceStatus, SupervisorError> {
        let slot = self.slot(name)?;
        Ok(Self::snapshot(slot).await)
    }

    /// Status of every service in configuration order
    pub async fn status_all(&self) -> Vec<ServiceStatus> {
        let mut statuses = Vec::with_capacity(self.slots.len());
        for name in self.registry.names() {
            if let Some(slot) = self.slots.get(name) {
                statuses.push(Self::snapshot(slot).await);
            }
        }
        statuses
    }

    /// The last `lines` captured output lines, oldest first
    pub fn logs(&self, name: &str, lines: usize) -> Result<Vec<OutputLine>, SupervisorError> {
        Ok(self.slot(name)?.output.tail(lines))
    }

    /// Start every autostart service (and what it depends on) in dependency
    /// order, waiting for each dependency to be running first
    pub async fn start_all(
        self: &Arc<Self>,
    ) -> Vec<(String, Result<ServiceState, SupervisorError>)> {
        let order = self.registry.autostart_order();
        log::info!("Starting {} service(s): {}", order.len(), order.join(", "));

        let mut results = Vec::with_capacity(order.len());
        for name in order {
            let result = match self.wait_for_dependencies(&name).await {
                Ok(()) => self.start(&name).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &result {
                log::error!("Failed to start '{}': {}", name, e);
            }
            results.push((name, result));
        }
        results
    }

    /// Stop everything in reverse start order within the shutdown deadline,
    /// force-killing whatever is left when it expires
    pub async fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let order: Vec<String> = self
            .start_order
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .rev()
            .cloned()
            .collect();

        log::info!("Shutting down {} service(s)...", order.len());

        for name in order {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, self.stop(&name)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => log::warn!("[{}] Error during shutdown: {}", name, e),
                Err(_) => {
                    log::warn!(
                        "Shutdown deadline of {}ms reached, force-killing remaining services",
                        self.config.shutdown_timeout.as_millis()
                    );
                    self.force_kill_all().await;
                    break;
                }
            }
        }

        log::info!("All services stopped");
    }

    async fn start_locked(
        self: &Arc<Self>,
        slot: &Arc<ServiceSlot>,
    ) -> Result<ServiceState, SupervisorError> {
        self.ensure_accepting()?;

        let state = slot.record.read().await.state;
        if !state.can_start() {
            log::debug!("[{}] Start ignored, service is {}", slot.name(), state);
            return Ok(state);
        }

        self.spawn_attempt(slot, false).await
    }

    /// Spawn a new process for the service; caller holds the lifecycle lock
    async fn spawn_attempt(
        self: &Arc<Self>,
        slot: &Arc<ServiceSlot>,
        retry: bool,
    ) -> Result<ServiceState, SupervisorError> {
        let descriptor = &slot.descriptor;

        let generation = {
            let mut record = slot.record.write().await;
            record.generation += 1;
            record.restart_pending = false;
            record.retrying = retry;
            record.forced_stop = None;
            record.last_error = None;
            if !retry {
                record.consecutive_failures = 0;
            }
            self.transition(&descriptor.name, &mut record, ServiceState::Starting, None);
            record.generation
        };

        let handle = match ProcessHandle::spawn(
            &descriptor.process_config(),
            slot.output.clone(),
            self.log_sink.clone(),
        ) {
            Ok(handle) => handle,
            Err(source) => {
                let err = SupervisorError::Spawn {
                    name: descriptor.name.clone(),
                    source,
                };
                let mut record = slot.record.write().await;
                record.last_error = Some(err.to_string());
                self.transition(
                    &descriptor.name,
                    &mut record,
                    ServiceState::Failed,
                    Some(err.to_string()),
                );
                return Err(err);
            }
        };

        let exit = handle.exit_watch();
        let state = {
            let mut record = slot.record.write().await;
            record.handle = Some(handle);
            if descriptor.readiness.is_none() {
                self.transition(&descriptor.name, &mut record, ServiceState::Running, None);
            }
            record.state
        };

        {
            let mut order = self.start_order.lock().unwrap_or_else(PoisonError::into_inner);
            order.retain(|n| n != &descriptor.name);
            order.push(descriptor.name.clone());
        }

        self.watch_exit(slot.clone(), generation, exit.clone());
        if let Some(target) = &descriptor.readiness {
            self.watch_readiness(slot.clone(), generation, target.clone(), exit);
        }

        Ok(state)
    }

    /// Report the process exit back to the supervisor
    fn watch_exit(self: &Arc<Self>, slot: Arc<ServiceSlot>, generation: u64, exit: ExitWatch) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = exit.wait().await;
            supervisor.handle_exit(&slot, generation, outcome).await;
        });
    }

    /// Poll readiness, racing it against an early exit
    fn watch_readiness(
        self: &Arc<Self>,
        slot: Arc<ServiceSlot>,
        generation: u64,
        target: ReadinessTarget,
        exit: ExitWatch,
    ) {
        let supervisor = Arc::clone(self);
        let checker = self.readiness.clone();
        tokio::spawn(async move {
            let timeout = slot.descriptor.readiness_timeout;
            let readiness = tokio::select! {
                readiness = checker.wait_ready(Some(&target), timeout) => readiness,
                // The exit watcher reports this one
                _ = exit.wait() => return,
            };

            supervisor
                .commit_readiness(&slot, generation, readiness.ready, readiness.last_error)
                .await;
        });
    }

    async fn commit_readiness(
        &self,
        slot: &Arc<ServiceSlot>,
        generation: u64,
        ready: bool,
        last_error: Option<String>,
    ) {
        let _guard = slot.lifecycle.lock().await;
        let name = slot.name();

        let exit = {
            let mut record = slot.record.write().await;
            if record.generation != generation || record.state != ServiceState::Starting {
                return;
            }

            if ready {
                self.transition(name, &mut record, ServiceState::Running, None);
                return;
            }

            let err = SupervisorError::ReadinessTimeout {
                name: name.to_string(),
                timeout: slot.descriptor.readiness_timeout,
                last_error: last_error.unwrap_or_else(|| "no probe succeeded".to_string()),
            };
            record.last_error = Some(err.to_string());
            self.transition(name, &mut record, ServiceState::Failed, Some(err.to_string()));

            let Some(handle) = record.handle.take() else {
                return;
            };
            handle.kill();
            handle.exit_watch()
        };

        if tokio::time::timeout(KILL_WAIT, exit.wait()).await.is_err() {
            log::error!("[{}] Process did not exit after SIGKILL", name);
        }
    }

    /// Apply an exit to the record and decide on an automatic restart
    async fn handle_exit(
        self: &Arc<Self>,
        slot: &Arc<ServiceSlot>,
        generation: u64,
        exit: ExitOutcome,
    ) {
        let name = slot.name();
        let mut record = slot.record.write().await;
        if record.generation != generation {
            return;
        }
        record.last_exit = Some(exit);

        let was_starting = match record.state {
            ServiceState::Starting => true,
            ServiceState::Running => false,
            ServiceState::Stopping => {
                self.finish_stop(name, &mut record);
                return;
            }
            // Readiness failure finishes the record itself
            ServiceState::Stopped | ServiceState::Failed => return,
        };
        let uptime = record
            .handle
            .take()
            .map(|handle| handle.uptime())
            .unwrap_or_default();

        if was_starting && !record.retrying {
            let message = format!("exited during startup ({})", exit);
            record.last_error = Some(message.clone());
            self.transition(name, &mut record, ServiceState::Failed, Some(message));
            return;
        }

        let policy = &slot.descriptor.restart;
        let long_enough = !was_starting && policy.is_stable(uptime);
        let attempt = record.consecutive_failures.saturating_add(1);

        match policy.should_restart(attempt, &exit, long_enough) {
            RestartDecision::CleanExit => {
                record.consecutive_failures = 0;
                self.transition(name, &mut record, ServiceState::Stopped, None);
            }
            RestartDecision::Disabled => {
                let message = format!("exited unexpectedly ({})", exit);
                record.last_error = Some(message.clone());
                self.transition(name, &mut record, ServiceState::Failed, Some(message));
            }
            RestartDecision::Exhausted { attempt } => {
                record.consecutive_failures = attempt;
                let err = SupervisorError::CrashLoop {
                    name: name.to_string(),
                    attempts: attempt,
                };
                record.last_error = Some(err.to_string());
                self.transition(name, &mut record, ServiceState::Failed, Some(err.to_string()));
            }
            RestartDecision::Restart { attempt, delay } => {
                record.consecutive_failures = attempt;
                if self.is_shutting_down() {
                    let message = format!("exited during shutdown ({})", exit);
                    record.last_error = Some(message.clone());
                    self.transition(name, &mut record, ServiceState::Failed, Some(message));
                    return;
                }

                let message = format!(
                    "crashed ({}), restart {}/{} in {}ms",
                    exit,
                    attempt,
                    policy.max_attempts,
                    delay.as_millis()
                );
                record.last_error = Some(message.clone());
                record.restart_pending = true;
                self.transition(name, &mut record, ServiceState::Failed, Some(message));
                drop(record);

                self.schedule_restart(slot.clone(), generation, delay);
            }
        }
    }

    fn schedule_restart(
        self: &Arc<Self>,
        slot: Arc<ServiceSlot>,
        generation: u64,
        delay: Duration,
    ) {
        let supervisor = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let _guard = slot.lifecycle.lock().await;
            {
                let mut record = slot.record.write().await;
                if record.generation != generation
                    || !record.restart_pending
                    || record.state != ServiceState::Failed
                {
                    return;
                }
                if supervisor.is_shutting_down() {
                    record.restart_pending = false;
                    return;
                }
            }

            log::info!("[{}] Restarting after crash", slot.name());
            if let Err(e) = supervisor.spawn_attempt(&slot, true).await {
                log::error!("[{}] Automatic restart failed: {}", slot.name(), e);
            }
        });
    }

    /// Stop a service; caller holds the lifecycle lock
    async fn stop_locked(&self, slot: &Arc<ServiceSlot>) -> Result<ServiceState, SupervisorError> {
        let name = slot.name();

        let (generation, exit) = {
            let mut record = slot.record.write().await;
            match record.state {
                ServiceState::Stopped => return Ok(ServiceState::Stopped),
                ServiceState::Failed if record.restart_pending => {
                    record.restart_pending = false;
                    record.generation += 1;
                    record.consecutive_failures = 0;
                    log::info!("[{}] Pending restart cancelled", name);
                    self.transition(name, &mut record, ServiceState::Stopped, None);
                    return Ok(ServiceState::Stopped);
                }
                ServiceState::Failed => return Ok(ServiceState::Failed),
                ServiceState::Starting | ServiceState::Running | ServiceState::Stopping => {}
            }

            if record.state != ServiceState::Stopping {
                self.transition(name, &mut record, ServiceState::Stopping, None);
            }

            let exit = match record.handle.as_ref() {
                Some(handle) => {
                    log::info!("[{}] Sending SIGTERM to PID {}", name, handle.pid());
                    handle.terminate();
                    handle.exit_watch()
                }
                None => {
                    self.finish_stop(name, &mut record);
                    return Ok(ServiceState::Stopped);
                }
            };
            (record.generation, exit)
        };

        let graceful = tokio::time::timeout(self.config.stop_timeout, exit.clone().wait()).await;
        let outcome = match graceful {
            Ok(outcome) => outcome,
            Err(_) => {
                let err = SupervisorError::ShutdownTimeout {
                    name: name.to_string(),
                    timeout: self.config.stop_timeout,
                };
                log::warn!("{}", err);
                {
                    let mut record = slot.record.write().await;
                    if record.generation == generation {
                        record.forced_stop = Some(err.to_string());
                        if let Some(handle) = record.handle.as_ref() {
                            handle.kill();
                        }
                    }
                }

                match tokio::time::timeout(KILL_WAIT, exit.wait()).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        log::error!("[{}] Process did not exit after SIGKILL", name);
                        ExitOutcome {
                            requested: true,
                            ..Default::default()
                        }
                    }
                }
            }
        };

        // The exit watcher may already have finished the record
        let mut record = slot.record.write().await;
        if record.generation == generation && record.state == ServiceState::Stopping {
            record.last_exit = Some(outcome);
            self.finish_stop(name, &mut record);
        }
        Ok(record.state)
    }

    /// Complete `Stopping -> Stopped` for the current spawn
    fn finish_stop(&self, name: &str, record: &mut ServiceRecord) {
        record.handle = None;
        record.consecutive_failures = 0;
        record.restart_pending = false;
        let forced = record.forced_stop.take();
        if forced.is_some() {
            record.last_error = forced.clone();
        }
        self.transition(name, record, ServiceState::Stopped, forced);
    }

    /// Kill every live process without waiting on lifecycle locks
    async fn force_kill_all(&self) {
        let mut pending = Vec::new();

        for slot in self.slots.values() {
            let mut record = slot.record.write().await;
            // Invalidate readiness, exit and restart tasks of this spawn
            record.generation += 1;
            record.forced_stop = None;
            if record.restart_pending {
                record.restart_pending = false;
                self.transition(slot.name(), &mut record, ServiceState::Stopped, None);
            }

            let Some(handle) = record.handle.take() else {
                continue;
            };
            log::warn!("[{}] Force-killing PID {}", slot.name(), handle.pid());
            handle.kill();
            if record.state != ServiceState::Stopping {
                self.transition(slot.name(), &mut record, ServiceState::Stopping, None);
            }
            pending.push((slot.clone(), handle.exit_watch()));
        }

        let timeout = self.config.shutdown_timeout;
        futures::future::join_all(pending.into_iter().map(|(slot, exit)| async move {
            let outcome = match tokio::time::timeout(KILL_WAIT, exit.wait()).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    log::error!("[{}] Process did not exit after SIGKILL", slot.name());
                    ExitOutcome {
                        requested: true,
                        ..Default::default()
                    }
                }
            };

            let err = SupervisorError::ShutdownTimeout {
                name: slot.name().to_string(),
                timeout,
            };
            let mut record = slot.record.write().await;
            record.last_exit = Some(outcome);
            record.last_error = Some(err.to_string());
            self.transition(slot.name(), &mut record, ServiceState::Stopped, Some(err.to_string()));
        }))
        .await;
    }

    /// Wait until every direct dependency of `name` is running
    async fn wait_for_dependencies(&self, name: &str) -> Result<(), SupervisorError> {
        let slot = self.slot(name)?;

        for dependency in &slot.descriptor.depends_on {
            let dep = self.slot(dependency)?;
            let deadline = Instant::now() + dep.descriptor.readiness_timeout + DEPENDENCY_GRACE;

            loop {
                self.ensure_accepting()?;

                let state = dep.record.read().await.state;
                let not_ready = || SupervisorError::DependencyNotReady {
                    name: name.to_string(),
                    dependency: dependency.clone(),
                    state,
                };

                match state {
                    ServiceState::Running => break,
                    ServiceState::Starting if Instant::now() < deadline => {
                        tokio::time::sleep(DEPENDENCY_POLL).await;
                    }
                    _ => return Err(not_ready()),
                }
            }
        }

        Ok(())
    }

    /// Commit a state change and publish it
    fn transition(
        &self,
        name: &str,
        record: &mut ServiceRecord,
        new_state: ServiceState,
        error: Option<String>,
    ) {
        let old_state = record.state;
        record.state = new_state;

        match &error {
            Some(e) => log::warn!("[{}] {} -> {}: {}", name, old_state, new_state, e),
            None => log::info!("[{}] {} -> {}", name, old_state, new_state),
        }

        // No subscribers is fine
        let _ = self
            .event_tx
            .send(StatusEvent::new(name, old_state, new_state, error));
    }

    async fn snapshot(slot: &ServiceSlot) -> ServiceStatus {
        let record = slot.record.read().await;
        let descriptor = &slot.descriptor;

        ServiceStatus {
            name: descriptor.name.clone(),
            state: record.state,
            pid: record.handle.as_ref().map(ProcessHandle::pid),
            uptime: record.handle.as_ref().map(ProcessHandle::uptime),
            last_exit_code: record.last_exit.and_then(|e| e.code),
            last_signal: record.last_exit.and_then(|e| e.signal),
            last_error: record.last_error.clone(),
            restart_count: record.consecutive_failures,
            port: descriptor.readiness.as_ref().and_then(ReadinessTarget::port),
            description: descriptor.description.clone(),
        }
    }
}

impl fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Supervisor")
            .field("services", &self.registry.len())
            .field("config", &self.config)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

/// Errors returned by supervisor operations
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("{source}")]
    Spawn {
        name: String,
        #[source]
        source: ProcessError,
    },

    #[error("Service '{name}' not ready after {}ms: {last_error}", .timeout.as_millis())]
    ReadinessTimeout {
        name: String,
        timeout: Duration,
        last_error: String,
    },

    #[error("Service '{name}' failed {attempts} times in a row, giving up")]
    CrashLoop { name: String, attempts: u32 },

    #[error("Service '{name}' did not stop within {}ms and was killed", .timeout.as_millis())]
    ShutdownTimeout { name: String, timeout: Duration },

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Service '{name}' depends on '{dependency}', which is {state}")]
    DependencyNotReady {
        name: String,
        dependency: String,
        state: ServiceState,
    },

    #[error("Failed to build readiness client: {0}")]
    ReadinessClient(#[from] reqwest::Error),
}
