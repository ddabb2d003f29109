//! Endpoint lifecycle and shared runtime state.
//!
//! One coarse lock guards structural state (active runs, statuses,
//! listeners, connection tables). It is never held across an await. Each
//! run gets a generation number and a child of the shared cancellation
//! token; tasks check both before touching state so a stale task cannot
//! clobber a newer run of the same endpoint.
//!
//! # Invariants
//!
//! - `active_clients` equals the number of clients in `active`
//! - `running == active_clients > 0`, mirrored on the watch channel
//! - `Error` is never overwritten with `Completed`

use std::{
    collections::{BTreeSet, HashMap},
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use retrace_core::{Endpoint, EndpointId, EndpointStatus, Environment, Role, Trace};
use retrace_log::LogPipeline;
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::{
    client,
    config::EngineConfig,
    error::EngineError,
    registry::{ConnectionTable, EndpointCounters, EndpointStats, ListenerHandle},
    server,
    system_env::SystemEnv,
};

/// Everything a spawned endpoint task needs.
pub(crate) struct RunContext<E: Environment> {
    pub(crate) engine: Engine<E>,
    pub(crate) endpoint: Endpoint,
    pub(crate) generation: u64,
    /// Cancelled by `stop_endpoint` or `stop_all`.
    pub(crate) cancel: CancellationToken,
    /// Cancelled by `stop_all` only.
    pub(crate) shutdown: CancellationToken,
    pub(crate) counters: Arc<EndpointCounters>,
}

struct ActiveRun {
    role: Role,
    generation: u64,
    cancel: CancellationToken,
}

struct EngineState {
    status: HashMap<EndpointId, EndpointStatus>,
    active: HashMap<EndpointId, ActiveRun>,
    listeners: HashMap<EndpointId, ListenerHandle>,
    connections: HashMap<EndpointId, Arc<ConnectionTable>>,
    counters: HashMap<EndpointId, Arc<EndpointCounters>>,
    latest: HashMap<EndpointId, u64>,
    active_clients: usize,
    running: bool,
    shutdown: CancellationToken,
    next_generation: u64,
}

impl EngineState {
    fn new() -> Self {
        Self {
            status: HashMap::new(),
            active: HashMap::new(),
            listeners: HashMap::new(),
            connections: HashMap::new(),
            counters: HashMap::new(),
            latest: HashMap::new(),
            active_clients: 0,
            running: false,
            shutdown: CancellationToken::new(),
            next_generation: 0,
        }
    }

    fn is_current(&self, id: EndpointId, generation: u64) -> bool {
        self.active.get(&id).is_some_and(|run| run.generation == generation)
    }

    fn is_latest(&self, id: EndpointId, generation: u64) -> bool {
        self.latest.get(&id) == Some(&generation)
    }

    /// Release everything a run owns. `run` must already be out of `active`.
    fn teardown(&mut self, id: EndpointId, run: &ActiveRun) {
        run.cancel.cancel();
        if run.role == Role::Client {
            self.active_clients = self.active_clients.saturating_sub(1);
        }
        if let Some(status) = self.status.get_mut(&id) {
            if *status == EndpointStatus::Running {
                *status = EndpointStatus::Idle;
            }
        }
        if let Some(listener) = self.listeners.remove(&id) {
            listener.close();
        }
        if let Some(table) = self.connections.remove(&id) {
            table.close_all();
        }
    }

    fn publish(&mut self, running_tx: &watch::Sender<bool>) {
        self.running = self.active_clients > 0;
        running_tx.send_replace(self.running);
    }
}

/// Set of active endpoints and the global replay flag.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EngineSnapshot {
    /// Endpoints with a live task.
    pub active: BTreeSet<EndpointId>,
    /// Active client endpoints.
    pub active_clients: usize,
    /// True while any client is replaying.
    pub running: bool,
}

struct Shared<E: Environment> {
    trace: Arc<Trace>,
    config: EngineConfig,
    env: E,
    log: LogPipeline,
    state: Mutex<EngineState>,
    running_tx: watch::Sender<bool>,
}

/// Replay engine.
///
/// Cloning yields another handle to the same engine. All control methods
/// are synchronous and never fail: failures surface as endpoint status and
/// replay log lines.
pub struct Engine<E: Environment = SystemEnv> {
    shared: Arc<Shared<E>>,
}

impl<E: Environment> Clone for Engine<E> {
    fn clone(&self) -> Self {
        Self { shared: Arc::clone(&self.shared) }
    }
}

impl Engine<SystemEnv> {
    /// Create an engine on the system clock.
    ///
    /// Fails only if the log file cannot be opened.
    pub async fn new(
        trace: impl Into<Arc<Trace>>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        Self::with_env(trace, config, SystemEnv::new()).await
    }
}

impl<E: Environment> Engine<E> {
    /// Create an engine with a custom environment.
    pub async fn with_env(
        trace: impl Into<Arc<Trace>>,
        config: EngineConfig,
        env: E,
    ) -> Result<Self, EngineError> {
        let config = config.normalized();
        let log = LogPipeline::open(config.log_config()).await?;
        let trace = trace.into();
        trace.sender_index();

        let (running_tx, _) = watch::channel(false);

        tracing::info!(
            "Engine ready: {} endpoints, {} messages",
            trace.endpoints.len(),
            trace.messages.len()
        );

        Ok(Self {
            shared: Arc::new(Shared {
                trace,
                config,
                env,
                log,
                state: Mutex::new(EngineState::new()),
                running_tx,
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.shared.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start replaying an endpoint. No-op if it is already active.
    ///
    /// Unknown ids are logged and marked `Error`.
    pub fn start_endpoint(&self, id: EndpointId) {
        let Some(endpoint) = self.shared.trace.endpoint(id).cloned() else {
            self.state().status.insert(id, EndpointStatus::Error);
            self.log_error(format!("Endpoint {id} not found"));
            return;
        };

        let mut state = self.state();
        if state.active.contains_key(&id) {
            return;
        }

        state.next_generation += 1;
        let generation = state.next_generation;
        let cancel = state.shutdown.child_token();
        let shutdown = state.shutdown.clone();
        let counters = Arc::clone(state.counters.entry(id).or_default());

        state.active.insert(id, ActiveRun { role: endpoint.role, generation, cancel: cancel.clone() });
        state.latest.insert(id, generation);
        state.status.insert(id, EndpointStatus::Running);

        let table = if endpoint.role == Role::Client {
            state.active_clients += 1;
            let table = Arc::new(ConnectionTable::new());
            if let Some(stale) = state.connections.insert(id, Arc::clone(&table)) {
                stale.close_all();
            }
            Some(table)
        } else {
            None
        };
        state.publish(&self.shared.running_tx);
        drop(state);

        let ctx = RunContext { engine: self.clone(), endpoint, generation, cancel, shutdown, counters };
        match table {
            Some(table) => {
                tokio::spawn(client::run(ctx, table));
            },
            None => {
                tokio::spawn(server::run(ctx));
            },
        }
    }

    /// Stop an endpoint. No-op if it is not active.
    pub fn stop_endpoint(&self, id: EndpointId) {
        {
            let mut state = self.state();
            let Some(run) = state.active.remove(&id) else {
                return;
            };
            state.teardown(id, &run);
            state.publish(&self.shared.running_tx);
        }

        self.log_info(format!("Endpoint {id} stopped"));
    }

    /// Stop every endpoint and release all sockets.
    ///
    /// Installs a fresh shared token, so the engine can be restarted
    /// afterward.
    pub fn stop_all(&self) {
        {
            let mut state = self.state();
            // Shared token goes before run tokens: listeners exit silently.
            std::mem::replace(&mut state.shutdown, CancellationToken::new()).cancel();

            let runs: Vec<_> = state.active.drain().collect();
            for (id, run) in &runs {
                state.teardown(*id, run);
            }
            for (_, listener) in state.listeners.drain() {
                listener.close();
            }
            for (_, table) in state.connections.drain() {
                table.close_all();
            }
            state.active_clients = 0;
            state.publish(&self.shared.running_tx);
        }

        self.log_info("All endpoints stopped".to_string());
    }

    /// Stop everything and flush the log.
    pub async fn shutdown(&self) {
        self.stop_all();
        self.shared.log.close().await;
    }

    /// Status of an endpoint. Unknown or never-started ids are `Idle`.
    pub fn status(&self, id: EndpointId) -> EndpointStatus {
        self.state().status.get(&id).copied().unwrap_or_default()
    }

    /// Status of every endpoint in the trace, in declaration order.
    pub fn statuses(&self) -> Vec<(EndpointId, EndpointStatus)> {
        let state = self.state();
        self.shared
            .trace
            .endpoints
            .iter()
            .map(|ep| (ep.id, state.status.get(&ep.id).copied().unwrap_or_default()))
            .collect()
    }

    /// Returns true if the endpoint has a live task.
    pub fn is_running(&self, id: EndpointId) -> bool {
        self.state().active.contains_key(&id)
    }

    /// Returns true while any client is replaying.
    pub fn is_replaying(&self) -> bool {
        self.state().running
    }

    /// Number of active clients.
    pub fn active_client_count(&self) -> usize {
        self.state().active_clients
    }

    /// Consistent view of the active set and replay flag.
    pub fn snapshot(&self) -> EngineSnapshot {
        let state = self.state();
        EngineSnapshot {
            active: state.active.keys().copied().collect(),
            active_clients: state.active_clients,
            running: state.running,
        }
    }

    /// Traffic counters for an endpoint.
    pub fn stats(&self, id: EndpointId) -> EndpointStats {
        let state = self.state();
        let open = state.connections.get(&id).map_or(0, |table| table.len());
        state.counters.get(&id).map_or_else(EndpointStats::default, |c| c.snapshot(open))
    }

    /// Bound address of a server's listener, once it is up.
    pub fn listener_addr(&self, id: EndpointId) -> Option<SocketAddr> {
        self.state().listeners.get(&id).map(|listener| listener.local_addr)
    }

    /// Receiver for the global replay flag.
    pub fn watch_running(&self) -> watch::Receiver<bool> {
        self.shared.running_tx.subscribe()
    }

    /// Wait until no client is replaying.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.watch_running();
        // The sender lives as long as `self`.
        let _ = rx.wait_for(|running| !*running).await;
    }

    /// The replay log.
    pub fn log(&self) -> &LogPipeline {
        &self.shared.log
    }

    /// The trace being replayed.
    pub fn trace(&self) -> &Arc<Trace> {
        &self.shared.trace
    }

    /// Engine configuration after normalization.
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    pub(crate) fn env(&self) -> &E {
        &self.shared.env
    }

    pub(crate) fn log_info(&self, message: String) {
        tracing::debug!("{}", message);
        self.shared.log.write(message);
    }

    pub(crate) fn log_error(&self, message: String) {
        tracing::warn!("{}", message);
        self.shared.log.write(message);
    }

    pub(crate) fn is_current(&self, id: EndpointId, generation: u64) -> bool {
        self.state().is_current(id, generation)
    }

    /// A client ran out of messages.
    pub(crate) fn finish_run(&self, id: EndpointId, generation: u64) {
        let mut state = self.state();
        if !state.is_current(id, generation) {
            return;
        }
        let Some(run) = state.active.remove(&id) else {
            return;
        };
        if run.role == Role::Client {
            state.active_clients = state.active_clients.saturating_sub(1);
        }
        let status = state.status.entry(id).or_default();
        if *status != EndpointStatus::Error {
            *status = EndpointStatus::Completed;
        }
        state.publish(&self.shared.running_tx);
    }

    /// A run noticed it was stopped. Bookkeeping already happened in stop.
    pub(crate) fn mark_stopped(&self, id: EndpointId, generation: u64) {
        let mut state = self.state();
        if !state.is_latest(id, generation) {
            return;
        }
        if let Some(status) = state.status.get_mut(&id) {
            if *status == EndpointStatus::Running {
                *status = EndpointStatus::Idle;
            }
        }
    }

    /// A message failed. Ignored once the run has been stopped.
    pub(crate) fn mark_error(&self, id: EndpointId, generation: u64) {
        let mut state = self.state();
        if state.is_current(id, generation) {
            state.status.insert(id, EndpointStatus::Error);
        }
    }

    /// A server could not bind. The endpoint leaves the active set.
    pub(crate) fn fail_setup(&self, id: EndpointId, generation: u64) {
        let mut state = self.state();
        if !state.is_current(id, generation) {
            return;
        }
        if let Some(run) = state.active.remove(&id) {
            run.cancel.cancel();
        }
        state.status.insert(id, EndpointStatus::Error);
    }

    /// Record a freshly bound listener. Returns false if the run was
    /// stopped during bind, in which case the caller drops the socket.
    pub(crate) fn register_listener(
        &self,
        id: EndpointId,
        generation: u64,
        handle: ListenerHandle,
    ) -> bool {
        let mut state = self.state();
        if !state.is_current(id, generation) {
            return false;
        }
        if let Some(previous) = state.listeners.insert(id, handle) {
            previous.close();
        }
        true
    }

    pub(crate) fn has_listener(&self, id: EndpointId) -> bool {
        self.state().listeners.contains_key(&id)
    }
}

impl<E: Environment> std::fmt::Debug for Engine<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("snapshot", &self.snapshot()).finish_non_exhaustive()
    }
}
