//! Connection supervisor
//!
//! Owns one client's transport handle and drives its lifecycle:
//!
//! - at most one connect attempt is in flight; concurrent callers share its
//!   outcome, and a reinitialize supersedes a plain connect
//! - transport events move the state machine and the readiness gate
//! - non-logout disconnects reconnect after a short delay; logout-class
//!   disconnects wait for a fresh pairing
//! - outright connect failures are retried with bounded exponential backoff
//! - when the transport never says READY, readiness is inferred from status
//!   probes and logged as such
//!
//! Events from a superseded transport session are dropped by generation.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use super::fallback::PollerSignal;
use super::observers::Observers;
use super::readiness::ReadinessGate;
use super::retry::RetryBudget;
use super::state::{ConnectionState, DisconnectReason};
use super::timer::ScheduledTask;
use crate::config::GatewayConfig;
use crate::session::{ClientSession, SessionStore};
use crate::transport::{
    Connector, EventSink, OpenRequest, TransportError, TransportEvent, TransportHandle,
    TransportState,
};
use crate::types::{GatewayError, Result};

type AttemptOutcome = Shared<BoxFuture<'static, Result<()>>>;

/// Why a connect attempt was started
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptKind {
    Connect,
    HardInitRetry,
    Reconnect,
    Reinitialize,
}

impl AttemptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connect => "connect",
            Self::HardInitRetry => "hard-init-retry",
            Self::Reconnect => "reconnect",
            Self::Reinitialize => "reinitialize",
        }
    }

    /// Attempts that spend the hard-init budget when they fail outright
    fn counts_toward_hard_init(&self) -> bool {
        matches!(self, Self::Connect | Self::HardInitRetry)
    }
}

impl fmt::Display for AttemptKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`ConnectionSupervisor::reinitialize`]
#[derive(Debug, Clone, Default)]
pub struct ReinitializeOptions {
    /// Log out and delete stored credentials first.
    /// `None` falls back to the configured default.
    pub clear_session: Option<bool>,
    pub trigger: Option<String>,
    pub reason: Option<String>,
}

impl ReinitializeOptions {
    pub fn clearing_session() -> Self {
        Self {
            clear_session: Some(true),
            ..Self::default()
        }
    }

    pub fn keeping_session() -> Self {
        Self {
            clear_session: Some(false),
            ..Self::default()
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.trigger = Some(trigger.into());
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Result of probing the live transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Connected,
    /// UNKNOWN or CLOSING: the session may or may not be salvageable
    Ambiguous(TransportState),
    /// `None` when there is no transport handle at all
    NotConnected(Option<TransportState>),
    Failed(String),
}

struct InFlight {
    id: u64,
    kind: AttemptKind,
    started_at: Instant,
    outcome: AttemptOutcome,
    abort: AbortHandle,
}

struct Slots {
    handle: Option<Arc<dyn TransportHandle>>,
    /// Attempt id whose transport events are current
    generation: u64,
    next_attempt: u64,
    in_flight: Option<InFlight>,
    hard_init: RetryBudget,
    pump: Option<AbortHandle>,
    auth_ready_timer: Option<ScheduledTask>,
    reconnect_timer: Option<ScheduledTask>,
    hard_init_timer: Option<ScheduledTask>,
    /// Set by an explicit disconnect; automatic recovery stays off until the
    /// next explicit connect or reinitialize.
    suspended: bool,
    shut_down: bool,
}

struct SupervisorInner {
    session: ClientSession,
    config: Arc<GatewayConfig>,
    connector: Arc<dyn Connector>,
    store: SessionStore,
    gate: ReadinessGate,
    state_tx: watch::Sender<ConnectionState>,
    observers: Observers,
    poller: Arc<PollerSignal>,
    slots: Mutex<Slots>,
}

/// Lifecycle owner for a single gateway client
#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ConnectionSupervisor {
    pub fn new(
        session: ClientSession,
        config: Arc<GatewayConfig>,
        connector: Arc<dyn Connector>,
        store: SessionStore,
        poller: Arc<PollerSignal>,
    ) -> Self {
        let hard_init = RetryBudget::new(
            config.hard_init_max_attempts,
            config.hard_init_base_delay,
            config.hard_init_max_delay,
        );
        let (state_tx, _) = watch::channel(ConnectionState::Init);
        Self {
            inner: Arc::new(SupervisorInner {
                gate: ReadinessGate::new(session.client_id.clone()),
                session,
                config,
                connector,
                store,
                state_tx,
                observers: Observers::default(),
                poller,
                slots: Mutex::new(Slots {
                    handle: None,
                    generation: 0,
                    next_attempt: 0,
                    in_flight: None,
                    hard_init,
                    pump: None,
                    auth_ready_timer: None,
                    reconnect_timer: None,
                    hard_init_timer: None,
                    suspended: false,
                    shut_down: false,
                }),
            }),
        }
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.inner
            .slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn client_id(&self) -> &str {
        &self.inner.session.client_id
    }

    pub fn session(&self) -> &ClientSession {
        &self.inner.session
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    pub fn gate(&self) -> &ReadinessGate {
        &self.inner.gate
    }

    pub fn observers(&self) -> &Observers {
        &self.inner.observers
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        self.inner.gate.is_ready()
    }

    pub fn awaiting_pairing(&self) -> bool {
        self.inner.gate.awaiting_pairing()
    }

    pub fn is_suspended(&self) -> bool {
        self.slots().suspended
    }

    pub fn has_in_flight(&self) -> bool {
        self.slots().in_flight.is_some()
    }

    /// How long the current connect attempt has been running
    pub fn in_flight_duration(&self) -> Option<Duration> {
        self.slots()
            .in_flight
            .as_ref()
            .map(|flight| flight.started_at.elapsed())
    }

    pub fn hard_init_attempts(&self) -> u32 {
        self.slots().hard_init.attempt_count()
    }

    pub(crate) fn current_handle(&self) -> Option<Arc<dyn TransportHandle>> {
        self.slots().handle.clone()
    }

    pub async fn has_persisted_session(&self) -> bool {
        self.inner
            .store
            .has_persisted_session(self.client_id())
            .await
    }

    // =========================================================================
    // Public lifecycle operations
    // =========================================================================

    /// Connect, or join the attempt already in flight.
    ///
    /// Resolves once the client is READY; fails on authentication failure,
    /// disconnect, missing dependency, or connect timeout.
    pub async fn connect(&self) -> Result<()> {
        loop {
            if self.is_ready() {
                return Ok(());
            }
            let outcome = self.start_attempt(AttemptKind::Connect, ReinitializeOptions::default())?;
            match outcome.await {
                // superseded by a reinitialize: follow the new attempt
                Err(GatewayError::Cancelled) if self.has_in_flight() || self.is_ready() => continue,
                result => return result,
            }
        }
    }

    /// Tear down the current session and connect again.
    ///
    /// Joins a reinitialize that is already running.
    pub async fn reinitialize(&self, options: ReinitializeOptions) -> Result<()> {
        let outcome = self.start_attempt(AttemptKind::Reinitialize, options)?;
        outcome.await
    }

    /// Start a non-destructive reconnect without waiting for it
    pub fn request_reconnect(&self, trigger: &str) -> bool {
        let options = ReinitializeOptions::keeping_session().with_trigger(trigger);
        match self.start_attempt(AttemptKind::Reconnect, options) {
            Ok(_) => true,
            Err(e) => {
                debug!(client_id = %self.client_id(), trigger, "Reconnect not started: {}", e);
                false
            }
        }
    }

    /// Close the transport without logging out. Automatic recovery stays off
    /// until the next explicit connect or reinitialize.
    pub async fn disconnect(&self) -> Result<()> {
        let handle = {
            let mut slots = self.slots();
            if let Some(flight) = slots.in_flight.take() {
                flight.abort.abort();
            }
            if let Some(pump) = slots.pump.take() {
                pump.abort();
            }
            slots.auth_ready_timer = None;
            slots.reconnect_timer = None;
            slots.hard_init_timer = None;
            slots.next_attempt += 1;
            slots.generation = slots.next_attempt;
            slots.suspended = true;
            slots.handle.take()
        };
        self.inner.gate.mark_not_ready();
        if let Some(handle) = handle {
            if let Err(e) = handle.close().await {
                warn!(client_id = %self.client_id(), "Transport close failed: {}", e);
            }
        }
        let reason = DisconnectReason::ConnectionClosed;
        self.inner.gate.record_disconnect(&reason);
        self.transition(ConnectionState::Disconnected {
            reason: reason.clone(),
        });
        info!(client_id = %self.client_id(), "Client disconnected");
        self.inner.observers.notify_disconnected(self.client_id(), &reason);
        Ok(())
    }

    /// Disconnect and refuse all further attempts
    pub async fn shutdown(&self) {
        self.slots().shut_down = true;
        let _ = self.disconnect().await;
    }

    /// Wait until the client is READY.
    ///
    /// Tries a status-probe inference first so a missed ready event does not
    /// block sends. The inference and the wait share one deadline. Fails
    /// immediately in FATAL.
    pub async fn wait_for_ready(&self, timeout: Option<Duration>) -> Result<()> {
        let timeout = timeout.unwrap_or(self.inner.config.ready_timeout);
        if self.is_ready() {
            return Ok(());
        }
        if self.state().is_fatal() {
            return Err(self.not_ready_error(Duration::ZERO));
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let mut waiter = self.inner.gate.register();
        match tokio::time::timeout_at(deadline, self.infer_ready("pre-wait")).await {
            Ok(true) => return Ok(()),
            Ok(false) => {}
            Err(_) => debug!(client_id = %self.client_id(), "Readiness inference outlasted the wait"),
        }

        match tokio::time::timeout_at(deadline, waiter.wait()).await {
            Ok(true) => Ok(()),
            Ok(false) => Err(GatewayError::Shutdown(self.client_id().to_string())),
            Err(_) => {
                drop(waiter);
                if self.is_ready() {
                    return Ok(());
                }
                let err = self.not_ready_error(started.elapsed());
                error!(client_id = %self.client_id(), "{}", err);
                Err(err)
            }
        }
    }

    /// Mark READY if a status probe says the transport is usable
    pub async fn infer_ready(&self, context: &str) -> bool {
        if self.is_ready() {
            return true;
        }
        let Some(handle) = self.current_handle() else {
            return false;
        };

        let mut source = None;
        match self.status_call("is_ready", handle.is_ready()).await {
            Ok(true) => source = Some("probe:is-ready".to_string()),
            Ok(false) => {}
            Err(e) => debug!(client_id = %self.client_id(), "is_ready probe failed: {}", e),
        }
        if source.is_none() {
            match self.status_call("state", handle.state()).await {
                Ok(state) if state.is_connected() => source = Some(format!("probe:state-{}", state)),
                Ok(_) => {}
                Err(e) => debug!(client_id = %self.client_id(), "state probe failed: {}", e),
            }
        }

        match source {
            Some(source) => {
                warn!(
                    client_id = %self.client_id(),
                    source = %source,
                    context,
                    "Readiness inferred from a status probe without a ready event"
                );
                self.mark_ready(&source)
            }
            None => false,
        }
    }

    /// Probe the live transport without changing any state
    pub async fn probe(&self) -> ProbeOutcome {
        let Some(handle) = self.current_handle() else {
            return ProbeOutcome::NotConnected(None);
        };
        match self.status_call("is_ready", handle.is_ready()).await {
            Ok(true) => return ProbeOutcome::Connected,
            Ok(false) => {}
            Err(e) => debug!(client_id = %self.client_id(), "is_ready probe failed: {}", e),
        }
        match self.status_call("state", handle.state()).await {
            Ok(state) if state.is_connected() => ProbeOutcome::Connected,
            Ok(state) if state.is_ambiguous() => ProbeOutcome::Ambiguous(state),
            Ok(state) => ProbeOutcome::NotConnected(Some(state)),
            Err(e) => ProbeOutcome::Failed(e),
        }
    }

    /// Run one transport status call under the configured time limit
    async fn status_call<T, F>(&self, call: &str, status: F) -> std::result::Result<T, String>
    where
        F: Future<Output = std::result::Result<T, TransportError>>,
    {
        let limit = self.inner.config.probe_timeout;
        match tokio::time::timeout(limit, status).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(_) => {
                warn!(
                    client_id = %self.client_id(),
                    call,
                    timeout_ms = limit.as_millis() as u64,
                    "Transport status call timed out"
                );
                Err(format!("{} timed out after {}ms", call, limit.as_millis()))
            }
        }
    }

    /// Transition to READY, cancel pending recovery, and wake waiters.
    ///
    /// Returns `true` if this call made the client ready.
    pub fn mark_ready(&self, source: &str) -> bool {
        let current = self.state();
        if current == ConnectionState::Ready {
            self.inner.gate.mark_ready(source);
            return false;
        }
        if !current.can_transition_to(&ConnectionState::Ready) {
            debug!(client_id = %self.client_id(), state = %current, source, "Ignoring ready signal");
            return false;
        }
        {
            let mut slots = self.slots();
            slots.auth_ready_timer = None;
            slots.reconnect_timer = None;
            slots.hard_init_timer = None;
            slots.hard_init.reset();
        }
        self.transition(ConnectionState::Ready);
        self.inner.gate.mark_ready(source);
        self.inner.poller.reset_budgets();
        info!(client_id = %self.client_id(), source, "Client READY");
        self.inner.observers.notify_ready(self.client_id(), source);
        true
    }

    pub(crate) fn not_ready_error(&self, waited: Duration) -> GatewayError {
        let state = self.state();
        GatewayError::NotReady(Box::new(self.inner.gate.timeout_error(
            waited,
            &state,
            &self.inner.session.session_path_display(),
        )))
    }

    // =========================================================================
    // Connect attempts
    // =========================================================================

    fn start_attempt(&self, kind: AttemptKind, options: ReinitializeOptions) -> Result<AttemptOutcome> {
        let mut slots = self.slots();
        if slots.shut_down {
            return Err(GatewayError::Shutdown(self.client_id().to_string()));
        }
        if let Some(current) = slots.in_flight.as_ref() {
            let supersede =
                kind == AttemptKind::Reinitialize && current.kind != AttemptKind::Reinitialize;
            if !supersede {
                debug!(
                    client_id = %self.client_id(),
                    attempt = current.id,
                    running = %current.kind,
                    requested = %kind,
                    "Joining in-flight connect attempt"
                );
                return Ok(current.outcome.clone());
            }
            info!(
                client_id = %self.client_id(),
                superseded = current.id,
                running = %current.kind,
                "Reinitialize supersedes in-flight connect attempt"
            );
            current.abort.abort();
            slots.in_flight = None;
        }

        slots.suspended = false;
        slots.reconnect_timer = None;
        if kind == AttemptKind::Reinitialize {
            slots.hard_init.reset();
            slots.hard_init_timer = None;
        }
        slots.next_attempt += 1;
        let id = slots.next_attempt;

        let supervisor = self.clone();
        let task = tokio::spawn(async move {
            let result = supervisor.run_attempt(id, kind, options).await;
            supervisor.finish_attempt(id, kind, &result);
            result
        });
        let abort = task.abort_handle();
        let outcome = async move {
            match task.await {
                Ok(result) => result,
                Err(e) if e.is_cancelled() => Err(GatewayError::Cancelled),
                Err(e) => Err(GatewayError::Internal(format!("connect attempt failed: {}", e))),
            }
        }
        .boxed()
        .shared();

        slots.in_flight = Some(InFlight {
            id,
            kind,
            started_at: Instant::now(),
            outcome: outcome.clone(),
            abort,
        });
        Ok(outcome)
    }

    async fn run_attempt(
        &self,
        id: u64,
        kind: AttemptKind,
        options: ReinitializeOptions,
    ) -> Result<()> {
        let client_id = self.client_id().to_string();
        let clear_session = kind == AttemptKind::Reinitialize
            && options
                .clear_session
                .unwrap_or(self.inner.config.clear_session_on_reinit);
        info!(
            client_id = %client_id,
            attempt = id,
            kind = %kind,
            trigger = options.trigger.as_deref().unwrap_or(kind.as_str()),
            reason = options.reason.as_deref().unwrap_or(""),
            clear_session,
            "Starting connect attempt"
        );

        self.inner.gate.mark_not_ready();
        self.transition(ConnectionState::Connecting);
        self.inner.poller.rearm();

        let (previous, pump) = {
            let mut slots = self.slots();
            slots.generation = id;
            slots.auth_ready_timer = None;
            (slots.handle.take(), slots.pump.take())
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        if let Some(handle) = previous {
            let teardown = if clear_session {
                handle.logout().await
            } else {
                handle.close().await
            };
            if let Err(e) = teardown {
                warn!(client_id = %client_id, "Transport teardown failed: {}", e);
            }
        }
        if clear_session {
            if let Err(e) = self.inner.store.clear(&client_id).await {
                warn!(client_id = %client_id, "Failed to clear stored session: {}", e);
            }
        }

        let session_path = match self.inner.store.ensure(&client_id).await {
            Ok(path) => path,
            Err(e) => {
                self.fail_attempt(id, DisconnectReason::ConnectFailed);
                return Err(e);
            }
        };

        let (events, rx) = EventSink::channel();
        let request = OpenRequest {
            client_id: client_id.clone(),
            session_path,
        };
        let handle = match self.inner.connector.open(request, events).await {
            Ok(handle) => handle,
            Err(e) if e.is_fatal() => {
                let message = e.to_string();
                self.enter_fatal(&message);
                return Err(GatewayError::Fatal(message));
            }
            Err(e) => {
                warn!(client_id = %client_id, attempt = id, "Transport open failed: {}", e);
                self.fail_attempt(id, DisconnectReason::ConnectFailed);
                return Err(GatewayError::ConnectFailed {
                    client_id,
                    message: e.to_string(),
                });
            }
        };

        let stale = {
            let mut slots = self.slots();
            if slots.generation == id {
                slots.handle = Some(Arc::clone(&handle));
                // events buffered during open are replayed once the handle is stored
                let pump = tokio::spawn(pump_events(Arc::downgrade(&self.inner), id, rx));
                slots.pump = Some(pump.abort_handle());
                false
            } else {
                true
            }
        };
        if stale {
            let _ = handle.close().await;
            return Err(GatewayError::Cancelled);
        }

        self.await_outcome(id).await
    }

    /// Follow the state machine until the attempt resolves.
    ///
    /// The connect timeout is suspended while a pairing code is outstanding
    /// and restarts afterwards.
    async fn await_outcome(&self, id: u64) -> Result<()> {
        let timeout = self.inner.config.connect_timeout;
        let mut rx = self.inner.state_tx.subscribe();
        let mut deadline = Some(Instant::now() + timeout);
        loop {
            let current = rx.borrow_and_update().clone();
            match current {
                ConnectionState::Ready => return Ok(()),
                ConnectionState::AuthFailed { message } => {
                    return Err(GatewayError::AuthFailed(
                        message.unwrap_or_else(|| "authentication failure".to_string()),
                    ))
                }
                ConnectionState::Disconnected { reason } => {
                    return Err(GatewayError::Disconnected(reason))
                }
                ConnectionState::Fatal { message } => return Err(GatewayError::Fatal(message)),
                ConnectionState::AwaitingPairing { .. } => deadline = None,
                ConnectionState::Init
                | ConnectionState::Connecting
                | ConnectionState::Authenticating => {
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + timeout);
                    }
                }
            }

            let changed = match deadline {
                Some(at) => match tokio::time::timeout_at(at, rx.changed()).await {
                    Ok(changed) => changed,
                    Err(_) => {
                        warn!(
                            client_id = %self.client_id(),
                            attempt = id,
                            timeout_ms = timeout.as_millis() as u64,
                            "Connect attempt timed out"
                        );
                        self.fail_attempt(id, DisconnectReason::TimedOut);
                        return Err(GatewayError::ConnectTimeout {
                            client_id: self.client_id().to_string(),
                            after: timeout,
                        });
                    }
                },
                None => rx.changed().await,
            };
            if changed.is_err() {
                return Err(GatewayError::Internal("state channel closed".to_string()));
            }
        }
    }

    fn finish_attempt(&self, id: u64, kind: AttemptKind, result: &Result<()>) {
        let mut slots = self.slots();
        if slots.in_flight.as_ref().map(|flight| flight.id) == Some(id) {
            slots.in_flight = None;
        }
        let Err(err) = result else {
            debug!(client_id = %self.client_id(), attempt = id, kind = %kind, "Connect attempt succeeded");
            return;
        };

        match err {
            GatewayError::Cancelled | GatewayError::Shutdown(_) => {}
            GatewayError::Fatal(_) => {}
            GatewayError::AuthFailed(_) | GatewayError::Disconnected(_) => {
                self.inner.gate.record_connect_error(err.to_string());
                warn!(client_id = %self.client_id(), attempt = id, kind = %kind, "Connect attempt ended: {}", err);
            }
            _ if kind.counts_toward_hard_init() && !slots.shut_down => {
                self.inner.gate.record_connect_error(err.to_string());
                self.schedule_hard_init_retry(&mut slots, err);
            }
            _ => {
                self.inner.gate.record_connect_error(err.to_string());
                warn!(
                    client_id = %self.client_id(),
                    attempt = id,
                    kind = %kind,
                    "Connect attempt failed: {}; fallback poller will recover",
                    err
                );
            }
        }
    }

    fn schedule_hard_init_retry(&self, slots: &mut Slots, err: &GatewayError) {
        let max = slots.hard_init.max_attempts();
        let failures = slots.hard_init.record_attempt();
        match failures {
            Some(failure) if !slots.hard_init.is_exhausted() => {
                let delay = slots.hard_init.backoff_delay(failure);
                warn!(
                    client_id = %self.client_id(),
                    failure,
                    max,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Hard init failure; scheduling retry"
                );
                let weak = Arc::downgrade(&self.inner);
                slots.hard_init_timer = Some(ScheduledTask::after(delay, "hard-init-retry", async move {
                    if let Some(inner) = weak.upgrade() {
                        ConnectionSupervisor { inner }.run_hard_init_retry();
                    }
                }));
            }
            _ => {
                let attempts = slots.hard_init.attempt_count();
                error!(
                    client_id = %self.client_id(),
                    attempts,
                    max,
                    error = %err,
                    session_path = %self.inner.session.session_path_display(),
                    "Hard init retries exhausted; giving up until reinitialized"
                );
                self.inner.gate.record_connect_error(format!(
                    "hard init retries exhausted after {} attempt(s): {}",
                    attempts, err
                ));
            }
        }
    }

    fn run_hard_init_retry(&self) {
        if self.is_ready() || self.has_in_flight() || self.state().is_fatal() {
            debug!(client_id = %self.client_id(), "Hard init retry no longer needed");
            return;
        }
        if let Err(e) = self.start_attempt(AttemptKind::HardInitRetry, ReinitializeOptions::default()) {
            debug!(client_id = %self.client_id(), "Hard init retry not started: {}", e);
        }
    }

    fn fail_attempt(&self, id: u64, reason: DisconnectReason) {
        if self.slots().generation != id {
            return;
        }
        self.inner.gate.mark_not_ready();
        self.inner.gate.record_disconnect(&reason);
        self.transition(ConnectionState::Disconnected { reason });
    }

    fn enter_fatal(&self, message: &str) {
        error!(
            client_id = %self.client_id(),
            error = message,
            "Missing local dependency; no retries until reinitialized"
        );
        {
            let mut slots = self.slots();
            slots.hard_init_timer = None;
            slots.reconnect_timer = None;
        }
        self.inner.gate.mark_not_ready();
        self.inner.gate.record_connect_error(message);
        self.transition(ConnectionState::Fatal {
            message: message.to_string(),
        });
    }

    // =========================================================================
    // Transport events
    // =========================================================================

    fn handle_event(&self, generation: u64, event: TransportEvent) {
        {
            let slots = self.slots();
            if slots.generation != generation || slots.shut_down {
                trace!(client_id = %self.client_id(), generation, "Dropping event from superseded session");
                return;
            }
        }
        match event {
            TransportEvent::PairingChallenge(code) => self.on_pairing_challenge(code),
            TransportEvent::Authenticated => self.on_authenticated(),
            TransportEvent::Ready => {
                self.mark_ready("event:ready");
            }
            TransportEvent::Disconnected(raw) => self.on_disconnected(DisconnectReason::parse(&raw)),
            TransportEvent::AuthFailure(message) => self.on_auth_failure(message),
            TransportEvent::StateChanged(state) => self.on_state_changed(state),
            TransportEvent::MessageReceived(_) => {
                trace!(client_id = %self.client_id(), "Ignoring inbound message");
            }
        }
    }

    fn on_pairing_challenge(&self, code: String) {
        self.slots().auth_ready_timer = None;
        self.inner.gate.mark_not_ready();
        self.inner.gate.record_pairing_challenge();
        self.transition(ConnectionState::AwaitingPairing { code: code.clone() });
        info!(
            client_id = %self.client_id(),
            pairing_code = %code,
            "Pairing challenge received; scan the code to link this client"
        );
        self.inner.poller.rearm();
        self.inner.observers.notify_pairing(self.client_id(), &code);
    }

    fn on_authenticated(&self) {
        self.inner.gate.clear_pairing();
        if !self.transition(ConnectionState::Authenticating) {
            return;
        }
        let timeout = self.inner.config.auth_ready_timeout;
        info!(
            client_id = %self.client_id(),
            timeout_ms = timeout.as_millis() as u64,
            "Authenticated; waiting for ready signal"
        );
        let weak = Arc::downgrade(&self.inner);
        self.slots().auth_ready_timer = Some(ScheduledTask::after(timeout, "auth-ready", async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let supervisor = ConnectionSupervisor { inner };
            if supervisor.is_ready() {
                return;
            }
            warn!(
                client_id = %supervisor.client_id(),
                timeout_ms = timeout.as_millis() as u64,
                "No ready signal after authentication; probing transport"
            );
            if !supervisor.infer_ready("auth-ready-timeout").await {
                warn!(
                    client_id = %supervisor.client_id(),
                    "Probe did not confirm readiness; connect timeout and fallback poller will recover"
                );
            }
        }));
    }

    fn on_disconnected(&self, reason: DisconnectReason) {
        self.slots().auth_ready_timer = None;
        self.inner.gate.mark_not_ready();
        self.inner.gate.record_disconnect(&reason);
        self.transition(ConnectionState::Disconnected {
            reason: reason.clone(),
        });
        self.inner.poller.rearm();
        self.inner.observers.notify_disconnected(self.client_id(), &reason);

        if reason.is_logout_class() {
            warn!(
                client_id = %self.client_id(),
                reason = %reason,
                "Logged out; waiting for a fresh pairing before reconnecting"
            );
            return;
        }

        let delay = self.inner.config.reconnect_delay;
        warn!(
            client_id = %self.client_id(),
            reason = %reason,
            delay_ms = delay.as_millis() as u64,
            "Disconnected; scheduling reconnect"
        );
        let weak = Arc::downgrade(&self.inner);
        self.slots().reconnect_timer = Some(ScheduledTask::after(delay, "reconnect", async move {
            if let Some(inner) = weak.upgrade() {
                ConnectionSupervisor { inner }.run_scheduled_reconnect();
            }
        }));
    }

    fn run_scheduled_reconnect(&self) {
        if self.is_ready()
            || self.awaiting_pairing()
            || self.has_in_flight()
            || self.is_suspended()
            || self.state().is_fatal()
        {
            debug!(client_id = %self.client_id(), "Scheduled reconnect skipped");
            return;
        }
        self.request_reconnect("disconnect");
    }

    fn on_auth_failure(&self, message: Option<String>) {
        {
            let mut slots = self.slots();
            slots.auth_ready_timer = None;
            slots.reconnect_timer = None;
        }
        self.inner.gate.mark_not_ready();
        self.inner.gate.record_auth_failure(message.clone());
        self.transition(ConnectionState::AuthFailed {
            message: message.clone(),
        });
        error!(
            client_id = %self.client_id(),
            error = message.as_deref().unwrap_or("unknown"),
            "Authentication failed; a fresh pairing or reinitialize is required"
        );
        self.inner.poller.rearm();
    }

    fn on_state_changed(&self, state: TransportState) {
        match state {
            TransportState::Connected => {
                self.mark_ready("event:state-connected");
            }
            TransportState::Closing | TransportState::Closed => {
                let was_ready = self.inner.gate.mark_not_ready();
                info!(client_id = %self.client_id(), state = %state, "Transport closing; marked not ready");
                if was_ready {
                    let reason = DisconnectReason::ConnectionClosed;
                    self.inner.gate.record_disconnect(&reason);
                    self.transition(ConnectionState::Disconnected { reason });
                }
                self.inner.poller.rearm();
            }
            TransportState::Opening | TransportState::Unknown => {
                debug!(client_id = %self.client_id(), state = %state, "Transport state changed");
            }
        }
    }

    /// Apply a state transition if the table allows it
    fn transition(&self, next: ConnectionState) -> bool {
        let client_id = self.client_id();
        let mut applied = false;
        self.inner.state_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            if !current.can_transition_to(&next) {
                debug!(client_id, from = %current, to = %next, "Ignoring illegal transition");
                return false;
            }
            info!(client_id, from = %current, to = %next, "State transition");
            *current = next;
            applied = true;
            true
        });
        applied
    }
}

async fn pump_events(
    inner: Weak<SupervisorInner>,
    generation: u64,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        ConnectionSupervisor { inner }.handle_event(generation, event);
    }
}
