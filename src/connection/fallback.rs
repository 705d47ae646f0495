//! Fallback readiness poller
//!
//! A periodic safety net for clients that never receive (or missed) the
//! transport's ready signal. Each check is bounded:
//!
//! - a READY client parks the poller until it becomes not-ready again
//! - a connect that has been in flight too long is forcibly reinitialized,
//!   unless a pairing code was issued moments ago
//! - a not-connected probe is re-checked a few times with random spacing,
//!   then answered with a non-destructive reconnect
//! - reconnects are limited per cooldown window
//! - only repeated *ambiguous* probes (UNKNOWN / CLOSING) with credentials on
//!   disk escalate to one destructive reinitialize
//!
//! Pattern follows the heartbeat service: a spawned loop over a sleep, with
//! all decision logic in a directly testable `check_once`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::retry::RetryBudget;
use super::state::ConnectionState;
use super::supervisor::{ConnectionSupervisor, ProbeOutcome, ReinitializeOptions};
use crate::config::GatewayConfig;

/// Wake-up channel from the supervisor to its poller
#[derive(Debug, Default)]
pub struct PollerSignal {
    rearm: Notify,
    reset: AtomicBool,
}

impl PollerSignal {
    /// The client became not-ready; resume checking if parked
    pub fn rearm(&self) {
        self.rearm.notify_one();
    }

    /// The client became ready; poller budgets start over
    pub fn reset_budgets(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }
}

/// What the poller does after a check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextCheck {
    After(Duration),
    /// Sleep until rearmed
    Park,
    Cooldown(Duration),
}

struct PollerBudgets {
    probe_retries: RetryBudget,
    reinit: RetryBudget,
    ambiguous_cycles: u32,
}

impl PollerBudgets {
    fn reset_all(&mut self) {
        self.probe_retries.reset();
        self.reinit.reset();
        self.ambiguous_cycles = 0;
    }

    /// Remaining cooldown; resets every counter once it has elapsed
    fn cooldown_remaining(&mut self, now: Instant) -> Option<Duration> {
        match self.reinit.cooldown_until() {
            Some(until) if now < until => Some(until - now),
            Some(_) => {
                self.reset_all();
                None
            }
            None => None,
        }
    }
}

pub struct FallbackPoller {
    supervisor: ConnectionSupervisor,
    signal: Arc<PollerSignal>,
    config: Arc<GatewayConfig>,
    budgets: Mutex<PollerBudgets>,
}

impl FallbackPoller {
    pub fn new(
        supervisor: ConnectionSupervisor,
        signal: Arc<PollerSignal>,
        config: Arc<GatewayConfig>,
    ) -> Self {
        let budgets = PollerBudgets {
            probe_retries: RetryBudget::new(
                config.fallback_state_retries,
                config.fallback_retry_min_delay,
                config.fallback_retry_max_delay,
            ),
            reinit: RetryBudget::new(
                config.fallback_reinit_attempts,
                config.fallback_delay,
                config.fallback_delay,
            )
            .with_cooldown(config.fallback_cooldown),
            ambiguous_cycles: 0,
        };
        Self {
            supervisor,
            signal,
            config,
            budgets: Mutex::new(budgets),
        }
    }

    fn budgets(&self) -> MutexGuard<'_, PollerBudgets> {
        self.budgets
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start the poller loop
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        info!(
            client_id = %self.supervisor.client_id(),
            interval_ms = self.config.fallback_delay.as_millis() as u64,
            "Starting fallback readiness poller"
        );
        tokio::spawn(async move { self.run().await })
    }

    async fn run(&self) {
        let base = self.config.fallback_delay;
        let mut next = NextCheck::After(base);
        loop {
            match next {
                NextCheck::After(delay) | NextCheck::Cooldown(delay) => {
                    tokio::time::sleep(delay).await;
                }
                NextCheck::Park => {
                    debug!(client_id = %self.supervisor.client_id(), "Fallback poller parked");
                    self.signal.rearm.notified().await;
                    next = NextCheck::After(base);
                    continue;
                }
            }
            next = self.check_once().await;
        }
    }

    /// Run one fallback check and decide when to run the next
    pub async fn check_once(&self) -> NextCheck {
        let base = self.config.fallback_delay;
        let supervisor = &self.supervisor;
        let client_id = supervisor.client_id();

        if self.signal.take_reset() {
            self.budgets().reset_all();
        }
        if let Some(remaining) = self.budgets().cooldown_remaining(Instant::now()) {
            debug!(client_id, remaining_ms = remaining.as_millis() as u64, "Fallback cooldown active");
            return NextCheck::Cooldown(remaining);
        }

        if supervisor.is_ready() {
            self.budgets().reset_all();
            debug!(client_id, "Fallback check: client ready");
            return NextCheck::Park;
        }
        if supervisor.is_suspended() {
            debug!(client_id, "Fallback check: client disconnected on request");
            return NextCheck::Park;
        }

        if let Some(elapsed) = supervisor.in_flight_duration() {
            return self.check_in_flight(elapsed);
        }

        match supervisor.state() {
            ConnectionState::Fatal { message } => {
                warn!(client_id, error = %message, "Fallback check: missing dependency; parked until reinitialized");
                return NextCheck::Park;
            }
            ConnectionState::AuthFailed { .. } => {
                warn!(client_id, "Fallback check: authentication failed; parked until a fresh pairing");
                return NextCheck::Park;
            }
            _ => {}
        }

        if supervisor.awaiting_pairing() {
            let reason = supervisor
                .gate()
                .snapshot()
                .last_disconnect_reason
                .map(|r| r.to_string())
                .unwrap_or_else(|| "pairing".to_string());
            warn!(client_id, reason = %reason, "Fallback check: awaiting pairing; no corrective action");
            return NextCheck::After(base);
        }

        let (ambiguous, observed) = match supervisor.probe().await {
            ProbeOutcome::Connected => {
                info!(client_id, "Fallback probe reports connected");
                supervisor.mark_ready("fallback-probe");
                self.budgets().reset_all();
                return NextCheck::Park;
            }
            ProbeOutcome::Failed(e) => {
                warn!(client_id, "Fallback probe failed: {}; deferring", e);
                return NextCheck::After(base);
            }
            ProbeOutcome::Ambiguous(state) => (true, state.to_string()),
            ProbeOutcome::NotConnected(state) => (
                false,
                state
                    .map(|s| s.to_string())
                    .unwrap_or_else(|| "NO_HANDLE".to_string()),
            ),
        };

        let (attempt, max_attempts, cycles) = {
            let mut budgets = self.budgets();
            if let Some(retry) = budgets.probe_retries.record_attempt() {
                let delay = budgets.probe_retries.randomized_delay();
                warn!(
                    client_id,
                    state = %observed,
                    retry,
                    max = budgets.probe_retries.max_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Fallback probe not connected; re-checking"
                );
                return NextCheck::After(delay);
            }
            budgets.probe_retries.reset();

            if budgets.reinit.is_exhausted() {
                let cooldown = budgets.reinit.start_cooldown(Instant::now());
                warn!(
                    client_id,
                    state = %observed,
                    attempts = budgets.reinit.attempt_count(),
                    cooldown_ms = cooldown.as_millis() as u64,
                    "Fallback reconnect budget exhausted; cooling down"
                );
                return NextCheck::Cooldown(cooldown);
            }
            let attempt = budgets.reinit.record_attempt().unwrap_or_default();
            budgets.ambiguous_cycles = if ambiguous {
                budgets.ambiguous_cycles + 1
            } else {
                0
            };
            (attempt, budgets.reinit.max_attempts(), budgets.ambiguous_cycles)
        };

        let escalate = ambiguous && cycles >= self.config.fallback_escalation_cycles;
        if escalate {
            if supervisor.has_persisted_session().await {
                warn!(
                    client_id,
                    state = %observed,
                    cycles,
                    "Transport state ambiguous across cycles; reinitializing with a cleared session"
                );
                let cooldown = self.budgets().reinit.start_cooldown(Instant::now());
                self.spawn_reinitialize(
                    ReinitializeOptions::clearing_session()
                        .with_trigger("fallback-ambiguous-escalation")
                        .with_reason(format!("state {} for {} cycles", observed, cycles)),
                );
                return NextCheck::Cooldown(cooldown);
            }
            info!(client_id, "No stored credentials to clear; reconnecting instead");
        }

        warn!(
            client_id,
            state = %observed,
            attempt,
            max = max_attempts,
            "Fallback probe still not connected; reconnecting"
        );
        supervisor.request_reconnect("fallback");
        NextCheck::After(base)
    }

    fn check_in_flight(&self, elapsed: Duration) -> NextCheck {
        let base = self.config.fallback_delay;
        let supervisor = &self.supervisor;
        let client_id = supervisor.client_id();
        let elapsed_ms = elapsed.as_millis() as u64;

        if elapsed < self.config.connect_inflight_warn {
            debug!(client_id, elapsed_ms, "Fallback check: connect in progress");
            return NextCheck::After(base);
        }
        if elapsed < self.config.connect_inflight_reinit {
            warn!(client_id, elapsed_ms, "Connect attempt is taking unusually long");
            return NextCheck::After(base);
        }
        if supervisor.awaiting_pairing()
            && supervisor.gate().pairing_issued_within(self.config.pairing_grace)
        {
            warn!(client_id, elapsed_ms, "Connect stalled but a pairing code was just issued; deferring reinitialize");
            return NextCheck::After(base);
        }
        warn!(client_id, elapsed_ms, "Connect attempt stalled; forcing reinitialize");
        self.spawn_reinitialize(
            ReinitializeOptions::keeping_session()
                .with_trigger("connect-inflight-timeout")
                .with_reason(format!("connect in flight for {}ms", elapsed_ms)),
        );
        NextCheck::After(base)
    }

    fn spawn_reinitialize(&self, options: ReinitializeOptions) {
        let supervisor = self.supervisor.clone();
        tokio::spawn(async move {
            if let Err(e) = supervisor.reinitialize(options).await {
                warn!(client_id = %supervisor.client_id(), "Fallback reinitialize failed: {}", e);
            }
        });
    }
}
