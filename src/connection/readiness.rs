//! Readiness gate
//!
//! Tracks whether a client is ready together with the diagnostics needed to
//! explain why it is not. Callers that need readiness register a [`Waiter`];
//! `mark_ready` resolves every registered waiter exactly once, in
//! registration order, and leaves the list empty.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

use super::state::{ConnectionState, DisconnectReason};

/// What an operator should do about a client that is not ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Remediation {
    PairingRequired,
    Reauthenticate,
    MissingDependency,
    CheckConnectivity,
}

impl Remediation {
    pub fn hint(&self) -> &'static str {
        match self {
            Self::PairingRequired => {
                "pairing required: scan the latest pairing code from the logs to link this client"
            }
            Self::Reauthenticate => {
                "authentication failed: reinitialize with a cleared session and pair again"
            }
            Self::MissingDependency => {
                "a local runtime dependency is missing: install it, then reinitialize"
            }
            Self::CheckConnectivity => {
                "check connectivity to the gateway and the connect logs for this client"
            }
        }
    }

    fn for_client(state: &ConnectionState, snapshot: &ReadinessSnapshot) -> Self {
        match state {
            ConnectionState::Fatal { .. } => Self::MissingDependency,
            ConnectionState::AwaitingPairing { .. } => Self::PairingRequired,
            ConnectionState::AuthFailed { .. } => Self::Reauthenticate,
            _ if snapshot.awaiting_pairing => Self::PairingRequired,
            _ if snapshot.last_auth_failure_at.is_some() => Self::Reauthenticate,
            _ => Self::CheckConnectivity,
        }
    }
}

impl fmt::Display for Remediation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.hint())
    }
}

/// Diagnostic payload of a readiness timeout
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessTimeout {
    pub client_id: String,
    pub session_path: String,
    pub waited_ms: u64,
    pub state: String,
    pub awaiting_pairing: bool,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_auth_failure_at: Option<DateTime<Utc>>,
    pub remediation: Remediation,
}

impl fmt::Display for ReadinessTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "client {} not ready after {}ms (state={}, awaitingPairing={}, lastDisconnectReason={}, lastAuthFailureAt={}, sessionPath={}); {}",
            self.client_id,
            self.waited_ms,
            self.state,
            self.awaiting_pairing,
            self.last_disconnect_reason
                .as_ref()
                .map(|r| r.as_str())
                .unwrap_or("none"),
            self.last_auth_failure_at
                .map(|at| at.to_rfc3339())
                .unwrap_or_else(|| "none".to_string()),
            self.session_path,
            self.remediation,
        )
    }
}

/// Point-in-time copy of the readiness record
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessSnapshot {
    pub ready: bool,
    pub awaiting_pairing: bool,
    pub last_disconnect_reason: Option<DisconnectReason>,
    pub last_auth_failure_at: Option<DateTime<Utc>>,
    pub last_auth_failure_message: Option<String>,
    pub last_pairing_code_at: Option<DateTime<Utc>>,
    pub last_ready_source: Option<String>,
    pub last_connect_error: Option<String>,
}

#[derive(Default)]
struct ReadinessRecord {
    snapshot: ReadinessSnapshot,
    pairing_issued_at: Option<Instant>,
    waiters: Vec<(u64, oneshot::Sender<()>)>,
}

struct GateInner {
    client_id: String,
    record: Mutex<ReadinessRecord>,
    next_waiter: AtomicU64,
}

/// Per-client readiness flag, waiter list, and diagnostics
#[derive(Clone)]
pub struct ReadinessGate {
    inner: Arc<GateInner>,
}

impl ReadinessGate {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                client_id: client_id.into(),
                record: Mutex::new(ReadinessRecord::default()),
                next_waiter: AtomicU64::new(1),
            }),
        }
    }

    fn record(&self) -> MutexGuard<'_, ReadinessRecord> {
        self.inner
            .record
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_ready(&self) -> bool {
        self.record().snapshot.ready
    }

    pub fn awaiting_pairing(&self) -> bool {
        self.record().snapshot.awaiting_pairing
    }

    /// Register interest in the next ready signal.
    ///
    /// If the gate is already ready the returned waiter resolves immediately.
    pub fn register(&self) -> Waiter {
        let id = self.inner.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let mut record = self.record();
        if record.snapshot.ready {
            let _ = tx.send(());
        } else {
            record.waiters.push((id, tx));
        }
        Waiter {
            id,
            rx,
            gate: Arc::downgrade(&self.inner),
        }
    }

    /// Mark ready and drain the waiter list in registration order.
    ///
    /// Returns `true` when this call flipped the gate from not-ready.
    pub fn mark_ready(&self, source: &str) -> bool {
        let waiters = {
            let mut record = self.record();
            let was_ready = record.snapshot.ready;
            let snapshot = &mut record.snapshot;
            snapshot.ready = true;
            snapshot.awaiting_pairing = false;
            snapshot.last_disconnect_reason = None;
            snapshot.last_auth_failure_at = None;
            snapshot.last_auth_failure_message = None;
            snapshot.last_connect_error = None;
            snapshot.last_ready_source = Some(source.to_string());
            record.pairing_issued_at = None;
            if was_ready && record.waiters.is_empty() {
                return false;
            }
            (std::mem::take(&mut record.waiters), !was_ready)
        };
        let (waiters, flipped) = waiters;
        debug!(
            client_id = %self.inner.client_id,
            waiters = waiters.len(),
            source,
            "Resolving readiness waiters"
        );
        for (_, tx) in waiters {
            let _ = tx.send(());
        }
        flipped
    }

    /// Clear the ready flag. Waiters stay registered.
    pub fn mark_not_ready(&self) -> bool {
        let mut record = self.record();
        std::mem::replace(&mut record.snapshot.ready, false)
    }

    pub fn record_pairing_challenge(&self) {
        let mut record = self.record();
        record.snapshot.awaiting_pairing = true;
        record.snapshot.last_pairing_code_at = Some(Utc::now());
        record.pairing_issued_at = Some(Instant::now());
    }

    /// Leave the awaiting-pairing condition once the transport authenticates
    pub fn clear_pairing(&self) {
        let mut record = self.record();
        record.snapshot.awaiting_pairing = false;
        record.snapshot.last_disconnect_reason = None;
    }

    pub fn record_disconnect(&self, reason: &DisconnectReason) {
        let mut record = self.record();
        record.snapshot.last_disconnect_reason = Some(reason.clone());
        if reason.is_logout_class() {
            record.snapshot.awaiting_pairing = true;
        }
    }

    pub fn record_auth_failure(&self, message: Option<String>) {
        let mut record = self.record();
        record.snapshot.last_auth_failure_at = Some(Utc::now());
        record.snapshot.last_auth_failure_message = message;
    }

    pub fn record_connect_error(&self, message: impl Into<String>) {
        self.record().snapshot.last_connect_error = Some(message.into());
    }

    /// Whether a pairing code was issued within the last `grace`
    pub fn pairing_issued_within(&self, grace: Duration) -> bool {
        self.record()
            .pairing_issued_at
            .map(|at| at.elapsed() < grace)
            .unwrap_or(false)
    }

    pub fn waiter_count(&self) -> usize {
        self.record().waiters.len()
    }

    pub fn snapshot(&self) -> ReadinessSnapshot {
        self.record().snapshot.clone()
    }

    /// Build the diagnostic error for a caller that waited `waited` in vain
    pub fn timeout_error(
        &self,
        waited: Duration,
        state: &ConnectionState,
        session_path: &str,
    ) -> ReadinessTimeout {
        let snapshot = self.snapshot();
        ReadinessTimeout {
            client_id: self.inner.client_id.clone(),
            session_path: session_path.to_string(),
            waited_ms: waited.as_millis() as u64,
            state: state.to_string(),
            awaiting_pairing: snapshot.awaiting_pairing
                || matches!(state, ConnectionState::AwaitingPairing { .. }),
            remediation: Remediation::for_client(state, &snapshot),
            last_disconnect_reason: snapshot.last_disconnect_reason,
            last_auth_failure_at: snapshot.last_auth_failure_at,
        }
    }
}

/// A registered readiness waiter; removes itself from the gate when dropped
pub struct Waiter {
    id: u64,
    rx: oneshot::Receiver<()>,
    gate: Weak<GateInner>,
}

impl Waiter {
    /// Resolves `true` on ready, `false` if the gate went away
    pub async fn wait(&mut self) -> bool {
        (&mut self.rx).await.is_ok()
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if let Some(gate) = self.gate.upgrade() {
            let mut record = gate
                .record
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            record.waiters.retain(|(id, _)| *id != self.id);
        }
    }
}
