//! Connection lifecycle
//!
//! - `state`: lifecycle states and disconnect classification
//! - `readiness`: readiness flag, waiters, and timeout diagnostics
//! - `retry`: retry budgets and backoff
//! - `timer`: cancellable delayed tasks
//! - `observers`: lifecycle callbacks
//! - `supervisor`: connect attempts and transport event handling
//! - `fallback`: periodic readiness safety net
//! - `send_queue`: ordered outbound delivery

pub mod fallback;
pub mod observers;
pub mod readiness;
pub mod retry;
pub mod send_queue;
pub mod state;
pub mod supervisor;
pub mod timer;

pub use fallback::{FallbackPoller, NextCheck, PollerSignal};
pub use observers::Observers;
pub use readiness::{ReadinessGate, ReadinessSnapshot, ReadinessTimeout, Remediation};
pub use retry::RetryBudget;
pub use send_queue::{OutboundMessage, SendPolicy, SendQueue};
pub use state::{ConnectionState, DisconnectReason};
pub use supervisor::{AttemptKind, ConnectionSupervisor, ProbeOutcome, ReinitializeOptions};
pub use timer::ScheduledTask;
