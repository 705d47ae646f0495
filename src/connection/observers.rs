//! Lifecycle observer registry

use std::sync::{Arc, RwLock};

use super::state::DisconnectReason;

/// `(client_id, source)`
pub type ReadyHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;
/// `(client_id, reason)`
pub type DisconnectHandler = Arc<dyn Fn(&str, &DisconnectReason) + Send + Sync>;
/// `(client_id, pairing_code)`
pub type PairingHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Callbacks invoked on lifecycle transitions.
///
/// Handlers run synchronously on the task that observed the transition, with
/// no supervisor locks held.
#[derive(Default)]
pub struct Observers {
    ready: RwLock<Vec<ReadyHandler>>,
    disconnected: RwLock<Vec<DisconnectHandler>>,
    pairing: RwLock<Vec<PairingHandler>>,
}

impl Observers {
    pub fn on_ready<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        write(&self.ready).push(Arc::new(handler));
    }

    pub fn on_disconnected<F>(&self, handler: F)
    where
        F: Fn(&str, &DisconnectReason) + Send + Sync + 'static,
    {
        write(&self.disconnected).push(Arc::new(handler));
    }

    pub fn on_pairing_challenge<F>(&self, handler: F)
    where
        F: Fn(&str, &str) + Send + Sync + 'static,
    {
        write(&self.pairing).push(Arc::new(handler));
    }

    pub(crate) fn notify_ready(&self, client_id: &str, source: &str) {
        for handler in snapshot(&self.ready) {
            handler(client_id, source);
        }
    }

    pub(crate) fn notify_disconnected(&self, client_id: &str, reason: &DisconnectReason) {
        for handler in snapshot(&self.disconnected) {
            handler(client_id, reason);
        }
    }

    pub(crate) fn notify_pairing(&self, client_id: &str, code: &str) {
        for handler in snapshot(&self.pairing) {
            handler(client_id, code);
        }
    }
}

fn write<T>(lock: &RwLock<Vec<T>>) -> std::sync::RwLockWriteGuard<'_, Vec<T>> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Handlers may register further handlers; never call them under the lock.
fn snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}
