//! Named-signal publish/subscribe
//!
//! Used to invalidate cached clients when appliance-side configuration or the
//! port registry changes, without the mutating code knowing who caches what.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Fired whenever a configuration document was written or ports changed
pub const SERVER_CONFIG_CHANGED: &str = "server_config_changed";

/// Fired whenever a server-identifying field (e.g. the name) changed
pub const SERVER_DETAILS_CHANGED: &str = "server_details_changed";

/// Subscriber callback. Errors are logged by the bus and never propagate.
pub type Callback = Arc<dyn Fn() -> std::result::Result<(), String> + Send + Sync>;

/// Registration handle, unique per registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignalHandle {
    id: u64,
}

struct Subscriber {
    id: u64,
    callback: Callback,
}

/// Signal bus
#[derive(Default)]
pub struct SignalBus {
    next_id: AtomicU64,
    subscribers: RwLock<HashMap<String, Vec<Subscriber>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for `signal`. Arguments are captured by the closure.
    pub fn register<F>(&self, signal: &str, callback: F) -> SignalHandle
    where
        F: Fn() -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .write()
            .entry(signal.to_string())
            .or_default()
            .push(Subscriber {
                id,
                callback: Arc::new(callback),
            });
        trace!(signal, id, "registered signal subscriber");
        SignalHandle { id }
    }

    /// Remove a registration. Returns whether the handle was known.
    pub fn unregister(&self, handle: SignalHandle) -> bool {
        let mut subscribers = self.subscribers.write();
        let mut removed = false;
        for list in subscribers.values_mut() {
            let before = list.len();
            list.retain(|s| s.id != handle.id);
            removed |= list.len() != before;
        }
        subscribers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Invoke every subscriber of `signal` on the calling thread.
    ///
    /// Returns the number of subscribers invoked. A failing or panicking
    /// subscriber is logged and does not stop the others.
    pub fn fire(&self, signal: &str) -> usize {
        // Snapshot so callbacks may register/unregister without deadlocking
        let callbacks: Vec<(u64, Callback)> = self
            .subscribers
            .read()
            .get(signal)
            .map(|list| list.iter().map(|s| (s.id, s.callback.clone())).collect())
            .unwrap_or_default();

        trace!(signal, subscribers = callbacks.len(), "firing signal");
        for (id, callback) in &callbacks {
            match catch_unwind(AssertUnwindSafe(|| callback())) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(signal, id, "signal subscriber failed: {}", e),
                Err(_) => warn!(signal, id, "signal subscriber panicked"),
            }
        }
        callbacks.len()
    }

    /// Number of subscribers currently registered for `signal`
    pub fn subscriber_count(&self, signal: &str) -> usize {
        self.subscribers.read().get(signal).map_or(0, |l| l.len())
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let subscribers = self.subscribers.read();
        let counts: HashMap<&str, usize> = subscribers
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("SignalBus").field("subscribers", &counts).finish()
    }
}
