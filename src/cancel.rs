//! Process-wide cancellation registry.
//!
//! Hosts cancel a running turn from outside the turn's task by passing an
//! opaque token in `TurnOptions` and later calling [`cancel`]. The registry
//! owns the token → transport mapping; callers only ever receive transport
//! handles back, never the table itself, so there is no lazily-created
//! global for two threads to race on constructing.
//!
//! Entries hold [`Weak`] references and are pruned when the transport is
//! dropped or its process has exited.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock, Weak};

use crate::process::{ProcessStatus, ProcessTransport};

/// Registry mapping cancellation tokens to live transports.
pub struct CancellationRegistry {
    entries: Mutex<HashMap<String, Weak<ProcessTransport>>>,
}

static REGISTRY: OnceLock<CancellationRegistry> = OnceLock::new();

/// The process-wide registry.
pub fn registry() -> &'static CancellationRegistry {
    REGISTRY.get_or_init(|| CancellationRegistry {
        entries: Mutex::new(HashMap::new()),
    })
}

impl CancellationRegistry {
    /// Associate `token` with a transport. A token registered twice points
    /// at the most recent transport.
    pub fn register(&self, token: impl Into<String>, handle: &std::sync::Arc<ProcessTransport>) {
        let mut entries = self.entries.lock().expect("cancellation registry poisoned");
        entries.insert(token.into(), std::sync::Arc::downgrade(handle));
    }

    /// Look up a token, returning a live transport handle if one is still
    /// running. Dead entries encountered on the way are removed.
    pub fn lookup(&self, token: &str) -> Option<std::sync::Arc<ProcessTransport>> {
        let mut entries = self.entries.lock().expect("cancellation registry poisoned");
        match entries.get(token).and_then(Weak::upgrade) {
            Some(handle) if handle.status() == ProcessStatus::Running => Some(handle),
            _ => {
                entries.remove(token);
                None
            }
        }
    }

    /// Remove a token. Idempotent.
    pub fn unregister(&self, token: &str) {
        let mut entries = self.entries.lock().expect("cancellation registry poisoned");
        entries.remove(token);
    }

    /// Drop every entry whose transport is gone or whose process has exited.
    /// Returns how many entries were removed.
    pub fn prune_dead_processes(&self) -> usize {
        let mut entries = self.entries.lock().expect("cancellation registry poisoned");
        let before = entries.len();
        entries.retain(|_, weak| {
            weak.upgrade()
                .is_some_and(|handle| handle.status() == ProcessStatus::Running)
        });
        before - entries.len()
    }

    /// Number of registered tokens, dead or alive.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .expect("cancellation registry poisoned")
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Cancel the turn registered under `token` by force-closing its transport.
///
/// Returns `true` if a live transport was found and shut down.
pub async fn cancel(token: &str) -> bool {
    let handle = registry().lookup(token);
    registry().unregister(token);
    match handle {
        Some(handle) => {
            handle.force_close().await;
            true
        }
        None => false,
    }
}
