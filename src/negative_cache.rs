use std::collections::VecDeque;
use std::sync::Mutex;

use crate::principal::Principal;

/// Maximum number of remembered failures. The oldest one is evicted first.
pub const NEGATIVE_CACHE_CAPACITY: usize = 32;

/// Service-ticket lookups that failed without hostname canonicalization.
///
/// When a lookup for `(client, server)` is known to fail, the initiator goes straight to the
/// DNS-canonicalized name instead of asking the KDC again.
#[derive(Debug, Default)]
pub struct NegativeCache {
    entries: Mutex<VecDeque<(Principal, Principal)>>,
}

impl NegativeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, client: &Principal, server: &Principal) -> bool {
        self.entries
            .lock()
            .map(|entries| {
                entries
                    .iter()
                    .any(|(cached_client, cached_server)| cached_client == client && cached_server == server)
            })
            .unwrap_or(false)
    }

    pub fn insert(&self, client: &Principal, server: &Principal) {
        let Ok(mut entries) = self.entries.lock() else {
            warn!("negative cache lock is poisoned");
            return;
        };

        if entries
            .iter()
            .any(|(cached_client, cached_server)| cached_client == client && cached_server == server)
        {
            return;
        }

        if entries.len() == NEGATIVE_CACHE_CAPACITY {
            entries.pop_front();
        }
        entries.push_back((client.clone(), server.clone()));

        debug!(%client, %server, "remembering failed service ticket lookup");
    }

    /// Forgets every failure. Called whenever a credential cache gains new tickets.
    pub fn notify_cache_changed(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
