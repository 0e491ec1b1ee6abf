//! The account pool: free/taken bookkeeping for bot identities.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use tracing::{debug, warn};

use decoy_core::BotAccount;

/// Tracks which identities are free and which are currently assigned.
///
/// Identities are keyed by username. A single mutex guards the free and
/// taken sets together: an identity is always in exactly one of them, never
/// neither, never both.
#[derive(Debug, Default)]
pub struct AccountPool {
    inner: Mutex<PoolInner>,
}

#[derive(Debug, Default)]
struct PoolInner {
    free: Vec<BotAccount>,
    taken: HashMap<String, BotAccount>,
    /// Taken identities that were removed from configuration; dropped
    /// instead of refreed when released.
    revoked: HashSet<String>,
}

impl AccountPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reconcile the pool against the configured identity set.
    ///
    /// Newly configured identities join the free set; free identities no
    /// longer configured are dropped. Taken identities no longer configured
    /// are marked revoked and returned — the caller must reclaim them
    /// before their release drops them. Idempotent.
    pub fn reconcile(&self, configured: &[BotAccount]) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap();
        let configured_names: HashSet<&str> =
            configured.iter().map(|a| a.username.as_str()).collect();

        inner.free.retain(|a| configured_names.contains(a.username.as_str()));

        for account in configured {
            let known = inner.taken.contains_key(&account.username)
                || inner.free.iter().any(|a| a.username == account.username);
            if !known {
                debug!(account = %account.username, "account joined the pool");
                inner.free.push(account.clone());
            }
            inner.revoked.remove(&account.username);
        }

        let mut newly_revoked = Vec::new();
        let taken_names: Vec<String> = inner.taken.keys().cloned().collect();
        for name in taken_names {
            if !configured_names.contains(name.as_str()) {
                inner.revoked.insert(name.clone());
                newly_revoked.push(name);
            }
        }
        newly_revoked
    }

    /// Take one free identity, if any. Selection order is arbitrary.
    pub fn acquire(&self) -> Option<BotAccount> {
        let mut inner = self.inner.lock().unwrap();
        let account = inner.free.pop()?;
        inner.taken.insert(account.username.clone(), account.clone());
        Some(account)
    }

    /// Return a taken identity to the free set.
    ///
    /// Releasing an identity that is not taken is a scheduling bug: loud in
    /// debug builds, a safe no-op in production. A revoked identity is
    /// dropped rather than refreed.
    pub fn release(&self, account: &BotAccount) {
        let mut inner = self.inner.lock().unwrap();
        if inner.taken.remove(&account.username).is_none() {
            debug_assert!(false, "release of identity that was not taken: {}", account.username);
            warn!(account = %account.username, "release of identity that was not taken");
            return;
        }
        if inner.revoked.remove(&account.username) {
            debug!(account = %account.username, "revoked account left the pool");
            return;
        }
        inner.free.push(account.clone());
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().unwrap().free.len()
    }

    pub fn taken_count(&self) -> usize {
        self.inner.lock().unwrap().taken.len()
    }

    /// Whether the identity is currently in the free set.
    pub fn is_free(&self, username: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .free
            .iter()
            .any(|a| a.username == username)
    }

    /// Whether the identity is currently taken.
    pub fn is_taken(&self, username: &str) -> bool {
        self.inner.lock().unwrap().taken.contains_key(username)
    }
}
