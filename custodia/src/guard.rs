// Copyright (c) Custodia, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Per-account settlement lock.
//!
//! Advisory, single-instance, in-memory mutual exclusion: enough for a
//! single-process deployment. A multi-process deployment needs a durable
//! lock (a row lock in the account store, or a lease in a coordination
//! service) in place of this map.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::warn;

use crate::types::AccountId;

pub struct SettlementGuard {
    timeout: Duration,
    locks: Mutex<HashMap<AccountId, Instant>>,
}

impl SettlementGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Try to take the lock for `account_id`. Returns `false` while an
    /// unexpired lock exists; a lock held past the timeout is treated as
    /// abandoned and silently reclaimed.
    pub fn acquire(&self, account_id: AccountId) -> bool {
        let mut locks = self.locks.lock().unwrap();
        if let Some(acquired_at) = locks.get(&account_id) {
            if acquired_at.elapsed() < self.timeout {
                return false;
            }
            warn!(
                "[Guard] Reclaiming stale settlement lock for account {} (held {:?})",
                account_id,
                acquired_at.elapsed()
            );
        }
        locks.insert(account_id, Instant::now());
        true
    }

    pub fn release(&self, account_id: AccountId) {
        self.locks.lock().unwrap().remove(&account_id);
    }

    pub fn held(&self, account_id: AccountId) -> bool {
        self.locks
            .lock()
            .unwrap()
            .get(&account_id)
            .map(|at| at.elapsed() < self.timeout)
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_then_contention() {
        let guard = SettlementGuard::new(Duration::from_secs(300));
        assert!(guard.acquire(1));
        assert!(!guard.acquire(1));
        assert!(guard.held(1));
    }

    #[test]
    fn test_release_frees_the_lock() {
        let guard = SettlementGuard::new(Duration::from_secs(300));
        assert!(guard.acquire(1));
        guard.release(1);
        assert!(!guard.held(1));
        assert!(guard.acquire(1));
    }

    #[test]
    fn test_independent_accounts_do_not_contend() {
        let guard = SettlementGuard::new(Duration::from_secs(300));
        assert!(guard.acquire(1));
        assert!(guard.acquire(2));
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let guard = SettlementGuard::new(Duration::from_millis(20));
        assert!(guard.acquire(1));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!guard.held(1));
        assert!(guard.acquire(1));
    }

    #[test]
    fn test_lock_within_timeout_is_not_reclaimed() {
        let guard = SettlementGuard::new(Duration::from_secs(300));
        assert!(guard.acquire(1));
        assert!(!guard.acquire(1));
        assert!(!guard.acquire(1));
    }
}
