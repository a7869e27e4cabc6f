//! In-memory auto-sign password cache.
//!
//! `AutoSignActivate` validates the wallet password once and caches it; as
//! long as the activation is live, offline sign requests for that wallet
//! complete without a prompt. An activation dies when it expires, when its
//! spend budget is exhausted, or on explicit deactivation. The cache never
//! touches disk.

use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use remsign_crypto::secret::Password;

use crate::api::{SignLimits, WalletId};

struct Entry {
    password: Password,
    activated_at: Instant,
    spent: u64,
}

#[derive(Default)]
pub struct AutoSignCache {
    entries: HashMap<WalletId, Entry>,
}

impl AutoSignCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn activate(&mut self, wallet_id: &str, password: Password) {
        self.entries.insert(
            wallet_id.to_owned(),
            Entry {
                password,
                activated_at: Instant::now(),
                spent: 0,
            },
        );
    }

    /// Forget the cached password. Idempotent.
    pub fn deactivate(&mut self, wallet_id: &str) -> bool {
        self.entries.remove(wallet_id).is_some()
    }

    pub fn is_active(&self, wallet_id: &str) -> bool {
        self.entries.contains_key(wallet_id)
    }

    /// Take the cached password for a spend of `amount` satoshis. Returns
    /// `None` (and deactivates) if the activation expired or the spend would
    /// exceed the per-interval limit; the caller then falls back to
    /// prompting.
    pub fn password_for_spend(
        &mut self,
        wallet_id: &str,
        amount: u64,
        limits: &SignLimits,
    ) -> Option<Password> {
        let entry = self.entries.get_mut(wallet_id)?;

        let age = entry.activated_at.elapsed();
        let expired =
            age >= Duration::from_secs(limits.auto_sign_interval_secs);
        let over_budget = entry
            .spent
            .checked_add(amount)
            .map(|total| total > limits.auto_sign_spend_limit)
            .unwrap_or(true);

        if expired || over_budget {
            self.entries.remove(wallet_id);
            return None;
        }

        entry.spent += amount;
        Some(entry.password.clone())
    }
}
