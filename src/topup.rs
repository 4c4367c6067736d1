// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2025 Daniel Negri
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Idempotent credit top-ups.
//!
//! Payment webhooks are delivered at least once. The ledger itself does not
//! deduplicate, so top-ups carry a caller-supplied key: the first delivery
//! adds the credits, later deliveries with the same key get the original
//! transaction back.

use crate::Engine;
use crate::base::{Credits, UserId};
use crate::credit::CreditTransaction;
use crate::error::LedgerError;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::debug;

const TOP_UP_REASON: &str = "Credit top-up";

#[derive(Debug, Clone, PartialEq, Eq)]
struct TopUpRecord {
    user: UserId,
    amount: Credits,
    transaction: CreditTransaction,
}

/// Keys of completed top-ups.
///
/// Only successful top-ups are recorded, so a failed attempt may be retried
/// with the same key.
#[derive(Debug, Default)]
pub struct TopUpRegistry {
    completed: DashMap<String, TopUpRecord>,
}

impl TopUpRegistry {
    pub fn new() -> Self {
        Self {
            completed: DashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.completed.is_empty()
    }

    /// Transaction recorded for `key`, if any.
    pub fn get(&self, key: &str) -> Option<CreditTransaction> {
        self.completed.get(key).map(|r| r.transaction.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopUpOutcome {
    /// Credits were added by this call.
    Applied(CreditTransaction),
    /// The key was seen before; nothing was added.
    Replayed(CreditTransaction),
}

impl TopUpOutcome {
    pub fn transaction(&self) -> &CreditTransaction {
        match self {
            TopUpOutcome::Applied(tx) | TopUpOutcome::Replayed(tx) => tx,
        }
    }
}

impl Engine {
    /// Keys of the top-ups this engine has completed.
    pub fn top_up_registry(&self) -> &TopUpRegistry {
        &self.top_ups
    }

    /// Adds credits at most once per `key`.
    ///
    /// Concurrent calls with the same key are serialized on the key; only
    /// one of them posts.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::EmptyIdempotencyKey`] - Blank key.
    /// - [`LedgerError::IdempotencyConflict`] - Key already used for another user or amount.
    /// - Any error of [`Engine::add_credits`].
    pub fn top_up(
        &self,
        key: &str,
        user: UserId,
        amount: Credits,
        performed_by: Option<UserId>,
    ) -> Result<TopUpOutcome, LedgerError> {
        let key = key.trim();
        if key.is_empty() {
            return Err(LedgerError::EmptyIdempotencyKey);
        }

        // The entry keeps the key's shard locked until the posting finished.
        match self.top_ups.completed.entry(key.to_owned()) {
            Entry::Occupied(entry) => {
                let record = entry.get();
                if record.user != user || record.amount != amount {
                    return Err(LedgerError::IdempotencyConflict(key.to_owned()));
                }
                debug!(key, user = %user, "top-up replayed");
                Ok(TopUpOutcome::Replayed(record.transaction.clone()))
            }
            Entry::Vacant(entry) => {
                let transaction = self.add_credits(user, amount, TOP_UP_REASON, performed_by)?;
                entry.insert(TopUpRecord {
                    user,
                    amount,
                    transaction: transaction.clone(),
                });
                Ok(TopUpOutcome::Applied(transaction))
            }
        }
    }
}
