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

//! Credit balances and the append-only transaction log.

use crate::base::{BookingId, Credits, TransactionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current credit balance of one user. One row per user, created at
/// registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub user_id: UserId,
    pub balance: Credits,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    Add,
    Deduct,
    Refund,
}

impl OperationType {
    /// Applies `amount` to `balance` in the direction of this operation.
    ///
    /// Returns `None` on underflow or overflow.
    pub fn apply(self, balance: Credits, amount: Credits) -> Option<Credits> {
        match self {
            OperationType::Add | OperationType::Refund => balance.checked_add(amount),
            OperationType::Deduct => balance.checked_sub(amount),
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationType::Add => f.write_str("add"),
            OperationType::Deduct => f.write_str("deduct"),
            OperationType::Refund => f.write_str("refund"),
        }
    }
}

/// Immutable audit row written for every balance mutation.
///
/// `balance_after` always equals `operation_type.apply(balance_before, amount)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditTransaction {
    pub id: TransactionId,
    pub user_id: UserId,
    pub amount: Credits,
    pub operation_type: OperationType,
    pub reason: String,
    pub performed_by: Option<UserId>,
    pub booking_id: Option<BookingId>,
    pub balance_before: Credits,
    pub balance_after: Credits,
    pub created_at: DateTime<Utc>,
}

impl CreditTransaction {
    /// Whether the before/after snapshot agrees with the signed amount.
    pub fn is_consistent(&self) -> bool {
        self.operation_type.apply(self.balance_before, self.amount) == Some(self.balance_after)
    }
}

/// Outcome of replaying a user's transaction log against the stored balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub user_id: UserId,
    pub stored_balance: Credits,
    pub replayed_balance: Credits,
    pub transactions: usize,
    /// Transactions whose snapshot does not chain from the previous one.
    pub broken_links: Vec<TransactionId>,
}

impl Reconciliation {
    pub fn is_balanced(&self) -> bool {
        self.broken_links.is_empty() && self.stored_balance == self.replayed_balance
    }

    /// Replays `log` (ordered oldest first) starting from a zero balance.
    pub fn replay(user_id: UserId, stored_balance: Credits, log: &[CreditTransaction]) -> Self {
        let mut running: Credits = 0;
        let mut broken_links = Vec::new();
        for tx in log {
            if tx.balance_before != running || !tx.is_consistent() {
                broken_links.push(tx.id);
            }
            running = tx.balance_after;
        }
        Self {
            user_id,
            stored_balance,
            replayed_balance: running,
            transactions: log.len(),
            broken_links,
        }
    }
}
