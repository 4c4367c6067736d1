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

//! Credit ledger.
//!
//! Balances move only through three postings, each writing the balance
//! update and its audit row together:
//!
//! ```text
//! add    : balance + amount  (fails above max_balance)
//! deduct : balance - amount  (fails below zero)
//! refund : balance + amount  (fails above max_balance, tagged for audit)
//! ```
//!
//! Postings always run inside the caller's unit of work and never open one
//! of their own. They trust the amount they are given: request-level bounds
//! are checked by the public [`Engine`] methods before any unit of work
//! opens. Postings do no deduplication; see [`Engine::top_up`] for
//! idempotent top-ups.

use crate::Engine;
use crate::base::{BookingId, Credits, UserId};
use crate::credit::{CreditTransaction, OperationType, Reconciliation};
use crate::engine::UnitOfWork;
use crate::error::LedgerError;
use tracing::{debug, info};

/// One requested balance movement.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Posting<'r> {
    pub(crate) user: UserId,
    pub(crate) amount: Credits,
    pub(crate) reason: &'r str,
    pub(crate) performed_by: Option<UserId>,
    pub(crate) booking: Option<BookingId>,
}

impl<'r> Posting<'r> {
    pub(crate) fn new(user: UserId, amount: Credits, reason: &'r str) -> Self {
        Self {
            user,
            amount,
            reason,
            performed_by: None,
            booking: None,
        }
    }

    pub(crate) fn performed_by(mut self, actor: Option<UserId>) -> Self {
        self.performed_by = actor;
        self
    }

    pub(crate) fn for_booking(mut self, booking: BookingId) -> Self {
        self.booking = Some(booking);
        self
    }
}

pub(crate) fn add(
    work: &mut UnitOfWork<'_>,
    posting: Posting<'_>,
) -> Result<CreditTransaction, LedgerError> {
    post(work, OperationType::Add, posting)
}

pub(crate) fn deduct(
    work: &mut UnitOfWork<'_>,
    posting: Posting<'_>,
) -> Result<CreditTransaction, LedgerError> {
    post(work, OperationType::Deduct, posting)
}

pub(crate) fn refund(
    work: &mut UnitOfWork<'_>,
    posting: Posting<'_>,
) -> Result<CreditTransaction, LedgerError> {
    post(work, OperationType::Refund, posting)
}

fn post(
    work: &mut UnitOfWork<'_>,
    operation_type: OperationType,
    posting: Posting<'_>,
) -> Result<CreditTransaction, LedgerError> {
    if posting.amount == 0 {
        return Err(LedgerError::ZeroAmount);
    }
    let max_balance = work.config.max_balance;
    let moved = match operation_type {
        OperationType::Deduct => work.tx.try_debit(posting.user, posting.amount, work.now)?,
        OperationType::Add | OperationType::Refund => {
            work.tx
                .try_credit(posting.user, posting.amount, max_balance, work.now)?
        }
    };

    let Some((balance_before, balance_after)) = moved else {
        let balance = work.tx.balance(posting.user).map_or(0, |b| b.balance);
        debug!(
            user = %posting.user,
            operation = %operation_type,
            amount = posting.amount,
            balance,
            "posting rejected"
        );
        return Err(match operation_type {
            OperationType::Deduct => LedgerError::InsufficientBalance {
                user: posting.user,
                balance,
                required: posting.amount,
            },
            OperationType::Add | OperationType::Refund => LedgerError::BalanceCeilingExceeded {
                user: posting.user,
                balance,
                amount: posting.amount,
                max: max_balance,
            },
        });
    };

    let transaction = CreditTransaction {
        id: work.tx.next_transaction_id(),
        user_id: posting.user,
        amount: posting.amount,
        operation_type,
        reason: posting.reason.to_owned(),
        performed_by: posting.performed_by,
        booking_id: posting.booking,
        balance_before,
        balance_after,
        created_at: work.now,
    };
    debug_assert!(
        transaction.is_consistent(),
        "Invariant violated: transaction {} does not chain",
        transaction.id
    );
    work.tx.append_transaction(transaction.clone());
    Ok(transaction)
}

impl Engine {
    /// Adds credits to a user's balance.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidAmount`] - Amount outside the configured per-operation range.
    /// - [`LedgerError::EmptyReason`] - No reason given.
    /// - [`LedgerError::UserNotFound`] / [`LedgerError::UserInactive`] - Unknown or deactivated user.
    /// - [`LedgerError::BalanceCeilingExceeded`] - Balance would pass `max_balance`.
    pub fn add_credits(
        &self,
        user: UserId,
        amount: Credits,
        reason: &str,
        performed_by: Option<UserId>,
    ) -> Result<CreditTransaction, LedgerError> {
        self.manual_posting(OperationType::Add, user, amount, reason, performed_by)
    }

    /// Removes credits from a user's balance.
    ///
    /// # Errors
    ///
    /// Same as [`Engine::add_credits`], with
    /// [`LedgerError::InsufficientBalance`] instead of the ceiling error.
    pub fn deduct_credits(
        &self,
        user: UserId,
        amount: Credits,
        reason: &str,
        performed_by: Option<UserId>,
    ) -> Result<CreditTransaction, LedgerError> {
        self.manual_posting(OperationType::Deduct, user, amount, reason, performed_by)
    }

    /// Returns credits to a user outside the booking flow (goodwill, corrections).
    pub fn refund_credits(
        &self,
        user: UserId,
        amount: Credits,
        reason: &str,
        performed_by: Option<UserId>,
    ) -> Result<CreditTransaction, LedgerError> {
        self.manual_posting(OperationType::Refund, user, amount, reason, performed_by)
    }

    fn manual_posting(
        &self,
        operation_type: OperationType,
        user: UserId,
        amount: Credits,
        reason: &str,
        performed_by: Option<UserId>,
    ) -> Result<CreditTransaction, LedgerError> {
        self.config().check_amount(amount)?;
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(LedgerError::EmptyReason);
        }

        let transaction = self.transact(|work| {
            work.active_user(user)?;
            if let Some(actor) = performed_by {
                work.tx.user(actor).ok_or(LedgerError::UserNotFound(actor))?;
            }
            let posting = Posting::new(user, amount, reason).performed_by(performed_by);
            match operation_type {
                OperationType::Add => add(work, posting),
                OperationType::Deduct => deduct(work, posting),
                OperationType::Refund => refund(work, posting),
            }
        })?;
        info!(
            user = %user,
            operation = %operation_type,
            amount,
            balance = transaction.balance_after,
            "credits posted"
        );
        Ok(transaction)
    }

    /// Current balance of a user.
    pub fn balance(&self, user: UserId) -> Result<Credits, LedgerError> {
        self.read(|tx| tx.balance(user).map(|b| b.balance))?
            .ok_or(LedgerError::UserNotFound(user))
    }

    /// Credit log of a user, oldest first.
    pub fn transactions(&self, user: UserId) -> Result<Vec<CreditTransaction>, LedgerError> {
        self.read(|tx| {
            tx.balance(user)
                .map(|_| tx.transactions_of(user).cloned().collect())
        })?
        .ok_or(LedgerError::UserNotFound(user))
    }

    /// Replays a user's credit log and compares it with the stored balance.
    pub fn reconcile(&self, user: UserId) -> Result<Reconciliation, LedgerError> {
        self.read(|tx| {
            let stored = tx.balance(user)?.balance;
            let log: Vec<CreditTransaction> = tx.transactions_of(user).cloned().collect();
            Some(Reconciliation::replay(user, stored, &log))
        })?
        .ok_or(LedgerError::UserNotFound(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::Role;

    fn funded_student(engine: &Engine, credits: Credits) -> UserId {
        let user = engine.register_user("student", Role::Student).unwrap();
        if credits > 0 {
            engine.add_credits(user.id, credits, "seed", None).unwrap();
        }
        user.id
    }

    #[test]
    fn posting_rejects_zero_amount() {
        let engine = Engine::new();
        let user = funded_student(&engine, 5);
        let result = engine.transact(|work| deduct(work, Posting::new(user, 0, "zero")));
        assert_eq!(result, Err(LedgerError::ZeroAmount));
    }

    #[test]
    fn posting_trusts_amounts_above_request_limit() {
        let engine = Engine::new();
        let user = funded_student(&engine, 0);
        let tx = engine
            .transact(|work| add(work, Posting::new(user, 500, "bulk import")))
            .unwrap();
        assert_eq!(tx.balance_after, 500);
    }

    #[test]
    fn deduct_links_booking() {
        let engine = Engine::new();
        let user = funded_student(&engine, 10);
        let tx = engine
            .transact(|work| {
                deduct(
                    work,
                    Posting::new(user, 4, "Booking lesson").for_booking(BookingId(77)),
                )
            })
            .unwrap();
        assert_eq!(tx.booking_id, Some(BookingId(77)));
        assert_eq!(tx.balance_before, 10);
        assert_eq!(tx.balance_after, 6);
        assert_eq!(tx.operation_type, OperationType::Deduct);
    }

    #[test]
    fn refund_is_bounded_by_ceiling() {
        let engine = Engine::new();
        let user = funded_student(&engine, 0);
        engine
            .transact(|work| add(work, Posting::new(user, 9_999, "seed")))
            .unwrap();
        let result = engine.transact(|work| refund(work, Posting::new(user, 2, "refund")));
        assert_eq!(
            result,
            Err(LedgerError::BalanceCeilingExceeded {
                user,
                balance: 9_999,
                amount: 2,
                max: 10_000
            })
        );
    }

    #[test]
    fn manual_posting_validates_before_opening_work() {
        let engine = Engine::new();
        let user = funded_student(&engine, 0);
        engine.store().suspend();

        assert_eq!(
            engine.add_credits(user, 0, "nothing", None),
            Err(LedgerError::InvalidAmount {
                amount: 0,
                min: 1,
                max: 100
            })
        );
        assert_eq!(
            engine.add_credits(user, 5, "   ", None),
            Err(LedgerError::EmptyReason)
        );
        assert_eq!(
            engine.add_credits(user, 5, "valid", None),
            Err(LedgerError::StoreUnavailable)
        );
    }

    #[test]
    fn unknown_performer_is_rejected() {
        let engine = Engine::new();
        let user = funded_student(&engine, 0);
        assert_eq!(
            engine.add_credits(user, 5, "grant", Some(UserId(999))),
            Err(LedgerError::UserNotFound(UserId(999)))
        );
        assert_eq!(engine.balance(user).unwrap(), 0);
    }
}
