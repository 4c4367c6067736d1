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

//! Transactional in-process ledger store.
//!
//! The store keeps every table behind one [`parking_lot::Mutex`]. A
//! [`StoreTx`] holds that lock for its whole lifetime, so units of work are
//! serialized and every check it makes stays valid until it commits.
//!
//! Writes go straight to the tables and record the prior row in an undo
//! journal. Dropping a [`StoreTx`] without calling [`StoreTx::commit`]
//! replays the journal backwards, restoring every row it touched.
//! [`StoreTx::savepoint`] and [`StoreTx::rollback_to`] undo only the writes
//! made after the savepoint.
//!
//! Id sequences live outside the journal: a rolled-back unit of work leaves
//! a gap, the same way database sequences do.
//!
//! ```text
//! begin ──write──► journal grows ──commit──► journal cleared, lock released
//!                        │
//!                        └──drop──► journal replayed backwards, lock released
//! ```

use crate::base::{
    ApplicationId, BookingId, Credits, LessonId, SwapId, TemplateEntryId, TemplateId,
    TransactionId, UserId,
};
use crate::booking::{Booking, CancelledBooking};
use crate::credit::{CreditBalance, CreditTransaction, OperationType};
use crate::error::LedgerError;
use crate::lesson::Lesson;
use crate::swap::Swap;
use crate::template::{ApplicationStatus, LessonTemplate, TemplateApplication};
use crate::user::User;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<UserId, User>,
    balances: BTreeMap<UserId, CreditBalance>,
    /// Append-only credit log, ordered by creation.
    transactions: Vec<CreditTransaction>,
    /// Position in `transactions` of the deduction charged for a booking.
    deductions: BTreeMap<BookingId, usize>,
    lessons: BTreeMap<LessonId, Lesson>,
    lessons_by_teacher: BTreeMap<UserId, BTreeSet<LessonId>>,
    bookings: BTreeMap<BookingId, Booking>,
    bookings_by_student: BTreeMap<UserId, BTreeSet<BookingId>>,
    bookings_by_lesson: BTreeMap<LessonId, BTreeSet<BookingId>>,
    cancelled: BTreeMap<(UserId, LessonId), CancelledBooking>,
    swaps: Vec<Swap>,
    templates: BTreeMap<TemplateId, LessonTemplate>,
    applications: BTreeMap<ApplicationId, TemplateApplication>,
}

/// Prior state of a row, recorded before the first write to it.
#[derive(Debug)]
enum Undo {
    User(UserId, Option<User>),
    Balance(UserId, Option<CreditBalance>),
    TransactionAppended,
    Lesson(LessonId, Option<Lesson>),
    Booking(BookingId, Option<Booking>),
    Cancelled((UserId, LessonId), Option<CancelledBooking>),
    SwapAppended,
    Template(TemplateId, Option<LessonTemplate>),
    Application(ApplicationId, Option<TemplateApplication>),
}

#[derive(Debug, Default)]
struct Sequence(AtomicU64);

impl Sequence {
    fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[derive(Debug, Default)]
struct Sequences {
    users: Sequence,
    lessons: Sequence,
    bookings: Sequence,
    transactions: Sequence,
    swaps: Sequence,
    templates: Sequence,
    template_entries: Sequence,
    applications: Sequence,
}

/// Durable home of every ledger table.
#[derive(Debug, Default)]
pub struct LedgerStore {
    tables: Mutex<Tables>,
    sequences: Sequences,
    suspended: AtomicBool,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a unit of work, blocking until no other unit of work is running.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::StoreUnavailable`] - The store is suspended.
    pub(crate) fn begin(&self) -> Result<StoreTx<'_>, LedgerError> {
        if self.is_suspended() {
            return Err(LedgerError::StoreUnavailable);
        }
        let tables = self.tables.lock();
        // Re-check under the lock: a suspend may have raced the acquisition.
        if self.is_suspended() {
            return Err(LedgerError::StoreUnavailable);
        }
        Ok(StoreTx {
            tables,
            sequences: &self.sequences,
            journal: Vec::new(),
            committed: false,
        })
    }

    /// Stops accepting new units of work (maintenance, failover).
    pub fn suspend(&self) {
        self.suspended.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.suspended.store(false, Ordering::SeqCst);
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::SeqCst)
    }
}

/// Marker for a position in the undo journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Savepoint(usize);

/// One unit of work against the store.
pub(crate) struct StoreTx<'a> {
    tables: MutexGuard<'a, Tables>,
    sequences: &'a Sequences,
    journal: Vec<Undo>,
    committed: bool,
}

impl StoreTx<'_> {
    pub(crate) fn commit(mut self) {
        self.committed = true;
        self.journal.clear();
    }

    pub(crate) fn savepoint(&self) -> Savepoint {
        Savepoint(self.journal.len())
    }

    /// Undoes every write made after `savepoint`.
    pub(crate) fn rollback_to(&mut self, savepoint: Savepoint) {
        while self.journal.len() > savepoint.0 {
            if let Some(undo) = self.journal.pop() {
                self.tables.undo(undo);
            }
        }
    }

    // === Sequences ===

    pub(crate) fn next_user_id(&self) -> UserId {
        UserId(self.sequences.users.next())
    }

    pub(crate) fn next_lesson_id(&self) -> LessonId {
        LessonId(self.sequences.lessons.next())
    }

    pub(crate) fn next_booking_id(&self) -> BookingId {
        BookingId(self.sequences.bookings.next())
    }

    pub(crate) fn next_transaction_id(&self) -> TransactionId {
        TransactionId(self.sequences.transactions.next())
    }

    pub(crate) fn next_swap_id(&self) -> SwapId {
        SwapId(self.sequences.swaps.next())
    }

    pub(crate) fn next_template_id(&self) -> TemplateId {
        TemplateId(self.sequences.templates.next())
    }

    pub(crate) fn next_template_entry_id(&self) -> TemplateEntryId {
        TemplateEntryId(self.sequences.template_entries.next())
    }

    pub(crate) fn next_application_id(&self) -> ApplicationId {
        ApplicationId(self.sequences.applications.next())
    }

    // === Users ===

    pub(crate) fn user(&self, id: UserId) -> Option<&User> {
        self.tables.users.get(&id)
    }

    pub(crate) fn users(&self) -> impl Iterator<Item = &User> {
        self.tables.users.values()
    }

    pub(crate) fn put_user(&mut self, user: User) {
        let id = user.id;
        let prior = self.tables.users.insert(id, user);
        self.journal.push(Undo::User(id, prior));
    }

    // === Balances and credit log ===

    pub(crate) fn balance(&self, user: UserId) -> Option<&CreditBalance> {
        self.tables.balances.get(&user)
    }

    pub(crate) fn put_balance(&mut self, balance: CreditBalance) {
        let prior = self.tables.balances.insert(balance.user_id, balance);
        self.journal.push(Undo::Balance(balance.user_id, prior));
    }

    /// `UPDATE balance SET balance = balance - amount WHERE balance >= amount`.
    ///
    /// Returns `(before, after)` when the row was updated, `None` when the
    /// balance does not cover `amount`.
    pub(crate) fn try_debit(
        &mut self,
        user: UserId,
        amount: Credits,
        now: DateTime<Utc>,
    ) -> Result<Option<(Credits, Credits)>, LedgerError> {
        self.update_balance(user, now, |balance| balance.checked_sub(amount))
    }

    /// `UPDATE balance SET balance = balance + amount WHERE balance + amount <= ceiling`.
    pub(crate) fn try_credit(
        &mut self,
        user: UserId,
        amount: Credits,
        ceiling: Credits,
        now: DateTime<Utc>,
    ) -> Result<Option<(Credits, Credits)>, LedgerError> {
        self.update_balance(user, now, |balance| {
            balance.checked_add(amount).filter(|after| *after <= ceiling)
        })
    }

    fn update_balance(
        &mut self,
        user: UserId,
        now: DateTime<Utc>,
        next: impl FnOnce(Credits) -> Option<Credits>,
    ) -> Result<Option<(Credits, Credits)>, LedgerError> {
        let current = *self
            .tables
            .balances
            .get(&user)
            .ok_or(LedgerError::UserNotFound(user))?;
        let Some(after) = next(current.balance) else {
            return Ok(None);
        };
        self.put_balance(CreditBalance {
            balance: after,
            updated_at: now,
            ..current
        });
        Ok(Some((current.balance, after)))
    }

    pub(crate) fn append_transaction(&mut self, transaction: CreditTransaction) {
        let position = self.tables.transactions.len();
        if transaction.operation_type == OperationType::Deduct {
            if let Some(booking) = transaction.booking_id {
                self.tables.deductions.entry(booking).or_insert(position);
            }
        }
        self.tables.transactions.push(transaction);
        self.journal.push(Undo::TransactionAppended);
    }

    /// Deduction charged when `booking` was created, if any.
    pub(crate) fn deduction_for(&self, booking: BookingId) -> Option<&CreditTransaction> {
        let position = *self.tables.deductions.get(&booking)?;
        self.tables.transactions.get(position)
    }

    /// Credit log of one user, oldest first.
    pub(crate) fn transactions_of(&self, user: UserId) -> impl Iterator<Item = &CreditTransaction> {
        self.tables
            .transactions
            .iter()
            .filter(move |tx| tx.user_id == user)
    }

    // === Lessons ===

    pub(crate) fn lesson(&self, id: LessonId) -> Option<&Lesson> {
        self.tables.lessons.get(&id)
    }

    pub(crate) fn lessons(&self) -> impl Iterator<Item = &Lesson> {
        self.tables.lessons.values()
    }

    /// Lessons of one teacher, including soft-deleted ones.
    pub(crate) fn lessons_of_teacher(&self, teacher: UserId) -> impl Iterator<Item = &Lesson> {
        self.tables
            .lessons_by_teacher
            .get(&teacher)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tables.lessons.get(id))
    }

    pub(crate) fn put_lesson(&mut self, lesson: Lesson) {
        self.tables
            .lessons_by_teacher
            .entry(lesson.teacher_id)
            .or_default()
            .insert(lesson.id);
        let id = lesson.id;
        let prior = self.tables.lessons.insert(id, lesson);
        self.journal.push(Undo::Lesson(id, prior));
    }

    /// `UPDATE lesson SET current_students = current_students + 1
    ///  WHERE id = ? AND current_students < max_students AND deleted_at IS NULL`.
    ///
    /// Returns whether a seat was taken.
    pub(crate) fn try_enroll(&mut self, id: LessonId) -> Result<bool, LedgerError> {
        let mut lesson = self.lesson(id).cloned().ok_or(LedgerError::LessonNotFound(id))?;
        if !lesson.take_seat() {
            return Ok(false);
        }
        self.put_lesson(lesson);
        Ok(true)
    }

    /// Frees one seat, floored at zero.
    pub(crate) fn release_seat(&mut self, id: LessonId) -> Result<(), LedgerError> {
        let mut lesson = self.lesson(id).cloned().ok_or(LedgerError::LessonNotFound(id))?;
        lesson.free_seat();
        self.put_lesson(lesson);
        Ok(())
    }

    // === Bookings ===

    pub(crate) fn booking(&self, id: BookingId) -> Option<&Booking> {
        self.tables.bookings.get(&id)
    }

    pub(crate) fn put_booking(&mut self, booking: Booking) {
        self.tables
            .bookings_by_student
            .entry(booking.student_id)
            .or_default()
            .insert(booking.id);
        self.tables
            .bookings_by_lesson
            .entry(booking.lesson_id)
            .or_default()
            .insert(booking.id);
        let id = booking.id;
        let prior = self.tables.bookings.insert(id, booking);
        self.journal.push(Undo::Booking(id, prior));
    }

    pub(crate) fn bookings_of_student(&self, student: UserId) -> impl Iterator<Item = &Booking> {
        self.tables
            .bookings_by_student
            .get(&student)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tables.bookings.get(id))
    }

    pub(crate) fn bookings_for_lesson(&self, lesson: LessonId) -> impl Iterator<Item = &Booking> {
        self.tables
            .bookings_by_lesson
            .get(&lesson)
            .into_iter()
            .flatten()
            .filter_map(|id| self.tables.bookings.get(id))
    }

    pub(crate) fn active_booking(&self, student: UserId, lesson: LessonId) -> Option<&Booking> {
        self.bookings_of_student(student)
            .find(|b| b.lesson_id == lesson && b.is_active())
    }

    // === Cancellation history ===

    pub(crate) fn cancelled(&self, student: UserId, lesson: LessonId) -> Option<&CancelledBooking> {
        self.tables.cancelled.get(&(student, lesson))
    }

    pub(crate) fn put_cancelled(&mut self, record: CancelledBooking) {
        let key = (record.student_id, record.lesson_id);
        let prior = self.tables.cancelled.insert(key, record);
        self.journal.push(Undo::Cancelled(key, prior));
    }

    // === Swaps ===

    pub(crate) fn append_swap(&mut self, swap: Swap) {
        self.tables.swaps.push(swap);
        self.journal.push(Undo::SwapAppended);
    }

    pub(crate) fn swaps_of(&self, student: UserId) -> impl Iterator<Item = &Swap> {
        self.tables
            .swaps
            .iter()
            .filter(move |s| s.student_id == student)
    }

    // === Templates ===

    pub(crate) fn template(&self, id: TemplateId) -> Option<&LessonTemplate> {
        self.tables.templates.get(&id)
    }

    pub(crate) fn put_template(&mut self, template: LessonTemplate) {
        let id = template.id;
        let prior = self.tables.templates.insert(id, template);
        self.journal.push(Undo::Template(id, prior));
    }

    pub(crate) fn application(&self, id: ApplicationId) -> Option<&TemplateApplication> {
        self.tables.applications.get(&id)
    }

    pub(crate) fn applications_of(
        &self,
        template: TemplateId,
    ) -> impl Iterator<Item = &TemplateApplication> {
        self.tables
            .applications
            .values()
            .filter(move |a| a.template_id == template)
    }

    /// The `applied` application of `template` for the week starting `week_start`.
    pub(crate) fn active_application(
        &self,
        template: TemplateId,
        week_start: NaiveDate,
    ) -> Option<&TemplateApplication> {
        self.applications_of(template).find(|a| {
            a.week_start_date == week_start && a.status == ApplicationStatus::Applied
        })
    }

    pub(crate) fn put_application(&mut self, application: TemplateApplication) {
        let id = application.id;
        let prior = self.tables.applications.insert(id, application);
        self.journal.push(Undo::Application(id, prior));
    }
}

impl Drop for StoreTx<'_> {
    fn drop(&mut self) {
        if !self.committed && !self.journal.is_empty() {
            tracing::debug!(writes = self.journal.len(), "rolling back unit of work");
            self.rollback_to(Savepoint(0));
        }
    }
}

impl Tables {
    fn undo(&mut self, undo: Undo) {
        match undo {
            Undo::User(id, prior) => restore(&mut self.users, id, prior),
            Undo::Balance(id, prior) => restore(&mut self.balances, id, prior),
            Undo::TransactionAppended => {
                if let Some(tx) = self.transactions.pop() {
                    let position = self.transactions.len();
                    if let Some(booking) = tx.booking_id {
                        if self.deductions.get(&booking) == Some(&position) {
                            self.deductions.remove(&booking);
                        }
                    }
                }
            }
            Undo::Lesson(id, prior) => {
                if prior.is_none() {
                    if let Some(lesson) = self.lessons.get(&id) {
                        if let Some(ids) = self.lessons_by_teacher.get_mut(&lesson.teacher_id) {
                            ids.remove(&id);
                        }
                    }
                }
                restore(&mut self.lessons, id, prior);
            }
            Undo::Booking(id, prior) => {
                if prior.is_none() {
                    if let Some(booking) = self.bookings.get(&id) {
                        if let Some(ids) = self.bookings_by_student.get_mut(&booking.student_id) {
                            ids.remove(&id);
                        }
                        if let Some(ids) = self.bookings_by_lesson.get_mut(&booking.lesson_id) {
                            ids.remove(&id);
                        }
                    }
                }
                restore(&mut self.bookings, id, prior);
            }
            Undo::Cancelled(key, prior) => restore(&mut self.cancelled, key, prior),
            Undo::SwapAppended => {
                self.swaps.pop();
            }
            Undo::Template(id, prior) => restore(&mut self.templates, id, prior),
            Undo::Application(id, prior) => restore(&mut self.applications, id, prior),
        }
    }
}

fn restore<K: Ord, V>(table: &mut BTreeMap<K, V>, key: K, prior: Option<V>) {
    match prior {
        Some(row) => {
            table.insert(key, row);
        }
        None => {
            table.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::BookingStatus;
    use crate::lesson::LessonKind;
    use crate::user::Role;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 3, 9, 0, 0).unwrap()
    }

    fn seed_user(tx: &mut StoreTx<'_>, balance: Credits) -> UserId {
        let id = tx.next_user_id();
        tx.put_user(User {
            id,
            name: format!("user-{id}"),
            role: Role::Student,
            created_at: now(),
            deleted_at: None,
        });
        tx.put_balance(CreditBalance {
            user_id: id,
            balance,
            updated_at: now(),
        });
        id
    }

    fn seed_lesson(tx: &mut StoreTx<'_>, max_students: u32) -> LessonId {
        let id = tx.next_lesson_id();
        tx.put_lesson(Lesson {
            id,
            teacher_id: UserId(99),
            kind: LessonKind::Group,
            start_time: now(),
            end_time: now() + chrono::Duration::hours(1),
            max_students,
            current_students: 0,
            credits_cost: 2,
            created_at: now(),
            deleted_at: None,
        });
        id
    }

    #[test]
    fn committed_writes_persist() {
        let store = LedgerStore::new();
        let user = {
            let mut tx = store.begin().unwrap();
            let user = seed_user(&mut tx, 5);
            tx.commit();
            user
        };

        let tx = store.begin().unwrap();
        assert_eq!(tx.balance(user).unwrap().balance, 5);
    }

    #[test]
    fn dropped_unit_of_work_rolls_back() {
        let store = LedgerStore::new();
        let user = {
            let mut tx = store.begin().unwrap();
            let user = seed_user(&mut tx, 5);
            tx.commit();
            user
        };

        {
            let mut tx = store.begin().unwrap();
            tx.try_debit(user, 3, now()).unwrap();
            let lesson = seed_lesson(&mut tx, 4);
            tx.try_enroll(lesson).unwrap();
            assert_eq!(tx.balance(user).unwrap().balance, 2);
        }

        let tx = store.begin().unwrap();
        assert_eq!(tx.balance(user).unwrap().balance, 5);
        assert_eq!(tx.lessons().count(), 0);
        assert_eq!(tx.lessons_of_teacher(UserId(99)).count(), 0);
    }

    #[test]
    fn rollback_to_savepoint_keeps_earlier_writes() {
        let store = LedgerStore::new();
        let mut tx = store.begin().unwrap();
        let user = seed_user(&mut tx, 10);
        let lesson = seed_lesson(&mut tx, 4);

        let savepoint = tx.savepoint();
        assert!(tx.try_enroll(lesson).unwrap());
        tx.try_debit(user, 2, now()).unwrap();
        tx.rollback_to(savepoint);

        assert_eq!(tx.lesson(lesson).unwrap().current_students, 0);
        assert_eq!(tx.balance(user).unwrap().balance, 10);
        assert!(tx.user(user).is_some());
    }

    #[test]
    fn try_enroll_refuses_when_full() {
        let store = LedgerStore::new();
        let mut tx = store.begin().unwrap();
        let lesson = seed_lesson(&mut tx, 1);

        assert!(tx.try_enroll(lesson).unwrap());
        assert!(!tx.try_enroll(lesson).unwrap());
        assert_eq!(tx.lesson(lesson).unwrap().current_students, 1);
    }

    #[test]
    fn try_enroll_unknown_lesson_is_not_found() {
        let store = LedgerStore::new();
        let mut tx = store.begin().unwrap();
        assert_eq!(
            tx.try_enroll(LessonId(7)),
            Err(LedgerError::LessonNotFound(LessonId(7)))
        );
    }

    #[test]
    fn try_debit_is_conditional() {
        let store = LedgerStore::new();
        let mut tx = store.begin().unwrap();
        let user = seed_user(&mut tx, 3);

        assert_eq!(tx.try_debit(user, 4, now()).unwrap(), None);
        assert_eq!(tx.try_debit(user, 3, now()).unwrap(), Some((3, 0)));
        assert_eq!(tx.balance(user).unwrap().balance, 0);
    }

    #[test]
    fn try_credit_respects_ceiling() {
        let store = LedgerStore::new();
        let mut tx = store.begin().unwrap();
        let user = seed_user(&mut tx, 95);

        assert_eq!(tx.try_credit(user, 10, 100, now()).unwrap(), None);
        assert_eq!(tx.try_credit(user, 5, 100, now()).unwrap(), Some((95, 100)));
    }

    #[test]
    fn rolled_back_deduction_leaves_no_index_entry() {
        let store = LedgerStore::new();
        let mut tx = store.begin().unwrap();
        let user = seed_user(&mut tx, 3);
        let savepoint = tx.savepoint();
        let id = tx.next_transaction_id();
        tx.append_transaction(CreditTransaction {
            id,
            user_id: user,
            amount: 2,
            operation_type: OperationType::Deduct,
            reason: "Booking lesson".into(),
            performed_by: None,
            booking_id: Some(BookingId(1)),
            balance_before: 3,
            balance_after: 1,
            created_at: now(),
        });
        assert!(tx.deduction_for(BookingId(1)).is_some());

        tx.rollback_to(savepoint);
        assert!(tx.deduction_for(BookingId(1)).is_none());
        assert_eq!(tx.transactions_of(user).count(), 0);
    }

    #[test]
    fn rolled_back_booking_leaves_indexes_clean() {
        let store = LedgerStore::new();
        let mut tx = store.begin().unwrap();
        let lesson = seed_lesson(&mut tx, 4);
        let savepoint = tx.savepoint();
        let id = tx.next_booking_id();
        tx.put_booking(Booking {
            id,
            student_id: UserId(5),
            lesson_id: lesson,
            status: BookingStatus::Active,
            booked_at: now(),
            cancelled_at: None,
        });
        assert!(tx.active_booking(UserId(5), lesson).is_some());

        tx.rollback_to(savepoint);
        assert!(tx.active_booking(UserId(5), lesson).is_none());
        assert_eq!(tx.bookings_for_lesson(lesson).count(), 0);
    }

    #[test]
    fn sequences_are_not_rolled_back() {
        let store = LedgerStore::new();
        {
            let tx = store.begin().unwrap();
            assert_eq!(tx.next_booking_id(), BookingId(1));
        }
        let tx = store.begin().unwrap();
        assert_eq!(tx.next_booking_id(), BookingId(2));
    }

    #[test]
    fn suspended_store_refuses_work() {
        let store = LedgerStore::new();
        store.suspend();
        assert!(matches!(store.begin(), Err(LedgerError::StoreUnavailable)));

        store.resume();
        assert!(store.begin().is_ok());
    }
}
