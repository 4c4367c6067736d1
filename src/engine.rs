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

//! Ledger engine.
//!
//! The [`Engine`] is the entry point for every operation. Each public
//! operation runs as one unit of work: it opens a [`StoreTx`], runs the
//! capacity and credit checks inside it, and either commits everything or
//! rolls everything back. Domain events gathered along the way are published
//! only after the commit.
//!
//! # Operations
//!
//! | Area | Operations |
//! |------|------------|
//! | Users | [`register_user`](Engine::register_user), [`deactivate_user`](Engine::deactivate_user) |
//! | Lessons | [`create_lesson`](Engine::create_lesson), [`reschedule_lesson`](Engine::reschedule_lesson), [`delete_lesson`](Engine::delete_lesson) |
//! | Bookings | [`create_booking`](Engine::create_booking), [`cancel_booking`](Engine::cancel_booking) |
//! | Swaps | [`perform_swap`](Engine::perform_swap), [`validate_swap`](Engine::validate_swap) |
//! | Credits | [`add_credits`](Engine::add_credits), [`deduct_credits`](Engine::deduct_credits), [`refund_credits`](Engine::refund_credits), [`top_up`](Engine::top_up) |
//! | Templates | [`apply_template`](Engine::apply_template), [`rollback_application`](Engine::rollback_application) |
//!
//! # Thread Safety
//!
//! The engine is `Send + Sync`; share it behind an `Arc`. Units of work are
//! serialized by the store, so concurrent callers never observe a partial
//! operation.

use crate::base::{BookingId, LessonId, UserId};
use crate::booking::{self, Booking};
use crate::clock::{Clock, SystemClock};
use crate::config::LedgerConfig;
use crate::error::LedgerError;
use crate::events::{DomainEvent, EventSink, NullSink};
use crate::lesson::{Lesson, NewLesson};
use crate::store::{LedgerStore, Savepoint, StoreTx};
use crate::template::CleanupStats;
use crate::topup::TopUpRegistry;
use crate::user::{Role, User};
use crate::{capacity, credit::CreditBalance};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

/// Booking and credit ledger engine.
///
/// # Invariants
///
/// - `0 <= current_students <= max_students` for every lesson.
/// - `0 <= balance <= max_balance` for every user.
/// - Every balance change has exactly one credit transaction row.
/// - A cancelled booking never becomes active again, and its student cannot
///   book the same lesson again.
pub struct Engine {
    config: LedgerConfig,
    store: LedgerStore,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    pub(crate) top_ups: TopUpRegistry,
}

/// Context of one running unit of work.
pub(crate) struct UnitOfWork<'a> {
    pub(crate) tx: StoreTx<'a>,
    pub(crate) config: &'a LedgerConfig,
    pub(crate) now: DateTime<Utc>,
    events: Vec<DomainEvent>,
}

/// Position to roll a [`UnitOfWork`] back to, writes and events alike.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkSavepoint {
    store: Savepoint,
    events: usize,
}

impl<'a> UnitOfWork<'a> {
    fn new(tx: StoreTx<'a>, config: &'a LedgerConfig, now: DateTime<Utc>) -> Self {
        Self {
            tx,
            config,
            now,
            events: Vec::new(),
        }
    }

    pub(crate) fn emit(&mut self, event: DomainEvent) {
        self.events.push(event);
    }

    pub(crate) fn savepoint(&self) -> WorkSavepoint {
        WorkSavepoint {
            store: self.tx.savepoint(),
            events: self.events.len(),
        }
    }

    pub(crate) fn rollback_to(&mut self, savepoint: WorkSavepoint) {
        self.tx.rollback_to(savepoint.store);
        self.events.truncate(savepoint.events);
    }

    fn commit(self) -> Vec<DomainEvent> {
        self.tx.commit();
        self.events
    }

    /// Loads an active user.
    pub(crate) fn active_user(&self, id: UserId) -> Result<&User, LedgerError> {
        let user = self.tx.user(id).ok_or(LedgerError::UserNotFound(id))?;
        if !user.is_active() {
            return Err(LedgerError::UserInactive(id));
        }
        Ok(user)
    }

    /// Loads an active user holding `role`.
    pub(crate) fn user_with_role(&self, id: UserId, role: Role) -> Result<&User, LedgerError> {
        let user = self.active_user(id)?;
        if user.role != role {
            return Err(LedgerError::RoleMismatch {
                user: id,
                expected: role,
            });
        }
        Ok(user)
    }

    /// Loads a lesson that has not been soft-deleted.
    pub(crate) fn live_lesson(&self, id: LessonId) -> Result<Lesson, LedgerError> {
        let lesson = self.tx.lesson(id).ok_or(LedgerError::LessonNotFound(id))?;
        if lesson.is_deleted() {
            return Err(LedgerError::LessonDeleted(id));
        }
        Ok(lesson.clone())
    }

    /// Inserts a lesson after the teacher and schedule checks.
    pub(crate) fn schedule_lesson(&mut self, request: &NewLesson) -> Result<Lesson, LedgerError> {
        self.user_with_role(request.teacher_id, Role::Teacher)?;
        if let Some(conflicting_lesson) = capacity::find_teacher_overlap(
            self.tx.lessons_of_teacher(request.teacher_id),
            request.teacher_id,
            request.start_time,
            request.end_time,
            None,
        ) {
            return Err(LedgerError::TeacherOverlap {
                teacher: request.teacher_id,
                conflicting_lesson,
            });
        }

        let lesson = Lesson {
            id: self.tx.next_lesson_id(),
            teacher_id: request.teacher_id,
            kind: request.kind,
            start_time: request.start_time,
            end_time: request.end_time,
            max_students: request.max_students,
            current_students: 0,
            credits_cost: request.credits_cost,
            created_at: self.now,
            deleted_at: None,
        };
        self.tx.put_lesson(lesson.clone());
        Ok(lesson)
    }

    /// Cancels every active booking of a lesson (refunding deductions) and
    /// soft-deletes it.
    pub(crate) fn retire_lesson(&mut self, id: LessonId) -> Result<CleanupStats, LedgerError> {
        let mut lesson = self.live_lesson(id)?;
        let mut stats = CleanupStats::default();

        let active: Vec<Booking> = self
            .tx
            .bookings_for_lesson(id)
            .filter(|b| b.is_active())
            .cloned()
            .collect();
        for b in active {
            if let booking::CancelOutcome::Success { refunded } =
                booking::cancel(self, b.id, b.student_id, true)?
            {
                stats.cancelled_bookings += 1;
                stats.refunded_credits += refunded;
            }
        }

        // Cancellations above moved the seat counter; reload before deleting.
        lesson.current_students = self
            .tx
            .lesson(id)
            .map(|l| l.current_students)
            .unwrap_or(0);
        lesson.deleted_at = Some(self.now);
        let teacher_id = lesson.teacher_id;
        self.tx.put_lesson(lesson);
        stats.deleted_lessons += 1;

        self.emit(DomainEvent::LessonDeleted {
            lesson_id: id,
            teacher_id,
        });
        Ok(stats)
    }
}

impl Engine {
    /// Creates an engine with the default configuration, the system clock
    /// and no event subscriber.
    pub fn new() -> Self {
        Self::build(LedgerConfig::default())
    }

    /// Creates an engine with a custom configuration.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidConfig`] - Configuration values are inconsistent.
    pub fn with_config(config: LedgerConfig) -> Result<Self, LedgerError> {
        config.validate()?;
        Ok(Self::build(config))
    }

    fn build(config: LedgerConfig) -> Self {
        Engine {
            config,
            store: LedgerStore::new(),
            clock: Arc::new(SystemClock),
            events: Arc::new(NullSink),
            top_ups: TopUpRegistry::new(),
        }
    }

    /// Replaces the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replaces the subscriber receiving domain events after each commit.
    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Underlying store, for maintenance (suspend/resume).
    pub fn store(&self) -> &LedgerStore {
        &self.store
    }

    /// Runs `op` as one unit of work and commits it if it succeeds.
    ///
    /// On error every write made by `op` is rolled back and no event is
    /// published.
    pub(crate) fn transact<T>(
        &self,
        op: impl FnOnce(&mut UnitOfWork<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let tx = self.store.begin()?;
        let mut work = UnitOfWork::new(tx, &self.config, self.clock.now());
        let value = op(&mut work)?;
        for event in work.commit() {
            self.events.publish(event);
        }
        Ok(value)
    }

    /// Runs `op` as one unit of work and always rolls it back.
    pub(crate) fn rehearse<T>(
        &self,
        op: impl FnOnce(&mut UnitOfWork<'_>) -> Result<T, LedgerError>,
    ) -> Result<T, LedgerError> {
        let tx = self.store.begin()?;
        let mut work = UnitOfWork::new(tx, &self.config, self.clock.now());
        op(&mut work)
    }

    /// Runs a read-only query against a consistent view of the store.
    pub(crate) fn read<T>(&self, query: impl FnOnce(&StoreTx<'_>) -> T) -> Result<T, LedgerError> {
        let tx = self.store.begin()?;
        Ok(query(&tx))
    }

    // === Users ===

    /// Registers a user and opens their zero credit balance.
    pub fn register_user(&self, name: impl Into<String>, role: Role) -> Result<User, LedgerError> {
        let name = name.into();
        let user = self.transact(|work| {
            let user = User {
                id: work.tx.next_user_id(),
                name,
                role,
                created_at: work.now,
                deleted_at: None,
            };
            work.tx.put_user(user.clone());
            work.tx.put_balance(CreditBalance {
                user_id: user.id,
                balance: 0,
                updated_at: work.now,
            });
            Ok(user)
        })?;
        info!(user = %user.id, role = %user.role, "user registered");
        Ok(user)
    }

    /// Soft-deletes a user. Deactivating an inactive user is a no-op.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::UserNotFound`] - Unknown user.
    /// - [`LedgerError::UserHasActiveBookings`] - The user holds active bookings,
    ///   or teaches a live lesson that students are still booked on.
    pub fn deactivate_user(&self, id: UserId) -> Result<User, LedgerError> {
        self.transact(|work| {
            let mut user = work.tx.user(id).cloned().ok_or(LedgerError::UserNotFound(id))?;
            if !user.is_active() {
                return Ok(user);
            }
            if work.tx.bookings_of_student(id).any(|b| b.is_active()) {
                return Err(LedgerError::UserHasActiveBookings(id));
            }
            let teaches_booked_lesson = work
                .tx
                .lessons_of_teacher(id)
                .filter(|lesson| !lesson.is_deleted())
                .any(|lesson| work.tx.bookings_for_lesson(lesson.id).any(|b| b.is_active()));
            if teaches_booked_lesson {
                return Err(LedgerError::UserHasActiveBookings(id));
            }
            user.deleted_at = Some(work.now);
            work.tx.put_user(user.clone());
            info!(user = %id, "user deactivated");
            Ok(user)
        })
    }

    pub fn user(&self, id: UserId) -> Result<User, LedgerError> {
        self.read(|tx| tx.user(id).cloned())?
            .ok_or(LedgerError::UserNotFound(id))
    }

    /// All users, ordered by id.
    pub fn users(&self) -> Result<Vec<User>, LedgerError> {
        self.read(|tx| tx.users().cloned().collect())
    }

    // === Lessons ===

    /// Schedules a lesson.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidTimeRange`] / [`LedgerError::InvalidCapacity`] - Malformed request.
    /// - [`LedgerError::RoleMismatch`] - `teacher_id` is not a teacher.
    /// - [`LedgerError::TeacherOverlap`] - Teacher already teaches at that time.
    pub fn create_lesson(&self, request: NewLesson) -> Result<Lesson, LedgerError> {
        request.validate(self.config.group_min_students)?;
        let lesson = self.transact(|work| work.schedule_lesson(&request))?;
        info!(lesson = %lesson.id, teacher = %lesson.teacher_id, "lesson scheduled");
        Ok(lesson)
    }

    /// Moves a lesson to a new time range.
    pub fn reschedule_lesson(
        &self,
        id: LessonId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
    ) -> Result<Lesson, LedgerError> {
        if end_time <= start_time {
            return Err(LedgerError::InvalidTimeRange);
        }
        self.transact(|work| {
            let mut lesson = work.live_lesson(id)?;
            if let Some(conflicting_lesson) = capacity::find_teacher_overlap(
                work.tx.lessons_of_teacher(lesson.teacher_id),
                lesson.teacher_id,
                start_time,
                end_time,
                Some(id),
            ) {
                debug!(lesson = %id, conflicting = %conflicting_lesson, "reschedule rejected");
                return Err(LedgerError::TeacherOverlap {
                    teacher: lesson.teacher_id,
                    conflicting_lesson,
                });
            }
            lesson.start_time = start_time;
            lesson.end_time = end_time;
            work.tx.put_lesson(lesson.clone());
            info!(lesson = %id, "lesson rescheduled");
            Ok(lesson)
        })
    }

    /// Cancels all active bookings of a lesson with refunds and soft-deletes it.
    pub fn delete_lesson(&self, id: LessonId) -> Result<CleanupStats, LedgerError> {
        let stats = self.transact(|work| work.retire_lesson(id))?;
        info!(
            lesson = %id,
            cancelled = stats.cancelled_bookings,
            refunded = stats.refunded_credits,
            "lesson deleted"
        );
        Ok(stats)
    }

    pub fn lesson(&self, id: LessonId) -> Result<Lesson, LedgerError> {
        self.read(|tx| tx.lesson(id).cloned())?
            .ok_or(LedgerError::LessonNotFound(id))
    }

    /// All lessons, including soft-deleted ones, ordered by id.
    pub fn lessons(&self) -> Result<Vec<Lesson>, LedgerError> {
        self.read(|tx| tx.lessons().cloned().collect())
    }

    /// Non-deleted lessons of a teacher, ordered by start time.
    pub fn teacher_schedule(&self, teacher: UserId) -> Result<Vec<Lesson>, LedgerError> {
        let mut lessons: Vec<Lesson> = self.read(|tx| {
            tx.lessons_of_teacher(teacher)
                .filter(|l| !l.is_deleted())
                .cloned()
                .collect()
        })?;
        lessons.sort_by_key(|l| l.start_time);
        Ok(lessons)
    }

    // === Bookings (queries) ===

    pub fn booking(&self, id: BookingId) -> Result<Booking, LedgerError> {
        self.read(|tx| tx.booking(id).cloned())?
            .ok_or(LedgerError::BookingNotFound(id))
    }

    /// Every booking of a student, active and cancelled, ordered by id.
    pub fn student_bookings(&self, student: UserId) -> Result<Vec<Booking>, LedgerError> {
        self.read(|tx| tx.bookings_of_student(student).cloned().collect())
    }

    /// Active bookings of a lesson.
    pub fn lesson_roster(&self, lesson: LessonId) -> Result<Vec<Booking>, LedgerError> {
        self.read(|tx| {
            tx.bookings_for_lesson(lesson)
                .filter(|b| b.is_active())
                .cloned()
                .collect()
        })
    }

    /// Whether a past cancellation blocks `student` from booking `lesson`.
    pub fn is_blocked(&self, student: UserId, lesson: LessonId) -> Result<bool, LedgerError> {
        self.read(|tx| tx.cancelled(student, lesson).is_some())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
