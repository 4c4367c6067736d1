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

//! Error types for ledger operations.
//!
//! Every failure is a distinct variant carrying the ids of the offending
//! entities, so the API layer can build an actionable message without
//! parsing strings. [`LedgerError::kind`] groups the variants into the four
//! families callers care about.

use crate::base::{ApplicationId, BookingId, Credits, LessonId, TemplateId, UserId};
use crate::lesson::LessonKind;
use crate::template::ApplicationStatus;
use crate::user::Role;
use chrono::NaiveDate;
use thiserror::Error;

/// Coarse classification of a [`LedgerError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request itself is malformed; rejected before any unit of work opens.
    Validation,
    /// A referenced entity does not exist.
    NotFound,
    /// A business rule would be violated; the unit of work was rolled back.
    Invariant,
    /// The store could not run the unit of work. Safe to retry.
    Infrastructure,
}

/// Ledger operation errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    // === Validation ===
    /// Amount outside the accepted per-operation range
    #[error("invalid amount {amount} (must be between {min} and {max})")]
    InvalidAmount { amount: Credits, min: Credits, max: Credits },

    /// Ledger engine was handed a zero amount
    #[error("amount must be positive")]
    ZeroAmount,

    /// Reason text is required for every credit movement
    #[error("reason must not be empty")]
    EmptyReason,

    /// End of a time range is not after its start
    #[error("invalid time range (end must be after start)")]
    InvalidTimeRange,

    /// Capacity does not fit the lesson kind
    #[error("invalid capacity {max_students} for {kind} lesson")]
    InvalidCapacity { kind: LessonKind, max_students: u32 },

    /// Top-ups need a caller-supplied idempotency key
    #[error("idempotency key must not be empty")]
    EmptyIdempotencyKey,

    /// Template application must start on a Monday
    #[error("week start {0} is not a Monday")]
    NotMonday(NaiveDate),

    /// Template entry pre-assigns more students than it has seats
    #[error("template entry assigns {assigned} students to {max_students} seats")]
    TooManyTemplateStudents { assigned: usize, max_students: u32 },

    /// User does not have the role the operation requires
    #[error("user {user} is not a {expected}")]
    RoleMismatch { user: UserId, expected: Role },

    /// Configuration values are inconsistent
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // === Not found ===
    #[error("user {0} not found")]
    UserNotFound(UserId),

    #[error("lesson {0} not found")]
    LessonNotFound(LessonId),

    #[error("booking {0} not found")]
    BookingNotFound(BookingId),

    #[error("template {0} not found")]
    TemplateNotFound(TemplateId),

    #[error("template application {0} not found")]
    ApplicationNotFound(ApplicationId),

    // === Invariant violations ===
    /// Lesson has no free seat
    #[error("lesson {0} is full")]
    LessonFull(LessonId),

    /// Lesson was soft-deleted
    #[error("lesson {0} has been deleted")]
    LessonDeleted(LessonId),

    /// User was soft-deleted
    #[error("user {0} is inactive")]
    UserInactive(UserId),

    /// Balance does not cover the requested amount
    #[error("insufficient balance for user {user}: balance {balance}, required {required}")]
    InsufficientBalance { user: UserId, balance: Credits, required: Credits },

    /// Balance would exceed the configured ceiling
    #[error("balance ceiling exceeded for user {user}: balance {balance} + {amount} > {max}")]
    BalanceCeilingExceeded { user: UserId, balance: Credits, amount: Credits, max: Credits },

    /// Student already holds an overlapping active booking
    #[error("student {student} has a conflicting booking in lesson {conflicting_lesson}")]
    ScheduleConflict { student: UserId, conflicting_lesson: LessonId },

    /// Teacher already teaches an overlapping lesson
    #[error("teacher {teacher} already teaches overlapping lesson {conflicting_lesson}")]
    TeacherOverlap { teacher: UserId, conflicting_lesson: LessonId },

    /// Student cancelled this lesson before and cannot re-book it
    #[error("student {student} already cancelled lesson {lesson}")]
    AlreadyCancelledLesson { student: UserId, lesson: LessonId },

    /// Student already holds an active booking for this lesson
    #[error("student {student} already has an active booking for lesson {lesson}")]
    DuplicateActiveBooking { student: UserId, lesson: LessonId },

    /// Swap source and target are the same lesson
    #[error("cannot swap lesson {0} with itself")]
    SameLessonSwap(LessonId),

    /// Student has no active booking on the lesson being swapped away
    #[error("student {student} has no active booking for lesson {lesson}")]
    NoActiveBooking { student: UserId, lesson: LessonId },

    /// Booking belongs to a different student
    #[error("booking {booking} does not belong to student {student}")]
    BookingOwnerMismatch { booking: BookingId, student: UserId },

    /// Template application is not in a state that allows the operation
    #[error("template application {application} is {status}")]
    InvalidApplicationState { application: ApplicationId, status: ApplicationStatus },

    /// User still holds active bookings, as a student or on lessons they teach
    #[error("user {0} still has active bookings")]
    UserHasActiveBookings(UserId),

    /// Idempotency key was reused for a different top-up
    #[error("idempotency key '{0}' was already used for a different top-up")]
    IdempotencyConflict(String),

    // === Infrastructure ===
    /// Store is not accepting units of work
    #[error("ledger store unavailable")]
    StoreUnavailable,
}

impl LedgerError {
    pub fn kind(&self) -> ErrorKind {
        use LedgerError::*;
        match self {
            InvalidAmount { .. }
            | ZeroAmount
            | EmptyReason
            | EmptyIdempotencyKey
            | InvalidTimeRange
            | InvalidCapacity { .. }
            | NotMonday(_)
            | TooManyTemplateStudents { .. }
            | RoleMismatch { .. }
            | InvalidConfig(_) => ErrorKind::Validation,
            UserNotFound(_)
            | LessonNotFound(_)
            | BookingNotFound(_)
            | TemplateNotFound(_)
            | ApplicationNotFound(_) => ErrorKind::NotFound,
            StoreUnavailable => ErrorKind::Infrastructure,
            _ => ErrorKind::Invariant,
        }
    }

    /// Whether re-running the same operation unchanged may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::Infrastructure
    }
}
