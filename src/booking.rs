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

//! Bookings and cancellation history.
//!
//! Bookings follow a one-way state machine:
//!
//! ```text
//! (none) ──create──► Active ──cancel──► Cancelled
//! ```
//!
//! Creating a booking takes a seat and charges the lesson's cost in one
//! unit of work; cancelling frees the seat, refunds exactly what was charged
//! and records the cancellation so the student cannot book the lesson again.

use crate::Engine;
use crate::base::{BookingId, Credits, LessonId, UserId};
use crate::capacity;
use crate::engine::UnitOfWork;
use crate::error::LedgerError;
use crate::events::DomainEvent;
use crate::ledger::{self, Posting};
use crate::lesson::Lesson;
use crate::store::StoreTx;
use crate::user::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub(crate) const BOOKING_REASON: &str = "Booking lesson";
pub(crate) const CANCEL_REASON: &str = "Booking cancelled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Active,
    Cancelled,
}

/// A student's claim on a seat in a lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: BookingId,
    pub student_id: UserId,
    pub lesson_id: LessonId,
    pub status: BookingStatus,
    pub booked_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl Booking {
    pub fn is_active(&self) -> bool {
        self.status == BookingStatus::Active
    }
}

/// Record of a cancellation. Its presence blocks the student from booking
/// the same lesson again.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelledBooking {
    pub booking_id: BookingId,
    pub student_id: UserId,
    pub lesson_id: LessonId,
    pub cancelled_at: DateTime<Utc>,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CancelOutcome {
    /// Booking moved to `Cancelled`; `refunded` credits went back to the student.
    Success { refunded: Credits },
    /// Booking was already cancelled; nothing changed.
    AlreadyCancelled,
}

/// Books `student` into `lesson_id` inside the caller's unit of work.
///
/// The seat is taken before the balance is charged, so every operation
/// touches the lesson row before the balance row.
pub(crate) fn book(
    work: &mut UnitOfWork<'_>,
    student: UserId,
    lesson_id: LessonId,
    is_admin: bool,
) -> Result<Booking, LedgerError> {
    work.user_with_role(student, Role::Student)?;
    let lesson = work.live_lesson(lesson_id)?;

    if !capacity::can_enroll(&lesson) {
        debug!(lesson = %lesson_id, "lesson full");
        return Err(LedgerError::LessonFull(lesson_id));
    }
    if work.tx.cancelled(student, lesson_id).is_some() {
        return Err(LedgerError::AlreadyCancelledLesson {
            student,
            lesson: lesson_id,
        });
    }
    if work.tx.active_booking(student, lesson_id).is_some() {
        return Err(LedgerError::DuplicateActiveBooking {
            student,
            lesson: lesson_id,
        });
    }

    // Final re-check and increment in one conditional update.
    if !work.tx.try_enroll(lesson_id)? {
        return Err(LedgerError::LessonFull(lesson_id));
    }

    let id = work.tx.next_booking_id();
    let charged = if is_admin || lesson.credits_cost == 0 {
        0
    } else {
        let posting = Posting::new(student, lesson.credits_cost, BOOKING_REASON).for_booking(id);
        ledger::deduct(work, posting)?.amount
    };

    let booking = Booking {
        id,
        student_id: student,
        lesson_id,
        status: BookingStatus::Active,
        booked_at: work.now,
        cancelled_at: None,
    };
    work.tx.put_booking(booking.clone());
    work.emit(DomainEvent::BookingCreated {
        booking_id: id,
        student_id: student,
        lesson_id,
        charged,
    });
    Ok(booking)
}

/// Cancels a booking inside the caller's unit of work.
///
/// Refunds the amount of the deduction charged for this booking, and only
/// if such a deduction exists: bookings made by an admin without charge
/// are cancelled without refund.
pub(crate) fn cancel(
    work: &mut UnitOfWork<'_>,
    booking_id: BookingId,
    student: UserId,
    is_admin: bool,
) -> Result<CancelOutcome, LedgerError> {
    let mut booking = work
        .tx
        .booking(booking_id)
        .cloned()
        .ok_or(LedgerError::BookingNotFound(booking_id))?;
    if !is_admin && booking.student_id != student {
        return Err(LedgerError::BookingOwnerMismatch {
            booking: booking_id,
            student,
        });
    }
    if !booking.is_active() {
        return Ok(CancelOutcome::AlreadyCancelled);
    }

    let charged = work.tx.deduction_for(booking_id).map(|d| d.amount);

    booking.status = BookingStatus::Cancelled;
    booking.cancelled_at = Some(work.now);
    work.tx.put_booking(booking.clone());
    work.tx.release_seat(booking.lesson_id)?;

    let refunded = match charged {
        Some(amount) => {
            let posting =
                Posting::new(booking.student_id, amount, CANCEL_REASON).for_booking(booking_id);
            ledger::refund(work, posting)?.amount
        }
        None => 0,
    };

    work.tx.put_cancelled(CancelledBooking {
        booking_id,
        student_id: booking.student_id,
        lesson_id: booking.lesson_id,
        cancelled_at: work.now,
    });
    work.emit(DomainEvent::BookingCancelled {
        booking_id,
        student_id: booking.student_id,
        lesson_id: booking.lesson_id,
        refunded,
    });
    Ok(CancelOutcome::Success { refunded })
}

/// First lesson among the student's other active bookings that overlaps
/// `lesson`. Bookings on `lesson` itself and `exclude` are ignored.
pub(crate) fn student_conflict(
    tx: &StoreTx<'_>,
    student: UserId,
    lesson: &Lesson,
    exclude: Option<BookingId>,
) -> Option<LessonId> {
    let others = tx
        .bookings_of_student(student)
        .filter(|b| b.lesson_id != lesson.id)
        .filter_map(|b| tx.lesson(b.lesson_id).map(|l| (b, l)));
    capacity::find_student_conflict(others, lesson.start_time, lesson.end_time, exclude)
}

impl Engine {
    /// Books a seat for `student` in `lesson`.
    ///
    /// Admin bookings are free; otherwise the lesson's cost is deducted from
    /// the student's balance in the same unit of work.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::LessonNotFound`] / [`LedgerError::LessonDeleted`] - No bookable lesson.
    /// - [`LedgerError::LessonFull`] - No free seat (also when a concurrent booking took the last one).
    /// - [`LedgerError::AlreadyCancelledLesson`] - Student cancelled this lesson before.
    /// - [`LedgerError::DuplicateActiveBooking`] - Student already booked this lesson.
    /// - [`LedgerError::InsufficientBalance`] - Balance does not cover the cost.
    pub fn create_booking(
        &self,
        student: UserId,
        lesson: LessonId,
        is_admin: bool,
    ) -> Result<Booking, LedgerError> {
        let booking = self.transact(|work| book(work, student, lesson, is_admin))?;
        info!(booking = %booking.id, student = %student, lesson = %lesson, "booking created");
        Ok(booking)
    }

    /// Cancels a booking, refunding what it was charged.
    ///
    /// Cancelling an already cancelled booking returns
    /// [`CancelOutcome::AlreadyCancelled`] and changes nothing.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::BookingNotFound`] - Unknown booking.
    /// - [`LedgerError::BookingOwnerMismatch`] - Non-admin caller does not own the booking.
    /// - [`LedgerError::BalanceCeilingExceeded`] - Refund would pass `max_balance`.
    pub fn cancel_booking(
        &self,
        booking: BookingId,
        student: UserId,
        is_admin: bool,
    ) -> Result<CancelOutcome, LedgerError> {
        let outcome = self.transact(|work| cancel(work, booking, student, is_admin))?;
        info!(booking = %booking, ?outcome, "booking cancellation processed");
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(CancelOutcome::Success { refunded: 2 }).unwrap();
        assert_eq!(json["status"], "success");
        assert_eq!(json["refunded"], 2);

        let json = serde_json::to_value(CancelOutcome::AlreadyCancelled).unwrap();
        assert_eq!(json["status"], "already_cancelled");
    }
}
