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

//! Lesson swaps.
//!
//! A swap moves a student from one lesson to another in a single unit of
//! work: the old booking is cancelled (and refunded), then a new booking is
//! created (and charged). If the second half fails, the first half is rolled
//! back with it and the student keeps the original booking.

use crate::Engine;
use crate::base::{BookingId, Credits, LessonId, SwapId, UserId};
use crate::booking::{self, CancelOutcome};
use crate::capacity;
use crate::engine::UnitOfWork;
use crate::error::LedgerError;
use crate::events::DomainEvent;
use crate::store::StoreTx;
use crate::user::Role;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// History row pairing the cancelled and the created booking of one swap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Swap {
    pub id: SwapId,
    pub student_id: UserId,
    pub old_lesson_id: LessonId,
    pub new_lesson_id: LessonId,
    pub old_booking_id: BookingId,
    pub new_booking_id: BookingId,
    pub created_at: DateTime<Utc>,
}

/// Dry-run result of a swap request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapPreview {
    /// Credits the cancellation would return.
    pub refund: Credits,
    /// Credits the new booking would cost.
    pub charge: Credits,
    /// Every constraint the swap would violate. Empty when the swap can go ahead.
    pub violations: Vec<LedgerError>,
}

impl SwapPreview {
    pub fn is_allowed(&self) -> bool {
        self.violations.is_empty()
    }
}

fn swap(
    work: &mut UnitOfWork<'_>,
    student: UserId,
    old_lesson: LessonId,
    new_lesson: LessonId,
) -> Result<Swap, LedgerError> {
    let old_booking = work
        .tx
        .active_booking(student, old_lesson)
        .cloned()
        .ok_or(LedgerError::NoActiveBooking {
            student,
            lesson: old_lesson,
        })?;

    if let CancelOutcome::AlreadyCancelled = booking::cancel(work, old_booking.id, student, false)? {
        return Err(LedgerError::NoActiveBooking {
            student,
            lesson: old_lesson,
        });
    }

    let target = work.live_lesson(new_lesson)?;
    if let Some(conflicting_lesson) =
        booking::student_conflict(&work.tx, student, &target, Some(old_booking.id))
    {
        debug!(student = %student, lesson = %new_lesson, conflicting = %conflicting_lesson, "swap conflicts");
        return Err(LedgerError::ScheduleConflict {
            student,
            conflicting_lesson,
        });
    }
    let new_booking = booking::book(work, student, new_lesson, false)?;

    let swap = Swap {
        id: work.tx.next_swap_id(),
        student_id: student,
        old_lesson_id: old_lesson,
        new_lesson_id: new_lesson,
        old_booking_id: old_booking.id,
        new_booking_id: new_booking.id,
        created_at: work.now,
    };
    work.tx.append_swap(swap.clone());
    work.emit(DomainEvent::SwapPerformed {
        swap_id: swap.id,
        student_id: student,
        old_lesson_id: old_lesson,
        new_lesson_id: new_lesson,
    });
    Ok(swap)
}

/// Collects every violation a swap would hit, without writing anything.
fn preview(
    tx: &StoreTx<'_>,
    max_balance: Credits,
    student: UserId,
    old_lesson: LessonId,
    new_lesson: LessonId,
) -> SwapPreview {
    let mut preview = SwapPreview {
        refund: 0,
        charge: 0,
        violations: Vec::new(),
    };
    let violations = &mut preview.violations;

    if old_lesson == new_lesson {
        violations.push(LedgerError::SameLessonSwap(old_lesson));
    }

    match tx.user(student) {
        None => {
            violations.push(LedgerError::UserNotFound(student));
            return preview;
        }
        Some(user) if !user.is_active() => violations.push(LedgerError::UserInactive(student)),
        Some(user) if user.role != Role::Student => violations.push(LedgerError::RoleMismatch {
            user: student,
            expected: Role::Student,
        }),
        Some(_) => {}
    }

    let old_booking = tx.active_booking(student, old_lesson);
    match old_booking {
        Some(b) => preview.refund = tx.deduction_for(b.id).map_or(0, |d| d.amount),
        None => violations.push(LedgerError::NoActiveBooking {
            student,
            lesson: old_lesson,
        }),
    }

    let Some(target) = tx.lesson(new_lesson) else {
        violations.push(LedgerError::LessonNotFound(new_lesson));
        return preview;
    };
    if target.is_deleted() {
        violations.push(LedgerError::LessonDeleted(new_lesson));
    } else if !capacity::can_enroll(target) {
        violations.push(LedgerError::LessonFull(new_lesson));
    }
    if tx.cancelled(student, new_lesson).is_some() {
        violations.push(LedgerError::AlreadyCancelledLesson {
            student,
            lesson: new_lesson,
        });
    }
    if old_lesson != new_lesson && tx.active_booking(student, new_lesson).is_some() {
        violations.push(LedgerError::DuplicateActiveBooking {
            student,
            lesson: new_lesson,
        });
    }

    preview.charge = target.credits_cost;
    let balance = tx.balance(student).map_or(0, |b| b.balance);
    let after_refund = balance.saturating_add(preview.refund);
    if after_refund > max_balance {
        violations.push(LedgerError::BalanceCeilingExceeded {
            user: student,
            balance,
            amount: preview.refund,
            max: max_balance,
        });
    }
    if after_refund < preview.charge {
        violations.push(LedgerError::InsufficientBalance {
            user: student,
            balance: after_refund,
            required: preview.charge,
        });
    }

    if let Some(conflicting_lesson) =
        booking::student_conflict(tx, student, target, old_booking.map(|b| b.id))
    {
        violations.push(LedgerError::ScheduleConflict {
            student,
            conflicting_lesson,
        });
    }
    preview
}

impl Engine {
    /// Moves `student` from `old_lesson` to `new_lesson` atomically.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::SameLessonSwap`] - Both lessons are the same.
    /// - [`LedgerError::NoActiveBooking`] - Student holds no active booking on `old_lesson`.
    /// - [`LedgerError::ScheduleConflict`] - Another active booking overlaps `new_lesson`.
    /// - Any error of [`Engine::create_booking`] for `new_lesson`.
    ///
    /// On any error the original booking stays active and no credits move.
    pub fn perform_swap(
        &self,
        student: UserId,
        old_lesson: LessonId,
        new_lesson: LessonId,
    ) -> Result<Swap, LedgerError> {
        if old_lesson == new_lesson {
            return Err(LedgerError::SameLessonSwap(old_lesson));
        }
        let swap = self.transact(|work| swap(work, student, old_lesson, new_lesson))?;
        info!(
            swap = %swap.id,
            student = %student,
            from = %old_lesson,
            to = %new_lesson,
            "swap performed"
        );
        Ok(swap)
    }

    /// Reports what [`Engine::perform_swap`] would do, without changing anything.
    pub fn validate_swap(
        &self,
        student: UserId,
        old_lesson: LessonId,
        new_lesson: LessonId,
    ) -> Result<SwapPreview, LedgerError> {
        let max_balance = self.config().max_balance;
        self.read(|tx| preview(tx, max_balance, student, old_lesson, new_lesson))
    }

    /// Swap history of a student, oldest first.
    pub fn swaps(&self, student: UserId) -> Result<Vec<Swap>, LedgerError> {
        self.read(|tx| tx.swaps_of(student).cloned().collect())
    }
}
