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

//! Booking, cancellation and lesson lifecycle integration tests.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;
use tutor_ledger::{
    BookingStatus, CancelOutcome, ChannelSink, Credits, DomainEvent, Engine, LedgerError,
    LessonId, ManualClock, NewLesson, OperationType, Role, UserId,
};

fn monday(hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 3, hour, 0, 0).unwrap()
}

fn make_engine() -> Engine {
    Engine::new().with_clock(Arc::new(ManualClock::new(monday(8))))
}

fn make_teacher(engine: &Engine) -> UserId {
    engine.register_user("teacher", Role::Teacher).unwrap().id
}

fn make_student(engine: &Engine, credits: Credits) -> UserId {
    let id = engine.register_user("student", Role::Student).unwrap().id;
    if credits > 0 {
        engine.add_credits(id, credits, "Initial credits", None).unwrap();
    }
    id
}

fn make_individual(engine: &Engine, teacher: UserId, hour: u32, cost: Credits) -> LessonId {
    engine
        .create_lesson(NewLesson::individual(teacher, monday(hour), monday(hour + 1), cost))
        .unwrap()
        .id
}

fn make_group(engine: &Engine, teacher: UserId, hour: u32, seats: u32, cost: Credits) -> LessonId {
    engine
        .create_lesson(NewLesson::group(teacher, monday(hour), monday(hour + 1), seats, cost))
        .unwrap()
        .id
}

// === Booking and cancellation ===

#[test]
fn booking_takes_seat_and_charges_cost() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 2);
    let first = make_student(&engine, 2);
    let second = make_student(&engine, 2);

    let booking = engine.create_booking(first, lesson, false).unwrap();
    assert_eq!(booking.status, BookingStatus::Active);
    assert_eq!(booking.booked_at, monday(8));
    assert_eq!(engine.balance(first).unwrap(), 0);
    assert_eq!(engine.lesson(lesson).unwrap().current_students, 1);

    assert_eq!(
        engine.create_booking(second, lesson, false),
        Err(LedgerError::LessonFull(lesson))
    );
    assert_eq!(engine.balance(second).unwrap(), 2);
}

#[test]
fn cancellation_refunds_and_blocks_rebooking() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 2);
    let student = make_student(&engine, 2);
    let booking = engine.create_booking(student, lesson, false).unwrap();

    let outcome = engine.cancel_booking(booking.id, student, false).unwrap();
    assert_eq!(outcome, CancelOutcome::Success { refunded: 2 });
    assert_eq!(engine.balance(student).unwrap(), 2);
    assert_eq!(engine.lesson(lesson).unwrap().current_students, 0);
    assert!(engine.is_blocked(student, lesson).unwrap());

    assert_eq!(
        engine.create_booking(student, lesson, false),
        Err(LedgerError::AlreadyCancelledLesson { student, lesson })
    );
}

#[test]
fn second_cancel_is_a_no_op() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 3);
    let student = make_student(&engine, 5);
    let booking = engine.create_booking(student, lesson, false).unwrap();

    engine.cancel_booking(booking.id, student, false).unwrap();
    let again = engine.cancel_booking(booking.id, student, false).unwrap();

    assert_eq!(again, CancelOutcome::AlreadyCancelled);
    assert_eq!(engine.balance(student).unwrap(), 5);
    let refunds = engine
        .transactions(student)
        .unwrap()
        .into_iter()
        .filter(|t| t.operation_type == OperationType::Refund)
        .count();
    assert_eq!(refunds, 1);
}

// === Atomicity ===

#[test]
fn insufficient_balance_leaves_no_booking() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 3);
    let student = make_student(&engine, 2);

    assert_eq!(
        engine.create_booking(student, lesson, false),
        Err(LedgerError::InsufficientBalance {
            user: student,
            balance: 2,
            required: 3
        })
    );
    assert_eq!(engine.lesson(lesson).unwrap().current_students, 0);
    assert!(engine.student_bookings(student).unwrap().is_empty());
    assert!(engine.lesson_roster(lesson).unwrap().is_empty());
    assert_eq!(engine.transactions(student).unwrap().len(), 1);
}

#[test]
fn store_outage_rejects_booking_without_side_effects() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 1);
    let student = make_student(&engine, 2);

    engine.store().suspend();
    let result = engine.create_booking(student, lesson, false);
    assert_eq!(result, Err(LedgerError::StoreUnavailable));
    assert!(result.unwrap_err().is_retryable());

    engine.store().resume();
    assert_eq!(engine.lesson(lesson).unwrap().current_students, 0);
    assert!(engine.create_booking(student, lesson, false).is_ok());
}

// === Booking rules ===

#[test]
fn duplicate_active_booking_is_rejected() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_group(&engine, teacher, 10, 4, 1);
    let student = make_student(&engine, 5);
    engine.create_booking(student, lesson, false).unwrap();

    assert_eq!(
        engine.create_booking(student, lesson, false),
        Err(LedgerError::DuplicateActiveBooking { student, lesson })
    );
    assert_eq!(engine.lesson(lesson).unwrap().current_students, 1);
    assert_eq!(engine.balance(student).unwrap(), 4);
}

#[test]
fn group_lesson_fills_to_capacity() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_group(&engine, teacher, 10, 4, 1);

    let students: Vec<UserId> = (0..5).map(|_| make_student(&engine, 1)).collect();
    for &student in &students[..4] {
        engine.create_booking(student, lesson, false).unwrap();
    }
    assert_eq!(
        engine.create_booking(students[4], lesson, false),
        Err(LedgerError::LessonFull(lesson))
    );

    let lesson = engine.lesson(lesson).unwrap();
    assert_eq!(lesson.current_students, 4);
    assert_eq!(lesson.free_seats(), 0);
}

#[test]
fn only_students_can_book() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 0);

    assert_eq!(
        engine.create_booking(teacher, lesson, false),
        Err(LedgerError::RoleMismatch {
            user: teacher,
            expected: Role::Student
        })
    );
}

#[test]
fn unknown_lesson_is_not_found() {
    let engine = make_engine();
    let student = make_student(&engine, 2);
    assert_eq!(
        engine.create_booking(student, LessonId(404), false),
        Err(LedgerError::LessonNotFound(LessonId(404)))
    );
}

#[test]
fn free_lesson_books_without_transaction() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 0);
    let student = make_student(&engine, 0);

    let booking = engine.create_booking(student, lesson, false).unwrap();
    assert!(engine.transactions(student).unwrap().is_empty());

    let outcome = engine.cancel_booking(booking.id, student, false).unwrap();
    assert_eq!(outcome, CancelOutcome::Success { refunded: 0 });
    assert!(engine.transactions(student).unwrap().is_empty());
}

// === Admin bookings ===

#[test]
fn admin_booking_is_free_and_cancels_without_refund() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 2);
    let student = make_student(&engine, 1);

    let booking = engine.create_booking(student, lesson, true).unwrap();
    assert_eq!(engine.balance(student).unwrap(), 1);

    let outcome = engine.cancel_booking(booking.id, student, false).unwrap();
    assert_eq!(outcome, CancelOutcome::Success { refunded: 0 });
    assert_eq!(engine.balance(student).unwrap(), 1);
}

#[test]
fn only_owner_or_admin_may_cancel() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 2);
    let owner = make_student(&engine, 2);
    let other = make_student(&engine, 0);
    let booking = engine.create_booking(owner, lesson, false).unwrap();

    assert_eq!(
        engine.cancel_booking(booking.id, other, false),
        Err(LedgerError::BookingOwnerMismatch {
            booking: booking.id,
            student: other
        })
    );
    assert_eq!(
        engine.cancel_booking(booking.id, other, true).unwrap(),
        CancelOutcome::Success { refunded: 2 }
    );
    assert_eq!(engine.balance(owner).unwrap(), 2);
}

#[test]
fn refund_above_ceiling_keeps_booking_active() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 5);
    let student = make_student(&engine, 5);
    let booking = engine.create_booking(student, lesson, false).unwrap();

    // Refill to the ceiling so the refund no longer fits.
    for _ in 0..100 {
        engine.add_credits(student, 100, "Refill", None).unwrap();
    }
    assert_eq!(engine.balance(student).unwrap(), 10_000);

    assert_eq!(
        engine.cancel_booking(booking.id, student, false),
        Err(LedgerError::BalanceCeilingExceeded {
            user: student,
            balance: 10_000,
            amount: 5,
            max: 10_000
        })
    );
    assert_eq!(engine.booking(booking.id).unwrap().status, BookingStatus::Active);
    assert_eq!(engine.lesson(lesson).unwrap().current_students, 1);
    assert!(!engine.is_blocked(student, lesson).unwrap());
}

// === Lessons ===

#[test]
fn teacher_cannot_double_book_a_slot() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 1);

    let overlapping = NewLesson::individual(
        teacher,
        monday(10) + Duration::minutes(30),
        monday(11) + Duration::minutes(30),
        1,
    );
    assert_eq!(
        engine.create_lesson(overlapping),
        Err(LedgerError::TeacherOverlap {
            teacher,
            conflicting_lesson: lesson
        })
    );

    // Back-to-back is fine.
    make_individual(&engine, teacher, 11, 1);
    assert_eq!(engine.teacher_schedule(teacher).unwrap().len(), 2);
}

#[test]
fn reschedule_onto_another_lesson_of_the_teacher_is_rejected() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let first = make_individual(&engine, teacher, 10, 1);
    let second = make_individual(&engine, teacher, 12, 1);

    assert_eq!(
        engine.reschedule_lesson(second, monday(10) + Duration::minutes(30), monday(11)),
        Err(LedgerError::TeacherOverlap {
            teacher,
            conflicting_lesson: first
        })
    );
    let unchanged = engine.lesson(second).unwrap();
    assert_eq!(unchanged.start_time, monday(12));
    assert_eq!(unchanged.end_time, monday(13));

    let moved = engine.reschedule_lesson(second, monday(11), monday(12)).unwrap();
    assert_eq!(moved.start_time, monday(11));
    assert_eq!(engine.lesson(second).unwrap().end_time, monday(12));
}

#[test]
fn reschedule_rejects_bad_range_and_deleted_lessons() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 1);

    assert_eq!(
        engine.reschedule_lesson(lesson, monday(11), monday(11)),
        Err(LedgerError::InvalidTimeRange)
    );
    assert_eq!(
        engine.reschedule_lesson(lesson, monday(12), monday(11)),
        Err(LedgerError::InvalidTimeRange)
    );
    assert_eq!(engine.lesson(lesson).unwrap().start_time, monday(10));

    engine.delete_lesson(lesson).unwrap();
    assert_eq!(
        engine.reschedule_lesson(lesson, monday(14), monday(15)),
        Err(LedgerError::LessonDeleted(lesson))
    );
}

#[test]
fn in_between_capacities_are_rejected() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    for seats in [2, 3] {
        let result = engine.create_lesson(NewLesson::group(teacher, monday(10), monday(11), seats, 1));
        assert!(matches!(result, Err(LedgerError::InvalidCapacity { .. })));
    }
    let result = engine.create_lesson(NewLesson::individual(teacher, monday(11), monday(10), 1));
    assert_eq!(result, Err(LedgerError::InvalidTimeRange));
}

#[test]
fn deleting_lesson_refunds_everyone() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_group(&engine, teacher, 10, 4, 3);
    let students: Vec<UserId> = (0..3).map(|_| make_student(&engine, 3)).collect();
    for &student in &students {
        engine.create_booking(student, lesson, false).unwrap();
    }

    let stats = engine.delete_lesson(lesson).unwrap();
    assert_eq!(stats.cancelled_bookings, 3);
    assert_eq!(stats.refunded_credits, 9);
    assert_eq!(stats.deleted_lessons, 1);

    for &student in &students {
        assert_eq!(engine.balance(student).unwrap(), 3);
    }
    let lesson_row = engine.lesson(lesson).unwrap();
    assert!(lesson_row.is_deleted());
    assert_eq!(lesson_row.current_students, 0);
    assert_eq!(
        engine.create_booking(make_student(&engine, 3), lesson, false),
        Err(LedgerError::LessonDeleted(lesson))
    );
    assert_eq!(engine.delete_lesson(lesson), Err(LedgerError::LessonDeleted(lesson)));
}

// === Users ===

#[test]
fn deactivation_requires_no_active_bookings() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 1);
    let student = make_student(&engine, 1);
    let booking = engine.create_booking(student, lesson, false).unwrap();

    assert_eq!(
        engine.deactivate_user(student),
        Err(LedgerError::UserHasActiveBookings(student))
    );
    engine.cancel_booking(booking.id, student, false).unwrap();
    let user = engine.deactivate_user(student).unwrap();
    assert!(!user.is_active());

    let other = make_individual(&engine, teacher, 12, 1);
    assert_eq!(
        engine.create_booking(student, other, false),
        Err(LedgerError::UserInactive(student))
    );
}

#[test]
fn teacher_with_booked_lessons_cannot_be_deactivated() {
    let engine = make_engine();
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 1);
    make_individual(&engine, teacher, 12, 1);
    let student = make_student(&engine, 1);
    let booking = engine.create_booking(student, lesson, false).unwrap();

    assert_eq!(
        engine.deactivate_user(teacher),
        Err(LedgerError::UserHasActiveBookings(teacher))
    );
    assert!(engine.user(teacher).unwrap().is_active());

    engine.cancel_booking(booking.id, student, false).unwrap();
    assert!(!engine.deactivate_user(teacher).unwrap().is_active());
}

// === Events ===

#[test]
fn events_are_published_only_for_committed_work() {
    let (sink, events) = ChannelSink::new();
    let engine = make_engine().with_event_sink(Arc::new(sink));
    let teacher = make_teacher(&engine);
    let lesson = make_individual(&engine, teacher, 10, 2);
    let rich = make_student(&engine, 2);
    let poor = make_student(&engine, 0);

    let booking = engine.create_booking(rich, lesson, false).unwrap();
    let _ = engine.create_booking(poor, lesson, false);
    engine.cancel_booking(booking.id, rich, false).unwrap();

    let published: Vec<DomainEvent> = events.try_iter().collect();
    assert_eq!(
        published,
        vec![
            DomainEvent::BookingCreated {
                booking_id: booking.id,
                student_id: rich,
                lesson_id: lesson,
                charged: 2
            },
            DomainEvent::BookingCancelled {
                booking_id: booking.id,
                student_id: rich,
                lesson_id: lesson,
                refunded: 2
            },
        ]
    );
}
