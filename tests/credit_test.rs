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

//! Credit ledger integration tests: bounds, audit rows and reconciliation.

use chrono::{TimeZone, Utc};
use std::sync::Arc;
use tutor_ledger::{
    Engine, LedgerConfig, LedgerError, ManualClock, NewLesson, OperationType, Role, TopUpOutcome,
    UserId,
};

fn make_engine() -> Engine {
    let start = Utc.with_ymd_and_hms(2025, 3, 3, 8, 0, 0).unwrap();
    Engine::new().with_clock(Arc::new(ManualClock::new(start)))
}

fn make_student(engine: &Engine) -> UserId {
    engine.register_user("student", Role::Student).unwrap().id
}

#[test]
fn add_records_before_and_after() {
    let engine = make_engine();
    let student = make_student(&engine);
    let admin = engine.register_user("admin", Role::Admin).unwrap().id;

    let tx = engine
        .add_credits(student, 40, "Monthly package", Some(admin))
        .unwrap();
    assert_eq!(tx.operation_type, OperationType::Add);
    assert_eq!(tx.balance_before, 0);
    assert_eq!(tx.balance_after, 40);
    assert_eq!(tx.reason, "Monthly package");
    assert_eq!(tx.performed_by, Some(admin));
    assert_eq!(tx.booking_id, None);
    assert_eq!(engine.balance(student).unwrap(), 40);
}

#[test]
fn deduct_never_goes_negative() {
    let engine = make_engine();
    let student = make_student(&engine);
    engine.add_credits(student, 10, "Seed", None).unwrap();

    assert_eq!(
        engine.deduct_credits(student, 11, "Penalty", None),
        Err(LedgerError::InsufficientBalance {
            user: student,
            balance: 10,
            required: 11
        })
    );
    assert_eq!(engine.balance(student).unwrap(), 10);
    assert_eq!(engine.transactions(student).unwrap().len(), 1);

    engine.deduct_credits(student, 10, "Penalty", None).unwrap();
    assert_eq!(engine.balance(student).unwrap(), 0);
}

#[test]
fn add_respects_configured_ceiling() {
    let config = LedgerConfig {
        max_balance: 50,
        max_operation_amount: 50,
        ..LedgerConfig::default()
    };
    let engine = Engine::with_config(config).unwrap();
    let student = make_student(&engine);
    engine.add_credits(student, 50, "Seed", None).unwrap();

    assert_eq!(
        engine.add_credits(student, 1, "Bonus", None),
        Err(LedgerError::BalanceCeilingExceeded {
            user: student,
            balance: 50,
            amount: 1,
            max: 50
        })
    );
    assert_eq!(
        engine.refund_credits(student, 1, "Goodwill", None),
        Err(LedgerError::BalanceCeilingExceeded {
            user: student,
            balance: 50,
            amount: 1,
            max: 50
        })
    );
}

#[test]
fn request_amount_limits_apply_to_every_operation() {
    let engine = make_engine();
    let student = make_student(&engine);
    let limit = |amount| LedgerError::InvalidAmount {
        amount,
        min: 1,
        max: 100,
    };

    assert_eq!(engine.add_credits(student, 0, "Zero", None), Err(limit(0)));
    assert_eq!(engine.add_credits(student, 101, "Too much", None), Err(limit(101)));
    assert_eq!(engine.deduct_credits(student, 101, "Too much", None), Err(limit(101)));
    assert_eq!(engine.refund_credits(student, 0, "Zero", None), Err(limit(0)));
    assert!(engine.add_credits(student, 100, "Upper bound", None).is_ok());
}

#[test]
fn reason_is_required() {
    let engine = make_engine();
    let student = make_student(&engine);
    assert_eq!(
        engine.add_credits(student, 5, "", None),
        Err(LedgerError::EmptyReason)
    );
}

#[test]
fn inactive_user_cannot_receive_credits() {
    let engine = make_engine();
    let student = make_student(&engine);
    engine.deactivate_user(student).unwrap();
    assert_eq!(
        engine.add_credits(student, 5, "Late gift", None),
        Err(LedgerError::UserInactive(student))
    );
}

#[test]
fn unknown_user_is_not_found() {
    let engine = make_engine();
    assert_eq!(
        engine.add_credits(UserId(99), 5, "Gift", None),
        Err(LedgerError::UserNotFound(UserId(99)))
    );
    assert_eq!(engine.balance(UserId(99)), Err(LedgerError::UserNotFound(UserId(99))));
    assert_eq!(
        engine.transactions(UserId(99)),
        Err(LedgerError::UserNotFound(UserId(99)))
    );
}

#[test]
fn transaction_chain_reconstructs_balance() {
    let engine = make_engine();
    let teacher = engine.register_user("teacher", Role::Teacher).unwrap().id;
    let student = make_student(&engine);
    let start = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
    let lesson = engine
        .create_lesson(NewLesson::individual(teacher, start, start + chrono::Duration::hours(1), 7))
        .unwrap();

    engine.add_credits(student, 30, "Package", None).unwrap();
    let booking = engine.create_booking(student, lesson.id, false).unwrap();
    engine.deduct_credits(student, 4, "Material fee", None).unwrap();
    engine.cancel_booking(booking.id, student, false).unwrap();
    engine.refund_credits(student, 2, "Goodwill", None).unwrap();

    let log = engine.transactions(student).unwrap();
    let kinds: Vec<OperationType> = log.iter().map(|t| t.operation_type).collect();
    assert_eq!(
        kinds,
        vec![
            OperationType::Add,
            OperationType::Deduct,
            OperationType::Deduct,
            OperationType::Refund,
            OperationType::Refund,
        ]
    );
    for pair in log.windows(2) {
        assert_eq!(pair[0].balance_after, pair[1].balance_before);
    }
    assert!(log.iter().all(|t| t.is_consistent()));
    assert_eq!(log[1].booking_id, Some(booking.id));
    assert_eq!(log[3].booking_id, Some(booking.id));
    assert_eq!(log[3].amount, 7);

    let reconciliation = engine.reconcile(student).unwrap();
    assert!(reconciliation.is_balanced());
    assert_eq!(reconciliation.stored_balance, 28);
    assert_eq!(reconciliation.replayed_balance, 28);
    assert_eq!(reconciliation.transactions, 5);
}

#[test]
fn top_up_is_idempotent_per_key() {
    let engine = make_engine();
    let student = make_student(&engine);

    let first = engine.top_up("stripe-evt-1", student, 25, None).unwrap();
    let replay = engine.top_up("stripe-evt-1", student, 25, None).unwrap();
    let second = engine.top_up("stripe-evt-2", student, 25, None).unwrap();

    assert!(matches!(first, TopUpOutcome::Applied(_)));
    assert_eq!(replay, TopUpOutcome::Replayed(first.transaction().clone()));
    assert!(matches!(second, TopUpOutcome::Applied(_)));
    assert_eq!(engine.balance(student).unwrap(), 50);

    let other = make_student(&engine);
    assert_eq!(
        engine.top_up("stripe-evt-1", other, 25, None),
        Err(LedgerError::IdempotencyConflict("stripe-evt-1".into()))
    );
}
