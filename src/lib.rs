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

//! # Tutor Ledger
//!
//! Booking and credit ledger for a tutoring platform. Students spend credits
//! to book seats in lessons; every operation keeps lesson capacity, student
//! bookings and credit balances consistent, even under concurrent access.
//!
//! ## Core Components
//!
//! - [`Engine`]: Entry point running every operation as one unit of work
//! - [`Lesson`] / [`LessonKind`]: Scheduled slots with a validated capacity
//! - [`Booking`]: A student's seat in a lesson, with cancellation history
//! - [`CreditTransaction`]: Append-only audit row for every balance change
//! - [`Swap`]: Atomic move of a student from one lesson to another
//! - [`LessonTemplate`]: Recurring week applied in bulk
//! - [`LedgerError`]: Typed failures grouped by [`ErrorKind`]
//!
//! ## Example
//!
//! ```
//! use tutor_ledger::{Engine, NewLesson, Role};
//! use chrono::{Duration, TimeZone, Utc};
//!
//! let engine = Engine::new();
//! let teacher = engine.register_user("Tom", Role::Teacher).unwrap();
//! let student = engine.register_user("Ana", Role::Student).unwrap();
//! engine.add_credits(student.id, 10, "Welcome pack", None).unwrap();
//!
//! let start = Utc.with_ymd_and_hms(2025, 3, 3, 10, 0, 0).unwrap();
//! let lesson = engine
//!     .create_lesson(NewLesson::individual(teacher.id, start, start + Duration::hours(1), 2))
//!     .unwrap();
//!
//! let booking = engine.create_booking(student.id, lesson.id, false).unwrap();
//! assert_eq!(engine.balance(student.id).unwrap(), 8);
//!
//! engine.cancel_booking(booking.id, student.id, false).unwrap();
//! assert_eq!(engine.balance(student.id).unwrap(), 10);
//! ```
//!
//! ## Thread Safety
//!
//! The engine is `Send + Sync`. Units of work are serialized by the store,
//! and seat and balance changes are conditional updates, so concurrent
//! bookings can never oversell a lesson or overdraw a balance.

mod base;
mod booking;
pub mod capacity;
mod clock;
mod config;
mod credit;
mod engine;
pub mod error;
mod events;
mod ledger;
mod lesson;
mod store;
mod swap;
mod template;
mod topup;
mod user;

pub use base::{
    ApplicationId, BookingId, Credits, LessonId, SwapId, TemplateEntryId, TemplateId,
    TransactionId, UserId,
};
pub use booking::{Booking, BookingStatus, CancelOutcome, CancelledBooking};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::LedgerConfig;
pub use credit::{CreditBalance, CreditTransaction, OperationType, Reconciliation};
pub use engine::Engine;
pub use error::{ErrorKind, LedgerError};
pub use events::{ChannelSink, DomainEvent, EventSink, NullSink};
pub use lesson::{Lesson, LessonKind, NewLesson};
pub use store::LedgerStore;
pub use swap::{Swap, SwapPreview};
pub use template::{
    ApplicationStatus, ApplyReport, ApplyStatus, CleanupStats, CreationStats, LessonTemplate,
    NewTemplateEntry, ReplacedApplication, SkippedBooking, TemplateApplication,
    TemplateLessonEntry, TemplateLessonStudent,
};
pub use topup::{TopUpOutcome, TopUpRegistry};
pub use user::{Role, User};
