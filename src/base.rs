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

//! Core identifier types for users, lessons, bookings and ledger records.
//!
//! Every identifier wraps a `u64` handed out by the store's sequences.
//! Identifiers of different tables are distinct types so a lesson id can
//! never be passed where a booking id is expected.

use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

define_id!(
    /// Unique identifier for a user (student, teacher or admin).
    UserId
);

define_id!(
    /// Unique identifier for a scheduled lesson.
    LessonId
);

define_id!(
    /// Unique identifier for a booking.
    BookingId
);

define_id!(
    /// Unique identifier for a credit transaction log row.
    TransactionId
);

define_id!(
    /// Unique identifier for a swap history row.
    SwapId
);

define_id!(
    /// Unique identifier for a lesson template.
    TemplateId
);

define_id!(
    /// Unique identifier for one weekly entry inside a template.
    TemplateEntryId
);

define_id!(
    /// Unique identifier for a template application.
    ApplicationId
);

/// Amount of platform credits.
///
/// Credits are whole units; balances are bounded by the configured ceiling
/// so `u32` leaves ample headroom.
pub type Credits = u32;
