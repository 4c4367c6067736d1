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

//! Lessons and lesson kinds.
//!
//! A lesson is either [`LessonKind::Individual`] (exactly one seat) or
//! [`LessonKind::Group`] (at least `group_min_students` seats). The kind is
//! chosen explicitly and the capacity is validated against it, so capacities
//! that fit neither kind are rejected instead of being silently classified.
//!
//! # Example
//!
//! ```
//! use tutor_ledger::LessonKind;
//!
//! assert!(LessonKind::Individual.validate_capacity(1, 4).is_ok());
//! assert!(LessonKind::Group.validate_capacity(3, 4).is_err());
//! ```

use crate::base::{Credits, LessonId, UserId};
use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LessonKind {
    Individual,
    Group,
}

impl LessonKind {
    /// Checks that `max_students` is a legal capacity for this kind.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidCapacity`] - Individual lessons need exactly one
    ///   seat, group lessons need at least `group_min_students`.
    pub fn validate_capacity(
        self,
        max_students: u32,
        group_min_students: u32,
    ) -> Result<(), LedgerError> {
        let valid = match self {
            LessonKind::Individual => max_students == 1,
            LessonKind::Group => max_students >= group_min_students.max(2),
        };
        if valid {
            Ok(())
        } else {
            Err(LedgerError::InvalidCapacity {
                kind: self,
                max_students,
            })
        }
    }
}

impl fmt::Display for LessonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LessonKind::Individual => f.write_str("individual"),
            LessonKind::Group => f.write_str("group"),
        }
    }
}

/// A scheduled lesson.
///
/// `current_students` is a derived counter: only the booking, swap and
/// template operations move it, always through the store's conditional
/// seat updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lesson {
    pub id: LessonId,
    pub teacher_id: UserId,
    pub kind: LessonKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_students: u32,
    pub current_students: u32,
    pub credits_cost: Credits,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Lesson {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn free_seats(&self) -> u32 {
        self.max_students.saturating_sub(self.current_students)
    }

    fn assert_invariants(&self) {
        debug_assert!(
            self.current_students <= self.max_students,
            "Invariant violated: lesson {} has {} of {} seats taken",
            self.id,
            self.current_students,
            self.max_students
        );
        debug_assert!(
            self.end_time > self.start_time,
            "Invariant violated: lesson {} ends before it starts",
            self.id
        );
    }

    /// Takes one seat if one is free. Returns whether a seat was taken.
    pub(crate) fn take_seat(&mut self) -> bool {
        if self.is_deleted() || self.current_students >= self.max_students {
            return false;
        }
        self.current_students += 1;
        self.assert_invariants();
        true
    }

    /// Frees one seat, never going below zero.
    pub(crate) fn free_seat(&mut self) {
        self.current_students = self.current_students.saturating_sub(1);
        self.assert_invariants();
    }
}

/// Request to schedule a lesson.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewLesson {
    pub teacher_id: UserId,
    pub kind: LessonKind,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub max_students: u32,
    pub credits_cost: Credits,
}

impl NewLesson {
    /// Individual lesson with a single seat.
    pub fn individual(
        teacher_id: UserId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        credits_cost: Credits,
    ) -> Self {
        Self {
            teacher_id,
            kind: LessonKind::Individual,
            start_time,
            end_time,
            max_students: 1,
            credits_cost,
        }
    }

    /// Group lesson with `max_students` seats.
    pub fn group(
        teacher_id: UserId,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        max_students: u32,
        credits_cost: Credits,
    ) -> Self {
        Self {
            teacher_id,
            kind: LessonKind::Group,
            start_time,
            end_time,
            max_students,
            credits_cost,
        }
    }

    /// Static checks that need no store access.
    pub fn validate(&self, group_min_students: u32) -> Result<(), LedgerError> {
        if self.end_time <= self.start_time {
            return Err(LedgerError::InvalidTimeRange);
        }
        self.kind
            .validate_capacity(self.max_students, group_min_students)
    }
}
