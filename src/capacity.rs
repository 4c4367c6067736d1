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

//! Capacity and schedule checks.
//!
//! Pure functions over rows already loaded by the caller. They are run once
//! as a pre-check and again right before commit, inside the same unit of
//! work, so a concurrent writer cannot slip between check and write.
//!
//! Time ranges are half-open: a lesson ending at 11:00 does not overlap one
//! starting at 11:00.

use crate::base::{BookingId, LessonId, UserId};
use crate::booking::Booking;
use crate::lesson::Lesson;
use chrono::{DateTime, Utc};

/// Whether `lesson` can take one more student.
///
/// Lessons in the past are not rejected here; callers that want that
/// policy enforce it themselves.
pub fn can_enroll(lesson: &Lesson) -> bool {
    !lesson.is_deleted() && lesson.current_students < lesson.max_students
}

/// Half-open interval intersection: `[a_start, a_end)` and `[b_start, b_end)`.
pub fn intervals_overlap(
    a_start: DateTime<Utc>,
    a_end: DateTime<Utc>,
    b_start: DateTime<Utc>,
    b_end: DateTime<Utc>,
) -> bool {
    a_start < b_end && b_start < a_end
}

/// First non-deleted lesson of `teacher` overlapping `[start, end)`,
/// ignoring `exclude`.
pub fn find_teacher_overlap<'a>(
    lessons: impl IntoIterator<Item = &'a Lesson>,
    teacher: UserId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude: Option<LessonId>,
) -> Option<LessonId> {
    lessons
        .into_iter()
        .filter(|l| l.teacher_id == teacher && !l.is_deleted())
        .filter(|l| Some(l.id) != exclude)
        .find(|l| intervals_overlap(l.start_time, l.end_time, start, end))
        .map(|l| l.id)
}

pub fn has_teacher_overlap<'a>(
    lessons: impl IntoIterator<Item = &'a Lesson>,
    teacher: UserId,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude: Option<LessonId>,
) -> bool {
    find_teacher_overlap(lessons, teacher, start, end, exclude).is_some()
}

/// First lesson among a student's active bookings that overlaps
/// `[start, end)`, ignoring the booking `exclude`.
///
/// Bookings on deleted lessons do not count.
pub fn find_student_conflict<'a>(
    bookings: impl IntoIterator<Item = (&'a Booking, &'a Lesson)>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude: Option<BookingId>,
) -> Option<LessonId> {
    bookings
        .into_iter()
        .filter(|(b, l)| b.is_active() && !l.is_deleted() && Some(b.id) != exclude)
        .find(|(_, l)| intervals_overlap(l.start_time, l.end_time, start, end))
        .map(|(_, l)| l.id)
}
