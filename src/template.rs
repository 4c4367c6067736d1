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

//! Weekly lesson templates.
//!
//! A template describes a recurring week: lessons by weekday and time, each
//! with pre-assigned students. Applying it to a concrete week creates the
//! lessons and books the students. Applications follow a small state machine:
//!
//! ```text
//! (none) ──apply──► Applied ──re-apply same week──► Replaced
//!                      │
//!                      └──────rollback────────────► RolledBack
//! ```
//!
//! Both `Replaced` and `RolledBack` are terminal.
//!
//! Unlike bookings and swaps, applying a template is not all-or-nothing per
//! student: a student whose booking fails (no credits, no seat, clashing
//! schedule) is skipped and reported in [`ApplyReport::warnings`]. Failures
//! at lesson level, such as a teacher overlap, still abort the whole run.

use crate::Engine;
use crate::base::{ApplicationId, BookingId, Credits, LessonId, TemplateEntryId, TemplateId, UserId};
use crate::booking::{self, Booking};
use crate::engine::UnitOfWork;
use crate::error::LedgerError;
use crate::events::DomainEvent;
use crate::lesson::{Lesson, LessonKind, NewLesson};
use crate::user::Role;
use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateLessonStudent {
    pub student_id: UserId,
}

/// One recurring lesson of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateLessonEntry {
    pub id: TemplateEntryId,
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: UserId,
    pub kind: LessonKind,
    pub max_students: u32,
    pub credits_cost: Credits,
    pub students: Vec<TemplateLessonStudent>,
}

impl TemplateLessonEntry {
    /// Concrete lesson request for the week starting on `week_start` (UTC).
    pub fn lesson_for_week(&self, week_start: NaiveDate) -> NewLesson {
        let day = week_start + Duration::days(i64::from(self.day_of_week.num_days_from_monday()));
        NewLesson {
            teacher_id: self.teacher_id,
            kind: self.kind,
            start_time: day.and_time(self.start_time).and_utc(),
            end_time: day.and_time(self.end_time).and_utc(),
            max_students: self.max_students,
            credits_cost: self.credits_cost,
        }
    }
}

/// Request to add an entry to a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTemplateEntry {
    pub day_of_week: Weekday,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub teacher_id: UserId,
    pub kind: LessonKind,
    pub max_students: u32,
    pub credits_cost: Credits,
    pub students: Vec<UserId>,
}

impl NewTemplateEntry {
    fn validate(&self, group_min_students: u32) -> Result<(), LedgerError> {
        if self.end_time <= self.start_time {
            return Err(LedgerError::InvalidTimeRange);
        }
        self.kind
            .validate_capacity(self.max_students, group_min_students)?;
        if self.students.len() > self.max_students as usize {
            return Err(LedgerError::TooManyTemplateStudents {
                assigned: self.students.len(),
                max_students: self.max_students,
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LessonTemplate {
    pub id: TemplateId,
    pub name: String,
    pub created_by: UserId,
    pub entries: Vec<TemplateLessonEntry>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl LessonTemplate {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Applied,
    Replaced,
    RolledBack,
}

impl fmt::Display for ApplicationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplicationStatus::Applied => f.write_str("applied"),
            ApplicationStatus::Replaced => f.write_str("replaced"),
            ApplicationStatus::RolledBack => f.write_str("rolled_back"),
        }
    }
}

/// What an application created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreationStats {
    pub created_lessons: u32,
    pub created_bookings: u32,
    pub deducted_credits: Credits,
}

/// What a cleanup (lesson deletion, replacement, rollback) undid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupStats {
    pub cancelled_bookings: u32,
    pub refunded_credits: Credits,
    pub deleted_lessons: u32,
}

impl AddAssign for CleanupStats {
    fn add_assign(&mut self, other: Self) {
        self.cancelled_bookings += other.cancelled_bookings;
        self.refunded_credits += other.refunded_credits;
        self.deleted_lessons += other.deleted_lessons;
    }
}

/// A template applied to one concrete week.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateApplication {
    pub id: ApplicationId,
    pub template_id: TemplateId,
    pub applied_by_id: UserId,
    pub week_start_date: NaiveDate,
    pub status: ApplicationStatus,
    pub created_at: DateTime<Utc>,
    pub rolled_back_at: Option<DateTime<Utc>>,
    pub stats: CreationStats,
    pub lesson_ids: Vec<LessonId>,
    pub booking_ids: Vec<BookingId>,
}

/// A pre-assigned student that could not be booked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedBooking {
    pub entry_id: TemplateEntryId,
    pub lesson_id: LessonId,
    pub student_id: UserId,
    pub error: LedgerError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplyStatus {
    Applied,
    /// Dry run: nothing was written.
    Preview,
}

/// Prior application replaced by a re-apply of the same week.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplacedApplication {
    pub application_id: ApplicationId,
    pub cleanup: CleanupStats,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub status: ApplyStatus,
    /// The persisted application. `None` for a preview.
    pub application: Option<TemplateApplication>,
    pub stats: CreationStats,
    pub warnings: Vec<SkippedBooking>,
    pub replaced: Option<ReplacedApplication>,
}

/// Cancels the application's bookings that are still active and deletes
/// its lessons that still exist.
fn clean_up(
    work: &mut UnitOfWork<'_>,
    application: &TemplateApplication,
) -> Result<CleanupStats, LedgerError> {
    let mut stats = CleanupStats::default();
    for &booking_id in &application.booking_ids {
        let Some(student) = work
            .tx
            .booking(booking_id)
            .filter(|b| b.is_active())
            .map(|b| b.student_id)
        else {
            continue;
        };
        if let booking::CancelOutcome::Success { refunded } =
            booking::cancel(work, booking_id, student, true)?
        {
            stats.cancelled_bookings += 1;
            stats.refunded_credits += refunded;
        }
    }
    for &lesson_id in &application.lesson_ids {
        if work.tx.lesson(lesson_id).is_some_and(|l| !l.is_deleted()) {
            stats += work.retire_lesson(lesson_id)?;
        }
    }
    Ok(stats)
}

/// Books a pre-assigned student, refusing clashes with their other lessons.
fn enroll(
    work: &mut UnitOfWork<'_>,
    student: UserId,
    lesson: &Lesson,
) -> Result<Booking, LedgerError> {
    if let Some(conflicting_lesson) = booking::student_conflict(&work.tx, student, lesson, None) {
        return Err(LedgerError::ScheduleConflict {
            student,
            conflicting_lesson,
        });
    }
    booking::book(work, student, lesson.id, false)
}

fn apply(
    work: &mut UnitOfWork<'_>,
    template_id: TemplateId,
    week_start: NaiveDate,
    applied_by: UserId,
    dry_run: bool,
) -> Result<ApplyReport, LedgerError> {
    let template = work
        .tx
        .template(template_id)
        .filter(|t| !t.is_deleted())
        .cloned()
        .ok_or(LedgerError::TemplateNotFound(template_id))?;
    work.active_user(applied_by)?;

    let replaced = match work.tx.active_application(template_id, week_start).cloned() {
        Some(mut prior) => {
            let cleanup = clean_up(work, &prior)?;
            prior.status = ApplicationStatus::Replaced;
            prior.rolled_back_at = Some(work.now);
            let application_id = prior.id;
            work.tx.put_application(prior);
            Some(ReplacedApplication {
                application_id,
                cleanup,
            })
        }
        None => None,
    };

    let group_min_students = work.config.group_min_students;
    let mut stats = CreationStats::default();
    let mut warnings = Vec::new();
    let mut lesson_ids = Vec::new();
    let mut booking_ids = Vec::new();

    for entry in &template.entries {
        let request = entry.lesson_for_week(week_start);
        request.validate(group_min_students)?;
        let lesson = work.schedule_lesson(&request)?;
        stats.created_lessons += 1;
        lesson_ids.push(lesson.id);

        for assigned in &entry.students {
            let savepoint = work.savepoint();
            match enroll(work, assigned.student_id, &lesson) {
                Ok(booking) => {
                    let charged = work.tx.deduction_for(booking.id).map_or(0, |d| d.amount);
                    stats.created_bookings += 1;
                    stats.deducted_credits += charged;
                    booking_ids.push(booking.id);
                }
                Err(error) => {
                    work.rollback_to(savepoint);
                    warn!(
                        template = %template_id,
                        lesson = %lesson.id,
                        student = %assigned.student_id,
                        %error,
                        "skipping template booking"
                    );
                    warnings.push(SkippedBooking {
                        entry_id: entry.id,
                        lesson_id: lesson.id,
                        student_id: assigned.student_id,
                        error,
                    });
                }
            }
        }
    }

    if dry_run {
        return Ok(ApplyReport {
            status: ApplyStatus::Preview,
            application: None,
            stats,
            warnings,
            replaced,
        });
    }

    let application = TemplateApplication {
        id: work.tx.next_application_id(),
        template_id,
        applied_by_id: applied_by,
        week_start_date: week_start,
        status: ApplicationStatus::Applied,
        created_at: work.now,
        rolled_back_at: None,
        stats,
        lesson_ids,
        booking_ids,
    };
    work.tx.put_application(application.clone());
    work.emit(DomainEvent::TemplateApplied {
        application_id: application.id,
        template_id,
        week_start,
    });
    Ok(ApplyReport {
        status: ApplyStatus::Applied,
        application: Some(application),
        stats,
        warnings,
        replaced,
    })
}

impl Engine {
    /// Creates an empty template.
    pub fn create_template(
        &self,
        name: impl Into<String>,
        created_by: UserId,
    ) -> Result<LessonTemplate, LedgerError> {
        let name = name.into();
        let template = self.transact(|work| {
            work.active_user(created_by)?;
            let template = LessonTemplate {
                id: work.tx.next_template_id(),
                name,
                created_by,
                entries: Vec::new(),
                created_at: work.now,
                deleted_at: None,
            };
            work.tx.put_template(template.clone());
            Ok(template)
        })?;
        info!(template = %template.id, "template created");
        Ok(template)
    }

    /// Adds a recurring lesson to a template.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidTimeRange`] / [`LedgerError::InvalidCapacity`] - Malformed entry.
    /// - [`LedgerError::TooManyTemplateStudents`] - More students than seats.
    /// - [`LedgerError::TemplateNotFound`] - Unknown or deleted template.
    /// - [`LedgerError::RoleMismatch`] - Teacher is not a teacher, or a student is not a student.
    pub fn add_template_entry(
        &self,
        template: TemplateId,
        request: NewTemplateEntry,
    ) -> Result<TemplateLessonEntry, LedgerError> {
        request.validate(self.config().group_min_students)?;
        self.transact(|work| {
            let mut stored = work
                .tx
                .template(template)
                .filter(|t| !t.is_deleted())
                .cloned()
                .ok_or(LedgerError::TemplateNotFound(template))?;
            work.user_with_role(request.teacher_id, Role::Teacher)?;
            for &student in &request.students {
                work.user_with_role(student, Role::Student)?;
            }

            let entry = TemplateLessonEntry {
                id: work.tx.next_template_entry_id(),
                day_of_week: request.day_of_week,
                start_time: request.start_time,
                end_time: request.end_time,
                teacher_id: request.teacher_id,
                kind: request.kind,
                max_students: request.max_students,
                credits_cost: request.credits_cost,
                students: request
                    .students
                    .iter()
                    .map(|&student_id| TemplateLessonStudent { student_id })
                    .collect(),
            };
            stored.entries.push(entry.clone());
            work.tx.put_template(stored);
            Ok(entry)
        })
    }

    /// Soft-deletes a template. Existing applications are left untouched.
    pub fn delete_template(&self, id: TemplateId) -> Result<LessonTemplate, LedgerError> {
        self.transact(|work| {
            let mut template = work
                .tx
                .template(id)
                .cloned()
                .ok_or(LedgerError::TemplateNotFound(id))?;
            if template.deleted_at.is_none() {
                template.deleted_at = Some(work.now);
                work.tx.put_template(template.clone());
            }
            Ok(template)
        })
    }

    pub fn template(&self, id: TemplateId) -> Result<LessonTemplate, LedgerError> {
        self.read(|tx| tx.template(id).cloned())?
            .ok_or(LedgerError::TemplateNotFound(id))
    }

    /// Applies a template to the week starting on `week_start`.
    ///
    /// A previous `Applied` application of the same template and week is
    /// cleaned up and marked `Replaced` in the same unit of work. With
    /// `dry_run` the whole run is rehearsed and rolled back, and the report
    /// has status [`ApplyStatus::Preview`].
    ///
    /// # Errors
    ///
    /// - [`LedgerError::NotMonday`] - `week_start` is not a Monday.
    /// - [`LedgerError::TemplateNotFound`] - Unknown or deleted template.
    /// - [`LedgerError::TeacherOverlap`] - A lesson clashes with the teacher's schedule.
    ///
    /// Per-student booking failures are not errors; see [`ApplyReport::warnings`].
    pub fn apply_template(
        &self,
        template: TemplateId,
        week_start: NaiveDate,
        applied_by: UserId,
        dry_run: bool,
    ) -> Result<ApplyReport, LedgerError> {
        if week_start.weekday() != Weekday::Mon {
            return Err(LedgerError::NotMonday(week_start));
        }
        let report = if dry_run {
            self.rehearse(|work| apply(work, template, week_start, applied_by, true))?
        } else {
            self.transact(|work| apply(work, template, week_start, applied_by, false))?
        };
        info!(
            template = %template,
            week = %week_start,
            status = ?report.status,
            lessons = report.stats.created_lessons,
            bookings = report.stats.created_bookings,
            skipped = report.warnings.len(),
            "template processed"
        );
        Ok(report)
    }

    /// Undoes an `Applied` application: cancels its bookings with refunds
    /// and deletes its lessons.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::ApplicationNotFound`] - Unknown application.
    /// - [`LedgerError::InvalidApplicationState`] - Already replaced or rolled back.
    pub fn rollback_application(&self, id: ApplicationId) -> Result<CleanupStats, LedgerError> {
        let stats = self.transact(|work| {
            let mut application = work
                .tx
                .application(id)
                .cloned()
                .ok_or(LedgerError::ApplicationNotFound(id))?;
            if application.status != ApplicationStatus::Applied {
                return Err(LedgerError::InvalidApplicationState {
                    application: id,
                    status: application.status,
                });
            }
            let stats = clean_up(work, &application)?;
            application.status = ApplicationStatus::RolledBack;
            application.rolled_back_at = Some(work.now);
            let template_id = application.template_id;
            work.tx.put_application(application);
            work.emit(DomainEvent::ApplicationRolledBack {
                application_id: id,
                template_id,
            });
            Ok(stats)
        })?;
        info!(
            application = %id,
            cancelled = stats.cancelled_bookings,
            refunded = stats.refunded_credits,
            deleted = stats.deleted_lessons,
            "template application rolled back"
        );
        Ok(stats)
    }

    pub fn application(&self, id: ApplicationId) -> Result<TemplateApplication, LedgerError> {
        self.read(|tx| tx.application(id).cloned())?
            .ok_or(LedgerError::ApplicationNotFound(id))
    }

    /// Every application of a template, ordered by id.
    pub fn applications(&self, template: TemplateId) -> Result<Vec<TemplateApplication>, LedgerError> {
        self.read(|tx| tx.applications_of(template).cloned().collect())
    }
}
