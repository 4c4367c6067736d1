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

//! Domain events for the notification subsystem.
//!
//! The engine collects events while a unit of work runs and hands them to
//! the [`EventSink`] only after the commit succeeded. Publishing is
//! fire-and-forget: a sink that cannot deliver drops the event.

use crate::base::{ApplicationId, BookingId, Credits, LessonId, SwapId, TemplateId, UserId};
use chrono::NaiveDate;
use crossbeam::channel::{Receiver, Sender, unbounded};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    BookingCreated {
        booking_id: BookingId,
        student_id: UserId,
        lesson_id: LessonId,
        charged: Credits,
    },
    BookingCancelled {
        booking_id: BookingId,
        student_id: UserId,
        lesson_id: LessonId,
        refunded: Credits,
    },
    SwapPerformed {
        swap_id: SwapId,
        student_id: UserId,
        old_lesson_id: LessonId,
        new_lesson_id: LessonId,
    },
    LessonDeleted {
        lesson_id: LessonId,
        teacher_id: UserId,
    },
    TemplateApplied {
        application_id: ApplicationId,
        template_id: TemplateId,
        week_start: NaiveDate,
    },
    ApplicationRolledBack {
        application_id: ApplicationId,
        template_id: TemplateId,
    },
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Sink that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl EventSink for NullSink {
    fn publish(&self, _event: DomainEvent) {}
}

/// Sink that forwards events over an unbounded channel to a subscriber.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: Sender<DomainEvent>,
}

impl ChannelSink {
    /// Creates a sink and the receiving end a subscriber drains.
    pub fn new() -> (Self, Receiver<DomainEvent>) {
        let (sender, receiver) = unbounded();
        (Self { sender }, receiver)
    }
}

impl EventSink for ChannelSink {
    fn publish(&self, event: DomainEvent) {
        if self.sender.send(event).is_err() {
            tracing::debug!("event subscriber gone, dropping event");
        }
    }
}
