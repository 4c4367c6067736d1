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

use chrono::{DateTime, Utc};
use clap::{Parser, ValueEnum};
use csv::{ReaderBuilder, Trim, Writer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::PathBuf;
use std::process;
use thiserror::Error;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use tutor_ledger::{Engine, LedgerConfig, LedgerError, LessonId, NewLesson, Role, UserId};

/// Tutor Ledger - Replay booking scenarios
///
/// Reads ledger operations from a CSV file, runs them through the engine and
/// writes the resulting balances (or lessons) to stdout.
#[derive(Parser, Debug)]
#[command(name = "tutor-ledger")]
#[command(about = "Replays booking and credit scenarios from CSV", long_about = None)]
struct Args {
    /// Path to CSV file with operations
    ///
    /// Expected format: op,user,lesson,target,amount,start,end,capacity,role
    /// Example: cargo run -- scenario.csv > balances.csv
    #[arg(value_name = "FILE")]
    input: PathBuf,

    /// JSON file with ledger limits
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Overrides the balance ceiling of the configuration
    #[arg(long)]
    max_balance: Option<u32>,

    /// Report written to stdout
    #[arg(long, value_enum, default_value_t = Report::Balances)]
    report: Report,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Report {
    Balances,
    Lessons,
}

fn main() {
    let args = Args::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tutor_ledger=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let engine = match build_engine(&args) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    let file = match File::open(&args.input) {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Error opening file '{}': {}", args.input.display(), e);
            process::exit(1);
        }
    };

    let scenario = match process_scenario(engine, BufReader::new(file)) {
        Ok(scenario) => scenario,
        Err(e) => {
            eprintln!("Error processing scenario: {}", e);
            process::exit(1);
        }
    };

    let written = match args.report {
        Report::Balances => write_balances(&scenario, std::io::stdout()),
        Report::Lessons => write_lessons(&scenario, std::io::stdout()),
    };
    if let Err(e) = written {
        eprintln!("Error writing output: {}", e);
        process::exit(1);
    }
}

fn build_engine(args: &Args) -> Result<Engine, LedgerError> {
    let mut config = match &args.config {
        Some(path) => LedgerConfig::from_json_file(path)?,
        None => LedgerConfig::default(),
    };
    if let Some(max_balance) = args.max_balance {
        config.max_balance = max_balance;
        // A lowered ceiling also caps single operations.
        config.max_operation_amount = config.max_operation_amount.min(max_balance);
        config.min_operation_amount = config.min_operation_amount.min(max_balance);
    }
    Engine::with_config(config)
}

/// Raw CSV record matching the input format.
///
/// Fields: `op, user, lesson, target, amount, start, end, capacity, role`.
/// `user` and `lesson` are scenario handles, mapped to engine ids on first use.
#[derive(Debug, Deserialize)]
struct CsvRecord {
    op: String,
    user: u64,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    lesson: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    target: Option<u64>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    amount: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    start: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    end: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    capacity: Option<u32>,
    #[serde(default, deserialize_with = "csv::invalid_option")]
    role: Option<Role>,
}

#[derive(Debug, Error)]
enum ReplayError {
    #[error("unknown operation '{0}'")]
    UnknownOp(String),
    #[error("missing field '{0}'")]
    MissingField(&'static str),
    #[error("unknown {kind} handle {handle}")]
    UnknownHandle { kind: &'static str, handle: u64 },
    #[error("{kind} handle {handle} already registered")]
    DuplicateHandle { kind: &'static str, handle: u64 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

fn required<T>(value: Option<T>, field: &'static str) -> Result<T, ReplayError> {
    value.ok_or(ReplayError::MissingField(field))
}

/// Engine plus the mapping from scenario handles to engine ids.
pub struct Scenario {
    engine: Engine,
    users: BTreeMap<u64, UserId>,
    lessons: BTreeMap<u64, LessonId>,
}

impl Scenario {
    fn new(engine: Engine) -> Self {
        Self {
            engine,
            users: BTreeMap::new(),
            lessons: BTreeMap::new(),
        }
    }

    fn user(&self, handle: u64) -> Result<UserId, ReplayError> {
        self.users
            .get(&handle)
            .copied()
            .ok_or(ReplayError::UnknownHandle {
                kind: "user",
                handle,
            })
    }

    fn lesson(&self, handle: u64) -> Result<LessonId, ReplayError> {
        self.lessons
            .get(&handle)
            .copied()
            .ok_or(ReplayError::UnknownHandle {
                kind: "lesson",
                handle,
            })
    }

    fn apply(&mut self, record: CsvRecord) -> Result<(), ReplayError> {
        match record.op.to_lowercase().as_str() {
            "register" => {
                if self.users.contains_key(&record.user) {
                    return Err(ReplayError::DuplicateHandle {
                        kind: "user",
                        handle: record.user,
                    });
                }
                let role = required(record.role, "role")?;
                let user = self
                    .engine
                    .register_user(format!("user-{}", record.user), role)?;
                self.users.insert(record.user, user.id);
            }
            "top_up" => {
                let user = self.user(record.user)?;
                let amount = required(record.amount, "amount")?;
                self.engine.add_credits(user, amount, "Top-up", None)?;
            }
            "lesson" => {
                let handle = required(record.lesson, "lesson")?;
                if self.lessons.contains_key(&handle) {
                    return Err(ReplayError::DuplicateHandle {
                        kind: "lesson",
                        handle,
                    });
                }
                let teacher = self.user(record.user)?;
                let start = required(record.start, "start")?;
                let end = required(record.end, "end")?;
                let cost = record.amount.unwrap_or(0);
                let request = match record.capacity.unwrap_or(1) {
                    1 => NewLesson::individual(teacher, start, end, cost),
                    seats => NewLesson::group(teacher, start, end, seats, cost),
                };
                let lesson = self.engine.create_lesson(request)?;
                self.lessons.insert(handle, lesson.id);
            }
            "book" => {
                let student = self.user(record.user)?;
                let lesson = self.lesson(required(record.lesson, "lesson")?)?;
                self.engine.create_booking(student, lesson, false)?;
            }
            "cancel" => {
                let student = self.user(record.user)?;
                let lesson = self.lesson(required(record.lesson, "lesson")?)?;
                let booking = self
                    .engine
                    .student_bookings(student)?
                    .into_iter()
                    .find(|b| b.lesson_id == lesson && b.is_active())
                    .ok_or(LedgerError::NoActiveBooking { student, lesson })?;
                self.engine.cancel_booking(booking.id, student, false)?;
            }
            "swap" => {
                let student = self.user(record.user)?;
                let old = self.lesson(required(record.lesson, "lesson")?)?;
                let new = self.lesson(required(record.target, "target")?)?;
                self.engine.perform_swap(student, old, new)?;
            }
            other => return Err(ReplayError::UnknownOp(other.to_owned())),
        }
        Ok(())
    }
}

/// Replays operations from a CSV reader.
///
/// Rows are streamed one at a time. Malformed rows and operations the engine
/// rejects are skipped with a warning; the replay carries on with the next row.
///
/// # CSV Format
///
/// ```csv
/// op,user,lesson,target,amount,start,end,capacity,role
/// register,1,,,,,,,teacher
/// register,2,,,,,,,student
/// top_up,2,,,10,,,,
/// lesson,1,100,,2,2025-03-03T10:00:00Z,2025-03-03T11:00:00Z,1,
/// book,2,100,,,,,,
/// ```
///
/// # Errors
///
/// Returns a CSV error if the reader fails or the header cannot be read.
pub fn process_scenario<R: Read>(engine: Engine, reader: R) -> Result<Scenario, csv::Error> {
    let mut scenario = Scenario::new(engine);

    let mut rdr = ReaderBuilder::new()
        .trim(Trim::All)
        .flexible(true)
        .has_headers(true)
        .from_reader(reader);
    let headers = rdr.headers()?.clone();

    for (index, result) in rdr.records().enumerate() {
        let line = index + 2;
        let record: CsvRecord = match result.and_then(|row| row.deserialize(Some(&headers))) {
            Ok(record) => record,
            Err(e) => {
                warn!(line, error = %e, "skipping malformed row");
                continue;
            }
        };
        let op = record.op.clone();
        match scenario.apply(record) {
            Ok(()) => debug!(line, op = %op, "row applied"),
            Err(e) => warn!(line, op = %op, error = %e, "skipping rejected row"),
        }
    }

    Ok(scenario)
}

#[derive(Debug, Serialize)]
struct BalanceRow {
    user: u64,
    role: Role,
    balance: u32,
    transactions: usize,
}

/// Writes one row per registered user, ordered by scenario handle.
///
/// # CSV Format
///
/// ```csv
/// user,role,balance,transactions
/// 1,teacher,0,0
/// 2,student,8,2
/// ```
pub fn write_balances<W: Write>(scenario: &Scenario, writer: W) -> Result<(), Box<dyn std::error::Error>> {
    let mut wtr = Writer::from_writer(writer);
    for (&handle, &id) in &scenario.users {
        let user = scenario.engine.user(id)?;
        wtr.serialize(BalanceRow {
            user: handle,
            role: user.role,
            balance: scenario.engine.balance(id)?,
            transactions: scenario.engine.transactions(id)?.len(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}

#[derive(Debug, Serialize)]
struct LessonRow {
    lesson: u64,
    teacher: u64,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    max_students: u32,
    current_students: u32,
    credits_cost: u32,
    deleted: bool,
}

/// Writes one row per scenario lesson, ordered by scenario handle.
pub fn write_lessons<W: Write>(scenario: &Scenario, writer: W) -> Result<(), Box<dyn std::error::Error>> {
    let teachers: BTreeMap<UserId, u64> = scenario.users.iter().map(|(&h, &id)| (id, h)).collect();
    let mut wtr = Writer::from_writer(writer);
    for (&handle, &id) in &scenario.lessons {
        let lesson = scenario.engine.lesson(id)?;
        wtr.serialize(LessonRow {
            lesson: handle,
            teacher: teachers.get(&lesson.teacher_id).copied().unwrap_or_default(),
            start: lesson.start_time,
            end: lesson.end_time,
            max_students: lesson.max_students,
            current_students: lesson.current_students,
            credits_cost: lesson.credits_cost,
            deleted: lesson.is_deleted(),
        })?;
    }
    wtr.flush()?;
    Ok(())
}
