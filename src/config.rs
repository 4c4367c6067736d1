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

//! Ledger configuration.
//!
//! Defaults match the platform's business rules; a JSON file may override
//! any subset of fields.
//!
//! ```json
//! { "max_balance": 5000, "group_min_students": 5 }
//! ```

use crate::base::Credits;
use crate::error::LedgerError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Ceiling no balance may exceed.
    pub max_balance: Credits,
    /// Smallest amount accepted by a single credit operation request.
    pub min_operation_amount: Credits,
    /// Largest amount accepted by a single credit operation request.
    pub max_operation_amount: Credits,
    /// Smallest capacity of a group lesson.
    pub group_min_students: u32,
}

impl LedgerConfig {
    pub const DEFAULT_MAX_BALANCE: Credits = 10_000;

    /// Loads a configuration file, filling missing fields with defaults.
    ///
    /// # Errors
    ///
    /// - [`LedgerError::InvalidConfig`] - File unreadable, malformed or inconsistent.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|e| {
            LedgerError::InvalidConfig(format!("cannot read {}: {e}", path.display()))
        })?;
        let config: LedgerConfig = serde_json::from_str(&raw).map_err(|e| {
            LedgerError::InvalidConfig(format!("cannot parse {}: {e}", path.display()))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.min_operation_amount == 0 {
            return Err(LedgerError::InvalidConfig(
                "min_operation_amount must be positive".into(),
            ));
        }
        if self.min_operation_amount > self.max_operation_amount {
            return Err(LedgerError::InvalidConfig(
                "min_operation_amount exceeds max_operation_amount".into(),
            ));
        }
        if self.max_operation_amount > self.max_balance {
            return Err(LedgerError::InvalidConfig(
                "max_operation_amount exceeds max_balance".into(),
            ));
        }
        if self.group_min_students < 2 {
            return Err(LedgerError::InvalidConfig(
                "group_min_students must be at least 2".into(),
            ));
        }
        Ok(())
    }

    /// Request-level amount check applied before a unit of work opens.
    pub fn check_amount(&self, amount: Credits) -> Result<(), LedgerError> {
        if (self.min_operation_amount..=self.max_operation_amount).contains(&amount) {
            Ok(())
        } else {
            Err(LedgerError::InvalidAmount {
                amount,
                min: self.min_operation_amount,
                max: self.max_operation_amount,
            })
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            max_balance: Self::DEFAULT_MAX_BALANCE,
            min_operation_amount: 1,
            max_operation_amount: 100,
            group_min_students: 4,
        }
    }
}
