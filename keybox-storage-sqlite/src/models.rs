//! Database models

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use keybox_core::SpendingKeyset;
use serde::{Deserialize, Serialize};

use crate::Error;

/// Lifecycle of a stored keyset
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeysetStatus {
    /// Receives and spends
    Active,
    /// Replaced by a rotation; swept until empty
    Retired,
}

impl KeysetStatus {
    /// Column value
    pub fn as_str(&self) -> &'static str {
        match self {
            KeysetStatus::Active => "active",
            KeysetStatus::Retired => "retired",
        }
    }
}

impl fmt::Display for KeysetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeysetStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(KeysetStatus::Active),
            "retired" => Ok(KeysetStatus::Retired),
            other => Err(Error::Validation(format!("unknown keyset status: {}", other))),
        }
    }
}

/// Keyset row
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredKeyset {
    /// The keyset
    pub keyset: SpendingKeyset,
    /// Active or retired
    pub status: KeysetStatus,
    /// When it was stored
    pub created_at: DateTime<Utc>,
}

impl StoredKeyset {
    /// Whether this is the account's active keyset
    pub fn is_active(&self) -> bool {
        self.status == KeysetStatus::Active
    }
}
