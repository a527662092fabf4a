//! Row types of the two persistent tables.

use crate::border::Border;
use crate::{MatchError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Ownership status of a disc. Transitions are free among the values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscStatus {
    Registered,
    Stolen,
    Found,
}

impl DiscStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscStatus::Registered => "registered",
            DiscStatus::Stolen => "stolen",
            DiscStatus::Found => "found",
        }
    }
}

impl FromStr for DiscStatus {
    type Err = MatchError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "registered" => Ok(DiscStatus::Registered),
            "stolen" => Ok(DiscStatus::Stolen),
            "found" => Ok(DiscStatus::Found),
            _ => Err(MatchError::InvalidTransition(format!("unknown status '{s}'"))),
        }
    }
}

impl fmt::Display for DiscStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upload lifecycle. Pending discs are invisible to search; the transition
/// to success happens exactly once and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    Pending,
    Success,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Pending => "pending",
            UploadStatus::Success => "success",
        }
    }
}

impl FromStr for UploadStatus {
    type Err = MatchError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(UploadStatus::Pending),
            "success" => Ok(UploadStatus::Success),
            _ => Err(MatchError::InvalidTransition(format!("unknown upload state '{s}'"))),
        }
    }
}

/// A registered physical disc.
#[derive(Debug, Clone, Serialize)]
pub struct Disc {
    pub id: i64,
    pub owner_name: String,
    pub owner_contact: String,
    pub status: DiscStatus,
    pub upload_status: UploadStatus,
    pub model_name: Option<String>,
    pub color: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Owner-supplied fields of a disc being created.
#[derive(Debug, Clone, Default)]
pub struct NewDisc {
    pub owner_name: String,
    pub owner_contact: String,
    pub model_name: Option<String>,
    pub color: Option<String>,
    pub notes: Option<String>,
    pub location: Option<String>,
}

impl NewDisc {
    pub fn new(owner_name: impl Into<String>, owner_contact: impl Into<String>) -> Self {
        Self {
            owner_name: owner_name.into(),
            owner_contact: owner_contact.into(),
            ..Self::default()
        }
    }

    pub fn with_model_name(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }

    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }
}

/// One photograph attached to a disc, with its stored embedding metadata.
#[derive(Debug, Clone)]
pub struct DiscImage {
    pub id: i64,
    pub disc_id: i64,
    pub encoder: String,
    pub original_path: String,
    pub cropped_path: Option<String>,
    pub border: Option<Border>,
    pub created_at: DateTime<Utc>,
}

/// Optional filters for `list_discs`.
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscFilter {
    pub status: Option<DiscStatus>,
    /// `None` lists only visible (success) discs; `Some` filters exactly.
    pub upload_status: Option<UploadStatus>,
}
