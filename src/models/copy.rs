//! Book copy (physical item) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;

use super::text_enum;

/// Lending status of a physical copy.
///
/// Only the lending engine moves a copy between `Available` and `Borrowed`;
/// `Lost` and `Maintenance` are set by catalog management and are never
/// borrowable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum CopyStatus {
    Available,
    Borrowed,
    Lost,
    Maintenance,
}

text_enum!(CopyStatus {
    Available => "available",
    Borrowed => "borrowed",
    Lost => "lost",
    Maintenance => "maintenance",
});

impl CopyStatus {
    pub fn is_borrowable(&self) -> bool {
        matches!(self, CopyStatus::Available)
    }
}

/// Physical copy of a title
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct BookCopy {
    pub id: i64,
    pub title_id: i64,
    pub copy_number: String,
    pub status: CopyStatus,
    pub acquired_at: DateTime<Utc>,
}

/// Catalog data shown next to a borrow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct TitleSummary {
    pub id: i64,
    pub title: String,
    pub isbn: Option<String>,
    pub authors: Vec<String>,
}
