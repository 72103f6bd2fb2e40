//! Borrow (loan) model and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use utoipa::ToSchema;
use validator::Validate;

use super::{copy::TitleSummary, text_enum};

/// Borrow record status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum BorrowStatus {
    Active,
    Returned,
    Overdue,
    Lost,
}

text_enum!(BorrowStatus {
    Active => "active",
    Returned => "returned",
    Overdue => "overdue",
    Lost => "lost",
});

/// Borrow model from database
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow, ToSchema)]
pub struct Borrow {
    pub id: i64,
    pub user_id: i64,
    pub copy_id: i64,
    pub title_id: i64,
    pub borrowed_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: BorrowStatus,
}

impl Borrow {
    pub fn is_active(&self) -> bool {
        self.status == BorrowStatus::Active
    }

    /// Active and past its due date
    pub fn is_overdue_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active() && self.due_at < now
    }
}

/// Values for a borrow row about to be inserted
#[derive(Debug, Clone)]
pub struct NewBorrow {
    pub user_id: i64,
    pub copy_id: i64,
    pub title_id: i64,
    pub borrowed_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
}

/// Borrow with the copy and title data needed for display
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct BorrowDetails {
    pub id: i64,
    pub copy_id: i64,
    pub copy_number: String,
    pub title: TitleSummary,
    pub borrowed_at: DateTime<Utc>,
    pub due_at: DateTime<Utc>,
    pub returned_at: Option<DateTime<Utc>>,
    pub status: BorrowStatus,
    pub is_overdue: bool,
}

impl BorrowDetails {
    pub fn new(borrow: Borrow, copy_number: String, title: TitleSummary, now: DateTime<Utc>) -> Self {
        Self {
            is_overdue: borrow.is_overdue_at(now),
            id: borrow.id,
            copy_id: borrow.copy_id,
            copy_number,
            title,
            borrowed_at: borrow.borrowed_at,
            due_at: borrow.due_at,
            returned_at: borrow.returned_at,
            status: borrow.status,
        }
    }
}

/// Borrow request body
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct BorrowRequest {
    /// Title to borrow a copy of
    #[validate(range(min = 1, message = "title_id must be positive"))]
    pub title_id: i64,
    /// Loan duration in days
    pub days: i64,
}
