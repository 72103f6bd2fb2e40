//! Postgres implementation of the lending store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, Pool, Postgres, Row, Transaction};

use super::{LendingStore, LendingTx};
use crate::{
    error::StorageError,
    models::{Borrow, BorrowDetails, BookCopy, CopyStatus, NewBorrow, TitleSummary},
};

const COPY_COLUMNS: &str = "id, title_id, copy_number, status, acquired_at";
const BORROW_COLUMNS: &str =
    "id, user_id, copy_id, title_id, borrowed_at, due_at, returned_at, status";

/// Aggregated author names of a title, alphabetical
const AUTHORS_SUBQUERY: &str = r#"
    COALESCE((
        SELECT array_agg(a.name ORDER BY a.name)
        FROM title_authors ta
        JOIN authors a ON a.id = ta.author_id
        WHERE ta.title_id = t.id
    ), ARRAY[]::text[]) AS authors
"#;

#[derive(Clone)]
pub struct PgLendingStore {
    pool: Pool<Postgres>,
}

impl PgLendingStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

fn title_from_row(row: &PgRow) -> Result<TitleSummary, sqlx::Error> {
    Ok(TitleSummary {
        id: row.try_get("title_id")?,
        title: row.try_get("title")?,
        isbn: row.try_get("isbn")?,
        authors: row.try_get("authors")?,
    })
}

#[async_trait]
impl LendingStore for PgLendingStore {
    async fn begin(&self) -> Result<Box<dyn LendingTx>, StorageError> {
        let mut tx = self.pool.begin().await?;
        // Conflicting check-then-write sequences abort with 40001 instead of
        // both committing.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(Box::new(PgLendingTx { tx }))
    }

    async fn user_borrows(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BorrowDetails>, StorageError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT b.id, b.user_id, b.copy_id, b.title_id, b.borrowed_at, b.due_at,
                   b.returned_at, b.status, c.copy_number, t.title, t.isbn,
                   {AUTHORS_SUBQUERY}
            FROM borrows b
            JOIN book_copies c ON c.id = b.copy_id
            JOIN titles t ON t.id = b.title_id
            WHERE b.user_id = $1
            ORDER BY b.borrowed_at DESC, b.id DESC
            "#
        ))
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let borrow = Borrow {
                id: row.try_get("id")?,
                user_id: row.try_get("user_id")?,
                copy_id: row.try_get("copy_id")?,
                title_id: row.try_get("title_id")?,
                borrowed_at: row.try_get("borrowed_at")?,
                due_at: row.try_get("due_at")?,
                returned_at: row.try_get("returned_at")?,
                status: row.try_get("status")?,
            };
            let copy_number: String = row.try_get("copy_number")?;
            let title = title_from_row(&row)?;
            result.push(BorrowDetails::new(borrow, copy_number, title, now));
        }

        Ok(result)
    }

    async fn ping(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Open Postgres transaction; rolled back by sqlx when dropped uncommitted
pub struct PgLendingTx {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl LendingTx for PgLendingTx {
    async fn first_available_copy(
        &mut self,
        title_id: i64,
    ) -> Result<Option<BookCopy>, StorageError> {
        let copy = sqlx::query_as::<_, BookCopy>(&format!(
            "SELECT {COPY_COLUMNS} FROM book_copies
             WHERE title_id = $1 AND status = $2
             ORDER BY id
             LIMIT 1
             FOR UPDATE"
        ))
        .bind(title_id)
        .bind(CopyStatus::Available)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(copy)
    }

    async fn has_active_borrow(&mut self, user_id: i64, title_id: i64) -> Result<bool, StorageError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM borrows WHERE user_id = $1 AND title_id = $2 AND status = 'active')",
        )
        .bind(user_id)
        .bind(title_id)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(exists)
    }

    async fn copy(&mut self, copy_id: i64) -> Result<Option<BookCopy>, StorageError> {
        let copy = sqlx::query_as::<_, BookCopy>(&format!(
            "SELECT {COPY_COLUMNS} FROM book_copies WHERE id = $1 FOR UPDATE"
        ))
        .bind(copy_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(copy)
    }

    async fn set_copy_status(&mut self, copy_id: i64, status: CopyStatus) -> Result<(), StorageError> {
        let result = sqlx::query("UPDATE book_copies SET status = $1 WHERE id = $2")
            .bind(status)
            .bind(copy_id)
            .execute(&mut *self.tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::Invariant(format!("copy {} does not exist", copy_id)));
        }
        Ok(())
    }

    async fn insert_borrow(&mut self, borrow: NewBorrow) -> Result<Borrow, StorageError> {
        let created = sqlx::query_as::<_, Borrow>(&format!(
            r#"
            INSERT INTO borrows (user_id, copy_id, title_id, borrowed_at, due_at, status)
            VALUES ($1, $2, $3, $4, $5, 'active')
            RETURNING {BORROW_COLUMNS}
            "#
        ))
        .bind(borrow.user_id)
        .bind(borrow.copy_id)
        .bind(borrow.title_id)
        .bind(borrow.borrowed_at)
        .bind(borrow.due_at)
        .fetch_one(&mut *self.tx)
        .await?;

        Ok(created)
    }

    async fn find_active_borrow(
        &mut self,
        borrow_id: i64,
        user_id: i64,
    ) -> Result<Option<Borrow>, StorageError> {
        let borrow = sqlx::query_as::<_, Borrow>(&format!(
            "SELECT {BORROW_COLUMNS} FROM borrows
             WHERE id = $1 AND user_id = $2 AND status = 'active'
             FOR UPDATE"
        ))
        .bind(borrow_id)
        .bind(user_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(borrow)
    }

    async fn close_borrow(
        &mut self,
        borrow_id: i64,
        returned_at: DateTime<Utc>,
    ) -> Result<Borrow, StorageError> {
        sqlx::query_as::<_, Borrow>(&format!(
            r#"
            UPDATE borrows SET status = 'returned', returned_at = $2
            WHERE id = $1 AND status = 'active'
            RETURNING {BORROW_COLUMNS}
            "#
        ))
        .bind(borrow_id)
        .bind(returned_at)
        .fetch_optional(&mut *self.tx)
        .await?
        .ok_or_else(|| StorageError::Invariant(format!("borrow {} is not active", borrow_id)))
    }

    async fn title_summary(&mut self, title_id: i64) -> Result<Option<TitleSummary>, StorageError> {
        let row = sqlx::query(&format!(
            "SELECT t.id AS title_id, t.title, t.isbn, {AUTHORS_SUBQUERY}
             FROM titles t WHERE t.id = $1"
        ))
        .bind(title_id)
        .fetch_optional(&mut *self.tx)
        .await?;

        Ok(row.as_ref().map(title_from_row).transpose()?)
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        // Serialization failures can surface only at commit time.
        self.tx.commit().await?;
        Ok(())
    }
}
