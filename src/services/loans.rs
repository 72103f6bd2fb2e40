//! Lending engine: borrow and return as single units of work
//!
//! Copy status and the borrow row always change together inside one
//! transaction opened through [`crate::repository::LendingStore`]. The engine
//! keeps no state of its own; exclusivity between concurrent callers comes
//! from the store's serializable isolation.

use chrono::{Duration, Utc};
use std::future::Future;

use crate::{
    config::LendingConfig,
    error::{AppError, AppResult, BorrowError, ReturnError, StorageError},
    models::{Borrow, BorrowDetails, CopyStatus, NewBorrow},
    repository::Repository,
};

#[derive(Clone)]
pub struct LoansService {
    repository: Repository,
    config: LendingConfig,
}

impl LoansService {
    pub fn new(repository: Repository, config: LendingConfig) -> Self {
        Self { repository, config }
    }

    /// Allocate an available copy of `title_id` to `user_id` for `loan_days`
    pub async fn borrow(&self, user_id: i64, title_id: i64, loan_days: i64) -> AppResult<BorrowDetails> {
        if loan_days < self.config.min_loan_days || loan_days > self.config.max_loan_days {
            return Err(AppError::Validation(format!(
                "loan duration must be between {} and {} days",
                self.config.min_loan_days, self.config.max_loan_days
            )));
        }

        let result = self
            .with_conflict_retry("borrow", || self.try_borrow(user_id, title_id, loan_days))
            .await;

        match &result {
            Ok(details) => tracing::info!(
                user_id,
                title_id,
                borrow_id = details.id,
                copy_id = details.copy_id,
                due_at = %details.due_at,
                "copy borrowed"
            ),
            Err(AppError::Borrow(reason)) => {
                tracing::debug!(user_id, title_id, %reason, "borrow rejected")
            }
            Err(e) => tracing::error!(user_id, title_id, error = %e, "borrow failed"),
        }
        result
    }

    async fn try_borrow(&self, user_id: i64, title_id: i64, loan_days: i64) -> AppResult<BorrowDetails> {
        let mut tx = self.repository.lending.begin().await?;
        let now = Utc::now();
        let due_at = Duration::try_days(loan_days)
            .and_then(|days| now.checked_add_signed(days))
            .ok_or_else(|| {
                AppError::Validation(format!("loan duration of {} days is out of range", loan_days))
            })?;

        let copy = tx
            .first_available_copy(title_id)
            .await?
            .ok_or(BorrowError::NoCopiesAvailable)?;

        if tx.has_active_borrow(user_id, title_id).await? {
            return Err(BorrowError::DuplicateActiveLoan.into());
        }

        tx.set_copy_status(copy.id, CopyStatus::Borrowed).await?;
        let borrow = tx
            .insert_borrow(NewBorrow {
                user_id,
                copy_id: copy.id,
                title_id,
                borrowed_at: now,
                due_at,
            })
            .await?;

        let title = tx.title_summary(title_id).await?.ok_or_else(|| {
            StorageError::Invariant(format!("copy {} belongs to unknown title {}", copy.id, title_id))
        })?;

        tx.commit().await?;

        Ok(BorrowDetails::new(borrow, copy.copy_number, title, now))
    }

    /// Close the caller's active borrow and release its copy
    pub async fn return_copy(&self, user_id: i64, borrow_id: i64) -> AppResult<Borrow> {
        let result = self
            .with_conflict_retry("return", || self.try_return(user_id, borrow_id))
            .await;

        match &result {
            Ok(borrow) => tracing::info!(
                user_id,
                borrow_id,
                copy_id = borrow.copy_id,
                "copy returned"
            ),
            Err(AppError::Return(reason)) => {
                tracing::debug!(user_id, borrow_id, %reason, "return rejected")
            }
            Err(e) => tracing::error!(user_id, borrow_id, error = %e, "return failed"),
        }
        result
    }

    async fn try_return(&self, user_id: i64, borrow_id: i64) -> AppResult<Borrow> {
        let mut tx = self.repository.lending.begin().await?;

        // Someone else's borrow and an unknown id look the same to the caller.
        let borrow = tx
            .find_active_borrow(borrow_id, user_id)
            .await?
            .ok_or(ReturnError::NotFound)?;

        let returned_at = Utc::now().max(borrow.borrowed_at);
        let closed = tx.close_borrow(borrow.id, returned_at).await?;

        let copy = tx.copy(borrow.copy_id).await?.ok_or_else(|| {
            StorageError::Invariant(format!(
                "borrow {} references missing copy {}",
                borrow.id, borrow.copy_id
            ))
        })?;

        match copy.status {
            CopyStatus::Borrowed => tx.set_copy_status(copy.id, CopyStatus::Available).await?,
            CopyStatus::Lost | CopyStatus::Maintenance => {
                tracing::warn!(
                    copy_id = copy.id,
                    status = %copy.status,
                    "returned copy keeps its catalog status"
                );
            }
            CopyStatus::Available => {
                return Err(StorageError::Invariant(format!(
                    "copy {} is available while borrow {} is active",
                    copy.id, borrow.id
                ))
                .into());
            }
        }

        tx.commit().await?;
        Ok(closed)
    }

    /// Borrows of a user, newest first
    pub async fn user_borrows(&self, user_id: i64) -> AppResult<Vec<BorrowDetails>> {
        Ok(self.repository.lending.user_borrows(user_id, Utc::now()).await?)
    }

    /// Whether the backing store answers
    pub async fn store_ready(&self) -> AppResult<()> {
        Ok(self.repository.lending.ping().await?)
    }

    /// Run `attempt` again while it fails with a serialization conflict, up to
    /// `max_conflict_retries` extra times.
    async fn with_conflict_retry<T, F, Fut>(&self, operation: &'static str, mut attempt: F) -> AppResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = AppResult<T>>,
    {
        let mut retries = 0;
        loop {
            match attempt().await {
                Err(AppError::Storage(e))
                    if e.is_retryable() && retries < self.config.max_conflict_retries =>
                {
                    retries += 1;
                    tracing::warn!(operation, retries, error = %e, "serialization conflict, retrying");
                    tokio::time::sleep(std::time::Duration::from_millis(5 * u64::from(retries))).await;
                }
                result => return result,
            }
        }
    }
}
