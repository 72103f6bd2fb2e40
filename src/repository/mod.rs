//! Repository layer: persistence capabilities consumed by the services
//!
//! The lending engine only sees [`LendingStore`] and [`LendingTx`]. Any store
//! that can run a group of these calls as one serializable unit of work can
//! back it; Postgres is used in production and [`memory::MemoryStore`] in
//! tests and local runs.

pub mod lending;
pub mod memory;
pub mod users;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use std::sync::Arc;

use crate::{
    error::{AppResult, StorageError},
    models::{Borrow, BorrowDetails, BookCopy, CopyStatus, NewBorrow, NewUser, TitleSummary, User},
};

/// Source of atomic units of work over copies and borrows
#[async_trait]
pub trait LendingStore: Send + Sync {
    /// Open a unit of work with serializable isolation.
    async fn begin(&self) -> Result<Box<dyn LendingTx>, StorageError>;

    /// Borrows of a user, newest first, with display data.
    async fn user_borrows(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BorrowDetails>, StorageError>;

    /// Check that the store is reachable.
    async fn ping(&self) -> Result<(), StorageError>;
}

/// One open unit of work.
///
/// Dropping a transaction without calling [`LendingTx::commit`] discards every
/// write made through it.
#[async_trait]
pub trait LendingTx: Send {
    /// Lowest-id copy of `title_id` whose status is `available`, locked for update.
    async fn first_available_copy(&mut self, title_id: i64)
        -> Result<Option<BookCopy>, StorageError>;

    /// Whether `user_id` holds an active borrow of any copy of `title_id`.
    async fn has_active_borrow(&mut self, user_id: i64, title_id: i64)
        -> Result<bool, StorageError>;

    async fn copy(&mut self, copy_id: i64) -> Result<Option<BookCopy>, StorageError>;

    async fn set_copy_status(&mut self, copy_id: i64, status: CopyStatus)
        -> Result<(), StorageError>;

    async fn insert_borrow(&mut self, borrow: NewBorrow) -> Result<Borrow, StorageError>;

    /// Active borrow with this id owned by `user_id`, locked for update.
    async fn find_active_borrow(&mut self, borrow_id: i64, user_id: i64)
        -> Result<Option<Borrow>, StorageError>;

    /// Mark an active borrow returned at `returned_at`.
    async fn close_borrow(&mut self, borrow_id: i64, returned_at: DateTime<Utc>)
        -> Result<Borrow, StorageError>;

    async fn title_summary(&mut self, title_id: i64)
        -> Result<Option<TitleSummary>, StorageError>;

    async fn commit(self: Box<Self>) -> Result<(), StorageError>;
}

/// Account lookup and creation
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>>;

    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>>;

    /// Insert a user; fails with `AppError::Conflict` when the username or
    /// email is taken.
    async fn create(&self, user: NewUser) -> AppResult<User>;
}

/// Main repository struct holding the persistence capabilities
#[derive(Clone)]
pub struct Repository {
    pub lending: Arc<dyn LendingStore>,
    pub users: Arc<dyn UserStore>,
}

impl Repository {
    /// Create a repository backed by the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            lending: Arc::new(lending::PgLendingStore::new(pool.clone())),
            users: Arc::new(users::UsersRepository::new(pool)),
        }
    }

    /// Create a repository backed by a process-local store
    pub fn in_memory(store: memory::MemoryStore) -> Self {
        Self {
            lending: Arc::new(store.clone()),
            users: Arc::new(store),
        }
    }
}
