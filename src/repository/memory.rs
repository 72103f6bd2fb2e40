//! Process-local store used by tests and `database.in_memory` runs
//!
//! Units of work hold the state mutex for their whole lifetime, so they are
//! trivially serializable. Writes go to a private working copy that replaces
//! the shared state only on commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{collections::BTreeMap, sync::Arc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LendingStore, LendingTx, UserStore};
use crate::{
    error::{AppError, AppResult, StorageError},
    models::{
        Borrow, BorrowDetails, BorrowStatus, BookCopy, CopyStatus, NewBorrow, NewUser,
        TitleSummary, User,
    },
};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    titles: BTreeMap<i64, TitleSummary>,
    copies: BTreeMap<i64, BookCopy>,
    borrows: BTreeMap<i64, Borrow>,
    users: BTreeMap<i64, User>,
    last_id: i64,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.last_id += 1;
        self.last_id
    }

    fn title(&self, title_id: i64) -> Result<TitleSummary, StorageError> {
        self.titles
            .get(&title_id)
            .cloned()
            .ok_or_else(|| StorageError::Invariant(format!("title {} does not exist", title_id)))
    }
}

#[derive(Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a catalog title and return its id
    pub async fn add_title(&self, title: &str, isbn: Option<&str>, authors: &[&str]) -> i64 {
        let mut state = self.state.lock().await;
        let id = state.next_id();
        let mut authors: Vec<String> = authors.iter().map(|a| a.to_string()).collect();
        authors.sort();
        state.titles.insert(
            id,
            TitleSummary {
                id,
                title: title.to_string(),
                isbn: isbn.map(str::to_string),
                authors,
            },
        );
        id
    }

    /// Add `count` available copies of a title and return their ids
    pub async fn add_copies(&self, title_id: i64, count: usize) -> Vec<i64> {
        let mut state = self.state.lock().await;
        let existing = state.copies.values().filter(|c| c.title_id == title_id).count();
        let isbn = state
            .titles
            .get(&title_id)
            .and_then(|t| t.isbn.clone())
            .unwrap_or_else(|| title_id.to_string());

        (1..=count)
            .map(|n| {
                let id = state.next_id();
                state.copies.insert(
                    id,
                    BookCopy {
                        id,
                        title_id,
                        copy_number: format!("{}.{}", isbn, existing + n),
                        status: CopyStatus::Available,
                        acquired_at: Utc::now(),
                    },
                );
                id
            })
            .collect()
    }

    /// Catalog-side status change (e.g. a copy reported lost)
    pub async fn mark_copy(&self, copy_id: i64, status: CopyStatus) -> bool {
        let mut state = self.state.lock().await;
        match state.copies.get_mut(&copy_id) {
            Some(copy) => {
                copy.status = status;
                true
            }
            None => false,
        }
    }

    pub async fn copy(&self, copy_id: i64) -> Option<BookCopy> {
        self.state.lock().await.copies.get(&copy_id).cloned()
    }

    pub async fn borrow(&self, borrow_id: i64) -> Option<Borrow> {
        self.state.lock().await.borrows.get(&borrow_id).cloned()
    }

    pub async fn borrows(&self) -> Vec<Borrow> {
        self.state.lock().await.borrows.values().cloned().collect()
    }

    /// Small catalog for local runs without a database
    pub async fn seed_demo_catalog(&self) {
        let dune = self
            .add_title("Dune", Some("9780441172719"), &["Frank Herbert"])
            .await;
        let foundation = self
            .add_title("Foundation", Some("9780553293357"), &["Isaac Asimov"])
            .await;
        let omens = self
            .add_title(
                "Good Omens",
                Some("9780060853983"),
                &["Neil Gaiman", "Terry Pratchett"],
            )
            .await;
        self.add_copies(dune, 3).await;
        self.add_copies(foundation, 2).await;
        self.add_copies(omens, 1).await;
        tracing::info!("Seeded in-memory catalog with 3 titles");
    }
}

#[async_trait]
impl LendingStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LendingTx>, StorageError> {
        let guard = self.state.clone().lock_owned().await;
        let working = (*guard).clone();
        Ok(Box::new(MemoryTx { guard, working }))
    }

    async fn user_borrows(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BorrowDetails>, StorageError> {
        let state = self.state.lock().await;
        let mut borrows: Vec<&Borrow> = state
            .borrows
            .values()
            .filter(|b| b.user_id == user_id)
            .collect();
        borrows.sort_by(|a, b| (b.borrowed_at, b.id).cmp(&(a.borrowed_at, a.id)));

        borrows
            .into_iter()
            .map(|borrow| -> Result<BorrowDetails, StorageError> {
                let copy = state.copies.get(&borrow.copy_id).ok_or_else(|| {
                    StorageError::Invariant(format!("copy {} does not exist", borrow.copy_id))
                })?;
                let title = state.title(borrow.title_id)?;
                Ok(BorrowDetails::new(
                    borrow.clone(),
                    copy.copy_number.clone(),
                    title,
                    now,
                ))
            })
            .collect()
    }

    async fn ping(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

pub struct MemoryTx {
    guard: OwnedMutexGuard<MemoryState>,
    working: MemoryState,
}

#[async_trait]
impl LendingTx for MemoryTx {
    async fn first_available_copy(
        &mut self,
        title_id: i64,
    ) -> Result<Option<BookCopy>, StorageError> {
        Ok(self
            .working
            .copies
            .values()
            .find(|c| c.title_id == title_id && c.status.is_borrowable())
            .cloned())
    }

    async fn has_active_borrow(&mut self, user_id: i64, title_id: i64) -> Result<bool, StorageError> {
        Ok(self
            .working
            .borrows
            .values()
            .any(|b| b.user_id == user_id && b.title_id == title_id && b.is_active()))
    }

    async fn copy(&mut self, copy_id: i64) -> Result<Option<BookCopy>, StorageError> {
        Ok(self.working.copies.get(&copy_id).cloned())
    }

    async fn set_copy_status(&mut self, copy_id: i64, status: CopyStatus) -> Result<(), StorageError> {
        let copy = self
            .working
            .copies
            .get_mut(&copy_id)
            .ok_or_else(|| StorageError::Invariant(format!("copy {} does not exist", copy_id)))?;
        copy.status = status;
        Ok(())
    }

    async fn insert_borrow(&mut self, borrow: NewBorrow) -> Result<Borrow, StorageError> {
        // Same guarantees as the partial unique indexes in Postgres.
        let clash = self.working.borrows.values().any(|b| {
            b.is_active()
                && (b.copy_id == borrow.copy_id
                    || (b.user_id == borrow.user_id && b.title_id == borrow.title_id))
        });
        if clash {
            return Err(StorageError::Conflict(
                "active borrow unique constraint".to_string(),
            ));
        }

        let id = self.working.next_id();
        let created = Borrow {
            id,
            user_id: borrow.user_id,
            copy_id: borrow.copy_id,
            title_id: borrow.title_id,
            borrowed_at: borrow.borrowed_at,
            due_at: borrow.due_at,
            returned_at: None,
            status: BorrowStatus::Active,
        };
        self.working.borrows.insert(id, created.clone());
        Ok(created)
    }

    async fn find_active_borrow(
        &mut self,
        borrow_id: i64,
        user_id: i64,
    ) -> Result<Option<Borrow>, StorageError> {
        Ok(self
            .working
            .borrows
            .get(&borrow_id)
            .filter(|b| b.user_id == user_id && b.is_active())
            .cloned())
    }

    async fn close_borrow(
        &mut self,
        borrow_id: i64,
        returned_at: DateTime<Utc>,
    ) -> Result<Borrow, StorageError> {
        let borrow = self
            .working
            .borrows
            .get_mut(&borrow_id)
            .filter(|b| b.is_active())
            .ok_or_else(|| StorageError::Invariant(format!("borrow {} is not active", borrow_id)))?;
        borrow.status = BorrowStatus::Returned;
        borrow.returned_at = Some(returned_at);
        Ok(borrow.clone())
    }

    async fn title_summary(&mut self, title_id: i64) -> Result<Option<TitleSummary>, StorageError> {
        Ok(self.working.titles.get(&title_id).cloned())
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        let MemoryTx { mut guard, working } = *self;
        *guard = working;
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let state = self.state.lock().await;
        Ok(state
            .users
            .values()
            .find(|u| u.username.eq_ignore_ascii_case(username))
            .cloned())
    }

    async fn find_by_id(&self, id: i64) -> AppResult<Option<User>> {
        Ok(self.state.lock().await.users.get(&id).cloned())
    }

    async fn create(&self, user: NewUser) -> AppResult<User> {
        let mut state = self.state.lock().await;
        let taken = state.users.values().any(|u| {
            u.username.eq_ignore_ascii_case(&user.username) || u.email.eq_ignore_ascii_case(&user.email)
        });
        if taken {
            return Err(AppError::Conflict(
                "username or email already registered".to_string(),
            ));
        }

        let id = state.next_id();
        let created = User {
            id,
            username: user.username,
            email: user.email,
            password_hash: user.password_hash,
            role: user.role,
            created_at: Utc::now(),
        };
        state.users.insert(id, created.clone());
        Ok(created)
    }
}
