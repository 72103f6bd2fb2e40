//! Lending engine scenarios, concurrency and failure handling

use async_trait::async_trait;
use axum::{http::StatusCode, response::IntoResponse};
use chrono::{DateTime, Utc};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    },
};

use library_lending::{
    config::LendingConfig,
    error::{AppError, BorrowError, ReturnError, StorageError},
    models::{Borrow, BorrowDetails, BorrowStatus, BookCopy, CopyStatus, NewBorrow, TitleSummary},
    repository::{memory::MemoryStore, LendingStore, LendingTx, Repository},
    services::loans::LoansService,
};

async fn catalog(copies: usize) -> (MemoryStore, i64, Vec<i64>) {
    let store = MemoryStore::new();
    let title = store
        .add_title("A Wizard of Earthsea", Some("9780547773742"), &["Ursula K. Le Guin"])
        .await;
    let copy_ids = store.add_copies(title, copies).await;
    (store, title, copy_ids)
}

fn service(store: &MemoryStore) -> LoansService {
    LoansService::new(Repository::in_memory(store.clone()), LendingConfig::default())
}

#[tokio::test]
async fn test_single_copy_passes_between_users() {
    let (store, title, copies) = catalog(1).await;
    let loans = service(&store);

    let first = loans.borrow(1, title, 14).await.unwrap();
    assert_eq!(first.copy_id, copies[0]);
    assert_eq!(store.copy(copies[0]).await.unwrap().status, CopyStatus::Borrowed);

    let err = loans.borrow(2, title, 14).await.unwrap_err();
    assert!(matches!(err, AppError::Borrow(BorrowError::NoCopiesAvailable)));

    loans.return_copy(1, first.id).await.unwrap();

    let second = loans.borrow(2, title, 14).await.unwrap();
    assert_eq!(second.copy_id, copies[0]);
    assert_ne!(second.id, first.id);
}

#[tokio::test]
async fn test_duplicate_active_loan_leaves_other_copies_free() {
    let (store, title, copies) = catalog(2).await;
    let loans = service(&store);

    loans.borrow(1, title, 7).await.unwrap();
    let err = loans.borrow(1, title, 7).await.unwrap_err();

    assert!(matches!(err, AppError::Borrow(BorrowError::DuplicateActiveLoan)));
    assert_eq!(store.copy(copies[1]).await.unwrap().status, CopyStatus::Available);
    assert_eq!(store.borrows().await.len(), 1);
}

#[tokio::test]
async fn test_return_round_trip() {
    let (store, title, copies) = catalog(1).await;
    let loans = service(&store);

    let details = loans.borrow(1, title, 7).await.unwrap();
    let closed = loans.return_copy(1, details.id).await.unwrap();

    assert_eq!(closed.status, BorrowStatus::Returned);
    let returned_at = closed.returned_at.unwrap();
    assert!(returned_at >= closed.borrowed_at);
    assert_eq!(store.copy(copies[0]).await.unwrap().status, CopyStatus::Available);

    // The same user may borrow the title again once the loan is closed.
    loans.borrow(1, title, 7).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_borrowers_never_exceed_copies() {
    let (store, title, copies) = catalog(3).await;
    let loans = service(&store);

    let handles: Vec<_> = (1..=24)
        .map(|user_id| {
            let loans = loans.clone();
            tokio::spawn(async move { loans.borrow(user_id, title, 7).await })
        })
        .collect();

    let mut granted = Vec::new();
    for handle in handles {
        match handle.await.unwrap() {
            Ok(details) => granted.push(details.copy_id),
            Err(AppError::Borrow(BorrowError::NoCopiesAvailable)) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    granted.sort();
    assert_eq!(granted, copies);
    assert_eq!(store.borrows().await.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_requests_from_one_user_get_one_copy() {
    let (store, title, _) = catalog(5).await;
    let loans = service(&store);

    let handles: Vec<_> = (0..10)
        .map(|_| {
            let loans = loans.clone();
            tokio::spawn(async move { loans.borrow(42, title, 7).await })
        })
        .collect();

    let mut succeeded = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => succeeded += 1,
            Err(AppError::Borrow(BorrowError::DuplicateActiveLoan)) => {}
            Err(e) => panic!("unexpected error: {e:?}"),
        }
    }

    assert_eq!(succeeded, 1);
    let active: Vec<Borrow> = store.borrows().await.into_iter().filter(Borrow::is_active).collect();
    assert_eq!(active.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_borrow_and_return_churn_keeps_copies_consistent() {
    let (store, title, copies) = catalog(2).await;
    let loans = service(&store);

    let handles: Vec<_> = (1..=8)
        .map(|user_id| {
            let loans = loans.clone();
            tokio::spawn(async move {
                for _ in 0..5 {
                    if let Ok(details) = loans.borrow(user_id, title, 3).await {
                        tokio::task::yield_now().await;
                        loans.return_copy(user_id, details.id).await.unwrap();
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    let borrows = store.borrows().await;
    assert!(borrows.iter().all(|b| !b.is_active()));
    assert!(borrows
        .iter()
        .all(|b| b.returned_at.map_or(false, |at| at >= b.borrowed_at)));
    for copy in copies {
        assert_eq!(store.copy(copy).await.unwrap().status, CopyStatus::Available);
    }

    // No copy was ever lent to two users over overlapping intervals.
    let mut by_copy: HashMap<i64, Vec<&Borrow>> = HashMap::new();
    for borrow in &borrows {
        by_copy.entry(borrow.copy_id).or_default().push(borrow);
    }
    for history in by_copy.values_mut() {
        history.sort_by_key(|b| b.borrowed_at);
        for pair in history.windows(2) {
            assert!(pair[0].returned_at.unwrap() <= pair[1].borrowed_at);
        }
    }
}

/// Store wrapper that fails selected steps of a unit of work
#[derive(Clone)]
struct FlakyStore {
    inner: MemoryStore,
    fail_insert: bool,
    commit_conflicts: Arc<AtomicU32>,
    commits_attempted: Arc<AtomicU32>,
}

impl FlakyStore {
    fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            fail_insert: false,
            commit_conflicts: Arc::new(AtomicU32::new(0)),
            commits_attempted: Arc::new(AtomicU32::new(0)),
        }
    }

    fn service(&self, max_conflict_retries: u32) -> LoansService {
        let repository = Repository {
            lending: Arc::new(self.clone()),
            users: Arc::new(self.inner.clone()),
        };
        LoansService::new(
            repository,
            LendingConfig {
                max_conflict_retries,
                ..LendingConfig::default()
            },
        )
    }
}

#[async_trait]
impl LendingStore for FlakyStore {
    async fn begin(&self) -> Result<Box<dyn LendingTx>, StorageError> {
        Ok(Box::new(FlakyTx {
            inner: self.inner.begin().await?,
            store: self.clone(),
        }))
    }

    async fn user_borrows(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<Vec<BorrowDetails>, StorageError> {
        self.inner.user_borrows(user_id, now).await
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.inner.ping().await
    }
}

struct FlakyTx {
    inner: Box<dyn LendingTx>,
    store: FlakyStore,
}

#[async_trait]
impl LendingTx for FlakyTx {
    async fn first_available_copy(&mut self, title_id: i64) -> Result<Option<BookCopy>, StorageError> {
        self.inner.first_available_copy(title_id).await
    }

    async fn has_active_borrow(&mut self, user_id: i64, title_id: i64) -> Result<bool, StorageError> {
        self.inner.has_active_borrow(user_id, title_id).await
    }

    async fn copy(&mut self, copy_id: i64) -> Result<Option<BookCopy>, StorageError> {
        self.inner.copy(copy_id).await
    }

    async fn set_copy_status(&mut self, copy_id: i64, status: CopyStatus) -> Result<(), StorageError> {
        self.inner.set_copy_status(copy_id, status).await
    }

    async fn insert_borrow(&mut self, borrow: NewBorrow) -> Result<Borrow, StorageError> {
        if self.store.fail_insert {
            return Err(StorageError::Database(sqlx::Error::PoolTimedOut));
        }
        self.inner.insert_borrow(borrow).await
    }

    async fn find_active_borrow(&mut self, borrow_id: i64, user_id: i64) -> Result<Option<Borrow>, StorageError> {
        self.inner.find_active_borrow(borrow_id, user_id).await
    }

    async fn close_borrow(&mut self, borrow_id: i64, returned_at: DateTime<Utc>) -> Result<Borrow, StorageError> {
        self.inner.close_borrow(borrow_id, returned_at).await
    }

    async fn title_summary(&mut self, title_id: i64) -> Result<Option<TitleSummary>, StorageError> {
        self.inner.title_summary(title_id).await
    }

    async fn commit(self: Box<Self>) -> Result<(), StorageError> {
        self.store.commits_attempted.fetch_add(1, Ordering::SeqCst);
        let pending = self.store.commit_conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.store.commit_conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(StorageError::Conflict("could not serialize access".to_string()));
        }
        self.inner.commit().await
    }
}

#[tokio::test]
async fn test_failed_insert_rolls_back_copy_status() {
    let (store, title, copies) = catalog(1).await;
    let mut flaky = FlakyStore::new(store.clone());
    flaky.fail_insert = true;

    let err = flaky.service(3).borrow(1, title, 7).await.unwrap_err();

    assert!(matches!(err, AppError::Storage(StorageError::Database(_))));
    assert_eq!(store.copy(copies[0]).await.unwrap().status, CopyStatus::Available);
    assert!(store.borrows().await.is_empty());
    assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[tokio::test]
async fn test_serialization_conflicts_are_retried() {
    let (store, title, copies) = catalog(1).await;
    let flaky = FlakyStore::new(store.clone());
    flaky.commit_conflicts.store(2, Ordering::SeqCst);

    let details = flaky.service(3).borrow(1, title, 7).await.unwrap();

    assert_eq!(details.copy_id, copies[0]);
    assert_eq!(flaky.commits_attempted.load(Ordering::SeqCst), 3);
    assert_eq!(store.borrows().await.len(), 1);
}

#[tokio::test]
async fn test_retry_exhaustion_is_service_unavailable() {
    let (store, title, copies) = catalog(1).await;
    let flaky = FlakyStore::new(store.clone());
    flaky.commit_conflicts.store(10, Ordering::SeqCst);

    let err = flaky.service(2).borrow(1, title, 7).await.unwrap_err();

    assert!(matches!(err, AppError::Storage(StorageError::Conflict(_))));
    assert_eq!(flaky.commits_attempted.load(Ordering::SeqCst), 3);
    assert_eq!(store.copy(copies[0]).await.unwrap().status, CopyStatus::Available);
    assert_eq!(err.into_response().status(), StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn test_return_conflict_is_retried() {
    let (store, title, copies) = catalog(1).await;
    let flaky = FlakyStore::new(store.clone());
    let loans = flaky.service(3);
    let details = loans.borrow(1, title, 7).await.unwrap();

    flaky.commit_conflicts.store(1, Ordering::SeqCst);
    let closed = loans.return_copy(1, details.id).await.unwrap();

    assert_eq!(closed.status, BorrowStatus::Returned);
    assert_eq!(store.copy(copies[0]).await.unwrap().status, CopyStatus::Available);

    let err = loans.return_copy(1, details.id).await.unwrap_err();
    assert!(matches!(err, AppError::Return(ReturnError::NotFound)));
}
