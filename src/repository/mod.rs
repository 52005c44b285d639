//! Repository layer: store traits and their Postgres / in-memory backends
//!
//! Every mutating method either applies in full or fails with the domain
//! error explaining which guard did not hold.
//! Two concurrent calls against the same book or member are serialized by the
//! backend (row lock or store lock), never by the caller.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    clock::{Clock, SystemClock},
    error::AppResult,
    models::{
        ActivityAction, ActivityQuery, ActivityRecord, ActionToken, Book, BookFilter, Comment,
        CreateBook, IssueEntry, Member, MemberFilter, NewMember, OverdueBook, StockAdjustment,
    },
};

/// Inventory record store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BookStore: Send + Sync {
    async fn create(&self, input: &CreateBook) -> AppResult<Book>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Book>>;

    async fn list(&self, filter: &BookFilter) -> AppResult<Vec<Book>>;

    /// Books with a pending request, optionally only those requested by `member_id`
    async fn requested(&self, member_id: Option<Uuid>) -> AppResult<Vec<Book>>;

    /// Books that have a copy issued to `member_id`
    async fn issued_to_member(&self, member_id: Uuid) -> AppResult<Vec<Book>>;

    /// Add to `requested_by` unless already requested or issued to the member
    async fn add_request(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Book>;

    /// Remove from `requested_by`; `NotRequested` if absent
    async fn remove_request(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Book>;

    /// Bind a copy: only if stock > 0 and the member holds none yet.
    /// Decrements stock and drops the member's pending request.
    async fn checkout(&self, book_id: Uuid, entry: IssueEntry) -> AppResult<Book>;

    /// Unbind the member's copy and put it back on the shelf
    async fn checkin(&self, book_id: Uuid, member_id: Uuid) -> AppResult<(Book, IssueEntry)>;

    async fn adjust_stock(&self, book_id: Uuid, adjustment: StockAdjustment) -> AppResult<Book>;

    /// Blend `rating` into the book's rating and bump the count
    async fn apply_rating(&self, book_id: Uuid, rating: f64) -> AppResult<Book>;

    /// Delete unless a copy is out
    async fn delete_if_idle(&self, book_id: Uuid) -> AppResult<()>;

    async fn overdue(&self, now: DateTime<Utc>) -> AppResult<Vec<OverdueBook>>;
}

/// Member record store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MemberStore: Send + Sync {
    /// `Duplicate` when the email is taken
    async fn create(&self, input: NewMember) -> AppResult<Member>;

    async fn get(&self, id: Uuid) -> AppResult<Option<Member>>;

    async fn get_by_email(&self, email: &str) -> AppResult<Option<Member>>;

    async fn list(&self, filter: &MemberFilter) -> AppResult<Vec<Member>>;

    /// Push onto `issued_books` while under the cap, and record in `read_history`
    async fn attach_issued(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member>;

    /// Pull from `issued_books`; `NotIssuedToMember` if absent
    async fn detach_issued(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member>;

    /// Drop a book from `read_history`
    async fn forget_read(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member>;

    async fn set_blocked(&self, member_id: Uuid, blocked: bool) -> AppResult<Member>;

    async fn set_newsletter(&self, member_id: Uuid, newsletter: bool) -> AppResult<Member>;

    async fn set_subscription_end(
        &self,
        member_id: Uuid,
        until: DateTime<Utc>,
    ) -> AppResult<Member>;

    async fn set_password(&self, email: &str, password_hash: &str) -> AppResult<()>;

    async fn add_to_wishlist(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member>;

    async fn remove_from_wishlist(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member>;

    /// Delete unless the member still holds books
    async fn delete_if_idle(&self, member_id: Uuid) -> AppResult<()>;
}

/// Append-only issue/return log
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityLedger: Send + Sync {
    async fn record(
        &self,
        member_id: Uuid,
        book_id: Uuid,
        action: ActivityAction,
        at: DateTime<Utc>,
    ) -> AppResult<ActivityRecord>;

    /// Oldest first
    async fn list(&self, query: &ActivityQuery) -> AppResult<Vec<ActivityRecord>>;

    /// Most recent record for the pair
    async fn last_for(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Option<ActivityRecord>>;
}

#[async_trait]
pub trait CommentStore: Send + Sync {
    async fn add(&self, comment: Comment) -> AppResult<Comment>;

    async fn for_book(&self, book_id: Uuid) -> AppResult<Vec<Comment>>;

    async fn delete(&self, id: Uuid) -> AppResult<()>;
}

/// Expiring action tokens
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Store the token unless one is already live for (email, action).
    /// Returns false when a live token blocked the write.
    async fn issue(&self, token: &ActionToken, ttl_seconds: u64) -> AppResult<bool>;

    /// Look up by digest and delete it
    async fn consume(&self, digest: &str) -> AppResult<Option<ActionToken>>;
}

/// Main repository struct holding one handle per store
#[derive(Clone)]
pub struct Repository {
    pub books: Arc<dyn BookStore>,
    pub members: Arc<dyn MemberStore>,
    pub activities: Arc<dyn ActivityLedger>,
    pub comments: Arc<dyn CommentStore>,
}

impl Repository {
    /// Create a repository backed by the given database pool
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self {
            books: Arc::new(postgres::PgBookStore::new(pool.clone())),
            members: Arc::new(postgres::PgMemberStore::new(pool.clone())),
            activities: Arc::new(postgres::PgActivityLedger::new(pool.clone())),
            comments: Arc::new(postgres::PgCommentStore::new(pool)),
        }
    }

    /// Create a repository that lives in process memory
    pub fn in_memory() -> Self {
        Self::in_memory_with_clock(Arc::new(SystemClock))
    }

    /// In-memory repository whose timestamps come from `clock`
    pub fn in_memory_with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            books: Arc::new(memory::MemoryBookStore::with_clock(clock.clone())),
            members: Arc::new(memory::MemoryMemberStore::with_clock(clock)),
            activities: Arc::new(memory::MemoryActivityLedger::default()),
            comments: Arc::new(memory::MemoryCommentStore::default()),
        }
    }
}
