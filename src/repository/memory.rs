//! In-memory store backends
//!
//! Each store guards its records with one `RwLock`; a mutating call holds the
//! write half for the whole check-then-write, which gives the same per-record
//! serialization the Postgres backend gets from row locks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::time::Instant;
use uuid::Uuid;

use super::{ActivityLedger, BookStore, CommentStore, MemberStore, TokenStore};
use crate::{
    clock::{Clock, SystemClock},
    error::{AppError, AppResult},
    models::{
        book::blend_rating, member::MAX_ISSUED_BOOKS, ActionToken, ActivityAction,
        ActivityQuery, ActivityRecord, Book, BookFilter, Comment, CreateBook, IssueEntry, Member,
        MemberFilter, NewMember, OverdueBook, StockAdjustment, TokenAction,
    },
};

fn sorted_by_title(mut books: Vec<Book>) -> Vec<Book> {
    books.sort_by(|a, b| a.title.cmp(&b.title).then(a.id.cmp(&b.id)));
    books
}

pub struct MemoryBookStore {
    books: RwLock<HashMap<Uuid, Book>>,
    clock: Arc<dyn Clock>,
}

impl MemoryBookStore {
    /// Stamp `created_at`/`updated_at` from `clock`
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            books: RwLock::new(HashMap::new()),
            clock,
        }
    }
}

impl Default for MemoryBookStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

#[async_trait]
impl BookStore for MemoryBookStore {
    async fn create(&self, input: &CreateBook) -> AppResult<Book> {
        let book = Book::new(input, self.clock.now());
        self.books.write().await.insert(book.id, book.clone());
        Ok(book)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Book>> {
        Ok(self.books.read().await.get(&id).cloned())
    }

    async fn list(&self, filter: &BookFilter) -> AppResult<Vec<Book>> {
        let books = self.books.read().await;
        Ok(sorted_by_title(
            books.values().filter(|b| filter.matches(b)).cloned().collect(),
        ))
    }

    async fn requested(&self, member_id: Option<Uuid>) -> AppResult<Vec<Book>> {
        let books = self.books.read().await;
        Ok(sorted_by_title(
            books
                .values()
                .filter(|b| match member_id {
                    Some(m) => b.is_requested_by(m),
                    None => !b.requested_by.is_empty(),
                })
                .cloned()
                .collect(),
        ))
    }

    async fn issued_to_member(&self, member_id: Uuid) -> AppResult<Vec<Book>> {
        let books = self.books.read().await;
        Ok(sorted_by_title(
            books
                .values()
                .filter(|b| b.is_issued_to(member_id))
                .cloned()
                .collect(),
        ))
    }

    async fn add_request(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Book> {
        let mut books = self.books.write().await;
        let book = books
            .get_mut(&book_id)
            .ok_or(AppError::BookNotFound(book_id))?;
        if book.is_requested_by(member_id) {
            return Err(AppError::AlreadyRequested { book_id, member_id });
        }
        if book.is_issued_to(member_id) {
            return Err(AppError::AlreadyIssuedToMember { book_id, member_id });
        }
        book.requested_by.push(member_id);
        book.updated_at = self.clock.now();
        Ok(book.clone())
    }

    async fn remove_request(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Book> {
        let mut books = self.books.write().await;
        let book = books
            .get_mut(&book_id)
            .ok_or(AppError::BookNotFound(book_id))?;
        if !book.is_requested_by(member_id) {
            return Err(AppError::NotRequested { book_id, member_id });
        }
        book.requested_by.retain(|m| *m != member_id);
        book.updated_at = self.clock.now();
        Ok(book.clone())
    }

    async fn checkout(&self, book_id: Uuid, entry: IssueEntry) -> AppResult<Book> {
        let mut books = self.books.write().await;
        let book = books
            .get_mut(&book_id)
            .ok_or(AppError::BookNotFound(book_id))?;
        if book.stock <= 0 {
            return Err(AppError::OutOfStock(book_id));
        }
        if book.is_issued_to(entry.member_id) {
            return Err(AppError::AlreadyIssuedToMember {
                book_id,
                member_id: entry.member_id,
            });
        }
        book.stock -= 1;
        book.requested_by.retain(|m| *m != entry.member_id);
        book.issued_to.push(entry);
        book.updated_at = self.clock.now();
        Ok(book.clone())
    }

    async fn checkin(&self, book_id: Uuid, member_id: Uuid) -> AppResult<(Book, IssueEntry)> {
        let mut books = self.books.write().await;
        let book = books
            .get_mut(&book_id)
            .ok_or(AppError::BookNotFound(book_id))?;
        let pos = book
            .issued_to
            .iter()
            .position(|e| e.member_id == member_id)
            .ok_or(AppError::NotIssuedToMember { book_id, member_id })?;
        let entry = book.issued_to.remove(pos);
        book.stock += 1;
        book.updated_at = self.clock.now();
        Ok((book.clone(), entry))
    }

    async fn adjust_stock(&self, book_id: Uuid, adjustment: StockAdjustment) -> AppResult<Book> {
        let mut books = self.books.write().await;
        let book = books
            .get_mut(&book_id)
            .ok_or(AppError::BookNotFound(book_id))?;
        adjustment.validate()?;
        if let StockAdjustment::Subtract(amount) = adjustment {
            let available = book.removable_copies();
            if available < amount {
                return Err(AppError::InsufficientAvailableStock {
                    book_id,
                    requested: amount,
                    available,
                });
            }
        }
        book.stock = adjustment.apply(book.stock)?;
        book.updated_at = self.clock.now();
        Ok(book.clone())
    }

    async fn apply_rating(&self, book_id: Uuid, rating: f64) -> AppResult<Book> {
        let mut books = self.books.write().await;
        let book = books
            .get_mut(&book_id)
            .ok_or(AppError::BookNotFound(book_id))?;
        book.rating = blend_rating(book.rating, rating);
        book.rating_count += 1;
        book.updated_at = self.clock.now();
        Ok(book.clone())
    }

    async fn delete_if_idle(&self, book_id: Uuid) -> AppResult<()> {
        let mut books = self.books.write().await;
        let book = books.get(&book_id).ok_or(AppError::BookNotFound(book_id))?;
        if !book.issued_to.is_empty() {
            return Err(AppError::BooksInCirculation(book_id));
        }
        books.remove(&book_id);
        Ok(())
    }

    async fn overdue(&self, now: DateTime<Utc>) -> AppResult<Vec<OverdueBook>> {
        let books = self.books.read().await;
        let mut out: Vec<OverdueBook> = books
            .values()
            .filter_map(|b| {
                let overdue = b.overdue_entries(now);
                (!overdue.is_empty()).then(|| OverdueBook {
                    book_id: b.id,
                    title: b.title.clone(),
                    overdue,
                })
            })
            .collect();
        out.sort_by(|a, b| a.title.cmp(&b.title).then(a.book_id.cmp(&b.book_id)));
        Ok(out)
    }
}

pub struct MemoryMemberStore {
    members: RwLock<HashMap<Uuid, Member>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryMemberStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryMemberStore {
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            members: RwLock::new(HashMap::new()),
            clock,
        }
    }

    async fn update<F>(&self, member_id: Uuid, f: F) -> AppResult<Member>
    where
        F: FnOnce(&mut Member) -> AppResult<()> + Send,
    {
        let mut members = self.members.write().await;
        let member = members
            .get_mut(&member_id)
            .ok_or(AppError::MemberNotFound(member_id))?;
        f(member)?;
        member.updated_at = self.clock.now();
        Ok(member.clone())
    }
}

#[async_trait]
impl MemberStore for MemoryMemberStore {
    async fn create(&self, input: NewMember) -> AppResult<Member> {
        let mut members = self.members.write().await;
        if members
            .values()
            .any(|m| m.email.eq_ignore_ascii_case(&input.email))
        {
            return Err(AppError::Duplicate(format!("Email {} already registered", input.email)));
        }
        let member = Member::new(input, self.clock.now());
        members.insert(member.id, member.clone());
        Ok(member)
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Member>> {
        Ok(self.members.read().await.get(&id).cloned())
    }

    async fn get_by_email(&self, email: &str) -> AppResult<Option<Member>> {
        Ok(self
            .members
            .read()
            .await
            .values()
            .find(|m| m.email.eq_ignore_ascii_case(email))
            .cloned())
    }

    async fn list(&self, filter: &MemberFilter) -> AppResult<Vec<Member>> {
        let members = self.members.read().await;
        let mut out: Vec<Member> = members
            .values()
            .filter(|m| filter.matches(m))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn attach_issued(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        self.update(member_id, |m| {
            if m.holds(book_id) {
                return Err(AppError::AlreadyIssuedToMember { book_id, member_id });
            }
            if m.at_issue_limit() {
                return Err(AppError::IssueLimitReached {
                    member_id,
                    limit: MAX_ISSUED_BOOKS,
                });
            }
            m.issued_books.push(book_id);
            if !m.has_read(book_id) {
                m.read_history.push(book_id);
            }
            Ok(())
        })
        .await
    }

    async fn detach_issued(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        self.update(member_id, |m| {
            if !m.holds(book_id) {
                return Err(AppError::NotIssuedToMember { book_id, member_id });
            }
            m.issued_books.retain(|b| *b != book_id);
            Ok(())
        })
        .await
    }

    async fn forget_read(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        self.update(member_id, |m| {
            m.read_history.retain(|b| *b != book_id);
            Ok(())
        })
        .await
    }

    async fn set_blocked(&self, member_id: Uuid, blocked: bool) -> AppResult<Member> {
        self.update(member_id, |m| {
            m.blocked = blocked;
            Ok(())
        })
        .await
    }

    async fn set_newsletter(&self, member_id: Uuid, newsletter: bool) -> AppResult<Member> {
        self.update(member_id, |m| {
            m.newsletter = newsletter;
            Ok(())
        })
        .await
    }

    async fn set_subscription_end(
        &self,
        member_id: Uuid,
        until: DateTime<Utc>,
    ) -> AppResult<Member> {
        self.update(member_id, |m| {
            m.subscription_end = Some(until);
            Ok(())
        })
        .await
    }

    async fn set_password(&self, email: &str, password_hash: &str) -> AppResult<()> {
        let mut members = self.members.write().await;
        let member = members
            .values_mut()
            .find(|m| m.email.eq_ignore_ascii_case(email))
            .ok_or_else(|| AppError::Validation(format!("No member with email {}", email)))?;
        member.password = Some(password_hash.to_string());
        member.updated_at = self.clock.now();
        Ok(())
    }

    async fn add_to_wishlist(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        self.update(member_id, |m| {
            if m.wishlist.contains(&book_id) {
                return Err(AppError::AlreadyInWishlist(book_id));
            }
            m.wishlist.push(book_id);
            Ok(())
        })
        .await
    }

    async fn remove_from_wishlist(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        self.update(member_id, |m| {
            if !m.wishlist.contains(&book_id) {
                return Err(AppError::NotInWishlist(book_id));
            }
            m.wishlist.retain(|b| *b != book_id);
            Ok(())
        })
        .await
    }

    async fn delete_if_idle(&self, member_id: Uuid) -> AppResult<()> {
        let mut members = self.members.write().await;
        let member = members
            .get(&member_id)
            .ok_or(AppError::MemberNotFound(member_id))?;
        if !member.issued_books.is_empty() {
            return Err(AppError::MemberHasIssuedBooks(member_id));
        }
        members.remove(&member_id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryActivityLedger {
    records: RwLock<Vec<ActivityRecord>>,
}

#[async_trait]
impl ActivityLedger for MemoryActivityLedger {
    async fn record(
        &self,
        member_id: Uuid,
        book_id: Uuid,
        action: ActivityAction,
        at: DateTime<Utc>,
    ) -> AppResult<ActivityRecord> {
        let record = ActivityRecord {
            id: Uuid::new_v4(),
            member_id,
            book_id,
            action,
            created_at: at,
        };
        self.records.write().await.push(record.clone());
        Ok(record)
    }

    async fn list(&self, query: &ActivityQuery) -> AppResult<Vec<ActivityRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| query.matches(r))
            .cloned()
            .collect())
    }

    async fn last_for(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Option<ActivityRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .find(|r| r.member_id == member_id && r.book_id == book_id)
            .cloned())
    }
}

#[derive(Default)]
pub struct MemoryCommentStore {
    comments: RwLock<Vec<Comment>>,
}

#[async_trait]
impl CommentStore for MemoryCommentStore {
    async fn add(&self, comment: Comment) -> AppResult<Comment> {
        self.comments.write().await.push(comment.clone());
        Ok(comment)
    }

    async fn for_book(&self, book_id: Uuid) -> AppResult<Vec<Comment>> {
        Ok(self
            .comments
            .read()
            .await
            .iter()
            .filter(|c| c.book_id == book_id)
            .cloned()
            .collect())
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        self.comments.write().await.retain(|c| c.id != id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryTokenStore {
    tokens: RwLock<HashMap<(String, TokenAction), (ActionToken, Instant)>>,
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn issue(&self, token: &ActionToken, ttl_seconds: u64) -> AppResult<bool> {
        let mut tokens = self.tokens.write().await;
        let now = Instant::now();
        tokens.retain(|_, (_, expires)| *expires > now);

        let key = (token.email.to_lowercase(), token.action);
        if tokens.contains_key(&key) {
            return Ok(false);
        }
        tokens.insert(key, (token.clone(), now + Duration::from_secs(ttl_seconds)));
        Ok(true)
    }

    async fn consume(&self, digest: &str) -> AppResult<Option<ActionToken>> {
        let mut tokens = self.tokens.write().await;
        let now = Instant::now();
        tokens.retain(|_, (_, expires)| *expires > now);

        let key = tokens
            .iter()
            .find(|(_, (t, _))| t.digest == digest)
            .map(|(k, _)| k.clone());
        Ok(key.and_then(|k| tokens.remove(&k)).map(|(t, _)| t))
    }
}
