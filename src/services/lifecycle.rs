//! Book lifecycle engine
//!
//! Transitions that touch both a book and a member write in the order
//! book, member, activity. When a later write fails the earlier ones are
//! undone; if an undo fails too the pair is left for the reconciler.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;
use validator::Validate;

use super::{bounded, detached};
use crate::{
    clock::Clock,
    error::{AppError, AppResult},
    models::{
        book::due_date_from, member::MAX_ISSUED_BOOKS, ActivityAction, ActivityQuery,
        ActivityRecord, Book, Comment, Identity, IssueEntry, Member, OverdueBook, RateBook,
        StockAdjustment,
    },
    repository::Repository,
};

/// Outcome of a successful issue
#[derive(Debug, Clone, Serialize)]
pub struct IssueReceipt {
    pub book: Book,
    pub member: Member,
    pub activity: ActivityRecord,
    pub due_date: DateTime<Utc>,
}

/// Outcome of a successful return
#[derive(Debug, Clone, Serialize)]
pub struct ReturnReceipt {
    pub book: Book,
    pub member: Member,
    pub activity: ActivityRecord,
    pub was_overdue: bool,
}

#[derive(Clone)]
pub struct LifecycleService {
    repository: Repository,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl LifecycleService {
    pub fn new(repository: Repository, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            repository,
            clock,
            timeout,
        }
    }

    async fn load_member(&self, member_id: Uuid) -> AppResult<Member> {
        bounded(self.timeout, "member store", self.repository.members.get(member_id))
            .await?
            .ok_or(AppError::MemberNotFound(member_id))
    }

    async fn load_book(&self, book_id: Uuid) -> AppResult<Book> {
        bounded(self.timeout, "book store", self.repository.books.get(book_id))
            .await?
            .ok_or(AppError::BookNotFound(book_id))
    }

    /// Put the member on the book's waiting list
    pub async fn request_book(
        &self,
        identity: &Identity,
        member_id: Uuid,
        book_id: Uuid,
    ) -> AppResult<Book> {
        identity.require_self_or_admin(member_id)?;

        let member = self.load_member(member_id).await?;
        if member.blocked {
            return Err(AppError::MemberBlocked(member_id));
        }
        // Admins may queue a request for a member whose plan has lapsed
        if !identity.is_admin() && !member.has_active_subscription(self.clock.now()) {
            return Err(AppError::SubscriptionExpired(member_id));
        }

        let book = bounded(
            self.timeout,
            "book store",
            self.repository.books.add_request(book_id, member_id),
        )
        .await?;

        tracing::info!("Member {} requested book {}", member_id, book_id);
        Ok(book)
    }

    /// Withdraw a pending request
    pub async fn cancel_request(
        &self,
        identity: &Identity,
        member_id: Uuid,
        book_id: Uuid,
    ) -> AppResult<Book> {
        identity.require_self_or_admin(member_id)?;

        let book = bounded(
            self.timeout,
            "book store",
            self.repository.books.remove_request(book_id, member_id),
        )
        .await?;

        tracing::info!("Request of member {} for book {} cancelled", member_id, book_id);
        Ok(book)
    }

    /// Hand a copy of the book to the member
    pub async fn issue_book(
        &self,
        identity: &Identity,
        book_id: Uuid,
        member_id: Uuid,
    ) -> AppResult<IssueReceipt> {
        identity.require_admin()?;
        let engine = self.clone();
        detached(async move { engine.run_issue(book_id, member_id).await }).await
    }

    async fn run_issue(&self, book_id: Uuid, member_id: Uuid) -> AppResult<IssueReceipt> {
        let member = self.load_member(member_id).await?;
        if member.blocked {
            return Err(AppError::MemberBlocked(member_id));
        }
        if member.at_issue_limit() {
            return Err(AppError::IssueLimitReached {
                member_id,
                limit: MAX_ISSUED_BOOKS,
            });
        }
        if member.holds(book_id) {
            return Err(AppError::AlreadyIssuedToMember { book_id, member_id });
        }

        let book = self.load_book(book_id).await?;
        if book.is_issued_to(member_id) {
            return Err(AppError::AlreadyIssuedToMember { book_id, member_id });
        }
        if book.stock <= 0 {
            return Err(AppError::OutOfStock(book_id));
        }

        let now = self.clock.now();
        let entry = IssueEntry {
            member_id,
            due_date: due_date_from(now),
        };
        let had_request = book.is_requested_by(member_id);
        let had_read = member.has_read(book_id);

        let book = bounded(
            self.timeout,
            "book store",
            self.repository.books.checkout(book_id, entry.clone()),
        )
        .await?;

        let member = match bounded(
            self.timeout,
            "member store",
            self.repository.members.attach_issued(member_id, book_id),
        )
        .await
        {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(
                    "Issue of book {} to member {} failed on the member record: {}",
                    book_id,
                    member_id,
                    e
                );
                self.undo_checkout(book_id, member_id, had_request).await;
                return Err(e);
            }
        };

        let activity = match bounded(
            self.timeout,
            "activity ledger",
            self.repository
                .activities
                .record(member_id, book_id, ActivityAction::Issue, now),
        )
        .await
        {
            Ok(activity) => activity,
            Err(e) => {
                tracing::warn!(
                    "Issue of book {} to member {} failed on the ledger: {}",
                    book_id,
                    member_id,
                    e
                );
                self.undo_attach(member_id, book_id, had_read).await;
                self.undo_checkout(book_id, member_id, had_request).await;
                return Err(e);
            }
        };

        tracing::info!(
            "Issued book {} to member {}, due {}",
            book_id,
            member_id,
            entry.due_date
        );

        Ok(IssueReceipt {
            book,
            member,
            activity,
            due_date: entry.due_date,
        })
    }

    async fn undo_checkout(&self, book_id: Uuid, member_id: Uuid, restore_request: bool) {
        if let Err(e) = bounded(
            self.timeout,
            "book store",
            self.repository.books.checkin(book_id, member_id),
        )
        .await
        {
            tracing::error!(
                "Could not take back book {} from member {}: {}; reconciliation required",
                book_id,
                member_id,
                e
            );
            return;
        }

        if restore_request {
            if let Err(e) = bounded(
                self.timeout,
                "book store",
                self.repository.books.add_request(book_id, member_id),
            )
            .await
            {
                tracing::error!(
                    "Could not restore request of member {} for book {}: {}",
                    member_id,
                    book_id,
                    e
                );
            }
        }
    }

    async fn undo_attach(&self, member_id: Uuid, book_id: Uuid, had_read: bool) {
        if let Err(e) = bounded(
            self.timeout,
            "member store",
            self.repository.members.detach_issued(member_id, book_id),
        )
        .await
        {
            tracing::error!(
                "Could not detach book {} from member {}: {}; reconciliation required",
                book_id,
                member_id,
                e
            );
            return;
        }

        if !had_read {
            if let Err(e) = bounded(
                self.timeout,
                "member store",
                self.repository.members.forget_read(member_id, book_id),
            )
            .await
            {
                tracing::error!(
                    "Could not drop book {} from read history of member {}: {}",
                    book_id,
                    member_id,
                    e
                );
            }
        }
    }

    /// Take a copy back from the member
    pub async fn return_book(
        &self,
        identity: &Identity,
        book_id: Uuid,
        member_id: Uuid,
    ) -> AppResult<ReturnReceipt> {
        identity.require_admin()?;
        let engine = self.clone();
        detached(async move { engine.run_return(book_id, member_id).await }).await
    }

    async fn run_return(&self, book_id: Uuid, member_id: Uuid) -> AppResult<ReturnReceipt> {
        self.load_member(member_id).await?;

        let now = self.clock.now();
        let (book, entry) = bounded(
            self.timeout,
            "book store",
            self.repository.books.checkin(book_id, member_id),
        )
        .await?;

        let mut was_detached = true;
        let detach = match bounded(
            self.timeout,
            "member store",
            self.repository.members.detach_issued(member_id, book_id),
        )
        .await
        {
            Err(AppError::NotIssuedToMember { .. }) => {
                tracing::warn!(
                    "Member {} did not list book {} while returning it",
                    member_id,
                    book_id
                );
                was_detached = false;
                self.load_member(member_id).await
            }
            other => other,
        };

        let member = match detach {
            Ok(member) => member,
            Err(e) => {
                tracing::warn!(
                    "Return of book {} by member {} failed on the member record: {}",
                    book_id,
                    member_id,
                    e
                );
                self.undo_checkin(book_id, entry).await;
                return Err(e);
            }
        };

        let activity = match bounded(
            self.timeout,
            "activity ledger",
            self.repository
                .activities
                .record(member_id, book_id, ActivityAction::Return, now),
        )
        .await
        {
            Ok(activity) => activity,
            Err(e) => {
                tracing::warn!(
                    "Return of book {} by member {} failed on the ledger: {}",
                    book_id,
                    member_id,
                    e
                );
                if was_detached {
                    self.undo_detach(member_id, book_id).await;
                }
                self.undo_checkin(book_id, entry).await;
                return Err(e);
            }
        };

        let was_overdue = entry.due_date < now;
        tracing::info!(
            "Book {} returned by member {}{}",
            book_id,
            member_id,
            if was_overdue { " (overdue)" } else { "" }
        );

        Ok(ReturnReceipt {
            book,
            member,
            activity,
            was_overdue,
        })
    }

    async fn undo_checkin(&self, book_id: Uuid, entry: IssueEntry) {
        let member_id = entry.member_id;
        if let Err(e) = bounded(
            self.timeout,
            "book store",
            self.repository.books.checkout(book_id, entry),
        )
        .await
        {
            tracing::error!(
                "Could not re-issue book {} to member {}: {}; reconciliation required",
                book_id,
                member_id,
                e
            );
        }
    }

    async fn undo_detach(&self, member_id: Uuid, book_id: Uuid) {
        if let Err(e) = bounded(
            self.timeout,
            "member store",
            self.repository.members.attach_issued(member_id, book_id),
        )
        .await
        {
            tracing::error!(
                "Could not re-attach book {} to member {}: {}; reconciliation required",
                book_id,
                member_id,
                e
            );
        }
    }

    /// Add or remove copies owned by the library
    pub async fn adjust_stock(
        &self,
        identity: &Identity,
        book_id: Uuid,
        adjustment: StockAdjustment,
    ) -> AppResult<Book> {
        identity.require_admin()?;
        adjustment.validate()?;

        let book = bounded(
            self.timeout,
            "book store",
            self.repository.books.adjust_stock(book_id, adjustment),
        )
        .await?;

        tracing::info!(
            "Stock of book {} adjusted by {}, now {}",
            book_id,
            adjustment.delta(),
            book.stock
        );
        Ok(book)
    }

    /// Books with at least one copy due before `now`, listing only those copies
    pub async fn due_sweep(&self, now: DateTime<Utc>) -> AppResult<Vec<OverdueBook>> {
        let overdue = bounded(
            self.timeout,
            "book store",
            self.repository.books.overdue(now),
        )
        .await?;
        tracing::debug!("Due sweep at {} found {} books", now, overdue.len());
        Ok(overdue)
    }

    /// Rate a book the caller has borrowed and leave a comment
    pub async fn rate_and_comment(
        &self,
        identity: &Identity,
        book_id: Uuid,
        input: RateBook,
    ) -> AppResult<(Book, Comment)> {
        input.validate()?;
        let engine = self.clone();
        let member_id = identity.member_id;
        detached(async move { engine.run_rate(member_id, book_id, input).await }).await
    }

    async fn run_rate(
        &self,
        member_id: Uuid,
        book_id: Uuid,
        input: RateBook,
    ) -> AppResult<(Book, Comment)> {
        let member = self.load_member(member_id).await?;
        if !member.has_read(book_id) {
            return Err(AppError::NotInReadHistory { book_id, member_id });
        }
        self.load_book(book_id).await?;

        let comment = Comment {
            id: Uuid::new_v4(),
            member_id,
            member_name: member.name,
            book_id,
            comment: input.comment,
            created_at: self.clock.now(),
        };
        let comment = bounded(
            self.timeout,
            "comment store",
            self.repository.comments.add(comment),
        )
        .await?;

        match bounded(
            self.timeout,
            "book store",
            self.repository.books.apply_rating(book_id, input.rating),
        )
        .await
        {
            Ok(book) => {
                tracing::info!(
                    "Member {} rated book {} with {}, rating now {:.2}",
                    member_id,
                    book_id,
                    input.rating,
                    book.rating
                );
                Ok((book, comment))
            }
            Err(e) => {
                if let Err(undo) = bounded(
                    self.timeout,
                    "comment store",
                    self.repository.comments.delete(comment.id),
                )
                .await
                {
                    tracing::error!("Could not drop comment {}: {}", comment.id, undo);
                }
                Err(e)
            }
        }
    }

    /// Delete a book with no copy out
    pub async fn delete_book(&self, identity: &Identity, book_id: Uuid) -> AppResult<()> {
        identity.require_admin()?;

        bounded(
            self.timeout,
            "book store",
            self.repository.books.delete_if_idle(book_id),
        )
        .await?;

        tracing::info!("Book {} deleted", book_id);
        Ok(())
    }

    /// Delete a member holding no books, then drop their pending requests
    pub async fn delete_member(&self, identity: &Identity, member_id: Uuid) -> AppResult<()> {
        identity.require_admin()?;

        bounded(
            self.timeout,
            "member store",
            self.repository.members.delete_if_idle(member_id),
        )
        .await?;

        let pending = bounded(
            self.timeout,
            "book store",
            self.repository.books.requested(Some(member_id)),
        )
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Could not list requests of deleted member {}: {}", member_id, e);
            Vec::new()
        });

        for book in pending {
            if let Err(e) = bounded(
                self.timeout,
                "book store",
                self.repository.books.remove_request(book.id, member_id),
            )
            .await
            {
                tracing::warn!(
                    "Could not drop request of deleted member {} for book {}: {}",
                    member_id,
                    book.id,
                    e
                );
            }
        }

        tracing::info!("Member {} deleted", member_id);
        Ok(())
    }

    /// Ledger listing for admins, oldest first
    pub async fn activity_log(
        &self,
        identity: &Identity,
        query: &ActivityQuery,
    ) -> AppResult<Vec<ActivityRecord>> {
        identity.require_admin()?;
        bounded(
            self.timeout,
            "activity ledger",
            self.repository.activities.list(query),
        )
        .await
    }
}
