//! Repairs drift between book copies and member holdings
//!
//! A copy bound on the book side must be listed on the member side and the
//! other way round. A pair seen on only one side is either finished or
//! unwound, using the activity ledger to tell an issue that got halfway from
//! one that was being rolled back.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::Duration as ChronoDuration;
use serde::Serialize;
use uuid::Uuid;

use super::bounded;
use crate::{
    clock::Clock,
    error::AppResult,
    models::{book::LOAN_PERIOD_DAYS, ActivityAction, BookFilter, Member, MemberFilter},
    repository::Repository,
};

/// Pairs younger than this may belong to a transition still in flight
const SETTLE_SECS: i64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Drift {
    /// Copy bound on the book, missing from the member
    BookOnly,
    /// Book listed by the member, no copy bound on the book
    MemberOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", content = "reason", rename_all = "snake_case")]
pub enum RepairAction {
    CompletedOnMember,
    RolledBackOnBook,
    RemovedFromMember,
    /// Too recent to touch, looked at again next run
    Deferred,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Repair {
    pub book_id: Uuid,
    pub member_id: Uuid,
    pub drift: Drift,
    pub action: RepairAction,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub books_checked: usize,
    pub members_checked: usize,
    pub repairs: Vec<Repair>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.repairs.is_empty()
    }
}

#[derive(Clone)]
pub struct Reconciler {
    repository: Repository,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl Reconciler {
    pub fn new(repository: Repository, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            repository,
            clock,
            timeout,
        }
    }

    /// Compare both sides and repair every pair found on only one of them
    pub async fn run(&self) -> AppResult<ReconcileReport> {
        let now = self.clock.now();
        let settled_before = now - ChronoDuration::seconds(SETTLE_SECS);

        let books = bounded(
            self.timeout,
            "book store",
            self.repository.books.list(&BookFilter::default()),
        )
        .await?;
        let members = bounded(
            self.timeout,
            "member store",
            self.repository.members.list(&MemberFilter::default()),
        )
        .await?;

        let mut report = ReconcileReport {
            books_checked: books.len(),
            members_checked: members.len(),
            repairs: Vec::new(),
        };

        // (book, member) -> issued at
        let book_side: HashMap<(Uuid, Uuid), _> = books
            .iter()
            .flat_map(|b| {
                b.issued_to.iter().map(move |e| {
                    (
                        (b.id, e.member_id),
                        e.due_date - ChronoDuration::days(LOAN_PERIOD_DAYS),
                    )
                })
            })
            .collect();
        let member_side: BTreeSet<(Uuid, Uuid)> = members
            .iter()
            .flat_map(|m| m.issued_books.iter().map(move |b| (*b, m.id)))
            .collect();
        let members: HashMap<Uuid, Member> = members.into_iter().map(|m| (m.id, m)).collect();

        let mut book_only: Vec<_> = book_side
            .iter()
            .filter(|(pair, _)| !member_side.contains(*pair))
            .collect();
        book_only.sort_by_key(|(pair, _)| **pair);

        for (&(book_id, member_id), &issued_at) in book_only {
            let action = if issued_at > settled_before {
                RepairAction::Deferred
            } else {
                self.repair_book_only(book_id, member_id, members.get(&member_id))
                    .await
            };
            report.repairs.push(Repair {
                book_id,
                member_id,
                drift: Drift::BookOnly,
                action,
            });
        }

        // A return or rollback in flight has just released the copy on the
        // book; edits to the member alone say nothing about the pair.
        let book_changed: HashMap<Uuid, _> = books.iter().map(|b| (b.id, b.updated_at)).collect();
        for &(book_id, member_id) in member_side.iter().filter(|p| !book_side.contains_key(*p)) {
            let recently_touched = book_changed
                .get(&book_id)
                .map(|at| *at > settled_before)
                .unwrap_or(false);
            let action = if recently_touched {
                RepairAction::Deferred
            } else {
                self.repair_member_only(book_id, member_id).await
            };
            report.repairs.push(Repair {
                book_id,
                member_id,
                drift: Drift::MemberOnly,
                action,
            });
        }

        if report.is_clean() {
            tracing::debug!(
                "Reconciliation clean: {} books, {} members",
                report.books_checked,
                report.members_checked
            );
        } else {
            tracing::warn!("Reconciliation found {} drifted pairs", report.repairs.len());
        }
        Ok(report)
    }

    async fn repair_book_only(
        &self,
        book_id: Uuid,
        member_id: Uuid,
        member: Option<&Member>,
    ) -> RepairAction {
        let Some(member) = member else {
            return self.roll_back_on_book(book_id, member_id, "member no longer exists").await;
        };

        let last = match bounded(
            self.timeout,
            "activity ledger",
            self.repository.activities.last_for(member_id, book_id),
        )
        .await
        {
            Ok(last) => last,
            Err(e) => return RepairAction::Failed(e.to_string()),
        };

        let issue_was_recorded = last.map(|r| r.action == ActivityAction::Issue).unwrap_or(false);
        if issue_was_recorded && !member.at_issue_limit() {
            return match bounded(
                self.timeout,
                "member store",
                self.repository.members.attach_issued(member_id, book_id),
            )
            .await
            {
                Ok(_) => {
                    tracing::info!(
                        "Reconcile: attached book {} to member {}",
                        book_id,
                        member_id
                    );
                    RepairAction::CompletedOnMember
                }
                Err(e) => RepairAction::Failed(e.to_string()),
            };
        }

        let why = if issue_was_recorded {
            "member at issue limit"
        } else {
            "issue was never recorded"
        };
        self.roll_back_on_book(book_id, member_id, why).await
    }

    async fn roll_back_on_book(&self, book_id: Uuid, member_id: Uuid, why: &str) -> RepairAction {
        match bounded(
            self.timeout,
            "book store",
            self.repository.books.checkin(book_id, member_id),
        )
        .await
        {
            Ok(_) => {
                tracing::info!(
                    "Reconcile: took back book {} from member {} ({})",
                    book_id,
                    member_id,
                    why
                );
                RepairAction::RolledBackOnBook
            }
            Err(e) => RepairAction::Failed(e.to_string()),
        }
    }

    async fn repair_member_only(&self, book_id: Uuid, member_id: Uuid) -> RepairAction {
        match bounded(
            self.timeout,
            "member store",
            self.repository.members.detach_issued(member_id, book_id),
        )
        .await
        {
            Ok(_) => {
                tracing::info!(
                    "Reconcile: removed book {} from member {}",
                    book_id,
                    member_id
                );
                RepairAction::RemovedFromMember
            }
            Err(e) => RepairAction::Failed(e.to_string()),
        }
    }
}
