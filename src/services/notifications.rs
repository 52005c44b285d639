//! Reminder, newsletter and contact mail
//!
//! A failed delivery never undoes anything: it is logged and reported back
//! as [`Delivery::Failed`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{bounded, email::Notifier};
use crate::{
    clock::Clock,
    error::{AppError, AppResult},
    models::{Identity, MemberFilter, Role},
    repository::Repository,
};

const DUE_SUBJECT: &str = "Return Book";
const DUE_BODY: &str = "This is to remind you that you have a book due from the library.";
const PLAN_SUBJECT: &str = "Subscription Ended";
const PLAN_BODY: &str = "This is to remind you that you have no active plans in our library.";

/// What happened to an outgoing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Delivery {
    Sent { recipients: usize },
    /// Nobody to write to
    Skipped,
    Failed { reason: String },
}

/// Who receives a newsletter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Audience {
    /// Every non-admin member
    All,
    #[default]
    Subscribers,
}

#[derive(Clone)]
pub struct NotificationService {
    repository: Repository,
    notifier: Arc<dyn Notifier>,
    clock: Arc<dyn Clock>,
    store_timeout: Duration,
    notify_timeout: Duration,
    library_address: String,
}

impl NotificationService {
    pub fn new(
        repository: Repository,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        store_timeout: Duration,
        notify_timeout: Duration,
        library_address: String,
    ) -> Self {
        Self {
            repository,
            notifier,
            clock,
            store_timeout,
            notify_timeout,
            library_address,
        }
    }

    /// Hand the message to the dispatcher; failures become [`Delivery::Failed`]
    pub async fn send(&self, recipients: Vec<String>, subject: &str, body: &str) -> Delivery {
        if recipients.is_empty() {
            return Delivery::Skipped;
        }

        match bounded(
            self.notify_timeout,
            "notification dispatcher",
            self.notifier.notify(&recipients, subject, body),
        )
        .await
        {
            Ok(()) => {
                tracing::info!("Sent \"{}\" to {} recipients", subject, recipients.len());
                Delivery::Sent {
                    recipients: recipients.len(),
                }
            }
            Err(e) => {
                tracing::warn!("Could not send \"{}\": {}", subject, e);
                Delivery::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Remind every member holding an overdue copy
    pub async fn send_due_reminders(&self) -> AppResult<Delivery> {
        let now = self.clock.now();
        let overdue = bounded(
            self.store_timeout,
            "book store",
            self.repository.books.overdue(now),
        )
        .await?;

        let mut member_ids: Vec<Uuid> = overdue
            .iter()
            .flat_map(|b| b.overdue.iter().map(|e| e.member_id))
            .collect();
        member_ids.sort();
        member_ids.dedup();

        if member_ids.is_empty() {
            tracing::info!("No members have books due");
            return Ok(Delivery::Skipped);
        }

        let mut recipients = Vec::with_capacity(member_ids.len());
        for member_id in member_ids {
            let member = bounded(
                self.store_timeout,
                "member store",
                self.repository.members.get(member_id),
            )
            .await;
            match member {
                Ok(Some(member)) => recipients.push(member.email),
                Ok(None) => tracing::warn!("Overdue copy held by unknown member {}", member_id),
                Err(e) => tracing::warn!("Could not look up member {}: {}", member_id, e),
            }
        }

        Ok(self.send(recipients, DUE_SUBJECT, DUE_BODY).await)
    }

    /// Remind members whose plan has ended
    pub async fn send_subscription_reminders(&self) -> AppResult<Delivery> {
        let filter = MemberFilter {
            role: Some(Role::Member),
            subscription_ended_before: Some(self.clock.now()),
            ..Default::default()
        };
        let members = bounded(
            self.store_timeout,
            "member store",
            self.repository.members.list(&filter),
        )
        .await?;
        let recipients: Vec<String> = members.into_iter().map(|m| m.email).collect();

        Ok(self.send(recipients, PLAN_SUBJECT, PLAN_BODY).await)
    }

    /// Admin newsletter; an empty audience is an error
    pub async fn newsletter(
        &self,
        identity: &Identity,
        subject: &str,
        body: &str,
        audience: Audience,
    ) -> AppResult<Delivery> {
        identity.require_admin()?;
        if subject.trim().is_empty() || body.trim().is_empty() {
            return Err(AppError::Validation("Subject and body are required".to_string()));
        }

        let filter = MemberFilter {
            role: Some(Role::Member),
            newsletter: match audience {
                Audience::All => None,
                Audience::Subscribers => Some(true),
            },
            ..Default::default()
        };
        let members = bounded(
            self.store_timeout,
            "member store",
            self.repository.members.list(&filter),
        )
        .await?;
        if members.is_empty() {
            return Err(AppError::NoRecipients("newsletter".to_string()));
        }

        let recipients = members.into_iter().map(|m| m.email).collect();
        Ok(self.send(recipients, subject, body).await)
    }

    /// Forward a member's message to the library
    pub async fn contact_librarian(
        &self,
        identity: &Identity,
        subject: &str,
        message: &str,
    ) -> AppResult<Delivery> {
        let member = bounded(
            self.store_timeout,
            "member store",
            self.repository.members.get(identity.member_id),
        )
        .await?
        .ok_or(AppError::MemberNotFound(identity.member_id))?;

        let body = format!("{}\n\nSent by {} <{}>", message, member.name, member.email);
        Ok(self
            .send(vec![self.library_address.clone()], subject, &body)
            .await)
    }
}
