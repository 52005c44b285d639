//! Member administration, newsletter preferences and wishlists

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::bounded;
use crate::{
    clock::Clock,
    error::{AppError, AppResult},
    models::{Book, Identity, Member, MemberFilter, MemberShort, Role},
    repository::Repository,
};

#[derive(Clone)]
pub struct MembersService {
    repository: Repository,
    clock: Arc<dyn Clock>,
    timeout: Duration,
}

impl MembersService {
    pub fn new(repository: Repository, clock: Arc<dyn Clock>, timeout: Duration) -> Self {
        Self {
            repository,
            clock,
            timeout,
        }
    }

    /// Get member by ID; members only see themselves
    pub async fn get(&self, identity: &Identity, member_id: Uuid) -> AppResult<Member> {
        identity.require_self_or_admin(member_id)?;
        bounded(self.timeout, "member store", self.repository.members.get(member_id))
            .await?
            .ok_or(AppError::MemberNotFound(member_id))
    }

    /// Non-admin members, for the admin view
    pub async fn list(&self, identity: &Identity) -> AppResult<Vec<MemberShort>> {
        identity.require_admin()?;
        let filter = MemberFilter {
            role: Some(Role::Member),
            ..Default::default()
        };
        let members = bounded(
            self.timeout,
            "member store",
            self.repository.members.list(&filter),
        )
        .await?;
        Ok(members.into_iter().map(MemberShort::from).collect())
    }

    /// Members receiving the newsletter
    pub async fn subscribers(&self, identity: &Identity) -> AppResult<Vec<MemberShort>> {
        identity.require_admin()?;
        let filter = MemberFilter {
            role: Some(Role::Member),
            newsletter: Some(true),
            ..Default::default()
        };
        let members = bounded(
            self.timeout,
            "member store",
            self.repository.members.list(&filter),
        )
        .await?;
        Ok(members.into_iter().map(MemberShort::from).collect())
    }

    pub async fn block(&self, identity: &Identity, member_id: Uuid) -> AppResult<Member> {
        self.set_blocked(identity, member_id, true).await
    }

    pub async fn unblock(&self, identity: &Identity, member_id: Uuid) -> AppResult<Member> {
        self.set_blocked(identity, member_id, false).await
    }

    async fn set_blocked(
        &self,
        identity: &Identity,
        member_id: Uuid,
        blocked: bool,
    ) -> AppResult<Member> {
        identity.require_admin()?;
        let member = bounded(
            self.timeout,
            "member store",
            self.repository.members.set_blocked(member_id, blocked),
        )
        .await?;

        tracing::info!(
            "Member {} {}",
            member_id,
            if blocked { "blocked" } else { "unblocked" }
        );
        Ok(member)
    }

    pub async fn subscribe_newsletter(&self, identity: &Identity) -> AppResult<Member> {
        bounded(
            self.timeout,
            "member store",
            self.repository.members.set_newsletter(identity.member_id, true),
        )
        .await
    }

    pub async fn unsubscribe_newsletter(&self, identity: &Identity) -> AppResult<Member> {
        bounded(
            self.timeout,
            "member store",
            self.repository.members.set_newsletter(identity.member_id, false),
        )
        .await
    }

    /// Move the end of the member's plan; called by the payment flow once a
    /// plan is paid for, never by the member directly
    pub async fn extend_subscription(
        &self,
        identity: &Identity,
        member_id: Uuid,
        until: DateTime<Utc>,
    ) -> AppResult<Member> {
        identity.require_admin()?;
        if until <= self.clock.now() {
            return Err(AppError::Validation(
                "Subscription end must be in the future".to_string(),
            ));
        }

        let member = bounded(
            self.timeout,
            "member store",
            self.repository.members.set_subscription_end(member_id, until),
        )
        .await?;

        tracing::info!("Subscription of member {} runs until {}", member_id, until);
        Ok(member)
    }

    pub async fn add_to_wishlist(&self, identity: &Identity, book_id: Uuid) -> AppResult<Member> {
        bounded(self.timeout, "book store", self.repository.books.get(book_id))
            .await?
            .ok_or(AppError::BookNotFound(book_id))?;

        bounded(
            self.timeout,
            "member store",
            self.repository.members.add_to_wishlist(identity.member_id, book_id),
        )
        .await
    }

    pub async fn remove_from_wishlist(
        &self,
        identity: &Identity,
        book_id: Uuid,
    ) -> AppResult<Member> {
        bounded(
            self.timeout,
            "member store",
            self.repository.members.remove_from_wishlist(identity.member_id, book_id),
        )
        .await
    }

    /// Wishlisted books that still exist, in wishlist order
    pub async fn wishlist(&self, identity: &Identity) -> AppResult<Vec<Book>> {
        let member = self.get(identity, identity.member_id).await?;

        let mut books = Vec::with_capacity(member.wishlist.len());
        for book_id in member.wishlist {
            if let Some(book) =
                bounded(self.timeout, "book store", self.repository.books.get(book_id)).await?
            {
                books.push(book);
            }
        }
        Ok(books)
    }
}
