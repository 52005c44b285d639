//! Catalog management service

use std::time::Duration;

use uuid::Uuid;
use validator::Validate;

use super::bounded;
use crate::{
    error::{AppError, AppResult},
    models::{Book, BookFilter, Comment, CreateBook, Identity},
    repository::Repository,
};

#[derive(Clone)]
pub struct CatalogService {
    repository: Repository,
    timeout: Duration,
}

impl CatalogService {
    pub fn new(repository: Repository, timeout: Duration) -> Self {
        Self {
            repository,
            timeout,
        }
    }

    /// Add a new title with its initial stock
    pub async fn add_book(&self, identity: &Identity, input: CreateBook) -> AppResult<Book> {
        identity.require_admin()?;
        input.validate()?;

        let book = bounded(self.timeout, "book store", self.repository.books.create(&input)).await?;
        tracing::info!(
            "Catalog: added \"{}\" ({}) with {} copies",
            book.title,
            book.id,
            book.stock
        );
        Ok(book)
    }

    /// Get book by ID
    pub async fn get_book(&self, id: Uuid) -> AppResult<Book> {
        bounded(self.timeout, "book store", self.repository.books.get(id))
            .await?
            .ok_or(AppError::BookNotFound(id))
    }

    /// Browse books with filters
    pub async fn list_books(&self, filter: &BookFilter) -> AppResult<Vec<Book>> {
        bounded(self.timeout, "book store", self.repository.books.list(filter)).await
    }

    /// Books sharing a genre with the given one, itself excluded
    pub async fn related_books(&self, id: Uuid) -> AppResult<Vec<Book>> {
        let book = self.get_book(id).await?;
        let filter = BookFilter::by_genres(book.genres);
        let related = bounded(
            self.timeout,
            "book store",
            self.repository.books.list(&filter),
        )
        .await?;
        Ok(related.into_iter().filter(|b| b.id != id).collect())
    }

    /// Admins see every pending request, members only their own
    pub async fn requested_books(&self, identity: &Identity) -> AppResult<Vec<Book>> {
        let scope = if identity.is_admin() {
            None
        } else {
            Some(identity.member_id)
        };
        bounded(self.timeout, "book store", self.repository.books.requested(scope)).await
    }

    /// Books a member currently holds
    pub async fn issued_books_for(
        &self,
        identity: &Identity,
        member_id: Uuid,
    ) -> AppResult<Vec<Book>> {
        identity.require_self_or_admin(member_id)?;
        bounded(
            self.timeout,
            "book store",
            self.repository.books.issued_to_member(member_id),
        )
        .await
    }

    /// The book if at least one copy is out, for the return desk
    pub async fn issued_copies(&self, identity: &Identity, id: Uuid) -> AppResult<Book> {
        identity.require_admin()?;
        let book = self.get_book(id).await?;
        if book.issued_to.is_empty() {
            return Err(AppError::Validation(format!("No copy of book {} is issued", id)));
        }
        Ok(book)
    }

    /// The book if a copy is on the shelf, for the issue desk
    pub async fn issuable_copy(&self, identity: &Identity, id: Uuid) -> AppResult<Book> {
        identity.require_admin()?;
        let book = self.get_book(id).await?;
        if book.stock <= 0 {
            return Err(AppError::OutOfStock(id));
        }
        Ok(book)
    }

    /// Comments on a book, oldest first
    pub async fn comments(&self, id: Uuid) -> AppResult<Vec<Comment>> {
        self.get_book(id).await?;
        bounded(self.timeout, "comment store", self.repository.comments.for_book(id)).await
    }
}
