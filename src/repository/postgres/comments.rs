//! Comments repository for database operations

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::Comment,
    repository::CommentStore,
};

#[derive(Clone)]
pub struct PgCommentStore {
    pool: Pool<Postgres>,
}

impl PgCommentStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommentStore for PgCommentStore {
    async fn add(&self, comment: Comment) -> AppResult<Comment> {
        let stored = sqlx::query_as::<_, Comment>(
            r#"
            INSERT INTO comments (id, member_id, member_name, book_id, comment, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(comment.id)
        .bind(comment.member_id)
        .bind(&comment.member_name)
        .bind(comment.book_id)
        .bind(&comment.comment)
        .bind(comment.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_foreign_key_violation() => {
                AppError::BookNotFound(comment.book_id)
            }
            other => AppError::Database(other),
        })?;

        Ok(stored)
    }

    async fn for_book(&self, book_id: Uuid) -> AppResult<Vec<Comment>> {
        let comments = sqlx::query_as::<_, Comment>(
            "SELECT * FROM comments WHERE book_id = $1 ORDER BY created_at, id",
        )
        .bind(book_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(comments)
    }

    async fn delete(&self, id: Uuid) -> AppResult<()> {
        sqlx::query("DELETE FROM comments WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
