//! Activity ledger for database operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::AppResult,
    models::{ActivityAction, ActivityQuery, ActivityRecord},
    repository::ActivityLedger,
};

#[derive(Clone)]
pub struct PgActivityLedger {
    pool: Pool<Postgres>,
}

impl PgActivityLedger {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ActivityLedger for PgActivityLedger {
    async fn record(
        &self,
        member_id: Uuid,
        book_id: Uuid,
        action: ActivityAction,
        at: DateTime<Utc>,
    ) -> AppResult<ActivityRecord> {
        let record = sqlx::query_as::<_, ActivityRecord>(
            r#"
            INSERT INTO activities (id, member_id, book_id, action, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, member_id, book_id, action, created_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(member_id)
        .bind(book_id)
        .bind(action)
        .bind(at)
        .fetch_one(&self.pool)
        .await?;

        Ok(record)
    }

    async fn list(&self, query: &ActivityQuery) -> AppResult<Vec<ActivityRecord>> {
        let records = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT id, member_id, book_id, action, created_at
            FROM activities
            WHERE ($1::uuid IS NULL OR member_id = $1)
              AND ($2::uuid IS NULL OR book_id = $2)
            ORDER BY created_at, id
            "#,
        )
        .bind(query.member_id)
        .bind(query.book_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn last_for(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Option<ActivityRecord>> {
        let record = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT id, member_id, book_id, action, created_at
            FROM activities
            WHERE member_id = $1 AND book_id = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(member_id)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
