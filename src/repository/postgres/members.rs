//! Members repository for database operations

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Postgres};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{member::MAX_ISSUED_BOOKS, Member, MemberFilter, NewMember},
    repository::MemberStore,
};

#[derive(Clone)]
pub struct PgMemberStore {
    pool: Pool<Postgres>,
}

impl PgMemberStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    async fn require(&self, id: Uuid) -> AppResult<Member> {
        self.get(id).await?.ok_or(AppError::MemberNotFound(id))
    }

    /// Run an `UPDATE ... RETURNING *` keyed on the member id
    async fn update_flag<T>(&self, sql: &str, member_id: Uuid, value: T) -> AppResult<Member>
    where
        T: for<'q> sqlx::Encode<'q, Postgres> + sqlx::Type<Postgres> + Send + 'static,
    {
        sqlx::query_as::<_, Member>(sql)
            .bind(member_id)
            .bind(value)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(AppError::MemberNotFound(member_id))
    }
}

#[async_trait]
impl MemberStore for PgMemberStore {
    async fn create(&self, input: NewMember) -> AppResult<Member> {
        sqlx::query_as::<_, Member>(
            r#"
            INSERT INTO members (id, name, email, password, role, newsletter, subscription_end)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.name)
        .bind(&input.email)
        .bind(&input.password_hash)
        .bind(input.role)
        .bind(input.newsletter)
        .bind(input.subscription_end)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => {
                AppError::Duplicate(format!("Email {} already registered", input.email))
            }
            other => AppError::Database(other),
        })
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Member>> {
        let member = sqlx::query_as::<_, Member>("SELECT * FROM members WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(member)
    }

    async fn get_by_email(&self, email: &str) -> AppResult<Option<Member>> {
        let member =
            sqlx::query_as::<_, Member>("SELECT * FROM members WHERE LOWER(email) = LOWER($1)")
                .bind(email)
                .fetch_optional(&self.pool)
                .await?;
        Ok(member)
    }

    async fn list(&self, filter: &MemberFilter) -> AppResult<Vec<Member>> {
        let members = sqlx::query_as::<_, Member>(
            r#"
            SELECT * FROM members
            WHERE ($1::text IS NULL OR role = $1)
              AND ($2::bool IS NULL OR newsletter = $2)
              AND ($3::timestamptz IS NULL OR subscription_end < $3)
            ORDER BY name, id
            "#,
        )
        .bind(filter.role.map(|r| r.as_str()))
        .bind(filter.newsletter)
        .bind(filter.subscription_ended_before)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    async fn attach_issued(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        let updated = sqlx::query_as::<_, Member>(
            r#"
            UPDATE members
            SET issued_books = array_append(issued_books, $2),
                read_history = CASE WHEN $2 = ANY(read_history) THEN read_history
                                    ELSE array_append(read_history, $2) END,
                updated_at = NOW()
            WHERE id = $1
              AND cardinality(issued_books) < $3
              AND NOT ($2 = ANY(issued_books))
            RETURNING *
            "#,
        )
        .bind(member_id)
        .bind(book_id)
        .bind(MAX_ISSUED_BOOKS as i32)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(member) = updated {
            return Ok(member);
        }

        let member = self.require(member_id).await?;
        Err(if member.holds(book_id) {
            AppError::AlreadyIssuedToMember { book_id, member_id }
        } else if member.at_issue_limit() {
            AppError::IssueLimitReached {
                member_id,
                limit: MAX_ISSUED_BOOKS,
            }
        } else {
            AppError::Conflict(format!("Issued books of member {} changed concurrently", member_id))
        })
    }

    async fn detach_issued(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        let updated = sqlx::query_as::<_, Member>(
            r#"
            UPDATE members
            SET issued_books = array_remove(issued_books, $2), updated_at = NOW()
            WHERE id = $1 AND $2 = ANY(issued_books)
            RETURNING *
            "#,
        )
        .bind(member_id)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(member) => Ok(member),
            None => {
                self.require(member_id).await?;
                Err(AppError::NotIssuedToMember { book_id, member_id })
            }
        }
    }

    async fn forget_read(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        self.update_flag(
            r#"
            UPDATE members
            SET read_history = array_remove(read_history, $2), updated_at = NOW()
            WHERE id = $1
            RETURNING *
            "#,
            member_id,
            book_id,
        )
        .await
    }

    async fn set_blocked(&self, member_id: Uuid, blocked: bool) -> AppResult<Member> {
        self.update_flag(
            "UPDATE members SET blocked = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
            member_id,
            blocked,
        )
        .await
    }

    async fn set_newsletter(&self, member_id: Uuid, newsletter: bool) -> AppResult<Member> {
        self.update_flag(
            "UPDATE members SET newsletter = $2, updated_at = NOW() WHERE id = $1 RETURNING *",
            member_id,
            newsletter,
        )
        .await
    }

    async fn set_subscription_end(
        &self,
        member_id: Uuid,
        until: DateTime<Utc>,
    ) -> AppResult<Member> {
        self.update_flag(
            r#"
            UPDATE members SET subscription_end = $2, updated_at = NOW()
            WHERE id = $1 RETURNING *
            "#,
            member_id,
            until,
        )
        .await
    }

    async fn set_password(&self, email: &str, password_hash: &str) -> AppResult<()> {
        let updated = sqlx::query(
            "UPDATE members SET password = $2, updated_at = NOW() WHERE LOWER(email) = LOWER($1)",
        )
        .bind(email)
        .bind(password_hash)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(AppError::Validation(format!("No member with email {}", email)));
        }
        Ok(())
    }

    async fn add_to_wishlist(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        let updated = sqlx::query_as::<_, Member>(
            r#"
            UPDATE members
            SET wishlist = array_append(wishlist, $2), updated_at = NOW()
            WHERE id = $1 AND NOT ($2 = ANY(wishlist))
            RETURNING *
            "#,
        )
        .bind(member_id)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(member) => Ok(member),
            None => {
                self.require(member_id).await?;
                Err(AppError::AlreadyInWishlist(book_id))
            }
        }
    }

    async fn remove_from_wishlist(&self, member_id: Uuid, book_id: Uuid) -> AppResult<Member> {
        let updated = sqlx::query_as::<_, Member>(
            r#"
            UPDATE members
            SET wishlist = array_remove(wishlist, $2), updated_at = NOW()
            WHERE id = $1 AND $2 = ANY(wishlist)
            RETURNING *
            "#,
        )
        .bind(member_id)
        .bind(book_id)
        .fetch_optional(&self.pool)
        .await?;

        match updated {
            Some(member) => Ok(member),
            None => {
                self.require(member_id).await?;
                Err(AppError::NotInWishlist(book_id))
            }
        }
    }

    async fn delete_if_idle(&self, member_id: Uuid) -> AppResult<()> {
        let deleted =
            sqlx::query("DELETE FROM members WHERE id = $1 AND cardinality(issued_books) = 0")
                .bind(member_id)
                .execute(&self.pool)
                .await?
                .rows_affected();

        if deleted == 0 {
            self.require(member_id).await?;
            return Err(AppError::MemberHasIssuedBooks(member_id));
        }
        Ok(())
    }
}
