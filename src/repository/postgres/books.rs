//! Books repository for database operations
//!
//! The issued copies live in `book_issues`; a book row plus its issue rows
//! form one aggregate. Mutations that touch both run in a transaction that
//! takes the book row lock first.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, Pool, Postgres, Transaction};
use uuid::Uuid;

use crate::{
    error::{AppError, AppResult},
    models::{Book, BookFilter, CreateBook, IssueEntry, OverdueBook, StockAdjustment},
    models::book::SearchField,
    repository::BookStore,
};

#[derive(Debug, FromRow)]
struct BookRow {
    id: Uuid,
    title: String,
    author: String,
    genres: Vec<String>,
    rating: f64,
    rating_count: i32,
    stock: i32,
    requested_by: Vec<Uuid>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl BookRow {
    fn into_book(self, issued_to: Vec<IssueEntry>) -> Book {
        Book {
            id: self.id,
            title: self.title,
            author: self.author,
            genres: self.genres,
            rating: self.rating,
            rating_count: self.rating_count,
            stock: self.stock,
            issued_to,
            requested_by: self.requested_by,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, FromRow)]
struct IssueRow {
    book_id: Uuid,
    member_id: Uuid,
    due_date: DateTime<Utc>,
}

#[derive(Debug, FromRow)]
struct OverdueRow {
    book_id: Uuid,
    title: String,
    member_id: Uuid,
    due_date: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PgBookStore {
    pool: Pool<Postgres>,
}

impl PgBookStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Attach issue rows to book rows
    async fn hydrate(&self, rows: Vec<BookRow>) -> AppResult<Vec<Book>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<Uuid> = rows.iter().map(|r| r.id).collect();

        let issues = sqlx::query_as::<_, IssueRow>(
            r#"
            SELECT book_id, member_id, due_date
            FROM book_issues
            WHERE book_id = ANY($1)
            ORDER BY issued_at, member_id
            "#,
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        let mut by_book: HashMap<Uuid, Vec<IssueEntry>> = HashMap::new();
        for issue in issues {
            by_book.entry(issue.book_id).or_default().push(IssueEntry {
                member_id: issue.member_id,
                due_date: issue.due_date,
            });
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let issued = by_book.remove(&row.id).unwrap_or_default();
                row.into_book(issued)
            })
            .collect())
    }

    async fn require(&self, id: Uuid) -> AppResult<Book> {
        self.get(id).await?.ok_or(AppError::BookNotFound(id))
    }
}

/// Take the book row lock; every writer of `book_issues` holds it too,
/// so reads of the issue rows after this are current.
async fn lock_book(tx: &mut Transaction<'_, Postgres>, book_id: Uuid) -> AppResult<()> {
    let locked: Option<Uuid> = sqlx::query_scalar("SELECT id FROM books WHERE id = $1 FOR UPDATE")
        .bind(book_id)
        .fetch_optional(&mut **tx)
        .await?;
    locked.map(|_| ()).ok_or(AppError::BookNotFound(book_id))
}

async fn issue_count(tx: &mut Transaction<'_, Postgres>, book_id: Uuid) -> AppResult<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM book_issues WHERE book_id = $1")
        .bind(book_id)
        .fetch_one(&mut **tx)
        .await?;
    Ok(count)
}

#[async_trait]
impl BookStore for PgBookStore {
    async fn create(&self, input: &CreateBook) -> AppResult<Book> {
        let row = sqlx::query_as::<_, BookRow>(
            r#"
            INSERT INTO books (id, title, author, genres, rating, rating_count, stock)
            VALUES ($1, $2, $3, $4, $5, 0, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&input.title)
        .bind(&input.author)
        .bind(&input.genres)
        .bind(input.rating)
        .bind(input.stock)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_book(Vec::new()))
    }

    async fn get(&self, id: Uuid) -> AppResult<Option<Book>> {
        let row = sqlx::query_as::<_, BookRow>("SELECT * FROM books WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(self.hydrate(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    async fn list(&self, filter: &BookFilter) -> AppResult<Vec<Book>> {
        let pattern = filter
            .search
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));
        let (title, author) = match filter.search_by {
            SearchField::Title => (pattern, None),
            SearchField::Author => (None, pattern),
        };
        let genres: Vec<String> = filter.genres.iter().map(|g| g.to_lowercase()).collect();

        let rows = sqlx::query_as::<_, BookRow>(
            r#"
            SELECT * FROM books
            WHERE ($1::text IS NULL OR title ILIKE $1)
              AND ($2::text IS NULL OR author ILIKE $2)
              AND (cardinality($3::text[]) = 0
                   OR EXISTS (SELECT 1 FROM unnest(genres) g WHERE LOWER(g) = ANY($3)))
            ORDER BY title, id
            "#,
        )
        .bind(title)
        .bind(author)
        .bind(&genres)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn requested(&self, member_id: Option<Uuid>) -> AppResult<Vec<Book>> {
        let rows = sqlx::query_as::<_, BookRow>(
            r#"
            SELECT * FROM books
            WHERE CASE WHEN $1::uuid IS NULL THEN cardinality(requested_by) > 0
                       ELSE $1 = ANY(requested_by) END
            ORDER BY title, id
            "#,
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn issued_to_member(&self, member_id: Uuid) -> AppResult<Vec<Book>> {
        let rows = sqlx::query_as::<_, BookRow>(
            r#"
            SELECT * FROM books
            WHERE id IN (SELECT book_id FROM book_issues WHERE member_id = $1)
            ORDER BY title, id
            "#,
        )
        .bind(member_id)
        .fetch_all(&self.pool)
        .await?;

        self.hydrate(rows).await
    }

    async fn add_request(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;
        lock_book(&mut tx, book_id).await?;

        let (requested, issued): (bool, bool) = sqlx::query_as(
            r#"
            SELECT $2 = ANY(requested_by),
                   EXISTS (SELECT 1 FROM book_issues WHERE book_id = $1 AND member_id = $2)
            FROM books WHERE id = $1
            "#,
        )
        .bind(book_id)
        .bind(member_id)
        .fetch_one(&mut *tx)
        .await?;

        if requested {
            tx.rollback().await?;
            return Err(AppError::AlreadyRequested { book_id, member_id });
        }
        if issued {
            tx.rollback().await?;
            return Err(AppError::AlreadyIssuedToMember { book_id, member_id });
        }

        sqlx::query(
            r#"
            UPDATE books
            SET requested_by = array_append(requested_by, $2), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(book_id)
        .bind(member_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        self.require(book_id).await
    }

    async fn remove_request(&self, book_id: Uuid, member_id: Uuid) -> AppResult<Book> {
        let updated = sqlx::query(
            r#"
            UPDATE books
            SET requested_by = array_remove(requested_by, $2), updated_at = NOW()
            WHERE id = $1 AND $2 = ANY(requested_by)
            "#,
        )
        .bind(book_id)
        .bind(member_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let book = self.require(book_id).await?;
        if updated == 0 {
            return Err(AppError::NotRequested { book_id, member_id });
        }
        Ok(book)
    }

    async fn checkout(&self, book_id: Uuid, entry: IssueEntry) -> AppResult<Book> {
        let mut tx = self.pool.begin().await?;

        // Conditional decrement; a concurrent checkout waits on the row lock
        // and re-checks the stock once it gets it.
        let updated = sqlx::query(
            r#"
            UPDATE books
            SET stock = stock - 1,
                requested_by = array_remove(requested_by, $2),
                updated_at = NOW()
            WHERE id = $1 AND stock > 0
            "#,
        )
        .bind(book_id)
        .bind(entry.member_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            tx.rollback().await?;
            return match self.get(book_id).await? {
                Some(_) => Err(AppError::OutOfStock(book_id)),
                None => Err(AppError::BookNotFound(book_id)),
            };
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO book_issues (book_id, member_id, due_date, issued_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (book_id, member_id) DO NOTHING
            "#,
        )
        .bind(book_id)
        .bind(entry.member_id)
        .bind(entry.due_date)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            return Err(AppError::AlreadyIssuedToMember {
                book_id,
                member_id: entry.member_id,
            });
        }

        tx.commit().await?;
        self.require(book_id).await
    }

    async fn checkin(&self, book_id: Uuid, member_id: Uuid) -> AppResult<(Book, IssueEntry)> {
        let mut tx = self.pool.begin().await?;
        lock_book(&mut tx, book_id).await?;

        let due_date: Option<DateTime<Utc>> = sqlx::query_scalar(
            "DELETE FROM book_issues WHERE book_id = $1 AND member_id = $2 RETURNING due_date",
        )
        .bind(book_id)
        .bind(member_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(due_date) = due_date else {
            tx.rollback().await?;
            return Err(AppError::NotIssuedToMember { book_id, member_id });
        };

        sqlx::query("UPDATE books SET stock = stock + 1, updated_at = NOW() WHERE id = $1")
            .bind(book_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        let book = self.require(book_id).await?;
        Ok((book, IssueEntry { member_id, due_date }))
    }

    async fn adjust_stock(&self, book_id: Uuid, adjustment: StockAdjustment) -> AppResult<Book> {
        adjustment.validate()?;
        let mut tx = self.pool.begin().await?;
        lock_book(&mut tx, book_id).await?;

        let stock: i32 = sqlx::query_scalar("SELECT stock FROM books WHERE id = $1")
            .bind(book_id)
            .fetch_one(&mut *tx)
            .await?;
        let issued = issue_count(&mut tx, book_id).await?;

        if let StockAdjustment::Subtract(amount) = adjustment {
            // Copies out stay on the books; only the rest may be written off
            let removable = i32::try_from(i64::from(stock) - issued).unwrap_or(0).max(0);
            if amount > removable {
                tx.rollback().await?;
                return Err(AppError::InsufficientAvailableStock {
                    book_id,
                    requested: amount,
                    available: removable,
                });
            }
        }
        let next = match adjustment.apply(stock) {
            Ok(next) => next,
            Err(e) => {
                tx.rollback().await?;
                return Err(e);
            }
        };

        sqlx::query("UPDATE books SET stock = $2, updated_at = NOW() WHERE id = $1")
            .bind(book_id)
            .bind(next)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.require(book_id).await
    }

    async fn apply_rating(&self, book_id: Uuid, rating: f64) -> AppResult<Book> {
        let updated = sqlx::query(
            r#"
            UPDATE books
            SET rating = (rating + $2) / 2, rating_count = rating_count + 1, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(book_id)
        .bind(rating)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(AppError::BookNotFound(book_id));
        }
        self.require(book_id).await
    }

    async fn delete_if_idle(&self, book_id: Uuid) -> AppResult<()> {
        let mut tx = self.pool.begin().await?;
        lock_book(&mut tx, book_id).await?;

        if issue_count(&mut tx, book_id).await? > 0 {
            tx.rollback().await?;
            return Err(AppError::BooksInCirculation(book_id));
        }

        sqlx::query("DELETE FROM books WHERE id = $1")
            .bind(book_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn overdue(&self, now: DateTime<Utc>) -> AppResult<Vec<OverdueBook>> {
        let rows = sqlx::query_as::<_, OverdueRow>(
            r#"
            SELECT b.id AS book_id, b.title, i.member_id, i.due_date
            FROM book_issues i
            JOIN books b ON b.id = i.book_id
            WHERE i.due_date < $1
            ORDER BY b.title, b.id, i.issued_at
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut out: Vec<OverdueBook> = Vec::new();
        for row in rows {
            let entry = IssueEntry {
                member_id: row.member_id,
                due_date: row.due_date,
            };
            match out.last_mut() {
                Some(last) if last.book_id == row.book_id => last.overdue.push(entry),
                _ => out.push(OverdueBook {
                    book_id: row.book_id,
                    title: row.title,
                    overdue: vec![entry],
                }),
            }
        }
        Ok(out)
    }
}
