//! Book (inventory record) model and related types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};

/// Number of days a copy stays with a member before it is due
pub const LOAN_PERIOD_DAYS: i64 = 15;

/// Due date for a copy issued at `issued_at`
pub fn due_date_from(issued_at: DateTime<Utc>) -> DateTime<Utc> {
    issued_at + Duration::days(LOAN_PERIOD_DAYS)
}

/// Blend a new rating into the current one.
///
/// This is a running halving blend, not a mean: the most recent rating always
/// weighs one half, so the result depends on the order ratings arrive in.
/// Ratings `[3, 5]` on a fresh book give `((0 + 3) / 2 + 5) / 2 = 3.25`.
pub fn blend_rating(current: f64, rating: f64) -> f64 {
    (current + rating) / 2.0
}

/// A copy bound to a member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEntry {
    pub member_id: Uuid,
    pub due_date: DateTime<Utc>,
}

/// Book record as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Book {
    pub id: Uuid,
    pub title: String,
    pub author: String,
    pub genres: Vec<String>,
    /// 0 to 5, see [`blend_rating`]
    pub rating: f64,
    pub rating_count: i32,
    /// Copies on the shelf
    pub stock: i32,
    /// Copies out, in issue order
    pub issued_to: Vec<IssueEntry>,
    /// Members waiting for a copy, in request order
    pub requested_by: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Book {
    pub fn new(input: &CreateBook, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: input.title.clone(),
            author: input.author.clone(),
            genres: input.genres.clone(),
            rating: input.rating,
            rating_count: 0,
            stock: input.stock,
            issued_to: Vec::new(),
            requested_by: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_issued_to(&self, member_id: Uuid) -> bool {
        self.issued_to.iter().any(|e| e.member_id == member_id)
    }

    pub fn is_requested_by(&self, member_id: Uuid) -> bool {
        self.requested_by.contains(&member_id)
    }

    pub fn issue_entry(&self, member_id: Uuid) -> Option<&IssueEntry> {
        self.issued_to.iter().find(|e| e.member_id == member_id)
    }

    /// Copies owned by the library, on the shelf or out
    pub fn total_copies(&self) -> i32 {
        self.stock + self.issued_to.len() as i32
    }

    /// How many copies a subtraction may remove
    pub fn removable_copies(&self) -> i32 {
        self.stock - self.issued_to.len() as i32
    }

    pub fn overdue_entries(&self, now: DateTime<Utc>) -> Vec<IssueEntry> {
        self.issued_to
            .iter()
            .filter(|e| e.due_date < now)
            .cloned()
            .collect()
    }
}

/// Create book request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBook {
    #[validate(length(min = 1, message = "Title is required"))]
    pub title: String,
    #[validate(length(min = 1, message = "Author is required"))]
    pub author: String,
    #[validate(length(min = 1, message = "At least one genre is required"))]
    pub genres: Vec<String>,
    #[validate(range(min = 0, message = "Stock cannot be negative"))]
    pub stock: i32,
    #[validate(range(min = 0.0, max = 5.0, message = "Rating must be between 0 and 5"))]
    pub rating: f64,
}

/// Which field a catalog search matches against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchField {
    #[default]
    Title,
    Author,
}

/// Catalog browse filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookFilter {
    pub search: Option<String>,
    #[serde(default)]
    pub search_by: SearchField,
    /// Any-of match; empty means every genre
    #[serde(default)]
    pub genres: Vec<String>,
}

impl BookFilter {
    pub fn by_genres(genres: Vec<String>) -> Self {
        Self {
            genres,
            ..Self::default()
        }
    }

    pub fn matches(&self, book: &Book) -> bool {
        let text_ok = match self.search.as_deref() {
            None | Some("") => true,
            Some(needle) => {
                let haystack = match self.search_by {
                    SearchField::Title => &book.title,
                    SearchField::Author => &book.author,
                };
                haystack.to_lowercase().contains(&needle.to_lowercase())
            }
        };
        let genre_ok = self.genres.is_empty()
            || book
                .genres
                .iter()
                .any(|g| self.genres.iter().any(|w| w.eq_ignore_ascii_case(g)));
        text_ok && genre_ok
    }
}

/// Stock correction requested by an admin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", content = "amount", rename_all = "lowercase")]
pub enum StockAdjustment {
    Add(i32),
    Subtract(i32),
}

impl StockAdjustment {
    /// Build from the `action`/`amount` pair used by admin forms
    pub fn from_action(action: &str, amount: i32) -> AppResult<Self> {
        let adjustment = match action {
            "add" => StockAdjustment::Add(amount),
            "subtract" => StockAdjustment::Subtract(amount),
            other => return Err(AppError::Validation(format!("Invalid action: {}", other))),
        };
        adjustment.validate()?;
        Ok(adjustment)
    }

    pub fn amount(&self) -> i32 {
        match *self {
            StockAdjustment::Add(n) | StockAdjustment::Subtract(n) => n,
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.amount() <= 0 {
            return Err(AppError::Validation("Stock amount must be positive".to_string()));
        }
        Ok(())
    }

    pub fn delta(&self) -> i64 {
        match *self {
            StockAdjustment::Add(n) => i64::from(n),
            StockAdjustment::Subtract(n) => -i64::from(n),
        }
    }

    /// Shelf stock after the adjustment; never wraps
    pub fn apply(&self, stock: i32) -> AppResult<i32> {
        self.validate()?;
        let next = match *self {
            StockAdjustment::Add(n) => stock.checked_add(n),
            StockAdjustment::Subtract(n) => stock.checked_sub(n),
        };
        next.filter(|s| *s >= 0)
            .ok_or_else(|| AppError::Validation("Stock adjustment is out of range".to_string()))
    }
}

/// Book with only the copies that are past due
#[derive(Debug, Clone, Serialize)]
pub struct OverdueBook {
    pub book_id: Uuid,
    pub title: String,
    pub overdue: Vec<IssueEntry>,
}
