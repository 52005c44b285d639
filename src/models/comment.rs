//! Book comments left alongside ratings

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Comment {
    pub id: Uuid,
    pub member_id: Uuid,
    pub member_name: String,
    pub book_id: Uuid,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

/// Rate and comment request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RateBook {
    #[validate(range(min = 0.0, max = 5.0, message = "Rating must be between 0 and 5"))]
    pub rating: f64,
    #[validate(length(min = 1, message = "Comment is required"))]
    pub comment: String,
}
