//! Activity ledger records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, FromRow, Postgres};
use uuid::Uuid;

/// What happened to a copy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityAction {
    Issue,
    Return,
}

impl ActivityAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityAction::Issue => "issue",
            ActivityAction::Return => "return",
        }
    }
}

impl std::fmt::Display for ActivityAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for ActivityAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "issue" => Ok(ActivityAction::Issue),
            "return" => Ok(ActivityAction::Return),
            _ => Err(format!("Invalid activity action: {}", s)),
        }
    }
}

impl sqlx::Type<Postgres> for ActivityAction {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> Decode<'r, Postgres> for ActivityAction {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s: String = Decode::<Postgres>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

impl Encode<'_, Postgres> for ActivityAction {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        <&str as Encode<Postgres>>::encode(self.as_str(), buf)
    }
}

/// Immutable ledger entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ActivityRecord {
    pub id: Uuid,
    pub member_id: Uuid,
    pub book_id: Uuid,
    pub action: ActivityAction,
    pub created_at: DateTime<Utc>,
}

/// Activity listing filter
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActivityQuery {
    pub member_id: Option<Uuid>,
    pub book_id: Option<Uuid>,
}

impl ActivityQuery {
    pub fn matches(&self, record: &ActivityRecord) -> bool {
        self.member_id.map(|m| m == record.member_id).unwrap_or(true)
            && self.book_id.map(|b| b == record.book_id).unwrap_or(true)
    }
}
