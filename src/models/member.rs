//! Member model, identity and related types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Decode, Encode, FromRow, Postgres};
use uuid::Uuid;
use validator::Validate;

use crate::error::AppError;

/// Maximum number of books a member may hold at once
pub const MAX_ISSUED_BOOKS: usize = 2;

/// Member role
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    Member,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "admin" => Ok(Role::Admin),
            "member" => Ok(Role::Member),
            _ => Err(format!("Invalid role: {}", s)),
        }
    }
}

// SQLx conversion for Role
impl sqlx::Type<Postgres> for Role {
    fn type_info() -> sqlx::postgres::PgTypeInfo {
        <String as sqlx::Type<Postgres>>::type_info()
    }
}

impl<'r> Decode<'r, Postgres> for Role {
    fn decode(value: sqlx::postgres::PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s: String = Decode::<Postgres>::decode(value)?;
        s.parse().map_err(|e: String| e.into())
    }
}

impl Encode<'_, Postgres> for Role {
    fn encode_by_ref(&self, buf: &mut sqlx::postgres::PgArgumentBuffer) -> sqlx::encode::IsNull {
        <&str as Encode<Postgres>>::encode(self.as_str(), buf)
    }
}

/// Member record as persisted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Member {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    /// Hashed password (argon2), absent for federated accounts
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub role: Role,
    pub blocked: bool,
    /// Receives the newsletter
    pub newsletter: bool,
    /// End of the paid plan; requests need it to be in the future
    pub subscription_end: Option<DateTime<Utc>>,
    /// Books currently held, at most [`MAX_ISSUED_BOOKS`]
    pub issued_books: Vec<Uuid>,
    pub wishlist: Vec<Uuid>,
    /// Every book ever issued to this member
    pub read_history: Vec<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    pub fn new(input: NewMember, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: input.name,
            email: input.email,
            password: input.password_hash,
            role: input.role,
            blocked: false,
            newsletter: input.newsletter,
            subscription_end: input.subscription_end,
            issued_books: Vec::new(),
            wishlist: Vec::new(),
            read_history: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    pub fn has_active_subscription(&self, now: DateTime<Utc>) -> bool {
        self.subscription_end.map(|end| end >= now).unwrap_or(false)
    }

    pub fn holds(&self, book_id: Uuid) -> bool {
        self.issued_books.contains(&book_id)
    }

    pub fn has_read(&self, book_id: Uuid) -> bool {
        self.read_history.contains(&book_id)
    }

    pub fn at_issue_limit(&self) -> bool {
        self.issued_books.len() >= MAX_ISSUED_BOOKS
    }

    pub fn identity(&self) -> Identity {
        Identity {
            member_id: self.id,
            role: self.role,
        }
    }
}

/// Short member representation for admin lists
#[derive(Debug, Clone, Serialize)]
pub struct MemberShort {
    pub id: Uuid,
    pub name: String,
    pub email: String,
    pub issued_books: Vec<Uuid>,
    pub blocked: bool,
}

impl From<Member> for MemberShort {
    fn from(m: Member) -> Self {
        MemberShort {
            id: m.id,
            name: m.name,
            email: m.email,
            issued_books: m.issued_books,
            blocked: m.blocked,
        }
    }
}

/// Registration request
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RegisterMember {
    #[validate(length(min = 1, message = "Name is required"))]
    pub name: String,
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    /// Absent for federated sign-ups
    #[validate(length(min = 4, message = "Password must be at least 4 characters"))]
    pub password: Option<String>,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub newsletter: bool,
}

/// Member ready to be stored, password already hashed
#[derive(Debug, Clone)]
pub struct NewMember {
    pub name: String,
    pub email: String,
    pub password_hash: Option<String>,
    pub role: Role,
    pub newsletter: bool,
    pub subscription_end: Option<DateTime<Utc>>,
}

/// Member list filter
#[derive(Debug, Clone, Default)]
pub struct MemberFilter {
    pub role: Option<Role>,
    pub newsletter: Option<bool>,
    /// Only members whose subscription ended strictly before this instant
    pub subscription_ended_before: Option<DateTime<Utc>>,
}

impl MemberFilter {
    pub fn matches(&self, member: &Member) -> bool {
        self.role.map(|r| member.role == r).unwrap_or(true)
            && self.newsletter.map(|n| member.newsletter == n).unwrap_or(true)
            && self
                .subscription_ended_before
                .map(|t| member.subscription_end.map(|end| end < t).unwrap_or(false))
                .unwrap_or(true)
    }
}

/// Who is calling, as resolved by the authentication gate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub member_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn admin(member_id: Uuid) -> Self {
        Self {
            member_id,
            role: Role::Admin,
        }
    }

    pub fn member(member_id: Uuid) -> Self {
        Self {
            member_id,
            role: Role::Member,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Require admin privileges
    pub fn require_admin(&self) -> Result<(), AppError> {
        if self.is_admin() {
            Ok(())
        } else {
            Err(AppError::Authorization("Administrator privileges required".to_string()))
        }
    }

    /// Members act on their own record, admins on anyone's
    pub fn require_self_or_admin(&self, member_id: Uuid) -> Result<(), AppError> {
        if self.is_admin() || self.member_id == member_id {
            Ok(())
        } else {
            Err(AppError::Authorization("Cannot act on behalf of another member".to_string()))
        }
    }
}

/// JWT Claims for authenticated members
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberClaims {
    pub sub: String,
    pub member_id: Uuid,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

impl MemberClaims {
    /// Create a new JWT token
    pub fn create_token(&self, secret: &str) -> Result<String, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{encode, EncodingKey, Header};
        encode(
            &Header::default(),
            self,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
    }

    /// Parse JWT token
    pub fn from_token(token: &str, secret: &str) -> Result<Self, jsonwebtoken::errors::Error> {
        use jsonwebtoken::{decode, DecodingKey, Validation};
        let token_data = decode::<Self>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )?;
        Ok(token_data.claims)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            member_id: self.member_id,
            role: self.role,
        }
    }
}
