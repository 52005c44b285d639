//! Error types for Libris server

use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

/// Stable error codes exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u32)]
pub enum ErrorCode {
    Failure = 1,
    NotAuthorized = 2,
    DbFailure = 3,
    MemberNotFound = 4,
    BookNotFound = 5,
    MemberBlocked = 6,
    SubscriptionExpired = 7,
    AlreadyRequested = 8,
    AlreadyIssuedToMember = 9,
    NotRequested = 10,
    IssueLimitReached = 11,
    OutOfStock = 12,
    NotIssuedToMember = 13,
    InsufficientAvailableStock = 14,
    BooksInCirculation = 15,
    MemberHasIssuedBooks = 16,
    NotInReadHistory = 17,
    ConcurrentUpdate = 18,
    UpstreamUnavailable = 19,
    BadValue = 20,
    Duplicate = 21,
    AlreadyInWishlist = 22,
    NotInWishlist = 23,
    ResetAlreadyRequested = 24,
    InvalidToken = 25,
    NoRecipients = 26,
}

/// Coarse classification used by outer layers to pick a response status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    NotFound,
    PreconditionFailed,
    ConflictOnConcurrentUpdate,
    UpstreamUnavailable,
    Unauthorized,
    Invalid,
    Internal,
}

/// Main application error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization failed: {0}")]
    Authorization(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Member {0} not found")]
    MemberNotFound(Uuid),

    #[error("Book {0} not found")]
    BookNotFound(Uuid),

    #[error("Member {0} has been blocked, contact the librarian")]
    MemberBlocked(Uuid),

    #[error("Member {0} has no active subscription")]
    SubscriptionExpired(Uuid),

    #[error("Book already requested by member {member_id}")]
    AlreadyRequested { book_id: Uuid, member_id: Uuid },

    #[error("Member {member_id} already holds a copy of book {book_id}")]
    AlreadyIssuedToMember { book_id: Uuid, member_id: Uuid },

    #[error("Book {book_id} not requested by member {member_id}")]
    NotRequested { book_id: Uuid, member_id: Uuid },

    #[error("Member {member_id} already has {limit} issued books")]
    IssueLimitReached { member_id: Uuid, limit: usize },

    #[error("Book {0} not in stock")]
    OutOfStock(Uuid),

    #[error("Book {book_id} was not issued to member {member_id}")]
    NotIssuedToMember { book_id: Uuid, member_id: Uuid },

    #[error("Cannot remove {requested} copies of book {book_id}, only {available} available")]
    InsufficientAvailableStock {
        book_id: Uuid,
        requested: i32,
        available: i32,
    },

    #[error("Book {0} cannot be deleted until all copies are returned")]
    BooksInCirculation(Uuid),

    #[error("Member {0} has issued books that were not returned")]
    MemberHasIssuedBooks(Uuid),

    #[error("Member {member_id} never borrowed book {book_id}")]
    NotInReadHistory { book_id: Uuid, member_id: Uuid },

    #[error("Book {0} already in wishlist")]
    AlreadyInWishlist(Uuid),

    #[error("Book {0} not in wishlist")]
    NotInWishlist(Uuid),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Reset password email already sent to {0}, try again later")]
    ResetAlreadyRequested(String),

    #[error("Invalid token")]
    InvalidToken,

    #[error("No recipients for {0}")]
    NoRecipients(String),

    #[error("Concurrent update conflict: {0}")]
    Conflict(String),

    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub kind: ErrorKind,
    pub error: String,
    pub message: String,
}

impl AppError {
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Authentication(_) | AppError::Authorization(_) => ErrorCode::NotAuthorized,
            AppError::Validation(_) => ErrorCode::BadValue,
            AppError::MemberNotFound(_) => ErrorCode::MemberNotFound,
            AppError::BookNotFound(_) => ErrorCode::BookNotFound,
            AppError::MemberBlocked(_) => ErrorCode::MemberBlocked,
            AppError::SubscriptionExpired(_) => ErrorCode::SubscriptionExpired,
            AppError::AlreadyRequested { .. } => ErrorCode::AlreadyRequested,
            AppError::AlreadyIssuedToMember { .. } => ErrorCode::AlreadyIssuedToMember,
            AppError::NotRequested { .. } => ErrorCode::NotRequested,
            AppError::IssueLimitReached { .. } => ErrorCode::IssueLimitReached,
            AppError::OutOfStock(_) => ErrorCode::OutOfStock,
            AppError::NotIssuedToMember { .. } => ErrorCode::NotIssuedToMember,
            AppError::InsufficientAvailableStock { .. } => ErrorCode::InsufficientAvailableStock,
            AppError::BooksInCirculation(_) => ErrorCode::BooksInCirculation,
            AppError::MemberHasIssuedBooks(_) => ErrorCode::MemberHasIssuedBooks,
            AppError::NotInReadHistory { .. } => ErrorCode::NotInReadHistory,
            AppError::AlreadyInWishlist(_) => ErrorCode::AlreadyInWishlist,
            AppError::NotInWishlist(_) => ErrorCode::NotInWishlist,
            AppError::Duplicate(_) => ErrorCode::Duplicate,
            AppError::ResetAlreadyRequested(_) => ErrorCode::ResetAlreadyRequested,
            AppError::InvalidToken => ErrorCode::InvalidToken,
            AppError::NoRecipients(_) => ErrorCode::NoRecipients,
            AppError::Conflict(_) => ErrorCode::ConcurrentUpdate,
            AppError::UpstreamUnavailable(_) | AppError::Redis(_) => ErrorCode::UpstreamUnavailable,
            AppError::Database(_) => ErrorCode::DbFailure,
            AppError::Internal(_) => ErrorCode::Failure,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::MemberNotFound(_) | AppError::BookNotFound(_) => ErrorKind::NotFound,
            AppError::Authentication(_) | AppError::Authorization(_) | AppError::InvalidToken => {
                ErrorKind::Unauthorized
            }
            AppError::Validation(_) | AppError::Duplicate(_) => ErrorKind::Invalid,
            AppError::Conflict(_) => ErrorKind::ConflictOnConcurrentUpdate,
            AppError::UpstreamUnavailable(_) | AppError::Database(_) | AppError::Redis(_) => {
                ErrorKind::UpstreamUnavailable
            }
            AppError::Internal(_) => ErrorKind::Internal,
            _ => ErrorKind::PreconditionFailed,
        }
    }

    /// Build the body an outer layer sends back; storage details are not leaked
    pub fn to_response(&self) -> ErrorResponse {
        let code = self.code();
        let message = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Database error".to_string()
            }
            AppError::Redis(e) => {
                tracing::error!("Redis error: {:?}", e);
                "Token store error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal server error".to_string()
            }
            other => other.to_string(),
        };

        ErrorResponse {
            code: code as u32,
            kind: self.kind(),
            error: format!("{:?}", code),
            message,
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(e: validator::ValidationErrors) -> Self {
        AppError::Validation(e.to_string())
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;
