//! Short-lived action tokens (password reset)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a token authorizes; one live token per (email, action)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TokenAction {
    #[serde(rename = "resetpass")]
    ResetPassword,
}

impl TokenAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenAction::ResetPassword => "resetpass",
        }
    }
}

/// Stored token; only the SHA-256 digest of the secret is kept
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionToken {
    pub email: String,
    pub action: TokenAction,
    pub digest: String,
    pub created_at: DateTime<Utc>,
}
