//! Authentication gate: registration, login, bearer resolution and password reset

use std::sync::Arc;
use std::time::Duration;

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::RngCore;
use serde::Serialize;
use sha2::{Digest, Sha256};
use validator::Validate;

use super::{bounded, notifications::{Delivery, NotificationService}};
use crate::{
    clock::Clock,
    config::AuthConfig,
    error::{AppError, AppResult},
    models::{
        member::MemberClaims, ActionToken, Identity, Member, MemberShort, NewMember,
        RegisterMember, Role, TokenAction,
    },
    repository::{Repository, TokenStore},
};

/// Token plus the member it was issued to
#[derive(Debug, Clone, Serialize)]
pub struct AuthResponse {
    pub token: String,
    pub token_type: String,
    pub member: MemberShort,
}

#[derive(Clone)]
pub struct AuthService {
    repository: Repository,
    tokens: Arc<dyn TokenStore>,
    notifications: NotificationService,
    clock: Arc<dyn Clock>,
    config: AuthConfig,
    timeout: Duration,
}

fn digest(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

impl AuthService {
    pub fn new(
        repository: Repository,
        tokens: Arc<dyn TokenStore>,
        notifications: NotificationService,
        clock: Arc<dyn Clock>,
        config: AuthConfig,
        timeout: Duration,
    ) -> Self {
        Self {
            repository,
            tokens,
            notifications,
            clock,
            config,
            timeout,
        }
    }

    /// Create an account and sign it in
    pub async fn register(&self, input: RegisterMember) -> AppResult<AuthResponse> {
        input.validate()?;

        let password_hash = match input.password.as_deref() {
            Some(password) => Some(self.hash_password(password)?),
            None => None,
        };

        let member = bounded(
            self.timeout,
            "member store",
            self.repository.members.create(NewMember {
                name: input.name,
                email: input.email,
                password_hash,
                role: input.role,
                newsletter: input.newsletter,
                subscription_end: None,
            }),
        )
        .await?;

        tracing::info!("Registered {} {}", member.role, member.id);
        self.respond(member)
    }

    /// Check credentials; the account role must match the requested login mode
    pub async fn login(
        &self,
        email: &str,
        password: &str,
        as_admin: bool,
    ) -> AppResult<AuthResponse> {
        let invalid = || AppError::Authentication("Invalid credentials".to_string());

        let member = bounded(
            self.timeout,
            "member store",
            self.repository.members.get_by_email(email),
        )
        .await?
        .ok_or_else(invalid)?;

        if !self.verify_password(&member, password)? || member.is_admin() != as_admin {
            tracing::warn!("Failed login for {}", email);
            return Err(invalid());
        }

        self.respond(member)
    }

    fn respond(&self, member: Member) -> AppResult<AuthResponse> {
        let token = self.create_token(&member)?;
        Ok(AuthResponse {
            token,
            token_type: "Bearer".to_string(),
            member: member.into(),
        })
    }

    fn create_token(&self, member: &Member) -> AppResult<String> {
        let now = self.clock.now().timestamp();
        let exp = now + (self.config.jwt_expiration_hours as i64 * 3600);

        let claims = MemberClaims {
            sub: member.email.clone(),
            member_id: member.id,
            role: member.role,
            exp,
            iat: now,
        };

        claims
            .create_token(&self.config.jwt_secret)
            .map_err(|e| AppError::Internal(format!("Failed to create token: {}", e)))
    }

    /// Turn a bearer credential into the caller's identity.
    ///
    /// The role comes from the stored member, so a demoted admin loses
    /// access before the token expires.
    pub async fn resolve(&self, bearer: &str) -> AppResult<Identity> {
        let token = bearer.strip_prefix("Bearer ").unwrap_or(bearer).trim();
        let claims = MemberClaims::from_token(token, &self.config.jwt_secret)
            .map_err(|_| AppError::Authentication("Invalid or expired token".to_string()))?;

        let member = bounded(
            self.timeout,
            "member store",
            self.repository.members.get(claims.member_id),
        )
        .await?
        .ok_or_else(|| AppError::Authentication("Account no longer exists".to_string()))?;

        Ok(member.identity())
    }

    /// Mail a reset link; only one live link per member
    pub async fn forgot_password(&self, email: &str) -> AppResult<Delivery> {
        let member = bounded(
            self.timeout,
            "member store",
            self.repository.members.get_by_email(email),
        )
        .await?
        .filter(|m| m.role == Role::Member)
        .ok_or_else(|| AppError::Validation(format!("No member with email {}", email)))?;

        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let secret = hex::encode(secret);

        let token = ActionToken {
            email: member.email.clone(),
            action: TokenAction::ResetPassword,
            digest: digest(&secret),
            created_at: self.clock.now(),
        };

        let stored = bounded(
            self.timeout,
            "token store",
            self.tokens.issue(&token, self.config.reset_token_ttl_seconds),
        )
        .await?;
        if !stored {
            return Err(AppError::ResetAlreadyRequested(member.email));
        }

        let body = format!(
            "Hi, follow the link below to reset your password.\n\n{}/{}",
            self.config.reset_link_base.trim_end_matches('/'),
            secret
        );
        Ok(self
            .notifications
            .send(vec![member.email], "Reset Password", &body)
            .await)
    }

    /// Set a new password using a mailed reset token
    pub async fn reset_password(
        &self,
        email: &str,
        token: &str,
        new_password: &str,
    ) -> AppResult<()> {
        if new_password.chars().count() < 4 {
            return Err(AppError::Validation(
                "Password must be at least 4 characters".to_string(),
            ));
        }

        let stored = bounded(self.timeout, "token store", self.tokens.consume(&digest(token)))
            .await?
            .ok_or(AppError::InvalidToken)?;

        if stored.action != TokenAction::ResetPassword
            || !stored.email.eq_ignore_ascii_case(email)
        {
            return Err(AppError::InvalidToken);
        }

        let hash = self.hash_password(new_password)?;
        bounded(
            self.timeout,
            "member store",
            self.repository.members.set_password(&stored.email, &hash),
        )
        .await?;

        tracing::info!("Password reset for {}", stored.email);
        Ok(())
    }

    fn verify_password(&self, member: &Member, password: &str) -> AppResult<bool> {
        if let Some(ref hash) = member.password {
            let parsed_hash = PasswordHash::new(hash)
                .map_err(|_| AppError::Internal("Invalid password hash".to_string()))?;
            return Ok(Argon2::default()
                .verify_password(password.as_bytes(), &parsed_hash)
                .is_ok());
        }

        // Federated accounts have no password to match
        Ok(false)
    }

    /// Hash a password using Argon2
    pub fn hash_password(&self, password: &str) -> AppResult<String> {
        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| AppError::Internal(format!("Failed to hash password: {}", e)))?;
        Ok(hash.to_string())
    }
}
