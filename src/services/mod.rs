//! Business logic services

pub mod auth;
pub mod catalog;
pub mod email;
pub mod jobs;
pub mod lifecycle;
pub mod members;
pub mod notifications;
pub mod reconcile;
pub mod redis;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{
    clock::Clock,
    config::AppConfig,
    error::{AppError, AppResult},
    repository::{Repository, TokenStore},
};

use self::email::Notifier;

/// Await a store or dispatcher call, giving up after `limit`
pub(crate) async fn bounded<T, F>(limit: Duration, what: &str, fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("{} did not answer within {:?}", what, limit);
            Err(AppError::UpstreamUnavailable(format!(
                "{} timed out after {} ms",
                what,
                limit.as_millis()
            )))
        }
    }
}

/// Run a transition on its own task so a dropped caller cannot abort it halfway
pub(crate) async fn detached<T, F>(fut: F) -> AppResult<T>
where
    F: Future<Output = AppResult<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(fut)
        .await
        .map_err(|e| AppError::Internal(format!("Transition task failed: {}", e)))?
}

/// Container for all services
#[derive(Clone)]
pub struct Services {
    pub auth: auth::AuthService,
    pub catalog: catalog::CatalogService,
    pub members: members::MembersService,
    pub lifecycle: lifecycle::LifecycleService,
    pub notifications: notifications::NotificationService,
    pub reconciler: reconcile::Reconciler,
}

impl Services {
    /// Create all services with the given repository and collaborators
    pub fn new(
        repository: Repository,
        tokens: Arc<dyn TokenStore>,
        notifier: Arc<dyn Notifier>,
        clock: Arc<dyn Clock>,
        config: &AppConfig,
    ) -> Self {
        let store_timeout = config.engine.store_timeout();
        let notify_timeout = config.engine.notify_timeout();

        let notifications = notifications::NotificationService::new(
            repository.clone(),
            notifier,
            clock.clone(),
            store_timeout,
            notify_timeout,
            config.email.library_address.clone(),
        );

        Self {
            auth: auth::AuthService::new(
                repository.clone(),
                tokens,
                notifications.clone(),
                clock.clone(),
                config.auth.clone(),
                store_timeout,
            ),
            catalog: catalog::CatalogService::new(repository.clone(), store_timeout),
            members: members::MembersService::new(repository.clone(), clock.clone(), store_timeout),
            lifecycle: lifecycle::LifecycleService::new(
                repository.clone(),
                clock.clone(),
                store_timeout,
            ),
            reconciler: reconcile::Reconciler::new(repository, clock, store_timeout),
            notifications,
        }
    }
}
