//! Libris Library Circulation Server
//!
//! Book lifecycle and inventory engine for a lending library: members
//! request books, admins issue and take them back, stock is adjusted, and
//! background jobs mail due and plan reminders.

use std::sync::Arc;

pub mod clock;
pub mod config;
pub mod error;
pub mod models;
pub mod repository;
pub mod services;

pub use config::AppConfig;
pub use error::{AppError, AppResult};

/// Application state shared by whatever outer layer drives the services
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub services: Arc<services::Services>,
}
