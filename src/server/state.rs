//! Application state shared across handlers.

use crate::auth::AuthService;
use crate::catalog::CatalogService;
use crate::config::Config;
use crate::db::Database;
use std::sync::Arc;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<Config>,
    /// Database connection.
    pub db: Database,
    /// Authentication service.
    pub auth: Arc<AuthService>,
    /// Catalog service.
    pub catalog: Arc<CatalogService>,
}

impl AppState {
    /// Create new application state.
    pub fn new(config: Config, db: Database, auth: AuthService) -> Self {
        let catalog = CatalogService::new(db.clone());
        Self {
            config: Arc::new(config),
            db,
            auth: Arc::new(auth),
            catalog: Arc::new(catalog),
        }
    }
}
