//! Application state.

use std::sync::Arc;

use z_payments_engine::PaymentEngine;

use crate::config::ServiceConfig;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    /// The payment engine.
    pub engine: Arc<PaymentEngine>,

    /// Service configuration.
    pub config: ServiceConfig,
}

impl AppState {
    /// Create a new application state.
    #[must_use]
    pub fn new(engine: PaymentEngine, config: ServiceConfig) -> Self {
        if config.service_api_key.is_none() {
            tracing::warn!("SERVICE_API_KEY not set - merchant endpoints will reject every call");
        }
        if config.admin_api_key.is_none() {
            tracing::warn!("ADMIN_API_KEY not set - admin endpoints are disabled");
        }

        Self {
            engine: Arc::new(engine),
            config,
        }
    }
}
