//! Service configuration.

/// Service configuration loaded from environment variables.
///
/// Engine and gateway settings are loaded separately by
/// `EngineConfig::from_env` and `GatewayConfig::from_env`.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Address to listen on (default: "0.0.0.0:8080").
    pub listen_addr: String,

    /// Path to the `RocksDB` data directory (default: "/data/z-payments").
    /// Only used with the `rocksdb-backend` feature.
    pub data_dir: String,

    /// Service API key expected in `x-api-key`.
    pub service_api_key: Option<String>,

    /// Admin API key expected in `x-admin-key`.
    pub admin_api_key: Option<String>,

    /// CORS allowed origins.
    pub cors_origins: Vec<String>,

    /// Maximum request body size in bytes.
    pub max_body_bytes: usize,

    /// Request timeout in seconds. Keep it above the gateway timeout.
    pub request_timeout_seconds: u64,

    /// Explicit path of the merchant credentials file.
    pub credentials_file: Option<String>,

    /// Default batch size for admin-triggered runs.
    pub batch_limit: usize,
}

impl ServiceConfig {
    /// Load configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            listen_addr: std::env::var("LISTEN_ADDR").unwrap_or(defaults.listen_addr),
            data_dir: std::env::var("DATA_DIR").unwrap_or(defaults.data_dir),
            service_api_key: std::env::var("SERVICE_API_KEY").ok(),
            admin_api_key: std::env::var("ADMIN_API_KEY").ok(),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|origins| {
                    origins
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            max_body_bytes: env_parse("MAX_BODY_BYTES").unwrap_or(defaults.max_body_bytes),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS")
                .unwrap_or(defaults.request_timeout_seconds),
            credentials_file: std::env::var("GATEWAY_CREDENTIALS_FILE").ok(),
            batch_limit: env_parse("BATCH_LIMIT")
                .filter(|n: &usize| *n > 0)
                .unwrap_or(defaults.batch_limit),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".into(),
            data_dir: "/data/z-payments".into(),
            service_api_key: None,
            admin_api_key: None,
            cors_origins: vec!["*".into()],
            max_body_bytes: 1024 * 1024, // 1MB
            request_timeout_seconds: 60,
            credentials_file: None,
            batch_limit: 100,
        }
    }
}
