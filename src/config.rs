use std::env;

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub webhooks: WebhookConfig,
    pub rate_limit: RateLimitConfig,
    pub delivery: DeliveryConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

/// Shared secrets for inbound delivery-status webhooks. A missing secret
/// causes the corresponding endpoint to reject every request.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub fcm_secret: Option<String>,
    pub email_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Allowed requests per second (per IP) for webhook endpoints
    pub webhook_per_second: u32,
    /// Burst size for webhook endpoints
    pub webhook_burst: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Whether the delivery retry worker is enabled.
    pub retry_enabled: bool,
    /// How often (seconds) the worker polls for due retries.
    pub poll_interval_seconds: u64,
    /// Maximum number of send attempts per delivery before it becomes terminal.
    pub max_attempts: u32,
    /// Backoff before the first retry (seconds).
    pub initial_backoff_seconds: u64,
    /// Multiplier applied per additional attempt (30s -> 120s -> 480s with 4).
    pub backoff_multiplier: u64,
    /// Cap for the computed backoff (seconds).
    pub max_backoff_seconds: u64,
    /// Maximum deliveries claimed per poll cycle.
    pub retry_batch_size: i64,
    /// TTL (seconds) for cached preference resolutions.
    pub preference_cache_ttl_seconds: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        Ok(Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| "8080".to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL")
                    .unwrap_or_else(|_| "sqlite://data/notifications.db".to_string()),
                max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5),
            },
            webhooks: WebhookConfig {
                fcm_secret: env::var("FCM_WEBHOOK_SECRET").ok(),
                email_secret: env::var("EMAIL_WEBHOOK_SECRET").ok(),
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: env::var("RATE_LIMIT_WEBHOOKS_PER_SECOND")
                    .unwrap_or_else(|_| "10".to_string())
                    .parse()
                    .unwrap_or(10),
                webhook_burst: env::var("RATE_LIMIT_WEBHOOKS_BURST")
                    .unwrap_or_else(|_| "50".to_string())
                    .parse()
                    .unwrap_or(50),
            },
            delivery: DeliveryConfig {
                retry_enabled: match env::var("DELIVERY_RETRY_ENABLED") {
                    Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"),
                    Err(_) => true,
                },
                poll_interval_seconds: env::var("DELIVERY_RETRY_POLL_INTERVAL_SECONDS")
                    .unwrap_or_else(|_| "5".to_string())
                    .parse()
                    .unwrap_or(5u64),
                max_attempts: env::var("DELIVERY_MAX_ATTEMPTS")
                    .unwrap_or_else(|_| "3".to_string())
                    .parse()
                    .unwrap_or(3u32),
                initial_backoff_seconds: env::var("DELIVERY_INITIAL_BACKOFF_SECONDS")
                    .unwrap_or_else(|_| "30".to_string())
                    .parse()
                    .unwrap_or(30u64),
                backoff_multiplier: env::var("DELIVERY_BACKOFF_MULTIPLIER")
                    .unwrap_or_else(|_| "4".to_string())
                    .parse()
                    .unwrap_or(4u64),
                max_backoff_seconds: env::var("DELIVERY_MAX_BACKOFF_SECONDS")
                    .unwrap_or_else(|_| "600".to_string())
                    .parse()
                    .unwrap_or(600u64),
                retry_batch_size: env::var("DELIVERY_RETRY_BATCH_SIZE")
                    .unwrap_or_else(|_| "20".to_string())
                    .parse()
                    .unwrap_or(20i64),
                preference_cache_ttl_seconds: env::var("PREFERENCE_CACHE_TTL_SECONDS")
                    .unwrap_or_else(|_| "300".to_string())
                    .parse()
                    .unwrap_or(300u64),
            },
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/notifications.db".to_string(),
                max_connections: 5,
            },
            webhooks: WebhookConfig {
                fcm_secret: None,
                email_secret: None,
            },
            rate_limit: RateLimitConfig {
                webhook_per_second: 10,
                webhook_burst: 50,
            },
            delivery: DeliveryConfig {
                retry_enabled: true,
                poll_interval_seconds: 5,
                max_attempts: 3,
                initial_backoff_seconds: 30,
                backoff_multiplier: 4,
                max_backoff_seconds: 600,
                retry_batch_size: 20,
                preference_cache_ttl_seconds: 300,
            },
        }
    }
}
