use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub idempotency: IdempotencySettings,
    pub outbox: OutboxSettings,
    pub email: EmailSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseSettings {
    pub url: String,
    pub pool_size: u32,
    pub acquire_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApplicationSettings {
    /// Public base URL used to build confirmation links.
    pub base_url: String,
    pub log_level: String,
    pub log_format: String,
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IdempotencySettings {
    /// Age after which a committed `started` record is considered abandoned.
    pub stale_after_secs: i64,
    /// Hint returned to clients whose key is still in progress.
    pub retry_after_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxSettings {
    pub poll_interval_ms: u64,
    pub batch_size: i64,
    pub max_attempts: i32,
    pub base_backoff_ms: i64,
    pub max_backoff_ms: i64,
    pub claim_timeout_secs: i64,
    pub send_timeout_secs: u64,
    /// Zero disables purging of delivered tasks.
    pub retention_hours: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailSettings {
    pub api_base_url: String,
    pub sender: String,
    pub authorization_token: String,
    pub timeout_ms: u64,
}

impl Settings {
    pub fn new() -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            .add_source(config::File::with_name("config/local").required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"));

        builder.build()?.try_deserialize()
    }
}
