use std::env;
use std::time::Duration;

/// Placeholder credential shipped in sample `.env` files
pub const PLACEHOLDER_API_KEY: &str = "your-ably-api-key-here";

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:5165/api";
pub const DEFAULT_CHANNEL_PREFIX: &str = "class-";
pub const DEFAULT_REALTIME_HOST: &str = "realtime.ably.io";
pub const DEFAULT_REST_HOST: &str = "rest.ably.io";
pub const DEFAULT_CLASS_ID: &str = "demo-class-001";

pub struct Config {
    pub api: ApiConfig,
    pub realtime: RealtimeConfig,
    pub app: AppConfig,
}

/// REST backend settings
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

/// Pub/sub provider settings
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// `keyName:keySecret`
    pub api_key: String,
    pub channel_prefix: String,
    pub realtime_host: String,
    pub rest_host: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub history_limit: usize,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub default_class_id: String,
    pub cursor_flush_interval_ms: u64,
    pub message_max_length: usize,
}

impl Config {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            api: ApiConfig {
                base_url: env::var("API_BASE_URL")
                    .unwrap_or_else(|_| DEFAULT_API_BASE_URL.to_string()),
                request_timeout_secs: env_or("API_REQUEST_TIMEOUT_SECS", 10),
            },
            realtime: RealtimeConfig {
                api_key: env::var("REALTIME_API_KEY").unwrap_or_default(),
                channel_prefix: env::var("REALTIME_CHANNEL_PREFIX")
                    .unwrap_or_else(|_| DEFAULT_CHANNEL_PREFIX.to_string()),
                realtime_host: env::var("REALTIME_HOST")
                    .unwrap_or_else(|_| DEFAULT_REALTIME_HOST.to_string()),
                rest_host: env::var("REALTIME_REST_HOST")
                    .unwrap_or_else(|_| DEFAULT_REST_HOST.to_string()),
                reconnect_attempts: env_or("REALTIME_RECONNECT_ATTEMPTS", 5),
                reconnect_delay_ms: env_or("REALTIME_RECONNECT_DELAY_MS", 1000),
                heartbeat_interval_ms: env_or("REALTIME_HEARTBEAT_INTERVAL_MS", 30_000),
                history_limit: env_or("REALTIME_HISTORY_LIMIT", 50),
            },
            app: AppConfig {
                default_class_id: env::var("DEFAULT_CLASS_ID")
                    .unwrap_or_else(|_| DEFAULT_CLASS_ID.to_string()),
                cursor_flush_interval_ms: env_or("CURSOR_FLUSH_INTERVAL_MS", 100),
                message_max_length: env_or("MESSAGE_MAX_LENGTH", 1000),
            },
        }
    }

    /// Returns every configuration problem found; empty means usable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let key = self.realtime.api_key.trim();
        if key.is_empty() {
            errors.push("REALTIME_API_KEY is not set".to_string());
        } else if key == PLACEHOLDER_API_KEY {
            errors.push("REALTIME_API_KEY is using the placeholder value".to_string());
        } else if !key.contains(':') {
            errors.push("REALTIME_API_KEY must have the form keyName:keySecret".to_string());
        }

        if self.api.base_url.trim().is_empty() {
            errors.push("API_BASE_URL is not configured".to_string());
        }

        errors
    }

    pub fn log_summary(&self) {
        let errors = self.validate();
        if errors.is_empty() {
            tracing::info!(
                api_base_url = %self.api.base_url,
                api_key = %self.realtime.masked_key(),
                channel_prefix = %self.realtime.channel_prefix,
                "Configuration loaded"
            );
        } else {
            tracing::warn!(?errors, "Configuration issues found");
        }
    }
}

impl RealtimeConfig {
    /// First ten characters of the key, for logs.
    pub fn masked_key(&self) -> String {
        if self.api_key.is_empty() {
            return "<not set>".to_string();
        }
        let visible: String = self.api_key.chars().take(10).collect();
        format!("{}...", visible)
    }

    /// Splits the credential into basic-auth parts.
    pub fn key_parts(&self) -> Option<(&str, &str)> {
        self.api_key.split_once(':')
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            channel_prefix: DEFAULT_CHANNEL_PREFIX.to_string(),
            realtime_host: DEFAULT_REALTIME_HOST.to_string(),
            rest_host: DEFAULT_REST_HOST.to_string(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1000,
            heartbeat_interval_ms: 30_000,
            history_limit: 50,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            default_class_id: DEFAULT_CLASS_ID.to_string(),
            cursor_flush_interval_ms: 100,
            message_max_length: 1000,
        }
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
