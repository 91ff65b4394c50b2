use std::time::Duration;

use url::Url;

pub const DEFAULT_PORT: u16 = 4096;
pub const DEFAULT_EVENT_PATH: &str = "/event";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_PROMPT_TIMEOUT_MS: u64 = 300_000;
const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

pub const ENV_BASE_URL: &str = "OPENCODE_BASE_URL";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "OPENCODE_REQUEST_TIMEOUT_MS";
pub const ENV_PROMPT_TIMEOUT_MS: &str = "OPENCODE_PROMPT_TIMEOUT_MS";
pub const ENV_MAX_ATTEMPTS: &str = "OPENCODE_MAX_ATTEMPTS";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Budget for the whole operation; no retry starts past it.
    pub max_elapsed: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            max_elapsed: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    pub path: String,
    pub reconnect: bool,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
    pub max_reconnect_delay: Duration,
    pub subscriber_buffer: usize,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            path: DEFAULT_EVENT_PATH.to_string(),
            reconnect: true,
            max_reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(5),
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub request_timeout: Duration,
    /// Default deadline for blocking prompts, which wait for a whole turn.
    pub prompt_timeout: Duration,
    pub retry: RetryConfig,
    pub stream: StreamConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{DEFAULT_PORT}"),
            request_timeout: Duration::from_millis(DEFAULT_REQUEST_TIMEOUT_MS),
            prompt_timeout: Duration::from_millis(DEFAULT_PROMPT_TIMEOUT_MS),
            retry: RetryConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid base url `{url}`: {source}")]
    InvalidBaseUrl {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error("unsupported base url scheme `{0}`")]
    UnsupportedScheme(String),
    #[error("invalid value for {key}: {value}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("max_attempts must be at least 1")]
    ZeroAttempts,
    #[error("subscriber buffer must be at least 1")]
    ZeroBuffer,
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    /// Defaults overridden by `OPENCODE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(base_url) = lookup(ENV_BASE_URL) {
            config.base_url = base_url;
        }
        if let Some(ms) = parse_env(&lookup, ENV_REQUEST_TIMEOUT_MS)? {
            config.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_env(&lookup, ENV_PROMPT_TIMEOUT_MS)? {
            config.prompt_timeout = Duration::from_millis(ms);
        }
        if let Some(attempts) = parse_env(&lookup, ENV_MAX_ATTEMPTS)? {
            config.retry.max_attempts =
                u32::try_from(attempts).map_err(|_| ConfigError::InvalidEnv {
                    key: ENV_MAX_ATTEMPTS,
                    value: attempts.to_string(),
                })?;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_prompt_timeout(mut self, timeout: Duration) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stream(mut self, stream: StreamConfig) -> Self {
        self.stream = stream;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = Url::parse(&self.base_url).map_err(|source| ConfigError::InvalidBaseUrl {
            url: self.base_url.clone(),
            source,
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::UnsupportedScheme(url.scheme().to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::ZeroAttempts);
        }
        if self.stream.subscriber_buffer == 0 {
            return Err(ConfigError::ZeroBuffer);
        }
        Ok(())
    }
}

fn parse_env(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<u64>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value }),
    }
}
