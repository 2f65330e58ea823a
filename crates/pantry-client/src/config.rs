use std::env;
use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;
use url::Url;

use crate::error::{ClientError, Result};

/// Underlying socket strategies, tried in configured order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }
}

impl FromStr for TransportKind {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "websocket" => Ok(Self::WebSocket),
            "polling" => Ok(Self::Polling),
            other => Err(ClientError::Config(format!("unknown transport '{}'", other))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base of the REST API, without the `/api` suffix.
    pub api_url: Url,
    pub socket_url: Url,
    pub socket_path: String,
    pub transports: Vec<TransportKind>,
    pub db_path: PathBuf,
    /// Silence after the last keystroke before `typing=false` goes out.
    pub typing_quiet: Duration,
    /// How long a remote `typing=true` stays visible without a refresh.
    pub typing_expiry: Duration,
    /// How long an optimistic send waits for its echo.
    pub send_timeout: Duration,
    pub reconnect_min: Duration,
    pub reconnect_max: Duration,
    pub sidebar_refresh: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let api_url = Url::parse("http://127.0.0.1:5000").expect("static url");
        Self {
            socket_url: api_url.clone(),
            api_url,
            socket_path: "/socket.io".into(),
            transports: vec![TransportKind::WebSocket, TransportKind::Polling],
            db_path: PathBuf::from("pantry.db"),
            typing_quiet: Duration::from_millis(1000),
            typing_expiry: Duration::from_millis(8000),
            send_timeout: Duration::from_millis(10_000),
            reconnect_min: Duration::from_millis(500),
            reconnect_max: Duration::from_millis(30_000),
            sidebar_refresh: Duration::from_secs(60),
        }
    }
}

impl ClientConfig {
    /// Read `PANTRY_*` variables, falling back to defaults for unset ones.
    /// Callers load `.env` first.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_url: Url = try_load("PANTRY_API_URL", defaults.api_url)?;
        let socket_url: Url = try_load("PANTRY_SOCKET_URL", api_url.clone())?;

        let transports = match env::var("PANTRY_TRANSPORTS") {
            Ok(raw) => raw
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(TransportKind::from_str)
                .collect::<Result<Vec<_>>>()?,
            Err(_) => defaults.transports,
        };
        if transports.is_empty() {
            return Err(ClientError::Config("PANTRY_TRANSPORTS is empty".into()));
        }

        let config = Self {
            api_url,
            socket_url,
            socket_path: try_load("PANTRY_SOCKET_PATH", defaults.socket_path)?,
            transports,
            db_path: try_load("PANTRY_DB_PATH", defaults.db_path)?,
            typing_quiet: millis("PANTRY_TYPING_QUIET_MS", defaults.typing_quiet)?,
            typing_expiry: millis("PANTRY_TYPING_EXPIRY_MS", defaults.typing_expiry)?,
            send_timeout: millis("PANTRY_SEND_TIMEOUT_MS", defaults.send_timeout)?,
            reconnect_min: millis("PANTRY_RECONNECT_MIN_MS", defaults.reconnect_min)?,
            reconnect_max: millis("PANTRY_RECONNECT_MAX_MS", defaults.reconnect_max)?,
            sidebar_refresh: Duration::from_secs(try_load(
                "PANTRY_SIDEBAR_REFRESH_SECS",
                defaults.sidebar_refresh.as_secs(),
            )?),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values the timers cannot run with.
    pub fn validate(&self) -> Result<()> {
        let periods = [
            ("PANTRY_TYPING_QUIET_MS", self.typing_quiet),
            ("PANTRY_TYPING_EXPIRY_MS", self.typing_expiry),
            ("PANTRY_SEND_TIMEOUT_MS", self.send_timeout),
            ("PANTRY_RECONNECT_MIN_MS", self.reconnect_min),
            ("PANTRY_RECONNECT_MAX_MS", self.reconnect_max),
            ("PANTRY_SIDEBAR_REFRESH_SECS", self.sidebar_refresh),
        ];
        if let Some((key, _)) = periods.iter().find(|(_, period)| period.is_zero()) {
            return Err(ClientError::Config(format!("{} must be greater than zero", key)));
        }
        if self.reconnect_min > self.reconnect_max {
            return Err(ClientError::Config(
                "PANTRY_RECONNECT_MIN_MS exceeds PANTRY_RECONNECT_MAX_MS".into(),
            ));
        }
        if self.transports.is_empty() {
            return Err(ClientError::Config("PANTRY_TRANSPORTS is empty".into()));
        }
        Ok(())
    }

    /// `{api_url}/api{endpoint}`
    pub fn endpoint(&self, endpoint: &str) -> String {
        format!("{}/api{}", self.api_url.as_str().trim_end_matches('/'), endpoint)
    }
}

fn try_load<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ClientError::Config(format!("invalid {}: {}", key, e))),
        Err(_) => {
            debug!("{} not set, using default", key);
            Ok(default)
        }
    }
}

fn millis(key: &str, default: Duration) -> Result<Duration> {
    try_load(key, default.as_millis() as u64).map(Duration::from_millis)
}
