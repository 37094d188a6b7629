use crate::admission::AdmissionSettings;
use crate::error::AppError;
use crate::hub::HubSettings;
use crate::tcp::TcpSettings;
use crate::websocket::PeerSettings;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

/// Backing store for the feed hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Redis,
    /// Process-local; history is lost on restart.
    Memory,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Clone, Deserialize)]
pub struct Config {
    // Listeners
    pub tcp_addr: String,
    pub http_addr: String,
    /// Public URL prefix used in banners and page links.
    pub base_url: String,

    // Feed storage
    pub store: StoreKind,
    pub max_stream_len: usize,
    pub max_stream_persistence_secs: u64,
    pub redis_host: String,
    pub redis_port: u16,
    pub redis_password: Option<SecretString>,

    // Admission
    pub max_producers_per_origin: usize,
    pub max_peers_per_feed: usize,

    pub log_format: LogFormat,
}

impl Config {
    /// Load from `NACRE_*` environment variables, after reading a `.env` file if present.
    pub fn from_env() -> Result<Self, AppError> {
        dotenvy::dotenv().ok();
        Self::load(config::Environment::with_prefix("NACRE"))
    }

    fn load(env: config::Environment) -> Result<Self, AppError> {
        let cfg: Config = config::Config::builder()
            .set_default("tcp_addr", "0.0.0.0:1337")?
            .set_default("http_addr", "0.0.0.0:8080")?
            .set_default("base_url", "http://localhost:8080")?
            .set_default("store", "redis")?
            .set_default("max_stream_len", 1000)?
            .set_default("max_stream_persistence_secs", 86_400)? // 24h
            .set_default("redis_host", "localhost")?
            .set_default("redis_port", 6379)?
            .set_default("max_producers_per_origin", 5)?
            .set_default("max_peers_per_feed", 3)?
            .set_default("log_format", "text")?
            .add_source(env.try_parsing(true))
            .build()?
            .try_deserialize()?;

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        self.tcp_socket_addr()?;
        self.http_socket_addr()?;

        self.parsed_base_url()?;
        if self.max_stream_len == 0 {
            return Err(AppError::Config("max_stream_len must be greater than 0".into()));
        }
        if self.max_stream_persistence_secs == 0 {
            return Err(AppError::Config(
                "max_stream_persistence_secs must be greater than 0".into(),
            ));
        }
        if self.max_producers_per_origin == 0 || self.max_peers_per_feed == 0 {
            return Err(AppError::Config("admission limits must be greater than 0".into()));
        }
        if self.store == StoreKind::Redis {
            if self.redis_host.trim().is_empty() {
                return Err(AppError::Config("redis_host is required".into()));
            }
            self.redis_url()?;
        }
        Ok(())
    }

    pub fn tcp_socket_addr(&self) -> Result<SocketAddr, AppError> {
        self.tcp_addr
            .parse()
            .map_err(|e| AppError::Config(format!("invalid tcp_addr {:?}: {e}", self.tcp_addr)))
    }

    pub fn http_socket_addr(&self) -> Result<SocketAddr, AppError> {
        self.http_addr
            .parse()
            .map_err(|e| AppError::Config(format!("invalid http_addr {:?}: {e}", self.http_addr)))
    }

    /// Base URL without a trailing slash.
    pub fn public_base_url(&self) -> &str {
        self.base_url.trim_end_matches('/')
    }

    fn parsed_base_url(&self) -> Result<Url, AppError> {
        let url = Url::parse(self.base_url.trim())
            .map_err(|e| AppError::Config(format!("invalid base_url {:?}: {e}", self.base_url)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(AppError::Config(format!(
                "base_url {:?} must be an http(s) URL with a host",
                self.base_url
            )));
        }
        Ok(url)
    }

    /// `redis://[:password@]host:port/0`, with the password percent-encoded.
    pub fn redis_url(&self) -> Result<Url, AppError> {
        let invalid = |what: &str| AppError::Config(format!("invalid redis {what}"));

        let mut url = Url::parse("redis://localhost/0").map_err(|_| invalid("url"))?;
        url.set_host(Some(self.redis_host.trim()))
            .map_err(|e| AppError::Config(format!("invalid redis_host {:?}: {e}", self.redis_host)))?;
        url.set_port(Some(self.redis_port))
            .map_err(|_| invalid("port"))?;
        let password = self
            .redis_password
            .as_ref()
            .map(|p| p.expose_secret().as_str())
            .filter(|p| !p.is_empty());
        if let Some(password) = password {
            url.set_password(Some(password))
                .map_err(|_| invalid("password"))?;
        }
        Ok(url)
    }

    pub fn hub_settings(&self) -> HubSettings {
        HubSettings {
            max_stream_len: self.max_stream_len,
            stream_ttl: Duration::from_secs(self.max_stream_persistence_secs),
            ..HubSettings::default()
        }
    }

    pub fn admission_settings(&self) -> AdmissionSettings {
        AdmissionSettings {
            max_producers_per_origin: self.max_producers_per_origin,
            max_peers_per_feed: self.max_peers_per_feed,
            ..AdmissionSettings::default()
        }
    }

    pub fn tcp_settings(&self) -> TcpSettings {
        TcpSettings::default()
    }

    pub fn peer_settings(&self) -> PeerSettings {
        PeerSettings::default()
    }
}

// Hand-written so the Redis password never reaches a log line.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("tcp_addr", &self.tcp_addr)
            .field("http_addr", &self.http_addr)
            .field("base_url", &self.base_url)
            .field("store", &self.store)
            .field("max_stream_len", &self.max_stream_len)
            .field("max_stream_persistence_secs", &self.max_stream_persistence_secs)
            .field("redis_host", &self.redis_host)
            .field("redis_port", &self.redis_port)
            .field(
                "redis_password",
                &self.redis_password.as_ref().map(|_| "[REDACTED]"),
            )
            .field("max_producers_per_origin", &self.max_producers_per_origin)
            .field("max_peers_per_feed", &self.max_peers_per_feed)
            .field("log_format", &self.log_format)
            .finish()
    }
}
