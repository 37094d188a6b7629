use anyhow::{Context, Result};
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::{Client, ConnectionInfo, IntoConnectionInfo, RedisError, RedisResult};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::Duration;
use tracing::info;
use url::Url;

/// Shared Redis connection manager guarded by a Tokio mutex.
pub type SharedConnectionManager = Arc<Mutex<ConnectionManager>>;

/// Default upper bound for a single non-blocking Redis round trip.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis connection pool.
///
/// Short commands go through the shared [`ConnectionManager`], which reconnects on
/// its own. Commands that park the connection server-side (`XREAD BLOCK`, `BLPOP`)
/// must use [`RedisPool::dedicated_connection`] instead, otherwise every other
/// caller multiplexed on the shared connection stalls behind them.
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: SharedConnectionManager,
}

impl RedisPool {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let info: ConnectionInfo = redis_url
            .into_connection_info()
            .context("failed to parse Redis connection string")?;

        let client = Client::open(info).context("failed to construct Redis client")?;
        let connection_manager = ConnectionManager::new(client.clone())
            .await
            .context("failed to initialize Redis connection manager")?;

        info!(url = %redact_url(redis_url), "Redis connection manager initialized");

        Ok(Self {
            client,
            manager: Arc::new(Mutex::new(connection_manager)),
        })
    }

    pub fn manager(&self) -> SharedConnectionManager {
        self.manager.clone()
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Open a fresh connection owned by a single caller.
    pub async fn dedicated_connection(&self) -> RedisResult<MultiplexedConnection> {
        self.client.get_multiplexed_async_connection().await
    }

    /// Round-trip a `PING` through the shared manager.
    pub async fn ping(&self) -> RedisResult<()> {
        let mut conn = self.manager.lock().await.clone();
        with_timeout(DEFAULT_COMMAND_TIMEOUT, async move {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await
        .map(|_| ())
    }
}

/// Bound a Redis future by `duration`, surfacing an elapsed timer as an I/O error.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(duration, future).await {
        Ok(result) => result,
        Err(_) => Err(RedisError::from((
            redis::ErrorKind::IoError,
            "redis command timed out",
        ))),
    }
}

/// Mask the password of a Redis URL so it can be logged. Input that does not
/// parse is replaced wholesale, since it may still carry a secret.
pub fn redact_url(raw: &str) -> String {
    let Ok(mut url) = Url::parse(raw) else {
        return "<unparseable redis url>".to_string();
    };
    if url.password().is_some() && url.set_password(Some("***")).is_err() {
        return "<unparseable redis url>".to_string();
    }
    url.to_string()
}
