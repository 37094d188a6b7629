//! Redis Streams adapter.
//!
//! Each feed is a stream at `nacre:feed:{id}` whose entries carry the chunk under
//! a single `data` field; the producer liveness record is a plain string key at
//! `nacre:client:{id}` with a short expiry.

use super::tail::{spawn_tail, TailSource};
use super::{client_key, stream_key, ClientState, FeedReceiver, Hub, HubError, HubSettings};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::AsyncCommands;
use redis_utils::{with_timeout, RedisPool, DEFAULT_COMMAND_TIMEOUT};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DATA_FIELD: &str = "data";

/// Extra time a blocking read gets on top of its server-side `BLOCK` before the
/// client gives up on the round trip.
const BLOCK_SLACK: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisHub {
    pool: RedisPool,
    settings: HubSettings,
}

impl RedisHub {
    pub fn new(pool: RedisPool, settings: HubSettings) -> Self {
        Self { pool, settings }
    }

    pub async fn connect(redis_url: &str, settings: HubSettings) -> anyhow::Result<Self> {
        let pool = RedisPool::connect(redis_url).await?;
        Ok(Self::new(pool, settings))
    }

    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    async fn conn(&self) -> ConnectionManager {
        self.pool.manager().lock().await.clone()
    }
}

#[async_trait]
impl Hub for RedisHub {
    async fn feed_exists(&self, id: &str) -> Result<bool, HubError> {
        let mut conn = self.conn().await;
        let key = stream_key(id);
        let found: i64 =
            with_timeout(DEFAULT_COMMAND_TIMEOUT, async { conn.exists(&key).await }).await?;
        Ok(found > 0)
    }

    async fn push(&self, id: &str, data: Bytes) -> Result<(), HubError> {
        let mut conn = self.conn().await;
        let key = stream_key(id);
        let ttl_secs = self.settings.stream_ttl.as_secs().max(1);

        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("XADD")
            .arg(&key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.settings.max_stream_len)
            .arg("*")
            .arg(DATA_FIELD)
            .arg(&data[..])
            .cmd("EXPIRE")
            .arg(&key)
            .arg(ttl_secs)
            .ignore();

        let (entry_id,): (String,) = with_timeout(DEFAULT_COMMAND_TIMEOUT, async {
            pipe.query_async(&mut conn).await
        })
        .await?;
        debug!(feed_id = %id, entry_id = %entry_id, bytes = data.len(), "feed entry appended");
        Ok(())
    }

    async fn listen(&self, id: &str, cancel: CancellationToken) -> Result<FeedReceiver, HubError> {
        // Blocking reads park their connection, so every tail gets its own.
        let blocking = with_timeout(DEFAULT_COMMAND_TIMEOUT, self.pool.dedicated_connection())
            .await?;
        let source = RedisTail {
            blocking,
            shared: self.conn().await,
            stream_key: stream_key(id),
            client_key: client_key(id),
        };
        Ok(spawn_tail(
            id.to_string(),
            source,
            self.settings.block_timeout,
            self.settings.channel_capacity,
            cancel,
        ))
    }

    async fn get_all(&self, id: &str) -> Result<Vec<Bytes>, HubError> {
        let mut conn = self.conn().await;
        let key = stream_key(id);
        let reply: StreamRangeReply = with_timeout(DEFAULT_COMMAND_TIMEOUT, async {
            conn.xrange_all(&key).await
        })
        .await?;
        reply.ids.iter().map(entry_payload).collect()
    }

    async fn client_state(&self, id: &str) -> Result<ClientState, HubError> {
        let mut conn = self.conn().await;
        read_client_state(&mut conn, &client_key(id)).await
    }

    async fn client_connected(&self, id: &str) -> Result<(), HubError> {
        let mut conn = self.conn().await;
        let key = client_key(id);
        let ttl_secs = self.settings.client_ttl.as_secs().max(1);
        with_timeout(DEFAULT_COMMAND_TIMEOUT, async {
            conn.set_ex::<_, _, ()>(&key, ClientState::Connected.as_str(), ttl_secs)
                .await
        })
        .await?;
        Ok(())
    }

    async fn client_disconnected(&self, id: &str) -> Result<(), HubError> {
        let mut conn = self.conn().await;
        let key = client_key(id);
        // DEL on a missing key returns 0, which is still success.
        let _removed: i64 =
            with_timeout(DEFAULT_COMMAND_TIMEOUT, async { conn.del(&key).await }).await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<(), HubError> {
        self.pool.ping().await?;
        Ok(())
    }
}

async fn read_client_state(
    conn: &mut ConnectionManager,
    key: &str,
) -> Result<ClientState, HubError> {
    let value: Option<String> =
        with_timeout(DEFAULT_COMMAND_TIMEOUT, async { conn.get(key).await }).await?;
    Ok(match value {
        None => ClientState::Disconnected,
        Some(raw) => raw.parse().unwrap_or(ClientState::Unknown),
    })
}

fn entry_payload(entry: &StreamId) -> Result<Bytes, HubError> {
    let value = entry.map.get(DATA_FIELD).ok_or_else(|| HubError::MalformedEntry {
        entry_id: entry.id.clone(),
        reason: format!("missing `{}` field", DATA_FIELD),
    })?;
    let raw: Vec<u8> =
        redis::from_redis_value(value).map_err(|e| HubError::MalformedEntry {
            entry_id: entry.id.clone(),
            reason: e.to_string(),
        })?;
    Ok(Bytes::from(raw))
}

struct RedisTail {
    blocking: MultiplexedConnection,
    shared: ConnectionManager,
    stream_key: String,
    client_key: String,
}

impl RedisTail {
    async fn xread(
        &mut self,
        cursor: &str,
        block: Option<Duration>,
    ) -> Result<Vec<(String, Bytes)>, HubError> {
        let mut cmd = redis::cmd("XREAD");
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis().max(1) as u64);
        }
        cmd.arg("STREAMS").arg(&self.stream_key).arg(cursor);

        let deadline = block.map_or(DEFAULT_COMMAND_TIMEOUT, |b| b + BLOCK_SLACK);
        let conn = &mut self.blocking;
        let reply: Option<StreamReadReply> =
            with_timeout(deadline, async { cmd.query_async(conn).await }).await?;

        let Some(reply) = reply else {
            return Ok(Vec::new());
        };
        reply
            .keys
            .iter()
            .flat_map(|stream| stream.ids.iter())
            .map(|entry| Ok((entry.id.clone(), entry_payload(entry)?)))
            .collect()
    }
}

#[async_trait]
impl TailSource for RedisTail {
    type Cursor = String;

    fn origin(&self) -> String {
        "0".to_string()
    }

    async fn read_after(&mut self, cursor: &String) -> Result<Vec<(String, Bytes)>, HubError> {
        self.xread(cursor, None).await
    }

    async fn wait_after(
        &mut self,
        cursor: &String,
        timeout: Duration,
    ) -> Result<Vec<(String, Bytes)>, HubError> {
        self.xread(cursor, Some(timeout)).await
    }

    async fn client_state(&mut self) -> Result<ClientState, HubError> {
        read_client_state(&mut self.shared, &self.client_key).await
    }
}
