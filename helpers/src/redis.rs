use std::fmt::{self, Debug};

use async_trait::async_trait;
use redis::{
    aio::MultiplexedConnection,
    cluster::ClusterClientBuilder,
    cluster_async::ClusterConnection,
    from_redis_value,
    streams::{
        StreamClaimReply, StreamId, StreamPendingCountReply, StreamPendingReply, StreamReadOptions,
        StreamReadReply,
    },
    AsyncCommands, Client, RedisError, RedisResult, Script,
};
use tracing::debug;

use crate::consumers::StreamMessage;

/// Configuration for a Redis connection.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// The nodes to use to connect to the Redis cluster or instance.
    pub nodes: Vec<String>,
    /// The password to use to connect to the Redis cluster or instance.
    pub password: Option<String>,
    /// Whether to use cluster mode for the Redis connection.
    pub cluster_mode: bool,
}

/// A summary of the pending entries list for a consumer group,
/// broken down by consumer.
#[derive(Debug, Clone, Default)]
pub struct PendingSummary {
    pub total: u64,
    pub consumers: Vec<PendingConsumer>,
}

/// The per-consumer pending count reported in a pending summary.
#[derive(Debug, Clone)]
pub struct PendingConsumer {
    pub name: String,
    pub pending: u64,
}

/// A detailed pending entries list record for a single delivered
/// but unacknowledged message.
#[derive(Debug, Clone)]
pub struct PendingEntry {
    pub message_id: String,
    pub consumer: String,
    /// Milliseconds since the message was last delivered.
    pub idle_ms: u64,
    pub delivery_count: u64,
}

/// The error type surfaced by the streams client boundary.
#[derive(Debug)]
pub enum StreamsClientError {
    Redis(RedisError),
}

impl fmt::Display for StreamsClientError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            StreamsClientError::Redis(redis_error) => {
                write!(f, "streams client error: {redis_error}")
            }
        }
    }
}

impl std::error::Error for StreamsClientError {}

impl From<RedisError> for StreamsClientError {
    fn from(error: RedisError) -> Self {
        StreamsClientError::Redis(error)
    }
}

/// The broker interface consumed by the control plane.
///
/// Everything above the wire is written against this trait so that
/// components can be exercised with an in-memory fake; the production
/// implementation is [`RedisStreamsClient`].
#[async_trait]
pub trait StreamsClient: Send + Sync {
    /// Appends an entry to a stream and returns the broker-assigned ID.
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamsClientError>;

    /// Acknowledges a delivered message for a consumer group,
    /// removing it from the pending entries list.
    async fn xack(&self, stream: &str, group: &str, id: &str)
        -> Result<u64, StreamsClientError>;

    /// Reads new messages for a consumer in a group, blocking up to
    /// `block_ms` when the stream is empty.
    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, StreamsClientError>;

    /// Returns the pending summary for a group, broken down by consumer.
    async fn xpending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StreamsClientError>;

    /// Returns detailed pending entries for one consumer in a group.
    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamsClientError>;

    /// Claims pending messages that have been idle for at least
    /// `min_idle_ms`, transferring ownership to `consumer`.
    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamsClientError>;

    /// Creates a consumer group on a stream, creating the stream
    /// if needed. A group that already exists is not an error.
    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<(), StreamsClientError>;

    /// Sets a key only if it does not exist, with a TTL in seconds.
    /// Returns true when the key was set.
    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StreamsClientError>;

    /// Atomically resets the TTL of a key only when its value equals
    /// `value`. Returns true when the TTL was reset.
    async fn renew_lock_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StreamsClientError>;

    /// Atomically deletes a key only when its value equals `value`.
    /// Returns true when the key was deleted.
    async fn release_lock_if_owner(
        &self,
        key: &str,
        value: &str,
    ) -> Result<bool, StreamsClientError>;

    async fn get(&self, key: &str) -> Result<Option<String>, StreamsClientError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StreamsClientError>;

    async fn del(&self, key: &str) -> Result<(), StreamsClientError>;
}

// Owner-qualified lock scripts. The compare step and the TTL reset or
// delete must be a single atomic unit, otherwise a replica that lost
// its lease could stomp a newer owner's lock.
const RENEW_LOCK_IF_OWNER_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("EXPIRE", KEYS[1], ARGV[2])
end
return 0
"#;

const RELEASE_LOCK_IF_OWNER_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

/// A wrapper around a Redis connection that provides a unified
/// interface for both single node and cluster mode connections
/// for the subset of commands used by the control plane.
pub enum ConnectionWrapper {
    Cluster(ClusterConnection),
    SingleNode(MultiplexedConnection),
}

impl Debug for ConnectionWrapper {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ConnectionWrapper::Cluster(_) => write!(f, "ConnectionWrapper::Cluster"),
            ConnectionWrapper::SingleNode(_) => write!(f, "ConnectionWrapper::SingleNode"),
        }
    }
}

impl Clone for ConnectionWrapper {
    fn clone(&self) -> Self {
        match self {
            ConnectionWrapper::Cluster(conn) => ConnectionWrapper::Cluster(conn.clone()),
            ConnectionWrapper::SingleNode(conn) => ConnectionWrapper::SingleNode(conn.clone()),
        }
    }
}

impl ConnectionWrapper {
    async fn xadd(
        &mut self,
        stream: &str,
        fields: &[(String, String)],
    ) -> RedisResult<String> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xadd(stream, "*", fields).await,
            ConnectionWrapper::SingleNode(conn) => conn.xadd(stream, "*", fields).await,
        }
    }

    async fn xack(&mut self, stream: &str, group: &str, id: &str) -> RedisResult<u64> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xack(stream, group, &[id]).await,
            ConnectionWrapper::SingleNode(conn) => conn.xack(stream, group, &[id]).await,
        }
    }

    async fn xread_group(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> RedisResult<StreamReadReply> {
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);

        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xread_options(&[stream], &[">"], &options).await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xread_options(&[stream], &[">"], &options).await
            }
        }
    }

    async fn xpending(&mut self, stream: &str, group: &str) -> RedisResult<StreamPendingReply> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.xpending(stream, group).await,
            ConnectionWrapper::SingleNode(conn) => conn.xpending(stream, group).await,
        }
    }

    async fn xpending_consumer_count(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> RedisResult<StreamPendingCountReply> {
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xpending_consumer_count(stream, group, "-", "+", count, consumer)
                    .await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xpending_consumer_count(stream, group, "-", "+", count, consumer)
                    .await
            }
        }
    }

    async fn xclaim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> RedisResult<StreamClaimReply> {
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xclaim(stream, group, consumer, min_idle_ms as usize, ids)
                    .await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xclaim(stream, group, consumer, min_idle_ms as usize, ids)
                    .await
            }
        }
    }

    async fn xgroup_create_mkstream(&mut self, stream: &str, group: &str) -> RedisResult<String> {
        match self {
            ConnectionWrapper::Cluster(conn) => {
                conn.xgroup_create_mkstream(stream, group, "0").await
            }
            ConnectionWrapper::SingleNode(conn) => {
                conn.xgroup_create_mkstream(stream, group, "0").await
            }
        }
    }

    async fn set_nx_ex(
        &mut self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> RedisResult<bool> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value).arg("NX").arg("EX").arg(ttl_seconds);

        let result: Option<String> = match self {
            ConnectionWrapper::Cluster(conn) => cmd.query_async(conn).await?,
            ConnectionWrapper::SingleNode(conn) => cmd.query_async(conn).await?,
        };

        Ok(result.is_some())
    }

    async fn eval_script_i64(
        &mut self,
        script: &str,
        keys: &[&str],
        args: &[&str],
    ) -> RedisResult<i64> {
        let script_obj = Script::new(script);
        let mut invocation = script_obj.prepare_invoke();
        for key in keys {
            invocation.key(*key);
        }
        for arg in args {
            invocation.arg(*arg);
        }

        match self {
            ConnectionWrapper::Cluster(conn) => invocation.invoke_async(conn).await,
            ConnectionWrapper::SingleNode(conn) => invocation.invoke_async(conn).await,
        }
    }

    async fn get(&mut self, key: &str) -> RedisResult<Option<String>> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.get(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.get(key).await,
        }
    }

    async fn set(&mut self, key: &str, value: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.set(key, value).await,
            ConnectionWrapper::SingleNode(conn) => conn.set(key, value).await,
        }
    }

    async fn del(&mut self, key: &str) -> RedisResult<()> {
        match self {
            ConnectionWrapper::Cluster(conn) => conn.del(key).await,
            ConnectionWrapper::SingleNode(conn) => conn.del(key).await,
        }
    }
}

/// The production implementation of [`StreamsClient`] backed by a
/// Redis cluster or single-node connection.
pub struct RedisStreamsClient {
    connection: ConnectionWrapper,
}

impl Debug for RedisStreamsClient {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "RedisStreamsClient({:?})", self.connection)
    }
}

impl RedisStreamsClient {
    pub fn new(connection: ConnectionWrapper) -> Self {
        RedisStreamsClient { connection }
    }
}

fn stream_message_from_entry(entry: &StreamId) -> StreamMessage {
    let fields = entry
        .map
        .iter()
        .map(|(name, value)| {
            (
                name.clone(),
                from_redis_value::<String>(value).unwrap_or_default(),
            )
        })
        .collect();
    StreamMessage::new(entry.id.clone(), fields)
}

#[async_trait]
impl StreamsClient for RedisStreamsClient {
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamsClientError> {
        let mut conn = self.connection.clone();
        Ok(conn.xadd(stream, fields).await?)
    }

    async fn xack(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<u64, StreamsClientError> {
        let mut conn = self.connection.clone();
        Ok(conn.xack(stream, group, id).await?)
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamMessage>, StreamsClientError> {
        let mut conn = self.connection.clone();
        let reply = conn
            .xread_group(stream, group, consumer, count, block_ms)
            .await?;

        let messages = reply
            .keys
            .first()
            .map(|key| key.ids.iter().map(stream_message_from_entry).collect())
            .unwrap_or_default();

        Ok(messages)
    }

    async fn xpending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StreamsClientError> {
        let mut conn = self.connection.clone();
        let reply = conn.xpending(stream, group).await?;

        match reply {
            StreamPendingReply::Empty => Ok(PendingSummary::default()),
            StreamPendingReply::Data(data) => Ok(PendingSummary {
                total: data.count as u64,
                consumers: data
                    .consumers
                    .iter()
                    .map(|consumer| PendingConsumer {
                        name: consumer.name.clone(),
                        pending: consumer.pending as u64,
                    })
                    .collect(),
            }),
        }
    }

    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamsClientError> {
        let mut conn = self.connection.clone();
        let reply = conn
            .xpending_consumer_count(stream, group, consumer, count)
            .await?;

        Ok(reply
            .ids
            .iter()
            .map(|pending_id| PendingEntry {
                message_id: pending_id.id.clone(),
                consumer: pending_id.consumer.clone(),
                idle_ms: pending_id.last_delivered_ms as u64,
                delivery_count: pending_id.times_delivered as u64,
            })
            .collect())
    }

    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamsClientError> {
        if ids.is_empty() {
            return Ok(vec![]);
        }

        let mut conn = self.connection.clone();
        let reply = conn
            .xclaim(stream, group, consumer, min_idle_ms, ids)
            .await?;

        Ok(reply.ids.iter().map(stream_message_from_entry).collect())
    }

    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<(), StreamsClientError> {
        let mut conn = self.connection.clone();
        match conn.xgroup_create_mkstream(stream, group).await {
            Ok(_) => Ok(()),
            // The group surviving a previous run of this process
            // is the normal restart path.
            Err(err) if err.code() == Some("BUSYGROUP") => {
                debug!(stream, group, "consumer group already exists");
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StreamsClientError> {
        let mut conn = self.connection.clone();
        Ok(conn.set_nx_ex(key, value, ttl_seconds).await?)
    }

    async fn renew_lock_if_owner(
        &self,
        key: &str,
        value: &str,
        ttl_seconds: u64,
    ) -> Result<bool, StreamsClientError> {
        let mut conn = self.connection.clone();
        let renewed = conn
            .eval_script_i64(
                RENEW_LOCK_IF_OWNER_SCRIPT,
                &[key],
                &[value, &ttl_seconds.to_string()],
            )
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lock_if_owner(
        &self,
        key: &str,
        value: &str,
    ) -> Result<bool, StreamsClientError> {
        let mut conn = self.connection.clone();
        let released = conn
            .eval_script_i64(RELEASE_LOCK_IF_OWNER_SCRIPT, &[key], &[value])
            .await?;
        Ok(released == 1)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StreamsClientError> {
        let mut conn = self.connection.clone();
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StreamsClientError> {
        let mut conn = self.connection.clone();
        Ok(conn.set(key, value).await?)
    }

    async fn del(&self, key: &str) -> Result<(), StreamsClientError> {
        let mut conn = self.connection.clone();
        Ok(conn.del(key).await?)
    }
}

/// Creates a connection to a Redis cluster or instance based on
/// the provided connection configuration.
pub async fn get_redis_connection(
    conn_config: &ConnectionConfig,
) -> RedisResult<ConnectionWrapper> {
    if !conn_config.cluster_mode {
        let client = Client::open(conn_config.nodes[0].clone())?;
        return Ok(ConnectionWrapper::SingleNode(
            client.get_multiplexed_async_connection().await?,
        ));
    }

    let mut builder = ClusterClientBuilder::new(conn_config.nodes.clone());
    if let Some(password) = conn_config.password.clone() {
        builder = builder.password(password);
    }

    let client = builder.build()?;
    Ok(ConnectionWrapper::Cluster(
        client.get_async_connection().await?,
    ))
}
