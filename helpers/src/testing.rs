//! In-memory test doubles for the streams client boundary, used by
//! unit tests across the workspace. Kept in the library so that the
//! coordinator and execution engine crates can share one fake broker
//! implementation instead of each maintaining their own.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
};

use async_trait::async_trait;
use redis::RedisError;

use crate::{
    consumers::StreamMessage,
    redis::{PendingConsumer, PendingEntry, PendingSummary, StreamsClient, StreamsClientError},
};

#[derive(Debug, Clone)]
struct PelRecord {
    consumer: String,
    idle_ms: u64,
    delivery_count: u64,
}

#[derive(Debug, Default)]
struct GroupState {
    next_index: usize,
    pel: HashMap<String, PelRecord>,
}

/// A single acknowledgement observed by the fake broker.
#[derive(Debug, Clone, PartialEq)]
pub struct AckRecord {
    pub stream: String,
    pub group: String,
    pub message_id: String,
}

#[derive(Default)]
struct FakeState {
    streams: HashMap<String, Vec<StreamMessage>>,
    next_seq: u64,
    groups: HashMap<(String, String), GroupState>,
    kv: HashMap<String, String>,
    acked: Vec<AckRecord>,
    xadd_failures: HashMap<String, u32>,
    renew_results: VecDeque<bool>,
    set_nx_results: VecDeque<bool>,
}

/// An in-memory stand-in for the Redis streams broker.
///
/// Entries, consumer groups and the pending entries list behave like
/// the real broker for the commands the control plane uses; failure
/// injection knobs cover the error paths that matter (publish
/// failures, lost lock renewals, contested lock acquisition).
#[derive(Default)]
pub struct FakeStreamsClient {
    state: Mutex<FakeState>,
}

fn broker_error(message: &str) -> StreamsClientError {
    StreamsClientError::Redis(RedisError::from((
        redis::ErrorKind::IoError,
        "fake broker",
        message.to_string(),
    )))
}

impl FakeStreamsClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the next `times` xadd calls against `stream` to fail.
    pub fn fail_next_xadd(&self, stream: &str, times: u32) {
        let mut state = self.state.lock().unwrap();
        state.xadd_failures.insert(stream.to_string(), times);
    }

    /// Queues forced results for upcoming owner-qualified renewals.
    /// Once the queue drains, renewals fall back to comparing against
    /// the stored key value.
    pub fn queue_renew_results(&self, results: &[bool]) {
        let mut state = self.state.lock().unwrap();
        state.renew_results.extend(results.iter().copied());
    }

    /// Queues forced results for upcoming set-if-absent calls.
    pub fn queue_set_nx_results(&self, results: &[bool]) {
        let mut state = self.state.lock().unwrap();
        state.set_nx_results.extend(results.iter().copied());
    }

    /// Seeds a delivered-but-unacknowledged message owned by `consumer`
    /// into a group's pending entries list.
    pub fn seed_pending(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        message: StreamMessage,
        idle_ms: u64,
        delivery_count: u64,
    ) {
        let mut state = self.state.lock().unwrap();
        let message_id = message.id.clone();
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(message);
        let group_state = state
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_default();
        group_state.pel.insert(
            message_id,
            PelRecord {
                consumer: consumer.to_string(),
                idle_ms,
                delivery_count,
            },
        );
        // Seeded entries count as already delivered to the group.
        let delivered = state
            .streams
            .get(stream)
            .map(|entries| entries.len())
            .unwrap_or(0);
        state
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
            .unwrap()
            .next_index = delivered;
    }

    /// All entries currently stored in a stream, in append order.
    pub fn entries(&self, stream: &str) -> Vec<StreamMessage> {
        let state = self.state.lock().unwrap();
        state.streams.get(stream).cloned().unwrap_or_default()
    }

    /// All acknowledgements observed, in order.
    pub fn acks(&self) -> Vec<AckRecord> {
        let state = self.state.lock().unwrap();
        state.acked.clone()
    }

    /// Message IDs still pending for a group, with their owners.
    pub fn pending_owners(&self, stream: &str, group: &str) -> Vec<(String, String)> {
        let state = self.state.lock().unwrap();
        let mut pending = state
            .groups
            .get(&(stream.to_string(), group.to_string()))
            .map(|group_state| {
                group_state
                    .pel
                    .iter()
                    .map(|(id, record)| (id.clone(), record.consumer.clone()))
                    .collect::<Vec<(String, String)>>()
            })
            .unwrap_or_default();
        pending.sort();
        pending
    }

    pub fn kv_get(&self, key: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.kv.get(key).cloned()
    }

    pub fn kv_set(&self, key: &str, value: &str) {
        let mut state = self.state.lock().unwrap();
        state.kv.insert(key.to_string(), value.to_string());
    }
}

#[async_trait]
impl StreamsClient for FakeStreamsClient {
    async fn xadd(
        &self,
        stream: &str,
        fields: &[(String, String)],
    ) -> Result<String, StreamsClientError> {
        let mut state = self.state.lock().unwrap();

        if let Some(remaining) = state.xadd_failures.get_mut(stream) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(broker_error("forced xadd failure"));
            }
        }

        state.next_seq += 1;
        let id = format!("{}-0", state.next_seq);
        let message = StreamMessage::new(
            id.clone(),
            fields.iter().cloned().collect::<HashMap<String, String>>(),
        );
        state
            .streams
            .entry(stream.to_string())
            .or_default()
            .push(message);
        Ok(id)
    }

    async fn xack(
        &self,
        stream: &str,
        group: &str,
        id: &str,
    ) -> Result<u64, StreamsClientError> {
        let mut state = self.state.lock().unwrap();
        let removed = state
            .groups
            .get_mut(&(stream.to_string(), group.to_string()))
            .map(|group_state| group_state.pel.remove(id).is_some())
            .unwrap_or(false);

        if removed {
            state.acked.push(AckRecord {
                stream: stream.to_string(),
                group: group.to_string(),
                message_id: id.to_string(),
            });
            Ok(1)
        } else {
            Ok(0)
        }
    }

    async fn xread_group(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamMessage>, StreamsClientError> {
        let mut state = self.state.lock().unwrap();
        let entries = state.streams.get(stream).cloned().unwrap_or_default();
        let group_state = state
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_default();

        let start = group_state.next_index.min(entries.len());
        let end = (start + count).min(entries.len());
        let delivered: Vec<StreamMessage> = entries[start..end].to_vec();

        for message in &delivered {
            group_state.pel.insert(
                message.id.clone(),
                PelRecord {
                    consumer: consumer.to_string(),
                    idle_ms: 0,
                    delivery_count: 1,
                },
            );
        }
        group_state.next_index = end;

        Ok(delivered)
    }

    async fn xpending_summary(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<PendingSummary, StreamsClientError> {
        let state = self.state.lock().unwrap();
        let group_state = match state.groups.get(&(stream.to_string(), group.to_string())) {
            Some(group_state) => group_state,
            None => return Ok(PendingSummary::default()),
        };

        let mut by_consumer: HashMap<String, u64> = HashMap::new();
        for record in group_state.pel.values() {
            *by_consumer.entry(record.consumer.clone()).or_default() += 1;
        }

        let mut consumers: Vec<PendingConsumer> = by_consumer
            .into_iter()
            .map(|(name, pending)| PendingConsumer { name, pending })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(PendingSummary {
            total: group_state.pel.len() as u64,
            consumers,
        })
    }

    async fn xpending_range(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>, StreamsClientError> {
        let state = self.state.lock().unwrap();
        let group_state = match state.groups.get(&(stream.to_string(), group.to_string())) {
            Some(group_state) => group_state,
            None => return Ok(vec![]),
        };

        let mut entries: Vec<PendingEntry> = group_state
            .pel
            .iter()
            .filter(|(_, record)| record.consumer == consumer)
            .map(|(id, record)| PendingEntry {
                message_id: id.clone(),
                consumer: record.consumer.clone(),
                idle_ms: record.idle_ms,
                delivery_count: record.delivery_count,
            })
            .collect();
        entries.sort_by(|a, b| a.message_id.cmp(&b.message_id));
        entries.truncate(count);

        Ok(entries)
    }

    async fn xclaim(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle_ms: u64,
        ids: &[String],
    ) -> Result<Vec<StreamMessage>, StreamsClientError> {
        let mut state = self.state.lock().unwrap();
        let entries = state.streams.get(stream).cloned().unwrap_or_default();
        let group_state = state
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_default();

        let mut claimed = Vec::new();
        for id in ids {
            if let Some(record) = group_state.pel.get_mut(id) {
                if record.idle_ms >= min_idle_ms {
                    record.consumer = consumer.to_string();
                    record.delivery_count += 1;
                    record.idle_ms = 0;
                    if let Some(message) = entries.iter().find(|message| &message.id == id) {
                        claimed.push(message.clone());
                    }
                }
            }
        }

        Ok(claimed)
    }

    async fn create_consumer_group(
        &self,
        stream: &str,
        group: &str,
    ) -> Result<(), StreamsClientError> {
        let mut state = self.state.lock().unwrap();
        state.streams.entry(stream.to_string()).or_default();
        state
            .groups
            .entry((stream.to_string(), group.to_string()))
            .or_default();
        Ok(())
    }

    async fn set_nx(
        &self,
        key: &str,
        value: &str,
        _ttl_seconds: u64,
    ) -> Result<bool, StreamsClientError> {
        let mut state = self.state.lock().unwrap();

        if let Some(forced) = state.set_nx_results.pop_front() {
            if forced {
                state.kv.insert(key.to_string(), value.to_string());
            }
            return Ok(forced);
        }

        if state.kv.contains_key(key) {
            return Ok(false);
        }
        state.kv.insert(key.to_string(), value.to_string());
        Ok(true)
    }

    async fn renew_lock_if_owner(
        &self,
        key: &str,
        value: &str,
        _ttl_seconds: u64,
    ) -> Result<bool, StreamsClientError> {
        let mut state = self.state.lock().unwrap();

        if let Some(forced) = state.renew_results.pop_front() {
            return Ok(forced);
        }

        Ok(state.kv.get(key).map(String::as_str) == Some(value))
    }

    async fn release_lock_if_owner(
        &self,
        key: &str,
        value: &str,
    ) -> Result<bool, StreamsClientError> {
        let mut state = self.state.lock().unwrap();
        if state.kv.get(key).map(String::as_str) == Some(value) {
            state.kv.remove(key);
            return Ok(true);
        }
        Ok(false)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StreamsClientError> {
        let state = self.state.lock().unwrap();
        Ok(state.kv.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), StreamsClientError> {
        let mut state = self.state.lock().unwrap();
        state.kv.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn del(&self, key: &str) -> Result<(), StreamsClientError> {
        let mut state = self.state.lock().unwrap();
        state.kv.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test_log::test(tokio::test)]
    async fn test_group_read_tracks_pending_until_acked() {
        let client = FakeStreamsClient::new();
        client
            .create_consumer_group("stream:test", "group-a")
            .await
            .unwrap();

        let id = client
            .xadd(
                "stream:test",
                &[("data".to_string(), "{}".to_string())],
            )
            .await
            .unwrap();

        let messages = client
            .xread_group("stream:test", "group-a", "consumer-1", 10, 0)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            client.pending_owners("stream:test", "group-a"),
            vec![(id.clone(), "consumer-1".to_string())]
        );

        // A second read delivers nothing new.
        let messages = client
            .xread_group("stream:test", "group-a", "consumer-1", 10, 0)
            .await
            .unwrap();
        assert!(messages.is_empty());

        client.xack("stream:test", "group-a", &id).await.unwrap();
        assert!(client.pending_owners("stream:test", "group-a").is_empty());
    }

    #[test_log::test(tokio::test)]
    async fn test_claim_respects_idle_threshold() {
        let client = FakeStreamsClient::new();
        let message = StreamMessage::from_pairs("9-0", &[("data", "{}")]);
        client.seed_pending("stream:test", "group-a", "crashed", message, 30_000, 2);

        let claimed = client
            .xclaim(
                "stream:test",
                "group-a",
                "consumer-1",
                60_000,
                &["9-0".to_string()],
            )
            .await
            .unwrap();
        assert!(claimed.is_empty());

        let claimed = client
            .xclaim(
                "stream:test",
                "group-a",
                "consumer-1",
                10_000,
                &["9-0".to_string()],
            )
            .await
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(
            client.pending_owners("stream:test", "group-a"),
            vec![("9-0".to_string(), "consumer-1".to_string())]
        );
    }

    #[test_log::test(tokio::test)]
    async fn test_lock_ownership_semantics() {
        let client = FakeStreamsClient::new();

        assert!(client.set_nx("lock", "a", 30).await.unwrap());
        assert!(!client.set_nx("lock", "b", 30).await.unwrap());

        assert!(client.renew_lock_if_owner("lock", "a", 30).await.unwrap());
        assert!(!client.renew_lock_if_owner("lock", "b", 30).await.unwrap());

        assert!(!client.release_lock_if_owner("lock", "b").await.unwrap());
        assert!(client.release_lock_if_owner("lock", "a").await.unwrap());
        assert_eq!(client.kv_get("lock"), None);
    }
}
