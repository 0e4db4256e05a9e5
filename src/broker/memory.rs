//! In-process broker: pub/sub via `tokio::sync::broadcast`, keyed storage
//! via `parking_lot::RwLock<HashMap<..>>`. This is the broker this crate
//! ships and tests against; a Redis-backed transport would satisfy the
//! same [`Broker`] trait.

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;

use super::{Broker, Delivery, Subscription};
use crate::codec::Envelope;
use crate::error::TransportError;

const CHANNEL_CAPACITY: usize = 1024;

fn glob_to_regex(pattern: &str) -> Regex {
    let escaped = regex::escape(pattern).replace("\\*", ".*");
    Regex::new(&format!("^{escaped}$")).expect("glob pattern compiles to valid regex")
}

struct Topic {
    sender: broadcast::Sender<Delivery>,
}

/// In-memory implementation of [`Broker`].
pub struct MemoryBroker {
    topics: RwLock<HashMap<String, Topic>>,
    values: RwLock<HashMap<String, Envelope>>,
    lists: RwLock<HashMap<String, Vec<Envelope>>>,
    streams: RwLock<HashMap<String, Vec<Envelope>>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            values: RwLock::new(HashMap::new()),
            lists: RwLock::new(HashMap::new()),
            streams: RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<Delivery> {
        if let Some(entry) = self.topics.read().get(topic) {
            return entry.sender.clone();
        }
        let mut topics = self.topics.write();
        topics
            .entry(topic.to_string())
            .or_insert_with(|| Topic {
                sender: broadcast::channel(CHANNEL_CAPACITY).0,
            })
            .sender
            .clone()
    }

    fn publish_raw(&self, topic: &str, envelope: Envelope) {
        let sender = self.sender_for(topic);
        // No active subscribers is not an error: the dual-write convention
        // exists precisely so late subscribers recover state from `get`.
        let _ = sender.send(Delivery {
            topic: topic.to_string(),
            envelope,
        });
    }
}

/// Subscription backed by a single `broadcast::Receiver`.
pub struct BroadcastSubscription {
    receiver: broadcast::Receiver<Delivery>,
}

#[async_trait]
impl Subscription for BroadcastSubscription {
    async fn recv(&mut self) -> Option<Delivery> {
        loop {
            match self.receiver.recv().await {
                Ok(delivery) => return Some(delivery),
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Subscription that fans in every currently-matching topic for a pattern.
/// New topics created after the `psubscribe` call are not retroactively
/// joined, matching Redis `PSUBSCRIBE` semantics for topics that already
/// existed versus ones created later would normally also match; this
/// in-memory broker only looks back at topics that have been published to
/// at least once.
pub struct PatternSubscription {
    receivers: Vec<broadcast::Receiver<Delivery>>,
    pattern: Regex,
}

#[async_trait]
impl Subscription for PatternSubscription {
    async fn recv(&mut self) -> Option<Delivery> {
        if self.receivers.is_empty() {
            return None;
        }
        loop {
            let futures: Vec<_> = self
                .receivers
                .iter_mut()
                .map(|rx| Box::pin(rx.recv()))
                .collect();
            let (result, _, _) = futures::future::select_all(futures).await;
            match result {
                Ok(delivery) if self.pattern.is_match(&delivery.topic) => return Some(delivery),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    if self.receivers.len() <= 1 {
                        return None;
                    }
                    continue;
                }
            }
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.publish_raw(&format!("{topic}:sub"), envelope);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let sender = self.sender_for(&format!("{topic}:sub"));
        Ok(Box::new(BroadcastSubscription {
            receiver: sender.subscribe(),
        }))
    }

    async fn psubscribe(&self, pattern: &str) -> Result<Box<dyn Subscription>, TransportError> {
        let full_pattern = format!("{pattern}:sub");
        let regex = glob_to_regex(&full_pattern);
        let topics = self.topics.read();
        let receivers: Vec<_> = topics
            .iter()
            .filter(|(topic, _)| regex.is_match(topic))
            .map(|(_, topic)| topic.sender.subscribe())
            .collect();
        Ok(Box::new(PatternSubscription {
            receivers,
            pattern: regex,
        }))
    }

    async fn set(&self, key: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.values.write().insert(format!("{key}:val"), envelope);
        Ok(())
    }

    async fn set_and_publish(&self, key: &str, envelope: Envelope) -> Result<(), TransportError> {
        // Pipelined dual-write: publish and set as one atomic step from the
        // caller's perspective (spec §4.2, §5).
        self.values
            .write()
            .insert(format!("{key}:val"), envelope.clone());
        self.publish_raw(&format!("{key}:sub"), envelope);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Envelope>, TransportError> {
        Ok(self.values.read().get(&format!("{key}:val")).cloned())
    }

    async fn lpush(&self, key: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.lists
            .write()
            .entry(format!("{key}:val"))
            .or_default()
            .insert(0, envelope);
        Ok(())
    }

    async fn rpush(&self, key: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.lists
            .write()
            .entry(format!("{key}:val"))
            .or_default()
            .push(envelope);
        Ok(())
    }

    async fn lrange(
        &self,
        key: &str,
        start: isize,
        end: isize,
    ) -> Result<Vec<Envelope>, TransportError> {
        let lists = self.lists.read();
        let Some(list) = lists.get(&format!("{key}:val")) else {
            return Ok(Vec::new());
        };
        let len = list.len() as isize;
        let norm = |i: isize| -> usize {
            if i < 0 {
                (len + i).max(0) as usize
            } else {
                i.min(len) as usize
            }
        };
        let start_idx = norm(start);
        let end_idx = (norm(end) + 1).min(list.len());
        if start_idx >= end_idx {
            return Ok(Vec::new());
        }
        Ok(list[start_idx..end_idx].to_vec())
    }

    async fn stream_append(&self, key: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.streams.write().entry(key.to_string()).or_default().push(envelope);
        Ok(())
    }

    async fn stream_range(&self, key: &str) -> Result<Vec<Envelope>, TransportError> {
        Ok(self.streams.read().get(key).cloned().unwrap_or_default())
    }

    async fn keys_matching(&self, pattern: &str) -> Result<Vec<String>, TransportError> {
        let regex = glob_to_regex(pattern);
        let mut found: Vec<String> = self
            .values
            .read()
            .keys()
            .filter(|k| regex.is_match(k))
            .map(|k| k.strip_suffix(":val").unwrap_or(k).to_string())
            .collect();
        found.sort();
        Ok(found)
    }

    async fn delete(&self, key: &str) -> Result<(), TransportError> {
        self.values.write().remove(&format!("{key}:val"));
        self.lists.write().remove(&format!("{key}:val"));
        self.streams.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::EnvelopeKind;
    use serde_json::json;

    fn env(v: serde_json::Value) -> Envelope {
        Envelope::new(EnvelopeKind::Alarm, v, Default::default())
    }

    #[tokio::test]
    async fn set_and_publish_makes_value_recoverable_by_late_subscriber() {
        let broker = MemoryBroker::new();
        broker
            .set_and_publish("internal/alarms", env(json!({"severity": 2})))
            .await
            .unwrap();
        let got = broker.get("internal/alarms").await.unwrap().unwrap();
        assert_eq!(got.content, json!({"severity": 2}));
    }

    #[tokio::test]
    async fn subscriber_receives_published_envelope() {
        let broker = MemoryBroker::new();
        let mut sub = broker.subscribe("scans/scan_status").await.unwrap();
        broker
            .publish("scans/scan_status", env(json!({"status": "open"})))
            .await
            .unwrap();
        let delivery = sub.recv().await.expect("delivery");
        assert_eq!(delivery.envelope.content, json!({"status": "open"}));
    }

    #[tokio::test]
    async fn lpush_and_lrange_preserve_fifo_within_one_list() {
        let broker = MemoryBroker::new();
        broker.rpush("q", env(json!(1))).await.unwrap();
        broker.rpush("q", env(json!(2))).await.unwrap();
        broker.rpush("q", env(json!(3))).await.unwrap();
        let got = broker.lrange("q", 0, -1).await.unwrap();
        let values: Vec<_> = got.into_iter().map(|e| e.content).collect();
        assert_eq!(values, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn keys_matching_supports_glob_pattern() {
        let broker = MemoryBroker::new();
        broker.set("public/s1/file/master", env(json!("a"))).await.unwrap();
        broker.set("public/s1/file/log", env(json!("b"))).await.unwrap();
        broker.set("public/s2/file/master", env(json!("c"))).await.unwrap();
        let keys = broker.keys_matching("public/s1/file/*").await.unwrap();
        assert_eq!(keys.len(), 2);
    }
}
