//! Coordination store: key-value writes and pub/sub for observers.
//!
//! The resilience core only writes here, for dashboards and monitoring:
//!
//! | Key / channel                        | Content                    | TTL  |
//! |--------------------------------------|----------------------------|------|
//! | `astra:resilience:mode:{node_id}`    | [`SystemMode`] snapshot    | none |
//! | `astra:health:{node_id}`             | component health map       | 60s  |
//! | `astra:resilience:events` (channel)  | one event per mode change  |      |
//!
//! Publishing is best effort and never affects evaluation results.

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use moka::future::Cache;
use moka::Expiry;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::broadcast;

use astraguard_core::{ComponentId, NodeId};

use crate::config::duration_human;
use crate::health::ComponentHealth;
use crate::resilience::{ModeTransition, SystemMode};

/// Channel carrying mode change events.
pub const EVENTS_CHANNEL: &str = "astra:resilience:events";

pub fn mode_key(node: &NodeId) -> String {
    format!("astra:resilience:mode:{}", node)
}

pub fn health_key(node: &NodeId) -> String {
    format!("astra:health:{}", node)
}

/// Errors from the coordination store.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to encode value: {0}")]
    Encode(String),
}

impl StoreError {
    /// Whether another attempt may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// Durable key-value plus simple pub/sub.
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Write a value, expiring after `ttl` when given.
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError>;

    /// Broadcast a message. Returns how many subscribers received it.
    async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<usize, StoreError>;
}

#[derive(Clone)]
struct StoredValue {
    value: serde_json::Value,
    ttl: Option<Duration>,
}

struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(&self, _key: &String, value: &StoredValue, _created_at: Instant) -> Option<Duration> {
        value.ttl
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        value.ttl
    }
}

/// In-process store with per-entry TTL and broadcast channels.
pub struct MemoryStore {
    entries: Cache<String, StoredValue>,
    channels: Mutex<HashMap<String, broadcast::Sender<serde_json::Value>>>,
    channel_capacity: usize,
}

impl MemoryStore {
    pub fn new(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();

        Self {
            entries,
            channels: Mutex::new(HashMap::new()),
            channel_capacity: 256,
        }
    }

    pub async fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.entries.get(key).await.map(|stored| stored.value)
    }

    /// Receive every message published on `channel` from now on.
    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<serde_json::Value> {
        self.channels
            .lock()
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .subscribe()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(
        &self,
        key: &str,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<(), StoreError> {
        self.entries
            .insert(key.to_string(), StoredValue { value, ttl })
            .await;
        Ok(())
    }

    async fn publish(&self, channel: &str, message: serde_json::Value) -> Result<usize, StoreError> {
        let sender = self.channels.lock().get(channel).cloned();
        // No subscriber is not an error
        Ok(sender.and_then(|tx| tx.send(message).ok()).unwrap_or(0))
    }
}

/// State publisher configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    pub enabled: bool,

    /// Expiry of the health key
    #[serde(with = "duration_human")]
    pub health_ttl: Duration,

    /// Attempts per write
    pub max_attempts: usize,

    #[serde(with = "duration_human")]
    pub min_delay: Duration,

    #[serde(with = "duration_human")]
    pub max_delay: Duration,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            health_ttl: Duration::from_secs(60),
            max_attempts: 3,
            min_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Mode change event published on [`EVENTS_CHANNEL`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModeEvent {
    pub node_id: NodeId,
    #[serde(flatten)]
    pub transition: ModeTransition,
}

/// Writes mode and health to a coordination store.
pub struct StatePublisher {
    store: Arc<dyn CoordinationStore>,
    node_id: NodeId,
    config: PublisherConfig,
    published_transitions: AtomicU64,
    /// Held for a whole mode publish so events go out once, in order
    publish_lock: tokio::sync::Mutex<()>,
}

impl StatePublisher {
    pub fn new(store: Arc<dyn CoordinationStore>, node_id: NodeId, config: PublisherConfig) -> Self {
        Self {
            store,
            node_id,
            config,
            published_transitions: AtomicU64::new(0),
            publish_lock: tokio::sync::Mutex::new(()),
        }
    }

    fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(self.config.min_delay)
            .with_max_delay(self.config.max_delay)
            .with_max_times(self.config.max_attempts.saturating_sub(1))
            .with_jitter()
    }

    async fn put(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<(), StoreError> {
        let store = &self.store;
        let value = &value;

        (move || async move { store.put(key, value.clone(), ttl).await })
            .retry(self.backoff())
            .when(StoreError::is_transient)
            .notify(|err: &StoreError, delay: Duration| {
                tracing::debug!(key, error = %err, delay_ms = delay.as_millis() as u64, "Retrying store write");
            })
            .await
    }

    async fn broadcast(&self, message: serde_json::Value) -> Result<usize, StoreError> {
        let store = &self.store;
        let message = &message;

        (move || async move { store.publish(EVENTS_CHANNEL, message.clone()).await })
            .retry(self.backoff())
            .when(StoreError::is_transient)
            .await
    }

    /// Write the mode snapshot and announce transitions not yet announced.
    ///
    /// A snapshot older than the last one published is skipped.
    pub async fn publish_mode(&self, mode: &SystemMode) -> Result<(), StoreError> {
        let _guard = self.publish_lock.lock().await;

        let already = self.published_transitions.load(Ordering::SeqCst);
        if mode.transitions < already {
            tracing::debug!(
                transitions = mode.transitions,
                published = already,
                "Skipping stale mode snapshot"
            );
            return Ok(());
        }

        let snapshot = serde_json::to_value(mode).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.put(&mode_key(&self.node_id), snapshot, None).await?;

        let fresh = mode.transitions.saturating_sub(already);
        let fresh = usize::try_from(fresh).unwrap_or(usize::MAX).min(mode.history.len());
        for transition in mode.history.iter().skip(mode.history.len() - fresh) {
            let event = ModeEvent {
                node_id: self.node_id.clone(),
                transition: transition.clone(),
            };
            let message = serde_json::to_value(&event).map_err(|e| StoreError::Encode(e.to_string()))?;
            self.broadcast(message).await?;
        }
        self.published_transitions.store(mode.transitions, Ordering::SeqCst);
        Ok(())
    }

    /// Write the component health map with the configured TTL.
    pub async fn publish_health(
        &self,
        health: &BTreeMap<ComponentId, ComponentHealth>,
    ) -> Result<(), StoreError> {
        let value = serde_json::to_value(health).map_err(|e| StoreError::Encode(e.to_string()))?;
        self.put(&health_key(&self.node_id), value, Some(self.config.health_ttl))
            .await
    }

    /// Publish both, logging instead of failing.
    pub async fn publish(&self, mode: &SystemMode, health: &BTreeMap<ComponentId, ComponentHealth>) {
        if !self.config.enabled {
            return;
        }
        if let Err(e) = self.publish_mode(mode).await {
            tracing::warn!(error = %e, "Failed to publish mode");
        }
        if let Err(e) = self.publish_health(health).await {
            tracing::warn!(error = %e, "Failed to publish health");
        }
    }
}
