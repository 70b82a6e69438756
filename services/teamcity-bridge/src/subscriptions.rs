//! Channel subscriptions to build configurations
//!
//! The in-memory index is the read path; the [`KvStore`] is the durable copy.
//! Mutations hold the write lock across the store write, so concurrent
//! readers observe either the state before a mutation or the state after it.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::builds::BuildTypeRef;
use crate::kv::KvStore;
use crate::BridgeError;

const KEY_PREFIX: &str = "subscription:";

/// A channel's interest in one build configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub channel_id: String,
    pub build_type: BuildTypeRef,
    pub created_by: String,
    pub created_at_epoch_ms: u64,
}

type Key = (String, BuildTypeRef);

/// Subscription set, unique per (channel, build configuration)
pub struct SubscriptionStore {
    kv: Arc<dyn KvStore>,
    subscriptions: RwLock<BTreeMap<Key, Subscription>>,
}

impl std::fmt::Debug for SubscriptionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionStore").finish_non_exhaustive()
    }
}

impl SubscriptionStore {
    /// Load every persisted subscription. Entries that no longer parse are
    /// skipped with a warning rather than failing startup.
    pub async fn load(kv: Arc<dyn KvStore>) -> crate::Result<Self> {
        let mut subscriptions = BTreeMap::new();
        for (key, value) in kv.scan(KEY_PREFIX).await? {
            match serde_json::from_str::<Subscription>(&value) {
                Ok(sub) => {
                    subscriptions.insert((sub.channel_id.clone(), sub.build_type.clone()), sub);
                }
                Err(e) => tracing::warn!("Skipping unreadable subscription '{}': {}", key, e),
            }
        }
        tracing::info!("Loaded {} subscriptions", subscriptions.len());
        Ok(Self {
            kv,
            subscriptions: RwLock::new(subscriptions),
        })
    }

    /// Subscribe a channel. Returns `false` if it was already subscribed.
    pub async fn add(
        &self,
        channel_id: &str,
        build_type: &BuildTypeRef,
        user_id: &str,
    ) -> crate::Result<bool> {
        let mut subscriptions = self.subscriptions.write().await;
        let key = (channel_id.to_string(), build_type.clone());
        if subscriptions.contains_key(&key) {
            return Ok(false);
        }

        let sub = Subscription {
            channel_id: channel_id.to_string(),
            build_type: build_type.clone(),
            created_by: user_id.to_string(),
            created_at_epoch_ms: current_epoch_ms(),
        };
        let value = serde_json::to_string(&sub)?;
        self.kv
            .set(&storage_key(channel_id, build_type), &value)
            .await?;
        subscriptions.insert(key, sub);

        tracing::info!("Channel {} subscribed to {}", channel_id, build_type);
        Ok(true)
    }

    /// Unsubscribe a channel; `NotFound` if it was not subscribed
    pub async fn remove(&self, channel_id: &str, build_type: &BuildTypeRef) -> crate::Result<()> {
        let mut subscriptions = self.subscriptions.write().await;
        let key = (channel_id.to_string(), build_type.clone());
        if !subscriptions.contains_key(&key) {
            return Err(BridgeError::NotFound(format!(
                "channel {} is not subscribed to {}",
                channel_id, build_type
            )));
        }

        self.kv
            .delete(&storage_key(channel_id, build_type))
            .await?;
        subscriptions.remove(&key);

        tracing::info!("Channel {} unsubscribed from {}", channel_id, build_type);
        Ok(())
    }

    pub async fn list_by_channel(&self, channel_id: &str) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|s| s.channel_id == channel_id)
            .cloned()
            .collect()
    }

    pub async fn list_by_build_type(&self, build_type: &BuildTypeRef) -> Vec<Subscription> {
        self.subscriptions
            .read()
            .await
            .values()
            .filter(|s| &s.build_type == build_type)
            .cloned()
            .collect()
    }

    /// Distinct build configurations with at least one subscriber
    pub async fn all_build_types(&self) -> BTreeSet<BuildTypeRef> {
        self.subscriptions
            .read()
            .await
            .values()
            .map(|s| s.build_type.clone())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.subscriptions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.subscriptions.read().await.is_empty()
    }
}

fn storage_key(channel_id: &str, build_type: &BuildTypeRef) -> String {
    format!("{}{}:{}", KEY_PREFIX, channel_id, build_type)
}

pub(crate) fn current_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
