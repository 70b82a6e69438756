//! Notification dispatch: one chat post per subscription of a transition

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::builds::{BuildState, BuildTypeRef};
use crate::state::StateHandle;
use crate::subscriptions::{current_epoch_ms, Subscription};

/// A message to post into a channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub channel_id: String,
    pub message: String,
    pub link: Option<String>,
}

/// A detected change in a build configuration's latest run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationEvent {
    pub build_type: BuildTypeRef,
    pub previous: Option<BuildState>,
    pub current: BuildState,
}

impl NotificationEvent {
    /// Human-readable chat message for this transition
    pub fn message(&self) -> String {
        let current = &self.current;
        let build = if current.web_url.is_empty() {
            current.display_number()
        } else {
            format!("[{}]({})", current.display_number(), current.web_url)
        };

        let mut message = format!(
            "{} **{}** build {} is **{}**",
            current.status.icon(),
            self.build_type,
            build,
            current.status
        );
        if let Some(previous) = &self.previous {
            if previous.build_id == current.build_id {
                message.push_str(&format!(" (was {})", previous.status));
            }
        }
        if let Some(finished) = current.finished_display() {
            message.push_str(&format!(", finished {}", finished));
        }
        message
    }
}

/// Record of a dispatch attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub channel_id: String,
    pub build_type: BuildTypeRef,
    pub build_id: u64,
    pub message: String,
    pub success: bool,
    pub error: Option<String>,
    pub timestamp_epoch_ms: u64,
}

/// Trait for posting to the chat server
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait ChatPoster: Send + Sync {
    async fn post(&self, post: &Post) -> crate::Result<()>;
}

/// Outcome of dispatching one event to all its subscriptions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub attempted: usize,
    pub delivered: usize,
    /// Subscriptions skipped because shutdown began
    pub discarded: usize,
}

/// Turns transitions into chat posts
pub struct Dispatcher {
    poster: Arc<dyn ChatPoster>,
    state: StateHandle,
    cancel: CancellationToken,
}

impl Dispatcher {
    pub fn new(poster: Arc<dyn ChatPoster>, state: StateHandle, cancel: CancellationToken) -> Self {
        Self {
            poster,
            state,
            cancel,
        }
    }

    /// Post one event to one subscription's channel
    pub async fn dispatch(
        &self,
        event: &NotificationEvent,
        subscription: &Subscription,
    ) -> crate::Result<()> {
        let post = Post {
            channel_id: subscription.channel_id.clone(),
            message: event.message(),
            link: Some(event.current.web_url.clone()).filter(|url| !url.is_empty()),
        };

        tracing::debug!(
            "Dispatching {} {} to channel {}",
            event.build_type,
            event.current.display_number(),
            subscription.channel_id
        );
        let result = self.poster.post(&post).await;

        if let Err(e) = &result {
            tracing::warn!(
                "Notification for {} to channel {} failed: {}",
                event.build_type,
                subscription.channel_id,
                e
            );
        }
        self.state.write().await.add_notification(NotificationRecord {
            channel_id: subscription.channel_id.clone(),
            build_type: event.build_type.clone(),
            build_id: event.current.build_id,
            message: post.message,
            success: result.is_ok(),
            error: result.as_ref().err().map(|e| e.to_string()),
            timestamp_epoch_ms: current_epoch_ms(),
        });
        result
    }

    /// Post to every subscription in turn. A failed post does not affect the
    /// others; once shutdown has begun the remaining posts are dropped.
    pub async fn dispatch_all(
        &self,
        event: &NotificationEvent,
        subscriptions: &[Subscription],
    ) -> DispatchSummary {
        let mut summary = DispatchSummary::default();
        for subscription in subscriptions {
            if self.cancel.is_cancelled() {
                summary.discarded = subscriptions.len() - summary.attempted;
                tracing::debug!(
                    "Shutdown in progress, discarding {} notifications for {}",
                    summary.discarded,
                    event.build_type
                );
                break;
            }
            summary.attempted += 1;
            if self.dispatch(event, subscription).await.is_ok() {
                summary.delivered += 1;
            }
        }
        summary
    }
}
