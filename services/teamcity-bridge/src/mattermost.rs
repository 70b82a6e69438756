//! Mattermost REST poster

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use crate::config::ChatConfig;
use crate::io::HttpClient;
use crate::notifier::{ChatPoster, Post};
use crate::BridgeError;

#[derive(Debug, Serialize)]
struct CreatePost<'a> {
    channel_id: &'a str,
    message: &'a str,
    props: PostProps<'a>,
}

#[derive(Debug, Serialize)]
struct PostProps<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    build_url: Option<&'a str>,
}

/// Posts as a bot account through `POST /api/v4/posts`
pub struct MattermostPoster {
    posts_url: String,
    token: String,
    http: Arc<dyn HttpClient>,
}

impl std::fmt::Debug for MattermostPoster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MattermostPoster")
            .field("posts_url", &self.posts_url)
            .finish()
    }
}

impl MattermostPoster {
    pub fn new(config: &ChatConfig, http: Arc<dyn HttpClient>) -> crate::Result<Self> {
        let base = config.url.trim().trim_end_matches('/');
        if base.is_empty() {
            return Err(BridgeError::Config("chat.url is required".to_string()));
        }
        if config.token.is_empty() {
            return Err(BridgeError::Config("chat.token is required".to_string()));
        }

        let posts_url = format!("{}/api/v4/posts", base);
        tracing::debug!("Created MattermostPoster for {}", posts_url);

        Ok(Self {
            posts_url,
            token: config.token.clone(),
            http,
        })
    }
}

#[async_trait]
impl ChatPoster for MattermostPoster {
    async fn post(&self, post: &Post) -> crate::Result<()> {
        let body = serde_json::to_string(&CreatePost {
            channel_id: &post.channel_id,
            message: &post.message,
            props: PostProps {
                build_url: post.link.as_deref(),
            },
        })?;

        let response = self
            .http
            .post_json(&self.posts_url, &self.token, &body)
            .await
            .map_err(|e| BridgeError::PostFailed(e.to_string()))?;

        if !response.is_success() {
            return Err(BridgeError::PostFailed(format!(
                "Mattermost returned status {} for channel {}",
                response.status, post.channel_id
            )));
        }

        tracing::debug!("Posted to channel {}", post.channel_id);
        Ok(())
    }
}
