//! TeamCity bridge - build notifications and subscriptions for chat channels
//!
//! Polls TeamCity for the latest build of every subscribed build configuration,
//! detects transitions, and posts one message per subscribed channel. A
//! `/teamcity` slash command manages subscriptions and queries builds.

pub mod builds;
pub mod commands;
pub mod config;
pub mod error;
pub mod io;
pub mod kv;
pub mod mattermost;
pub mod notifier;
pub mod poller;
pub mod retry;
pub mod server;
pub mod state;
pub mod subscriptions;
pub mod teamcity;

pub use config::{load_config, Config};
pub use error::{BridgeError, Result};

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::commands::CommandHandler;
use crate::config::{CredentialStore, TeamCitySettings};
use crate::io::{HttpClient, ReqwestHttpClient};
use crate::kv::{FileKvStore, KvStore};
use crate::mattermost::MattermostPoster;
use crate::notifier::{ChatPoster, Dispatcher};
use crate::poller::Poller;
use crate::server::ServerState;
use crate::state::StateHandle;
use crate::subscriptions::SubscriptionStore;
use crate::teamcity::{CiClient, TeamCityClient};

/// Assembles a [`Bridge`] from configuration, with optional injected
/// collaborators replacing the production ones
pub struct BridgeBuilder {
    config: Config,
    http: Option<Arc<dyn HttpClient>>,
    ci: Option<Arc<dyn CiClient>>,
    poster: Option<Arc<dyn ChatPoster>>,
    kv: Option<Arc<dyn KvStore>>,
    cancel: Option<CancellationToken>,
}

impl BridgeBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            http: None,
            ci: None,
            poster: None,
            kv: None,
            cancel: None,
        }
    }

    pub fn with_http_client(mut self, http: Arc<dyn HttpClient>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_ci_client(mut self, ci: Arc<dyn CiClient>) -> Self {
        self.ci = Some(ci);
        self
    }

    pub fn with_chat_poster(mut self, poster: Arc<dyn ChatPoster>) -> Self {
        self.poster = Some(poster);
        self
    }

    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_cancellation_token(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// Validate the configuration and load persisted subscriptions.
    ///
    /// Missing or invalid TeamCity settings fail here with
    /// [`BridgeError::Config`]; nothing is polled until [`Bridge::start`].
    pub async fn build(self) -> Result<Bridge> {
        let config = self.config;
        let credentials = Arc::new(CredentialStore::from_settings(&config.teamcity)?);

        let http: Arc<dyn HttpClient> = match self.http {
            Some(http) => http,
            None => Arc::new(ReqwestHttpClient::with_timeout(Duration::from_secs(
                config.http.request_timeout_seconds,
            ))?),
        };
        let ci: Arc<dyn CiClient> = match self.ci {
            Some(ci) => ci,
            None => Arc::new(TeamCityClient::new(
                Arc::clone(&http),
                Arc::clone(&credentials),
                config.http.retry,
            )),
        };
        let poster: Arc<dyn ChatPoster> = match self.poster {
            Some(poster) => poster,
            None => Arc::new(MattermostPoster::new(&config.chat, Arc::clone(&http))?),
        };
        let kv: Arc<dyn KvStore> = match self.kv {
            Some(kv) => kv,
            None => Arc::new(FileKvStore::open(&config.store.path)?),
        };

        let subscriptions = Arc::new(SubscriptionStore::load(kv).await?);
        let state = state::new_state_handle(config.server.history_size);
        let cancel = self.cancel.unwrap_or_else(CancellationToken::new);

        let dispatcher = Arc::new(Dispatcher::new(poster, Arc::clone(&state), cancel.clone()));
        let poller = Poller::new(
            Arc::clone(&ci),
            Arc::clone(&subscriptions),
            Arc::clone(&state),
            dispatcher,
            config.poller.clone(),
            cancel.clone(),
        );
        let commands = Arc::new(CommandHandler::new(
            Arc::clone(&ci),
            Arc::clone(&subscriptions),
            Arc::clone(&credentials),
        ));

        tracing::debug!("Bridge built with {:?}", credentials.current());
        Ok(Bridge {
            config,
            credentials,
            ci,
            subscriptions,
            state,
            poller,
            commands,
            cancel,
        })
    }
}

/// A configured bridge, ready to start
pub struct Bridge {
    config: Config,
    credentials: Arc<CredentialStore>,
    ci: Arc<dyn CiClient>,
    subscriptions: Arc<SubscriptionStore>,
    state: StateHandle,
    poller: Poller,
    commands: Arc<CommandHandler>,
    cancel: CancellationToken,
}

impl Bridge {
    /// Run the poller and, if enabled, the command server. Returns once
    /// [`Bridge::stop`] is called or the cancellation token fires.
    pub async fn start(&self) -> Result<()> {
        match self.ci.server_version().await {
            Ok(version) => tracing::info!("Connected to TeamCity {}", version),
            Err(e) => tracing::warn!("TeamCity connectivity check failed: {}", e),
        }

        let server = if self.config.server.enabled {
            let router = server::build_router(self.server_state());
            let port = self.config.server.port;
            let cancel = self.cancel.clone();
            Some(tokio::spawn(async move {
                if let Err(e) = server::serve(router, port, cancel).await {
                    tracing::error!(
                        "Command server on port {} failed: {}. Continuing without it.",
                        port,
                        e
                    );
                }
            }))
        } else {
            None
        };

        tracing::info!("TeamCity bridge started");
        self.poller.run().await;

        if let Some(handle) = server {
            join_logged("Command server", handle).await;
        }
        tracing::info!("TeamCity bridge stopped");
        Ok(())
    }

    /// Begin shutdown; in-flight results completing afterwards are discarded
    pub fn stop(&self) {
        tracing::info!("Stopping TeamCity bridge");
        self.cancel.cancel();
    }

    /// Install new TeamCity settings; see [`CredentialStore::replace`]
    pub fn reload(&self, settings: &TeamCitySettings) -> Result<bool> {
        self.credentials.replace(settings)
    }

    pub fn credentials(&self) -> &Arc<CredentialStore> {
        &self.credentials
    }

    pub fn commands(&self) -> &Arc<CommandHandler> {
        &self.commands
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionStore> {
        &self.subscriptions
    }

    pub fn poller(&self) -> &Poller {
        &self.poller
    }

    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// State for [`server::build_router`]
    pub fn server_state(&self) -> ServerState {
        ServerState {
            state: Arc::clone(&self.state),
            commands: Arc::clone(&self.commands),
            command_token: self.config.server.command_token.clone(),
        }
    }
}

/// Wait for a background task; a panic or abort is logged rather than
/// propagated. Returns whether the task finished normally.
async fn join_logged(name: &str, handle: tokio::task::JoinHandle<()>) -> bool {
    match handle.await {
        Ok(()) => true,
        Err(e) => {
            tracing::error!("{} task failed: {}", name, e);
            false
        }
    }
}
