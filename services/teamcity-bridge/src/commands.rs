//! `/teamcity` slash command: parsing and execution
//!
//! Commands run synchronously against the subscription store and TeamCity.
//! Failures are turned into plain-text replies for the invoking user.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::builds::{format_teamcity_date, Agent, BuildState, BuildTypeRef, QueuedBuild};
use crate::config::CredentialStore;
use crate::subscriptions::SubscriptionStore;
use crate::teamcity::CiClient;
use crate::BridgeError;

const TRIGGER: &str = "/teamcity";

/// Largest count `builds` will ask TeamCity for
pub const MAX_BUILDS_LIMIT: usize = 100;

const ICON_GOOD: &str = ":white_check_mark:";
const ICON_BAD: &str = ":x:";

const HELP_TEXT: &str = "\
###### TeamCity commands
* `/teamcity subscribe <buildTypeId>` - notify this channel about builds of a configuration
* `/teamcity unsubscribe <buildTypeId>` - stop notifications for a configuration
* `/teamcity list` - show this channel's subscriptions
* `/teamcity builds <buildTypeId> [count]` - show the most recent builds
* `/teamcity status <buildTypeId>` - show the latest build
* `/teamcity projects` - list TeamCity projects
* `/teamcity build start <buildTypeId>` - queue a new build
* `/teamcity build cancel <buildId> [comment]` - cancel a queued or running build
* `/teamcity stats` - show build agents and the build queue
* `/teamcity help` - show this message";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subscribe(BuildTypeRef),
    Unsubscribe(BuildTypeRef),
    List,
    Builds {
        build_type: BuildTypeRef,
        limit: Option<usize>,
    },
    Status(BuildTypeRef),
    Projects,
    BuildStart(BuildTypeRef),
    BuildCancel {
        build_id: u64,
        comment: Option<String>,
    },
    Stats,
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Unknown command `{0}`.")]
    UnknownVerb(String),

    #[error("Usage: `/teamcity {0}`")]
    Usage(&'static str),

    #[error("`{0}` is not a valid build configuration id.")]
    InvalidBuildType(String),

    #[error("`{0}` is not a valid build count; use a number from 1 to {max}.", max = MAX_BUILDS_LIMIT)]
    InvalidLimit(String),

    #[error("`{0}` is not a valid build id.")]
    InvalidBuildId(String),
}

/// Parse command text, with or without the leading `/teamcity` trigger
pub fn parse_command(text: &str) -> Result<Command, ParseError> {
    let mut args = split_args(text);
    if args
        .first()
        .is_some_and(|first| first.eq_ignore_ascii_case(TRIGGER))
    {
        args.remove(0);
    }

    let Some((verb, rest)) = args.split_first() else {
        return Ok(Command::Help);
    };

    match verb.to_ascii_lowercase().as_str() {
        "subscribe" => match rest {
            [id] => Ok(Command::Subscribe(build_type_arg(id)?)),
            _ => Err(ParseError::Usage("subscribe <buildTypeId>")),
        },
        "unsubscribe" => match rest {
            [id] => Ok(Command::Unsubscribe(build_type_arg(id)?)),
            _ => Err(ParseError::Usage("unsubscribe <buildTypeId>")),
        },
        "list" => Ok(Command::List),
        "builds" => match rest {
            [id] => Ok(Command::Builds {
                build_type: build_type_arg(id)?,
                limit: None,
            }),
            [id, limit] => Ok(Command::Builds {
                build_type: build_type_arg(id)?,
                limit: Some(limit_arg(limit)?),
            }),
            _ => Err(ParseError::Usage("builds <buildTypeId> [count]")),
        },
        "status" => match rest {
            [id] => Ok(Command::Status(build_type_arg(id)?)),
            _ => Err(ParseError::Usage("status <buildTypeId>")),
        },
        "projects" => Ok(Command::Projects),
        "build" => match rest {
            [action, id] if action.eq_ignore_ascii_case("start") => {
                Ok(Command::BuildStart(build_type_arg(id)?))
            }
            [action, id, comment @ ..] if action.eq_ignore_ascii_case("cancel") => {
                Ok(Command::BuildCancel {
                    build_id: build_id_arg(id)?,
                    comment: (!comment.is_empty()).then(|| comment.join(" ")),
                })
            }
            _ => Err(ParseError::Usage(
                "build start <buildTypeId>` or `/teamcity build cancel <buildId> [comment]",
            )),
        },
        "stats" => Ok(Command::Stats),
        "help" => Ok(Command::Help),
        other => Err(ParseError::UnknownVerb(other.to_string())),
    }
}

fn build_type_arg(raw: &str) -> Result<BuildTypeRef, ParseError> {
    BuildTypeRef::new(raw).map_err(|_| ParseError::InvalidBuildType(raw.to_string()))
}

fn limit_arg(raw: &str) -> Result<usize, ParseError> {
    match raw.parse::<usize>() {
        Ok(n) if (1..=MAX_BUILDS_LIMIT).contains(&n) => Ok(n),
        _ => Err(ParseError::InvalidLimit(raw.to_string())),
    }
}

fn build_id_arg(raw: &str) -> Result<u64, ParseError> {
    match raw.parse::<u64>() {
        Ok(id) if id > 0 => Ok(id),
        _ => Err(ParseError::InvalidBuildId(raw.to_string())),
    }
}

/// Split on whitespace; double quotes group words and are removed
fn split_args(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut has_token = false;

    for c in text.chars() {
        match c {
            '"' => {
                in_quotes = !in_quotes;
                has_token = true;
            }
            c if c.is_whitespace() && !in_quotes => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    /// Visible only to the invoking user
    Ephemeral,
    InChannel,
}

/// Reply to a command, in the shape chat servers expect from slash commands
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub response_type: ResponseType,
    pub text: String,
}

impl CommandResponse {
    pub fn ephemeral(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::Ephemeral,
            text: text.into(),
        }
    }

    pub fn in_channel(text: impl Into<String>) -> Self {
        Self {
            response_type: ResponseType::InChannel,
            text: text.into(),
        }
    }
}

/// One inbound command invocation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CommandRequest {
    pub channel_id: String,
    pub user_id: String,
    pub text: String,
}

pub struct CommandHandler {
    ci: Arc<dyn CiClient>,
    subscriptions: Arc<SubscriptionStore>,
    credentials: Arc<CredentialStore>,
}

impl CommandHandler {
    pub fn new(
        ci: Arc<dyn CiClient>,
        subscriptions: Arc<SubscriptionStore>,
        credentials: Arc<CredentialStore>,
    ) -> Self {
        Self {
            ci,
            subscriptions,
            credentials,
        }
    }

    /// Parse and run a command; never fails, errors become reply text
    pub async fn handle(&self, request: &CommandRequest) -> CommandResponse {
        let command = match parse_command(&request.text) {
            Ok(command) => command,
            Err(e @ ParseError::UnknownVerb(_)) => {
                return CommandResponse::ephemeral(format!("{}\n\n{}", e, HELP_TEXT));
            }
            Err(e) => return CommandResponse::ephemeral(e.to_string()),
        };

        tracing::debug!(
            "Command from {} in {}: {:?}",
            request.user_id,
            request.channel_id,
            command
        );
        self.execute(command, request).await
    }

    pub async fn execute(&self, command: Command, request: &CommandRequest) -> CommandResponse {
        match command {
            Command::Subscribe(build_type) => self.subscribe(&build_type, request).await,
            Command::Unsubscribe(build_type) => self.unsubscribe(&build_type, request).await,
            Command::List => self.list(request).await,
            Command::Builds { build_type, limit } => self.builds(&build_type, limit).await,
            Command::Status(build_type) => self.status(&build_type).await,
            Command::Projects => self.projects().await,
            Command::BuildStart(build_type) => self.build_start(&build_type, request).await,
            Command::BuildCancel { build_id, comment } => {
                self.build_cancel(build_id, comment.as_deref(), request).await
            }
            Command::Stats => self.stats().await,
            Command::Help => CommandResponse::ephemeral(HELP_TEXT),
        }
    }

    /// Unknown configurations and a rejected token refuse the subscription;
    /// an unreachable server only adds a warning to the reply
    async fn subscribe(&self, build_type: &BuildTypeRef, request: &CommandRequest) -> CommandResponse {
        let unverified = match self.ci.fetch_latest_build(build_type).await {
            Ok(_) => false,
            Err(e @ (BridgeError::NotFound(_) | BridgeError::Unauthorized(_))) => {
                return error_response(build_type, &e);
            }
            Err(e) => {
                tracing::warn!(
                    "Could not verify {} while subscribing, storing it anyway: {}",
                    build_type,
                    e
                );
                true
            }
        };

        match self
            .subscriptions
            .add(&request.channel_id, build_type, &request.user_id)
            .await
        {
            Ok(true) if unverified => CommandResponse::ephemeral(format!(
                "This channel is now subscribed to **{}**. TeamCity is not reachable right now, \
                 so the build configuration could not be checked.",
                build_type
            )),
            Ok(true) => CommandResponse::ephemeral(format!(
                "This channel is now subscribed to **{}**.",
                build_type
            )),
            Ok(false) => CommandResponse::ephemeral(format!(
                "This channel is already subscribed to **{}**.",
                build_type
            )),
            Err(e) => {
                tracing::error!("Saving subscription to {} failed: {}", build_type, e);
                CommandResponse::ephemeral("Could not save the subscription, please try again.")
            }
        }
    }

    async fn unsubscribe(
        &self,
        build_type: &BuildTypeRef,
        request: &CommandRequest,
    ) -> CommandResponse {
        match self
            .subscriptions
            .remove(&request.channel_id, build_type)
            .await
        {
            Ok(()) => CommandResponse::ephemeral(format!(
                "This channel is no longer subscribed to **{}**.",
                build_type
            )),
            Err(BridgeError::NotFound(_)) => CommandResponse::ephemeral(format!(
                "This channel is not subscribed to **{}**.",
                build_type
            )),
            Err(e) => {
                tracing::error!("Removing subscription to {} failed: {}", build_type, e);
                CommandResponse::ephemeral("Could not remove the subscription, please try again.")
            }
        }
    }

    async fn list(&self, request: &CommandRequest) -> CommandResponse {
        let subscriptions = self.subscriptions.list_by_channel(&request.channel_id).await;
        if subscriptions.is_empty() {
            return CommandResponse::ephemeral("This channel has no TeamCity subscriptions.");
        }

        let mut text = String::from("This channel is subscribed to:");
        for sub in subscriptions {
            text.push_str(&format!("\n* `{}`", sub.build_type));
        }
        CommandResponse::ephemeral(text)
    }

    async fn builds(&self, build_type: &BuildTypeRef, limit: Option<usize>) -> CommandResponse {
        let limit = limit.unwrap_or_else(|| self.credentials.current().max_builds_default());
        match self.ci.list_recent_builds(build_type, limit).await {
            Ok(builds) if builds.is_empty() => {
                CommandResponse::in_channel(format!("**{}** has no builds yet.", build_type))
            }
            Ok(builds) => CommandResponse::in_channel(builds_table(build_type, &builds)),
            Err(e) => error_response(build_type, &e),
        }
    }

    async fn status(&self, build_type: &BuildTypeRef) -> CommandResponse {
        match self.ci.fetch_latest_build(build_type).await {
            Ok(None) => {
                CommandResponse::ephemeral(format!("**{}** has no builds yet.", build_type))
            }
            Ok(Some(build)) => {
                let mut text = format!(
                    "{} **{}** build {} is **{}**",
                    build.status.icon(),
                    build_type,
                    build_link(&build),
                    build.status
                );
                if let Some(finished) = build.finished_display() {
                    text.push_str(&format!(", finished {}", finished));
                }
                CommandResponse::ephemeral(text)
            }
            Err(e) => error_response(build_type, &e),
        }
    }

    async fn projects(&self) -> CommandResponse {
        match self.ci.list_projects().await {
            Ok(projects) if projects.is_empty() => {
                CommandResponse::in_channel("No TeamCity projects found.")
            }
            Ok(projects) => {
                let mut text = String::from("###### TeamCity projects");
                for project in projects {
                    let name = match &project.web_url {
                        Some(url) => format!("[{}]({})", project.name, url),
                        None => project.name.clone(),
                    };
                    text.push_str(&format!("\n* {} (`{}`)", name, project.id));
                }
                CommandResponse::in_channel(text)
            }
            Err(BridgeError::Unauthorized(_)) => CommandResponse::ephemeral(UNAUTHORIZED_TEXT),
            Err(e) => {
                tracing::debug!("Listing projects failed: {}", e);
                CommandResponse::ephemeral(UNAVAILABLE_TEXT)
            }
        }
    }

    async fn build_start(
        &self,
        build_type: &BuildTypeRef,
        request: &CommandRequest,
    ) -> CommandResponse {
        match self.ci.queue_build(build_type).await {
            Ok(queued) => {
                tracing::info!(
                    "{} queued build {} of {} from {}",
                    request.user_id,
                    queued.build_id,
                    build_type,
                    request.channel_id
                );
                CommandResponse::in_channel(format!(
                    "**TeamCity build queued**\n\n\
                     * Build configuration: {}\n\
                     * Build: {}\n\n\
                     Cancel it with `/teamcity build cancel {}`",
                    queued.display_name(),
                    queued_link(&queued),
                    queued.build_id
                ))
            }
            Err(e) => error_response(build_type, &e),
        }
    }

    async fn build_cancel(
        &self,
        build_id: u64,
        comment: Option<&str>,
        request: &CommandRequest,
    ) -> CommandResponse {
        let comment = comment.unwrap_or_default();
        match self.ci.cancel_build(build_id, comment).await {
            Ok(build) => {
                tracing::info!(
                    "{} cancelled build {} from {}",
                    request.user_id,
                    build_id,
                    request.channel_id
                );
                let mut text = format!(
                    "**TeamCity build cancelled**\n\n{} **{}** build {} is **{}**",
                    build.status.icon(),
                    build.build_type,
                    build_link(&build),
                    build.status
                );
                if !comment.is_empty() {
                    text.push_str(&format!("\nComment: {}", comment));
                }
                CommandResponse::ephemeral(text)
            }
            Err(e) => ci_error_response(&e, || format!("No such build: `{}`.", build_id)),
        }
    }

    async fn stats(&self) -> CommandResponse {
        let agents = match self.ci.agents().await {
            Ok(agents) => agents,
            Err(e) => return ci_error_response(&e, || UNAVAILABLE_TEXT.to_string()),
        };
        let queue = match self.ci.build_queue().await {
            Ok(queue) => queue,
            Err(e) => return ci_error_response(&e, || UNAVAILABLE_TEXT.to_string()),
        };
        CommandResponse::in_channel(stats_text(&agents, &queue))
    }
}

const UNAUTHORIZED_TEXT: &str =
    "TeamCity rejected the configured access token. Ask an administrator to check the TeamCityToken setting.";
const UNAVAILABLE_TEXT: &str = "TeamCity is not reachable right now, please try again later.";

fn error_response(build_type: &BuildTypeRef, error: &BridgeError) -> CommandResponse {
    ci_error_response(error, || {
        format!("No such build configuration: `{}`.", build_type)
    })
}

fn ci_error_response(error: &BridgeError, not_found: impl FnOnce() -> String) -> CommandResponse {
    match error {
        BridgeError::NotFound(_) => CommandResponse::ephemeral(not_found()),
        BridgeError::Unauthorized(_) => CommandResponse::ephemeral(UNAUTHORIZED_TEXT),
        e => {
            tracing::debug!("TeamCity request failed: {}", e);
            CommandResponse::ephemeral(UNAVAILABLE_TEXT)
        }
    }
}

fn build_link(build: &BuildState) -> String {
    if build.web_url.is_empty() {
        build.display_number()
    } else {
        format!("[{}]({})", build.display_number(), build.web_url)
    }
}

fn queued_link(queued: &QueuedBuild) -> String {
    if queued.web_url.is_empty() {
        format!("id {}", queued.build_id)
    } else {
        format!("[id {}]({})", queued.build_id, queued.web_url)
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        ICON_GOOD
    } else {
        ICON_BAD
    }
}

fn stats_text(agents: &[Agent], queue: &[QueuedBuild]) -> String {
    let mut text = String::from("###### TeamCity agents\n\n");
    if agents.is_empty() {
        text.push_str("No build agents found.");
    } else {
        text.push_str(
            "| Agent | Enabled | Authorized | Up to date | Connected | Busy |\n\
             |:------|:-------:|:----------:|:----------:|:---------:|:----:|",
        );
        for agent in agents {
            let name = match &agent.web_url {
                Some(url) => format!("[{}]({})", agent.name, url),
                None => agent.name.clone(),
            };
            text.push_str(&format!(
                "\n| {} | {} | {} | {} | {} | {} |",
                name,
                flag(agent.enabled),
                flag(agent.authorized),
                flag(agent.up_to_date),
                flag(agent.connected),
                flag(agent.busy)
            ));
        }
    }

    if queue.is_empty() {
        text.push_str("\n\nThe build queue is empty.");
        return text;
    }
    text.push_str(&format!(
        "\n\n###### Build queue ({})\n\n\
         | # | Project | Build | Queued |\n\
         |:--|:--------|:------|:-------|",
        queue.len()
    ));
    for (position, queued) in queue.iter().enumerate() {
        let build = if queued.web_url.is_empty() {
            queued.display_name().to_string()
        } else {
            format!("[{}]({})", queued.display_name(), queued.web_url)
        };
        text.push_str(&format!(
            "\n| {} | {} | {} | {} |",
            position + 1,
            queued.project_name.as_deref().unwrap_or("-"),
            build,
            queued
                .queued_at
                .as_deref()
                .map(format_teamcity_date)
                .unwrap_or_else(|| "-".to_string())
        ));
    }
    text
}

fn builds_table(build_type: &BuildTypeRef, builds: &[BuildState]) -> String {
    let mut text = format!(
        "Recent builds of **{}**\n\n| Build | Status | Finished |\n|:------|:-------|:---------|",
        build_type
    );
    for build in builds {
        text.push_str(&format!(
            "\n| {} | {} {} | {} |",
            build_link(build),
            build.status.icon(),
            build.status,
            build.finished_display().unwrap_or_else(|| "-".to_string())
        ));
    }
    text
}
