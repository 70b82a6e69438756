//! TeamCity REST client
//!
//! Every call takes one snapshot of the active credential, so a settings
//! change mid-request never mixes the old URL with the new token. Reads are
//! retried on transient failures; writes (queueing and cancelling) are sent
//! exactly once.

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Deserialize;
use serde_json::json;

use crate::builds::{Agent, BuildState, BuildStatus, BuildTypeRef, Observation, Project, QueuedBuild};
use crate::config::{Credential, CredentialStore};
use crate::io::{HttpClient, HttpResponse};
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::BridgeError;

const BUILD_FIELDS: &str = "build(id,number,status,state,webUrl,finishDate,buildTypeId)";
const SINGLE_BUILD_FIELDS: &str = "id,number,status,state,webUrl,finishDate,buildTypeId";
const QUEUED_BUILD_FIELDS: &str = "id,buildTypeId,webUrl,queuedDate,buildType(id,name,projectName)";
const PROJECT_FIELDS: &str = "project(id,name,webUrl)";
const AGENT_FIELDS: &str = "agent(id,name,webUrl,enabled,authorized,uptodate,connected,build(id))";
const ROOT_PROJECT_ID: &str = "_Root";

/// The CI server as seen by the poller and the command handler
#[async_trait]
#[cfg_attr(test, mockall::automock)]
pub trait CiClient: Send + Sync {
    /// Latest run of a build configuration, `None` if it has never run
    async fn fetch_latest_build(&self, build_type: &BuildTypeRef) -> crate::Result<Observation>;

    /// Up to `limit` runs, newest first
    async fn list_recent_builds(
        &self,
        build_type: &BuildTypeRef,
        limit: usize,
    ) -> crate::Result<Vec<BuildState>>;

    /// All projects except the implicit root project
    async fn list_projects(&self) -> crate::Result<Vec<Project>>;

    /// Server version string, used as a connectivity check
    async fn server_version(&self) -> crate::Result<String>;

    /// Put a new run of `build_type` into the build queue
    async fn queue_build(&self, build_type: &BuildTypeRef) -> crate::Result<QueuedBuild>;

    /// Stop a queued or running build; an empty `comment` leaves none
    async fn cancel_build(&self, build_id: u64, comment: &str) -> crate::Result<BuildState>;

    /// Every agent, including disconnected and unauthorized ones
    async fn agents(&self) -> crate::Result<Vec<Agent>>;

    /// Builds waiting to start, in queue order
    async fn build_queue(&self) -> crate::Result<Vec<QueuedBuild>>;
}

#[derive(Debug, Deserialize)]
struct BuildsResponse {
    #[serde(default)]
    build: Vec<BuildDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildDto {
    id: u64,
    number: Option<String>,
    status: Option<String>,
    state: Option<String>,
    web_url: Option<String>,
    finish_date: Option<String>,
    build_type_id: Option<String>,
}

impl BuildDto {
    fn into_state(self, requested: &BuildTypeRef) -> BuildState {
        let build_type = self
            .build_type_id
            .and_then(|id| BuildTypeRef::new(id).ok())
            .unwrap_or_else(|| requested.clone());
        let state = self.state.as_deref().unwrap_or("finished");
        BuildState {
            build_type,
            build_id: self.id,
            number: self.number,
            status: BuildStatus::from_teamcity(state, self.status.as_deref()),
            finished_at: self.finish_date,
            web_url: self.web_url.unwrap_or_default(),
        }
    }
}

impl BuildDto {
    /// A build fetched by id must name its own configuration
    fn into_owned_state(self) -> crate::Result<BuildState> {
        let build_type = self
            .build_type_id
            .as_deref()
            .and_then(|id| BuildTypeRef::new(id).ok())
            .ok_or_else(|| {
                BridgeError::Unavailable(format!(
                    "build {} came back without a build configuration",
                    self.id
                ))
            })?;
        Ok(self.into_state(&build_type))
    }
}

#[derive(Debug, Deserialize)]
struct QueueResponse {
    #[serde(default)]
    build: Vec<QueuedBuildDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueuedBuildDto {
    id: u64,
    build_type_id: Option<String>,
    web_url: Option<String>,
    queued_date: Option<String>,
    build_type: Option<BuildTypeDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildTypeDto {
    id: Option<String>,
    name: Option<String>,
    project_name: Option<String>,
}

impl QueuedBuildDto {
    fn into_queued(self, fallback: Option<&BuildTypeRef>) -> Option<QueuedBuild> {
        let (type_id, name, project_name) = match self.build_type {
            Some(dto) => (dto.id, dto.name, dto.project_name),
            None => (None, None, None),
        };
        let build_type = self
            .build_type_id
            .or(type_id)
            .and_then(|id| BuildTypeRef::new(id).ok())
            .or_else(|| fallback.cloned())?;
        Some(QueuedBuild {
            build_id: self.id,
            build_type,
            build_type_name: name,
            project_name,
            queued_at: self.queued_date,
            web_url: self.web_url.unwrap_or_default(),
        })
    }
}

#[derive(Debug, Deserialize)]
struct AgentsResponse {
    #[serde(default)]
    agent: Vec<AgentDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AgentDto {
    name: String,
    web_url: Option<String>,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    authorized: bool,
    #[serde(default, rename = "uptodate")]
    up_to_date: bool,
    #[serde(default)]
    connected: bool,
    build: Option<IgnoredAny>,
}

impl From<AgentDto> for Agent {
    fn from(dto: AgentDto) -> Self {
        Agent {
            name: dto.name,
            web_url: dto.web_url,
            enabled: dto.enabled,
            authorized: dto.authorized,
            up_to_date: dto.up_to_date,
            connected: dto.connected,
            busy: dto.build.is_some(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ProjectsResponse {
    #[serde(default)]
    project: Vec<ProjectDto>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectDto {
    id: String,
    name: String,
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServerDto {
    version: String,
}

/// [`CiClient`] over TeamCity's `/app/rest` API
pub struct TeamCityClient {
    http: Arc<dyn HttpClient>,
    credentials: Arc<CredentialStore>,
    retry: RetryConfig,
}

impl std::fmt::Debug for TeamCityClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TeamCityClient")
            .field("base_url", &self.credentials.current().base_url())
            .field("retry", &self.retry)
            .finish()
    }
}

impl TeamCityClient {
    pub fn new(
        http: Arc<dyn HttpClient>,
        credentials: Arc<CredentialStore>,
        retry: RetryConfig,
    ) -> Self {
        Self {
            http,
            credentials,
            retry,
        }
    }

    fn rest_url(
        credential: &Credential,
        path: &str,
        params: &[(&str, &str)],
    ) -> crate::Result<String> {
        let raw = format!("{}/app/rest/{}", credential.base_url(), path);
        reqwest::Url::parse_with_params(&raw, params)
            .map(|url| url.to_string())
            .map_err(|e| BridgeError::Config(format!("invalid TeamCity URL '{}': {}", raw, e)))
    }

    async fn get_json<T: DeserializeOwned>(&self, url: &str, what: &str) -> crate::Result<T> {
        let credential = self.credentials.current();
        let token = credential.token();
        retry_with_backoff(&self.retry, what, || {
            fetch_json(self.http.as_ref(), url, token, what)
        })
        .await
    }

    /// One attempt only: repeating a POST could queue or cancel twice
    async fn post_json<T: DeserializeOwned>(
        &self,
        url: &str,
        body: &serde_json::Value,
        what: &str,
    ) -> crate::Result<T> {
        let credential = self.credentials.current();
        let response = self
            .http
            .post_json(url, credential.token(), &body.to_string())
            .await
            .map_err(|e| match e {
                BridgeError::Http(msg) => BridgeError::Unavailable(msg),
                other => other,
            })?;
        check_status(&response, what)?;
        parse_body(&response, what)
    }

    async fn query_builds(
        &self,
        build_type: &BuildTypeRef,
        count: usize,
    ) -> crate::Result<Vec<BuildState>> {
        let credential = self.credentials.current();
        let locator = format!(
            "buildType:(id:{}),defaultFilter:false,state:any,count:{}",
            build_type, count
        );
        let url = Self::rest_url(
            &credential,
            "builds",
            &[("locator", &locator), ("fields", BUILD_FIELDS)],
        )?;
        let what = format!("builds of {}", build_type);
        let response: BuildsResponse = self.get_json(&url, &what).await?;

        let mut builds: Vec<BuildState> = response
            .build
            .into_iter()
            .map(|dto| dto.into_state(build_type))
            .collect();
        builds.sort_by(|a, b| b.build_id.cmp(&a.build_id));
        builds.truncate(count);
        Ok(builds)
    }
}

async fn fetch_json<T: DeserializeOwned>(
    http: &dyn HttpClient,
    url: &str,
    token: &str,
    what: &str,
) -> crate::Result<T> {
    let response = http.get(url, token).await?;
    check_status(&response, what)?;
    parse_body(&response, what)
}

fn parse_body<T: DeserializeOwned>(response: &HttpResponse, what: &str) -> crate::Result<T> {
    serde_json::from_str(&response.body).map_err(|e| {
        BridgeError::Unavailable(format!("malformed response for {}: {}", what, e))
    })
}

/// Classify a TeamCity response. Bodies are not echoed into errors since
/// TeamCity sometimes reflects request headers back.
fn check_status(response: &HttpResponse, what: &str) -> crate::Result<()> {
    match response.status {
        200..=299 => Ok(()),
        401 | 403 => Err(BridgeError::Unauthorized(format!(
            "TeamCity rejected the token ({}) for {}",
            response.status, what
        ))),
        400 | 404 => Err(BridgeError::NotFound(what.to_string())),
        status => Err(BridgeError::Unavailable(format!(
            "TeamCity returned {} for {}",
            status, what
        ))),
    }
}

#[async_trait]
impl CiClient for TeamCityClient {
    async fn fetch_latest_build(&self, build_type: &BuildTypeRef) -> crate::Result<Observation> {
        let mut builds = self.query_builds(build_type, 1).await?;
        Ok(if builds.is_empty() {
            None
        } else {
            Some(builds.swap_remove(0))
        })
    }

    async fn list_recent_builds(
        &self,
        build_type: &BuildTypeRef,
        limit: usize,
    ) -> crate::Result<Vec<BuildState>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        self.query_builds(build_type, limit).await
    }

    async fn list_projects(&self) -> crate::Result<Vec<Project>> {
        let credential = self.credentials.current();
        let url = Self::rest_url(&credential, "projects", &[("fields", PROJECT_FIELDS)])?;
        let response: ProjectsResponse = self.get_json(&url, "projects").await?;

        Ok(response
            .project
            .into_iter()
            .filter(|p| p.id != ROOT_PROJECT_ID)
            .map(|p| Project {
                id: p.id,
                name: p.name,
                web_url: p.web_url,
            })
            .collect())
    }

    async fn server_version(&self) -> crate::Result<String> {
        let credential = self.credentials.current();
        let url = Self::rest_url(&credential, "server", &[("fields", "version")])?;
        let server: ServerDto = self.get_json(&url, "server info").await?;
        Ok(server.version)
    }

    async fn queue_build(&self, build_type: &BuildTypeRef) -> crate::Result<QueuedBuild> {
        let credential = self.credentials.current();
        let url = Self::rest_url(&credential, "buildQueue", &[("fields", QUEUED_BUILD_FIELDS)])?;
        let body = json!({ "buildType": { "id": build_type.as_str() } });
        let what = format!("queueing {}", build_type);
        let queued: QueuedBuildDto = self.post_json(&url, &body, &what).await?;

        let queued = queued
            .into_queued(Some(build_type))
            .ok_or_else(|| BridgeError::Unavailable(format!("malformed response for {}", what)))?;
        tracing::info!("Queued build {} of {}", queued.build_id, build_type);
        Ok(queued)
    }

    async fn cancel_build(&self, build_id: u64, comment: &str) -> crate::Result<BuildState> {
        let credential = self.credentials.current();
        let url = Self::rest_url(
            &credential,
            &format!("builds/id:{}", build_id),
            &[("fields", SINGLE_BUILD_FIELDS)],
        )?;
        let body = json!({ "comment": comment, "readdIntoQueue": false });
        let what = format!("cancelling build {}", build_id);
        let build: BuildDto = self.post_json(&url, &body, &what).await?;

        tracing::info!("Cancelled build {}", build_id);
        build.into_owned_state()
    }

    async fn agents(&self) -> crate::Result<Vec<Agent>> {
        let credential = self.credentials.current();
        let url = Self::rest_url(
            &credential,
            "agents",
            &[("locator", "defaultFilter:false"), ("fields", AGENT_FIELDS)],
        )?;
        let response: AgentsResponse = self.get_json(&url, "agents").await?;
        Ok(response.agent.into_iter().map(Agent::from).collect())
    }

    async fn build_queue(&self) -> crate::Result<Vec<QueuedBuild>> {
        let credential = self.credentials.current();
        let fields = format!("build({})", QUEUED_BUILD_FIELDS);
        let url = Self::rest_url(&credential, "buildQueue", &[("fields", &fields)])?;
        let response: QueueResponse = self.get_json(&url, "build queue").await?;
        Ok(response
            .build
            .into_iter()
            .filter_map(|dto| dto.into_queued(None))
            .collect())
    }
}
