//! BDD test world for the TeamCity bridge
//!
//! Scenarios drive a real [`Bridge`] whose HTTP traffic goes to
//! [`FakeServers`], an in-memory stand-in for both TeamCity and Mattermost.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use cucumber::World;
use tempfile::TempDir;
use tokio::task::JoinHandle;

use teamcity_bridge::commands::CommandResponse;
use teamcity_bridge::io::{HttpClient, HttpResponse};
use teamcity_bridge::poller::SweepReport;
use teamcity_bridge::retry::RetryConfig;
use teamcity_bridge::{Bridge, BridgeBuilder, BridgeError, Config};

pub const TEAMCITY_URL: &str = "https://ci.example.com";
pub const CHAT_URL: &str = "https://chat.example.com";

#[derive(Debug, Clone)]
pub struct FakeBuild {
    pub id: u64,
    pub status: String,
}

#[derive(Debug, Clone)]
pub struct FakeAgent {
    pub name: String,
    pub connected: bool,
    pub busy: bool,
}

/// A message received by the fake chat server
#[derive(Debug, Clone)]
pub struct ReceivedPost {
    pub channel_id: String,
    pub message: String,
}

/// In-memory TeamCity REST API and Mattermost posts endpoint
#[derive(Debug, Default)]
pub struct FakeServers {
    pub build_types: Mutex<BTreeMap<String, Vec<FakeBuild>>>,
    pub projects: Mutex<Vec<(String, String)>>,
    pub agents: Mutex<Vec<FakeAgent>>,
    /// Queued build ids with their build configuration
    pub queue: Mutex<Vec<(u64, String)>>,
    pub cancel_comments: Mutex<Vec<(u64, String)>>,
    pub outages: Mutex<HashSet<String>>,
    pub accepted_token: Mutex<Option<String>>,
    pub tokens_seen: Mutex<Vec<String>>,
    pub posts: Mutex<Vec<ReceivedPost>>,
    pub failing_channels: Mutex<HashSet<String>>,
}

impl FakeServers {
    pub fn set_build(&self, build_type: &str, id: u64, status: &str) {
        let mut build_types = self.build_types.lock().unwrap();
        let builds = build_types.entry(build_type.to_string()).or_default();
        match builds.iter_mut().find(|b| b.id == id) {
            Some(build) => build.status = status.to_string(),
            None => builds.push(FakeBuild {
                id,
                status: status.to_string(),
            }),
        }
    }

    pub fn posts(&self) -> Vec<ReceivedPost> {
        self.posts.lock().unwrap().clone()
    }

    fn respond(status: u16, body: String) -> teamcity_bridge::Result<HttpResponse> {
        Ok(HttpResponse { status, body })
    }

    fn build_json(build_type: &str, build: &FakeBuild) -> serde_json::Value {
        let (state, status) = match build.status.as_str() {
            "queued" => ("queued", None),
            "running" => ("running", Some("SUCCESS")),
            "success" => ("finished", Some("SUCCESS")),
            "failure" => ("finished", Some("FAILURE")),
            _ => ("finished", Some("UNKNOWN")),
        };
        serde_json::json!({
            "id": build.id,
            "buildTypeId": build_type,
            "number": build.id.to_string(),
            "state": state,
            "status": status,
            "webUrl": format!("{}/viewLog.html?buildId={}", TEAMCITY_URL, build.id),
            "finishDate": (state == "finished").then_some("20240115T153000+0000"),
        })
    }

    fn queued_json(id: u64, build_type: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "buildTypeId": build_type,
            "webUrl": format!("{}/viewQueued.html?itemId={}", TEAMCITY_URL, id),
            "queuedDate": "20240115T153000+0000",
            "buildType": { "id": build_type, "name": build_type, "projectName": "Project A" },
        })
    }

    fn queue_build(&self, body: &serde_json::Value) -> teamcity_bridge::Result<HttpResponse> {
        let build_type = body["buildType"]["id"].as_str().unwrap_or_default().to_string();
        let build_types = self.build_types.lock().unwrap();
        if !build_types.contains_key(&build_type) {
            return Self::respond(404, format!("No build type found by locator '{}'", build_type));
        }
        let mut queue = self.queue.lock().unwrap();
        let id = build_types
            .values()
            .flatten()
            .map(|b| b.id)
            .chain(queue.iter().map(|(id, _)| *id))
            .max()
            .unwrap_or(0)
            + 1;
        queue.push((id, build_type.clone()));
        Self::respond(200, Self::queued_json(id, &build_type).to_string())
    }

    fn cancel_build(&self, id: u64, body: &serde_json::Value) -> teamcity_bridge::Result<HttpResponse> {
        let mut build_types = self.build_types.lock().unwrap();
        for (build_type, builds) in build_types.iter_mut() {
            if let Some(build) = builds.iter_mut().find(|b| b.id == id) {
                build.status = "cancelled".to_string();
                let comment = body["comment"].as_str().unwrap_or_default().to_string();
                self.cancel_comments.lock().unwrap().push((id, comment));
                return Self::respond(200, Self::build_json(build_type, build).to_string());
            }
        }
        Self::respond(404, format!("No build found by locator 'id:{}'", id))
    }

    fn check_token(&self, token: &str) -> Option<teamcity_bridge::Result<HttpResponse>> {
        self.tokens_seen.lock().unwrap().push(token.to_string());
        let accepted = self.accepted_token.lock().unwrap().clone();
        accepted
            .as_deref()
            .is_some_and(|t| t != token)
            .then(|| Self::respond(401, "Authentication required".to_string()))
    }

    fn builds_response(&self, locator: &str) -> teamcity_bridge::Result<HttpResponse> {
        let build_type = locator
            .split("id:")
            .nth(1)
            .and_then(|rest| rest.split(')').next())
            .unwrap_or_default()
            .to_string();
        let count: usize = locator
            .split("count:")
            .nth(1)
            .and_then(|rest| rest.split(',').next())
            .and_then(|n| n.parse().ok())
            .unwrap_or(100);

        if self.outages.lock().unwrap().contains(&build_type) {
            return Self::respond(503, "Service Unavailable".to_string());
        }
        let build_types = self.build_types.lock().unwrap();
        let Some(builds) = build_types.get(&build_type) else {
            return Self::respond(404, format!("No build type found by locator '{}'", build_type));
        };

        let mut sorted = builds.clone();
        sorted.sort_by(|a, b| b.id.cmp(&a.id));
        let json: Vec<serde_json::Value> = sorted
            .iter()
            .take(count)
            .map(|b| Self::build_json(&build_type, b))
            .collect();
        Self::respond(
            200,
            serde_json::json!({ "count": json.len(), "build": json }).to_string(),
        )
    }
}

#[async_trait::async_trait]
impl HttpClient for FakeServers {
    async fn get(&self, url: &str, token: &str) -> teamcity_bridge::Result<HttpResponse> {
        if let Some(rejected) = self.check_token(token) {
            return rejected;
        }

        let parsed = reqwest::Url::parse(url)
            .map_err(|e| BridgeError::Http(format!("bad url {}: {}", url, e)))?;
        match parsed.path() {
            "/app/rest/builds" => {
                let locator = parsed
                    .query_pairs()
                    .find(|(k, _)| k == "locator")
                    .map(|(_, v)| v.into_owned())
                    .unwrap_or_default();
                self.builds_response(&locator)
            }
            "/app/rest/projects" => {
                let mut projects = vec![serde_json::json!({"id": "_Root", "name": "<Root project>"})];
                projects.extend(self.projects.lock().unwrap().iter().map(|(id, name)| {
                    serde_json::json!({
                        "id": id,
                        "name": name,
                        "webUrl": format!("{}/project/{}", TEAMCITY_URL, id),
                    })
                }));
                Self::respond(200, serde_json::json!({ "project": projects }).to_string())
            }
            "/app/rest/server" => Self::respond(200, r#"{"version":"2024.03"}"#.to_string()),
            "/app/rest/agents" => {
                let agents: Vec<serde_json::Value> = self
                    .agents
                    .lock()
                    .unwrap()
                    .iter()
                    .enumerate()
                    .map(|(i, agent)| {
                        let mut json = serde_json::json!({
                            "id": i + 1,
                            "name": agent.name,
                            "webUrl": format!("{}/agent/{}", TEAMCITY_URL, i + 1),
                            "enabled": true,
                            "authorized": true,
                            "uptodate": true,
                            "connected": agent.connected,
                        });
                        if agent.busy {
                            json["build"] = serde_json::json!({ "id": 1 });
                        }
                        json
                    })
                    .collect();
                Self::respond(200, serde_json::json!({ "agent": agents }).to_string())
            }
            "/app/rest/buildQueue" => {
                let queue: Vec<serde_json::Value> = self
                    .queue
                    .lock()
                    .unwrap()
                    .iter()
                    .map(|(id, build_type)| Self::queued_json(*id, build_type))
                    .collect();
                Self::respond(200, serde_json::json!({ "build": queue }).to_string())
            }
            _ => Self::respond(404, String::new()),
        }
    }

    async fn post_json(
        &self,
        url: &str,
        token: &str,
        body: &str,
    ) -> teamcity_bridge::Result<HttpResponse> {
        let json: serde_json::Value = serde_json::from_str(body)?;
        if url.starts_with(TEAMCITY_URL) {
            if let Some(rejected) = self.check_token(token) {
                return rejected;
            }
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| BridgeError::Http(format!("bad url {}: {}", url, e)))?;
            let path = parsed.path();
            if path == "/app/rest/buildQueue" {
                return self.queue_build(&json);
            }
            return match path
                .strip_prefix("/app/rest/builds/id:")
                .and_then(|id| id.parse().ok())
            {
                Some(id) => self.cancel_build(id, &json),
                None => Self::respond(404, String::new()),
            };
        }

        assert_eq!(url, format!("{}/api/v4/posts", CHAT_URL));
        let channel_id = json["channel_id"].as_str().unwrap_or_default().to_string();
        if self.failing_channels.lock().unwrap().contains(&channel_id) {
            return Self::respond(500, "{}".to_string());
        }
        self.posts.lock().unwrap().push(ReceivedPost {
            channel_id,
            message: json["message"].as_str().unwrap_or_default().to_string(),
        });
        Self::respond(201, "{}".to_string())
    }
}

#[derive(Default, World)]
pub struct BridgeWorld {
    pub servers: Arc<FakeServers>,
    pub config: Option<Config>,
    pub store_dir: Option<TempDir>,
    pub bridge: Option<Arc<Bridge>>,
    pub build_error: Option<BridgeError>,
    pub reload_result: Option<teamcity_bridge::Result<bool>>,
    pub last_response: Option<CommandResponse>,
    pub last_report: Option<SweepReport>,
    pub running: Option<JoinHandle<teamcity_bridge::Result<()>>>,
}

impl std::fmt::Debug for BridgeWorld {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeWorld")
            .field("servers", &self.servers)
            .field("build_error", &self.build_error)
            .field("last_response", &self.last_response)
            .field("last_report", &self.last_report)
            .finish_non_exhaustive()
    }
}

impl BridgeWorld {
    /// Configuration shared by all scenarios; the store lives in a temp dir
    pub fn config(&mut self) -> &mut Config {
        if self.store_dir.is_none() {
            self.store_dir = Some(tempfile::tempdir().unwrap());
        }
        let store_path = self
            .store_dir
            .as_ref()
            .unwrap()
            .path()
            .join("subscriptions.json");

        self.config.get_or_insert_with(|| {
            let mut config = Config::default();
            config.teamcity.url = TEAMCITY_URL.to_string();
            config.teamcity.token = "secret".to_string();
            config.chat.url = CHAT_URL.to_string();
            config.chat.token = "bot-token".to_string();
            config.server.enabled = false;
            config.poller.interval_seconds = 1;
            config.http.retry = RetryConfig {
                max_attempts: 2,
                initial_delay_ms: 1,
                max_delay_ms: 2,
                backoff_multiplier: 2.0,
            };
            config.store.path = store_path;
            config
        })
    }

    pub async fn try_build(&mut self) -> teamcity_bridge::Result<Arc<Bridge>> {
        let config = self.config().clone();
        let http: Arc<dyn HttpClient> = self.servers.clone();
        let bridge = Arc::new(BridgeBuilder::new(config).with_http_client(http).build().await?);
        self.bridge = Some(Arc::clone(&bridge));
        Ok(bridge)
    }

    /// The running bridge, built on first use
    pub async fn bridge(&mut self) -> Arc<Bridge> {
        if let Some(bridge) = &self.bridge {
            return Arc::clone(bridge);
        }
        self.try_build().await.expect("bridge should build")
    }
}
