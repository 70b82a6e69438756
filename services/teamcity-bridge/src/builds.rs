//! Build configuration references and build state snapshots

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::BridgeError;

const TEAMCITY_DATE_FORMAT: &str = "%Y%m%dT%H%M%S%z";
const DISPLAY_DATE_FORMAT: &str = "%b %-d, %Y %-I:%M %p UTC";

/// Identifier of a TeamCity build configuration (e.g. `MyProject_Build`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BuildTypeRef(String);

impl BuildTypeRef {
    /// Create a reference, rejecting values that would break a REST locator
    pub fn new(id: impl Into<String>) -> crate::Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(BridgeError::Config(
                "build configuration id must not be empty".to_string(),
            ));
        }
        if id
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '(' | ')' | ',' | ':' | '&' | '?' | '#'))
        {
            return Err(BridgeError::Config(format!(
                "invalid build configuration id '{}'",
                id
            )));
        }
        Ok(Self(id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BuildTypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BuildTypeRef {
    type Err = BridgeError;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::new(s)
    }
}

/// Status of a build run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    Queued,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl BuildStatus {
    /// Chat emoji shown next to the status
    pub fn icon(&self) -> &'static str {
        match self {
            BuildStatus::Queued => ":hourglass:",
            BuildStatus::Running => ":arrows_counterclockwise:",
            BuildStatus::Success => ":white_check_mark:",
            BuildStatus::Failure => ":x:",
            BuildStatus::Cancelled => ":no_entry_sign:",
        }
    }

    /// Map TeamCity's `state` and `status` fields onto a single status
    pub fn from_teamcity(state: &str, status: Option<&str>) -> Self {
        match state {
            "queued" => BuildStatus::Queued,
            "running" => BuildStatus::Running,
            _ => match status {
                Some("SUCCESS") => BuildStatus::Success,
                Some("FAILURE") | Some("ERROR") => BuildStatus::Failure,
                _ => BuildStatus::Cancelled,
            },
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildStatus::Queued => write!(f, "Queued"),
            BuildStatus::Running => write!(f, "Running"),
            BuildStatus::Success => write!(f, "Success"),
            BuildStatus::Failure => write!(f, "Failure"),
            BuildStatus::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Most recently observed run of a build configuration.
///
/// `build_id` is TeamCity's internal build id, which grows monotonically and
/// identifies a run. `number` is the human-facing build number and is absent
/// for queued builds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildState {
    pub build_type: BuildTypeRef,
    pub build_id: u64,
    pub number: Option<String>,
    pub status: BuildStatus,
    pub finished_at: Option<String>,
    pub web_url: String,
}

impl BuildState {
    /// A later run or a changed status of the same run. An older run is
    /// never a transition.
    pub fn differs_from(&self, previous: &BuildState) -> bool {
        self.build_id > previous.build_id
            || (self.build_id == previous.build_id && self.status != previous.status)
    }

    /// Whether this run is older than `other`
    pub fn precedes(&self, other: &BuildState) -> bool {
        self.build_id < other.build_id
    }

    pub fn display_number(&self) -> String {
        match &self.number {
            Some(number) => format!("#{}", number),
            None => format!("(id {})", self.build_id),
        }
    }

    /// Finish time rendered for chat, if the build has finished
    pub fn finished_display(&self) -> Option<String> {
        self.finished_at.as_deref().map(format_teamcity_date)
    }
}

/// Outcome of polling one build configuration: `None` when it has no builds yet
pub type Observation = Option<BuildState>;

/// A TeamCity project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub web_url: Option<String>,
}

/// A run waiting in the TeamCity build queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedBuild {
    pub build_id: u64,
    pub build_type: BuildTypeRef,
    /// Human-readable configuration name, when TeamCity sends one
    pub build_type_name: Option<String>,
    pub project_name: Option<String>,
    pub queued_at: Option<String>,
    pub web_url: String,
}

impl QueuedBuild {
    pub fn display_name(&self) -> &str {
        self.build_type_name
            .as_deref()
            .unwrap_or_else(|| self.build_type.as_str())
    }
}

/// A TeamCity build agent and its health flags
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    pub web_url: Option<String>,
    pub enabled: bool,
    pub authorized: bool,
    pub up_to_date: bool,
    pub connected: bool,
    /// Currently running a build
    pub busy: bool,
}

/// Render a TeamCity timestamp (`20240115T103000+0000`); unparsable input is returned as-is
pub fn format_teamcity_date(raw: &str) -> String {
    match DateTime::parse_from_str(raw, TEAMCITY_DATE_FORMAT) {
        Ok(dt) => dt
            .with_timezone(&Utc)
            .format(DISPLAY_DATE_FORMAT)
            .to_string(),
        Err(_) => raw.to_string(),
    }
}
