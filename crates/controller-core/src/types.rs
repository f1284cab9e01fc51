//! Domain entities carried by the control plane.
//!
//! Entities are mostly pass-through records: the core only inspects labels,
//! release types, and lifecycle states. Serde names match the change-log
//! wire tags, so event payloads decode directly into these types.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default wait for a scale request to reach a terminal state.
pub const DEFAULT_SCALE_TIMEOUT: Duration = Duration::from_secs(30);

/// Tag identifying the kind of entity a change-log event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    App,
    AppDeletion,
    AppRelease,
    Release,
    Deployment,
    ScaleRequest,
}

/// The mutation kind recorded on a change-log event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOp {
    Create,
    Update,
}

/// A change-log record, globally ordered by its monotonic `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Strictly increasing across the entire log.
    pub id: i64,
    /// Owning application, possibly empty.
    #[serde(default)]
    pub app_id: String,
    pub object_type: EventType,
    /// Primary key of the mutated entity.
    pub object_id: String,
    pub op: EventOp,
    /// Serialized new state of the entity (shape depends on `object_type`).
    pub data: serde_json::Value,
    /// Advisory only; ordering uses `id`.
    pub created_at: DateTime<Utc>,
}

/// A named unit of deployable software owning releases and deployments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,
    /// Labels. The wire name is `meta` for historical reasons.
    #[serde(default)]
    pub meta: HashMap<String, String>,
    #[serde(default)]
    pub strategy: String,
    #[serde(default)]
    pub deploy_timeout: i32,
    /// Current release, empty until one is associated.
    #[serde(default)]
    pub release_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Tombstone: set when the app has been deleted.
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

/// An immutable configuration + artifact combination belonging to an app.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub id: String,
    #[serde(default)]
    pub app_id: String,
    #[serde(default)]
    pub artifact_ids: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Labels. The wire name is `meta` for historical reasons.
    #[serde(default)]
    pub meta: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

impl Release {
    /// A release carrying artifacts ships code; one without only changes
    /// configuration.
    pub fn release_type(&self) -> ReleaseType {
        if self.artifact_ids.is_empty() {
            ReleaseType::Config
        } else {
            ReleaseType::Code
        }
    }
}

/// Classification of a release (and of the deployment that ships it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseType {
    /// Matches every type when used in a filter.
    Any,
    Code,
    Config,
}

/// Lifecycle of a scale request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleRequestState {
    Pending,
    Cancelled,
    Complete,
}

/// Per-process tag map, keyed by process type.
pub type ProcessTags = HashMap<String, HashMap<String, String>>;

/// A request to change the process counts or tags of a release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub id: String,
    pub app_id: String,
    pub release_id: String,
    pub state: ScaleRequestState,
    #[serde(default)]
    pub old_processes: HashMap<String, i32>,
    #[serde(default)]
    pub new_processes: HashMap<String, i32>,
    #[serde(default)]
    pub old_tags: ProcessTags,
    #[serde(default)]
    pub new_tags: ProcessTags,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Running,
    Complete,
    Failed,
}

/// The ordered process of moving an app from one release to another.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub app_id: String,
    #[serde(default)]
    pub old_release_id: String,
    pub new_release_id: String,
    #[serde(default)]
    pub strategy: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub processes: HashMap<String, i32>,
    #[serde(default)]
    pub tags: ProcessTags,
    #[serde(default)]
    pub deploy_timeout: i32,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

/// A deployment joined with its resolved releases.
#[derive(Debug, Clone)]
pub struct ExpandedDeployment {
    pub deployment: Deployment,
    pub old_release: Option<Release>,
    pub new_release: Option<Release>,
}

impl ExpandedDeployment {
    /// Code when the artifact set changed between releases, Config otherwise.
    pub fn release_type(&self) -> ReleaseType {
        match (&self.old_release, &self.new_release) {
            (Some(old), Some(new)) if old.artifact_ids == new.artifact_ids => ReleaseType::Config,
            (None, Some(new)) => new.release_type(),
            (_, None) => ReleaseType::Config,
            _ => ReleaseType::Code,
        }
    }
}

/// A single status transition within a deployment, carried as the payload of
/// `deployment` change-log events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentEvent {
    #[serde(default)]
    pub app_id: String,
    pub deployment_id: String,
    #[serde(default)]
    pub release_id: String,
    pub status: DeploymentStatus,
    #[serde(default)]
    pub job_type: String,
    #[serde(default)]
    pub job_state: String,
    #[serde(default)]
    pub error: String,
}
