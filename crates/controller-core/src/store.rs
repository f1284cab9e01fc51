//! Storage collaborator contracts.
//!
//! The controller treats relational storage and the database-notification
//! transport as external collaborators; these traits state the contracts the
//! engine relies on. Implementations must be thread-safe — handlers share
//! them behind `Arc`.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::page_token::PageToken;
use crate::types::{
    App, Deployment, Event, EventType, ExpandedDeployment, Release, ScaleRequest,
};

/// One item delivered by a change-log tail: an event, or the error that is
/// about to terminate the tail.
pub type TailItem = Result<Event>;

/// The database-driven change log.
///
/// Delivery is at-least-once with strictly increasing event ids; consumers
/// deduplicate by id.
#[async_trait]
pub trait ChangeLog: Send + Sync + 'static {
    /// Opens a tail of the log.
    ///
    /// The returned channel closes (after an optional final `Err` item) when
    /// the tail dies.
    ///
    /// # Errors
    ///
    /// `Error::Unavailable` when the log cannot be reached.
    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<TailItem>>;
}

/// Options for [`AppRepo::list_page`].
#[derive(Debug, Clone, Default)]
pub struct ListAppOptions {
    pub page_token: PageToken,
}

/// A partial write against an app. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct AppUpdate {
    pub meta: Option<HashMap<String, String>>,
    pub strategy: Option<String>,
    pub deploy_timeout: Option<i32>,
}

/// App storage.
#[async_trait]
pub trait AppRepo: Send + Sync + 'static {
    /// Returns one page of live apps, newest first, plus the cursor for the
    /// next page when more exist.
    async fn list_page(&self, opts: ListAppOptions) -> Result<(Vec<App>, Option<PageToken>)>;

    async fn get(&self, id: &str) -> Result<App>;

    /// Applies the update atomically and emits an `app` update event.
    async fn update(&self, id: &str, update: AppUpdate) -> Result<App>;
}

/// Release storage.
#[async_trait]
pub trait ReleaseRepo: Send + Sync + 'static {
    /// Persists the release (assigning an id when absent) and emits a
    /// `release` create event.
    async fn add(&self, release: &mut Release) -> Result<()>;

    async fn get(&self, id: &str) -> Result<Release>;
}

/// Options for [`ScaleRepo::list_scale_requests`].
#[derive(Debug, Clone, Default)]
pub struct ListScaleOptions {
    pub page_token: PageToken,
    pub app_ids: Vec<String>,
    pub release_ids: Vec<String>,
    pub scale_ids: Vec<String>,
}

/// Scale-request storage.
#[async_trait]
pub trait ScaleRepo: Send + Sync + 'static {
    /// Persists a new pending scale request (assigning its id) and emits a
    /// `scale_request` create event.
    async fn add_scale_request(&self, req: &mut ScaleRequest) -> Result<()>;

    /// Returns one page of scale requests, newest first, filtered by the
    /// non-empty id sets in `opts`.
    async fn list_scale_requests(
        &self,
        opts: ListScaleOptions,
    ) -> Result<(Vec<ScaleRequest>, Option<PageToken>)>;
}

/// Options for [`DeploymentRepo::list_page`].
#[derive(Debug, Clone, Default)]
pub struct ListDeploymentOptions {
    pub page_token: PageToken,
    pub app_ids: Vec<String>,
    pub deployment_ids: Vec<String>,
}

/// Deployment storage.
#[async_trait]
pub trait DeploymentRepo: Send + Sync + 'static {
    /// Creates a pending deployment moving `app_id` to `release_id` and
    /// emits the initial `deployment` event.
    async fn add(&self, app_id: &str, release_id: &str) -> Result<ExpandedDeployment>;

    async fn get(&self, id: &str) -> Result<Deployment>;

    /// Like [`get`](Self::get), joined with the resolved releases.
    async fn get_expanded(&self, id: &str) -> Result<ExpandedDeployment>;

    async fn list_page(
        &self,
        opts: ListDeploymentOptions,
    ) -> Result<(Vec<ExpandedDeployment>, Option<PageToken>)>;
}

/// Read access to the persisted change log (the releases snapshot source).
#[async_trait]
pub trait EventRepo: Send + Sync + 'static {
    /// Lists events in descending id order.
    ///
    /// Empty `app_ids`/`object_ids` match all; `before_id` returns events
    /// strictly older; `count` of zero is unbounded.
    async fn list_events(
        &self,
        app_ids: &[String],
        object_types: &[EventType],
        object_ids: &[String],
        before_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<Event>>;
}
