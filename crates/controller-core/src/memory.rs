//! In-memory store implementing every storage collaborator contract.
//!
//! Rows live in `parking_lot`-guarded maps; every mutation appends a
//! change-log event with a process-monotonic id and feeds it to any live
//! tails. Backs the integration tests and the default binary — relational
//! storage itself is an external concern.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::page_token::PageToken;
use crate::store::{
    AppRepo, AppUpdate, ChangeLog, DeploymentRepo, EventRepo, ListAppOptions,
    ListDeploymentOptions, ListScaleOptions, ReleaseRepo, ScaleRepo, TailItem,
};
use crate::types::{
    App, Deployment, DeploymentEvent, DeploymentStatus, Event, EventOp, EventType,
    ExpandedDeployment, Release, ScaleRequest, ScaleRequestState,
};

/// A stored row: the entity plus the event id that last created it, used as
/// the paging cursor.
struct Row<T> {
    cursor: i64,
    value: T,
}

#[derive(Default)]
struct State {
    apps: HashMap<String, Row<App>>,
    releases: HashMap<String, Row<Release>>,
    scales: HashMap<String, Row<ScaleRequest>>,
    deployments: HashMap<String, Row<Deployment>>,
    events: Vec<Event>,
    next_id: i64,
    tails: Vec<mpsc::UnboundedSender<TailItem>>,
}

/// Thread-safe in-memory store.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    listen_error: AtomicBool,
}

fn payload<T: Serialize>(value: &T) -> serde_json::Value {
    serde_json::to_value(value).expect("entity serializes to JSON")
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// When set, `listen` fails with `Unavailable` until cleared.
    pub fn set_listen_error(&self, fail: bool) {
        self.listen_error.store(fail, Ordering::Release);
    }

    /// Terminates every live tail with `Unavailable(cause)`.
    pub fn fail_tails(&self, cause: &str) {
        let mut state = self.state.lock();
        for tail in state.tails.drain(..) {
            let _ = tail.send(Err(Error::Unavailable(cause.into())));
        }
    }

    /// Number of live tails (test observability).
    #[must_use]
    pub fn tail_count(&self) -> usize {
        self.state
            .lock()
            .tails
            .iter()
            .filter(|tail| !tail.is_closed())
            .count()
    }

    fn append_event(
        state: &mut State,
        app_id: String,
        object_type: EventType,
        object_id: String,
        op: EventOp,
        data: serde_json::Value,
    ) -> i64 {
        state.next_id += 1;
        let event = Event {
            id: state.next_id,
            app_id,
            object_type,
            object_id,
            op,
            data,
            created_at: Utc::now(),
        };
        state.events.push(event.clone());
        state.tails.retain(|tail| tail.send(Ok(event.clone())).is_ok());
        event.id
    }

    // --- apps ---

    /// Creates an app and emits its `app` create event.
    pub fn create_app(&self, name: &str, meta: HashMap<String, String>) -> App {
        let now = Utc::now();
        let app = App {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            meta,
            strategy: "all-at-once".to_string(),
            deploy_timeout: 120,
            release_id: String::new(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let mut state = self.state.lock();
        let cursor = Self::append_event(
            &mut state,
            app.id.clone(),
            EventType::App,
            app.id.clone(),
            EventOp::Create,
            payload(&app),
        );
        state.apps.insert(app.id.clone(), Row { cursor, value: app.clone() });
        app
    }

    /// Convenience wrapper over the app update path.
    pub fn update_app_meta(&self, id: &str, meta: HashMap<String, String>) -> Result<App> {
        self.apply_app_update(
            id,
            AppUpdate {
                meta: Some(meta),
                ..AppUpdate::default()
            },
        )
    }

    fn apply_app_update(&self, id: &str, update: AppUpdate) -> Result<App> {
        let mut state = self.state.lock();
        let row = state
            .apps
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("app {id}")))?;
        if let Some(meta) = update.meta {
            row.value.meta = meta;
        }
        if let Some(strategy) = update.strategy {
            row.value.strategy = strategy;
        }
        if let Some(timeout) = update.deploy_timeout {
            row.value.deploy_timeout = timeout;
        }
        row.value.updated_at = Utc::now();
        let app = row.value.clone();
        Self::append_event(
            &mut state,
            app.id.clone(),
            EventType::App,
            app.id.clone(),
            EventOp::Update,
            payload(&app),
        );
        Ok(app)
    }

    /// Tombstones an app and emits an `app_deletion` event.
    pub fn delete_app(&self, id: &str) -> Result<App> {
        let mut state = self.state.lock();
        let row = state
            .apps
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("app {id}")))?;
        row.value.deleted_at = Some(Utc::now());
        row.value.updated_at = Utc::now();
        let app = row.value.clone();
        Self::append_event(
            &mut state,
            app.id.clone(),
            EventType::AppDeletion,
            app.id.clone(),
            EventOp::Create,
            payload(&app),
        );
        Ok(app)
    }

    /// Associates a release with an app and emits an `app_release` event.
    pub fn set_app_release(&self, app_id: &str, release_id: &str) -> Result<App> {
        let mut state = self.state.lock();
        if !state.releases.contains_key(release_id) {
            return Err(Error::NotFound(format!("release {release_id}")));
        }
        let row = state
            .apps
            .get_mut(app_id)
            .ok_or_else(|| Error::NotFound(format!("app {app_id}")))?;
        row.value.release_id = release_id.to_string();
        row.value.updated_at = Utc::now();
        let app = row.value.clone();
        Self::append_event(
            &mut state,
            app.id.clone(),
            EventType::AppRelease,
            app.id.clone(),
            EventOp::Create,
            payload(&app),
        );
        Ok(app)
    }

    fn get_app_sync(&self, id: &str) -> Result<App> {
        self.state
            .lock()
            .apps
            .get(id)
            .map(|row| row.value.clone())
            .ok_or_else(|| Error::NotFound(format!("app {id}")))
    }

    // --- releases ---

    /// Persists a release (assigning an id when absent) and emits its
    /// `release` create event.
    pub fn add_release(&self, release: &mut Release) -> Result<()> {
        if release.id.is_empty() {
            release.id = Uuid::new_v4().to_string();
        }
        let mut state = self.state.lock();
        let cursor = Self::append_event(
            &mut state,
            release.app_id.clone(),
            EventType::Release,
            release.id.clone(),
            EventOp::Create,
            payload(&*release),
        );
        state.releases.insert(
            release.id.clone(),
            Row {
                cursor,
                value: release.clone(),
            },
        );
        Ok(())
    }

    fn get_release_sync(&self, id: &str) -> Result<Release> {
        self.state
            .lock()
            .releases
            .get(id)
            .map(|row| row.value.clone())
            .ok_or_else(|| Error::NotFound(format!("release {id}")))
    }

    // --- scale requests ---

    fn add_scale_request_sync(&self, req: &mut ScaleRequest) -> Result<()> {
        if req.id.is_empty() {
            req.id = Uuid::new_v4().to_string();
        }
        let now = Utc::now();
        req.created_at = now;
        req.updated_at = now;
        let mut state = self.state.lock();
        let cursor = Self::append_event(
            &mut state,
            req.app_id.clone(),
            EventType::ScaleRequest,
            req.id.clone(),
            EventOp::Create,
            payload(&*req),
        );
        state.scales.insert(
            req.id.clone(),
            Row {
                cursor,
                value: req.clone(),
            },
        );
        Ok(())
    }

    /// Moves a scale request to a new state and emits the update event.
    pub fn set_scale_request_state(
        &self,
        id: &str,
        new_state: ScaleRequestState,
    ) -> Result<ScaleRequest> {
        let mut state = self.state.lock();
        let row = state
            .scales
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("scale request {id}")))?;
        row.value.state = new_state;
        row.value.updated_at = Utc::now();
        let req = row.value.clone();
        Self::append_event(
            &mut state,
            req.app_id.clone(),
            EventType::ScaleRequest,
            req.id.clone(),
            EventOp::Update,
            payload(&req),
        );
        Ok(req)
    }

    /// All scale requests, newest first (test observability).
    #[must_use]
    pub fn scale_requests(&self) -> Vec<ScaleRequest> {
        let state = self.state.lock();
        let mut rows: Vec<(i64, ScaleRequest)> = state
            .scales
            .values()
            .map(|row| (row.cursor, row.value.clone()))
            .collect();
        rows.sort_by(|a, b| b.0.cmp(&a.0));
        rows.into_iter().map(|(_, value)| value).collect()
    }

    // --- deployments ---

    fn add_deployment_sync(&self, app_id: &str, release_id: &str) -> Result<ExpandedDeployment> {
        let mut state = self.state.lock();
        let app = state
            .apps
            .get(app_id)
            .map(|row| row.value.clone())
            .ok_or_else(|| Error::NotFound(format!("app {app_id}")))?;
        if !state.releases.contains_key(release_id) {
            return Err(Error::NotFound(format!("release {release_id}")));
        }

        let deployment = Deployment {
            id: Uuid::new_v4().to_string(),
            app_id: app_id.to_string(),
            old_release_id: app.release_id.clone(),
            new_release_id: release_id.to_string(),
            strategy: app.strategy.clone(),
            status: DeploymentStatus::Pending,
            processes: HashMap::new(),
            tags: HashMap::new(),
            deploy_timeout: app.deploy_timeout,
            created_at: Utc::now(),
            finished_at: None,
        };
        // The row takes a log position; its events are the status
        // transitions recorded by put_deployment_event.
        state.next_id += 1;
        let cursor = state.next_id;
        state.deployments.insert(
            deployment.id.clone(),
            Row {
                cursor,
                value: deployment.clone(),
            },
        );
        drop(state);
        self.expand(deployment)
    }

    /// Records a deployment status transition: updates the row, emits the
    /// `deployment` event, and on completion promotes the target release to
    /// the app's current release.
    pub fn put_deployment_event(
        &self,
        deployment_id: &str,
        status: DeploymentStatus,
        job_type: &str,
        job_state: &str,
        error: &str,
    ) -> Result<()> {
        let mut state = self.state.lock();
        let row = state
            .deployments
            .get_mut(deployment_id)
            .ok_or_else(|| Error::NotFound(format!("deployment {deployment_id}")))?;
        row.value.status = status;
        if matches!(status, DeploymentStatus::Complete | DeploymentStatus::Failed) {
            row.value.finished_at = Some(Utc::now());
        }
        let deployment = row.value.clone();

        if status == DeploymentStatus::Complete {
            if let Some(app) = state.apps.get_mut(&deployment.app_id) {
                app.value.release_id = deployment.new_release_id.clone();
            }
        }

        let event = DeploymentEvent {
            app_id: deployment.app_id.clone(),
            deployment_id: deployment.id.clone(),
            release_id: deployment.new_release_id.clone(),
            status,
            job_type: job_type.to_string(),
            job_state: job_state.to_string(),
            error: error.to_string(),
        };
        Self::append_event(
            &mut state,
            deployment.app_id.clone(),
            EventType::Deployment,
            deployment.id,
            EventOp::Create,
            payload(&event),
        );
        Ok(())
    }

    fn expand(&self, deployment: Deployment) -> Result<ExpandedDeployment> {
        let state = self.state.lock();
        let old_release = state
            .releases
            .get(&deployment.old_release_id)
            .map(|row| row.value.clone());
        let new_release = state
            .releases
            .get(&deployment.new_release_id)
            .map(|row| row.value.clone());
        Ok(ExpandedDeployment {
            deployment,
            old_release,
            new_release,
        })
    }

    /// Appends a raw event to the log without touching any row. Lets tests
    /// exercise malformed payloads and at-least-once redelivery.
    pub fn emit_raw_event(
        &self,
        app_id: &str,
        object_type: EventType,
        object_id: &str,
        op: EventOp,
        data: serde_json::Value,
    ) -> i64 {
        let mut state = self.state.lock();
        Self::append_event(
            &mut state,
            app_id.to_string(),
            object_type,
            object_id.to_string(),
            op,
            data,
        )
    }
}

/// Sorts newest-first, applies the `before_id` watermark, and cuts one page.
fn page_rows<T>(mut rows: Vec<(i64, T)>, token: &PageToken) -> (Vec<T>, Option<PageToken>) {
    rows.sort_by(|a, b| b.0.cmp(&a.0));
    if let Some(before) = token.before_id {
        rows.retain(|(cursor, _)| *cursor < before);
    }
    if token.size > 0 && rows.len() > token.size {
        let page: Vec<(i64, T)> = rows.drain(..token.size).collect();
        let next = PageToken {
            size: token.size,
            before_id: page.last().map(|(cursor, _)| *cursor),
        };
        (page.into_iter().map(|(_, value)| value).collect(), Some(next))
    } else {
        (rows.into_iter().map(|(_, value)| value).collect(), None)
    }
}

fn contains_or_empty(ids: &[String], id: &str) -> bool {
    ids.is_empty() || ids.iter().any(|candidate| candidate == id)
}

#[async_trait]
impl ChangeLog for MemoryStore {
    async fn listen(&self) -> Result<mpsc::UnboundedReceiver<TailItem>> {
        if self.listen_error.load(Ordering::Acquire) {
            return Err(Error::Unavailable("change log unreachable".into()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().tails.push(tx);
        Ok(rx)
    }
}

#[async_trait]
impl AppRepo for MemoryStore {
    async fn list_page(&self, opts: ListAppOptions) -> Result<(Vec<App>, Option<PageToken>)> {
        let state = self.state.lock();
        let rows: Vec<(i64, App)> = state
            .apps
            .values()
            .filter(|row| row.value.deleted_at.is_none())
            .map(|row| (row.cursor, row.value.clone()))
            .collect();
        drop(state);
        Ok(page_rows(rows, &opts.page_token))
    }

    async fn get(&self, id: &str) -> Result<App> {
        self.get_app_sync(id)
    }

    async fn update(&self, id: &str, update: AppUpdate) -> Result<App> {
        self.apply_app_update(id, update)
    }
}

#[async_trait]
impl ReleaseRepo for MemoryStore {
    async fn add(&self, release: &mut Release) -> Result<()> {
        self.add_release(release)
    }

    async fn get(&self, id: &str) -> Result<Release> {
        self.get_release_sync(id)
    }
}

#[async_trait]
impl ScaleRepo for MemoryStore {
    async fn add_scale_request(&self, req: &mut ScaleRequest) -> Result<()> {
        self.add_scale_request_sync(req)
    }

    async fn list_scale_requests(
        &self,
        opts: ListScaleOptions,
    ) -> Result<(Vec<ScaleRequest>, Option<PageToken>)> {
        let state = self.state.lock();
        let rows: Vec<(i64, ScaleRequest)> = state
            .scales
            .values()
            .filter(|row| {
                contains_or_empty(&opts.app_ids, &row.value.app_id)
                    && contains_or_empty(&opts.release_ids, &row.value.release_id)
                    && contains_or_empty(&opts.scale_ids, &row.value.id)
            })
            .map(|row| (row.cursor, row.value.clone()))
            .collect();
        drop(state);
        Ok(page_rows(rows, &opts.page_token))
    }
}

#[async_trait]
impl DeploymentRepo for MemoryStore {
    async fn add(&self, app_id: &str, release_id: &str) -> Result<ExpandedDeployment> {
        self.add_deployment_sync(app_id, release_id)
    }

    async fn get(&self, id: &str) -> Result<Deployment> {
        self.state
            .lock()
            .deployments
            .get(id)
            .map(|row| row.value.clone())
            .ok_or_else(|| Error::NotFound(format!("deployment {id}")))
    }

    async fn get_expanded(&self, id: &str) -> Result<ExpandedDeployment> {
        let deployment = DeploymentRepo::get(self, id).await?;
        self.expand(deployment)
    }

    async fn list_page(
        &self,
        opts: ListDeploymentOptions,
    ) -> Result<(Vec<ExpandedDeployment>, Option<PageToken>)> {
        let state = self.state.lock();
        let rows: Vec<(i64, Deployment)> = state
            .deployments
            .values()
            .filter(|row| {
                contains_or_empty(&opts.app_ids, &row.value.app_id)
                    && contains_or_empty(&opts.deployment_ids, &row.value.id)
            })
            .map(|row| (row.cursor, row.value.clone()))
            .collect();
        drop(state);
        let (page, next) = page_rows(rows, &opts.page_token);
        let expanded = page
            .into_iter()
            .map(|deployment| self.expand(deployment))
            .collect::<Result<Vec<_>>>()?;
        Ok((expanded, next))
    }
}

#[async_trait]
impl EventRepo for MemoryStore {
    async fn list_events(
        &self,
        app_ids: &[String],
        object_types: &[EventType],
        object_ids: &[String],
        before_id: Option<i64>,
        count: usize,
    ) -> Result<Vec<Event>> {
        let state = self.state.lock();
        let mut out = Vec::new();
        for event in state.events.iter().rev() {
            if let Some(before) = before_id {
                if event.id >= before {
                    continue;
                }
            }
            if !app_ids.is_empty() && !app_ids.iter().any(|id| *id == event.app_id) {
                continue;
            }
            if !object_types.is_empty() && !object_types.contains(&event.object_type) {
                continue;
            }
            if !object_ids.is_empty() && !object_ids.iter().any(|id| *id == event.object_id) {
                continue;
            }
            out.push(event.clone());
            if count > 0 && out.len() == count {
                break;
            }
        }
        Ok(out)
    }
}
