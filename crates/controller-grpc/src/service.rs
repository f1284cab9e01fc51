//! The `Controller` service implementation.
//!
//! Every `Stream*` operation follows the same merge protocol: parse the
//! request, subscribe to the bus first (streaming requests only), read the
//! historical snapshot, emit it as one `page_complete` response, then
//! forward filtered live events until the client goes away, the
//! subscription dies, or an operation-specific terminal condition holds.
//! Subscribing before the snapshot read means an event landing between the
//! two is seen by the subscription; the seam guard suppresses the copy that
//! is already reflected in the snapshot.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use chrono::Utc;
use futures::Stream;
use tokio::sync::mpsc;
use tonic::{Request, Response, Status};
use tracing::warn;

use controller_core::bus::EventBus;
use controller_core::labels::{match_label_filters, ReleaseTypeMatcher};
use controller_core::names;
use controller_core::page_token::PageToken;
use controller_core::seam::{SeamGuard, StreamFlags};
use controller_core::store::{
    AppRepo, AppUpdate, ChangeLog, DeploymentRepo, EventRepo, ListAppOptions,
    ListDeploymentOptions, ListScaleOptions, ReleaseRepo, ScaleRepo,
};
use controller_core::subscription::subscribe_events;
use controller_core::types as ct;
use controller_core::types::{DeploymentStatus, EventType, ScaleRequestState};
use controller_core::Error;
use controller_core::memory::MemoryStore;

use crate::convert;
use crate::proto;
use crate::proto::controller_server::Controller;
use crate::server::ControllerConfig;

/// Queue depth for per-RPC response channels; sends block on a slow
/// transport, which is the flow control the stream loop relies on.
const STREAM_BUFFER: usize = 16;

/// Bridges a response channel into the stream type tonic expects.
#[derive(Debug)]
pub struct ResponseStream<T> {
    rx: mpsc::Receiver<Result<T, Status>>,
}

impl<T> ResponseStream<T> {
    fn new(rx: mpsc::Receiver<Result<T, Status>>) -> Self {
        Self { rx }
    }
}

impl<T> Stream for ResponseStream<T> {
    type Item = Result<T, Status>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// The controller RPC service.
///
/// Cheap to clone: repos and the bus are shared behind `Arc`.
#[derive(Clone)]
pub struct ControllerService {
    apps: Arc<dyn AppRepo>,
    releases: Arc<dyn ReleaseRepo>,
    scales: Arc<dyn ScaleRepo>,
    deployments: Arc<dyn DeploymentRepo>,
    events: Arc<dyn EventRepo>,
    bus: Arc<EventBus>,
    config: ControllerConfig,
}

impl ControllerService {
    /// Wires the service over an in-memory store.
    #[must_use]
    pub fn new(store: Arc<MemoryStore>, config: ControllerConfig) -> Self {
        let bus = Arc::new(EventBus::new(Arc::clone(&store) as Arc<dyn ChangeLog>));
        Self::with_repos(
            Arc::clone(&store) as Arc<dyn AppRepo>,
            Arc::clone(&store) as Arc<dyn ReleaseRepo>,
            Arc::clone(&store) as Arc<dyn ScaleRepo>,
            Arc::clone(&store) as Arc<dyn DeploymentRepo>,
            store as Arc<dyn EventRepo>,
            bus,
            config,
        )
    }

    /// Wires the service over arbitrary storage collaborators.
    #[must_use]
    pub fn with_repos(
        apps: Arc<dyn AppRepo>,
        releases: Arc<dyn ReleaseRepo>,
        scales: Arc<dyn ScaleRepo>,
        deployments: Arc<dyn DeploymentRepo>,
        events: Arc<dyn EventRepo>,
        bus: Arc<EventBus>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            apps,
            releases,
            scales,
            deployments,
            events,
            bus,
            config,
        }
    }

    /// Handle to the shared event bus.
    #[must_use]
    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Fetches one label- and name-filtered page of apps, following the
    /// next-token chain to fill the page when filters thin it out. Older
    /// pages are prepended, so the fill never reorders within a page.
    async fn list_apps(
        &self,
        req: &proto::StreamAppsRequest,
    ) -> Result<(Vec<proto::App>, Option<PageToken>), Error> {
        let mut token = PageToken::parse(&req.page_token)?;
        let mut page_size = usize::try_from(req.page_size.max(0)).unwrap_or(0);
        if page_size > 0 {
            token.size = page_size;
        } else {
            page_size = token.size;
        }

        let label_filters = convert::label_filters(&req.label_filters);
        let app_filters = names::parse_app_ids_from_name_filters(&req.name_filters);

        let mut apps: Vec<proto::App> = Vec::new();
        let mut current = token;
        let next_token = loop {
            let (page, next) = match self
                .apps
                .list_page(ListAppOptions {
                    page_token: current.clone(),
                })
                .await
            {
                Ok(result) => result,
                Err(err) => {
                    // The first fetch fails the RPC; a fill fetch settles
                    // for what we have and hands the client the cursor.
                    if apps.is_empty() {
                        return Err(err);
                    }
                    break Some(current);
                }
            };

            let mut filtered: Vec<proto::App> = Vec::new();
            for app in &page {
                if !app_filters.is_empty()
                    && !app_filters
                        .iter()
                        .any(|filter| *filter == app.id || *filter == app.name)
                {
                    continue;
                }
                if !match_label_filters(&app.meta, &label_filters) {
                    continue;
                }
                filtered.push(convert::app(app));
                if page_size > 0 && filtered.len() == page_size {
                    break;
                }
            }
            // Subsequent (older) pages sit before what is already collected.
            filtered.extend(apps.drain(..));
            apps = filtered;

            match next {
                Some(next) if page_size > 0 && apps.len() < page_size => current = next,
                other => break other,
            }
        };

        Ok((apps, next_token))
    }

    /// The synchronous scale path shared by `CreateScale` and the embedded
    /// scale of `CreateDeployment`: insert pending, then block on the bus
    /// until the request reaches a terminal state or the wait times out.
    async fn create_scale_inner(
        &self,
        req: &proto::CreateScaleRequest,
    ) -> Result<ct::ScaleRequest, Error> {
        let app_id = names::parse_id_from_name(&req.parent, "apps").to_string();
        let release_id = names::parse_id_from_name(&req.parent, "releases").to_string();
        if app_id.is_empty() || release_id.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "malformed scale parent {:?}",
                req.parent
            )));
        }

        // Subscribe before inserting so the terminal event cannot slip
        // between the write and the watch.
        let mut sub = subscribe_events(
            &self.bus,
            std::slice::from_ref(&app_id),
            &[EventType::ScaleRequest],
            &[],
        )
        .await?;

        let now = Utc::now();
        let mut scale = ct::ScaleRequest {
            id: String::new(),
            app_id,
            release_id,
            state: ScaleRequestState::Pending,
            old_processes: Default::default(),
            new_processes: req.processes.clone(),
            old_tags: Default::default(),
            new_tags: convert::process_tags_from_proto(&req.tags),
            created_at: now,
            updated_at: now,
        };
        self.scales.add_scale_request(&mut scale).await?;

        let wait = self.config.scale_request_timeout;
        let timeout = tokio::time::sleep(wait);
        tokio::pin!(timeout);

        let result = loop {
            tokio::select! {
                event = sub.next_event() => {
                    let Some(event) = event else { break Ok(scale.clone()) };
                    if event.object_type != EventType::ScaleRequest {
                        continue;
                    }
                    let updated: ct::ScaleRequest = match serde_json::from_value(event.data.clone()) {
                        Ok(updated) => updated,
                        Err(err) => {
                            warn!(event_id = event.id, error = %err, "skipping undecodable scale event payload");
                            continue;
                        }
                    };
                    if updated.id != scale.id {
                        continue;
                    }
                    match updated.state {
                        ScaleRequestState::Cancelled => {
                            break Err(Error::Aborted("scale request cancelled".into()));
                        }
                        ScaleRequestState::Complete => break Ok(updated),
                        ScaleRequestState::Pending => {}
                    }
                }
                () = &mut timeout => {
                    break Err(Error::DeadlineExceeded(format!(
                        "scale to complete (waited {}s)",
                        wait.as_secs()
                    )));
                }
            }
        };

        if let Some(err) = sub.terminal_error() {
            return Err(err);
        }
        result
    }
}

#[tonic::async_trait]
impl Controller for ControllerService {
    type StreamAppsStream = ResponseStream<proto::StreamAppsResponse>;
    type StreamReleasesStream = ResponseStream<proto::StreamReleasesResponse>;
    type StreamScalesStream = ResponseStream<proto::StreamScalesResponse>;
    type StreamDeploymentsStream = ResponseStream<proto::StreamDeploymentsResponse>;
    type CreateDeploymentStream = ResponseStream<proto::DeploymentEvent>;

    async fn stream_apps(
        &self,
        request: Request<proto::StreamAppsRequest>,
    ) -> Result<Response<Self::StreamAppsStream>, Status> {
        let req = request.into_inner();
        let flags = StreamFlags {
            creates: req.stream_creates,
            updates: req.stream_updates,
        };

        let sub = if flags.is_unary() {
            None
        } else {
            let app_ids = names::parse_app_ids_from_name_filters(&req.name_filters);
            let sub = subscribe_events(
                &self.bus,
                &app_ids,
                &[EventType::App, EventType::AppDeletion, EventType::AppRelease],
                &[],
            )
            .await
            .map_err(|err| convert::error_status(&err))?;
            Some(sub)
        };

        let (apps, next_token) = self
            .list_apps(&req)
            .await
            .map_err(|err| convert::error_status(&err))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let _ = tx
            .send(Ok(proto::StreamAppsResponse {
                apps,
                page_complete: true,
                next_page_token: PageToken::encode_opt(next_token.as_ref()),
            }))
            .await;

        if let Some(mut sub) = sub {
            let label_filters = convert::label_filters(&req.label_filters);
            tokio::spawn(async move {
                let mut seam = SeamGuard::default();
                while let Some(event) = sub.next_event().await {
                    if !seam.admit(event.id) {
                        continue;
                    }
                    let wanted = match event.object_type {
                        EventType::App => flags.admits(event.op),
                        // Deletions and release associations surface as
                        // updates; deletion carries the tombstone field.
                        EventType::AppDeletion | EventType::AppRelease => flags.updates,
                        _ => false,
                    };
                    if !wanted {
                        continue;
                    }
                    let app: ct::App = match serde_json::from_value(event.data.clone()) {
                        Ok(app) => app,
                        Err(err) => {
                            warn!(event_id = event.id, error = %err, "skipping undecodable app event payload");
                            continue;
                        }
                    };
                    if !match_label_filters(&app.meta, &label_filters) {
                        continue;
                    }
                    let response = proto::StreamAppsResponse {
                        apps: vec![convert::app(&app)],
                        ..Default::default()
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
                if let Some(err) = sub.terminal_error() {
                    let _ = tx.send(Err(convert::error_status(&err))).await;
                }
            });
        }

        Ok(Response::new(ResponseStream::new(rx)))
    }

    async fn update_app(
        &self,
        request: Request<proto::UpdateAppRequest>,
    ) -> Result<Response<proto::App>, Status> {
        let req = request.into_inner();
        let app = req
            .app
            .ok_or_else(|| Status::invalid_argument("app is required"))?;
        let app_id = names::parse_id_from_name(&app.name, "apps");
        if app_id.is_empty() {
            return Err(Status::invalid_argument(format!(
                "malformed app name {:?}",
                app.name
            )));
        }

        // Without a mask, every non-zero field of the projection is written.
        let mut update = AppUpdate {
            meta: Some(app.labels.clone()),
            strategy: (!app.strategy.is_empty()).then(|| app.strategy.clone()),
            deploy_timeout: (app.deploy_timeout > 0).then_some(app.deploy_timeout),
        };
        if let Some(mask) = &req.update_mask {
            if !mask.paths.is_empty() {
                let mut masked = AppUpdate::default();
                for path in &mask.paths {
                    match path.as_str() {
                        "labels" | "meta" => masked.meta = update.meta.take(),
                        "strategy" => masked.strategy = update.strategy.take(),
                        "deploy_timeout" => masked.deploy_timeout = update.deploy_timeout.take(),
                        _ => {}
                    }
                }
                update = masked;
            }
        }

        let updated = self
            .apps
            .update(app_id, update)
            .await
            .map_err(|err| convert::error_status(&err))?;
        Ok(Response::new(convert::app(&updated)))
    }

    async fn stream_releases(
        &self,
        request: Request<proto::StreamReleasesRequest>,
    ) -> Result<Response<Self::StreamReleasesStream>, Status> {
        let req = request.into_inner();
        let flags = StreamFlags {
            creates: req.stream_creates,
            updates: req.stream_updates,
        };
        let mut token =
            PageToken::parse(&req.page_token).map_err(|err| convert::error_status(&err))?;
        let mut page_size = usize::try_from(req.page_size.max(0)).unwrap_or(0);
        if page_size > 0 {
            token.size = page_size;
        } else {
            page_size = token.size;
        }

        let mut event_app_ids = names::parse_app_ids_from_name_filters(&req.name_filters);
        let app_ids: HashSet<String> = event_app_ids.iter().cloned().collect();
        let release_ids: HashSet<String> =
            names::parse_ids_from_name_filters(&req.name_filters, "releases")
                .into_iter()
                .collect();
        if !release_ids.is_empty() {
            // The log query and subscription filter on one id kind at a
            // time; widen to all apps and re-filter per event below.
            event_app_ids.clear();
        }
        let label_filters = convert::label_filters(&req.label_filters);

        // Shared accept predicate for snapshot and tail.
        let accept = {
            let app_ids = app_ids.clone();
            let release_ids = release_ids.clone();
            let label_filters = label_filters.clone();
            move |event: &ct::Event| -> Option<proto::Release> {
                if !release_ids.is_empty()
                    && !release_ids.contains(&event.object_id)
                    && (app_ids.is_empty() || !app_ids.contains(&event.app_id))
                {
                    return None;
                }
                let release: ct::Release = match serde_json::from_value(event.data.clone()) {
                    Ok(release) => release,
                    Err(err) => {
                        warn!(event_id = event.id, error = %err, "skipping undecodable release event payload");
                        return None;
                    }
                };
                if !match_label_filters(&release.meta, &label_filters) {
                    return None;
                }
                Some(convert::release(&release))
            }
        };

        let sub = if flags.is_unary() {
            None
        } else {
            let sub = subscribe_events(&self.bus, &event_app_ids, &[EventType::Release], &[])
                .await
                .map_err(|err| convert::error_status(&err))?;
            Some(sub)
        };

        // The snapshot is drawn from the change log itself: releases are
        // append-only, so their events are the canonical history. Fetch one
        // extra to learn whether another page exists.
        let count = if page_size > 0 { page_size + 1 } else { 0 };
        let mut events_page = self
            .events
            .list_events(
                &event_app_ids,
                &[EventType::Release],
                &[],
                token.before_id,
                count,
            )
            .await
            .map_err(|err| convert::error_status(&err))?;

        let mut next_token: Option<PageToken> = None;
        if page_size > 0 && events_page.len() == page_size + 1 {
            events_page.truncate(page_size);
            next_token = Some(PageToken {
                size: page_size,
                before_id: events_page.last().map(|event| event.id),
            });
        }

        let mut seam = SeamGuard::new(token.before_id.unwrap_or(0));
        let mut releases: Vec<proto::Release> = Vec::new();
        // The page is newest-first; prepend oldest-first so the newest copy
        // of a re-listed release name wins.
        for event in events_page.iter().rev() {
            seam.advance(event.id);
            let Some(release) = accept(event) else { continue };
            releases.retain(|existing| existing.name != release.name);
            releases.insert(0, release);
        }

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let _ = tx
            .send(Ok(proto::StreamReleasesResponse {
                releases,
                page_complete: true,
                next_page_token: PageToken::encode_opt(next_token.as_ref()),
            }))
            .await;

        if let Some(mut sub) = sub {
            tokio::spawn(async move {
                while let Some(event) = sub.next_event().await {
                    if !seam.admit(event.id) {
                        continue;
                    }
                    if !flags.admits(event.op) {
                        continue;
                    }
                    let Some(release) = accept(&event) else { continue };
                    let response = proto::StreamReleasesResponse {
                        releases: vec![release],
                        ..Default::default()
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
                if let Some(err) = sub.terminal_error() {
                    let _ = tx.send(Err(convert::error_status(&err))).await;
                }
            });
        }

        Ok(Response::new(ResponseStream::new(rx)))
    }

    async fn create_release(
        &self,
        request: Request<proto::CreateReleaseRequest>,
    ) -> Result<Response<proto::Release>, Status> {
        let req = request.into_inner();
        let body = req
            .release
            .ok_or_else(|| Status::invalid_argument("release is required"))?;
        let app_id = names::parse_id_from_name(&req.parent, "apps").to_string();
        if app_id.is_empty() {
            return Err(Status::invalid_argument(format!(
                "malformed parent name {:?}",
                req.parent
            )));
        }

        let mut release = convert::release_from_proto(&body);
        release.app_id = app_id;
        self.releases
            .add(&mut release)
            .await
            .map_err(|err| convert::error_status(&err))?;
        Ok(Response::new(convert::release(&release)))
    }

    async fn stream_scales(
        &self,
        request: Request<proto::StreamScalesRequest>,
    ) -> Result<Response<Self::StreamScalesStream>, Status> {
        let req = request.into_inner();
        let flags = StreamFlags {
            creates: req.stream_creates,
            updates: req.stream_updates,
        };
        let mut token =
            PageToken::parse(&req.page_token).map_err(|err| convert::error_status(&err))?;
        let page_size = usize::try_from(req.page_size.max(0)).unwrap_or(0);
        if page_size > 0 {
            token.size = page_size;
        }

        let app_ids = names::parse_ids_from_name_filters(&req.name_filters, "apps");
        let release_ids = names::parse_ids_from_name_filters(&req.name_filters, "releases");
        let scale_ids = names::parse_ids_from_name_filters(&req.name_filters, "scales");

        // The bus cannot filter on app id and release id at once: with
        // release filters present the subscription widens and the live loop
        // re-filters.
        let (stream_app_ids, stream_scale_ids) = if release_ids.is_empty() {
            (app_ids.clone(), scale_ids.clone())
        } else {
            (Vec::new(), Vec::new())
        };

        let sub = if flags.is_unary() {
            None
        } else {
            let sub = subscribe_events(
                &self.bus,
                &stream_app_ids,
                &[EventType::ScaleRequest],
                &stream_scale_ids,
            )
            .await
            .map_err(|err| convert::error_status(&err))?;
            Some(sub)
        };

        let (list, next_token) = self
            .scales
            .list_scale_requests(ListScaleOptions {
                page_token: token,
                app_ids: app_ids.clone(),
                release_ids: release_ids.clone(),
                scale_ids: scale_ids.clone(),
            })
            .await
            .map_err(|err| convert::error_status(&err))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let _ = tx
            .send(Ok(proto::StreamScalesResponse {
                scale_requests: list.iter().map(convert::scale_request).collect(),
                page_complete: true,
                next_page_token: PageToken::encode_opt(next_token.as_ref()),
            }))
            .await;

        if let Some(mut sub) = sub {
            tokio::spawn(async move {
                let mut seam = SeamGuard::default();
                let filtered = !(app_ids.is_empty() && release_ids.is_empty() && scale_ids.is_empty());
                while let Some(event) = sub.next_event().await {
                    if !seam.admit(event.id) {
                        continue;
                    }
                    if !flags.admits(event.op) {
                        continue;
                    }
                    let scale: ct::ScaleRequest = match serde_json::from_value(event.data.clone()) {
                        Ok(scale) => scale,
                        Err(err) => {
                            warn!(event_id = event.id, error = %err, "skipping undecodable scale event payload");
                            continue;
                        }
                    };
                    if filtered
                        && !(app_ids.contains(&scale.app_id)
                            || release_ids.contains(&scale.release_id)
                            || scale_ids.contains(&scale.id))
                    {
                        continue;
                    }
                    let response = proto::StreamScalesResponse {
                        scale_requests: vec![convert::scale_request(&scale)],
                        ..Default::default()
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
                if let Some(err) = sub.terminal_error() {
                    let _ = tx.send(Err(convert::error_status(&err))).await;
                }
            });
        }

        Ok(Response::new(ResponseStream::new(rx)))
    }

    async fn create_scale(
        &self,
        request: Request<proto::CreateScaleRequest>,
    ) -> Result<Response<proto::ScaleRequest>, Status> {
        let req = request.into_inner();
        let scale = self
            .create_scale_inner(&req)
            .await
            .map_err(|err| convert::error_status(&err))?;
        Ok(Response::new(convert::scale_request(&scale)))
    }

    async fn stream_deployments(
        &self,
        request: Request<proto::StreamDeploymentsRequest>,
    ) -> Result<Response<Self::StreamDeploymentsStream>, Status> {
        let req = request.into_inner();
        let flags = StreamFlags {
            creates: req.stream_creates,
            updates: req.stream_updates,
        };
        let mut token =
            PageToken::parse(&req.page_token).map_err(|err| convert::error_status(&err))?;
        if req.page_size > 0 {
            token.size = usize::try_from(req.page_size).unwrap_or(0);
        }

        let app_ids = names::parse_ids_from_name_filters(&req.name_filters, "apps");
        let deployment_ids = names::parse_ids_from_name_filters(&req.name_filters, "deployments");
        let type_matcher = ReleaseTypeMatcher::new(convert::type_filters(&req.type_filters));

        let sub = if flags.is_unary() {
            None
        } else {
            let sub = subscribe_events(
                &self.bus,
                &app_ids,
                &[EventType::Deployment],
                &deployment_ids,
            )
            .await
            .map_err(|err| convert::error_status(&err))?;
            Some(sub)
        };

        let (list, next_token) = self
            .deployments
            .list_page(ListDeploymentOptions {
                page_token: token,
                app_ids,
                deployment_ids,
            })
            .await
            .map_err(|err| convert::error_status(&err))?;
        let deployments: Vec<proto::ExpandedDeployment> = list
            .iter()
            .filter(|expanded| type_matcher.matches(expanded.release_type()))
            .map(convert::expanded_deployment)
            .collect();

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let _ = tx
            .send(Ok(proto::StreamDeploymentsResponse {
                deployments,
                page_complete: true,
                next_page_token: PageToken::encode_opt(next_token.as_ref()),
            }))
            .await;

        if let Some(mut sub) = sub {
            let repo = Arc::clone(&self.deployments);
            tokio::spawn(async move {
                let mut seam = SeamGuard::default();
                while let Some(event) = sub.next_event().await {
                    if !seam.admit(event.id) {
                        continue;
                    }
                    if !flags.admits(event.op) {
                        continue;
                    }
                    let de: ct::DeploymentEvent = match serde_json::from_value(event.data.clone()) {
                        Ok(de) => de,
                        Err(err) => {
                            warn!(event_id = event.id, error = %err, "skipping undecodable deployment event payload");
                            continue;
                        }
                    };
                    // Per-event freshness: re-fetch the expanded deployment
                    // and overlay the status carried by the event.
                    let mut expanded = match repo.get_expanded(&event.object_id).await {
                        Ok(expanded) => expanded,
                        Err(err) => {
                            warn!(deployment = %event.object_id, error = %err, "could not expand deployment event");
                            continue;
                        }
                    };
                    expanded.deployment.status = de.status;
                    if !type_matcher.matches(expanded.release_type()) {
                        continue;
                    }
                    let response = proto::StreamDeploymentsResponse {
                        deployments: vec![convert::expanded_deployment(&expanded)],
                        ..Default::default()
                    };
                    if tx.send(Ok(response)).await.is_err() {
                        break;
                    }
                }
                if let Some(err) = sub.terminal_error() {
                    let _ = tx.send(Err(convert::error_status(&err))).await;
                }
            });
        }

        Ok(Response::new(ResponseStream::new(rx)))
    }

    async fn create_deployment(
        &self,
        request: Request<proto::CreateDeploymentRequest>,
    ) -> Result<Response<Self::CreateDeploymentStream>, Status> {
        let req = request.into_inner();
        let app_id = names::parse_id_from_name(&req.parent, "apps").to_string();
        let release_id = names::parse_id_from_name(&req.release, "releases").to_string();
        if app_id.is_empty() || release_id.is_empty() {
            return Err(Status::invalid_argument(
                "parent must name an app and release a release",
            ));
        }

        let expanded = self
            .deployments
            .add(&app_id, &release_id)
            .await
            .map_err(|err| convert::error_status(&err))?;
        let deployment_id = expanded.deployment.id.clone();

        let mut sub = subscribe_events(
            &self.bus,
            std::slice::from_ref(&app_id),
            &[EventType::Deployment],
            std::slice::from_ref(&deployment_id),
        )
        .await
        .map_err(|err| convert::error_status(&err))?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let svc = self.clone();
        let scale_request = req.scale_request;
        tokio::spawn(async move {
            let mut terminal: Option<Error> = None;
            let mut seam = SeamGuard::default();
            while let Some(event) = sub.next_event().await {
                if !seam.admit(event.id) {
                    continue;
                }
                if event.object_type != EventType::Deployment {
                    continue;
                }
                let de: ct::DeploymentEvent = match serde_json::from_value(event.data.clone()) {
                    Ok(de) => de,
                    Err(err) => {
                        warn!(event_id = event.id, error = %err, "skipping undecodable deployment event payload");
                        continue;
                    }
                };
                let mut expanded = match svc.deployments.get_expanded(&event.object_id).await {
                    Ok(expanded) => expanded,
                    Err(err) => {
                        warn!(deployment = %event.object_id, error = %err, "could not fetch deployment");
                        continue;
                    }
                };
                expanded.deployment.status = de.status;

                // Scale the new release once the deployment completes.
                if de.status == DeploymentStatus::Complete {
                    if let Some(scale) = &scale_request {
                        let embedded = proto::CreateScaleRequest {
                            parent: convert::release_name(
                                &expanded.deployment.app_id,
                                &expanded.deployment.new_release_id,
                            ),
                            processes: scale.processes.clone(),
                            tags: scale.tags.clone(),
                        };
                        if let Err(err) = svc.create_scale_inner(&embedded).await {
                            warn!(error = %err, "embedded scale request did not complete");
                        }
                    }
                }

                let message = proto::DeploymentEvent {
                    deployment: Some(convert::expanded_deployment(&expanded)),
                    job_type: de.job_type.clone(),
                    job_state: de.job_state.clone(),
                    error: de.error.clone(),
                    create_time: Some(convert::timestamp(&event.created_at)),
                };
                if tx.send(Ok(message)).await.is_err() {
                    break;
                }

                match de.status {
                    DeploymentStatus::Failed => {
                        let cause = if de.error.is_empty() {
                            "deployment failed".to_string()
                        } else {
                            de.error.clone()
                        };
                        terminal = Some(Error::FailedPrecondition(cause));
                        break;
                    }
                    DeploymentStatus::Complete => break,
                    _ => {}
                }
            }
            if let Some(err) = sub.terminal_error() {
                terminal.get_or_insert(err);
            }
            if let Some(err) = terminal {
                let _ = tx.send(Err(convert::error_status(&err))).await;
            }
        });

        Ok(Response::new(ResponseStream::new(rx)))
    }
}
