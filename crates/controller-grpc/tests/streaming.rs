//! End-to-end streaming scenarios over the in-memory store.
//!
//! Exercises the snapshot+tail merge: unary pages, live fan-out, filter
//! suppression, pagination without duplicates, and the update-app write
//! path observed through a stream.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{Stream, StreamExt};
use tonic::Request;

use controller_core::memory::MemoryStore;
use controller_core::names;
use controller_core::types::Release;
use controller_grpc::proto;
use controller_grpc::proto::controller_server::Controller;
use controller_grpc::server::ControllerConfig;
use controller_grpc::service::ControllerService;

fn service(store: &Arc<MemoryStore>) -> ControllerService {
    ControllerService::new(Arc::clone(store), ControllerConfig::default())
}

fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn new_release(app_id: &str, artifacts: &[&str]) -> Release {
    Release {
        id: String::new(),
        app_id: app_id.to_string(),
        artifact_ids: artifacts.iter().map(|a| (*a).to_string()).collect(),
        env: HashMap::new(),
        meta: HashMap::new(),
        created_at: Utc::now(),
    }
}

async fn recv<S, T>(stream: &mut S) -> T
where
    S: Stream<Item = Result<T, tonic::Status>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("timed out waiting for a stream message")
        .expect("stream ended unexpectedly")
        .expect("stream returned an error status")
}

#[tokio::test]
async fn test_unary_stream_apps_with_label_filter() {
    let store = Arc::new(MemoryStore::new());
    store.create_app("one", labels(&[("env", "prod")]));
    store.create_app("two", labels(&[("env", "prod")]));
    store.create_app("three", labels(&[("env", "dev")]));
    let svc = service(&store);

    let req = proto::StreamAppsRequest {
        label_filters: vec![proto::LabelFilter {
            labels: labels(&[("env", "prod")]),
        }],
        ..Default::default()
    };
    let mut stream = svc
        .stream_apps(Request::new(req))
        .await
        .unwrap()
        .into_inner();

    let first = recv(&mut stream).await;
    assert!(first.page_complete);
    assert_eq!(first.apps.len(), 2);
    assert!(first
        .apps
        .iter()
        .all(|app| app.labels.get("env") == Some(&"prod".to_string())));

    // Unary request: the stream ends after the snapshot.
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_stream_apps_emits_live_creates() {
    let store = Arc::new(MemoryStore::new());
    store.create_app("seed", HashMap::new());
    let svc = service(&store);

    let req = proto::StreamAppsRequest {
        stream_creates: true,
        ..Default::default()
    };
    let mut stream = svc
        .stream_apps(Request::new(req))
        .await
        .unwrap()
        .into_inner();

    let first = recv(&mut stream).await;
    assert!(first.page_complete);
    assert_eq!(first.apps.len(), 1);

    let created = store.create_app("x", HashMap::new());
    let second = recv(&mut stream).await;
    assert!(!second.page_complete);
    assert_eq!(second.apps.len(), 1);
    assert_eq!(second.apps[0].display_name, "x");
    assert_eq!(
        names::parse_id_from_name(&second.apps[0].name, "apps"),
        created.id
    );
}

#[tokio::test]
async fn test_stream_apps_suppresses_filtered_creates() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(&store);

    let req = proto::StreamAppsRequest {
        stream_creates: true,
        label_filters: vec![proto::LabelFilter {
            labels: labels(&[("env", "prod")]),
        }],
        ..Default::default()
    };
    let mut stream = svc
        .stream_apps(Request::new(req))
        .await
        .unwrap()
        .into_inner();
    let first = recv(&mut stream).await;
    assert!(first.apps.is_empty());

    // Filtered out: never surfaces. The prod app created afterwards is the
    // next message, proving the dev app was skipped rather than delayed.
    store.create_app("dev-app", labels(&[("env", "dev")]));
    let prod = store.create_app("prod-app", labels(&[("env", "prod")]));

    let second = recv(&mut stream).await;
    assert_eq!(second.apps.len(), 1);
    assert_eq!(
        names::parse_id_from_name(&second.apps[0].name, "apps"),
        prod.id
    );
}

#[tokio::test]
async fn test_stream_apps_deletion_emits_tombstone_on_update_stream() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("doomed", HashMap::new());
    let svc = service(&store);

    let req = proto::StreamAppsRequest {
        stream_updates: true,
        ..Default::default()
    };
    let mut stream = svc
        .stream_apps(Request::new(req))
        .await
        .unwrap()
        .into_inner();
    let _first = recv(&mut stream).await;

    store.delete_app(&app.id).unwrap();
    let second = recv(&mut stream).await;
    assert_eq!(second.apps.len(), 1);
    assert_eq!(
        names::parse_id_from_name(&second.apps[0].name, "apps"),
        app.id
    );
    assert!(second.apps[0].delete_time.is_some());
}

#[tokio::test]
async fn test_stream_releases_pages_without_duplicates() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("app", HashMap::new());
    let mut ids = Vec::new();
    for i in 0..5 {
        let mut release = new_release(&app.id, &[&format!("artifact-{i}")]);
        store.add_release(&mut release).unwrap();
        ids.push(release.id);
    }
    let svc = service(&store);

    let mut seen = Vec::new();
    let mut page_token = String::new();
    loop {
        let req = proto::StreamReleasesRequest {
            page_size: 2,
            page_token: page_token.clone(),
            ..Default::default()
        };
        let mut stream = svc
            .stream_releases(Request::new(req))
            .await
            .unwrap()
            .into_inner();
        let page = recv(&mut stream).await;
        assert!(page.page_complete);
        assert!(page.releases.len() <= 2);
        for release in &page.releases {
            seen.push(names::parse_id_from_name(&release.name, "releases").to_string());
        }
        if page.next_page_token.is_empty() {
            break;
        }
        page_token = page.next_page_token;
    }

    // Newest first overall, every release exactly once.
    let expected: Vec<String> = ids.iter().rev().cloned().collect();
    assert_eq!(seen, expected);
}

#[tokio::test]
async fn test_stream_releases_first_page_is_newest_first() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("app", HashMap::new());
    let mut ids = Vec::new();
    for i in 0..5 {
        let mut release = new_release(&app.id, &[&format!("artifact-{i}")]);
        store.add_release(&mut release).unwrap();
        ids.push(release.id);
    }
    let svc = service(&store);

    let req = proto::StreamReleasesRequest {
        page_size: 2,
        ..Default::default()
    };
    let mut stream = svc
        .stream_releases(Request::new(req))
        .await
        .unwrap()
        .into_inner();
    let page = recv(&mut stream).await;
    assert_eq!(page.releases.len(), 2);
    assert!(!page.next_page_token.is_empty());
    assert_eq!(
        names::parse_id_from_name(&page.releases[0].name, "releases"),
        ids[4]
    );
    assert_eq!(
        names::parse_id_from_name(&page.releases[1].name, "releases"),
        ids[3]
    );
}

#[tokio::test]
async fn test_stream_releases_emits_live_creates_once() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("app", HashMap::new());
    let mut seeded = new_release(&app.id, &["artifact-0"]);
    store.add_release(&mut seeded).unwrap();
    let svc = service(&store);

    let req = proto::StreamReleasesRequest {
        stream_creates: true,
        ..Default::default()
    };
    let mut stream = svc
        .stream_releases(Request::new(req))
        .await
        .unwrap()
        .into_inner();
    let first = recv(&mut stream).await;
    assert_eq!(first.releases.len(), 1);

    let mut live = new_release(&app.id, &["artifact-1"]);
    store.add_release(&mut live).unwrap();
    let second = recv(&mut stream).await;
    assert_eq!(second.releases.len(), 1);
    assert_eq!(
        names::parse_id_from_name(&second.releases[0].name, "releases"),
        live.id
    );
}

#[tokio::test]
async fn test_stream_scales_widens_subscription_for_release_filters() {
    let store = Arc::new(MemoryStore::new());
    let app1 = store.create_app("app1", HashMap::new());
    let app2 = store.create_app("app2", HashMap::new());
    let mut wanted = new_release(&app1.id, &["a"]);
    store.add_release(&mut wanted).unwrap();
    let mut other = new_release(&app2.id, &["b"]);
    store.add_release(&mut other).unwrap();
    let svc = service(&store);

    let req = proto::StreamScalesRequest {
        name_filters: vec![format!("apps/{}/releases/{}", app1.id, wanted.id)],
        stream_creates: true,
        ..Default::default()
    };
    let mut stream = svc
        .stream_scales(Request::new(req))
        .await
        .unwrap()
        .into_inner();
    let first = recv(&mut stream).await;
    assert!(first.scale_requests.is_empty());

    // The release filter widens the subscription to every app, so the
    // live loop has to re-filter: a scale for an unrelated app/release is
    // delivered to the subscription but never to the client.
    let pending = |app_id: &str, release_id: &str, count: i32| controller_core::types::ScaleRequest {
        id: String::new(),
        app_id: app_id.to_string(),
        release_id: release_id.to_string(),
        state: controller_core::types::ScaleRequestState::Pending,
        old_processes: HashMap::new(),
        new_processes: HashMap::from([("web".to_string(), count)]),
        old_tags: HashMap::new(),
        new_tags: HashMap::new(),
        created_at: Utc::now(),
        updated_at: Utc::now(),
    };
    let mut other_req = pending(&app2.id, &other.id, 1);
    let mut wanted_req = pending(&app1.id, &wanted.id, 2);
    controller_core::store::ScaleRepo::add_scale_request(&*store, &mut other_req)
        .await
        .unwrap();
    controller_core::store::ScaleRepo::add_scale_request(&*store, &mut wanted_req)
        .await
        .unwrap();

    let second = recv(&mut stream).await;
    assert_eq!(second.scale_requests.len(), 1);
    assert_eq!(
        names::parse_id_from_name(&second.scale_requests[0].name, "releases"),
        wanted.id
    );
}

#[tokio::test]
async fn test_stream_deployments_overlays_status_and_filters_type() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("app", HashMap::new());
    let mut code_release = new_release(&app.id, &["artifact"]);
    store.add_release(&mut code_release).unwrap();
    let svc = service(&store);

    let expanded = controller_core::store::DeploymentRepo::add(&*store, &app.id, &code_release.id)
        .await
        .unwrap();

    let req = proto::StreamDeploymentsRequest {
        stream_creates: true,
        type_filters: vec![proto::ReleaseType::Code as i32],
        ..Default::default()
    };
    let mut stream = svc
        .stream_deployments(Request::new(req))
        .await
        .unwrap()
        .into_inner();
    let first = recv(&mut stream).await;
    assert_eq!(first.deployments.len(), 1);

    store
        .put_deployment_event(
            &expanded.deployment.id,
            controller_core::types::DeploymentStatus::Running,
            "web",
            "starting",
            "",
        )
        .unwrap();
    let second = recv(&mut stream).await;
    assert_eq!(second.deployments.len(), 1);
    assert_eq!(
        second.deployments[0].status,
        proto::DeploymentStatus::Running as i32
    );
}

#[tokio::test]
async fn test_update_app_without_mask_writes_nonzero_fields() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("app", labels(&[("keep", "me")]));
    let svc = service(&store);

    let req = proto::UpdateAppRequest {
        app: Some(proto::App {
            name: format!("apps/{}", app.id),
            labels: labels(&[("env", "prod")]),
            strategy: "one-by-one".to_string(),
            deploy_timeout: 0,
            ..Default::default()
        }),
        update_mask: None,
    };
    let updated = svc.update_app(Request::new(req)).await.unwrap().into_inner();
    assert_eq!(updated.labels, labels(&[("env", "prod")]));
    assert_eq!(updated.strategy, "one-by-one");
    // Zero field untouched.
    assert_eq!(updated.deploy_timeout, 120);
}

#[tokio::test]
async fn test_update_app_mask_restricts_written_fields() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("app", HashMap::new());
    let svc = service(&store);

    let req = proto::UpdateAppRequest {
        app: Some(proto::App {
            name: format!("apps/{}", app.id),
            labels: labels(&[("env", "prod")]),
            strategy: "one-by-one".to_string(),
            ..Default::default()
        }),
        // "labels" aliases the stored meta field; strategy is masked out.
        update_mask: Some(prost_types::FieldMask {
            paths: vec!["labels".to_string()],
        }),
    };
    let updated = svc.update_app(Request::new(req)).await.unwrap().into_inner();
    assert_eq!(updated.labels, labels(&[("env", "prod")]));
    assert_eq!(updated.strategy, "all-at-once");
}

#[tokio::test]
async fn test_update_is_observed_by_app_stream() {
    let store = Arc::new(MemoryStore::new());
    let app = store.create_app("app", HashMap::new());
    let svc = service(&store);

    let stream_req = proto::StreamAppsRequest {
        stream_updates: true,
        ..Default::default()
    };
    let mut stream = svc
        .stream_apps(Request::new(stream_req))
        .await
        .unwrap()
        .into_inner();
    let _first = recv(&mut stream).await;

    let update = proto::UpdateAppRequest {
        app: Some(proto::App {
            name: format!("apps/{}", app.id),
            labels: labels(&[("env", "prod")]),
            ..Default::default()
        }),
        update_mask: None,
    };
    svc.update_app(Request::new(update)).await.unwrap();

    let second = recv(&mut stream).await;
    assert_eq!(second.apps.len(), 1);
    assert_eq!(second.apps[0].labels, labels(&[("env", "prod")]));
}

#[tokio::test]
async fn test_malformed_page_token_is_invalid_argument() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(&store);

    let req = proto::StreamAppsRequest {
        page_token: "!!!not-a-token".to_string(),
        ..Default::default()
    };
    let err = svc.stream_apps(Request::new(req)).await.unwrap_err();
    assert_eq!(err.code(), tonic::Code::InvalidArgument);
}

#[tokio::test]
async fn test_malformed_live_payload_is_skipped() {
    let store = Arc::new(MemoryStore::new());
    let svc = service(&store);

    let req = proto::StreamAppsRequest {
        stream_creates: true,
        ..Default::default()
    };
    let mut stream = svc
        .stream_apps(Request::new(req))
        .await
        .unwrap()
        .into_inner();
    let _first = recv(&mut stream).await;

    // A payload that does not decode as an app is logged and skipped; the
    // stream keeps going.
    store.emit_raw_event(
        "some-app",
        controller_core::types::EventType::App,
        "some-app",
        controller_core::types::EventOp::Create,
        serde_json::json!({"name": 42}),
    );
    let app = store.create_app("after", HashMap::new());

    let second = recv(&mut stream).await;
    assert_eq!(
        names::parse_id_from_name(&second.apps[0].name, "apps"),
        app.id
    );
}
