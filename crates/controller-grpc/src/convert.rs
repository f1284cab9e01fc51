//! Domain ↔ protobuf conversion.
//!
//! Resource names are assembled here and nowhere else; handlers only ever
//! parse them back through `controller_core::names`.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tonic::Status;

use controller_core::names;
use controller_core::types as ct;
use controller_core::Error;

use crate::proto;

pub fn timestamp(dt: &DateTime<Utc>) -> prost_types::Timestamp {
    prost_types::Timestamp {
        seconds: dt.timestamp(),
        nanos: dt.timestamp_subsec_nanos() as i32,
    }
}

pub fn app_name(id: &str) -> String {
    format!("apps/{id}")
}

pub fn release_name(app_id: &str, release_id: &str) -> String {
    format!("apps/{app_id}/releases/{release_id}")
}

pub fn scale_name(app_id: &str, release_id: &str, scale_id: &str) -> String {
    format!("apps/{app_id}/releases/{release_id}/scales/{scale_id}")
}

pub fn deployment_name(app_id: &str, deployment_id: &str) -> String {
    format!("apps/{app_id}/deployments/{deployment_id}")
}

pub fn app(app: &ct::App) -> proto::App {
    proto::App {
        name: app_name(&app.id),
        display_name: app.name.clone(),
        labels: app.meta.clone(),
        strategy: app.strategy.clone(),
        deploy_timeout: app.deploy_timeout,
        release: if app.release_id.is_empty() {
            String::new()
        } else {
            release_name(&app.id, &app.release_id)
        },
        create_time: Some(timestamp(&app.created_at)),
        update_time: Some(timestamp(&app.updated_at)),
        delete_time: app.deleted_at.as_ref().map(timestamp),
    }
}

pub fn release_type(release_type: ct::ReleaseType) -> proto::ReleaseType {
    match release_type {
        ct::ReleaseType::Any => proto::ReleaseType::Any,
        ct::ReleaseType::Code => proto::ReleaseType::Code,
        ct::ReleaseType::Config => proto::ReleaseType::Config,
    }
}

pub fn release_type_from_proto(release_type: proto::ReleaseType) -> ct::ReleaseType {
    match release_type {
        proto::ReleaseType::Any => ct::ReleaseType::Any,
        proto::ReleaseType::Code => ct::ReleaseType::Code,
        proto::ReleaseType::Config => ct::ReleaseType::Config,
    }
}

/// Decodes repeated enum values, dropping anything out of range.
pub fn type_filters(values: &[i32]) -> Vec<ct::ReleaseType> {
    values
        .iter()
        .filter_map(|value| proto::ReleaseType::try_from(*value).ok())
        .map(release_type_from_proto)
        .collect()
}

pub fn release(release: &ct::Release) -> proto::Release {
    proto::Release {
        name: release_name(&release.app_id, &release.id),
        artifacts: release.artifact_ids.clone(),
        env: release.env.clone(),
        labels: release.meta.clone(),
        r#type: release_type(release.release_type()) as i32,
        create_time: Some(timestamp(&release.created_at)),
    }
}

/// Builds a domain release from a request body. The app association comes
/// from the request's `parent`, not from the body's name.
pub fn release_from_proto(release: &proto::Release) -> ct::Release {
    ct::Release {
        id: names::parse_id_from_name(&release.name, "releases").to_string(),
        app_id: names::parse_id_from_name(&release.name, "apps").to_string(),
        artifact_ids: release.artifacts.clone(),
        env: release.env.clone(),
        meta: release.labels.clone(),
        created_at: Utc::now(),
    }
}

pub fn scale_request_state(state: ct::ScaleRequestState) -> proto::ScaleRequestState {
    match state {
        ct::ScaleRequestState::Pending => proto::ScaleRequestState::Pending,
        ct::ScaleRequestState::Cancelled => proto::ScaleRequestState::Cancelled,
        ct::ScaleRequestState::Complete => proto::ScaleRequestState::Complete,
    }
}

pub fn process_tags(tags: &ct::ProcessTags) -> HashMap<String, proto::DeploymentProcessTags> {
    tags.iter()
        .map(|(process, tags)| {
            (
                process.clone(),
                proto::DeploymentProcessTags { tags: tags.clone() },
            )
        })
        .collect()
}

pub fn process_tags_from_proto(
    tags: &HashMap<String, proto::DeploymentProcessTags>,
) -> ct::ProcessTags {
    tags.iter()
        .map(|(process, tags)| (process.clone(), tags.tags.clone()))
        .collect()
}

pub fn scale_request(req: &ct::ScaleRequest) -> proto::ScaleRequest {
    proto::ScaleRequest {
        parent: release_name(&req.app_id, &req.release_id),
        name: scale_name(&req.app_id, &req.release_id, &req.id),
        state: scale_request_state(req.state) as i32,
        old_processes: req.old_processes.clone(),
        new_processes: req.new_processes.clone(),
        old_tags: process_tags(&req.old_tags),
        new_tags: process_tags(&req.new_tags),
        create_time: Some(timestamp(&req.created_at)),
        update_time: Some(timestamp(&req.updated_at)),
    }
}

pub fn deployment_status(status: ct::DeploymentStatus) -> proto::DeploymentStatus {
    match status {
        ct::DeploymentStatus::Pending => proto::DeploymentStatus::Pending,
        ct::DeploymentStatus::Running => proto::DeploymentStatus::Running,
        ct::DeploymentStatus::Complete => proto::DeploymentStatus::Complete,
        ct::DeploymentStatus::Failed => proto::DeploymentStatus::Failed,
    }
}

pub fn expanded_deployment(expanded: &ct::ExpandedDeployment) -> proto::ExpandedDeployment {
    let d = &expanded.deployment;
    proto::ExpandedDeployment {
        name: deployment_name(&d.app_id, &d.id),
        old_release: expanded.old_release.as_ref().map(release),
        new_release: expanded.new_release.as_ref().map(release),
        r#type: release_type(expanded.release_type()) as i32,
        strategy: d.strategy.clone(),
        status: deployment_status(d.status) as i32,
        processes: d.processes.clone(),
        tags: process_tags(&d.tags),
        deploy_timeout: d.deploy_timeout,
        create_time: Some(timestamp(&d.created_at)),
        finish_time: d.finished_at.as_ref().map(timestamp),
    }
}

/// Flattens request label filters into the core predicate shape.
pub fn label_filters(filters: &[proto::LabelFilter]) -> Vec<HashMap<String, String>> {
    filters.iter().map(|filter| filter.labels.clone()).collect()
}

/// Maps a core error onto its RPC status code.
pub fn error_status(err: &Error) -> Status {
    let message = err.to_string();
    match err {
        Error::InvalidArgument(_) => Status::invalid_argument(message),
        Error::NotFound(_) => Status::not_found(message),
        Error::FailedPrecondition(_) => Status::failed_precondition(message),
        Error::Aborted(_) => Status::aborted(message),
        Error::DeadlineExceeded(_) => Status::deadline_exceeded(message),
        Error::Unavailable(_) | Error::SlowConsumer => Status::unavailable(message),
        Error::Internal(_) => Status::internal(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_names() {
        assert_eq!(app_name("a1"), "apps/a1");
        assert_eq!(release_name("a1", "r1"), "apps/a1/releases/r1");
        assert_eq!(scale_name("a1", "r1", "s1"), "apps/a1/releases/r1/scales/s1");
        assert_eq!(deployment_name("a1", "d1"), "apps/a1/deployments/d1");
    }

    #[test]
    fn test_app_round_trips_identity_through_names() {
        let now = Utc::now();
        let domain = ct::App {
            id: "a1".into(),
            name: "my-app".into(),
            meta: HashMap::from([("env".into(), "prod".into())]),
            strategy: "all-at-once".into(),
            deploy_timeout: 60,
            release_id: "r1".into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };
        let wire = app(&domain);
        assert_eq!(wire.name, "apps/a1");
        assert_eq!(wire.display_name, "my-app");
        assert_eq!(wire.release, "apps/a1/releases/r1");
        assert_eq!(names::parse_id_from_name(&wire.name, "apps"), "a1");
        assert!(wire.delete_time.is_none());
    }

    #[test]
    fn test_error_status_codes() {
        use tonic::Code;
        let cases = [
            (Error::InvalidArgument("x".into()), Code::InvalidArgument),
            (Error::NotFound("x".into()), Code::NotFound),
            (Error::FailedPrecondition("x".into()), Code::FailedPrecondition),
            (Error::Aborted("x".into()), Code::Aborted),
            (Error::DeadlineExceeded("x".into()), Code::DeadlineExceeded),
            (Error::Unavailable("x".into()), Code::Unavailable),
            (Error::SlowConsumer, Code::Unavailable),
            (Error::Internal("x".into()), Code::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(error_status(&err).code(), code);
        }
    }

    #[test]
    fn test_type_filters_drop_unknown_values() {
        let filters = type_filters(&[
            proto::ReleaseType::Code as i32,
            99, // unknown on the wire
        ]);
        assert_eq!(filters, vec![ct::ReleaseType::Code]);
    }
}
