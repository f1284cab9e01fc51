//! Wire surface for the controller streaming API.
//!
//! Serves the `controller.v1.Controller` service over native gRPC and
//! gRPC-web on a single port. All engine semantics live in
//! `controller-core`; this crate parses requests, runs the snapshot+tail
//! merge for the streaming operations, and converts between domain and
//! protobuf representations.

pub mod convert;
pub mod server;
pub mod service;

/// Generated protobuf types.
pub mod proto {
    #![allow(clippy::all, clippy::pedantic, missing_docs)]
    tonic::include_proto!("controller.v1");
}

pub use server::ControllerConfig;
pub use service::ControllerService;
