//! Core engine for the controller streaming API.
//!
//! This crate is transport-free: it owns the event fan-out machinery and the
//! contracts the wire layer builds on, but knows nothing about protobuf or
//! HTTP framing.
//!
//! ## Modules
//!
//! - [`bus`]: single shared tail of the change log, multiplexed to many
//!   in-memory subscribers with per-subscriber filters
//! - [`subscription`]: client-scoped fan-in of one bus subscriber per app-id
//!   filter into a single event channel
//! - [`seam`]: snapshot/tail seam helpers (stream flags, watermark dedup)
//! - [`page_token`]: opaque pagination cursor codec
//! - [`names`]: `apps/{id}/releases/{id}/...` resource-name grammar
//! - [`labels`]: label-filter and release-type predicates
//! - [`store`]: storage collaborator contracts (repos and the change log)
//! - [`memory`]: in-memory store implementing every collaborator contract

pub mod bus;
pub mod error;
pub mod labels;
pub mod memory;
pub mod names;
pub mod page_token;
pub mod seam;
pub mod store;
pub mod subscription;
pub mod types;

pub use error::{Error, Result};
