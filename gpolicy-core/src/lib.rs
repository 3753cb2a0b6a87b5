//! GPolicy Core Library
//!
//! Watch-and-notify pipeline for GPU policy violations.
//! This crate provides threshold configuration, the native backend seam,
//! device group ownership, callback bridging and per-registration streams.

pub mod bridge;
pub mod config;
pub mod error;
pub mod fanin;
pub mod group;
pub mod metrics;
pub mod native;
pub mod policy;
pub mod registrar;
pub mod watcher;

// Re-export common types
pub use bridge::{EnqueueOutcome, ViolationBroker};
pub use config::{PipelineConfig, WatchConfig};
pub use error::PolicyError;
pub use group::GroupResource;
pub use native::{GroupHandle, MockBackend, NativeError, PolicyBackend};
pub use policy::{
    ConditionMask, DbeLocation, PolicyCondition, PolicyParams, ThresholdConfig, Violation,
    ViolationData,
};
pub use registrar::PolicyRegistrar;
pub use watcher::{PolicyWatcher, ViolationStream};
