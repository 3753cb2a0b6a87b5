//! GPolicy NVML backend
//!
//! Production [`gpolicy_core::PolicyBackend`] built on NVML. Groups and
//! policies live in process; a watcher thread per registration samples the
//! group's devices and delivers violations through the registered callback.

pub mod backend;
pub mod sampler;
pub mod xid;

pub use backend::{NvmlBackend, DEFAULT_POLL_INTERVAL};
pub use sampler::{DeviceSample, ThresholdEvaluator, Thresholds};
pub use xid::XidScanner;
