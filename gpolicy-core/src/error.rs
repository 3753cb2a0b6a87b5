//! Error taxonomy for the policy pipeline.

use thiserror::Error;

use crate::native::{GroupHandle, NativeError};

/// Errors surfaced synchronously by registration.
///
/// Once a registration is active nothing is returned through this type:
/// unregister failures and overflow drops are only logged and counted.
#[derive(Debug, Error)]
pub enum PolicyError {
    /// Bad or insufficient configuration, detected before any native call
    #[error("bad parameters: {0}")]
    Validation(String),

    /// A native call returned non-success
    #[error(transparent)]
    Native(#[from] NativeError),

    /// Group setup failed part way; the native group is still allocated
    #[error("policy group {group} left allocated after failure: {source}")]
    ResourceLeakRisk {
        group: GroupHandle,
        #[source]
        source: NativeError,
    },
}

impl PolicyError {
    /// Native return code behind this error, if any
    pub fn native_code(&self) -> Option<i32> {
        match self {
            PolicyError::Validation(_) => None,
            PolicyError::Native(e) => Some(e.code),
            PolicyError::ResourceLeakRisk { source, .. } => Some(source.code),
        }
    }
}
