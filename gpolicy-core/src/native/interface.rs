//! Native management library interface and raw types
//!
//! Defines the primitives the policy pipeline consumes from the vendor
//! library: device groups, policy thresholds and the violation callback.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::policy::ConditionMask;

/// Number of slots in the native policy parameter table
pub const POLICY_PARAM_SLOTS: usize = 7;

/// Handle of a native device group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GroupHandle(u64);

impl GroupHandle {
    /// Reserved group containing every device; never created or destroyed
    pub const ALL_DEVICES: GroupHandle = GroupHandle(0x7fff_ffff);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }

    pub const fn is_all_devices(self) -> bool {
        self.0 == Self::ALL_DEVICES.0
    }
}

impl fmt::Display for GroupHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_all_devices() {
            write!(f, "group(all)")
        } else {
            write!(f, "group({})", self.0)
        }
    }
}

/// Membership of a native device group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    /// Group name
    pub name: String,
    /// Device ids in the group
    pub entities: Vec<u32>,
}

/// Type tag of a policy parameter slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PolicyParamKind {
    /// Boolean condition; value is always 1
    Bool = 0,
    /// Numeric threshold
    Long = 1,
}

/// One entry of the native parameter table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyParam {
    pub kind: PolicyParamKind,
    pub value: u32,
}

impl PolicyParam {
    /// Boolean-true marker for conditions without a threshold
    pub const fn flag() -> Self {
        Self {
            kind: PolicyParamKind::Bool,
            value: 1,
        }
    }

    /// Numeric threshold
    pub const fn limit(value: u32) -> Self {
        Self {
            kind: PolicyParamKind::Long,
            value,
        }
    }
}

/// Payload of a native "set policy" call
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PolicyRequest {
    /// Combined condition bitmask
    pub condition: ConditionMask,
    /// Parameters indexed by native condition index
    pub params: [Option<PolicyParam>; POLICY_PARAM_SLOTS],
}

/// Raw condition-specific value reported by the native library
///
/// Timestamps are native epoch microseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RawPolicyValue {
    Dbe {
        timestamp_us: i64,
        location: u32,
        num_errors: u32,
        gpu_id: u32,
    },
    Pci {
        timestamp_us: i64,
        counter: u32,
        gpu_id: u32,
    },
    RetiredPages {
        timestamp_us: i64,
        sbe_pages: u32,
        dbe_pages: u32,
        gpu_id: u32,
    },
    Thermal {
        timestamp_us: i64,
        thermal_violation: u32,
        gpu_id: u32,
    },
    Power {
        timestamp_us: i64,
        power_violation: u32,
        gpu_id: u32,
    },
    Xid {
        timestamp_us: i64,
        err_num: u32,
        gpu_id: u32,
    },
}

/// Raw violation handed to the registered callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyCallbackResponse {
    /// Native condition bits
    pub condition: u32,
    pub value: RawPolicyValue,
}

/// Callback installed with the native library.
///
/// May be invoked from a thread owned by the native library.
pub type PolicyCallback = Arc<dyn Fn(&PolicyCallbackResponse) -> i32 + Send + Sync>;

/// Non-success return from a native call
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{op} failed: {message} (code {code})")]
pub struct NativeError {
    /// Native operation that failed
    pub op: &'static str,
    /// Native return code
    pub code: i32,
    /// Library error string for `code`
    pub message: &'static str,
}

impl NativeError {
    pub const BAD_PARAM: i32 = -1;
    pub const GENERIC: i32 = -3;
    pub const NOT_CONFIGURED: i32 = -5;
    pub const NOT_SUPPORTED: i32 = -6;
    pub const INIT_ERROR: i32 = -7;
    pub const NVML_ERROR: i32 = -8;
    pub const NO_PERMISSION: i32 = -17;
    pub const MAX_LIMIT: i32 = -24;
    pub const IN_USE: i32 = -34;

    pub fn new(op: &'static str, code: i32) -> Self {
        Self {
            op,
            code,
            message: describe_status(code),
        }
    }
}

/// Map a native return code to the library's error string
pub fn describe_status(code: i32) -> &'static str {
    match code {
        0 => "Success",
        -1 => "A bad parameter was passed to a function",
        -3 => "A generic, unspecified error",
        -4 => "An out of memory error occurred",
        -5 => "Setting not configured",
        -6 => "Feature not supported",
        -7 => "Init error",
        -8 => "NVML returned an error",
        -11 => "Requested operation timed out",
        -17 => "No permission to perform the desired action",
        -18 => "GPU is no longer reachable",
        -24 => "Max limit reached for the object",
        -25 => "Library could not be found",
        -34 => "The affected resource is in use",
        _ => "Unknown error",
    }
}

/// Native policy management interface
///
/// Implementations wrap the vendor library and must be thread-safe. The
/// library exposes a single process-wide callback slot, so callers should
/// assume a second `register_policy` shares routing with the first.
#[async_trait]
pub trait PolicyBackend: Send + Sync {
    /// Allocate an empty device group
    async fn create_group(&self, name: &str) -> Result<GroupHandle, NativeError>;

    /// Add a device to a group
    async fn add_device(&self, group: GroupHandle, gpu_id: u32) -> Result<(), NativeError>;

    /// Free a group
    async fn destroy_group(&self, group: GroupHandle) -> Result<(), NativeError>;

    /// Query group name and membership
    async fn group_info(&self, group: GroupHandle) -> Result<GroupInfo, NativeError>;

    /// Push condition bitmask and thresholds for a group
    async fn set_policy(&self, group: GroupHandle, request: &PolicyRequest)
        -> Result<(), NativeError>;

    /// Install the violation and finish callbacks for the given conditions
    async fn register_policy(
        &self,
        group: GroupHandle,
        condition: ConditionMask,
        on_violation: PolicyCallback,
        on_finish: PolicyCallback,
    ) -> Result<(), NativeError>;

    /// Remove callbacks previously installed for the given conditions
    async fn unregister_policy(
        &self,
        group: GroupHandle,
        condition: ConditionMask,
    ) -> Result<(), NativeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_handle_display() {
        assert_eq!(GroupHandle::new(7).to_string(), "group(7)");
        assert_eq!(GroupHandle::ALL_DEVICES.to_string(), "group(all)");
        assert!(!GroupHandle::new(7).is_all_devices());
    }

    #[test]
    fn test_native_error_message() {
        let err = NativeError::new("dcgmPolicySet", NativeError::BAD_PARAM);
        assert!(err.to_string().contains("bad parameter"));
        assert!(err.to_string().contains("code -1"));

        let unknown = NativeError::new("dcgmGroupCreate", -999);
        assert_eq!(unknown.message, "Unknown error");
    }

    #[test]
    fn test_policy_param_markers() {
        assert_eq!(PolicyParam::flag().value, 1);
        assert_eq!(PolicyParam::flag().kind as u32, 0);
        assert_eq!(PolicyParam::limit(250).kind as u32, 1);
    }
}
