//! Threshold configuration
//!
//! [`PolicyParams`] is what operators write; [`ThresholdConfig`] is the
//! validated form with defaults applied. At least one policy must be enabled.

use serde::{Deserialize, Serialize};

use super::{ConditionMask, PolicyCondition};
use crate::error::PolicyError;

/// Default retired page limit
pub const DEFAULT_MAX_RETIRED_PAGES: u32 = 10;
/// Default temperature limit in Celsius
pub const DEFAULT_THERMAL_CELSIUS: u32 = 100;
/// Default power limit in Watts
pub const DEFAULT_POWER_WATTS: u32 = 250;

/// User-supplied policy parameters.
///
/// A zero threshold means "use the default". Thresholds of disabled
/// policies are ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyParams {
    /// Watch double-bit ECC errors
    pub dbe_enabled: bool,
    /// Watch PCIe errors
    pub pcie_enabled: bool,
    /// Watch the retired page count
    pub max_retired_pages_enabled: bool,
    /// Retired pages that trigger a violation
    pub max_retired_pages_threshold: u32,
    /// Watch temperature
    pub thermal_enabled: bool,
    /// Temperature in Celsius that triggers a violation
    pub thermal_threshold: u32,
    /// Watch power draw
    pub power_enabled: bool,
    /// Power in Watts that triggers a violation
    pub power_threshold: u32,
    /// Watch XID errors
    pub xid_enabled: bool,
}

impl PolicyParams {
    fn enabled_mask(&self) -> ConditionMask {
        [
            (self.dbe_enabled, PolicyCondition::DoubleBitEcc),
            (self.pcie_enabled, PolicyCondition::Pcie),
            (self.max_retired_pages_enabled, PolicyCondition::MaxRetiredPages),
            (self.thermal_enabled, PolicyCondition::Thermal),
            (self.power_enabled, PolicyCondition::Power),
            (self.xid_enabled, PolicyCondition::Xid),
        ]
        .into_iter()
        .filter_map(|(enabled, condition)| enabled.then_some(condition))
        .collect()
    }
}

/// Validated threshold configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThresholdConfig {
    enabled: ConditionMask,
    max_retired_pages: u32,
    thermal_celsius: u32,
    power_watts: u32,
}

impl ThresholdConfig {
    /// Apply defaults and reject configurations with nothing enabled.
    ///
    /// Pure: performs no native calls.
    pub fn normalize(params: &PolicyParams) -> Result<Self, PolicyError> {
        let enabled = params.enabled_mask();
        if enabled.is_empty() {
            return Err(PolicyError::Validation(
                "at least one policy must be enabled".to_string(),
            ));
        }

        Ok(Self {
            enabled,
            max_retired_pages: or_default(
                params.max_retired_pages_threshold,
                DEFAULT_MAX_RETIRED_PAGES,
            ),
            thermal_celsius: or_default(params.thermal_threshold, DEFAULT_THERMAL_CELSIUS),
            power_watts: or_default(params.power_threshold, DEFAULT_POWER_WATTS),
        })
    }

    /// Enabled conditions as a native bitmask
    pub fn enabled(&self) -> ConditionMask {
        self.enabled
    }

    /// Number of enabled conditions
    pub fn enabled_count(&self) -> usize {
        self.enabled.len()
    }

    /// Enabled conditions in canonical order
    pub fn conditions(&self) -> impl Iterator<Item = PolicyCondition> {
        self.enabled.iter()
    }

    /// Threshold of a condition; `None` for boolean-only conditions
    pub fn threshold(&self, condition: PolicyCondition) -> Option<u32> {
        match condition {
            PolicyCondition::MaxRetiredPages => Some(self.max_retired_pages),
            PolicyCondition::Thermal => Some(self.thermal_celsius),
            PolicyCondition::Power => Some(self.power_watts),
            PolicyCondition::DoubleBitEcc | PolicyCondition::Pcie | PolicyCondition::Xid => None,
        }
    }

    pub fn max_retired_pages(&self) -> u32 {
        self.max_retired_pages
    }

    pub fn thermal_celsius(&self) -> u32 {
        self.thermal_celsius
    }

    pub fn power_watts(&self) -> u32 {
        self.power_watts
    }
}

impl TryFrom<&PolicyParams> for ThresholdConfig {
    type Error = PolicyError;

    fn try_from(params: &PolicyParams) -> Result<Self, Self::Error> {
        Self::normalize(params)
    }
}

fn or_default(value: u32, default: u32) -> u32 {
    if value == 0 {
        default
    } else {
        value
    }
}
