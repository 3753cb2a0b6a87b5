//! Policy conditions and the typed violations delivered to consumers.

use std::fmt;
use std::ops::BitOr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One monitored violation category.
///
/// The variant is the join key between a threshold configuration, the native
/// condition bitmask and the events handed to the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyCondition {
    /// Double-bit (uncorrectable) ECC error
    DoubleBitEcc,
    /// PCIe replay / link error
    Pcie,
    /// Retired page count above limit
    MaxRetiredPages,
    /// Temperature above limit
    Thermal,
    /// Power draw above limit
    Power,
    /// XID error reported by the driver
    Xid,
}

impl PolicyCondition {
    /// Every condition, in canonical application order.
    pub const ALL: [PolicyCondition; 6] = [
        PolicyCondition::DoubleBitEcc,
        PolicyCondition::Pcie,
        PolicyCondition::MaxRetiredPages,
        PolicyCondition::Thermal,
        PolicyCondition::Power,
        PolicyCondition::Xid,
    ];

    /// Native condition bit.
    pub const fn bit(self) -> u32 {
        match self {
            PolicyCondition::DoubleBitEcc => 0x01,
            PolicyCondition::Pcie => 0x02,
            PolicyCondition::MaxRetiredPages => 0x04,
            PolicyCondition::Thermal => 0x08,
            PolicyCondition::Power => 0x10,
            // 0x20 is NVLink, which this subsystem does not watch
            PolicyCondition::Xid => 0x40,
        }
    }

    /// Slot in the native parameter table.
    pub const fn param_index(self) -> usize {
        match self {
            PolicyCondition::DoubleBitEcc => 0,
            PolicyCondition::Pcie => 1,
            PolicyCondition::MaxRetiredPages => 2,
            PolicyCondition::Thermal => 3,
            PolicyCondition::Power => 4,
            PolicyCondition::Xid => 6,
        }
    }

    /// Dense position in [`PolicyCondition::ALL`].
    pub const fn ordinal(self) -> usize {
        match self {
            PolicyCondition::DoubleBitEcc => 0,
            PolicyCondition::Pcie => 1,
            PolicyCondition::MaxRetiredPages => 2,
            PolicyCondition::Thermal => 3,
            PolicyCondition::Power => 4,
            PolicyCondition::Xid => 5,
        }
    }

    /// Resolve a native condition value carrying exactly one known bit.
    pub fn from_bit(bits: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.bit() == bits)
    }

    /// Whether the condition carries a numeric threshold.
    pub const fn has_threshold(self) -> bool {
        matches!(
            self,
            PolicyCondition::MaxRetiredPages | PolicyCondition::Thermal | PolicyCondition::Power
        )
    }

    /// Metric label
    pub const fn label(self) -> &'static str {
        match self {
            PolicyCondition::DoubleBitEcc => "dbe",
            PolicyCondition::Pcie => "pcie",
            PolicyCondition::MaxRetiredPages => "maxrtpg",
            PolicyCondition::Thermal => "thermal",
            PolicyCondition::Power => "power",
            PolicyCondition::Xid => "xid",
        }
    }
}

impl fmt::Display for PolicyCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyCondition::DoubleBitEcc => write!(f, "Double-bit ECC Error"),
            PolicyCondition::Pcie => write!(f, "PCI Error"),
            PolicyCondition::MaxRetiredPages => write!(f, "Max Retired Pages Limit"),
            PolicyCondition::Thermal => write!(f, "Thermal Limit"),
            PolicyCondition::Power => write!(f, "Power Limit"),
            PolicyCondition::Xid => write!(f, "XID Error"),
        }
    }
}

/// Native condition bitmask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ConditionMask(u32);

impl ConditionMask {
    /// Mask with no condition set
    pub const EMPTY: ConditionMask = ConditionMask(0);

    /// Wrap raw native bits as-is.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Raw native bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, condition: PolicyCondition) -> bool {
        self.0 & condition.bit() != 0
    }

    pub fn insert(&mut self, condition: PolicyCondition) {
        self.0 |= condition.bit();
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of known conditions set in the mask
    pub fn len(self) -> usize {
        self.iter().count()
    }

    /// Set conditions in canonical order.
    pub fn iter(self) -> impl Iterator<Item = PolicyCondition> {
        PolicyCondition::ALL
            .into_iter()
            .filter(move |c| self.contains(*c))
    }
}

impl From<PolicyCondition> for ConditionMask {
    fn from(condition: PolicyCondition) -> Self {
        Self(condition.bit())
    }
}

impl BitOr for ConditionMask {
    type Output = ConditionMask;

    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

impl BitOr<PolicyCondition> for ConditionMask {
    type Output = ConditionMask;

    fn bitor(self, rhs: PolicyCondition) -> Self::Output {
        Self(self.0 | rhs.bit())
    }
}

impl FromIterator<PolicyCondition> for ConditionMask {
    fn from_iter<I: IntoIterator<Item = PolicyCondition>>(iter: I) -> Self {
        let mut mask = ConditionMask::EMPTY;
        for condition in iter {
            mask.insert(condition);
        }
        mask
    }
}

impl fmt::Display for ConditionMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#04x}", self.0)
    }
}

/// Memory location of a double-bit ECC error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DbeLocation {
    L1,
    L2,
    Device,
    Register,
    Texture,
    Unknown,
}

impl DbeLocation {
    /// Decode the native location code.
    pub fn from_raw(location: u32) -> Self {
        match location {
            0 => DbeLocation::L1,
            1 => DbeLocation::L2,
            2 => DbeLocation::Device,
            3 => DbeLocation::Register,
            4 => DbeLocation::Texture,
            _ => DbeLocation::Unknown,
        }
    }
}

impl fmt::Display for DbeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DbeLocation::L1 => write!(f, "L1"),
            DbeLocation::L2 => write!(f, "L2"),
            DbeLocation::Device => write!(f, "Device"),
            DbeLocation::Register => write!(f, "Register"),
            DbeLocation::Texture => write!(f, "Texture"),
            DbeLocation::Unknown => write!(f, "N/A"),
        }
    }
}

/// Double-bit ECC violation details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbeViolation {
    pub location: DbeLocation,
    pub num_errors: u32,
    pub gpu_id: u32,
}

/// PCIe violation details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PcieViolation {
    pub replay_counter: u32,
    pub gpu_id: u32,
}

/// Retired pages violation details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetiredPagesViolation {
    pub sbe_pages: u32,
    pub dbe_pages: u32,
    pub gpu_id: u32,
}

/// Thermal violation details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThermalViolation {
    /// Temperature that triggered the violation, in Celsius
    pub thermal_violation: u32,
    pub gpu_id: u32,
}

/// Power violation details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PowerViolation {
    /// Power draw that triggered the violation, in Watts
    pub power_violation: u32,
    pub gpu_id: u32,
}

/// XID violation details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XidViolation {
    pub err_num: u32,
    pub gpu_id: u32,
}

/// Condition-specific violation payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ViolationData {
    DoubleBitEcc(DbeViolation),
    Pcie(PcieViolation),
    MaxRetiredPages(RetiredPagesViolation),
    Thermal(ThermalViolation),
    Power(PowerViolation),
    Xid(XidViolation),
}

impl ViolationData {
    /// Condition this payload belongs to
    pub fn condition(&self) -> PolicyCondition {
        match self {
            ViolationData::DoubleBitEcc(_) => PolicyCondition::DoubleBitEcc,
            ViolationData::Pcie(_) => PolicyCondition::Pcie,
            ViolationData::MaxRetiredPages(_) => PolicyCondition::MaxRetiredPages,
            ViolationData::Thermal(_) => PolicyCondition::Thermal,
            ViolationData::Power(_) => PolicyCondition::Power,
            ViolationData::Xid(_) => PolicyCondition::Xid,
        }
    }

    /// Device that reported the violation
    pub fn gpu_id(&self) -> u32 {
        match self {
            ViolationData::DoubleBitEcc(v) => v.gpu_id,
            ViolationData::Pcie(v) => v.gpu_id,
            ViolationData::MaxRetiredPages(v) => v.gpu_id,
            ViolationData::Thermal(v) => v.gpu_id,
            ViolationData::Power(v) => v.gpu_id,
            ViolationData::Xid(v) => v.gpu_id,
        }
    }
}

/// One occurrence of a policy condition being exceeded.
///
/// Built only by the callback decoder; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub condition: PolicyCondition,
    /// Native timestamp truncated to whole seconds
    pub timestamp: DateTime<Utc>,
    pub data: ViolationData,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on GPU{} at {}",
            self.condition,
            self.data.gpu_id(),
            self.timestamp
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_condition_bits_are_distinct() {
        let all: ConditionMask = PolicyCondition::ALL.into_iter().collect();
        assert_eq!(all.bits(), 0x5f);
        assert_eq!(all.len(), 6);
    }

    #[test]
    fn test_from_bit_requires_single_known_bit() {
        assert_eq!(PolicyCondition::from_bit(0x10), Some(PolicyCondition::Power));
        assert_eq!(PolicyCondition::from_bit(0x40), Some(PolicyCondition::Xid));
        assert_eq!(PolicyCondition::from_bit(0x20), None);
        assert_eq!(PolicyCondition::from_bit(0x18), None);
        assert_eq!(PolicyCondition::from_bit(0), None);
    }

    #[test]
    fn test_mask_iterates_in_canonical_order() {
        let mask = ConditionMask::from(PolicyCondition::Xid)
            | PolicyCondition::Thermal
            | PolicyCondition::DoubleBitEcc;
        let order: Vec<_> = mask.iter().collect();
        assert_eq!(
            order,
            vec![
                PolicyCondition::DoubleBitEcc,
                PolicyCondition::Thermal,
                PolicyCondition::Xid
            ]
        );
    }

    #[test]
    fn test_dbe_location() {
        assert_eq!(DbeLocation::from_raw(2), DbeLocation::Device);
        assert_eq!(DbeLocation::from_raw(99).to_string(), "N/A");
    }

    #[test]
    fn test_condition_display() {
        assert_eq!(PolicyCondition::MaxRetiredPages.to_string(), "Max Retired Pages Limit");
        assert_eq!(PolicyCondition::Pcie.to_string(), "PCI Error");
    }

    #[test]
    fn test_violation_json_shape() {
        let violation = Violation {
            condition: PolicyCondition::Power,
            timestamp: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            data: ViolationData::Power(PowerViolation {
                power_violation: 312,
                gpu_id: 3,
            }),
        };

        let json = serde_json::to_value(&violation).unwrap();
        assert_eq!(json["data"]["kind"], "power");
        assert_eq!(json["data"]["gpu_id"], 3);
        assert_eq!(json["timestamp"], "2023-11-14T22:13:20Z");
        assert_eq!(violation.to_string(), "Power Limit on GPU3 at 2023-11-14 22:13:20 UTC");
    }
}
