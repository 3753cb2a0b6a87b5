//! Threshold evaluation
//!
//! Turns periodic device samples into raw violation payloads. Limits are
//! edge-triggered: a device reports once when it crosses a limit and again
//! only after dropping back below it. Error counters report on every
//! increase after the first observation.

use std::collections::HashMap;

use gpolicy_core::native::{PolicyCallbackResponse, PolicyRequest, RawPolicyValue};
use gpolicy_core::policy::{ConditionMask, DbeLocation, PolicyCondition};

/// One reading of a device. `None` means the query is unsupported or failed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceSample {
    /// GPU temperature in Celsius
    pub temperature_c: Option<u32>,
    /// Power draw in Watts
    pub power_w: Option<u32>,
    /// PCIe replay counter
    pub pcie_replay: Option<u64>,
    /// Retired pages as (single-bit, double-bit)
    pub retired_pages: Option<(u32, u32)>,
    /// Volatile uncorrected ECC error count
    pub dbe_errors: Option<u64>,
    /// XID codes logged since the previous sample
    pub xids: Vec<u32>,
}

/// Limits extracted from a set-policy request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub condition: ConditionMask,
    pub max_retired_pages: u32,
    pub thermal_celsius: u32,
    pub power_watts: u32,
}

impl Thresholds {
    pub fn from_request(request: &PolicyRequest) -> Self {
        let limit = |condition: PolicyCondition| {
            request.params[condition.param_index()]
                .map(|p| p.value)
                .unwrap_or(u32::MAX)
        };

        Self {
            condition: request.condition,
            max_retired_pages: limit(PolicyCondition::MaxRetiredPages),
            thermal_celsius: limit(PolicyCondition::Thermal),
            power_watts: limit(PolicyCondition::Power),
        }
    }

    fn watches(&self, condition: PolicyCondition) -> bool {
        self.condition.contains(condition)
    }
}

#[derive(Debug, Default)]
struct DeviceState {
    thermal_over: bool,
    power_over: bool,
    pages_over: bool,
    pcie_replay: Option<u64>,
    dbe_errors: Option<u64>,
}

/// Per-registration evaluator, keyed by device id
#[derive(Debug)]
pub struct ThresholdEvaluator {
    thresholds: Thresholds,
    devices: HashMap<u32, DeviceState>,
}

impl ThresholdEvaluator {
    pub fn new(thresholds: Thresholds) -> Self {
        Self {
            thresholds,
            devices: HashMap::new(),
        }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Compare a sample against the limits, in canonical condition order
    pub fn evaluate(
        &mut self,
        gpu_id: u32,
        sample: &DeviceSample,
        timestamp_us: i64,
    ) -> Vec<PolicyCallbackResponse> {
        let t = self.thresholds;
        let state = self.devices.entry(gpu_id).or_default();
        let mut out = Vec::new();

        if t.watches(PolicyCondition::DoubleBitEcc) {
            if let Some(delta) = counter_delta(&mut state.dbe_errors, sample.dbe_errors) {
                out.push(RawPolicyValue::Dbe {
                    timestamp_us,
                    location: DbeLocation::Device as u32,
                    num_errors: saturate(delta),
                    gpu_id,
                });
            }
        }

        if t.watches(PolicyCondition::Pcie) {
            if let Some(total) = sample.pcie_replay {
                if counter_delta(&mut state.pcie_replay, Some(total)).is_some() {
                    out.push(RawPolicyValue::Pci {
                        timestamp_us,
                        counter: saturate(total),
                        gpu_id,
                    });
                }
            }
        }

        if t.watches(PolicyCondition::MaxRetiredPages) {
            if let Some((sbe_pages, dbe_pages)) = sample.retired_pages {
                let total = sbe_pages.saturating_add(dbe_pages);
                if rising_edge(&mut state.pages_over, total >= t.max_retired_pages) {
                    out.push(RawPolicyValue::RetiredPages {
                        timestamp_us,
                        sbe_pages,
                        dbe_pages,
                        gpu_id,
                    });
                }
            }
        }

        if t.watches(PolicyCondition::Thermal) {
            if let Some(temp) = sample.temperature_c {
                if rising_edge(&mut state.thermal_over, temp >= t.thermal_celsius) {
                    out.push(RawPolicyValue::Thermal {
                        timestamp_us,
                        thermal_violation: temp,
                        gpu_id,
                    });
                }
            }
        }

        if t.watches(PolicyCondition::Power) {
            if let Some(watts) = sample.power_w {
                if rising_edge(&mut state.power_over, watts >= t.power_watts) {
                    out.push(RawPolicyValue::Power {
                        timestamp_us,
                        power_violation: watts,
                        gpu_id,
                    });
                }
            }
        }

        if t.watches(PolicyCondition::Xid) {
            out.extend(sample.xids.iter().map(|&err_num| RawPolicyValue::Xid {
                timestamp_us,
                err_num,
                gpu_id,
            }));
        }

        out.into_iter()
            .map(|value| PolicyCallbackResponse {
                condition: condition_of(&value).bit(),
                value,
            })
            .collect()
    }
}

fn condition_of(value: &RawPolicyValue) -> PolicyCondition {
    match value {
        RawPolicyValue::Dbe { .. } => PolicyCondition::DoubleBitEcc,
        RawPolicyValue::Pci { .. } => PolicyCondition::Pcie,
        RawPolicyValue::RetiredPages { .. } => PolicyCondition::MaxRetiredPages,
        RawPolicyValue::Thermal { .. } => PolicyCondition::Thermal,
        RawPolicyValue::Power { .. } => PolicyCondition::Power,
        RawPolicyValue::Xid { .. } => PolicyCondition::Xid,
    }
}

/// True only on the transition into `over`
fn rising_edge(was_over: &mut bool, over: bool) -> bool {
    let fired = over && !*was_over;
    *was_over = over;
    fired
}

/// Increase since the last reading; the first reading is the baseline
fn counter_delta(last: &mut Option<u64>, current: Option<u64>) -> Option<u64> {
    let current = current?;
    let previous = last.replace(current)?;
    (current > previous).then(|| current - previous)
}

fn saturate(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}
