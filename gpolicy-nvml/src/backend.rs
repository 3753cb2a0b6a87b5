//! NVML policy backend
//!
//! Uses NVML (NVIDIA Management Library) for device queries. NVML has no
//! group or policy engine of its own, so groups and policies are kept in
//! process and each registration gets a watcher thread that samples its
//! devices and invokes the callbacks from that thread.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use nvml_wrapper::enum_wrappers::device::{
    EccCounter, MemoryError, RetirementCause, TemperatureSensor,
};
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use gpolicy_core::native::{
    GroupHandle, GroupInfo, NativeError, PolicyBackend, PolicyCallback, PolicyRequest,
};
use gpolicy_core::policy::{ConditionMask, PolicyCondition};

use crate::sampler::{DeviceSample, ThresholdEvaluator, Thresholds};
use crate::xid::{read_kernel_log, XidScanner};

/// Default interval between device sweeps
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Global NVML instance
static NVML: OnceCell<Arc<Nvml>> = OnceCell::new();

/// Get or initialize the global NVML instance
fn get_nvml() -> Result<&'static Arc<Nvml>, NativeError> {
    NVML.get_or_try_init(|| {
        Nvml::init().map(Arc::new).map_err(|e| {
            warn!(error = %e, "Failed to initialize NVML");
            NativeError::new("nvmlInit", NativeError::INIT_ERROR)
        })
    })
}

fn nvml_error(op: &'static str, e: NvmlError) -> NativeError {
    debug!(op, error = %e, "NVML call failed");
    let code = match e {
        NvmlError::NotSupported => NativeError::NOT_SUPPORTED,
        NvmlError::NoPermission => NativeError::NO_PERMISSION,
        NvmlError::InvalidArg => NativeError::BAD_PARAM,
        _ => NativeError::NVML_ERROR,
    };
    NativeError::new(op, code)
}

struct Watcher {
    condition: ConditionMask,
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

/// [`PolicyBackend`] over NVML
pub struct NvmlBackend {
    nvml: &'static Arc<Nvml>,
    device_count: u32,
    poll_interval: Duration,
    next_group: AtomicU64,
    groups: Mutex<HashMap<GroupHandle, GroupInfo>>,
    policies: Mutex<HashMap<GroupHandle, PolicyRequest>>,
    watchers: Mutex<HashMap<GroupHandle, Watcher>>,
}

impl NvmlBackend {
    /// Initialize NVML and create a backend
    pub fn new() -> Result<Self, NativeError> {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Create a backend with a custom sweep interval
    pub fn with_poll_interval(poll_interval: Duration) -> Result<Self, NativeError> {
        let nvml = get_nvml()?;
        let device_count = nvml
            .device_count()
            .map_err(|e| nvml_error("nvmlDeviceGetCount", e))?;
        info!(device_count, ?poll_interval, "NVML policy backend ready");

        Ok(Self {
            nvml,
            device_count,
            poll_interval,
            next_group: AtomicU64::new(1),
            groups: Mutex::new(HashMap::new()),
            policies: Mutex::new(HashMap::new()),
            watchers: Mutex::new(HashMap::new()),
        })
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    fn members(&self, group: GroupHandle) -> Result<Vec<u32>, NativeError> {
        if group.is_all_devices() {
            return Ok((0..self.device_count).collect());
        }
        self.groups
            .lock()
            .get(&group)
            .map(|info| info.entities.clone())
            .ok_or_else(|| NativeError::new("dcgmGroupGetInfo", NativeError::BAD_PARAM))
    }

    fn stop_watcher(watcher: Watcher) {
        watcher.stop.store(true, Ordering::SeqCst);
        // the thread exits on its own within one poll interval
        drop(watcher.thread);
    }
}

#[async_trait]
impl PolicyBackend for NvmlBackend {
    async fn create_group(&self, name: &str) -> Result<GroupHandle, NativeError> {
        let handle = GroupHandle::new(self.next_group.fetch_add(1, Ordering::SeqCst));
        self.groups.lock().insert(
            handle,
            GroupInfo {
                name: name.to_string(),
                entities: Vec::new(),
            },
        );
        debug!(group = %handle, name, "Created group");
        Ok(handle)
    }

    async fn add_device(&self, group: GroupHandle, gpu_id: u32) -> Result<(), NativeError> {
        if gpu_id >= self.device_count {
            return Err(NativeError::new("dcgmGroupAddDevice", NativeError::BAD_PARAM));
        }

        let mut groups = self.groups.lock();
        let info = groups
            .get_mut(&group)
            .ok_or_else(|| NativeError::new("dcgmGroupAddDevice", NativeError::BAD_PARAM))?;
        if !info.entities.contains(&gpu_id) {
            info.entities.push(gpu_id);
        }
        Ok(())
    }

    async fn destroy_group(&self, group: GroupHandle) -> Result<(), NativeError> {
        if self.groups.lock().remove(&group).is_none() {
            return Err(NativeError::new("dcgmGroupDestroy", NativeError::BAD_PARAM));
        }
        self.policies.lock().remove(&group);
        if let Some(watcher) = self.watchers.lock().remove(&group) {
            Self::stop_watcher(watcher);
        }
        Ok(())
    }

    async fn group_info(&self, group: GroupHandle) -> Result<GroupInfo, NativeError> {
        if group.is_all_devices() {
            return Ok(GroupInfo {
                name: "DCGM_ALL_SUPPORTED_GPUS".to_string(),
                entities: self.members(group)?,
            });
        }
        self.groups
            .lock()
            .get(&group)
            .cloned()
            .ok_or_else(|| NativeError::new("dcgmGroupGetInfo", NativeError::BAD_PARAM))
    }

    async fn set_policy(
        &self,
        group: GroupHandle,
        request: &PolicyRequest,
    ) -> Result<(), NativeError> {
        if request.condition.is_empty() {
            return Err(NativeError::new("dcgmPolicySet", NativeError::BAD_PARAM));
        }
        self.members(group)?;
        self.policies.lock().insert(group, request.clone());
        Ok(())
    }

    async fn register_policy(
        &self,
        group: GroupHandle,
        condition: ConditionMask,
        on_violation: PolicyCallback,
        on_finish: PolicyCallback,
    ) -> Result<(), NativeError> {
        let devices = self.members(group)?;
        let mut request = self
            .policies
            .lock()
            .get(&group)
            .cloned()
            .ok_or_else(|| NativeError::new("dcgmPolicyRegister", NativeError::NOT_CONFIGURED))?;
        request.condition = request
            .condition
            .iter()
            .filter(|c| condition.contains(*c))
            .collect();

        let mut watchers = self.watchers.lock();
        if watchers.contains_key(&group) {
            return Err(NativeError::new("dcgmPolicyRegister", NativeError::IN_USE));
        }

        let stop = Arc::new(AtomicBool::new(false));
        let sweep = Sweep {
            nvml: self.nvml,
            devices,
            evaluator: ThresholdEvaluator::new(Thresholds::from_request(&request)),
            on_violation,
            on_finish,
            stop: stop.clone(),
            interval: self.poll_interval,
        };
        let thread = thread::Builder::new()
            .name(format!("gpolicy-watch-{}", group.id()))
            .spawn(move || sweep.run())
            .map_err(|e| {
                warn!(error = %e, "Failed to spawn policy watcher");
                NativeError::new("dcgmPolicyRegister", NativeError::GENERIC)
            })?;

        watchers.insert(
            group,
            Watcher {
                condition,
                stop,
                thread,
            },
        );
        Ok(())
    }

    async fn unregister_policy(
        &self,
        group: GroupHandle,
        condition: ConditionMask,
    ) -> Result<(), NativeError> {
        let watcher = self
            .watchers
            .lock()
            .remove(&group)
            .ok_or_else(|| NativeError::new("dcgmPolicyUnregister", NativeError::BAD_PARAM))?;

        if watcher.condition != condition {
            debug!(
                group = %group,
                registered = %watcher.condition,
                requested = %condition,
                "Unregistering with a different condition mask"
            );
        }
        Self::stop_watcher(watcher);
        Ok(())
    }
}

impl Drop for NvmlBackend {
    fn drop(&mut self) {
        for (_, watcher) in self.watchers.lock().drain() {
            Self::stop_watcher(watcher);
        }
    }
}

/// Body of one watcher thread
struct Sweep {
    nvml: &'static Arc<Nvml>,
    devices: Vec<u32>,
    evaluator: ThresholdEvaluator,
    on_violation: PolicyCallback,
    on_finish: PolicyCallback,
    stop: Arc<AtomicBool>,
    interval: Duration,
}

impl Sweep {
    fn run(mut self) {
        let watch_xids = self
            .evaluator
            .thresholds()
            .condition
            .contains(PolicyCondition::Xid);
        let mut xids = watch_xids.then(|| XidScanner::new(self.bus_ids()));
        debug!(devices = ?self.devices, "Policy watcher started");

        while !self.stopped() {
            let started = Instant::now();
            let mut fresh = xids
                .as_mut()
                .and_then(|scanner| read_kernel_log().map(|log| scanner.scan(&log)))
                .unwrap_or_default();
            let timestamp_us = Utc::now().timestamp_micros();

            for &gpu_id in &self.devices {
                let mut sample = sample_device(self.nvml, gpu_id);
                sample.xids = fresh.remove(&gpu_id).unwrap_or_default();

                for response in self.evaluator.evaluate(gpu_id, &sample, timestamp_us) {
                    if self.stopped() {
                        return;
                    }
                    trace!(gpu_id, condition = response.condition, "Delivering violation");
                    (self.on_violation)(&response);
                    (self.on_finish)(&response);
                }
            }

            self.sleep(self.interval.saturating_sub(started.elapsed()));
        }
        debug!(devices = ?self.devices, "Policy watcher stopped");
    }

    fn stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Sleep in short slices so a stop request is noticed quickly
    fn sleep(&self, total: Duration) {
        let slice = Duration::from_millis(50);
        let deadline = Instant::now() + total;
        while !self.stopped() {
            let left = deadline.saturating_duration_since(Instant::now());
            if left.is_zero() {
                break;
            }
            thread::sleep(left.min(slice));
        }
    }

    fn bus_ids(&self) -> Vec<(u32, String)> {
        self.devices
            .iter()
            .filter_map(|&gpu_id| {
                let device = self.nvml.device_by_index(gpu_id).ok()?;
                let pci = device.pci_info().ok()?;
                Some((gpu_id, pci.bus_id))
            })
            .collect()
    }
}

/// Read everything the evaluator needs; unsupported queries stay `None`
fn sample_device(nvml: &Nvml, gpu_id: u32) -> DeviceSample {
    let device = match nvml.device_by_index(gpu_id) {
        Ok(device) => device,
        Err(e) => {
            warn!(gpu_id, error = %e, "Failed to open device");
            return DeviceSample::default();
        }
    };

    let retired_pages = match (
        device.retired_pages(RetirementCause::MultipleSingleBitEccErrors),
        device.retired_pages(RetirementCause::DoubleBitEccError),
    ) {
        (Ok(sbe), Ok(dbe)) => Some((sbe.len() as u32, dbe.len() as u32)),
        _ => None,
    };

    DeviceSample {
        temperature_c: device.temperature(TemperatureSensor::Gpu).ok(),
        // mW to W
        power_w: device.power_usage().ok().map(|mw| mw / 1000),
        pcie_replay: device.pcie_replay_counter().ok().map(u64::from),
        retired_pages,
        dbe_errors: device
            .total_ecc_errors(MemoryError::Uncorrected, EccCounter::Volatile)
            .ok(),
        xids: Vec::new(),
    }
}
