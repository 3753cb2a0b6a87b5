//! Mock policy backend for testing

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{
    GroupHandle, GroupInfo, NativeError, PolicyBackend, PolicyCallback, PolicyCallbackResponse,
    PolicyRequest,
};
use crate::policy::ConditionMask;

/// In-process stand-in for the native management library.
///
/// Keeps a single callback slot like the real library: a second
/// registration replaces the first.
pub struct MockBackend {
    device_count: u32,
    next_group: AtomicU64,
    groups: Mutex<HashMap<GroupHandle, GroupInfo>>,
    destroyed: Mutex<Vec<GroupHandle>>,
    policies: Mutex<Vec<(GroupHandle, PolicyRequest)>>,
    registrations: Mutex<Vec<(GroupHandle, ConditionMask)>>,
    unregistrations: Mutex<Vec<(GroupHandle, ConditionMask)>>,
    callbacks: Mutex<Option<(PolicyCallback, PolicyCallback)>>,
    finish_calls: AtomicUsize,
    /// Simulated add-device failures, by gpu id
    fail_add_device: Mutex<HashSet<u32>>,
    /// Configurable set-policy failure simulation
    pub fail_set_policy: AtomicBool,
    /// Configurable register failure simulation
    pub fail_register: AtomicBool,
    /// Configurable unregister failure simulation
    pub fail_unregister: AtomicBool,
    /// Simulated stuck unregister
    unregister_delay: Mutex<Option<Duration>>,
}

impl MockBackend {
    /// Create a new mock backend with default 2 GPUs
    pub fn new() -> Self {
        Self::with_device_count(2)
    }

    /// Create a mock backend with specified number of GPUs
    pub fn with_device_count(count: u32) -> Self {
        Self {
            device_count: count,
            next_group: AtomicU64::new(1),
            groups: Mutex::new(HashMap::new()),
            destroyed: Mutex::new(Vec::new()),
            policies: Mutex::new(Vec::new()),
            registrations: Mutex::new(Vec::new()),
            unregistrations: Mutex::new(Vec::new()),
            callbacks: Mutex::new(None),
            finish_calls: AtomicUsize::new(0),
            fail_add_device: Mutex::new(HashSet::new()),
            fail_set_policy: AtomicBool::new(false),
            fail_register: AtomicBool::new(false),
            fail_unregister: AtomicBool::new(false),
            unregister_delay: Mutex::new(None),
        }
    }

    /// Make `add_device` fail for the given gpu id
    pub fn fail_add_device(&self, gpu_id: u32) {
        self.fail_add_device.lock().insert(gpu_id);
    }

    pub fn set_fail_set_policy(&self, fail: bool) {
        self.fail_set_policy.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_register(&self, fail: bool) {
        self.fail_register.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_unregister(&self, fail: bool) {
        self.fail_unregister.store(fail, Ordering::SeqCst);
    }

    /// Delay every unregister call, simulating a stuck native library
    pub fn set_unregister_delay(&self, delay: Option<Duration>) {
        *self.unregister_delay.lock() = delay;
    }

    /// Deliver a violation through the installed callback.
    ///
    /// Returns the callback's return code, or `None` when nothing is registered.
    pub fn simulate_violation(&self, response: &PolicyCallbackResponse) -> Option<i32> {
        let (on_violation, on_finish) = self.callbacks.lock().clone()?;
        let rc = on_violation(response);
        on_finish(response);
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        Some(rc)
    }

    /// Deliver a violation from a freshly spawned OS thread, the way the
    /// native library does.
    pub fn simulate_violation_from_thread(&self, response: PolicyCallbackResponse) -> Option<i32> {
        let (on_violation, on_finish) = self.callbacks.lock().clone()?;
        let handle = std::thread::spawn(move || {
            let rc = on_violation(&response);
            on_finish(&response);
            rc
        });
        let rc = handle.join().ok()?;
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        Some(rc)
    }

    /// Whether a callback is currently installed
    pub fn has_callback(&self) -> bool {
        self.callbacks.lock().is_some()
    }

    /// Groups currently allocated
    pub fn live_groups(&self) -> Vec<GroupHandle> {
        self.groups.lock().keys().copied().collect()
    }

    /// Members of an allocated group
    pub fn group_members(&self, group: GroupHandle) -> Option<Vec<u32>> {
        self.groups.lock().get(&group).map(|info| info.entities.clone())
    }

    /// Groups destroyed so far, in order
    pub fn destroyed_groups(&self) -> Vec<GroupHandle> {
        self.destroyed.lock().clone()
    }

    /// Most recent set-policy request
    pub fn last_policy(&self) -> Option<(GroupHandle, PolicyRequest)> {
        self.policies.lock().last().cloned()
    }

    pub fn register_count(&self) -> usize {
        self.registrations.lock().len()
    }

    pub fn unregister_count(&self) -> usize {
        self.unregistrations.lock().len()
    }

    /// Unregister calls received, including failed ones
    pub fn unregistrations(&self) -> Vec<(GroupHandle, ConditionMask)> {
        self.unregistrations.lock().clone()
    }

    /// Times the finish callback has run
    pub fn finish_count(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PolicyBackend for MockBackend {
    async fn create_group(&self, name: &str) -> Result<GroupHandle, NativeError> {
        let handle = GroupHandle::new(self.next_group.fetch_add(1, Ordering::SeqCst));
        self.groups.lock().insert(
            handle,
            GroupInfo {
                name: name.to_string(),
                entities: Vec::new(),
            },
        );
        Ok(handle)
    }

    async fn add_device(&self, group: GroupHandle, gpu_id: u32) -> Result<(), NativeError> {
        if self.fail_add_device.lock().contains(&gpu_id) || gpu_id >= self.device_count {
            return Err(NativeError::new("dcgmGroupAddDevice", NativeError::BAD_PARAM));
        }

        let mut groups = self.groups.lock();
        let info = groups
            .get_mut(&group)
            .ok_or_else(|| NativeError::new("dcgmGroupAddDevice", NativeError::BAD_PARAM))?;
        info.entities.push(gpu_id);
        Ok(())
    }

    async fn destroy_group(&self, group: GroupHandle) -> Result<(), NativeError> {
        if self.groups.lock().remove(&group).is_none() {
            return Err(NativeError::new("dcgmGroupDestroy", NativeError::BAD_PARAM));
        }
        self.destroyed.lock().push(group);
        Ok(())
    }

    async fn group_info(&self, group: GroupHandle) -> Result<GroupInfo, NativeError> {
        if group.is_all_devices() {
            return Ok(GroupInfo {
                name: "DCGM_ALL_SUPPORTED_GPUS".to_string(),
                entities: (0..self.device_count).collect(),
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
        if self.fail_set_policy.load(Ordering::SeqCst) {
            return Err(NativeError::new("dcgmPolicySet", NativeError::NOT_SUPPORTED));
        }
        self.policies.lock().push((group, request.clone()));
        Ok(())
    }

    async fn register_policy(
        &self,
        group: GroupHandle,
        condition: ConditionMask,
        on_violation: PolicyCallback,
        on_finish: PolicyCallback,
    ) -> Result<(), NativeError> {
        if self.fail_register.load(Ordering::SeqCst) {
            return Err(NativeError::new("dcgmPolicyRegister", NativeError::IN_USE));
        }
        self.registrations.lock().push((group, condition));
        *self.callbacks.lock() = Some((on_violation, on_finish));
        Ok(())
    }

    async fn unregister_policy(
        &self,
        group: GroupHandle,
        condition: ConditionMask,
    ) -> Result<(), NativeError> {
        self.unregistrations.lock().push((group, condition));

        let delay = *self.unregister_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_unregister.load(Ordering::SeqCst) {
            return Err(NativeError::new("dcgmPolicyUnregister", NativeError::GENERIC));
        }
        *self.callbacks.lock() = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::RawPolicyValue;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_mock_group_lifecycle() {
        let mock = MockBackend::with_device_count(4);
        let group = mock.create_group("test").await.unwrap();
        mock.add_device(group, 0).await.unwrap();
        mock.add_device(group, 3).await.unwrap();

        let info = mock.group_info(group).await.unwrap();
        assert_eq!(info.entities, vec![0, 3]);

        mock.destroy_group(group).await.unwrap();
        assert!(mock.live_groups().is_empty());
        assert_eq!(mock.destroyed_groups(), vec![group]);
    }

    #[tokio::test]
    async fn test_mock_all_devices_group() {
        let mock = MockBackend::with_device_count(3);
        let info = mock.group_info(GroupHandle::ALL_DEVICES).await.unwrap();
        assert_eq!(info.entities.len(), 3);
    }

    #[tokio::test]
    async fn test_mock_add_device_failure() {
        let mock = MockBackend::new();
        mock.fail_add_device(1);
        let group = mock.create_group("test").await.unwrap();
        assert!(mock.add_device(group, 0).await.is_ok());
        assert!(mock.add_device(group, 1).await.is_err());
        // unknown device
        assert!(mock.add_device(group, 9).await.is_err());
    }

    #[tokio::test]
    async fn test_mock_callback_slot() {
        let mock = MockBackend::new();
        let response = PolicyCallbackResponse {
            condition: 0x10,
            value: RawPolicyValue::Power {
                timestamp_us: 0,
                power_violation: 300,
                gpu_id: 0,
            },
        };
        assert!(mock.simulate_violation(&response).is_none());

        let on_violation: PolicyCallback = Arc::new(|_| 7);
        let on_finish: PolicyCallback = Arc::new(|_| 0);
        mock.register_policy(GroupHandle::ALL_DEVICES, ConditionMask::EMPTY, on_violation, on_finish)
            .await
            .unwrap();

        assert_eq!(mock.simulate_violation(&response), Some(7));
        assert_eq!(mock.simulate_violation_from_thread(response.clone()), Some(7));
        assert_eq!(mock.finish_count(), 2);

        mock.unregister_policy(GroupHandle::ALL_DEVICES, ConditionMask::EMPTY)
            .await
            .unwrap();
        assert!(!mock.has_callback());
        assert_eq!(mock.unregister_count(), 1);
    }
}
