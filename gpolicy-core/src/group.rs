//! Device group ownership
//!
//! A [`GroupResource`] scopes one policy registration. Groups created here
//! are owned and destroyed by [`GroupResource::release`]; adopted groups
//! belong to the caller and are never destroyed.
//!
//! There is no `Drop` cleanup: releasing needs an async native call, so an
//! owned group that is dropped without `release` stays allocated.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::error::PolicyError;
use crate::native::{GroupHandle, PolicyBackend};

static GROUP_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Process-unique name for an ephemeral policy group
pub fn ephemeral_group_name() -> String {
    format!(
        "PolicyGroup_{}_{}",
        std::process::id(),
        GROUP_SEQUENCE.fetch_add(1, Ordering::Relaxed)
    )
}

/// Native device group scoped to a policy registration
pub struct GroupResource {
    backend: Arc<dyn PolicyBackend>,
    handle: GroupHandle,
    devices: Vec<u32>,
    owned: bool,
    released: AtomicBool,
}

impl GroupResource {
    /// Allocate an empty, owned group
    pub async fn allocate(
        backend: Arc<dyn PolicyBackend>,
        name: &str,
    ) -> Result<Self, PolicyError> {
        let handle = backend.create_group(name).await?;
        debug!(group = %handle, name, "Created policy group");

        Ok(Self {
            backend,
            handle,
            devices: Vec::new(),
            owned: true,
            released: AtomicBool::new(false),
        })
    }

    /// Allocate an owned group and add `device_ids` in order.
    ///
    /// A failure part way returns [`PolicyError::ResourceLeakRisk`]: the
    /// partially populated group is not destroyed here.
    pub async fn create_ephemeral(
        backend: Arc<dyn PolicyBackend>,
        device_ids: &[u32],
    ) -> Result<Self, PolicyError> {
        let mut group = Self::allocate(backend, &ephemeral_group_name()).await?;
        group.add_devices(device_ids).await?;
        Ok(group)
    }

    /// Adopt a caller-owned group; it is never destroyed by this subsystem
    pub fn wrap_existing(backend: Arc<dyn PolicyBackend>, handle: GroupHandle) -> Self {
        Self {
            backend,
            handle,
            devices: Vec::new(),
            owned: false,
            released: AtomicBool::new(false),
        }
    }

    /// Add devices in the given order, stopping at the first failure
    pub async fn add_devices(&mut self, device_ids: &[u32]) -> Result<(), PolicyError> {
        for &gpu_id in device_ids {
            self.backend
                .add_device(self.handle, gpu_id)
                .await
                .map_err(|source| PolicyError::ResourceLeakRisk {
                    group: self.handle,
                    source,
                })?;
            self.devices.push(gpu_id);
        }
        Ok(())
    }

    pub fn handle(&self) -> GroupHandle {
        self.handle
    }

    /// Devices added through this resource
    pub fn devices(&self) -> &[u32] {
        &self.devices
    }

    pub fn is_owned(&self) -> bool {
        self.owned
    }

    /// Number of devices in the native group
    pub async fn device_count(&self) -> Result<usize, PolicyError> {
        let info = self.backend.group_info(self.handle).await?;
        Ok(info.entities.len())
    }

    /// Destroy the native group if it is owned and not yet released.
    ///
    /// Returns whether a destroy call was issued.
    pub async fn release(&self) -> Result<bool, PolicyError> {
        if !self.owned || self.released.swap(true, Ordering::SeqCst) {
            return Ok(false);
        }

        self.backend.destroy_group(self.handle).await?;
        info!(group = %self.handle, "Destroyed policy group");
        Ok(true)
    }
}

impl std::fmt::Debug for GroupResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupResource")
            .field("handle", &self.handle)
            .field("devices", &self.devices)
            .field("owned", &self.owned)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::native::MockBackend;

    #[tokio::test]
    async fn test_create_ephemeral_adds_in_order() {
        let mock = Arc::new(MockBackend::with_device_count(4));
        let group = GroupResource::create_ephemeral(mock.clone(), &[3, 1, 2])
            .await
            .unwrap();

        assert!(group.is_owned());
        assert_eq!(group.devices(), &[3, 1, 2]);
        assert_eq!(mock.group_members(group.handle()), Some(vec![3, 1, 2]));
        assert_eq!(group.device_count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_partial_failure_leaves_group_allocated() {
        let mock = Arc::new(MockBackend::with_device_count(4));
        mock.fail_add_device(2);

        let err = GroupResource::create_ephemeral(mock.clone(), &[0, 1, 2, 3])
            .await
            .unwrap_err();

        let group = match err {
            PolicyError::ResourceLeakRisk { group, .. } => group,
            other => panic!("unexpected error {:?}", other),
        };
        assert_eq!(mock.live_groups(), vec![group]);
        assert_eq!(mock.group_members(group), Some(vec![0, 1]));
        assert!(mock.destroyed_groups().is_empty());
    }

    #[tokio::test]
    async fn test_release_only_owned_and_once() {
        let mock = Arc::new(MockBackend::new());
        let owned = GroupResource::create_ephemeral(mock.clone(), &[0]).await.unwrap();
        assert!(owned.release().await.unwrap());
        assert!(!owned.release().await.unwrap());
        assert_eq!(mock.destroyed_groups().len(), 1);

        let adopted = GroupResource::wrap_existing(mock.clone(), GroupHandle::ALL_DEVICES);
        assert!(!adopted.is_owned());
        assert!(!adopted.release().await.unwrap());
        assert_eq!(mock.destroyed_groups().len(), 1);
        assert_eq!(adopted.device_count().await.unwrap(), 2);
    }

    #[test]
    fn test_ephemeral_names_are_unique() {
        let a = ephemeral_group_name();
        let b = ephemeral_group_name();
        assert!(a.starts_with("PolicyGroup_"));
        assert_ne!(a, b);
    }
}
