//! Policy registrar
//!
//! Turns a [`ThresholdConfig`] into the native condition bitmask and
//! parameter table, and issues the set / register / unregister calls.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::bridge::heartbeat_callback;
use crate::error::PolicyError;
use crate::metrics::MetricsRegistry;
use crate::native::{GroupHandle, PolicyBackend, PolicyCallback, PolicyParam, PolicyRequest};
use crate::policy::{ConditionMask, ThresholdConfig};

/// Issues policy calls against the native library
#[derive(Clone)]
pub struct PolicyRegistrar {
    backend: Arc<dyn PolicyBackend>,
    metrics: MetricsRegistry,
}

impl PolicyRegistrar {
    pub fn new(backend: Arc<dyn PolicyBackend>) -> Self {
        Self {
            backend,
            metrics: MetricsRegistry::new(),
        }
    }

    /// Build the native set-policy payload.
    ///
    /// Conditions are written in canonical order (ECC, PCIe, retired pages,
    /// thermal, power, XID).
    pub fn build_request(config: &ThresholdConfig) -> PolicyRequest {
        let mut request = PolicyRequest::default();

        for condition in config.conditions() {
            let param = match config.threshold(condition) {
                Some(limit) => PolicyParam::limit(limit),
                None => PolicyParam::flag(),
            };
            debug!(
                condition = %condition,
                index = condition.param_index(),
                value = param.value,
                "Setting policy condition"
            );
            request.params[condition.param_index()] = Some(param);
            request.condition.insert(condition);
        }

        request
    }

    /// Push thresholds for the enabled conditions in one set-policy call.
    ///
    /// Returns the combined condition bitmask.
    pub async fn apply_thresholds(
        &self,
        group: GroupHandle,
        config: &ThresholdConfig,
    ) -> Result<ConditionMask, PolicyError> {
        let request = Self::build_request(config);
        self.backend.set_policy(group, &request).await?;

        info!(group = %group, condition = %request.condition, "Policy successfully set");
        Ok(request.condition)
    }

    /// Install the violation callback and the no-op heartbeat in one call
    pub async fn register(
        &self,
        group: GroupHandle,
        condition: ConditionMask,
        on_violation: PolicyCallback,
    ) -> Result<(), PolicyError> {
        self.backend
            .register_policy(group, condition, on_violation, heartbeat_callback())
            .await?;

        info!(group = %group, condition = %condition, "Listening for violations");
        Ok(())
    }

    /// Best-effort unregister; failures are logged, never returned.
    pub async fn unregister(&self, group: GroupHandle, condition: ConditionMask) {
        debug!(group = %group, condition = %condition, "Unregistering policy");

        if let Err(e) = self.backend.unregister_policy(group, condition).await {
            error!(group = %group, error = %e, "Error unregistering policy");
            self.metrics.inc_unregister_failure();
        }
    }
}
