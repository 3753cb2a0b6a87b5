//! Policy watcher
//!
//! Public entry points: register thresholds on a set of devices and get back
//! a [`ViolationStream`] that yields violations until the cancellation token
//! fires.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bridge::{violation_callback, ViolationBroker};
use crate::config::{PipelineConfig, WatchConfig};
use crate::error::PolicyError;
use crate::fanin::{output_capacity, EventFanIn};
use crate::group::{ephemeral_group_name, GroupResource};
use crate::metrics::MetricsRegistry;
use crate::native::{GroupHandle, PolicyBackend};
use crate::policy::{ConditionMask, PolicyParams, ThresholdConfig, Violation};
use crate::registrar::PolicyRegistrar;

/// Consumer side of one registration.
///
/// Yields violations until the registration is torn down, then `None`.
#[derive(Debug)]
pub struct ViolationStream {
    rx: mpsc::Receiver<Violation>,
    capacity: usize,
    condition: ConditionMask,
    group: GroupHandle,
}

impl ViolationStream {
    /// Receive the next violation; `None` once the stream is closed
    pub async fn recv(&mut self) -> Option<Violation> {
        self.rx.recv().await
    }

    /// Buffer size of the stream
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Conditions watched by this registration
    pub fn conditions(&self) -> ConditionMask {
        self.condition
    }

    /// Group the policy is registered on
    pub fn group(&self) -> GroupHandle {
        self.group
    }
}

impl Stream for ViolationStream {
    type Item = Violation;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx)
    }
}

/// Where registrations route their violations
#[derive(Clone)]
enum BrokerSource {
    /// Process-wide queues, sized by the first registration
    Global,
    /// Caller-provided queues
    Dedicated(Arc<ViolationBroker>),
}

/// Registers threshold policies and hands out violation streams
pub struct PolicyWatcher {
    backend: Arc<dyn PolicyBackend>,
    registrar: PolicyRegistrar,
    broker: BrokerSource,
    pipeline: PipelineConfig,
    metrics: MetricsRegistry,
}

impl PolicyWatcher {
    /// Create a watcher routing through the process-wide violation queues
    pub fn new(backend: Arc<dyn PolicyBackend>) -> Self {
        Self {
            registrar: PolicyRegistrar::new(backend.clone()),
            backend,
            broker: BrokerSource::Global,
            pipeline: PipelineConfig::default(),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Create a watcher routing through its own violation queues
    pub fn with_broker(backend: Arc<dyn PolicyBackend>, broker: Arc<ViolationBroker>) -> Self {
        Self {
            broker: BrokerSource::Dedicated(broker),
            ..Self::new(backend)
        }
    }

    /// Override pipeline tuning
    pub fn with_pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    /// Watch every device through the reserved all-devices group
    pub async fn register_policy_for_all_devices(
        &self,
        cancel: CancellationToken,
        params: &PolicyParams,
    ) -> Result<ViolationStream, PolicyError> {
        self.register_policy_for_group(cancel, params, GroupHandle::ALL_DEVICES)
            .await
    }

    /// Watch a caller-owned group; the group is never destroyed here
    pub async fn register_policy_for_group(
        &self,
        cancel: CancellationToken,
        params: &PolicyParams,
        group: GroupHandle,
    ) -> Result<ViolationStream, PolicyError> {
        let config = ThresholdConfig::normalize(params)?;
        let group = GroupResource::wrap_existing(self.backend.clone(), group);
        let cancel = cancel.child_token();

        // nothing to release for an adopted group
        let (torn_down, _) = oneshot::channel();
        self.start(cancel, &config, &group, torn_down).await
    }

    /// Watch specific devices through an ephemeral group.
    ///
    /// The group is destroyed once the policy has been unregistered after
    /// cancellation, or after the teardown timeout if unregistering hangs.
    /// If registration fails the group is still reclaimed the same way once
    /// `cancel` fires; until then it stays allocated.
    pub async fn register_policy_for_devices(
        &self,
        cancel: CancellationToken,
        params: &PolicyParams,
        device_ids: &[u32],
    ) -> Result<ViolationStream, PolicyError> {
        self.register_devices(cancel, params, device_ids, self.pipeline.teardown_timeout)
            .await
    }

    /// Register according to a loaded configuration.
    ///
    /// `config.pipeline` applies to this registration in place of the
    /// watcher's own pipeline settings.
    pub async fn watch(
        &self,
        cancel: CancellationToken,
        config: &WatchConfig,
    ) -> Result<ViolationStream, PolicyError> {
        if config.devices.is_empty() {
            self.register_policy_for_all_devices(cancel, &config.policy)
                .await
        } else {
            self.register_devices(
                cancel,
                &config.policy,
                &config.devices,
                config.pipeline.teardown_timeout,
            )
            .await
        }
    }

    async fn register_devices(
        &self,
        cancel: CancellationToken,
        params: &PolicyParams,
        device_ids: &[u32],
        teardown_timeout: Duration,
    ) -> Result<ViolationStream, PolicyError> {
        let config = ThresholdConfig::normalize(params)?;
        if device_ids.is_empty() {
            return Err(PolicyError::Validation(
                "at least one device id is required".to_string(),
            ));
        }

        let mut group =
            GroupResource::allocate(self.backend.clone(), &ephemeral_group_name()).await?;
        let cancel = cancel.child_token();
        let (torn_down_tx, torn_down_rx) = oneshot::channel();

        let added = group.add_devices(device_ids).await;
        let group = Arc::new(group);
        self.spawn_release(group.clone(), cancel.clone(), torn_down_rx, teardown_timeout);
        added?;

        self.start(cancel, &config, &group, torn_down_tx).await
    }

    fn broker_for(&self, device_count: usize) -> Arc<ViolationBroker> {
        match &self.broker {
            BrokerSource::Global => ViolationBroker::initialize_global(device_count),
            BrokerSource::Dedicated(broker) => broker.clone(),
        }
    }

    async fn start(
        &self,
        cancel: CancellationToken,
        config: &ThresholdConfig,
        group: &GroupResource,
        torn_down: oneshot::Sender<()>,
    ) -> Result<ViolationStream, PolicyError> {
        let handle = group.handle();
        let device_count = group.device_count().await?;
        let broker = self.broker_for(device_count);

        let condition = self.registrar.apply_thresholds(handle, config).await?;
        self.registrar
            .register(handle, condition, violation_callback(broker.clone()))
            .await?;

        let capacity = output_capacity(config.enabled_count(), device_count);
        let (tx, rx) = mpsc::channel(capacity);

        let fanin = EventFanIn::new(
            broker,
            self.registrar.clone(),
            handle,
            condition,
            tx,
            torn_down,
            cancel,
        );
        tokio::spawn(fanin.run());

        info!(
            group = %handle,
            condition = %condition,
            devices = device_count,
            capacity,
            "Policy registration active"
        );

        Ok(ViolationStream {
            rx,
            capacity,
            condition,
            group: handle,
        })
    }

    /// Destroy an owned group after cancellation, once teardown is confirmed
    /// or the teardown timeout elapses.
    fn spawn_release(
        &self,
        group: Arc<GroupResource>,
        cancel: CancellationToken,
        torn_down: oneshot::Receiver<()>,
        timeout: Duration,
    ) {
        let metrics = self.metrics;

        tokio::spawn(async move {
            cancel.cancelled().await;

            let reason = await_teardown(torn_down, timeout).await;
            if reason == "timeout" {
                warn!(group = %group.handle(), ?timeout, "Policy teardown not confirmed, releasing group");
            }
            metrics.inc_group_release(reason);

            if let Err(e) = group.release().await {
                error!(group = %group.handle(), error = %e, "Failed to destroy policy group");
            }
        });
    }
}

/// Wait for the torn-down signal, bounded by `timeout`
async fn await_teardown(torn_down: oneshot::Receiver<()>, timeout: Duration) -> &'static str {
    tokio::select! {
        // a dropped sender means no policy was ever registered
        _ = torn_down => "confirmed",
        _ = tokio::time::sleep(timeout) => "timeout",
    }
}
