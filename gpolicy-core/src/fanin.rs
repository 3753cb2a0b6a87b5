//! Event fan-in
//!
//! One task per active registration merges the per-condition queues into
//! the consumer's output stream and drives teardown:
//!
//! ACTIVE → DRAINING → CLOSED
//!
//! - ACTIVE: wait on the queues of the enabled conditions, the cancellation
//!   token and the consumer going away.
//! - DRAINING: cancellation observed (or the consumer dropped the stream);
//!   the policy is unregistered.
//! - CLOSED: violations still queued for the enabled conditions are
//!   discarded, then the output stream and the torn-down signal are closed.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::bridge::ViolationBroker;
use crate::metrics::MetricsRegistry;
use crate::native::GroupHandle;
use crate::policy::{ConditionMask, Violation};
use crate::registrar::PolicyRegistrar;

/// Lifecycle state of an [`EventFanIn`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FanInState {
    Active,
    Draining,
    Closed,
}

impl fmt::Display for FanInState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FanInState::Active => write!(f, "ACTIVE"),
            FanInState::Draining => write!(f, "DRAINING"),
            FanInState::Closed => write!(f, "CLOSED"),
        }
    }
}

/// Output capacity for `enabled` conditions over `device_count` devices
pub fn output_capacity(enabled: usize, device_count: usize) -> usize {
    enabled * (device_count + 1)
}

/// Single-consumer merge loop for one registration
pub struct EventFanIn {
    broker: Arc<ViolationBroker>,
    registrar: PolicyRegistrar,
    group: GroupHandle,
    condition: ConditionMask,
    output: Option<mpsc::Sender<Violation>>,
    torn_down: Option<oneshot::Sender<()>>,
    cancel: CancellationToken,
    state: FanInState,
    metrics: MetricsRegistry,
}

impl EventFanIn {
    /// Create a fan-in for a registered policy.
    ///
    /// `torn_down` is signalled once the policy has been unregistered and the
    /// output closed.
    pub fn new(
        broker: Arc<ViolationBroker>,
        registrar: PolicyRegistrar,
        group: GroupHandle,
        condition: ConditionMask,
        output: mpsc::Sender<Violation>,
        torn_down: oneshot::Sender<()>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            broker,
            registrar,
            group,
            condition,
            output: Some(output),
            torn_down: Some(torn_down),
            cancel,
            state: FanInState::Active,
            metrics: MetricsRegistry::new(),
        }
    }

    pub fn state(&self) -> FanInState {
        self.state
    }

    /// Run until cancelled, then tear down. Consumes the fan-in.
    pub async fn run(mut self) -> FanInState {
        self.metrics.registration_started();
        debug!(group = %self.group, condition = %self.condition, "Fan-in started");

        while self.state == FanInState::Active {
            self.step().await;
        }

        self.drain().await;
        self.close();
        self.metrics.registration_closed();
        self.state
    }

    /// One ACTIVE iteration: forward a violation or observe cancellation
    async fn step(&mut self) {
        let Some(output) = self.output.as_ref() else {
            self.state = FanInState::Draining;
            return;
        };

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.state = FanInState::Draining;
            }
            _ = output.closed() => {
                debug!(group = %self.group, "Violation consumer dropped");
                self.cancel.cancel();
                self.state = FanInState::Draining;
            }
            violation = self.broker.next_in(self.condition) => {
                let condition = violation.condition;
                if !self.condition.contains(condition) {
                    debug!(group = %self.group, %condition, "Dropping violation for an unwatched condition");
                    return;
                }
                // a slow consumer must not hold up cancellation
                tokio::select! {
                    sent = output.send(violation) => match sent {
                        Ok(()) => self.metrics.inc_delivered(condition),
                        Err(_) => {
                            debug!(group = %self.group, "Violation consumer dropped");
                            self.cancel.cancel();
                            self.state = FanInState::Draining;
                        }
                    },
                    _ = self.cancel.cancelled() => {
                        self.state = FanInState::Draining;
                    }
                }
            }
        }
    }

    async fn drain(&mut self) {
        if self.state != FanInState::Draining {
            return;
        }
        info!(group = %self.group, "Unregister policy violation");
        self.registrar.unregister(self.group, self.condition).await;
    }

    /// Discard leftovers, close the output and the torn-down signal; idempotent
    fn close(&mut self) {
        let discarded = self.broker.discard(self.condition);
        if discarded > 0 {
            debug!(group = %self.group, discarded, "Discarded queued violations on close");
        }
        self.output.take();
        if let Some(torn_down) = self.torn_down.take() {
            let _ = torn_down.send(());
        }
        self.state = FanInState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{violation_callback, ViolationBroker};
    use crate::native::{MockBackend, PolicyCallbackResponse, RawPolicyValue};
    use crate::policy::PolicyCondition;
    use std::time::Duration;

    struct Harness {
        mock: Arc<MockBackend>,
        broker: Arc<ViolationBroker>,
        cancel: CancellationToken,
        rx: mpsc::Receiver<Violation>,
        torn_down: oneshot::Receiver<()>,
        task: tokio::task::JoinHandle<FanInState>,
    }

    fn start(output_capacity: usize) -> Harness {
        let mock = Arc::new(MockBackend::new());
        let broker = Arc::new(ViolationBroker::new(6));
        let cancel = CancellationToken::new();
        let (tx, rx) = mpsc::channel(output_capacity);
        let (torn_tx, torn_rx) = oneshot::channel();

        let fanin = EventFanIn::new(
            broker.clone(),
            PolicyRegistrar::new(mock.clone()),
            GroupHandle::ALL_DEVICES,
            ConditionMask::from(PolicyCondition::Thermal),
            tx,
            torn_tx,
            cancel.clone(),
        );
        assert_eq!(fanin.state(), FanInState::Active);

        Harness {
            mock,
            broker,
            cancel,
            rx,
            torn_down: torn_rx,
            task: tokio::spawn(fanin.run()),
        }
    }

    fn thermal(gpu_id: u32) -> PolicyCallbackResponse {
        PolicyCallbackResponse {
            condition: PolicyCondition::Thermal.bit(),
            value: RawPolicyValue::Thermal {
                timestamp_us: 0,
                thermal_violation: 101,
                gpu_id,
            },
        }
    }

    #[test]
    fn test_output_capacity() {
        assert_eq!(output_capacity(2, 4), 10);
        assert_eq!(output_capacity(1, 0), 1);
    }

    #[tokio::test]
    async fn test_forwards_then_closes_on_cancel() {
        let mut h = start(4);
        let callback = violation_callback(h.broker.clone());
        callback(&thermal(0));
        callback(&thermal(1));

        let first = tokio::time::timeout(Duration::from_secs(1), h.rx.recv())
            .await
            .unwrap()
            .unwrap();
        let second = h.rx.recv().await.unwrap();
        assert_eq!(first.data.gpu_id(), 0);
        assert_eq!(second.data.gpu_id(), 1);

        h.cancel.cancel();
        h.cancel.cancel();

        assert_eq!(h.task.await.unwrap(), FanInState::Closed);
        assert!(h.rx.recv().await.is_none());
        assert!(h.torn_down.await.is_ok());
        assert_eq!(h.mock.unregister_count(), 1);
    }

    #[tokio::test]
    async fn test_cancel_while_consumer_is_slow() {
        let h = start(1);
        let callback = violation_callback(h.broker.clone());
        // fill the output, then block the fan-in on the next send
        callback(&thermal(0));
        callback(&thermal(1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        h.cancel.cancel();
        let state = tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, FanInState::Closed);
        assert_eq!(h.mock.unregister_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_consumer_tears_down() {
        let h = start(2);
        let callback = violation_callback(h.broker.clone());
        drop(h.rx);
        callback(&thermal(3));

        let state = tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, FanInState::Closed);
        assert!(h.cancel.is_cancelled());
        assert_eq!(h.mock.unregister_count(), 1);
    }

    #[tokio::test]
    async fn test_dropped_consumer_without_events_tears_down() {
        let h = start(2);
        drop(h.rx);

        let state = tokio::time::timeout(Duration::from_secs(1), h.task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(state, FanInState::Closed);
        assert!(h.cancel.is_cancelled());
        assert_eq!(h.mock.unregister_count(), 1);
        assert!(h.torn_down.await.is_ok());
    }

    #[tokio::test]
    async fn test_unwatched_conditions_are_not_forwarded() {
        let mut h = start(4);
        let callback = violation_callback(h.broker.clone());
        callback(&PolicyCallbackResponse {
            condition: PolicyCondition::Power.bit(),
            value: RawPolicyValue::Power {
                timestamp_us: 0,
                power_violation: 300,
                gpu_id: 7,
            },
        });
        callback(&thermal(1));

        let first = tokio::time::timeout(Duration::from_secs(1), h.rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.condition, PolicyCondition::Thermal);
        assert!(tokio::time::timeout(Duration::from_millis(50), h.rx.recv())
            .await
            .is_err());

        // left for whichever registration watches power
        assert_eq!(h.broker.pending(PolicyCondition::Power), 1);
        h.cancel.cancel();
        h.task.await.unwrap();
        assert_eq!(h.broker.pending(PolicyCondition::Power), 1);
    }

    #[tokio::test]
    async fn test_close_discards_queued_violations() {
        let h = start(1);
        let callback = violation_callback(h.broker.clone());
        // one in the output, one blocked in send, the rest stay queued
        for gpu_id in 0..4 {
            callback(&thermal(gpu_id));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.broker.pending(PolicyCondition::Thermal) > 0);

        h.cancel.cancel();
        assert_eq!(h.task.await.unwrap(), FanInState::Closed);
        assert_eq!(h.broker.pending(PolicyCondition::Thermal), 0);
    }
}
