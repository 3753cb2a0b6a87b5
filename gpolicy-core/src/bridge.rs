//! Violation bridge
//!
//! Entry point for callbacks coming from the native library. Raw payloads are
//! decoded into [`Violation`]s and pushed into one bounded queue per
//! [`PolicyCondition`]. Pushing never blocks: a full queue drops the event.
//!
//! The native library has a single process-wide callback slot, so the queue
//! set is shared by every registration in the process and keyed by condition
//! only. Two registrations watching the same condition compete for its events.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use chrono::DateTime;
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, error, warn};

use crate::metrics::MetricsRegistry;
use crate::native::{PolicyCallback, PolicyCallbackResponse, RawPolicyValue};
use crate::policy::{
    ConditionMask, DbeLocation, DbeViolation, PcieViolation, PolicyCondition, PowerViolation,
    RetiredPagesViolation, ThermalViolation, Violation, ViolationData, XidViolation,
};

/// Per-condition queue slots per watched device
pub const QUEUE_MULTIPLIER: usize = 3;

/// Per-condition queue capacity for `device_count` devices
pub fn queue_capacity(device_count: usize) -> usize {
    QUEUE_MULTIPLIER * (device_count + 1)
}

static GLOBAL_BROKER: OnceCell<Arc<ViolationBroker>> = OnceCell::new();

/// Result of pushing a violation into its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Queued with room to spare
    Queued,
    /// Queued into the last free slot
    AlmostFull,
    /// Queue was full; the violation was discarded
    Dropped,
}

struct ConditionQueue {
    condition: PolicyCondition,
    items: Mutex<VecDeque<Violation>>,
    ready: Notify,
}

impl ConditionQueue {
    fn new(condition: PolicyCondition, capacity: usize) -> Self {
        Self {
            condition,
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            ready: Notify::new(),
        }
    }

    fn push(&self, violation: Violation, capacity: usize) -> EnqueueOutcome {
        let outcome = {
            let mut items = self.items.lock();
            if items.len() >= capacity {
                EnqueueOutcome::Dropped
            } else {
                let outcome = if items.len() + 1 == capacity {
                    EnqueueOutcome::AlmostFull
                } else {
                    EnqueueOutcome::Queued
                };
                items.push_back(violation);
                outcome
            }
        };

        if outcome != EnqueueOutcome::Dropped {
            self.ready.notify_one();
        }
        outcome
    }

    /// Wait for the next violation. Cancel safe: an item is only removed in
    /// the same poll that returns it.
    async fn pop(&self) -> Violation {
        loop {
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next = self.items.lock().pop_front();
            if let Some(violation) = next {
                return violation;
            }
            notified.await;
        }
    }
}

/// Process-scoped set of per-condition violation queues
pub struct ViolationBroker {
    capacity: usize,
    queues: [ConditionQueue; 6],
    metrics: MetricsRegistry,
}

impl ViolationBroker {
    /// Create a standalone broker whose queues hold `capacity` violations each
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            queues: PolicyCondition::ALL.map(|c| ConditionQueue::new(c, capacity)),
            metrics: MetricsRegistry::new(),
        }
    }

    /// Create a standalone broker sized for `device_count` devices
    pub fn for_devices(device_count: usize) -> Self {
        Self::new(queue_capacity(device_count))
    }

    /// Initialize the process-wide broker, or reuse it if it already exists.
    ///
    /// Sizing happens once: later calls with a different device count get
    /// the existing queues unchanged.
    pub fn initialize_global(device_count: usize) -> Arc<ViolationBroker> {
        let broker = GLOBAL_BROKER.get_or_init(|| {
            let capacity = queue_capacity(device_count);
            debug!(capacity, device_count, "Initialized violation queues");
            Arc::new(ViolationBroker::new(capacity))
        });

        if broker.capacity != queue_capacity(device_count) {
            debug!(
                capacity = broker.capacity,
                requested = queue_capacity(device_count),
                "Reusing violation queues sized by an earlier registration"
            );
        }
        broker.clone()
    }

    /// The process-wide broker, if initialized
    pub fn global() -> Option<Arc<ViolationBroker>> {
        GLOBAL_BROKER.get().cloned()
    }

    /// Capacity of each per-condition queue
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Violations waiting for a condition
    pub fn pending(&self, condition: PolicyCondition) -> usize {
        self.queue(condition).items.lock().len()
    }

    fn queue(&self, condition: PolicyCondition) -> &ConditionQueue {
        &self.queues[condition.ordinal()]
    }

    /// Push a violation into its condition's queue without blocking.
    pub fn enqueue(&self, violation: Violation) -> EnqueueOutcome {
        let queue = self.queue(violation.condition);
        let gpu_id = violation.data.gpu_id();
        let outcome = queue.push(violation, self.capacity);

        match outcome {
            EnqueueOutcome::Dropped => {
                error!(
                    condition = %queue.condition,
                    gpu_id,
                    capacity = self.capacity,
                    "Violation channel full, discarding"
                );
                self.metrics.inc_dropped(queue.condition);
            }
            EnqueueOutcome::AlmostFull => {
                warn!(
                    condition = %queue.condition,
                    gpu_id,
                    capacity = self.capacity,
                    "Violation channel almost full"
                );
                self.metrics.inc_enqueued(queue.condition);
            }
            EnqueueOutcome::Queued => {
                self.metrics.inc_enqueued(queue.condition);
            }
        }
        outcome
    }

    /// Decode a raw native payload and enqueue it.
    ///
    /// Returns `None` when the payload cannot be decoded.
    pub fn dispatch(&self, response: &PolicyCallbackResponse) -> Option<EnqueueOutcome> {
        match decode(response) {
            Some(violation) => Some(self.enqueue(violation)),
            None => {
                debug!(
                    condition = response.condition,
                    "Ignoring undecodable policy callback"
                );
                None
            }
        }
    }

    /// Wait until any condition queue has a violation and take it.
    ///
    /// No ordering is guaranteed across conditions; within one condition
    /// violations come out in arrival order.
    pub async fn next(&self) -> Violation {
        self.next_in(PolicyCondition::ALL.into_iter().collect()).await
    }

    /// Like [`next`](Self::next), restricted to the conditions in `mask`.
    ///
    /// Pends forever for an empty mask.
    pub async fn next_in(&self, mask: ConditionMask) -> Violation {
        let [dbe, pcie, pages, thermal, power, xid] = &self.queues;
        tokio::select! {
            v = dbe.pop(), if mask.contains(dbe.condition) => v,
            v = pcie.pop(), if mask.contains(pcie.condition) => v,
            v = pages.pop(), if mask.contains(pages.condition) => v,
            v = thermal.pop(), if mask.contains(thermal.condition) => v,
            v = power.pop(), if mask.contains(power.condition) => v,
            v = xid.pop(), if mask.contains(xid.condition) => v,
            else => std::future::pending().await,
        }
    }

    /// Take a pending violation for one condition without waiting
    pub fn try_take(&self, condition: PolicyCondition) -> Option<Violation> {
        self.queue(condition).items.lock().pop_front()
    }

    /// Drop everything queued for the conditions in `mask`.
    ///
    /// Returns the number of violations discarded.
    pub fn discard(&self, mask: ConditionMask) -> usize {
        mask.iter()
            .map(|condition| std::iter::from_fn(|| self.try_take(condition)).count())
            .sum()
    }
}

/// Build the callback routed into `broker`.
///
/// The callback always returns 0 and never unwinds into the native thread.
pub fn violation_callback(broker: Arc<ViolationBroker>) -> PolicyCallback {
    Arc::new(move |response: &PolicyCallbackResponse| {
        if catch_unwind(AssertUnwindSafe(|| broker.dispatch(response))).is_err() {
            error!("Panic while handling policy violation callback");
        }
        0
    })
}

/// Second callback required by the native register call; does nothing.
pub fn heartbeat_callback() -> PolicyCallback {
    Arc::new(|_: &PolicyCallbackResponse| 0)
}

/// Decode a raw native payload.
///
/// The condition bits must name exactly one known condition and agree with
/// the payload variant; anything else yields `None`.
pub fn decode(response: &PolicyCallbackResponse) -> Option<Violation> {
    let condition = PolicyCondition::from_bit(response.condition)?;

    let (timestamp_us, data) = match (condition, &response.value) {
        (
            PolicyCondition::DoubleBitEcc,
            RawPolicyValue::Dbe {
                timestamp_us,
                location,
                num_errors,
                gpu_id,
            },
        ) => (
            *timestamp_us,
            ViolationData::DoubleBitEcc(DbeViolation {
                location: DbeLocation::from_raw(*location),
                num_errors: *num_errors,
                gpu_id: *gpu_id,
            }),
        ),
        (
            PolicyCondition::Pcie,
            RawPolicyValue::Pci {
                timestamp_us,
                counter,
                gpu_id,
            },
        ) => (
            *timestamp_us,
            ViolationData::Pcie(PcieViolation {
                replay_counter: *counter,
                gpu_id: *gpu_id,
            }),
        ),
        (
            PolicyCondition::MaxRetiredPages,
            RawPolicyValue::RetiredPages {
                timestamp_us,
                sbe_pages,
                dbe_pages,
                gpu_id,
            },
        ) => (
            *timestamp_us,
            ViolationData::MaxRetiredPages(RetiredPagesViolation {
                sbe_pages: *sbe_pages,
                dbe_pages: *dbe_pages,
                gpu_id: *gpu_id,
            }),
        ),
        (
            PolicyCondition::Thermal,
            RawPolicyValue::Thermal {
                timestamp_us,
                thermal_violation,
                gpu_id,
            },
        ) => (
            *timestamp_us,
            ViolationData::Thermal(ThermalViolation {
                thermal_violation: *thermal_violation,
                gpu_id: *gpu_id,
            }),
        ),
        (
            PolicyCondition::Power,
            RawPolicyValue::Power {
                timestamp_us,
                power_violation,
                gpu_id,
            },
        ) => (
            *timestamp_us,
            ViolationData::Power(PowerViolation {
                power_violation: *power_violation,
                gpu_id: *gpu_id,
            }),
        ),
        (
            PolicyCondition::Xid,
            RawPolicyValue::Xid {
                timestamp_us,
                err_num,
                gpu_id,
            },
        ) => (
            *timestamp_us,
            ViolationData::Xid(XidViolation {
                err_num: *err_num,
                gpu_id: *gpu_id,
            }),
        ),
        _ => return None,
    };

    // native microseconds, truncated to whole seconds
    let timestamp = DateTime::from_timestamp(timestamp_us / 1_000_000, 0)?;

    Some(Violation {
        condition,
        timestamp,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    fn power_response(gpu_id: u32, watts: u32) -> PolicyCallbackResponse {
        PolicyCallbackResponse {
            condition: PolicyCondition::Power.bit(),
            value: RawPolicyValue::Power {
                timestamp_us: 1_700_000_000_123_456,
                power_violation: watts,
                gpu_id,
            },
        }
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CapturedLogs {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn test_queue_capacity() {
        assert_eq!(queue_capacity(0), 3);
        assert_eq!(queue_capacity(4), 15);
    }

    #[test]
    fn test_decode_power() {
        let violation = decode(&power_response(3, 310)).unwrap();
        assert_eq!(violation.condition, PolicyCondition::Power);
        assert_eq!(violation.timestamp.timestamp(), 1_700_000_000);
        assert_eq!(
            violation.data,
            ViolationData::Power(PowerViolation {
                power_violation: 310,
                gpu_id: 3
            })
        );
    }

    #[test]
    fn test_decode_dbe_location() {
        let response = PolicyCallbackResponse {
            condition: PolicyCondition::DoubleBitEcc.bit(),
            value: RawPolicyValue::Dbe {
                timestamp_us: 5_000_000,
                location: 3,
                num_errors: 2,
                gpu_id: 1,
            },
        };
        let violation = decode(&response).unwrap();
        match violation.data {
            ViolationData::DoubleBitEcc(dbe) => {
                assert_eq!(dbe.location, DbeLocation::Register);
                assert_eq!(dbe.num_errors, 2);
            }
            other => panic!("unexpected payload {:?}", other),
        }
    }

    #[test]
    fn test_decode_rejects_unknown_or_mismatched_condition() {
        let mut response = power_response(0, 300);
        response.condition = 0x20;
        assert!(decode(&response).is_none());

        response.condition = PolicyCondition::Power.bit() | PolicyCondition::Thermal.bit();
        assert!(decode(&response).is_none());

        response.condition = PolicyCondition::Thermal.bit();
        assert!(decode(&response).is_none());
    }

    #[test]
    fn test_overflow_warns_then_drops() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();

        let broker = ViolationBroker::new(3);
        let outcomes: Vec<_> = tracing::subscriber::with_default(subscriber, || {
            (0..4)
                .map(|i| broker.dispatch(&power_response(i, 300)).unwrap())
                .collect()
        });

        assert_eq!(
            outcomes,
            vec![
                EnqueueOutcome::Queued,
                EnqueueOutcome::Queued,
                EnqueueOutcome::AlmostFull,
                EnqueueOutcome::Dropped
            ]
        );
        assert_eq!(broker.pending(PolicyCondition::Power), 3);

        let text = logs.text();
        assert_eq!(text.matches("almost full").count(), 1);
        assert_eq!(text.matches("full, discarding").count(), 1);
        assert!(text.find("almost full") < text.find("full, discarding"));

        // the dropped violation (gpu 3) never comes out
        let drained: Vec<_> = std::iter::from_fn(|| broker.try_take(PolicyCondition::Power))
            .map(|v| v.data.gpu_id())
            .collect();
        assert_eq!(drained, vec![0, 1, 2]);
    }

    #[test]
    fn test_conditions_do_not_share_capacity() {
        let broker = ViolationBroker::new(1);
        assert_eq!(
            broker.dispatch(&power_response(0, 300)),
            Some(EnqueueOutcome::AlmostFull)
        );
        let thermal = PolicyCallbackResponse {
            condition: PolicyCondition::Thermal.bit(),
            value: RawPolicyValue::Thermal {
                timestamp_us: 0,
                thermal_violation: 95,
                gpu_id: 0,
            },
        };
        assert_eq!(broker.dispatch(&thermal), Some(EnqueueOutcome::AlmostFull));
        assert_eq!(
            broker.dispatch(&power_response(1, 300)),
            Some(EnqueueOutcome::Dropped)
        );
    }

    #[test]
    fn test_callback_from_foreign_thread() {
        let broker = Arc::new(ViolationBroker::new(6));
        let callback = violation_callback(broker.clone());

        let handles: Vec<_> = (0..4)
            .map(|i| {
                let callback = callback.clone();
                std::thread::spawn(move || callback(&power_response(i, 300)))
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0);
        }
        assert_eq!(broker.pending(PolicyCondition::Power), 4);

        // undecodable payloads are a no-op
        let mut bogus = power_response(0, 1);
        bogus.condition = 0;
        assert_eq!(callback(&bogus), 0);
        assert_eq!(heartbeat_callback()(&bogus), 0);
        assert_eq!(broker.pending(PolicyCondition::Power), 4);
    }

    #[tokio::test]
    async fn test_next_preserves_fifo_within_condition() {
        let broker = Arc::new(ViolationBroker::new(9));
        for i in 0..5 {
            broker.dispatch(&power_response(i, 300));
        }

        for expected in 0..5 {
            let violation = tokio::time::timeout(Duration::from_secs(1), broker.next())
                .await
                .unwrap();
            assert_eq!(violation.data.gpu_id(), expected);
        }
    }

    #[tokio::test]
    async fn test_next_wakes_on_late_enqueue() {
        let broker = Arc::new(ViolationBroker::new(3));
        let waiter = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.next().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        std::thread::spawn({
            let broker = broker.clone();
            move || broker.dispatch(&power_response(2, 400))
        })
        .join()
        .unwrap();

        let violation = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(violation.data.gpu_id(), 2);
    }

    #[tokio::test]
    async fn test_next_in_skips_other_conditions() {
        let broker = ViolationBroker::new(3);
        broker.dispatch(&power_response(1, 300));

        let thermal_only = ConditionMask::from(PolicyCondition::Thermal);
        let waited = tokio::time::timeout(Duration::from_millis(50), broker.next_in(thermal_only)).await;
        assert!(waited.is_err());
        assert_eq!(broker.pending(PolicyCondition::Power), 1);

        let power = broker.next_in(PolicyCondition::Power.into()).await;
        assert_eq!(power.data.gpu_id(), 1);
    }

    #[test]
    fn test_discard_clears_only_masked_queues() {
        let broker = ViolationBroker::new(4);
        for gpu_id in 0..3 {
            broker.dispatch(&power_response(gpu_id, 300));
        }
        broker.enqueue(Violation {
            condition: PolicyCondition::Thermal,
            timestamp: chrono::Utc::now(),
            data: ViolationData::Thermal(ThermalViolation {
                thermal_violation: 101,
                gpu_id: 0,
            }),
        });

        assert_eq!(broker.discard(PolicyCondition::Power.into()), 3);
        assert_eq!(broker.pending(PolicyCondition::Power), 0);
        assert_eq!(broker.pending(PolicyCondition::Thermal), 1);
        assert_eq!(broker.discard(PolicyCondition::Power.into()), 0);
    }
}
