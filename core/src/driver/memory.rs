use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::driver::ack::{AckStep, BatchOutcome, plan_acknowledgments};
use crate::driver::{DeliverySender, Driver};
use crate::errors::{ConnectionError, ConsumerError, Result};
use crate::message::{DeliveryHandle, MessageStatus, RawMessage, StatusRecord};

/// What a driver was told about one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub outcome: BatchOutcome,
    pub statuses: Vec<MessageStatus>,
    pub payloads: Vec<Vec<u8>>,
    /// The acknowledgment calls a broker driver would issue.
    pub steps: Vec<AckStep>,
}

#[derive(Default)]
struct MemoryState {
    /// Sender handed to `connect`, kept for keep-alive reattachment.
    subscriber: Option<DeliverySender>,
    deliveries: Option<DeliverySender>,
    generation: u64,
    recoveries: usize,
    next_tag: u64,
    connects: usize,
    disconnects: usize,
    failing_connects: u32,
    notifications: Vec<Notification>,
}

/// Driver that keeps everything in memory.
///
/// Tests push payloads with [`MemoryDriver::deliver`] and inspect the
/// notifications the consumer produced.
#[derive(Clone, Default)]
pub struct MemoryDriver {
    state: Arc<Mutex<MemoryState>>,
    requeue_on_failure: bool,
    keep_alive: bool,
}

impl MemoryDriver {
    pub fn new(requeue_on_failure: bool) -> Self {
        Self {
            state: Arc::default(),
            requeue_on_failure,
            keep_alive: false,
        }
    }

    /// With keep-alive, an unexpected close reattaches the original sender on
    /// a fresh channel generation.
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next `count` connection attempts fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.state().failing_connects = count;
    }

    /// Delivers a payload as the broker would, waiting for queue capacity.
    pub async fn deliver(&self, payload: impl Into<Vec<u8>>) -> Result<DeliveryHandle> {
        let (sender, message) = {
            let mut state = self.state();
            let sender = state
                .deliveries
                .clone()
                .ok_or(ConnectionError::NotConnected)?;
            state.next_tag += 1;
            let handle = DeliveryHandle {
                generation: state.generation,
                tag: state.next_tag,
            };
            (sender, RawMessage::new(payload, handle))
        };

        let handle = message.handle;
        sender
            .send(message)
            .await
            .map_err(|_| ConsumerError::Connection(ConnectionError::NotConnected))?;
        Ok(handle)
    }

    /// Simulates the broker closing the channel. Without keep-alive no further
    /// deliveries arrive; with it the stored sender is resubscribed and tags
    /// restart on a new generation.
    pub fn close_unexpectedly(&self) {
        let mut state = self.state();
        state.deliveries = None;
        if !self.keep_alive {
            state.subscriber = None;
            return;
        }

        if let Some(subscriber) = state.subscriber.clone() {
            state.generation += 1;
            state.next_tag = 0;
            state.recoveries += 1;
            state.deliveries = Some(subscriber);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().deliveries.is_some()
    }

    pub fn connects(&self) -> usize {
        self.state().connects
    }

    pub fn disconnects(&self) -> usize {
        self.state().disconnects
    }

    pub fn recoveries(&self) -> usize {
        self.state().recoveries
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state().notifications.clone()
    }

    fn record(&self, records: &[StatusRecord], outcome: BatchOutcome) {
        let mut state = self.state();
        let generation = state.generation;
        let mut steps = plan_acknowledgments(records, outcome, self.requeue_on_failure);
        // deliveries from a closed channel cannot be settled any more
        steps.retain(|step| step.upto.generation == generation);

        state.notifications.push(Notification {
            outcome,
            statuses: records.iter().map(|r| r.status).collect(),
            payloads: records.iter().map(|r| r.message.payload.clone()).collect(),
            steps,
        });
    }
}

#[async_trait]
impl Driver for MemoryDriver {
    async fn connect(&self, deliveries: DeliverySender) -> Result<()> {
        let mut state = self.state();
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(ConnectionError::RetriesExhausted {
                attempts: 1,
                source: "connection refused by memory driver".into(),
            }
            .into());
        }

        state.generation += 1;
        state.next_tag = 0;
        state.subscriber = Some(deliveries.clone());
        state.deliveries = Some(deliveries);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let mut state = self.state();
        state.disconnects += 1;
        state.deliveries = None;
        state.subscriber = None;
        Ok(())
    }

    async fn notify_batch_success(&self, records: &[StatusRecord]) -> Result<()> {
        self.record(records, BatchOutcome::Succeeded);
        Ok(())
    }

    async fn notify_batch_failure(&self, records: &[StatusRecord]) -> Result<()> {
        self.record(records, BatchOutcome::Failed);
        Ok(())
    }
}
