pub mod ack;
pub mod memory;
pub mod rabbit;
mod retry;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::message::{RawMessage, StatusRecord};

pub use ack::{AckAction, AckStep, BatchOutcome, plan_acknowledgments};
pub use memory::MemoryDriver;
pub use rabbit::RabbitDriver;

/// Producer side of the delivery queue feeding the consumer's accumulator.
pub type DeliverySender = mpsc::Sender<RawMessage>;

/// The contract for any broker integration.
///
/// A driver owns the broker connection: it pushes deliveries into the queue
/// handed to `connect` and turns the ordered status records of each flush into
/// acknowledgment calls.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Opens the broker connection and starts pushing deliveries into `deliveries`.
    ///
    /// The sender is kept so the driver can resubscribe after an unexpected close.
    async fn connect(&self, deliveries: DeliverySender) -> Result<()>;

    /// Releases the connection. Must not fail if the resources are already gone.
    async fn disconnect(&self) -> Result<()>;

    /// Called after the output stage succeeded for the flush that produced `records`.
    async fn notify_batch_success(&self, records: &[StatusRecord]) -> Result<()>;

    /// Called after the output stage failed for the flush that produced `records`.
    async fn notify_batch_failure(&self, records: &[StatusRecord]) -> Result<()>;
}
