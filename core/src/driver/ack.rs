use crate::message::{DeliveryHandle, MessageStatus, StatusRecord};

/// Whether the output stage accepted the batch a set of records belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckAction {
    Ack,
    Reject { requeue: bool },
}

/// One cumulative acknowledgment call, covering every not yet acknowledged
/// delivery up to and including `upto`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckStep {
    pub action: AckAction,
    pub status: MessageStatus,
    pub upto: DeliveryHandle,
    /// Number of records in the run this step settles.
    pub covered: usize,
}

pub fn action_for(outcome: BatchOutcome, status: MessageStatus, requeue_on_failure: bool) -> AckAction {
    match (outcome, status) {
        (BatchOutcome::Succeeded, MessageStatus::Success) => AckAction::Ack,
        (_, MessageStatus::Discarded) => AckAction::Reject { requeue: false },
        (_, MessageStatus::Failed) | (BatchOutcome::Failed, MessageStatus::Success) => {
            AckAction::Reject {
                requeue: requeue_on_failure,
            }
        }
    }
}

/// Collapses consecutive records sharing a status into a single step addressed
/// to the last record of the run.
///
/// Records must be in delivery order. A run never spans two channel
/// generations, since delivery tags from different channels are unrelated.
pub fn plan_acknowledgments(
    records: &[StatusRecord],
    outcome: BatchOutcome,
    requeue_on_failure: bool,
) -> Vec<AckStep> {
    records
        .chunk_by(|a, b| {
            a.status == b.status && a.message.handle.generation == b.message.handle.generation
        })
        .filter_map(|run| {
            let last = run.last()?;
            Some(AckStep {
                action: action_for(outcome, last.status, requeue_on_failure),
                status: last.status,
                upto: last.message.handle,
                covered: run.len(),
            })
        })
        .collect()
}
