use futures::FutureExt;
use futures::future::{BoxFuture, join_all};
use serde::de::DeserializeOwned;
use std::any::Any;
use std::error::Error as StdError;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::driver::{BatchOutcome, Driver};
use crate::errors::{AdapterError, ConsumerError, OutputError, SerializationError};
use crate::message::{MessageStatus, RawMessage, StatusRecord};
use crate::telemetry::ConsumerMetrics;

/// Turns a raw delivery into a structured message.
pub type MessageDecoder<M> = Arc<dyn Fn(&RawMessage) -> anyhow::Result<M> + Send + Sync>;

/// Validates or transforms a decoded message. A failure means the message is invalid.
pub type MessageAdapter<M, A> = Arc<dyn Fn(M) -> BoxFuture<'static, anyhow::Result<A>> + Send + Sync>;

/// Receives every successfully adapted message of a flush, in arrival order.
pub type BatchOutput<A> = Arc<dyn Fn(Vec<A>) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Reports per-message and per-batch failures. Must not panic; if it does,
/// the panic is caught and logged.
pub type ErrorHandler = Arc<dyn Fn(&ConsumerError, &ErrorContext) + Send + Sync>;

/// The payloads an error refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorContext {
    Message { payload: String },
    Batch { payloads: Vec<String> },
}

/// Parses the payload as UTF-8 text, then as JSON.
pub fn json_decoder<M>() -> MessageDecoder<M>
where
    M: DeserializeOwned + 'static,
{
    Arc::new(|raw: &RawMessage| -> anyhow::Result<M> {
        let text = std::str::from_utf8(&raw.payload).map_err(|e| SerializationError::Utf8 {
            reason: e.to_string(),
        })?;
        let message = serde_json::from_str(text).map_err(|e| SerializationError::Json {
            reason: e.to_string(),
        })?;
        Ok(message)
    })
}

pub fn identity_adapter<M>() -> MessageAdapter<M, M>
where
    M: Send + 'static,
{
    Arc::new(|message: M| async move { Ok(message) }.boxed())
}

/// Logs the error with its kind, source chain and the offending payloads.
pub fn log_error_handler() -> ErrorHandler {
    Arc::new(|error: &ConsumerError, context: &ErrorContext| {
        let chain: Vec<String> = std::iter::successors(error.source(), |e| (*e).source())
            .map(|e| e.to_string())
            .collect();

        error!(
            action = "consumer.error_handler",
            kind = error.kind(),
            error = %error,
            chain = ?chain,
            context = ?context,
            "messages could not be processed because an error occurred"
        );
    })
}

/// Summary of one flush.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlushReport {
    pub outcome: BatchOutcome,
    pub successful: usize,
    pub discarded: usize,
    pub failed: usize,
}

/// Everything a flush needs: the adapter stages, the output and the driver.
pub struct FlushPipeline<M, A> {
    pub(crate) decoder: MessageDecoder<M>,
    pub(crate) adapter: MessageAdapter<M, A>,
    pub(crate) output: BatchOutput<A>,
    pub(crate) error_handler: ErrorHandler,
    pub(crate) driver: Arc<dyn Driver>,
    pub(crate) discard_on_adapter_failure: bool,
    pub(crate) output_timeout: Option<Duration>,
    pub(crate) metrics: Arc<ConsumerMetrics>,
}

impl<M, A> FlushPipeline<M, A>
where
    M: Send + 'static,
    A: Send + 'static,
{
    /// Adapts every message, hands the valid ones to the output and reports
    /// per-message outcomes to the driver. Returns `None` for an empty batch.
    pub async fn flush(&self, batch: Vec<RawMessage>) -> Option<FlushReport> {
        if batch.is_empty() {
            return None;
        }

        let size = batch.len();
        let (records, adapted) = self.adapt_all(batch).await;

        let mut report = FlushReport {
            outcome: BatchOutcome::Succeeded,
            successful: 0,
            discarded: 0,
            failed: 0,
        };
        for record in &records {
            self.metrics.record_status(record.status);
            match record.status {
                MessageStatus::Success => report.successful += 1,
                MessageStatus::Discarded => report.discarded += 1,
                MessageStatus::Failed => report.failed += 1,
            }
        }

        let output_result = if adapted.is_empty() {
            Ok(())
        } else {
            self.output(adapted).await
        };

        match output_result {
            Ok(()) => {
                if let Err(err) = self.driver.notify_batch_success(&records).await {
                    self.acknowledgment_failed("notify_batch_success", &err);
                }
            }
            Err(err) => {
                report.outcome = BatchOutcome::Failed;
                self.metrics.record_output_failure();
                if let Err(ack_err) = self.driver.notify_batch_failure(&records).await {
                    self.acknowledgment_failed("notify_batch_failure", &ack_err);
                }

                let payloads = records
                    .iter()
                    .filter(|r| r.status == MessageStatus::Success)
                    .map(|r| r.message.payload_lossy())
                    .collect();
                self.report(&err, &ErrorContext::Batch { payloads });
            }
        }

        self.metrics.record_flush();
        debug!(
            size,
            successful = report.successful,
            discarded = report.discarded,
            failed = report.failed,
            outcome = ?report.outcome,
            "flushed batch"
        );
        Some(report)
    }

    /// Runs decode + adapt for every message concurrently. Records and adapted
    /// values come back in arrival order.
    async fn adapt_all(&self, batch: Vec<RawMessage>) -> (Vec<StatusRecord>, Vec<A>) {
        let results = join_all(batch.into_iter().map(|raw| self.adapt_one(raw))).await;

        let mut records = Vec::with_capacity(results.len());
        let mut adapted = Vec::new();
        for (record, value) in results {
            records.push(record);
            adapted.extend(value);
        }
        (records, adapted)
    }

    async fn adapt_one(&self, raw: RawMessage) -> (StatusRecord, Option<A>) {
        let decoded = match std::panic::catch_unwind(AssertUnwindSafe(|| (self.decoder)(&raw))) {
            Ok(Ok(message)) => message,
            Ok(Err(err)) => return self.failed(raw, AdapterError::Decode(err)),
            Err(payload) => {
                let err = AdapterError::Panicked {
                    stage: "decoder",
                    reason: panic_reason(payload),
                };
                return self.failed(raw, err);
            }
        };

        let adapter = &self.adapter;
        let adapted = AssertUnwindSafe(async move { adapter(decoded).await })
            .catch_unwind()
            .await;

        match adapted {
            Ok(Ok(value)) => (StatusRecord::new(raw, MessageStatus::Success), Some(value)),
            Ok(Err(err)) if self.discard_on_adapter_failure => {
                info!(
                    action = "consumer.flush_batch",
                    reason = %err,
                    payload = %raw.payload_lossy(),
                    "message invalidated by message adapter"
                );
                (StatusRecord::new(raw, MessageStatus::Discarded), None)
            }
            Ok(Err(err)) => self.failed(raw, AdapterError::Rejected(err)),
            // a panic is a bug in the adapter, never an invalid message
            Err(payload) => {
                let err = AdapterError::Panicked {
                    stage: "adapter",
                    reason: panic_reason(payload),
                };
                self.failed(raw, err)
            }
        }
    }

    fn failed(&self, raw: RawMessage, err: AdapterError) -> (StatusRecord, Option<A>) {
        self.report(&ConsumerError::Adapter(err), &message_context(&raw));
        (StatusRecord::new(raw, MessageStatus::Failed), None)
    }

    async fn output(&self, adapted: Vec<A>) -> Result<(), ConsumerError> {
        let output = &self.output;
        let call = AssertUnwindSafe(async move { output(adapted).await }).catch_unwind();

        let outcome = match self.output_timeout {
            Some(limit) => tokio::time::timeout(limit, call).await.map_err(|_| {
                OutputError::Timeout {
                    after_ms: limit.as_millis() as u64,
                }
            })?,
            None => call.await,
        };

        match outcome {
            Ok(result) => result.map_err(|err| OutputError::Failed(err).into()),
            Err(payload) => Err(OutputError::Panicked {
                reason: panic_reason(payload),
            }
            .into()),
        }
    }

    fn acknowledgment_failed(&self, notification: &'static str, err: &ConsumerError) {
        self.metrics.record_acknowledgment_failure();
        warn!(
            action = "consumer.output_batch",
            notification,
            error = %err,
            "could not notify driver, leaving deliveries to the broker"
        );
    }

    fn report(&self, err: &ConsumerError, context: &ErrorContext) {
        let handler = &self.error_handler;
        if std::panic::catch_unwind(AssertUnwindSafe(|| handler(err, context))).is_err() {
            error!(
                action = "consumer.error_handler",
                error = %err,
                "error handler panicked"
            );
        }
    }
}

fn panic_reason(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|reason| reason.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

fn message_context(raw: &RawMessage) -> ErrorContext {
    ErrorContext::Message {
        payload: raw.payload_lossy(),
    }
}
