use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::message::MessageStatus;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "consumer_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters shared between the consumer and its flush tasks.
#[derive(Debug, Default)]
pub struct ConsumerMetrics {
    messages_received: AtomicU64,
    successful_messages: AtomicU64,
    discarded_messages: AtomicU64,
    failed_messages: AtomicU64,
    batches_processed: AtomicU64,
    output_failures: AtomicU64,
    acknowledgment_failures: AtomicU64,
    last_flush_millis: AtomicI64,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub messages_received: u64,
    pub successful_messages: u64,
    pub discarded_messages: u64,
    pub failed_messages: u64,
    pub batches_processed: u64,
    pub output_failures: u64,
    pub acknowledgment_failures: u64,
    pub avg_batch_size: f64,
    pub last_flush_at: Option<DateTime<Utc>>,
}

impl ConsumerMetrics {
    pub fn record_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_status(&self, status: MessageStatus) {
        let counter = match status {
            MessageStatus::Success => &self.successful_messages,
            MessageStatus::Discarded => &self.discarded_messages,
            MessageStatus::Failed => &self.failed_messages,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.batches_processed.fetch_add(1, Ordering::Relaxed);
        self.last_flush_millis
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    pub fn record_output_failure(&self) {
        self.output_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_acknowledgment_failure(&self) {
        self.acknowledgment_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let successful_messages = self.successful_messages.load(Ordering::Relaxed);
        let discarded_messages = self.discarded_messages.load(Ordering::Relaxed);
        let failed_messages = self.failed_messages.load(Ordering::Relaxed);
        let batches_processed = self.batches_processed.load(Ordering::Relaxed);
        let processed = successful_messages + discarded_messages + failed_messages;

        let last_flush_millis = self.last_flush_millis.load(Ordering::Relaxed);

        MetricsSnapshot {
            messages_received: self.messages_received.load(Ordering::Relaxed),
            successful_messages,
            discarded_messages,
            failed_messages,
            batches_processed,
            output_failures: self.output_failures.load(Ordering::Relaxed),
            acknowledgment_failures: self.acknowledgment_failures.load(Ordering::Relaxed),
            avg_batch_size: if batches_processed == 0 {
                0.0
            } else {
                processed as f64 / batches_processed as f64
            },
            last_flush_at: (last_flush_millis > 0)
                .then(|| DateTime::from_timestamp_millis(last_flush_millis))
                .flatten(),
        }
    }
}
