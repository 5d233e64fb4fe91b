use futures::FutureExt;
use futures::future::BoxFuture;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::{Accumulator, FlushTrigger};
use crate::config::ConsumerConfig;
use crate::driver::Driver;
use crate::errors::{ConfigError, ConsumerError, Result};
use crate::message::RawMessage;
use crate::pipeline::{
    BatchOutput, ErrorContext, ErrorHandler, FlushPipeline, FlushReport, MessageAdapter,
    MessageDecoder, identity_adapter, json_decoder, log_error_handler,
};
use crate::telemetry::{ConsumerMetrics, MetricsSnapshot};

const MIN_FLUSH_DELAY: Duration = Duration::from_millis(1);

/// Collects everything a [`Consumer`] needs before it can be built.
///
/// `M` is the decoded message type, `A` the adapted type handed to the output.
pub struct ConsumerBuilder<M = serde_json::Value, A = M> {
    config: ConsumerConfig,
    driver: Option<Arc<dyn Driver>>,
    decoder: MessageDecoder<M>,
    adapter: MessageAdapter<M, A>,
    output: Option<BatchOutput<A>>,
    error_handler: ErrorHandler,
    output_dropped: bool,
}

impl<M> ConsumerBuilder<M, M>
where
    M: DeserializeOwned + Send + 'static,
{
    /// Decodes payloads as JSON and passes them through unchanged.
    pub fn new() -> Self {
        Self::with_decoder(json_decoder())
    }
}

impl<M> Default for ConsumerBuilder<M, M>
where
    M: DeserializeOwned + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M> ConsumerBuilder<M, M>
where
    M: Send + 'static,
{
    pub fn with_decoder(decoder: MessageDecoder<M>) -> Self {
        Self {
            config: ConsumerConfig::default(),
            driver: None,
            decoder,
            adapter: identity_adapter(),
            output: None,
            error_handler: log_error_handler(),
            output_dropped: false,
        }
    }

    /// Sets the asynchronous adapter. A failing adapter marks the message
    /// discarded or failed depending on `discard_on_adapter_failure`.
    ///
    /// Must be called before [`ConsumerBuilder::batch_output`], since the
    /// output type changes with the adapter.
    pub fn message_adapter<B, F, Fut>(self, adapter: F) -> ConsumerBuilder<M, B>
    where
        B: Send + 'static,
        F: Fn(M) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<B>> + Send + 'static,
    {
        let adapter: MessageAdapter<M, B> = Arc::new(move |message: M| adapter(message).boxed());
        ConsumerBuilder {
            config: self.config,
            driver: self.driver,
            decoder: self.decoder,
            adapter,
            output: None,
            error_handler: self.error_handler,
            output_dropped: self.output_dropped || self.output.is_some(),
        }
    }
}

impl<M, A> ConsumerBuilder<M, A>
where
    M: Send + 'static,
    A: Send + 'static,
{
    pub fn config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn max_flush_delay(mut self, delay: Duration) -> Self {
        self.config.max_flush_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn discard_on_adapter_failure(mut self, discard: bool) -> Self {
        self.config.discard_on_adapter_failure = discard;
        self
    }

    pub fn output_timeout(mut self, timeout: Duration) -> Self {
        self.config.output_timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn driver(self, driver: impl Driver + 'static) -> Self {
        self.shared_driver(Arc::new(driver))
    }

    pub fn shared_driver(mut self, driver: Arc<dyn Driver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Replaces the payload decoder, keeping the message type.
    pub fn message_to_object<F>(mut self, decoder: F) -> Self
    where
        F: Fn(&RawMessage) -> anyhow::Result<M> + Send + Sync + 'static,
    {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Sets the function receiving each flush's successfully adapted messages.
    pub fn batch_output<F, Fut>(mut self, output: F) -> Self
    where
        F: Fn(Vec<A>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.output = Some(Arc::new(move |batch: Vec<A>| output(batch).boxed()));
        self
    }

    pub fn error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ConsumerError, &ErrorContext) + Send + Sync + 'static,
    {
        self.error_handler = Arc::new(handler);
        self
    }

    /// Validates the configuration. Performs no I/O.
    pub fn build(self) -> std::result::Result<Consumer<M, A>, ConfigError> {
        if self.output_dropped {
            return Err(ConfigError::Invalid {
                message: "message_adapter must be set before batch_output".to_string(),
            });
        }
        let driver = self.driver.ok_or_else(|| ConfigError::MissingField {
            field: "driver".to_string(),
        })?;
        let output = self.output.ok_or_else(|| ConfigError::MissingField {
            field: "asyncBatchOutput".to_string(),
        })?;
        self.config.validate()?;

        let pipeline = FlushPipeline {
            decoder: self.decoder,
            adapter: self.adapter,
            output,
            error_handler: self.error_handler,
            driver,
            discard_on_adapter_failure: self.config.discard_on_adapter_failure,
            output_timeout: self.config.output_timeout(),
            metrics: Arc::new(ConsumerMetrics::default()),
        };

        Ok(Consumer {
            config: self.config,
            pipeline: Arc::new(pipeline),
            running: Mutex::new(None),
        })
    }
}

struct Running {
    ct: CancellationToken,
    task: JoinHandle<()>,
}

/// Batches deliveries from a driver and pushes them through the adapter
/// pipeline and output stage.
///
/// Dropping a running consumer stops accumulating but leaves the driver
/// connected; call [`Consumer::stop`] to release it.
pub struct Consumer<M = serde_json::Value, A = M> {
    config: ConsumerConfig,
    pipeline: Arc<FlushPipeline<M, A>>,
    running: Mutex<Option<Running>>,
}

impl<M, A> Consumer<M, A>
where
    M: Send + 'static,
    A: Send + 'static,
{
    /// Connects the driver and starts accumulating. Fails if the driver cannot
    /// connect; nothing is left running in that case.
    pub async fn start(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ConsumerError::AlreadyRunning);
        }

        let (tx, rx) = mpsc::channel(self.config.batch_size);
        if let Err(err) = self.pipeline.driver.connect(tx).await {
            error!(
                action = "consumer.start",
                error = %err,
                "could not connect driver, consumer not started"
            );
            return Err(err);
        }

        let ct = CancellationToken::new();
        let task = tokio::spawn(run_accumulator(
            self.pipeline.clone(),
            rx,
            self.config.batch_size,
            self.config.max_flush_delay().max(MIN_FLUSH_DELAY),
            ct.clone(),
        ));
        *running = Some(Running { ct, task });

        info!(
            action = "consumer.start",
            batch_size = self.config.batch_size,
            max_flush_delay_ms = self.config.max_flush_delay_ms,
            "consumer started"
        );
        Ok(())
    }

    /// Stops scheduling flushes, drops the unflushed buffer, waits for an
    /// in-flight flush and releases the driver connection.
    ///
    /// Calling it on a stopped consumer is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let Some(Running { ct, task }) = self.running.lock().await.take() else {
            return Ok(());
        };

        ct.cancel();
        if let Err(err) = task.await {
            warn!(action = "consumer.stop", error = %err, "accumulator task ended abnormally");
        }

        self.pipeline.driver.disconnect().await?;
        info!(action = "consumer.stop", "consumer stopped");
        Ok(())
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.pipeline.metrics.snapshot()
    }
}

impl<M, A> Drop for Consumer<M, A> {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut() {
            warn!(
                action = "consumer.drop",
                "consumer dropped while running, call stop() to release the driver connection"
            );
            running.ct.cancel();
        }
    }
}

async fn run_accumulator<M, A>(
    pipeline: Arc<FlushPipeline<M, A>>,
    mut deliveries: mpsc::Receiver<RawMessage>,
    batch_size: usize,
    max_flush_delay: Duration,
    ct: CancellationToken,
) where
    M: Send + 'static,
    A: Send + 'static,
{
    let mut accumulator = Accumulator::new(batch_size);
    let mut in_flight: FuturesUnordered<BoxFuture<'static, Option<FlushReport>>> =
        FuturesUnordered::new();
    let flush_timer = tokio::time::sleep(max_flush_delay);
    tokio::pin!(flush_timer);
    let mut timer_armed = true;
    let mut deliveries_open = true;

    loop {
        let trigger = tokio::select! {
            _ = ct.cancelled() => {
                break;
            }
            delivery = deliveries.recv(), if deliveries_open => {
                match delivery {
                    Some(message) => {
                        pipeline.metrics.record_received();
                        accumulator.push(message).then_some(FlushTrigger::BatchFull)
                    }
                    None => {
                        warn!(
                            action = "consumer.receive",
                            "delivery queue closed, no further messages will arrive"
                        );
                        deliveries_open = false;
                        None
                    }
                }
            }
            () = &mut flush_timer, if timer_armed => {
                Some(FlushTrigger::Timer)
            }
            _ = in_flight.next(), if !in_flight.is_empty() => {
                accumulator.finish_flush();
                flush_timer.as_mut().reset(Instant::now() + max_flush_delay);
                timer_armed = true;
                None
            }
        };

        let Some(trigger) = trigger else {
            continue;
        };
        let Some(batch) = accumulator.begin_flush() else {
            debug!(?trigger, "flush already in progress, request dropped");
            continue;
        };

        timer_armed = false;
        if batch.is_empty() {
            accumulator.finish_flush();
            flush_timer.as_mut().reset(Instant::now() + max_flush_delay);
            timer_armed = true;
            continue;
        }

        debug!(?trigger, size = batch.len(), "flushing batch");
        let pipeline = pipeline.clone();
        in_flight.push(
            async move {
                match AssertUnwindSafe(pipeline.flush(batch)).catch_unwind().await {
                    Ok(report) => report,
                    Err(_) => {
                        error!(
                            action = "consumer.flush_batch",
                            "flush panicked, deliveries are left to the broker"
                        );
                        None
                    }
                }
            }
            .boxed(),
        );
    }

    let dropped = accumulator.discard();
    if dropped > 0 {
        info!(
            action = "consumer.stop",
            dropped, "discarding unflushed messages, the broker will redeliver them"
        );
    }
    while in_flight.next().await.is_some() {}
}
