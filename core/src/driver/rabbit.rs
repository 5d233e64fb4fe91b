use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::RabbitConfig;
use crate::driver::ack::{AckAction, BatchOutcome, plan_acknowledgments};
use crate::driver::retry::retry_with_delay;
use crate::driver::{DeliverySender, Driver};
use crate::errors::{AcknowledgmentError, ConfigError, ConnectionError, Result};
use crate::message::{DeliveryHandle, RawMessage, StatusRecord};

const DEFAULT_CONSUMER_TAG: &str = "batch_consumer";
const REPLY_SUCCESS: u16 = 200;

/// RabbitMQ driver built on `lapin`.
///
/// Cloning is cheap and every clone shares the same connection.
#[derive(Clone)]
pub struct RabbitDriver {
    inner: Arc<Inner>,
}

struct Inner {
    config: RabbitConfig,
    state: Mutex<ChannelState>,
    /// Serialises connect, disconnect and keep-alive recovery.
    lifecycle: Mutex<()>,
    /// Bumped by every connect and disconnect.
    sessions: AtomicU64,
    generations: AtomicU64,
}

#[derive(Default)]
struct ChannelState {
    connection: Option<Connection>,
    channel: Option<Channel>,
    generation: u64,
}

impl RabbitDriver {
    pub fn new(config: RabbitConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(ChannelState::default()),
                lifecycle: Mutex::new(()),
                sessions: AtomicU64::new(0),
                generations: AtomicU64::new(0),
            }),
        })
    }

    pub fn config(&self) -> &RabbitConfig {
        &self.inner.config
    }

    pub async fn is_connected(&self) -> bool {
        let state = self.inner.state.lock().await;
        state
            .channel
            .as_ref()
            .is_some_and(|channel| channel.status().connected())
    }

    async fn acknowledge(&self, records: &[StatusRecord], outcome: BatchOutcome) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }

        let (channel, generation) = {
            let state = self.inner.state.lock().await;
            match state.channel.as_ref() {
                Some(channel) => (channel.clone(), state.generation),
                None => return Err(AcknowledgmentError::ChannelClosed.into()),
            }
        };

        let steps = plan_acknowledgments(records, outcome, self.inner.config.requeue_on_failure);
        for step in steps {
            let DeliveryHandle { generation: step_generation, tag } = step.upto;
            if step_generation != generation {
                // The old channel is gone and the broker has requeued these deliveries.
                debug!(
                    delivery_tag = tag,
                    covered = step.covered,
                    "skipping acknowledgment for delivery from a previous channel"
                );
                continue;
            }

            match step.action {
                AckAction::Ack => channel
                    .basic_ack(tag, BasicAckOptions { multiple: true })
                    .await
                    .map_err(|e| AcknowledgmentError::Ack {
                        delivery_tag: tag,
                        reason: e.to_string(),
                    })?,
                AckAction::Reject { requeue } => channel
                    .basic_nack(
                        tag,
                        BasicNackOptions {
                            multiple: true,
                            requeue,
                        },
                    )
                    .await
                    .map_err(|e| AcknowledgmentError::Reject {
                        delivery_tag: tag,
                        reason: e.to_string(),
                    })?,
            }

            debug!(
                delivery_tag = tag,
                status = %step.status,
                covered = step.covered,
                action = ?step.action,
                "settled run of deliveries"
            );
        }

        Ok(())
    }
}

impl Inner {
    fn is_session(&self, session: u64) -> bool {
        self.sessions.load(Ordering::SeqCst) == session
    }

    /// Opens a channel with retries and starts forwarding deliveries.
    ///
    /// Boxed because the delivery pump it spawns may call back into it.
    /// Callers hold the lifecycle lock.
    fn subscribe(
        self: Arc<Self>,
        deliveries: DeliverySender,
        session: u64,
    ) -> BoxFuture<'static, Result<()>> {
        Box::pin(async move {
            let config = &self.config;
            let (connection, channel, consumer) = retry_with_delay(
                "rabbit-driver.open_channel",
                config.max_connection_retries,
                config.retry_delay(),
                |_| self.open_channel(),
            )
            .await
            .map_err(|e| ConnectionError::RetriesExhausted {
                attempts: config.max_connection_retries,
                source: Box::new(e),
            })?;

            let generation = self.generations.fetch_add(1, Ordering::SeqCst) + 1;
            {
                let mut state = self.state.lock().await;
                state.connection = Some(connection);
                state.channel = Some(channel);
                state.generation = generation;
            }

            info!(
                queue = %config.queue,
                prefetch = config.prefetch_count(),
                generation,
                "Subscribed to RabbitMQ queue"
            );

            tokio::spawn(pump_deliveries(
                self.clone(),
                consumer,
                deliveries,
                session,
                generation,
            ));
            Ok(())
        })
    }

    async fn open_channel(
        &self,
    ) -> std::result::Result<(Connection, Channel, lapin::Consumer), lapin::Error> {
        let connection = Connection::connect(&self.config.uri, ConnectionProperties::default()).await?;

        let prepared = async {
            let channel = connection.create_channel().await?;
            channel
                .basic_qos(self.config.prefetch_count(), BasicQosOptions::default())
                .await?;
            // Passive declare only checks that the queue exists.
            channel
                .queue_declare(
                    &self.config.queue,
                    QueueDeclareOptions {
                        passive: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await?;
            let consumer_tag = self
                .config
                .consumer_tag
                .as_deref()
                .unwrap_or(DEFAULT_CONSUMER_TAG);
            let consumer = channel
                .basic_consume(
                    &self.config.queue,
                    consumer_tag,
                    BasicConsumeOptions::default(),
                    FieldTable::default(),
                )
                .await?;
            Ok::<_, lapin::Error>((channel, consumer))
        }
        .await;

        match prepared {
            Ok((channel, consumer)) => Ok((connection, channel, consumer)),
            Err(err) => {
                let _ = connection.close(REPLY_SUCCESS, "channel setup failed").await;
                Err(err)
            }
        }
    }

    /// Closes channel and connection, logging instead of failing.
    ///
    /// Clears the stored generation so pumps of the released channel no
    /// longer count as current.
    async fn release(&self) {
        let (channel, connection) = {
            let mut state = self.state.lock().await;
            state.generation = 0;
            (state.channel.take(), state.connection.take())
        };

        if let Some(channel) = channel {
            if let Err(err) = channel.close(REPLY_SUCCESS, "consumer disconnect").await {
                warn!(
                    action = "rabbit-driver.disconnect",
                    error = %err,
                    "could not close channel"
                );
            }
        }

        if let Some(connection) = connection {
            if let Err(err) = connection.close(REPLY_SUCCESS, "consumer disconnect").await {
                warn!(
                    action = "rabbit-driver.disconnect",
                    error = %err,
                    "could not close connection"
                );
            }
        }
    }

    async fn is_current(&self, generation: u64) -> bool {
        self.state.lock().await.generation == generation
    }

    /// Reconnects after an unexpected close, unless the session that owned the
    /// closed channel has ended in the meantime.
    async fn recover(self: Arc<Self>, deliveries: DeliverySender, session: u64) {
        tokio::time::sleep(self.config.retry_delay()).await;

        let _lifecycle = self.lifecycle.lock().await;
        if !self.is_session(session) {
            debug!(
                action = "rabbit-driver.recover",
                session, "session ended while waiting to reconnect, not recovering"
            );
            return;
        }

        self.release().await;
        if let Err(err) = self.clone().subscribe(deliveries, session).await {
            error!(
                action = "rabbit-driver.recover",
                queue = %self.config.queue,
                error = %err,
                "failed to re-establish channel, no further messages will be received"
            );
        }
    }
}

async fn pump_deliveries(
    inner: Arc<Inner>,
    mut consumer: lapin::Consumer,
    deliveries: DeliverySender,
    session: u64,
    generation: u64,
) {
    while let Some(delivery) = consumer.next().await {
        match delivery {
            Ok(mut delivery) => {
                let message = RawMessage {
                    payload: std::mem::take(&mut delivery.data),
                    redelivered: delivery.redelivered,
                    handle: DeliveryHandle {
                        generation,
                        tag: delivery.delivery_tag,
                    },
                };

                if deliveries.send(message).await.is_err() {
                    debug!("delivery receiver dropped, stopping consumer pump");
                    return;
                }
            }
            Err(err) => {
                warn!(
                    action = "rabbit-driver.consume",
                    error = %err,
                    "error while consuming deliveries"
                );
                break;
            }
        }
    }

    if !inner.is_session(session) || !inner.is_current(generation).await {
        return;
    }

    error!(
        action = "rabbit-driver.channel",
        queue = %inner.config.queue,
        "channel closed unexpectedly"
    );

    if inner.config.keep_alive {
        inner.recover(deliveries, session).await;
    }
}

#[async_trait]
impl Driver for RabbitDriver {
    async fn connect(&self, deliveries: DeliverySender) -> Result<()> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        let session = self.inner.sessions.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.clone().subscribe(deliveries, session).await
    }

    async fn disconnect(&self) -> Result<()> {
        // Ends the session first so a pending recovery gives up.
        self.inner.sessions.fetch_add(1, Ordering::SeqCst);
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.inner.release().await;
        info!(queue = %self.inner.config.queue, "Disconnected from RabbitMQ");
        Ok(())
    }

    async fn notify_batch_success(&self, records: &[StatusRecord]) -> Result<()> {
        self.acknowledge(records, BatchOutcome::Succeeded).await
    }

    async fn notify_batch_failure(&self, records: &[StatusRecord]) -> Result<()> {
        self.acknowledge(records, BatchOutcome::Failed).await
    }
}
