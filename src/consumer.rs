//! The reliable consumer: the per-message retry / dead-letter state machine
//! and the self-healing run loop around it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicPublishOptions};
use lapin::types::FieldTable;
use lapin::Channel;
use tokio_util::sync::CancellationToken;

use crate::connect::{BrokerConnector, BrokerHandle};
use crate::envelope::MessageEnvelope;
use crate::error::CourierError;
use crate::handler::DeliveryAction;
use crate::supervisor::Worker;
use crate::topology::TopologyConfig;

const DEFAULT_RECONNECT_ATTEMPTS: u32 = 5;
const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Terminal state of one physical delivery.
///
/// A `RetryScheduled` message reappears later as a new delivery of the same
/// logical job with the carried `retry_count`; the other three states are
/// final for the job as well as the delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The downstream action succeeded; the original message is acked.
    Delivered,
    /// A copy with the incremented count was queued for retry; the original
    /// is acked so main never holds two live copies of one logical job.
    RetryScheduled { retry_count: u32 },
    /// Retries exhausted; the message went to the dead-letter queue
    /// unchanged and the original is acked.
    DeadLettered { retry_count: u32 },
    /// Poison message: undecodable. Parked unchanged in the dead-letter
    /// queue and acked off main; never retried.
    Rejected,
}

/// Policy for a failed delivery attempt: schedule another try while the
/// budget allows, dead-letter on the attempt that exhausts it.
pub fn next_attempt_outcome(retry_count: u32, max_retries: u32) -> Outcome {
    if retry_count + 1 < max_retries {
        Outcome::RetryScheduled {
            retry_count: retry_count + 1,
        }
    } else {
        Outcome::DeadLettered { retry_count }
    }
}

/// Queue a settled message is republished into before its original is acked
/// off main, if any.
///
/// `Rejected` goes to the dead-letter queue rather than being nacked: main's
/// dead-letter binding routes rejections into `retry`, so a bare
/// `nack(requeue: false)` would bounce a poison message through the TTL
/// cycle back onto main forever.
fn republish_queue<'a>(outcome: &Outcome, topology: &'a TopologyConfig) -> Option<&'a str> {
    match outcome {
        Outcome::Delivered => None,
        Outcome::RetryScheduled { .. } => Some(&topology.retry_queue),
        Outcome::DeadLettered { .. } | Outcome::Rejected => Some(&topology.dead_letter_queue),
    }
}

/// Consumes the main queue one message at a time, invokes the injected
/// delivery action, and settles each message according to [`Outcome`].
///
/// Broker connection loss is handled inside [`Worker::run`]: bounded
/// reconnect attempts with a fixed cancellable delay, reset after every
/// successful connect. Exhausting the budget returns the error upward so a
/// supervisor can observe the dead worker and restart it.
pub struct ReliableConsumer<A: DeliveryAction> {
    connector: BrokerConnector,
    action: Arc<A>,
    consumer_tag: String,
    reconnect_attempts: u32,
    reconnect_delay: Duration,
}

impl<A: DeliveryAction + 'static> ReliableConsumer<A> {
    pub fn new(connector: BrokerConnector, action: Arc<A>, consumer_tag: impl Into<String>) -> Self {
        Self {
            connector,
            action,
            consumer_tag: consumer_tag.into(),
            reconnect_attempts: DEFAULT_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }

    pub fn with_reconnect(mut self, attempts: u32, delay: Duration) -> Self {
        self.reconnect_attempts = attempts.max(1);
        self.reconnect_delay = delay;
        self
    }

    async fn consume(
        &self,
        handle: &BrokerHandle,
        shutdown: &CancellationToken,
    ) -> Result<(), CourierError> {
        let queue = &self.connector.topology().main_queue;
        let mut consumer = handle
            .channel
            .basic_consume(
                queue,
                &self.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;

        log::info!(
            "consumer '{}' waiting for messages on '{}'",
            self.consumer_tag,
            queue
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    log::info!("consumer '{}' stopping", self.consumer_tag);
                    return Ok(());
                }
                delivery = consumer.next() => {
                    match delivery {
                        Some(Ok(delivery)) => self.handle_delivery(&handle.channel, delivery).await?,
                        Some(Err(e)) => return Err(e.into()),
                        None => {
                            return Err(CourierError::BrokerUnavailable {
                                hosts: vec![handle.host.clone()],
                            });
                        }
                    }
                }
            }
        }
    }

    /// Settles one delivery: republish into the outcome's target queue, then
    /// ack the original. Errors here are channel failures, not message
    /// failures; they bubble up into the reconnect logic.
    async fn handle_delivery(
        &self,
        channel: &Channel,
        delivery: Delivery,
    ) -> Result<(), CourierError> {
        let topology = self.connector.topology();
        let parsed = MessageEnvelope::from_delivery(&delivery.data, &delivery.properties);
        let (outcome, republish) = decide(self.action.as_ref(), parsed, topology.max_retries).await;

        if let Some(queue) = republish_queue(&outcome, topology) {
            match &republish {
                Some(envelope) => self.republish(channel, queue, envelope).await?,
                // Poison message: no envelope exists, park the raw delivery
                // unchanged.
                None => self.republish_raw(channel, queue, &delivery).await?,
            }
        }
        delivery.ack(BasicAckOptions::default()).await?;

        match outcome {
            Outcome::Delivered => {
                log::debug!(
                    "consumer '{}' delivered tag {}",
                    self.consumer_tag,
                    delivery.delivery_tag
                );
            }
            Outcome::Rejected => {
                log::error!(
                    "consumer '{}' parked poison message in '{}', tag {}",
                    self.consumer_tag,
                    topology.dead_letter_queue,
                    delivery.delivery_tag
                );
            }
            Outcome::RetryScheduled { retry_count } => {
                log::info!(
                    "consumer '{}' scheduled retry {}/{} for tag {}",
                    self.consumer_tag,
                    retry_count,
                    topology.max_retries - 1,
                    delivery.delivery_tag
                );
            }
            Outcome::DeadLettered { retry_count } => {
                log::error!(
                    "consumer '{}' dead-lettered tag {} after {} retries",
                    self.consumer_tag,
                    delivery.delivery_tag,
                    retry_count
                );
            }
        }

        Ok(())
    }

    /// Republish precedes the ack of the original: the message leaves main
    /// only once its successor is safely queued.
    async fn republish(
        &self,
        channel: &Channel,
        queue: &str,
        envelope: &MessageEnvelope,
    ) -> Result<(), CourierError> {
        let payload = envelope.to_bytes()?;
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                envelope.properties(),
            )
            .await?
            .await?;
        Ok(())
    }

    /// Republishes an undecodable delivery body and properties verbatim.
    async fn republish_raw(
        &self,
        channel: &Channel,
        queue: &str,
        delivery: &Delivery,
    ) -> Result<(), CourierError> {
        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &delivery.data,
                delivery.properties.clone(),
            )
            .await?
            .await?;
        Ok(())
    }
}

/// Maps a parsed delivery and the action's verdict onto an [`Outcome`],
/// together with the envelope to republish when one is needed. Pure policy:
/// no channel interaction happens here.
async fn decide<A: DeliveryAction>(
    action: &A,
    parsed: Result<MessageEnvelope, CourierError>,
    max_retries: u32,
) -> (Outcome, Option<MessageEnvelope>) {
    let envelope = match parsed {
        Ok(envelope) => envelope,
        Err(e) => {
            log::error!("poison message: {}", e);
            return (Outcome::Rejected, None);
        }
    };

    let retry_count = envelope.retry_count();
    match action.deliver(&envelope).await {
        Ok(()) => (Outcome::Delivered, None),
        Err(e) => {
            log::warn!(
                "delivery action '{}' failed on attempt {}: {}",
                action.name(),
                retry_count + 1,
                e
            );
            let outcome = next_attempt_outcome(retry_count, max_retries);
            let republish = match outcome {
                Outcome::RetryScheduled { .. } => Some(envelope.for_retry()),
                // Dead-lettered messages keep their body and headers as-is.
                Outcome::DeadLettered { .. } => Some(envelope),
                _ => None,
            };
            (outcome, republish)
        }
    }
}

#[async_trait]
impl<A: DeliveryAction + 'static> Worker for ReliableConsumer<A> {
    async fn run(&self, shutdown: CancellationToken) -> Result<(), CourierError> {
        let mut failures = 0u32;

        loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }

            let error = match self.connector.connect().await {
                Ok(handle) => {
                    // A working connection resets the reconnect budget.
                    failures = 0;
                    match self.consume(&handle, &shutdown).await {
                        Ok(()) => return Ok(()),
                        Err(e) => e,
                    }
                }
                Err(e) => e,
            };

            failures += 1;
            log::warn!(
                "consumer '{}' lost the broker ({} of {} attempts): {}",
                self.consumer_tag,
                failures,
                self.reconnect_attempts,
                error
            );
            if failures >= self.reconnect_attempts {
                log::error!(
                    "consumer '{}' giving up after {} reconnect attempts",
                    self.consumer_tag,
                    failures
                );
                return Err(error);
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(()),
                _ = tokio::time::sleep(self.reconnect_delay) => {}
            }
        }
    }
}
