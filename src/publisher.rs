//! Publishing new logical jobs onto the main queue.

use std::time::Duration;

use lapin::options::{BasicPublishOptions, ConfirmSelectOptions};
use tokio::sync::Mutex;

use crate::connect::{BrokerConnector, BrokerHandle};
use crate::envelope::MessageEnvelope;
use crate::error::CourierError;

const DEFAULT_PUBLISH_ATTEMPTS: u32 = 3;
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Hands a new logical job to the system exactly once.
///
/// One successful `publish` puts exactly one persistent message on the main
/// queue with a zero retry count. Transient broker errors are retried here
/// with increasing backoff and full host failover; if every attempt fails
/// the caller gets `PublishFailed` and no message entered the system.
pub struct Publisher {
    connector: BrokerConnector,
    handle: Mutex<Option<BrokerHandle>>,
    max_attempts: u32,
    base_backoff: Duration,
}

impl Publisher {
    pub fn new(connector: BrokerConnector) -> Self {
        Self {
            connector,
            handle: Mutex::new(None),
            max_attempts: DEFAULT_PUBLISH_ATTEMPTS,
            base_backoff: DEFAULT_BASE_BACKOFF,
        }
    }

    /// Overrides the publish retry budget and backoff base. The backoff
    /// grows linearly with the attempt number.
    pub fn with_retry(mut self, max_attempts: u32, base_backoff: Duration) -> Self {
        self.max_attempts = max_attempts.max(1);
        self.base_backoff = base_backoff;
        self
    }

    pub async fn publish(&self, envelope: &MessageEnvelope) -> Result<(), CourierError> {
        let payload = envelope.to_bytes()?;
        let queue = self.connector.topology().main_queue.clone();

        // The cached connection is owned exclusively by this publisher;
        // holding the lock across the attempt serializes publishes.
        let mut slot = self.handle.lock().await;

        for attempt in 1..=self.max_attempts {
            match self.try_publish(&mut slot, &queue, &payload, envelope).await {
                Ok(()) => {
                    log::info!(
                        "published job to '{}' (recipient {}, priority {})",
                        queue,
                        envelope.recipient,
                        envelope.priority()
                    );
                    return Ok(());
                }
                Err(e) => {
                    log::warn!(
                        "publish attempt {}/{} to '{}' failed: {}",
                        attempt,
                        self.max_attempts,
                        queue,
                        e
                    );
                    // Drop the channel; the next attempt reconnects with
                    // host failover.
                    *slot = None;
                    if attempt < self.max_attempts {
                        tokio::time::sleep(self.base_backoff * attempt).await;
                    }
                }
            }
        }

        Err(CourierError::PublishFailed {
            queue,
            attempts: self.max_attempts,
        })
    }

    async fn try_publish(
        &self,
        slot: &mut Option<BrokerHandle>,
        queue: &str,
        payload: &[u8],
        envelope: &MessageEnvelope,
    ) -> Result<(), CourierError> {
        let handle = match slot.take() {
            Some(handle) => handle,
            None => {
                let handle = self.connector.connect().await?;
                handle
                    .channel
                    .confirm_select(ConfirmSelectOptions::default())
                    .await?;
                handle
            }
        };

        let confirm = handle
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                envelope.properties(),
            )
            .await?;
        confirm.await?;

        // Keep the working channel for the next publish.
        *slot = Some(handle);
        Ok(())
    }
}
