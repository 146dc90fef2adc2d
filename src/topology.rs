//! The three-queue retry topology: `main`, `retry`, `dead_letter`.
//!
//! `main` and `retry` form a fixed cycle through the broker's dead-letter
//! routing: a message dead-lettered off `main` lands on `retry`, and `retry`'s
//! per-message TTL bounces it back to `main` when the delay elapses. `retry`
//! is never consumed directly, and nothing routes into `dead_letter`
//! automatically; only the consumer's explicit decision puts a message there.
//! The TTL is the sole source of retry delay; no application timers exist.

use std::time::Duration;

use lapin::options::QueueDeclareOptions;
use lapin::types::{AMQPValue, FieldTable};
use lapin::Channel;

use crate::envelope::MAX_PRIORITY;
use crate::error::CourierError;

const DEFAULT_RETRY_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Names and parameters of the queue topology.
#[derive(Debug, Clone)]
pub struct TopologyConfig {
    pub main_queue: String,
    pub retry_queue: String,
    pub dead_letter_queue: String,
    /// Per-message TTL on the retry queue; this is the retry delay.
    pub retry_ttl: Duration,
    pub max_retries: u32,
    /// Fixed at 1: one unacknowledged message per channel, so retry policy
    /// is applied to one message at a time.
    pub prefetch_count: u16,
}

impl TopologyConfig {
    /// Creates a topology named after the main queue.
    /// `{main}` / `{main}_retry` / `{main}_dead_letter`.
    pub fn new(main_queue: impl Into<String>) -> Self {
        let main_queue = main_queue.into();
        Self {
            retry_queue: format!("{}_retry", main_queue),
            dead_letter_queue: format!("{}_dead_letter", main_queue),
            main_queue,
            retry_ttl: DEFAULT_RETRY_TTL,
            max_retries: DEFAULT_MAX_RETRIES,
            prefetch_count: 1,
        }
    }

    pub fn with_retry_ttl(mut self, ttl: Duration) -> Self {
        self.retry_ttl = ttl;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Declares all three queues, durable and idempotent. Re-declaring with
    /// identical arguments is a no-op; a mismatch is a channel error the
    /// broker raises and this surfaces unchanged.
    pub async fn declare(&self, channel: &Channel) -> Result<(), CourierError> {
        let durable = QueueDeclareOptions {
            durable: true,
            ..Default::default()
        };

        channel
            .queue_declare(&self.main_queue, durable, main_queue_args(self))
            .await?;
        channel
            .queue_declare(&self.retry_queue, durable, retry_queue_args(self))
            .await?;
        channel
            .queue_declare(&self.dead_letter_queue, durable, FieldTable::default())
            .await?;

        log::info!(
            "queue topology declared: {} -> {} -> {}, dead letter {}",
            self.main_queue,
            self.retry_queue,
            self.main_queue,
            self.dead_letter_queue
        );
        Ok(())
    }
}

/// Arguments for the main queue: failures dead-letter to `retry` via the
/// default exchange, and the queue honors per-message priorities.
pub fn main_queue_args(config: &TopologyConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString("".into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(config.retry_queue.as_str().into()),
    );
    args.insert(
        "x-max-priority".into(),
        AMQPValue::LongInt(MAX_PRIORITY as i32),
    );
    args
}

/// Arguments for the retry queue: messages expire after `retry_ttl` and
/// dead-letter back to `main`.
pub fn retry_queue_args(config: &TopologyConfig) -> FieldTable {
    let mut args = FieldTable::default();
    args.insert(
        "x-dead-letter-exchange".into(),
        AMQPValue::LongString("".into()),
    );
    args.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(config.main_queue.as_str().into()),
    );
    args.insert(
        "x-message-ttl".into(),
        AMQPValue::LongLongInt(config.retry_ttl.as_millis() as i64),
    );
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn routing_key(args: &FieldTable) -> Option<String> {
        match args.inner().get("x-dead-letter-routing-key") {
            Some(AMQPValue::LongString(s)) => Some(s.to_string()),
            _ => None,
        }
    }

    #[test]
    fn names_derive_from_main_queue() {
        let config = TopologyConfig::new("outbound_mail");
        assert_eq!(config.main_queue, "outbound_mail");
        assert_eq!(config.retry_queue, "outbound_mail_retry");
        assert_eq!(config.dead_letter_queue, "outbound_mail_dead_letter");
        assert_eq!(config.prefetch_count, 1);
        assert_eq!(config.max_retries, DEFAULT_MAX_RETRIES);
    }

    #[test]
    fn main_and_retry_form_a_cycle() {
        let config = TopologyConfig::new("outbound_mail");
        let main_args = main_queue_args(&config);
        let retry_args = retry_queue_args(&config);

        assert_eq!(routing_key(&main_args).unwrap(), config.retry_queue);
        assert_eq!(routing_key(&retry_args).unwrap(), config.main_queue);
    }

    #[test]
    fn retry_queue_carries_ttl_in_millis() {
        let config =
            TopologyConfig::new("outbound_mail").with_retry_ttl(Duration::from_secs(45));
        let args = retry_queue_args(&config);
        assert_eq!(
            args.inner().get("x-message-ttl"),
            Some(&AMQPValue::LongLongInt(45_000))
        );
    }

    #[test]
    fn main_queue_honors_priorities() {
        let config = TopologyConfig::new("outbound_mail");
        let args = main_queue_args(&config);
        assert_eq!(
            args.inner().get("x-max-priority"),
            Some(&AMQPValue::LongInt(10))
        );
    }
}
