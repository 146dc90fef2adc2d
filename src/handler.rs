//! The downstream delivery action boundary.

use async_trait::async_trait;

use crate::envelope::MessageEnvelope;
use crate::error::CourierError;

/// The injected capability that actually delivers a job (e.g. hands
/// `body_fields` to an SMTP client). This crate's concern ends at invoking
/// it and branching on the result; rendering and transport live behind it.
///
/// Errors reported here drive the retry / dead-letter policy. They are never
/// treated as infrastructure failures, so a flaky downstream cannot kill the
/// consumer loop.
#[async_trait]
pub trait DeliveryAction: Send + Sync {
    async fn deliver(&self, envelope: &MessageEnvelope) -> Result<(), CourierError>;

    /// A name for the action, used for logging.
    fn name(&self) -> &str;
}
