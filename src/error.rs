use thiserror::Error;

/// Error type covering every failure mode of the courier subsystem.
///
/// Message-level terminal outcomes (poison messages, exhausted retries) are
/// resolved into an acknowledgment decision inside the consumer and never
/// propagate through this type; what does propagate is infrastructure
/// failure that a caller or the supervisor must react to.
#[derive(Debug, Error)]
pub enum CourierError {
    /// No candidate broker host could be reached.
    #[error("no broker host reachable, tried: {}", hosts.join(", "))]
    BrokerUnavailable { hosts: Vec<String> },

    /// Error originating from the underlying `lapin` library.
    #[error("broker communication error: {0}")]
    Broker(#[from] lapin::Error),

    /// Message body could not be decoded. Terminal per message.
    #[error("malformed message payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// The downstream delivery action reported failure.
    #[error("delivery action failed: {0}")]
    Delivery(String),

    /// The publisher could not enqueue a new job within its retry budget.
    /// The job never entered the system; the caller decides whether to
    /// resubmit.
    #[error("failed to publish to '{queue}' after {attempts} attempts")]
    PublishFailed { queue: String, attempts: u32 },

    /// Service-registry host lookup failed. Never fatal during host
    /// resolution, only surfaced when a caller queries the registry directly.
    #[error("broker discovery failed: {0}")]
    Discovery(String),

    /// Supervisor misuse, e.g. operating on an unregistered worker name.
    #[error("supervisor error: {0}")]
    Supervisor(String),
}

// Allow converting from a string-like type into a delivery failure, so
// downstream actions can report errors without defining their own type.
impl From<&str> for CourierError {
    fn from(s: &str) -> Self {
        CourierError::Delivery(s.to_string())
    }
}

impl From<String> for CourierError {
    fn from(s: String) -> Self {
        CourierError::Delivery(s)
    }
}
