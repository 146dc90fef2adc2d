//! The message envelope: wire-format body plus broker-level metadata.
//!
//! The JSON body carries only the delivery payload (`recipient`, `subject`,
//! `from`, `body_fields`). Priority travels on the AMQP properties and the
//! retry count in the `retry-count` header, so republishing a retry never
//! rewrites the body.

use lapin::types::{AMQPValue, FieldTable};
use lapin::BasicProperties;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::CourierError;

/// Header carrying the number of completed delivery attempts. Absent means 0.
pub const RETRY_COUNT_HEADER: &str = "retry-count";

pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 10;
const DEFAULT_PRIORITY: u8 = 5;

/// The unit of work on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub recipient: String,
    pub subject: String,
    pub from: String,
    /// Opaque payload handed to the downstream delivery action.
    #[serde(default)]
    pub body_fields: Map<String, Value>,
    #[serde(skip)]
    priority: u8,
    #[serde(skip)]
    retry_count: u32,
}

impl MessageEnvelope {
    /// Creates an envelope for a new logical job: `retry_count` starts at 0.
    pub fn new(
        recipient: impl Into<String>,
        subject: impl Into<String>,
        from: impl Into<String>,
        body_fields: Map<String, Value>,
    ) -> Self {
        Self {
            recipient: recipient.into(),
            subject: subject.into(),
            from: from.into(),
            body_fields,
            priority: DEFAULT_PRIORITY,
            retry_count: 0,
        }
    }

    /// Sets the delivery priority, clamped into `1..=10`.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority.clamp(MIN_PRIORITY, MAX_PRIORITY);
        self
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    /// Builds the envelope republished for the next delivery attempt:
    /// identical body and priority, `retry_count` incremented by one.
    pub fn for_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count = self.retry_count + 1;
        next
    }

    /// Reconstructs an envelope from a broker delivery.
    ///
    /// A body that fails to decode is a poison message; the error is
    /// surfaced so the consumer can reject without requeue.
    pub fn from_delivery(
        data: &[u8],
        properties: &BasicProperties,
    ) -> Result<Self, CourierError> {
        let mut envelope: MessageEnvelope = serde_json::from_slice(data)?;
        envelope.retry_count = retry_count_from_headers(properties);
        envelope.priority = properties
            .priority()
            .as_ref()
            .copied()
            .unwrap_or(DEFAULT_PRIORITY)
            .clamp(MIN_PRIORITY, MAX_PRIORITY);
        Ok(envelope)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// AMQP headers for this envelope.
    pub fn headers(&self) -> FieldTable {
        let mut headers = FieldTable::default();
        headers.insert(
            RETRY_COUNT_HEADER.into(),
            AMQPValue::LongLongInt(self.retry_count as i64),
        );
        headers
    }

    /// Full publish properties: persistent delivery, priority, headers.
    pub fn properties(&self) -> BasicProperties {
        BasicProperties::default()
            .with_delivery_mode(2)
            .with_priority(self.priority)
            .with_content_type("application/json".into())
            .with_headers(self.headers())
    }
}

/// Reads the retry count from message headers, tolerating the integer
/// encodings different publishers use. Absent or non-integer means 0.
pub fn retry_count_from_headers(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers().as_ref() else {
        return 0;
    };

    match headers.inner().get(RETRY_COUNT_HEADER) {
        Some(AMQPValue::LongLongInt(count)) => *count as u32,
        Some(AMQPValue::LongInt(count)) => *count as u32,
        Some(AMQPValue::ShortInt(count)) => *count as u32,
        Some(AMQPValue::ShortShortInt(count)) => *count as u32,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MessageEnvelope {
        let mut fields = Map::new();
        fields.insert("title".to_string(), json!("Ad approved"));
        fields.insert("message".to_string(), json!("Your ad is live."));
        MessageEnvelope::new("user@example.com", "Ad approved", "noreply@example.com", fields)
    }

    #[test]
    fn priority_is_clamped_into_range() {
        assert_eq!(sample().with_priority(0).priority(), 1);
        assert_eq!(sample().with_priority(7).priority(), 7);
        assert_eq!(sample().with_priority(200).priority(), 10);
    }

    #[test]
    fn for_retry_increments_count_and_keeps_body() {
        let original = sample().with_priority(9);
        let retry = original.for_retry();
        assert_eq!(retry.retry_count(), 1);
        assert_eq!(retry.for_retry().retry_count(), 2);
        assert_eq!(retry.priority(), 9);
        assert_eq!(retry.recipient, original.recipient);
        assert_eq!(retry.body_fields, original.body_fields);
    }

    #[test]
    fn body_excludes_priority_and_retry_count() {
        let bytes = sample().with_priority(3).for_retry().to_bytes().unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        let object = value.as_object().unwrap();
        assert!(object.contains_key("recipient"));
        assert!(object.contains_key("body_fields"));
        assert!(!object.contains_key("priority"));
        assert!(!object.contains_key("retry_count"));
    }

    #[test]
    fn from_delivery_reads_header_and_priority() {
        let envelope = sample().with_priority(8).for_retry();
        let bytes = envelope.to_bytes().unwrap();
        let restored = MessageEnvelope::from_delivery(&bytes, &envelope.properties()).unwrap();
        assert_eq!(restored.retry_count(), 1);
        assert_eq!(restored.priority(), 8);
        assert_eq!(restored.subject, "Ad approved");
    }

    #[test]
    fn missing_retry_header_defaults_to_zero() {
        assert_eq!(retry_count_from_headers(&BasicProperties::default()), 0);

        let mut headers = FieldTable::default();
        headers.insert("unrelated".into(), AMQPValue::LongString("x".into()));
        let props = BasicProperties::default().with_headers(headers);
        assert_eq!(retry_count_from_headers(&props), 0);
    }

    #[test]
    fn retry_header_accepts_short_integer_encodings() {
        let mut headers = FieldTable::default();
        headers.insert(RETRY_COUNT_HEADER.into(), AMQPValue::ShortInt(2));
        let props = BasicProperties::default().with_headers(headers);
        assert_eq!(retry_count_from_headers(&props), 2);
    }

    #[test]
    fn malformed_body_is_an_error() {
        let result = MessageEnvelope::from_delivery(b"not json", &BasicProperties::default());
        assert!(matches!(result, Err(CourierError::MalformedPayload(_))));
    }
}
