use std::{
    collections::HashMap,
    error::Error,
    fmt::{self, Display},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// A message that has been delivered from a broker stream.
///
/// The message is owned by the consumer group's pending entries list
/// from delivery until it is acknowledged.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamMessage {
    /// The broker-assigned identifier of the message, monotonic
    /// in stream order.
    pub id: String,
    /// The field map carried by the stream entry.
    pub fields: HashMap<String, String>,
}

impl StreamMessage {
    pub fn new(id: impl Into<String>, fields: HashMap<String, String>) -> Self {
        StreamMessage {
            id: id.into(),
            fields,
        }
    }

    /// Builds a message from a list of field pairs, which reads better
    /// in tests and publish paths than assembling a map by hand.
    pub fn from_pairs(id: impl Into<String>, pairs: &[(&str, &str)]) -> Self {
        StreamMessage {
            id: id.into(),
            fields: pairs
                .iter()
                .map(|(name, value)| (name.to_string(), value.to_string()))
                .collect(),
        }
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Provides a trait for the domain side of the consumption pipeline.
/// A handler receives a delivered message and reports how the message
/// should be resolved through its return value.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, stream: &str, message: &StreamMessage) -> Result<(), HandlerError>;
}

/// Provides a custom error type to be used for failures
/// within message handlers.
///
/// The two variants map to the two non-success resolutions a delivered
/// message can have: a permanent failure that should be dead-lettered
/// and acknowledged, and a transient backpressure rejection that must
/// leave the message in the pending entries list for redelivery.
#[derive(Debug)]
pub enum HandlerError {
    Backpressure,
    Failure(Box<dyn Error + Send + Sync + 'static>),
}

impl HandlerError {
    /// Wraps a plain message as a permanent handler failure.
    pub fn failure(message: impl Into<String>) -> Self {
        HandlerError::Failure(Box::new(SimpleHandlerFailure {
            message: message.into(),
        }))
    }
}

impl Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HandlerError::Backpressure => {
                write!(f, "message handler rejected the message due to backpressure")
            }
            HandlerError::Failure(handler_error) => {
                write!(f, "message handler failed: {handler_error}")
            }
        }
    }
}

/// The record written to the dead letter stream when a message cannot
/// be processed normally. Both the coordinator and the execution
/// engine write this shape so replay tooling reads one format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DlqRecord {
    pub original_message_id: String,
    pub original_stream: String,
    /// The original entry's field map, serialized.
    pub original_data: String,
    pub error: String,
    /// The first 500 characters of the error chain, for audit.
    pub error_stack: String,
    pub timestamp: u64,
    pub service: String,
    pub instance_id: String,
}

#[derive(Debug)]
struct SimpleHandlerFailure {
    message: String,
}

impl Display for SimpleHandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Error for SimpleHandlerFailure {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_builds_message_from_pairs() {
        let message = StreamMessage::from_pairs("5-0", &[("type", "stream-init")]);

        assert_eq!(message.id, "5-0");
        assert_eq!(message.field("type"), Some("stream-init"));
        assert_eq!(message.field("missing"), None);
    }

    #[test]
    fn test_handler_error_display() {
        let failure = HandlerError::failure("parse error");
        assert_eq!(
            failure.to_string(),
            "message handler failed: parse error".to_string()
        );

        assert_eq!(
            HandlerError::Backpressure.to_string(),
            "message handler rejected the message due to backpressure".to_string()
        );
    }
}
