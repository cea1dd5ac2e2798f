use courier_pubsub::broker::BrokerError;
use thiserror::Error;

/// JetStream API error code for a missing stream.
const STREAM_NOT_FOUND_CODE: &str = "10059";

/// JetStream API error code for a missing consumer.
const CONSUMER_NOT_FOUND_CODE: &str = "10014";

/// Errors returned by the NATS broker.
#[derive(Debug, Error)]
pub enum Error {
    /// Connecting to the server failed.
    #[error("failed to connect to NATS: {0}")]
    Connect(#[from] async_nats::ConnectError),

    /// No stream captures the subject.
    #[error("no stream matches subject `{0}`")]
    NoStreamForSubject(String),

    /// The consumer was deleted while messages were being pulled.
    #[error("consumer `{consumer}` on stream `{stream}` was deleted")]
    ConsumerDeleted {
        /// Stream of the consumer.
        stream: String,
        /// Deleted consumer.
        consumer: String,
    },

    /// A JetStream API request failed.
    #[error("failed to {operation}: {message}")]
    JetStream {
        /// What was being requested.
        operation: &'static str,
        /// Error reported by the client or server.
        message: String,
    },

    /// Acknowledging a delivery failed.
    #[error("failed to {operation} message: {message}")]
    Ack {
        /// Ack kind that failed.
        operation: &'static str,
        /// Error reported by the client.
        message: String,
    },

    /// A value could not be converted between client and manager types.
    #[error("conversion failed: {0}")]
    Conversion(String),
}

impl Error {
    pub(crate) fn jetstream<E>(operation: &'static str) -> impl FnOnce(E) -> Self
    where
        E: std::fmt::Display,
    {
        move |e| Self::JetStream {
            operation,
            message: e.to_string(),
        }
    }

    fn message_contains(&self, code: &str, text: &str) -> bool {
        match self {
            Self::JetStream { message, .. } => message.contains(code) || message.contains(text),
            _ => false,
        }
    }
}

impl BrokerError for Error {
    fn is_stream_not_found(&self) -> bool {
        matches!(self, Self::NoStreamForSubject(_))
            || self.message_contains(STREAM_NOT_FOUND_CODE, "stream not found")
    }

    fn is_consumer_not_found(&self) -> bool {
        matches!(self, Self::ConsumerDeleted { .. })
            || self.message_contains(CONSUMER_NOT_FOUND_CODE, "consumer not found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_not_found_by_error_code() {
        let stream = Error::JetStream {
            operation: "get stream",
            message: "jetstream error: stream not found (code 404, error code 10059)".to_string(),
        };
        assert!(stream.is_stream_not_found());
        assert!(!stream.is_consumer_not_found());

        let consumer = Error::JetStream {
            operation: "get consumer",
            message: "jetstream error: consumer not found (code 404, error code 10014)".to_string(),
        };
        assert!(consumer.is_consumer_not_found());
        assert!(!consumer.is_stream_not_found());

        let other = Error::JetStream {
            operation: "create stream",
            message: "timed out: didn't receive any response".to_string(),
        };
        assert!(!other.is_stream_not_found());
        assert!(!other.is_consumer_not_found());
    }

    #[test]
    fn subject_lookup_miss_is_stream_not_found() {
        assert!(Error::NoStreamForSubject("chat.group.42".to_string()).is_stream_not_found());
    }
}
