use courier_pubsub::broker::BrokerError;
use thiserror::Error;

/// Errors returned by the in-memory broker.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// No stream with the given name exists.
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    /// No stream captures the subject.
    #[error("no stream matches subject `{0}`")]
    NoStreamForSubject(String),

    /// No consumer with the given name exists on the stream.
    #[error("consumer `{consumer}` not found on stream `{stream}`")]
    ConsumerNotFound {
        /// Stream that was searched.
        stream: String,
        /// Consumer that was not found.
        consumer: String,
    },

    /// A stream with the same name but a different configuration exists.
    #[error("stream name already in use with a different configuration: {0}")]
    StreamNameInUse(String),

    /// A subject is already captured by another stream.
    #[error("subject `{subject}` overlaps with stream `{stream}`")]
    SubjectOverlap {
        /// Overlapping subject.
        subject: String,
        /// Stream already capturing it.
        stream: String,
    },

    /// The configuration was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The publish carried an expected stream that does not own the subject.
    #[error("expected stream `{expected}` but subject belongs to `{actual}`")]
    WrongExpectedStream {
        /// Stream named by the publisher.
        expected: String,
        /// Stream owning the subject.
        actual: String,
    },

    /// The payload exceeds the stream's message size limit.
    #[error("message size exceeds maximum allowed")]
    MessageTooLarge,

    /// The stream is full and configured to reject new messages.
    #[error("stream `{0}` is full")]
    StreamFull(String),
}

impl BrokerError for Error {
    fn is_stream_not_found(&self) -> bool {
        matches!(self, Self::StreamNotFound(_) | Self::NoStreamForSubject(_))
    }

    fn is_consumer_not_found(&self) -> bool {
        matches!(self, Self::ConsumerNotFound { .. })
    }
}
