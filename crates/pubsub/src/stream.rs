use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};

use crate::broker::{Broker, BrokerError};
use crate::{Error, JetStreamManager};

/// Max age of auto-provisioned streams.
pub const DEFAULT_STREAM_MAX_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Max size of auto-provisioned streams (500 MB).
pub const DEFAULT_STREAM_MAX_BYTES: i64 = 500 * 1024 * 1024;

/// Duplicate window of auto-provisioned streams.
pub const DEFAULT_DUPLICATE_WINDOW: Duration = Duration::from_secs(90);

/// Replica count of auto-provisioned streams.
pub const DEFAULT_STREAM_REPLICAS: usize = 3;

/// Where a stream keeps its messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    /// Durable, on disk.
    #[default]
    File,
    /// In broker memory.
    Memory,
}

/// When a stream drops messages.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionPolicy {
    /// Keep messages until a limit (age, size, count) is hit.
    #[default]
    Limits,
    /// Keep messages while there are consumers interested in them.
    Interest,
    /// Drop each message once it is acknowledged.
    WorkQueue,
}

/// What a full stream discards.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscardPolicy {
    /// Drop the oldest messages.
    #[default]
    Old,
    /// Reject new messages.
    New,
}

/// Configuration of a stream.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StreamConfig {
    /// Unique stream name.
    pub name: String,

    /// Subject patterns captured by the stream.
    pub subjects: Vec<String>,

    /// Optional description.
    pub description: Option<String>,

    /// Storage class.
    pub storage: StorageType,

    /// Number of replicas.
    pub num_replicas: usize,

    /// Retention policy.
    pub retention: RetentionPolicy,

    /// Maximum message age. Zero means unlimited.
    pub max_age: Duration,

    /// Maximum total size in bytes. Negative means unlimited.
    pub max_bytes: i64,

    /// Maximum number of messages. Negative means unlimited.
    pub max_messages: i64,

    /// Maximum size of a single message. Negative means unlimited.
    pub max_message_size: i32,

    /// What to drop once a limit is hit.
    pub discard: DiscardPolicy,

    /// Window in which a repeated message identifier is treated as a duplicate.
    pub duplicate_window: Duration,

    /// Whether messages can be read directly from any replica.
    pub allow_direct: bool,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            subjects: Vec::new(),
            description: None,
            storage: StorageType::File,
            num_replicas: 1,
            retention: RetentionPolicy::Limits,
            max_age: Duration::ZERO,
            max_bytes: -1,
            max_messages: -1,
            max_message_size: -1,
            discard: DiscardPolicy::Old,
            duplicate_window: Duration::ZERO,
            allow_direct: false,
        }
    }
}

impl StreamConfig {
    /// The policy applied to streams created on first use of a subject.
    pub fn auto_provisioned<N, S>(name: N, subject: S) -> Self
    where
        N: Into<String>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            subjects: vec![subject.into()],
            storage: StorageType::File,
            num_replicas: DEFAULT_STREAM_REPLICAS,
            retention: RetentionPolicy::Limits,
            max_age: DEFAULT_STREAM_MAX_AGE,
            max_bytes: DEFAULT_STREAM_MAX_BYTES,
            discard: DiscardPolicy::Old,
            duplicate_window: DEFAULT_DUPLICATE_WINDOW,
            allow_direct: true,
            ..Self::default()
        }
    }

    /// Whether one of the stream's patterns covers `subject`.
    #[must_use]
    pub fn captures(&self, subject: &str) -> bool {
        self.subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }
}

/// Runtime state of a stream.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct StreamState {
    /// Stored messages.
    pub messages: u64,

    /// Stored bytes.
    pub bytes: u64,

    /// Sequence of the oldest stored message.
    pub first_sequence: u64,

    /// Sequence of the newest stored message.
    pub last_sequence: u64,

    /// Number of consumers.
    pub consumer_count: usize,
}

/// A stream as reported by the broker.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct StreamInfo {
    /// Current configuration.
    pub config: StreamConfig,

    /// Current state.
    pub state: StreamState,

    /// When the stream was created.
    pub created: DateTime<Utc>,
}

/// Whether a subject pattern (with `*` and `>` wildcards) covers a concrete subject.
#[must_use]
pub fn subject_matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => {}
            (Some(p), Some(s)) if p == s => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// Creates, resolves and deletes streams.
#[async_trait]
pub trait StreamManager
where
    Self: Clone + Send + Sync + 'static,
{
    /// The error type for stream operations.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Creates the stream or replaces its configuration.
    async fn create_or_update_stream(&self, config: StreamConfig)
    -> Result<StreamInfo, Self::Error>;

    /// Loads a stream by name.
    async fn stream_by_name(&self, name: &str) -> Result<StreamInfo, Self::Error>;

    /// Loads the stream owning `subject`.
    async fn stream_by_subject(&self, subject: &str) -> Result<StreamInfo, Self::Error>;

    /// Deletes a stream.
    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error>;

    /// Returns the stream owning `subject`, provisioning `declared` for it if nothing does.
    ///
    /// An existing `declared` stream is widened with the subject; a missing one is created
    /// with the auto-provisioning policy. Fails if the subject already belongs to a
    /// different stream.
    async fn resolve_stream(&self, subject: &str, declared: &str)
    -> Result<StreamInfo, Self::Error>;
}

#[async_trait]
impl<B> StreamManager for JetStreamManager<B>
where
    B: Broker,
{
    type Error = Error<B::Error>;

    #[instrument(skip(self, config), fields(stream = %config.name))]
    async fn create_or_update_stream(
        &self,
        config: StreamConfig,
    ) -> Result<StreamInfo, Self::Error> {
        self.broker
            .create_or_update_stream(config)
            .await
            .map_err(|e| {
                error!(error = %e, "failed to create or update stream");
                Error::Provisioning {
                    operation: "create or update stream",
                    source: e,
                }
            })
    }

    #[instrument(skip(self))]
    async fn stream_by_name(&self, name: &str) -> Result<StreamInfo, Self::Error> {
        match self.broker.stream_info(name).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_stream_not_found() => {
                warn!(stream = %name, "stream not found");
                Err(Error::StreamNotFound(name.to_string()))
            }
            Err(e) => {
                error!(stream = %name, error = %e, "failed to find stream by name");
                Err(Error::Provisioning {
                    operation: "look up stream",
                    source: e,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn stream_by_subject(&self, subject: &str) -> Result<StreamInfo, Self::Error> {
        match self.broker.stream_name_by_subject(subject).await {
            Ok(name) => self.stream_by_name(&name).await,
            Err(e) if e.is_stream_not_found() => {
                warn!(subject = %subject, "no stream owns subject");
                Err(Error::StreamNotFound(subject.to_string()))
            }
            Err(e) => {
                error!(subject = %subject, error = %e, "failed to find stream by subject");
                Err(Error::Provisioning {
                    operation: "look up stream by subject",
                    source: e,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn delete_stream(&self, name: &str) -> Result<(), Self::Error> {
        match self.broker.delete_stream(name).await {
            Ok(()) => {
                info!(stream = %name, "deleted stream");
                Ok(())
            }
            Err(e) if e.is_stream_not_found() => {
                warn!(stream = %name, "stream to delete not found");
                Err(Error::StreamNotFound(name.to_string()))
            }
            Err(e) => {
                error!(stream = %name, error = %e, "failed to delete stream");
                Err(Error::Provisioning {
                    operation: "delete stream",
                    source: e,
                })
            }
        }
    }

    #[instrument(skip(self))]
    async fn resolve_stream(
        &self,
        subject: &str,
        declared: &str,
    ) -> Result<StreamInfo, Self::Error> {
        if declared.is_empty() {
            error!(subject = %subject, "stream name must not be empty");
            return Err(Error::InvalidStream(
                "stream name must not be empty".to_string(),
            ));
        }

        match self.broker.stream_name_by_subject(subject).await {
            Ok(owner) if owner == declared => self.stream_by_name(&owner).await,
            Ok(owner) => {
                error!(subject = %subject, stream = %declared, owner = %owner, "subject belongs to another stream");
                Err(Error::InvalidStream(format!(
                    "subject `{subject}` belongs to stream `{owner}`, not `{declared}`"
                )))
            }
            Err(e) if e.is_stream_not_found() => self.provision_stream(subject, declared).await,
            Err(e) => {
                error!(subject = %subject, error = %e, "failed to get stream by subject");
                Err(Error::Provisioning {
                    operation: "resolve stream by subject",
                    source: e,
                })
            }
        }
    }
}

impl<B> JetStreamManager<B>
where
    B: Broker,
{
    async fn provision_stream(
        &self,
        subject: &str,
        name: &str,
    ) -> Result<StreamInfo, Error<B::Error>> {
        debug!(stream = %name, subject = %subject, "adding subject to stream");

        match self.broker.add_stream_subject(name, subject).await {
            Ok(info) => Ok(info),
            Err(e) if e.is_stream_not_found() => {
                let config = StreamConfig {
                    num_replicas: self.config.stream_replicas,
                    ..StreamConfig::auto_provisioned(name, subject)
                };

                info!(stream = %name, subject = %subject, "creating stream");

                self.broker.create_stream(config).await.map_err(|e| {
                    error!(stream = %name, subject = %subject, error = %e, "failed to create stream");
                    Error::Provisioning {
                        operation: "create stream",
                        source: e,
                    }
                })
            }
            Err(e) => {
                error!(stream = %name, subject = %subject, error = %e, "failed to update stream");
                Err(Error::Provisioning {
                    operation: "update stream",
                    source: e,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_subjects_match_exactly() {
        assert!(subject_matches("chat.group.42", "chat.group.42"));
        assert!(!subject_matches("chat.group.42", "chat.group.43"));
        assert!(!subject_matches("chat.group", "chat.group.42"));
        assert!(!subject_matches("chat.group.42", "chat.group"));
    }

    #[test]
    fn wildcards_cover_tokens() {
        assert!(subject_matches("chat.*.42", "chat.group.42"));
        assert!(!subject_matches("chat.*", "chat.group.42"));
        assert!(subject_matches("chat.>", "chat.group.42"));
        assert!(!subject_matches("chat.>", "chat"));
    }

    #[test]
    fn auto_provisioned_policy() {
        let config = StreamConfig::auto_provisioned("chat", "chat.group.42");

        assert_eq!(config.subjects, vec!["chat.group.42".to_string()]);
        assert_eq!(config.storage, StorageType::File);
        assert_eq!(config.num_replicas, 3);
        assert_eq!(config.retention, RetentionPolicy::Limits);
        assert_eq!(config.max_age, Duration::from_secs(86_400));
        assert_eq!(config.max_bytes, 524_288_000);
        assert_eq!(config.discard, DiscardPolicy::Old);
        assert_eq!(config.duplicate_window, Duration::from_secs(90));
        assert!(config.allow_direct);
        assert!(config.captures("chat.group.42"));
    }
}
