use std::time::SystemTime;

use async_nats::HeaderMap;
use async_nats::jetstream::consumer::{self as nats_consumer, pull};
use async_nats::jetstream::stream as nats_stream;
use chrono::{DateTime, Utc};
use courier_pubsub::consumer::{
    AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, OrderedConsumerConfig, ReplayPolicy,
};
use courier_pubsub::message::{DeliveryInfo, Headers, MESSAGE_ID_HEADER, Message};
use courier_pubsub::stream::{
    DiscardPolicy, RetentionPolicy, StorageType, StreamConfig, StreamInfo, StreamState,
};
use time::OffsetDateTime;

use crate::error::Error;

pub fn to_offset(at: DateTime<Utc>) -> OffsetDateTime {
    OffsetDateTime::from(SystemTime::from(at))
}

pub fn from_offset(at: OffsetDateTime) -> DateTime<Utc> {
    DateTime::<Utc>::from(SystemTime::from(at))
}

pub fn to_nats_stream(config: StreamConfig) -> nats_stream::Config {
    nats_stream::Config {
        name: config.name,
        subjects: config.subjects,
        description: config.description,
        storage: match config.storage {
            StorageType::File => nats_stream::StorageType::File,
            StorageType::Memory => nats_stream::StorageType::Memory,
        },
        num_replicas: config.num_replicas,
        retention: match config.retention {
            RetentionPolicy::Limits => nats_stream::RetentionPolicy::Limits,
            RetentionPolicy::Interest => nats_stream::RetentionPolicy::Interest,
            RetentionPolicy::WorkQueue => nats_stream::RetentionPolicy::WorkQueue,
        },
        max_age: config.max_age,
        max_bytes: config.max_bytes,
        max_messages: config.max_messages,
        max_message_size: config.max_message_size,
        discard: match config.discard {
            DiscardPolicy::Old => nats_stream::DiscardPolicy::Old,
            DiscardPolicy::New => nats_stream::DiscardPolicy::New,
        },
        duplicate_window: config.duplicate_window,
        allow_direct: config.allow_direct,
        ..Default::default()
    }
}

/// The stored config with `subject` appended, or `None` when the stream already lists it.
///
/// Every other field is carried over as stored, including those with no counterpart in
/// [`StreamConfig`].
pub fn with_subject(config: &nats_stream::Config, subject: &str) -> Option<nats_stream::Config> {
    if config.subjects.iter().any(|existing| existing == subject) {
        return None;
    }

    let mut config = config.clone();
    config.subjects.push(subject.to_string());

    Some(config)
}

pub fn from_nats_stream(info: &nats_stream::Info) -> StreamInfo {
    let config = &info.config;

    StreamInfo {
        config: StreamConfig {
            name: config.name.clone(),
            subjects: config.subjects.clone(),
            description: config.description.clone(),
            storage: match config.storage {
                nats_stream::StorageType::File => StorageType::File,
                nats_stream::StorageType::Memory => StorageType::Memory,
            },
            num_replicas: config.num_replicas,
            retention: match config.retention {
                nats_stream::RetentionPolicy::Limits => RetentionPolicy::Limits,
                nats_stream::RetentionPolicy::Interest => RetentionPolicy::Interest,
                nats_stream::RetentionPolicy::WorkQueue => RetentionPolicy::WorkQueue,
            },
            max_age: config.max_age,
            max_bytes: config.max_bytes,
            max_messages: config.max_messages,
            max_message_size: config.max_message_size,
            discard: match config.discard {
                nats_stream::DiscardPolicy::Old => DiscardPolicy::Old,
                nats_stream::DiscardPolicy::New => DiscardPolicy::New,
            },
            duplicate_window: config.duplicate_window,
            allow_direct: config.allow_direct,
        },
        state: StreamState {
            messages: info.state.messages,
            bytes: info.state.bytes,
            first_sequence: info.state.first_sequence,
            last_sequence: info.state.last_sequence,
            consumer_count: info.state.consumer_count,
        },
        created: from_offset(info.created),
    }
}

fn to_nats_deliver_policy(policy: DeliverPolicy) -> nats_consumer::DeliverPolicy {
    match policy {
        DeliverPolicy::All => nats_consumer::DeliverPolicy::All,
        DeliverPolicy::Last => nats_consumer::DeliverPolicy::Last,
        DeliverPolicy::New => nats_consumer::DeliverPolicy::New,
        DeliverPolicy::ByStartSequence(start_sequence) => {
            nats_consumer::DeliverPolicy::ByStartSequence { start_sequence }
        }
        DeliverPolicy::ByStartTime(start) => nats_consumer::DeliverPolicy::ByStartTime {
            start_time: to_offset(start),
        },
    }
}

fn from_nats_deliver_policy(policy: nats_consumer::DeliverPolicy) -> DeliverPolicy {
    match policy {
        nats_consumer::DeliverPolicy::Last | nats_consumer::DeliverPolicy::LastPerSubject => {
            DeliverPolicy::Last
        }
        nats_consumer::DeliverPolicy::New => DeliverPolicy::New,
        nats_consumer::DeliverPolicy::ByStartSequence { start_sequence } => {
            DeliverPolicy::ByStartSequence(start_sequence)
        }
        nats_consumer::DeliverPolicy::ByStartTime { start_time } => {
            DeliverPolicy::ByStartTime(from_offset(start_time))
        }
        nats_consumer::DeliverPolicy::All => DeliverPolicy::All,
    }
}

const fn to_nats_replay_policy(policy: ReplayPolicy) -> nats_consumer::ReplayPolicy {
    match policy {
        ReplayPolicy::Instant => nats_consumer::ReplayPolicy::Instant,
        ReplayPolicy::Original => nats_consumer::ReplayPolicy::Original,
    }
}

pub fn to_pull_config(config: ConsumerConfig) -> pull::Config {
    pull::Config {
        name: config.name,
        durable_name: config.durable_name,
        description: config.description,
        filter_subject: config.filter_subject,
        deliver_policy: to_nats_deliver_policy(config.deliver_policy),
        ack_policy: match config.ack_policy {
            AckPolicy::Explicit => nats_consumer::AckPolicy::Explicit,
            AckPolicy::None => nats_consumer::AckPolicy::None,
            AckPolicy::All => nats_consumer::AckPolicy::All,
        },
        ack_wait: config.ack_wait,
        replay_policy: to_nats_replay_policy(config.replay_policy),
        inactive_threshold: config.inactive_threshold,
        max_deliver: config.max_deliver,
        backoff: config.backoff,
        pause_until: config.pause_until.map(to_offset),
        ..Default::default()
    }
}

pub fn to_ordered_config(config: OrderedConsumerConfig) -> pull::OrderedConfig {
    pull::OrderedConfig {
        filter_subjects: config.filter_subjects,
        deliver_policy: to_nats_deliver_policy(config.deliver_policy),
        replay_policy: to_nats_replay_policy(config.replay_policy),
        ..Default::default()
    }
}

pub fn from_nats_consumer(info: &nats_consumer::Info) -> ConsumerInfo {
    let config = &info.config;

    ConsumerInfo {
        stream_name: info.stream_name.clone(),
        name: info.name.clone(),
        config: ConsumerConfig {
            name: config.name.clone(),
            durable_name: config.durable_name.clone(),
            description: config.description.clone(),
            filter_subject: config.filter_subject.clone(),
            deliver_policy: from_nats_deliver_policy(config.deliver_policy),
            ack_policy: match config.ack_policy {
                nats_consumer::AckPolicy::Explicit => AckPolicy::Explicit,
                nats_consumer::AckPolicy::None => AckPolicy::None,
                nats_consumer::AckPolicy::All => AckPolicy::All,
            },
            ack_wait: config.ack_wait,
            replay_policy: match config.replay_policy {
                nats_consumer::ReplayPolicy::Instant => ReplayPolicy::Instant,
                nats_consumer::ReplayPolicy::Original => ReplayPolicy::Original,
            },
            inactive_threshold: config.inactive_threshold,
            max_deliver: config.max_deliver,
            backoff: config.backoff.clone(),
            pause_until: config.pause_until.map(from_offset),
        },
        created: from_offset(info.created),
        num_pending: info.num_pending,
        num_ack_pending: info.num_ack_pending,
        num_redelivered: info.num_redelivered,
        delivered_stream_sequence: info.delivered.stream_sequence,
        ack_floor_stream_sequence: info.ack_floor.stream_sequence,
        paused: info.paused,
    }
}

/// Headers to send with `message`, including its duplicate-suppression identifier.
pub fn to_header_map(message: &Message) -> HeaderMap {
    let mut map = HeaderMap::new();

    for (key, values) in message.headers.iter() {
        for value in values {
            map.append(key, value.as_str());
        }
    }

    if let Some(id) = &message.message_id {
        map.insert(MESSAGE_ID_HEADER, id.as_str());
    }

    map
}

/// Splits a received message into the envelope and its delivery metadata.
pub fn from_jetstream_message(
    message: &async_nats::jetstream::Message,
) -> Result<(Message, DeliveryInfo), Error> {
    let info = message
        .info()
        .map_err(|e| Error::Conversion(format!("invalid delivery metadata: {e}")))?;

    let mut headers = Headers::new();
    let mut message_id = None;

    if let Some(map) = &message.headers {
        for (key, values) in map.iter() {
            let key = key.to_string();
            for value in values {
                if key == MESSAGE_ID_HEADER {
                    message_id = Some(value.as_str().to_string());
                } else {
                    headers.append(key.clone(), value.as_str());
                }
            }
        }
    }

    let envelope = Message {
        subject: message.subject.to_string(),
        payload: message.payload.clone(),
        headers,
        message_id,
    };

    let delivery = DeliveryInfo {
        stream: info.stream.to_string(),
        consumer: info.consumer.to_string(),
        stream_sequence: info.stream_sequence,
        consumer_sequence: info.consumer_sequence,
        delivered: u64::try_from(info.delivered).unwrap_or_default(),
        pending: info.pending,
        published: from_offset(info.published),
    };

    Ok((envelope, delivery))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timestamps_survive_conversion() {
        let now = Utc::now();

        assert_eq!(from_offset(to_offset(now)), now);
    }

    #[test]
    fn stream_config_maps_fields() {
        let config = StreamConfig {
            num_replicas: 3,
            ..StreamConfig::auto_provisioned("chat", "chat.group.42")
        };

        let nats = to_nats_stream(config);

        assert_eq!(nats.name, "chat");
        assert_eq!(nats.subjects, vec!["chat.group.42".to_string()]);
        assert_eq!(nats.num_replicas, 3);
        assert_eq!(nats.max_age, Duration::from_secs(24 * 60 * 60));
        assert_eq!(nats.max_bytes, 500 * 1024 * 1024);
        assert_eq!(nats.duplicate_window, Duration::from_secs(90));
        assert_eq!(nats.storage, nats_stream::StorageType::File);
        assert_eq!(nats.retention, nats_stream::RetentionPolicy::Limits);
        assert_eq!(nats.discard, nats_stream::DiscardPolicy::Old);
        assert!(nats.allow_direct);
    }

    #[test]
    fn adding_a_subject_keeps_stored_limits() {
        let stored = nats_stream::Config {
            name: "chat".to_string(),
            subjects: vec!["chat.group.41".to_string()],
            max_messages_per_subject: 10,
            max_consumers: 4,
            deny_delete: true,
            deny_purge: true,
            allow_rollup: true,
            num_replicas: 3,
            max_age: Duration::from_secs(60),
            ..Default::default()
        };

        let widened = with_subject(&stored, "chat.group.42").unwrap();

        assert_eq!(
            widened.subjects,
            vec!["chat.group.41".to_string(), "chat.group.42".to_string()]
        );
        assert_eq!(widened.max_messages_per_subject, 10);
        assert_eq!(widened.max_consumers, 4);
        assert!(widened.deny_delete);
        assert!(widened.deny_purge);
        assert!(widened.allow_rollup);
        assert_eq!(widened.num_replicas, 3);
        assert_eq!(widened.max_age, Duration::from_secs(60));
    }

    #[test]
    fn adding_a_listed_subject_is_a_no_op() {
        let stored = nats_stream::Config {
            name: "chat".to_string(),
            subjects: vec!["chat.group.42".to_string()],
            ..Default::default()
        };

        assert!(with_subject(&stored, "chat.group.42").is_none());
    }

    #[test]
    fn consumer_config_maps_fields() {
        let start = Utc::now();
        let config = ConsumerConfig::auto_provisioned("worker", "chat.group.42", start);

        let nats = to_pull_config(config);

        assert_eq!(nats.durable_name.as_deref(), Some("worker"));
        assert_eq!(nats.filter_subject, "chat.group.42");
        assert_eq!(nats.ack_policy, nats_consumer::AckPolicy::Explicit);
        assert_eq!(nats.ack_wait, Duration::from_secs(30));
        assert_eq!(nats.max_deliver, 5);
        assert_eq!(nats.inactive_threshold, Duration::from_secs(600));
        assert_eq!(nats.backoff.len(), 3);
        assert_eq!(
            nats.deliver_policy,
            nats_consumer::DeliverPolicy::ByStartTime {
                start_time: to_offset(start)
            }
        );
    }

    #[test]
    fn message_id_travels_as_header() {
        let mut headers = Headers::new();
        headers.append("trace", "a");
        let message = Message::new("chat.group.42", "hi")
            .with_headers(headers)
            .with_message_id("m-1");

        let map = to_header_map(&message);

        assert_eq!(
            map.get(MESSAGE_ID_HEADER).map(|value| value.as_str()),
            Some("m-1")
        );
        assert_eq!(map.get("trace").map(|value| value.as_str()), Some("a"));
    }
}
