use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_pubsub::consumer::{AckPolicy, ConsumerConfig, ConsumerInfo, DeliverPolicy, PauseResponse};
use courier_pubsub::message::{DeliveryInfo, EXPECTED_STREAM_HEADER, Message, PublishAck};
use courier_pubsub::stream::{DiscardPolicy, StreamConfig, StreamInfo, StreamState, subject_matches};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::Error;

/// Window applied when a stream leaves its duplicate window at zero.
const FALLBACK_DUPLICATE_WINDOW: Duration = Duration::from_secs(120);

/// A message ready to hand to a consumer.
pub type Delivered = (Message, DeliveryInfo);

#[derive(Clone, Debug)]
struct StoredMessage {
    sequence: u64,
    message: Message,
    published: DateTime<Utc>,
    stored_at: Instant,
    size: u64,
}

#[derive(Debug)]
struct Pending {
    delivered: u64,
    redeliver_at: Instant,
}

#[derive(Debug)]
struct ConsumerEntry {
    name: String,
    config: ConsumerConfig,
    created: DateTime<Utc>,
    cursor: u64,
    consumer_sequence: u64,
    delivered_stream_sequence: u64,
    ack_floor: u64,
    pending: BTreeMap<u64, Pending>,
    last_active: Instant,
}

impl ConsumerEntry {
    fn is_paused(&self) -> bool {
        self.config
            .pause_until
            .is_some_and(|until| until > Utc::now())
    }

    fn wants(&self, subject: &str) -> bool {
        self.config.filter_subject.is_empty()
            || subject_matches(&self.config.filter_subject, subject)
    }

    fn is_exhausted(&self, delivered: u64) -> bool {
        u64::try_from(self.config.max_deliver).is_ok_and(|max| max > 0 && delivered >= max)
    }

    fn is_idle(&self, now: Instant) -> bool {
        !self.config.inactive_threshold.is_zero()
            && now.duration_since(self.last_active) > self.config.inactive_threshold
    }

    fn redelivery_wait(&self, delivered: u64) -> Duration {
        let backoff = &self.config.backoff;
        if backoff.is_empty() {
            return self.config.ack_wait;
        }

        let step = usize::try_from(delivered.saturating_sub(1)).unwrap_or(usize::MAX);
        backoff[step.min(backoff.len() - 1)]
    }

    fn settle_ack_floor(&mut self) {
        self.ack_floor = self
            .pending
            .keys()
            .next()
            .map_or(self.delivered_stream_sequence, |first| first - 1);
    }

    fn delivery(&self, stream: &str, stored: &StoredMessage, delivered: u64, pending: u64) -> Delivered {
        let info = DeliveryInfo {
            stream: stream.to_string(),
            consumer: self.name.clone(),
            stream_sequence: stored.sequence,
            consumer_sequence: self.consumer_sequence,
            delivered,
            pending,
            published: stored.published,
        };

        (stored.message.clone(), info)
    }
}

#[derive(Debug)]
struct StreamEntry {
    config: StreamConfig,
    created: DateTime<Utc>,
    messages: VecDeque<StoredMessage>,
    last_sequence: u64,
    bytes: u64,
    duplicates: HashMap<String, (u64, Instant)>,
    consumers: BTreeMap<String, ConsumerEntry>,
}

impl StreamEntry {
    fn new(config: StreamConfig) -> Self {
        Self {
            config,
            created: Utc::now(),
            messages: VecDeque::new(),
            last_sequence: 0,
            bytes: 0,
            duplicates: HashMap::new(),
            consumers: BTreeMap::new(),
        }
    }

    fn first_sequence(&self) -> u64 {
        self.messages
            .front()
            .map_or(self.last_sequence + 1, |stored| stored.sequence)
    }

    fn info(&self) -> StreamInfo {
        StreamInfo {
            config: self.config.clone(),
            state: StreamState {
                messages: count(self.messages.len()),
                bytes: self.bytes,
                first_sequence: self.first_sequence(),
                last_sequence: self.last_sequence,
                consumer_count: self.consumers.len(),
            },
            created: self.created,
        }
    }

    fn consumer_info(&self, name: &str) -> Result<ConsumerInfo, Error> {
        let consumer = self.consumers.get(name).ok_or_else(|| Error::ConsumerNotFound {
            stream: self.config.name.clone(),
            consumer: name.to_string(),
        })?;

        Ok(ConsumerInfo {
            stream_name: self.config.name.clone(),
            name: consumer.name.clone(),
            config: consumer.config.clone(),
            created: consumer.created,
            num_pending: pending_for(&self.messages, consumer),
            num_ack_pending: consumer.pending.len(),
            num_redelivered: consumer
                .pending
                .values()
                .filter(|pending| pending.delivered > 1)
                .count(),
            delivered_stream_sequence: consumer.delivered_stream_sequence,
            ack_floor_stream_sequence: consumer.ack_floor,
            paused: consumer.is_paused(),
        })
    }

    fn consumer_mut(&mut self, name: &str) -> Result<&mut ConsumerEntry, Error> {
        let stream = &self.config.name;
        self.consumers
            .get_mut(name)
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: stream.clone(),
                consumer: name.to_string(),
            })
    }

    fn start_cursor(&self, policy: DeliverPolicy) -> u64 {
        match policy {
            DeliverPolicy::All => self.first_sequence(),
            DeliverPolicy::Last => self.last_sequence.max(1),
            DeliverPolicy::New => self.last_sequence + 1,
            DeliverPolicy::ByStartSequence(sequence) => sequence.max(1),
            DeliverPolicy::ByStartTime(start) => self
                .messages
                .iter()
                .find(|stored| stored.published >= start)
                .map_or(self.last_sequence + 1, |stored| stored.sequence),
        }
    }

    fn expire(&mut self, now: Instant) {
        if self.config.max_age.is_zero() {
            return;
        }

        while let Some(oldest) = self.messages.front() {
            if now.duration_since(oldest.stored_at) < self.config.max_age {
                break;
            }
            self.drop_oldest();
        }
    }

    fn drop_oldest(&mut self) {
        if let Some(oldest) = self.messages.pop_front() {
            self.bytes -= oldest.size;
        }
    }

    fn exceeds_limits(&self, extra_messages: u64, extra_bytes: u64) -> bool {
        let messages = count(self.messages.len()) + extra_messages;
        let bytes = self.bytes + extra_bytes;

        limit(self.config.max_messages).is_some_and(|max| messages > max)
            || limit(self.config.max_bytes).is_some_and(|max| bytes > max)
    }

    fn prune_idle(&mut self, keep: &str, now: Instant) {
        self.consumers
            .retain(|name, consumer| name == keep || !consumer.is_idle(now));
    }

    fn store(&mut self, message: Message, now: Instant) -> Result<PublishAck, Error> {
        self.expire(now);

        let window = if self.config.duplicate_window.is_zero() {
            FALLBACK_DUPLICATE_WINDOW
        } else {
            self.config.duplicate_window
        };
        self.duplicates
            .retain(|_, (_, seen)| now.duration_since(*seen) < window);

        if let Some((sequence, _)) = message
            .message_id
            .as_ref()
            .and_then(|id| self.duplicates.get(id))
        {
            return Ok(PublishAck {
                stream: self.config.name.clone(),
                sequence: *sequence,
                duplicate: true,
            });
        }

        let size = count(message.subject.len() + message.payload.len());
        if let Ok(max) = u64::try_from(self.config.max_message_size) {
            if size > max {
                return Err(Error::MessageTooLarge);
            }
        }

        if self.config.discard == DiscardPolicy::New && self.exceeds_limits(1, size) {
            return Err(Error::StreamFull(self.config.name.clone()));
        }

        self.last_sequence += 1;
        let sequence = self.last_sequence;

        if let Some(id) = &message.message_id {
            self.duplicates.insert(id.clone(), (sequence, now));
        }

        self.messages.push_back(StoredMessage {
            sequence,
            message,
            published: Utc::now(),
            stored_at: now,
            size,
        });
        self.bytes += size;

        while self.exceeds_limits(0, 0) && !self.messages.is_empty() {
            self.drop_oldest();
        }

        Ok(PublishAck {
            stream: self.config.name.clone(),
            sequence,
            duplicate: false,
        })
    }
}

/// Everything the broker knows, guarded by the broker's lock.
#[derive(Debug, Default)]
pub struct State {
    streams: BTreeMap<String, StreamEntry>,
}

impl State {
    fn stream(&self, name: &str) -> Result<&StreamEntry, Error> {
        self.streams
            .get(name)
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    fn stream_mut(&mut self, name: &str) -> Result<&mut StreamEntry, Error> {
        self.streams
            .get_mut(name)
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    fn check_overlap(&self, config: &StreamConfig) -> Result<(), Error> {
        for other in self.streams.values() {
            if other.config.name == config.name {
                continue;
            }

            for subject in &config.subjects {
                if other
                    .config
                    .subjects
                    .iter()
                    .any(|existing| subjects_overlap(existing, subject))
                {
                    return Err(Error::SubjectOverlap {
                        subject: subject.clone(),
                        stream: other.config.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn create_stream(&mut self, config: StreamConfig, now: Instant) -> Result<StreamInfo, Error> {
        let config = normalize(config)?;

        if let Some(existing) = self.streams.get_mut(&config.name) {
            if existing.config != config {
                return Err(Error::StreamNameInUse(config.name));
            }
            existing.expire(now);
            return Ok(existing.info());
        }

        self.check_overlap(&config)?;

        let entry = StreamEntry::new(config);
        let info = entry.info();
        self.streams.insert(info.config.name.clone(), entry);

        Ok(info)
    }

    pub fn update_stream(&mut self, config: StreamConfig, now: Instant) -> Result<StreamInfo, Error> {
        let config = normalize(config)?;
        self.stream(&config.name)?;
        self.check_overlap(&config)?;

        let stream = self.stream_mut(&config.name)?;
        stream.config = config;
        stream.expire(now);
        while stream.exceeds_limits(0, 0) && !stream.messages.is_empty() {
            stream.drop_oldest();
        }

        Ok(stream.info())
    }

    pub fn add_stream_subject(
        &mut self,
        name: &str,
        subject: &str,
        now: Instant,
    ) -> Result<StreamInfo, Error> {
        let mut config = self.stream(name)?.config.clone();
        if config.subjects.iter().any(|existing| existing == subject) {
            return self.stream_info(name, now);
        }

        config.subjects.push(subject.to_string());
        self.update_stream(config, now)
    }

    pub fn stream_info(&mut self, name: &str, now: Instant) -> Result<StreamInfo, Error> {
        let stream = self.stream_mut(name)?;
        stream.expire(now);

        Ok(stream.info())
    }

    pub fn stream_name_by_subject(&self, subject: &str) -> Result<String, Error> {
        self.streams
            .values()
            .find(|stream| stream.config.captures(subject))
            .map(|stream| stream.config.name.clone())
            .ok_or_else(|| Error::NoStreamForSubject(subject.to_string()))
    }

    pub fn delete_stream(&mut self, name: &str) -> Result<(), Error> {
        self.streams
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    pub fn create_or_update_consumer(
        &mut self,
        stream: &str,
        mut config: ConsumerConfig,
        now: Instant,
    ) -> Result<ConsumerInfo, Error> {
        let stream = self.stream_mut(stream)?;

        if !config.filter_subject.is_empty()
            && !stream
                .config
                .subjects
                .iter()
                .any(|subject| subjects_overlap(subject, &config.filter_subject))
        {
            return Err(Error::InvalidConfig(format!(
                "filter subject `{}` is not captured by stream `{}`",
                config.filter_subject, stream.config.name
            )));
        }

        let name = config
            .durable_name
            .clone()
            .or_else(|| config.name.clone())
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        config.name = Some(name.clone());

        stream.prune_idle(&name, now);
        let cursor = stream.start_cursor(config.deliver_policy);

        let consumer = stream
            .consumers
            .entry(name.clone())
            .or_insert_with(|| ConsumerEntry {
                name: name.clone(),
                config: config.clone(),
                created: Utc::now(),
                cursor,
                consumer_sequence: 0,
                delivered_stream_sequence: 0,
                ack_floor: 0,
                pending: BTreeMap::new(),
                last_active: now,
            });
        consumer.config = config;
        consumer.last_active = now;

        stream.consumer_info(&name)
    }

    pub fn consumer_info(&mut self, stream: &str, consumer: &str, now: Instant) -> Result<ConsumerInfo, Error> {
        let stream = self.stream_mut(stream)?;
        stream.expire(now);
        stream.prune_idle("", now);

        stream.consumer_info(consumer)
    }

    pub fn set_pause(
        &mut self,
        stream: &str,
        consumer: &str,
        until: Option<DateTime<Utc>>,
    ) -> Result<PauseResponse, Error> {
        let consumer = self.stream_mut(stream)?.consumer_mut(consumer)?;
        consumer.config.pause_until = until;

        Ok(PauseResponse {
            paused: consumer.is_paused(),
            pause_until: until,
        })
    }

    pub fn delete_consumer(&mut self, stream: &str, consumer: &str) -> Result<(), Error> {
        let stream = self.stream_mut(stream)?;
        stream
            .consumers
            .remove(consumer)
            .map(|_| ())
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: stream.config.name.clone(),
                consumer: consumer.to_string(),
            })
    }

    pub fn publish(&mut self, message: Message, now: Instant) -> Result<PublishAck, Error> {
        let stream = self
            .streams
            .values_mut()
            .find(|stream| stream.config.captures(&message.subject))
            .ok_or_else(|| Error::NoStreamForSubject(message.subject.clone()))?;

        if let Some(expected) = message.headers.get(EXPECTED_STREAM_HEADER) {
            if expected != stream.config.name {
                return Err(Error::WrongExpectedStream {
                    expected: expected.to_string(),
                    actual: stream.config.name.clone(),
                });
            }
        }

        stream.store(message, now)
    }

    /// Next message for a durable consumer: a due redelivery first, then the next new message.
    pub fn next_delivery(
        &mut self,
        stream_name: &str,
        consumer_name: &str,
        now: Instant,
    ) -> Result<Option<Delivered>, Error> {
        let stream = self.stream_mut(stream_name)?;
        stream.expire(now);
        stream.prune_idle(consumer_name, now);

        let StreamEntry {
            config,
            messages,
            consumers,
            ..
        } = stream;
        let consumer = consumers
            .get_mut(consumer_name)
            .ok_or_else(|| Error::ConsumerNotFound {
                stream: config.name.clone(),
                consumer: consumer_name.to_string(),
            })?;
        consumer.last_active = now;

        if consumer.is_paused() {
            return Ok(None);
        }

        let due: Vec<(u64, u64)> = consumer
            .pending
            .iter()
            .filter(|(_, pending)| pending.redeliver_at <= now)
            .map(|(sequence, pending)| (*sequence, pending.delivered))
            .collect();

        for (sequence, delivered) in due {
            let Some(stored) = find(messages, sequence) else {
                consumer.pending.remove(&sequence);
                continue;
            };

            if consumer.is_exhausted(delivered) {
                consumer.pending.remove(&sequence);
                continue;
            }

            let delivered = delivered + 1;
            let redeliver_at = now + consumer.redelivery_wait(delivered);
            consumer.pending.insert(sequence, Pending {
                delivered,
                redeliver_at,
            });
            consumer.consumer_sequence += 1;
            consumer.settle_ack_floor();

            let pending = pending_for(messages, consumer);
            return Ok(Some(consumer.delivery(&config.name, stored, delivered, pending)));
        }
        consumer.settle_ack_floor();

        let Some(stored) = messages
            .iter()
            .find(|stored| stored.sequence >= consumer.cursor && consumer.wants(&stored.message.subject))
        else {
            consumer.cursor = consumer.cursor.max(messages.back().map_or(0, |last| last.sequence + 1));
            return Ok(None);
        };

        consumer.cursor = stored.sequence + 1;
        consumer.consumer_sequence += 1;
        consumer.delivered_stream_sequence = stored.sequence;

        if consumer.config.ack_policy == AckPolicy::None {
            consumer.ack_floor = stored.sequence;
        } else {
            let redeliver_at = now + consumer.redelivery_wait(1);
            consumer.pending.insert(stored.sequence, Pending {
                delivered: 1,
                redeliver_at,
            });
        }

        let pending = pending_for(messages, consumer);
        Ok(Some(consumer.delivery(&config.name, stored, 1, pending)))
    }

    /// Next message at or after `cursor` for an ordered consumer; advances `cursor`.
    pub fn next_ordered(
        &mut self,
        stream_name: &str,
        filters: &[String],
        cursor: &mut u64,
        consumer_sequence: &mut u64,
        now: Instant,
    ) -> Result<Option<Delivered>, Error> {
        let stream = self.stream_mut(stream_name)?;
        stream.expire(now);

        let wanted = |subject: &str| {
            filters.is_empty() || filters.iter().any(|filter| subject_matches(filter, subject))
        };

        let Some(stored) = stream
            .messages
            .iter()
            .find(|stored| stored.sequence >= *cursor && wanted(&stored.message.subject))
        else {
            return Ok(None);
        };

        *cursor = stored.sequence + 1;
        *consumer_sequence += 1;

        let pending = count(
            stream
                .messages
                .iter()
                .filter(|later| later.sequence >= *cursor && wanted(&later.message.subject))
                .count(),
        );

        let info = DeliveryInfo {
            stream: stream.config.name.clone(),
            consumer: String::new(),
            stream_sequence: stored.sequence,
            consumer_sequence: *consumer_sequence,
            delivered: 1,
            pending,
            published: stored.published,
        };

        Ok(Some((stored.message.clone(), info)))
    }

    /// Where an ordered consumer with `policy` starts.
    pub fn ordered_start(&self, stream: &str, policy: DeliverPolicy) -> Result<u64, Error> {
        Ok(self.stream(stream)?.start_cursor(policy))
    }

    pub fn ack(&mut self, stream: &str, consumer: &str, sequence: u64) -> Result<(), Error> {
        let consumer = self.stream_mut(stream)?.consumer_mut(consumer)?;

        if consumer.config.ack_policy == AckPolicy::All {
            consumer.pending.retain(|pending, _| *pending > sequence);
        } else {
            consumer.pending.remove(&sequence);
        }
        consumer.settle_ack_floor();

        Ok(())
    }

    pub fn nak(
        &mut self,
        stream: &str,
        consumer: &str,
        sequence: u64,
        delay: Option<Duration>,
        now: Instant,
    ) -> Result<(), Error> {
        let consumer = self.stream_mut(stream)?.consumer_mut(consumer)?;

        if let Some(pending) = consumer.pending.get_mut(&sequence) {
            pending.redeliver_at = now + delay.unwrap_or_default();
        }

        Ok(())
    }

    pub fn term(&mut self, stream: &str, consumer: &str, sequence: u64) -> Result<(), Error> {
        let consumer = self.stream_mut(stream)?.consumer_mut(consumer)?;
        consumer.pending.remove(&sequence);
        consumer.settle_ack_floor();

        Ok(())
    }
}

fn normalize(mut config: StreamConfig) -> Result<StreamConfig, Error> {
    if config.name.is_empty() {
        return Err(Error::InvalidConfig("stream name is required".to_string()));
    }

    if config
        .name
        .chars()
        .any(|c| matches!(c, '.' | '*' | '>') || c.is_whitespace())
    {
        return Err(Error::InvalidConfig(format!(
            "invalid stream name `{}`",
            config.name
        )));
    }

    if config.subjects.is_empty() {
        config.subjects.push(config.name.clone());
    }

    Ok(config)
}

fn find(messages: &VecDeque<StoredMessage>, sequence: u64) -> Option<&StoredMessage> {
    let index = messages.partition_point(|stored| stored.sequence < sequence);
    messages.get(index).filter(|stored| stored.sequence == sequence)
}

fn pending_for(messages: &VecDeque<StoredMessage>, consumer: &ConsumerEntry) -> u64 {
    count(
        messages
            .iter()
            .filter(|stored| stored.sequence >= consumer.cursor && consumer.wants(&stored.message.subject))
            .count(),
    )
}

fn count(n: usize) -> u64 {
    u64::try_from(n).unwrap_or(u64::MAX)
}

fn limit(value: i64) -> Option<u64> {
    u64::try_from(value).ok().filter(|max| *max > 0)
}

/// Whether two subject patterns can match a common subject.
fn subjects_overlap(a: &str, b: &str) -> bool {
    let mut a_tokens = a.split('.');
    let mut b_tokens = b.split('.');

    loop {
        match (a_tokens.next(), b_tokens.next()) {
            (Some(">"), Some(_)) | (Some(_), Some(">")) | (None, None) => return true,
            (Some(x), Some(y)) if x == "*" || y == "*" || x == y => {}
            _ => return false,
        }
    }
}
