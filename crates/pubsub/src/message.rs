use bytes::Bytes;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Header carrying the message identifier used for duplicate suppression.
pub const MESSAGE_ID_HEADER: &str = "Nats-Msg-Id";

/// Header asking the broker to reject a publish that lands in another stream.
pub const EXPECTED_STREAM_HEADER: &str = "Nats-Expected-Stream";

/// Ordered, multi-valued message metadata.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
pub struct Headers(IndexMap<String, Vec<String>>);

impl Headers {
    /// Creates an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a value to `key`, keeping existing values.
    pub fn append<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.entry(key.into()).or_default().push(value.into());
    }

    /// Replaces every value of `key` with `value`.
    pub fn insert<K, V>(&mut self, key: K, value: V)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.0.insert(key.into(), vec![value.into()]);
    }

    /// First value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(|values| values.first()).map(String::as_str)
    }

    /// All values of `key`, in insertion order.
    #[must_use]
    pub fn get_all(&self, key: &str) -> &[String] {
        self.0.get(key).map_or(&[], Vec::as_slice)
    }

    /// Removes `key` and returns its values.
    pub fn remove(&mut self, key: &str) -> Option<Vec<String>> {
        self.0.shift_remove(key)
    }

    /// Iterates keys with their values in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &[String])> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_slice()))
    }

    /// Number of distinct keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no keys.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Self::new();
        for (key, value) in iter {
            headers.append(key, value);
        }
        headers
    }
}

impl From<IndexMap<String, Vec<String>>> for Headers {
    fn from(map: IndexMap<String, Vec<String>>) -> Self {
        Self(map)
    }
}

/// A message envelope: subject, opaque payload and metadata.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Subject the message is published on.
    pub subject: String,

    /// Opaque payload.
    pub payload: Bytes,

    /// Metadata sent as message headers.
    pub headers: Headers,

    /// Identifier used by the broker to drop duplicates inside the dedup window.
    pub message_id: Option<String>,
}

impl Message {
    /// Creates a message without headers or identifier.
    pub fn new<S, P>(subject: S, payload: P) -> Self
    where
        S: Into<String>,
        P: Into<Bytes>,
    {
        Self {
            subject: subject.into(),
            payload: payload.into(),
            headers: Headers::new(),
            message_id: None,
        }
    }

    /// Sets the headers.
    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Sets the duplicate-suppression identifier.
    #[must_use]
    pub fn with_message_id<S: Into<String>>(mut self, message_id: S) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    /// Decodes the payload as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload is not valid JSON for `T`.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

/// Where and how often a delivered message has been delivered.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeliveryInfo {
    /// Stream the message was stored in.
    pub stream: String,

    /// Consumer the message was delivered through.
    pub consumer: String,

    /// Sequence of the message in the stream.
    pub stream_sequence: u64,

    /// Sequence of this delivery within the consumer.
    pub consumer_sequence: u64,

    /// Delivery attempt number, starting at 1.
    pub delivered: u64,

    /// Messages still pending for the consumer.
    pub pending: u64,

    /// When the message was stored.
    pub published: DateTime<Utc>,
}

/// Acknowledgment of a persisted publish.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
pub struct PublishAck {
    /// Stream the message landed in.
    pub stream: String,

    /// Sequence assigned by the stream.
    pub sequence: u64,

    /// Whether the broker recognised the message identifier inside the dedup window.
    pub duplicate: bool,
}

/// Per-publish options.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PublishOptions {
    /// Identifier for duplicate suppression.
    pub message_id: Option<String>,

    /// Stream the message must land in.
    pub expected_stream: Option<String>,
}

impl PublishOptions {
    /// Options carrying only a message identifier.
    pub fn with_message_id<S: Into<String>>(message_id: S) -> Self {
        Self {
            message_id: Some(message_id.into()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn headers_keep_insertion_order_and_multiple_values() {
        let mut headers = Headers::new();
        headers.append("b", "1");
        headers.append("a", "2");
        headers.append("b", "3");

        let keys: Vec<_> = headers.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(headers.get("b"), Some("1"));
        assert_eq!(headers.get_all("b"), ["1".to_string(), "3".to_string()]);
        assert!(headers.get_all("missing").is_empty());
    }

    #[test]
    fn insert_replaces_existing_values() {
        let mut headers: Headers = [("k", "old"), ("k", "older")].into_iter().collect();
        headers.insert("k", "new");

        assert_eq!(headers.get_all("k"), ["new".to_string()]);
        assert_eq!(headers.remove("k"), Some(vec!["new".to_string()]));
        assert!(headers.is_empty());
    }

    #[test]
    fn message_json_round_trips_payload() {
        #[derive(Debug, Deserialize, PartialEq)]
        struct Chat {
            text: String,
        }

        let message = Message::new("chat.group.42", r#"{"text":"hi"}"#).with_message_id("m-1");

        assert_eq!(message.message_id.as_deref(), Some("m-1"));
        assert_eq!(
            message.json::<Chat>().unwrap(),
            Chat {
                text: "hi".to_string()
            }
        );
    }
}
