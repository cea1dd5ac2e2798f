use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use courier_pubsub::ManagerConfig;
use courier_pubsub::stream::StorageType;
use courier_pubsub_nats::{NatsBrokerOptions, NatsConnectionConfig};
use tracing::Level;

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// NATS server URL
    #[arg(long, default_value = "nats://localhost:4222", env = "COURIER_NATS_URL")]
    pub nats_url: String,

    /// Client name reported to the server
    #[arg(long, default_value = "courier", env = "COURIER_NATS_NAME")]
    pub nats_name: String,

    /// Reconnect attempts before giving up (0 retries forever)
    #[arg(long, default_value_t = 60, env = "COURIER_NATS_MAX_RECONNECTS")]
    pub max_reconnects: usize,

    /// Base delay between reconnect attempts in milliseconds
    #[arg(long, default_value_t = 2000, env = "COURIER_NATS_RECONNECT_WAIT_MS")]
    pub reconnect_wait_ms: u64,

    /// Reconnect jitter in milliseconds
    #[arg(long, default_value_t = 100, env = "COURIER_NATS_RECONNECT_JITTER_MS")]
    pub reconnect_jitter_ms: u64,

    /// Reconnect jitter for TLS connections in milliseconds
    #[arg(
        long,
        default_value_t = 1000,
        env = "COURIER_NATS_RECONNECT_JITTER_TLS_MS"
    )]
    pub reconnect_jitter_tls_ms: u64,

    /// Request timeout in milliseconds
    #[arg(long, default_value_t = 2000, env = "COURIER_NATS_TIMEOUT_MS")]
    pub timeout_ms: u64,

    /// Keep-alive ping interval in seconds
    #[arg(long, default_value_t = 120, env = "COURIER_NATS_PING_INTERVAL_SECS")]
    pub ping_interval_secs: u64,

    /// Missed pings before the connection is re-established
    #[arg(long, default_value_t = 2, env = "COURIER_NATS_MAX_PINGS_OUTSTANDING")]
    pub max_pings_outstanding: usize,

    /// Require TLS
    #[arg(long, env = "COURIER_NATS_TLS")]
    pub tls: bool,

    /// JetStream domain
    #[arg(long, env = "COURIER_JS_DOMAIN")]
    pub js_domain: Option<String>,

    /// JetStream API timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "COURIER_JS_API_TIMEOUT_MS")]
    pub js_api_timeout_ms: u64,

    /// Async publish acknowledgment timeout in milliseconds
    #[arg(long, default_value_t = 5000, env = "COURIER_PUBLISH_ASYNC_TIMEOUT_MS")]
    pub publish_async_timeout_ms: u64,

    /// Maximum unresolved async publishes
    #[arg(long, default_value_t = 10, env = "COURIER_PUBLISH_ASYNC_MAX_PENDING")]
    pub publish_async_max_pending: usize,

    /// Replica count for auto-provisioned streams
    #[arg(long, default_value_t = 3, env = "COURIER_STREAM_REPLICAS")]
    pub stream_replicas: usize,

    /// Maximum log level
    #[arg(long, default_value_t = Level::INFO, env = "COURIER_LOG_LEVEL")]
    pub log_level: Level,

    #[command(subcommand)]
    pub command: Command,
}

impl Args {
    pub fn connection_config(&self) -> NatsConnectionConfig {
        NatsConnectionConfig {
            url: self.nats_url.clone(),
            name: self.nats_name.clone(),
            max_reconnects: (self.max_reconnects > 0).then_some(self.max_reconnects),
            reconnect_wait: Duration::from_millis(self.reconnect_wait_ms),
            reconnect_jitter: Duration::from_millis(self.reconnect_jitter_ms),
            reconnect_jitter_tls: Duration::from_millis(self.reconnect_jitter_tls_ms),
            connection_timeout: Duration::from_millis(self.timeout_ms),
            request_timeout: Duration::from_millis(self.timeout_ms),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            max_pings_outstanding: self.max_pings_outstanding,
            tls_required: self.tls,
        }
    }

    pub fn broker_options(&self) -> NatsBrokerOptions {
        NatsBrokerOptions {
            domain: self.js_domain.clone(),
            api_timeout: Duration::from_millis(self.js_api_timeout_ms),
        }
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            stream_replicas: self.stream_replicas,
            publish_async_timeout: Duration::from_millis(self.publish_async_timeout_ms),
            publish_async_max_pending: self.publish_async_max_pending,
            ..ManagerConfig::default()
        }
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum Command {
    /// Manage streams
    #[command(subcommand)]
    Stream(StreamCommand),

    /// Manage consumers
    #[command(subcommand)]
    Consumer(ConsumerCommand),

    /// Publish a message, provisioning its stream if needed
    Publish(PublishArgs),

    /// Consume a subject through a durable consumer, acknowledging every message
    Subscribe(SubscribeArgs),

    /// Follow a stream through an ordered consumer without acknowledgments
    Tail(TailArgs),
}

#[derive(Clone, Debug, Subcommand)]
pub enum StreamCommand {
    /// Create or update a stream
    Create {
        /// Stream name
        name: String,

        /// Subjects captured by the stream
        #[arg(long = "subject", required = true)]
        subjects: Vec<String>,

        /// Storage backend
        #[arg(long, value_enum, default_value_t = Storage::File)]
        storage: Storage,
    },

    /// Show a stream
    Info {
        /// Stream name
        name: String,
    },

    /// Find the stream capturing a subject
    Lookup {
        /// Subject
        subject: String,
    },

    /// Delete a stream and its messages
    Delete {
        /// Stream name
        name: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum Storage {
    File,
    Memory,
}

impl From<Storage> for StorageType {
    fn from(storage: Storage) -> Self {
        match storage {
            Storage::File => Self::File,
            Storage::Memory => Self::Memory,
        }
    }
}

#[derive(Clone, Debug, Subcommand)]
pub enum ConsumerCommand {
    /// Show a consumer
    Info(ConsumerRef),

    /// Pause deliveries
    Pause {
        #[command(flatten)]
        consumer: ConsumerRef,

        /// Pause length in seconds
        #[arg(long, default_value_t = 300)]
        secs: i64,
    },

    /// Resume deliveries
    Resume(ConsumerRef),

    /// Delete a consumer
    Delete(ConsumerRef),
}

#[derive(Clone, Debug, ClapArgs)]
pub struct ConsumerRef {
    /// Stream name
    pub stream: String,

    /// Consumer name
    pub consumer: String,
}

#[derive(Clone, Debug, ClapArgs)]
pub struct PublishArgs {
    /// Subject
    pub subject: String,

    /// Payload. Valid JSON is sent as-is, anything else as a JSON string
    pub payload: String,

    /// Stream to provision when none captures the subject
    #[arg(long)]
    pub stream: Option<String>,

    /// Identifier for duplicate suppression
    #[arg(long)]
    pub message_id: Option<String>,

    /// Header as KEY=VALUE; repeatable
    #[arg(long = "header")]
    pub headers: Vec<String>,

    /// Publish this many copies through the async window
    #[arg(long)]
    pub repeat: Option<usize>,
}

#[derive(Clone, Debug, ClapArgs)]
pub struct SubscribeArgs {
    /// Subject
    pub subject: String,

    /// Stream to provision when none captures the subject
    #[arg(long)]
    pub stream: String,

    /// Durable consumer name
    #[arg(long)]
    pub consumer: String,

    /// Filter subject for a newly created consumer; defaults to the subject
    #[arg(long)]
    pub filter_subject: Option<String>,
}

#[derive(Clone, Debug, ClapArgs)]
pub struct TailArgs {
    /// Stream name
    pub stream: String,

    /// Only deliver these subjects; repeatable
    #[arg(long = "subject")]
    pub subjects: Vec<String>,

    /// Replay from the first stored message instead of only new ones
    #[arg(long)]
    pub from_start: bool,
}
