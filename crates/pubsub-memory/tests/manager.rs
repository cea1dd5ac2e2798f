use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use assert_matches::assert_matches;
use chrono::Utc;
use courier_pubsub::broker::Delivery;
use courier_pubsub::consumer::{ConsumerManager, OrderedConsumerConfig};
use courier_pubsub::message::{Headers, Message, PublishOptions};
use courier_pubsub::publisher::Publisher;
use courier_pubsub::stream::{DiscardPolicy, StorageType, StreamConfig, StreamManager};
use courier_pubsub::subscriber::{SubscribeParams, Subscriber, SubscriptionState};
use courier_pubsub::{Error, JetStreamManager, ManagerCell, ManagerConfig};
use courier_pubsub_memory::{MemoryBroker, MemoryBrokerOptions};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{Instant, timeout};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

#[derive(Debug, thiserror::Error)]
#[error("handler failed")]
struct HandlerFailed;

#[derive(Debug, Deserialize, PartialEq, Eq, Serialize)]
struct ChatMessage {
    room: u32,
    text: String,
}

fn manager() -> JetStreamManager<MemoryBroker> {
    manager_with(MemoryBrokerOptions::default(), ManagerConfig::default())
}

fn manager_with(
    options: MemoryBrokerOptions,
    config: ManagerConfig,
) -> JetStreamManager<MemoryBroker> {
    JetStreamManager::new(
        MemoryBroker::new(options),
        ManagerConfig {
            stream_replicas: 1,
            ..config
        },
    )
}

fn params(stream: &str, consumer: &str, filter_subject: &str) -> SubscribeParams {
    SubscribeParams {
        stream: stream.to_string(),
        consumer: consumer.to_string(),
        filter_subject: filter_subject.to_string(),
        exhausted: None,
    }
}

fn forwarding_handler(
    sender: mpsc::Sender<Message>,
) -> impl Fn(Message) -> futures::future::BoxFuture<'static, Result<(), HandlerFailed>>
+ Clone
+ Send
+ Sync
+ 'static {
    move |message: Message| -> futures::future::BoxFuture<'static, Result<(), HandlerFailed>> {
        let sender = sender.clone();
        Box::pin(async move { sender.send(message).await.map_err(|_| HandlerFailed) })
    }
}

#[tokio::test]
async fn resolve_stream_provisions_once() {
    let manager = manager();

    let first = manager
        .resolve_stream("chat.group.42", "chat")
        .await
        .unwrap();
    assert_eq!(first.config.name, "chat");
    assert_eq!(first.config.subjects, vec!["chat.group.42".to_string()]);
    assert_eq!(first.config.max_age, Duration::from_secs(24 * 60 * 60));
    assert_eq!(first.config.max_bytes, 500 * 1024 * 1024);
    assert_eq!(first.config.duplicate_window, Duration::from_secs(90));
    assert!(first.config.allow_direct);
    assert_eq!(first.config.num_replicas, 1);

    let second = manager
        .resolve_stream("chat.group.42", "chat")
        .await
        .unwrap();
    assert_eq!(second.config, first.config);
    assert_eq!(second.created, first.created);

    let by_subject = manager.stream_by_subject("chat.group.42").await.unwrap();
    assert_eq!(by_subject.config.name, "chat");
}

#[tokio::test]
async fn resolve_stream_widens_existing_stream() {
    let manager = manager();

    manager
        .create_or_update_stream(StreamConfig {
            name: "chat".to_string(),
            subjects: vec!["chat.group.1".to_string()],
            ..StreamConfig::default()
        })
        .await
        .unwrap();

    let info = manager
        .resolve_stream("chat.group.2", "chat")
        .await
        .unwrap();

    assert_eq!(
        info.config.subjects,
        vec!["chat.group.1".to_string(), "chat.group.2".to_string()]
    );
}

#[tokio::test]
async fn widening_keeps_stream_limits() {
    let manager = manager();

    let original = manager
        .create_or_update_stream(StreamConfig {
            name: "chat".to_string(),
            subjects: vec!["chat.group.1".to_string()],
            description: Some("group chat".to_string()),
            storage: StorageType::Memory,
            max_age: Duration::from_secs(60),
            max_messages: 7,
            max_message_size: 1024,
            discard: DiscardPolicy::New,
            duplicate_window: Duration::from_secs(30),
            ..StreamConfig::default()
        })
        .await
        .unwrap()
        .config;

    let widened = manager
        .resolve_stream("chat.group.2", "chat")
        .await
        .unwrap()
        .config;

    assert_eq!(
        widened,
        StreamConfig {
            subjects: vec!["chat.group.1".to_string(), "chat.group.2".to_string()],
            ..original.clone()
        }
    );

    let again = manager
        .resolve_stream("chat.group.2", "chat")
        .await
        .unwrap()
        .config;
    assert_eq!(again, widened);
}

#[tokio::test]
async fn resolve_stream_rejects_subject_owned_elsewhere() {
    let manager = manager();
    manager.resolve_stream("orders.new", "orders").await.unwrap();

    let result = manager.resolve_stream("orders.new", "chat").await;

    assert_matches!(result, Err(Error::InvalidStream(_)));
}

#[tokio::test]
async fn empty_names_are_rejected() {
    let manager = manager();

    assert_matches!(
        manager.resolve_stream("chat.group.42", "").await,
        Err(Error::InvalidStream(_))
    );

    manager.resolve_stream("chat.group.42", "chat").await.unwrap();
    assert_matches!(
        manager.resolve_consumer("chat", "", "chat.group.42").await,
        Err(Error::InvalidConsumer(_))
    );
}

#[tokio::test]
async fn lookups_of_missing_resources_are_not_found() {
    let manager = manager();

    assert_matches!(
        manager.stream_by_name("missing").await,
        Err(Error::StreamNotFound(name)) if name == "missing"
    );
    assert_matches!(
        manager.stream_by_subject("nobody.home").await,
        Err(Error::StreamNotFound(_))
    );
    assert_matches!(
        manager.consumer_by_stream("missing", "worker").await,
        Err(Error::StreamNotFound(_))
    );

    manager.resolve_stream("chat.group.42", "chat").await.unwrap();
    assert_matches!(
        manager.consumer_by_stream("chat", "worker").await,
        Err(Error::ConsumerNotFound { .. })
    );
}

#[tokio::test]
async fn delete_stream_removes_it() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();

    manager.delete_stream("chat").await.unwrap();

    assert_matches!(
        manager.stream_by_name("chat").await,
        Err(Error::StreamNotFound(_))
    );
    assert_matches!(
        manager.delete_stream("chat").await,
        Err(Error::StreamNotFound(_))
    );
}

#[tokio::test]
async fn resolve_consumer_creates_with_default_policy() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();

    let created = manager
        .resolve_consumer("chat", "worker", "chat.group.42")
        .await
        .unwrap();
    assert_eq!(created.name, "worker");
    assert_eq!(created.config.durable_name.as_deref(), Some("worker"));
    assert_eq!(created.config.filter_subject, "chat.group.42");
    assert_eq!(created.config.max_deliver, 5);
    assert_eq!(created.config.ack_wait, Duration::from_secs(30));
    assert_eq!(created.config.inactive_threshold, Duration::from_secs(600));

    let resolved = manager
        .resolve_consumer("chat", "worker", "chat.group.42")
        .await
        .unwrap();
    assert_eq!(resolved.created, created.created);
    assert_eq!(resolved.config, created.config);
}

#[tokio::test]
async fn publish_deduplicates_by_message_id() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();

    let payload = ChatMessage {
        room: 42,
        text: "hello".to_string(),
    };

    let first = manager
        .publish(
            "chat.group.42",
            &payload,
            Headers::new(),
            PublishOptions::with_message_id("m-1"),
        )
        .await
        .unwrap();
    assert_eq!(first.stream, "chat");
    assert_eq!(first.sequence, 1);
    assert!(!first.duplicate);

    let again = manager
        .publish(
            "chat.group.42",
            &payload,
            Headers::new(),
            PublishOptions::with_message_id("m-1"),
        )
        .await
        .unwrap();
    assert_eq!(again.sequence, 1);
    assert!(again.duplicate);

    let other = manager
        .publish(
            "chat.group.42",
            &payload,
            Headers::new(),
            PublishOptions::with_message_id("m-2"),
        )
        .await
        .unwrap();
    assert_eq!(other.sequence, 2);
    assert!(!other.duplicate);
}

#[tokio::test]
async fn publish_without_stream_fails() {
    let manager = manager();

    let result = manager
        .publish("nobody.home", "hi", Headers::new(), PublishOptions::default())
        .await;

    assert_matches!(result, Err(Error::Publish { subject, .. }) if subject == "nobody.home");
}

#[tokio::test]
async fn publish_checks_expected_stream() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();

    let result = manager
        .publish(
            "chat.group.42",
            "hi",
            Headers::new(),
            PublishOptions {
                expected_stream: Some("orders".to_string()),
                ..PublishOptions::default()
            },
        )
        .await;

    assert_matches!(result, Err(Error::Publish { .. }));
}

#[tokio::test]
async fn subscribe_delivers_and_acks() {
    let manager = manager();
    let (sender, mut receiver) = mpsc::channel(8);
    let cancel = CancellationToken::new();

    let task = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            manager
                .subscribe(
                    "chat.group.42",
                    forwarding_handler(sender),
                    params("chat", "worker", "chat.group.42"),
                    cancel,
                )
                .await
        }
    });

    // The subscription provisions the stream; wait for it before publishing.
    let mut provisioned = false;
    for _ in 0..100 {
        if manager.consumer_by_stream("chat", "worker").await.is_ok() {
            provisioned = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(provisioned);

    let payload = ChatMessage {
        room: 42,
        text: "hello".to_string(),
    };
    manager
        .publish("chat.group.42", &payload, Headers::new(), PublishOptions::default())
        .await
        .unwrap();

    let message = timeout(Duration::from_secs(1), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.subject, "chat.group.42");
    assert_eq!(message.json::<ChatMessage>().unwrap(), payload);

    let mut acked = false;
    for _ in 0..100 {
        let info = manager.consumer_by_stream("chat", "worker").await.unwrap();
        if info.num_ack_pending == 0 && info.ack_floor_stream_sequence == 1 {
            acked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(acked);

    cancel.cancel();
    assert_matches!(task.await.unwrap(), Err(Error::Cancelled));
}

#[tokio::test]
async fn paused_consumer_delivers_after_resume() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();
    manager
        .resolve_consumer("chat", "worker", "chat.group.42")
        .await
        .unwrap();

    manager
        .pause_consumer("chat", "worker", Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert!(manager.consumer_by_stream("chat", "worker").await.unwrap().paused);

    let (sender, mut receiver) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            manager
                .subscribe(
                    "chat.group.42",
                    forwarding_handler(sender),
                    params("chat", "worker", "chat.group.42"),
                    cancel,
                )
                .await
        }
    });

    manager
        .publish("chat.group.42", "while paused", Headers::new(), PublishOptions::default())
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(200), receiver.recv())
            .await
            .is_err()
    );

    manager.resume_consumer("chat", "worker").await.unwrap();
    assert!(!manager.consumer_by_stream("chat", "worker").await.unwrap().paused);

    let message = timeout(Duration::from_secs(1), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.json::<String>().unwrap(), "while paused");

    cancel.cancel();
    assert_matches!(task.await.unwrap(), Err(Error::Cancelled));
}

#[tokio::test]
async fn paused_consumer_resumes_on_its_own_at_deadline() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();
    manager
        .resolve_consumer("chat", "worker", "chat.group.42")
        .await
        .unwrap();

    manager
        .pause_consumer("chat", "worker", Utc::now() + chrono::Duration::milliseconds(500))
        .await
        .unwrap();

    let (sender, mut receiver) = mpsc::channel(8);
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            manager
                .subscribe(
                    "chat.group.42",
                    forwarding_handler(sender),
                    params("chat", "worker", "chat.group.42"),
                    cancel,
                )
                .await
        }
    });

    manager
        .publish("chat.group.42", "held", Headers::new(), PublishOptions::default())
        .await
        .unwrap();

    assert!(
        timeout(Duration::from_millis(200), receiver.recv())
            .await
            .is_err()
    );

    let message = timeout(Duration::from_secs(3), receiver.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(message.json::<String>().unwrap(), "held");
    assert!(!manager.consumer_by_stream("chat", "worker").await.unwrap().paused);

    cancel.cancel();
    assert_matches!(task.await.unwrap(), Err(Error::Cancelled));
}

#[tokio::test]
async fn pause_in_the_past_is_rejected() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();
    manager
        .resolve_consumer("chat", "worker", "chat.group.42")
        .await
        .unwrap();

    let result = manager
        .pause_consumer("chat", "worker", Utc::now() - chrono::Duration::minutes(1))
        .await;

    assert_matches!(result, Err(Error::PauseRejected { .. }));
}

#[traced_test]
#[tokio::test(start_paused = true)]
async fn failing_handler_is_redelivered_until_exhausted() {
    let manager = manager();
    let (attempts_sender, mut attempts) = mpsc::unbounded_channel();
    let (exhausted_sender, mut exhausted) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();

    let handler = move |message: Message| {
        let attempts_sender = attempts_sender.clone();
        async move {
            let _ = attempts_sender.send((Instant::now(), message.subject));
            Err::<(), _>(HandlerFailed)
        }
    };

    let task = tokio::spawn({
        let manager = manager.clone();
        let cancel = cancel.clone();
        async move {
            manager
                .subscribe(
                    "chat.group.42",
                    handler,
                    SubscribeParams {
                        exhausted: Some(exhausted_sender),
                        ..params("chat", "worker", "chat.group.42")
                    },
                    cancel,
                )
                .await
        }
    });

    while manager.consumer_by_stream("chat", "worker").await.is_err() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    manager
        .publish("chat.group.42", "boom", Headers::new(), PublishOptions::default())
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(60), exhausted.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.stream, "chat");
    assert_eq!(event.consumer, "worker");
    assert_eq!(event.subject, "chat.group.42");
    assert_eq!(event.stream_sequence, 1);
    assert_eq!(event.deliveries, 5);
    assert_eq!(event.error, "handler failed");
    assert!(logs_contain("message exhausted its delivery attempts"));

    let mut seen = Vec::new();
    while let Ok((at, subject)) = attempts.try_recv() {
        assert_eq!(subject, "chat.group.42");
        seen.push(at);
    }
    assert_eq!(seen.len(), 5);
    for pair in seen.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_secs(3));
    }

    // Terminated: nothing comes back even after every backoff step.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(attempts.try_recv().is_err());
    let info = manager.consumer_by_stream("chat", "worker").await.unwrap();
    assert_eq!(info.num_ack_pending, 0);

    cancel.cancel();
    assert_matches!(task.await.unwrap(), Err(Error::Cancelled));
}

#[tokio::test]
async fn cancel_waits_for_in_flight_handlers() {
    let manager = manager();
    let finished = Arc::new(AtomicUsize::new(0));
    let (started_sender, mut started) = mpsc::unbounded_channel();

    let handler = {
        let finished = finished.clone();
        move |_message: Message| {
            let finished = finished.clone();
            let started_sender = started_sender.clone();
            async move {
                let _ = started_sender.send(());
                tokio::time::sleep(Duration::from_millis(200)).await;
                finished.fetch_add(1, Ordering::SeqCst);
                Ok::<(), HandlerFailed>(())
            }
        }
    };

    let subscription = manager.subscription(
        "chat.group.42",
        handler,
        params("chat", "worker", "chat.group.42"),
    );
    assert_eq!(subscription.state(), SubscriptionState::Created);
    let mut state = subscription.watch_state();

    let cancel = CancellationToken::new();
    let task = tokio::spawn(subscription.run(cancel.clone()));

    state
        .wait_for(|state| *state == SubscriptionState::Consuming)
        .await
        .unwrap();

    manager
        .publish("chat.group.42", "slow", Headers::new(), PublishOptions::default())
        .await
        .unwrap();

    timeout(Duration::from_secs(1), started.recv())
        .await
        .unwrap()
        .unwrap();
    cancel.cancel();

    assert_matches!(task.await.unwrap(), Err(Error::Cancelled));
    assert_eq!(finished.load(Ordering::SeqCst), 1);
    assert_eq!(*state.borrow(), SubscriptionState::Stopped);
}

#[tokio::test]
async fn deleting_the_consumer_ends_the_subscription() {
    let manager = manager();
    let (sender, _receiver) = mpsc::channel(8);

    let subscription = manager.subscription(
        "chat.group.42",
        forwarding_handler(sender),
        params("chat", "worker", "chat.group.42"),
    );
    let mut state = subscription.watch_state();
    let task = tokio::spawn(subscription.run(CancellationToken::new()));

    state
        .wait_for(|state| *state == SubscriptionState::Consuming)
        .await
        .unwrap();
    manager.delete_consumer("chat", "worker").await.unwrap();

    let result = timeout(Duration::from_secs(1), task).await.unwrap().unwrap();
    assert_matches!(result, Err(Error::Consume { stream, consumer, .. }) if stream == "chat" && consumer == "worker");
    assert_eq!(*state.borrow(), SubscriptionState::Stopped);
}

#[tokio::test]
async fn subscribe_with_foreign_stream_fails_before_consuming() {
    let manager = manager();
    manager.resolve_stream("orders.new", "orders").await.unwrap();
    let (sender, _receiver) = mpsc::channel(8);

    let result = manager
        .subscribe(
            "orders.new",
            forwarding_handler(sender),
            params("chat", "worker", "orders.new"),
            CancellationToken::new(),
        )
        .await;

    assert_matches!(result, Err(Error::InvalidStream(_)));
}

#[tokio::test]
async fn ordered_consumer_tails_in_order() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();

    for text in ["one", "two", "three"] {
        manager
            .publish("chat.group.42", text, Headers::new(), PublishOptions::default())
            .await
            .unwrap();
    }

    let mut ordered = manager
        .ordered_consumer("chat", OrderedConsumerConfig::default())
        .await
        .unwrap();
    assert_eq!(ordered.stream(), "chat");

    for (expected_sequence, expected_text) in [(1, "one"), (2, "two"), (3, "three")] {
        let delivery = timeout(Duration::from_secs(1), ordered.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.info().stream_sequence, expected_sequence);
        assert_eq!(delivery.message().json::<String>().unwrap(), expected_text);
        delivery.ack().await.unwrap();
    }

    assert_matches!(
        manager
            .ordered_consumer("missing", OrderedConsumerConfig::default())
            .await,
        Err(Error::StreamNotFound(_))
    );
}

#[tokio::test(start_paused = true)]
async fn async_publish_times_out_without_ack() {
    let manager = manager_with(
        MemoryBrokerOptions {
            ack_latency: Duration::from_secs(10),
            ..MemoryBrokerOptions::default()
        },
        ManagerConfig::default(),
    );
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();

    let pending = manager
        .publish_async("chat.group.42", "late", Headers::new(), PublishOptions::default())
        .await
        .unwrap();

    assert_matches!(
        pending.wait().await,
        Err(Error::PublishTimeout { subject, timeout }) if subject == "chat.group.42" && timeout == Duration::from_secs(5)
    );
}

#[tokio::test]
async fn async_publish_reports_broker_rejection() {
    let manager = manager();
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();
    let slots = manager.available_publish_slots();

    let pending = manager
        .publish_async("audit.login", "nobody listens", Headers::new(), PublishOptions::default())
        .await
        .unwrap();

    assert_matches!(
        pending.error.await,
        Ok(Error::Publish { subject, source: courier_pubsub_memory::Error::NoStreamForSubject(_) })
            if subject == "audit.login"
    );
    assert!(pending.ack.await.is_err());

    tokio::task::yield_now().await;
    assert_eq!(manager.available_publish_slots(), slots);
}

#[tokio::test(start_paused = true)]
async fn async_publish_window_applies_backpressure() {
    let manager = manager_with(
        MemoryBrokerOptions {
            ack_latency: Duration::from_secs(1),
            ..MemoryBrokerOptions::default()
        },
        ManagerConfig {
            publish_async_max_pending: 2,
            ..ManagerConfig::default()
        },
    );
    manager.resolve_stream("chat.group.42", "chat").await.unwrap();

    let first = manager
        .publish_async("chat.group.42", "1", Headers::new(), PublishOptions::default())
        .await
        .unwrap();
    let second = manager
        .publish_async("chat.group.42", "2", Headers::new(), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(manager.available_publish_slots(), 0);

    let blocked = timeout(
        Duration::from_millis(100),
        manager.publish_async("chat.group.42", "3", Headers::new(), PublishOptions::default()),
    )
    .await;
    assert!(blocked.is_err());

    assert_eq!(first.wait().await.unwrap().sequence, 1);
    assert_eq!(second.wait().await.unwrap().sequence, 2);

    let third = manager
        .publish_async("chat.group.42", "3", Headers::new(), PublishOptions::default())
        .await
        .unwrap();
    assert_eq!(third.wait().await.unwrap().sequence, 3);
}

#[tokio::test]
async fn manager_cell_initializes_once() {
    let cell = Arc::new(ManagerCell::<MemoryBroker>::new());
    let builds = Arc::new(AtomicUsize::new(0));
    assert!(cell.get().is_none());

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let cell = cell.clone();
        let builds = builds.clone();
        tasks.push(tokio::spawn(async move {
            cell.get_or_try_init(|| async {
                builds.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok::<_, HandlerFailed>(manager())
            })
            .await
            .map(|manager| manager.config().stream_replicas)
        }));
    }

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), 1);
    }
    assert_eq!(builds.load(Ordering::SeqCst), 1);
    assert!(cell.get().is_some());
}
