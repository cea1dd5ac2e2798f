use std::convert::Infallible;

use chrono::Utc;
use courier_pubsub::JetStreamManager;
use courier_pubsub::broker::Delivery;
use courier_pubsub::consumer::{ConsumerManager, DeliverPolicy, OrderedConsumerConfig};
use courier_pubsub::message::{Headers, Message, PublishOptions};
use courier_pubsub::publisher::Publisher;
use courier_pubsub::stream::{StreamConfig, StreamManager};
use courier_pubsub::subscriber::{DeliveryExhausted, SubscribeParams, Subscriber};
use courier_pubsub_nats::NatsBroker;
use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::Error;
use crate::args::{Command, ConsumerCommand, PublishArgs, StreamCommand, SubscribeArgs, TailArgs};

type Manager = JetStreamManager<NatsBroker>;

pub async fn run(
    manager: &Manager,
    command: Command,
    shutdown_token: CancellationToken,
) -> Result<(), Error> {
    match command {
        Command::Stream(command) => stream(manager, command).await,
        Command::Consumer(command) => consumer(manager, command).await,
        Command::Publish(args) => publish(manager, args).await,
        Command::Subscribe(args) => subscribe(manager, args, shutdown_token).await,
        Command::Tail(args) => tail(manager, args, shutdown_token).await,
    }
}

fn print<T: Serialize>(value: &T) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn stream(manager: &Manager, command: StreamCommand) -> Result<(), Error> {
    match command {
        StreamCommand::Create {
            name,
            subjects,
            storage,
        } => {
            let config = StreamConfig {
                name,
                subjects,
                storage: storage.into(),
                num_replicas: manager.config().stream_replicas,
                ..StreamConfig::default()
            };
            print(&manager.create_or_update_stream(config).await?)
        }
        StreamCommand::Info { name } => print(&manager.stream_by_name(&name).await?),
        StreamCommand::Lookup { subject } => print(&manager.stream_by_subject(&subject).await?),
        StreamCommand::Delete { name } => {
            manager.delete_stream(&name).await?;
            info!(stream = %name, "stream deleted");
            Ok(())
        }
    }
}

async fn consumer(manager: &Manager, command: ConsumerCommand) -> Result<(), Error> {
    match command {
        ConsumerCommand::Info(target) => {
            print(&manager.consumer_by_stream(&target.stream, &target.consumer).await?)
        }
        ConsumerCommand::Pause { consumer, secs } => {
            let until = Utc::now() + chrono::Duration::seconds(secs);
            manager
                .pause_consumer(&consumer.stream, &consumer.consumer, until)
                .await?;
            info!(stream = %consumer.stream, consumer = %consumer.consumer, until = %until, "consumer paused");
            Ok(())
        }
        ConsumerCommand::Resume(target) => {
            manager
                .resume_consumer(&target.stream, &target.consumer)
                .await?;
            info!(stream = %target.stream, consumer = %target.consumer, "consumer resumed");
            Ok(())
        }
        ConsumerCommand::Delete(target) => {
            manager
                .delete_consumer(&target.stream, &target.consumer)
                .await?;
            info!(stream = %target.stream, consumer = %target.consumer, "consumer deleted");
            Ok(())
        }
    }
}

fn parse_headers(raw: &[String]) -> Result<Headers, Error> {
    let mut headers = Headers::new();

    for entry in raw {
        let (key, value) = entry
            .split_once('=')
            .filter(|(key, _)| !key.is_empty())
            .ok_or_else(|| Error::InvalidHeader(entry.clone()))?;
        headers.append(key, value);
    }

    Ok(headers)
}

fn parse_payload(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

async fn publish(manager: &Manager, args: PublishArgs) -> Result<(), Error> {
    if let Some(stream) = &args.stream {
        manager.resolve_stream(&args.subject, stream).await?;
    }

    let headers = parse_headers(&args.headers)?;
    let payload = parse_payload(args.payload);

    let Some(repeat) = args.repeat else {
        let options = PublishOptions {
            message_id: args.message_id,
            expected_stream: args.stream,
        };
        let ack = manager
            .publish(&args.subject, &payload, headers, options)
            .await?;
        return print(&ack);
    };

    let mut pending = Vec::with_capacity(repeat);
    for n in 0..repeat {
        let options = PublishOptions {
            message_id: args.message_id.as_ref().map(|id| format!("{id}-{n}")),
            expected_stream: args.stream.clone(),
        };
        pending.push(
            manager
                .publish_async(&args.subject, &payload, headers.clone(), options)
                .await?,
        );
    }

    for publish in pending {
        print(&publish.wait().await?)?;
    }

    Ok(())
}

fn render(message: &Message) -> Value {
    message
        .json::<Value>()
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&message.payload).into_owned()))
}

async fn subscribe(
    manager: &Manager,
    args: SubscribeArgs,
    shutdown_token: CancellationToken,
) -> Result<(), Error> {
    let (exhausted_sender, mut exhausted) = mpsc::unbounded_channel::<DeliveryExhausted>();
    tokio::spawn(async move {
        while let Some(event) = exhausted.recv().await {
            warn!(
                stream = %event.stream,
                consumer = %event.consumer,
                subject = %event.subject,
                sequence = event.stream_sequence,
                deliveries = event.deliveries,
                error = %event.error,
                "message dropped after exhausting deliveries"
            );
        }
    });

    let params = SubscribeParams {
        filter_subject: args.filter_subject.unwrap_or_else(|| args.subject.clone()),
        stream: args.stream,
        consumer: args.consumer,
        exhausted: Some(exhausted_sender),
    };

    let handler = |message: Message| async move {
        println!("{} {}", message.subject, render(&message));
        Ok::<(), Infallible>(())
    };

    match manager
        .subscribe(&args.subject, handler, params, shutdown_token)
        .await
    {
        Err(courier_pubsub::Error::Cancelled) => Ok(()),
        result => result.map_err(Error::from),
    }
}

async fn tail(
    manager: &Manager,
    args: TailArgs,
    shutdown_token: CancellationToken,
) -> Result<(), Error> {
    let config = OrderedConsumerConfig {
        filter_subjects: args.subjects,
        deliver_policy: if args.from_start {
            DeliverPolicy::All
        } else {
            DeliverPolicy::New
        },
        ..OrderedConsumerConfig::default()
    };

    let mut deliveries = manager.ordered_consumer(&args.stream, config).await?;

    loop {
        let delivery = tokio::select! {
            () = shutdown_token.cancelled() => return Ok(()),
            next = deliveries.next() => match next {
                Some(delivery) => delivery?,
                None => return Ok(()),
            },
        };

        let info = delivery.info();
        let message = delivery.message();
        println!(
            "[{}] {} {}",
            info.stream_sequence,
            message.subject,
            render(message)
        );
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn headers_parse_key_value_pairs() {
        let headers =
            parse_headers(&["trace=abc".to_string(), "trace=def".to_string()]).unwrap();

        assert_eq!(headers.get_all("trace"), ["abc", "def"]);
    }

    #[test]
    fn headers_reject_missing_key() {
        assert_matches!(
            parse_headers(&["=value".to_string()]),
            Err(Error::InvalidHeader(entry)) if entry == "=value"
        );
        assert_matches!(
            parse_headers(&["novalue".to_string()]),
            Err(Error::InvalidHeader(_))
        );
    }

    #[test]
    fn payload_keeps_json_and_wraps_text() {
        assert_eq!(parse_payload("{\"a\":1}".to_string()), serde_json::json!({"a": 1}));
        assert_eq!(
            parse_payload("hello".to_string()),
            Value::String("hello".to_string())
        );
    }
}
