//! Command line front end for courier over NATS.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::time::Duration;

use bytes::Bytes;
use clap::{Args, Parser, Subcommand, ValueEnum};
use courier::{
    HandlerFailure, MessageContext, PubSub, PubSubConfig, PublishExtras, Subject,
    UndecodablePolicy, handler_fn,
};
use courier_broker_nats::NatsBroker;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

type PubSubError = courier::Error<courier_broker_nats::Error>;

#[derive(Debug, Error)]
enum Error {
    #[error(transparent)]
    PubSub(#[from] PubSubError),

    #[error("key {key} not found in bucket {bucket}")]
    KeyNotFound { bucket: String, key: String },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Undecodable {
    Drop,
    Redeliver,
}

impl From<Undecodable> for UndecodablePolicy {
    fn from(value: Undecodable) -> Self {
        match value {
            Undecodable::Drop => Self::Drop,
            Undecodable::Redeliver => Self::Redeliver,
        }
    }
}

#[derive(Clone, Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Comma separated broker addresses
    #[arg(
        long,
        default_value = "nats://127.0.0.1:4222",
        env = "COURIER_SERVERS",
        value_delimiter = ','
    )]
    servers: Vec<String>,

    /// Number of pooled connections
    #[arg(long, default_value_t = 1, env = "COURIER_POOL_SIZE")]
    pool_size: usize,

    /// Connection display name
    #[arg(long, default_value = "courier-cli", env = "COURIER_CONNECTION_NAME")]
    connection_name: String,

    /// Username, requires a password
    #[arg(long, env = "COURIER_USERNAME", requires = "password")]
    username: Option<String>,

    /// Password, requires a username
    #[arg(long, env = "COURIER_PASSWORD", requires = "username")]
    password: Option<String>,

    /// How long an unhealthy connection is given to recover, in milliseconds
    #[arg(long, default_value_t = 3_000, env = "COURIER_CONNECT_WAIT_MS")]
    connect_wait_ms: u64,

    /// Redelivery delay after a handler error, in milliseconds
    #[arg(long, default_value_t = 5_000, env = "COURIER_HANDLER_RETRY_WAIT_MS")]
    handler_retry_wait_ms: u64,

    /// Deliveries handled concurrently per subscription
    #[arg(long, default_value_t = 1, env = "COURIER_HANDLER_CONCURRENCY")]
    handler_concurrency: usize,

    /// Fate of payloads that cannot be decoded
    #[arg(long, value_enum, default_value = "drop", env = "COURIER_UNDECODABLE")]
    undecodable: Undecodable,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn config(&self) -> PubSubConfig {
        PubSubConfig {
            pool_size: self.pool_size,
            servers: self.servers.clone(),
            connection_name: self.connection_name.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            connect_wait_ms: self.connect_wait_ms,
            handler_retry_wait_ms: self.handler_retry_wait_ms,
            handler_concurrency: self.handler_concurrency,
            undecodable: self.undecodable.into(),
            ..PubSubConfig::default()
        }
    }
}

#[derive(Clone, Debug, Args)]
struct SubjectArgs {
    /// Category, which names the stream
    #[arg(long)]
    category: String,

    /// Routable subject name
    #[arg(long)]
    name: String,

    /// Queue group sharing the subscription
    #[arg(long)]
    group: Option<String>,
}

impl SubjectArgs {
    fn subject(&self) -> Result<Subject, PubSubError> {
        let subject = Subject::new(&self.category, &self.name)?;

        Ok(match &self.group {
            Some(group) => subject.with_group(group),
            None => subject,
        })
    }
}

#[derive(Clone, Debug, Subcommand)]
enum Command {
    /// Publish a UTF-8 payload
    Publish {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Deliver no earlier than this many milliseconds from now
        #[arg(long)]
        delay_ms: Option<u64>,

        /// Tag restricting which tag consumers handle the message
        #[arg(long)]
        tag: Option<String>,

        /// Payload
        payload: String,
    },

    /// Print messages of a subject until interrupted
    Tail {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Only handle messages with this tag, or untagged ones
        #[arg(long, conflicts_with = "wait_on_not_due_ms")]
        tag: Option<String>,

        /// Honour delay headers, pausing this long after a message that is not due
        #[arg(long)]
        wait_on_not_due_ms: Option<u64>,
    },

    /// Delete the durable consumer of a subject
    Unsubscribe {
        #[command(flatten)]
        subject: SubjectArgs,

        /// Tag of the consumer
        #[arg(long)]
        tag: Option<String>,
    },

    /// List every stream
    Streams,

    /// Delete the stream of a category
    DeleteStream {
        #[command(flatten)]
        subject: SubjectArgs,
    },

    /// Delete every stream
    DeleteAllStreams,

    /// Store a value in a key/value bucket
    KvPut {
        /// Bucket name
        bucket: String,

        /// Key
        key: String,

        /// Value
        value: String,
    },

    /// Read a value from a key/value bucket
    KvGet {
        /// Bucket name
        bucket: String,

        /// Key
        key: String,
    },
}

#[tokio::main(worker_threads = 4)]
async fn main() -> Result<(), Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    let shutdown_token = CancellationToken::new();

    // Set up signal handlers
    let signal_shutdown_token = shutdown_token.clone();
    tokio::spawn(async move {
        wait_for_signal().await;

        info!("Shutting down");
        signal_shutdown_token.cancel();
    });

    let pubsub = PubSub::connect(&NatsBroker::new(), cli.config()).await?;

    let result = run(&pubsub, cli.command, shutdown_token).await;
    pubsub.close().await?;

    result
}

async fn run(
    pubsub: &PubSub<NatsBroker>,
    command: Command,
    shutdown_token: CancellationToken,
) -> Result<(), Error> {
    match command {
        Command::Publish {
            subject,
            delay_ms,
            tag,
            payload,
        } => {
            let extras = PublishExtras {
                trace: None,
                delay: delay_ms.map(Duration::from_millis),
                tag,
            };
            let ack = pubsub
                .publish_with(&subject.subject()?, payload, extras)
                .await?;

            println!("{} #{}", ack.stream, ack.sequence);
        }
        Command::Tail {
            subject,
            tag,
            wait_on_not_due_ms,
        } => {
            let subject = subject.subject()?;
            let handler = handler_fn(print_message);

            let subscription = match (tag, wait_on_not_due_ms) {
                (Some(tag), _) => pubsub.subscribe_with_tag(&subject, &tag, handler).await?,
                (None, Some(wait)) => {
                    pubsub
                        .subscribe_delay(&subject, Duration::from_millis(wait), handler)
                        .await?
                }
                (None, None) => pubsub.subscribe(&subject, handler).await?,
            };

            shutdown_token.cancelled().await;
            subscription.stop();
        }
        Command::Unsubscribe { subject, tag } => {
            pubsub
                .unsubscribe(&subject.subject()?, tag.as_deref())
                .await?;
        }
        Command::Streams => {
            for name in pubsub.stream_names().await? {
                println!("{name}");
            }
        }
        Command::DeleteStream { subject } => {
            pubsub.delete_stream(&subject.subject()?).await?;
        }
        Command::DeleteAllStreams => {
            let count = pubsub.delete_all_streams().await?;
            println!("deleted {count} streams");
        }
        Command::KvPut { bucket, key, value } => {
            let revision = pubsub
                .bucket(&bucket)
                .await?
                .put_string(&key, &value)
                .await?;

            println!("revision {revision}");
        }
        Command::KvGet { bucket, key } => {
            let value = pubsub.bucket(&bucket).await?.get_string(&key).await?;

            match value {
                Some(value) => println!("{value}"),
                None => return Err(Error::KeyNotFound { bucket, key }),
            }
        }
    }

    Ok(())
}

async fn print_message(context: MessageContext, payload: Bytes) -> Result<(), HandlerFailure> {
    println!(
        "[{}] {} (delivery {}): {}",
        context.trace,
        context.subject,
        context.delivery_count,
        String::from_utf8_lossy(&payload)
    );

    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM"),
                _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
            }
        }
        Err(error) => {
            warn!(%error, "SIGTERM handler failed, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
            info!("Received interrupt signal");
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Received interrupt signal");
}
