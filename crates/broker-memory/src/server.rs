use crate::delivery::MemoryDelivery;
use crate::error::Error;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use courier_broker::{
    ConnectionStatus, ConsumerConfig, DeliverPolicy, Envelope, PublishAck, PublishOptions,
    StreamConfig,
};
use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

pub type Member = UnboundedSender<Result<MemoryDelivery, Error>>;

/// Tunables of the in-memory broker.
#[derive(Clone, Copy, Debug)]
pub struct MemoryBrokerOptions {
    /// How long a delivery may stay unsettled before it is redelivered.
    pub ack_wait: Duration,

    /// How long a publish message id is remembered for deduplication.
    pub duplicate_window: Duration,
}

impl Default for MemoryBrokerOptions {
    fn default() -> Self {
        Self {
            ack_wait: Duration::from_secs(30),
            duplicate_window: Duration::from_secs(120),
        }
    }
}

struct Stored {
    envelope: Envelope,
    stored_at: Instant,
}

struct ConsumerState {
    config: ConsumerConfig,
    ephemeral: bool,
    cursor: u64,
    redeliveries: VecDeque<u64>,
    delivery_counts: HashMap<u64, u64>,
    in_flight: usize,
    members: Vec<Member>,
    next_member: usize,
}

struct StreamState {
    config: StreamConfig,
    messages: Vec<Stored>,
    dedup: HashMap<String, (u64, Instant)>,
    consumers: BTreeMap<String, ConsumerState>,
}

pub struct State {
    streams: BTreeMap<String, StreamState>,
    buckets: HashMap<String, (u64, HashMap<String, Bytes>)>,
    connections: Vec<Arc<Mutex<ConnectionStatus>>>,
    pub refuse_connections: bool,
    pub initial_status: ConnectionStatus,
    next_ephemeral: u64,
}

/// Shared broker state. Locks are never held across an await point.
pub struct Server {
    pub options: MemoryBrokerOptions,
    pub state: Mutex<State>,
    admin_requests: AtomicUsize,
}

impl Server {
    pub fn new(options: MemoryBrokerOptions) -> Self {
        Self {
            options,
            state: Mutex::new(State {
                streams: BTreeMap::new(),
                buckets: HashMap::new(),
                connections: Vec::new(),
                refuse_connections: false,
                initial_status: ConnectionStatus::Connected,
                next_ephemeral: 0,
            }),
            admin_requests: AtomicUsize::new(0),
        }
    }

    pub fn admin_requests(&self) -> usize {
        self.admin_requests.load(Ordering::SeqCst)
    }

    fn count_admin_request(&self) {
        self.admin_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn open_connection(&self) -> Result<Arc<Mutex<ConnectionStatus>>, Error> {
        let mut state = self.state.lock();
        if state.refuse_connections {
            return Err(Error::ConnectionRefused);
        }

        let status = Arc::new(Mutex::new(state.initial_status));
        state.connections.push(status.clone());

        Ok(status)
    }

    pub fn set_all_statuses(&self, status: ConnectionStatus) {
        let state = self.state.lock();
        for connection in &state.connections {
            let mut current = connection.lock();
            if *current != ConnectionStatus::Closed {
                *current = status;
            }
        }
    }

    pub fn stream_info(&self, name: &str) -> Option<StreamConfig> {
        self.count_admin_request();

        self.stream_config(name)
    }

    pub fn stream_config(&self, name: &str) -> Option<StreamConfig> {
        self.state
            .lock()
            .streams
            .get(name)
            .map(|stream| stream.config.clone())
    }

    pub fn stream_names(&self) -> Vec<String> {
        self.state.lock().streams.keys().cloned().collect()
    }

    pub fn add_stream(&self, config: StreamConfig) -> Result<StreamConfig, Error> {
        self.count_admin_request();
        validate(&config)?;

        let mut state = self.state.lock();
        if let Some(existing) = state.streams.get(&config.name) {
            // Identical definitions are idempotent.
            if existing.config == config {
                return Ok(config);
            }
            return Err(Error::StreamNameInUse(config.name));
        }
        check_overlap(&state, &config)?;

        debug!(stream = %config.name, subjects = ?config.subjects, "stream added");
        state.streams.insert(
            config.name.clone(),
            StreamState {
                config: config.clone(),
                messages: Vec::new(),
                dedup: HashMap::new(),
                consumers: BTreeMap::new(),
            },
        );

        Ok(config)
    }

    pub fn update_stream(&self, config: StreamConfig) -> Result<StreamConfig, Error> {
        self.count_admin_request();
        validate(&config)?;

        let mut state = self.state.lock();
        if !state.streams.contains_key(&config.name) {
            return Err(Error::StreamNotFound(config.name));
        }
        check_overlap(&state, &config)?;

        if let Some(stream) = state.streams.get_mut(&config.name) {
            debug!(stream = %config.name, subjects = ?config.subjects, "stream updated");
            stream.config = config.clone();
        }

        Ok(config)
    }

    pub fn delete_stream(&self, name: &str) -> Result<(), Error> {
        self.count_admin_request();

        // Dropping the state drops every member sender, ending their deliveries.
        self.state
            .lock()
            .streams
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Error::StreamNotFound(name.to_string()))
    }

    pub fn publish(
        self: &Arc<Self>,
        envelope: Envelope,
        options: PublishOptions,
    ) -> Result<PublishAck, Error> {
        let mut state = self.state.lock();

        let stream_name = state
            .streams
            .values()
            .find(|stream| {
                stream
                    .config
                    .subjects
                    .iter()
                    .any(|pattern| subject_matches(pattern, &envelope.subject))
            })
            .map(|stream| stream.config.name.clone())
            .ok_or_else(|| Error::NoStreamForSubject(envelope.subject.clone()))?;

        if let Some(expected) = options.expected_stream {
            if expected != stream_name {
                return Err(Error::WrongStream {
                    expected,
                    actual: stream_name,
                });
            }
        }

        let window = self.options.duplicate_window;
        let Some(stream) = state.streams.get_mut(&stream_name) else {
            return Err(Error::StreamNotFound(stream_name));
        };
        stream
            .dedup
            .retain(|_, (_, published_at)| published_at.elapsed() < window);

        if let Some(message_id) = &options.message_id {
            if let Some((sequence, _)) = stream.dedup.get(message_id) {
                trace!(stream = %stream_name, %message_id, "duplicate publish discarded");
                return Ok(PublishAck {
                    stream: stream_name,
                    sequence: *sequence,
                    duplicate: true,
                });
            }
        }

        stream.messages.push(Stored {
            envelope,
            stored_at: Instant::now(),
        });
        let sequence = stream.messages.len() as u64;
        if let Some(message_id) = options.message_id {
            stream.dedup.insert(message_id, (sequence, Instant::now()));
        }

        let consumers: Vec<String> = stream.consumers.keys().cloned().collect();
        for consumer in consumers {
            self.pump(&mut state, &stream_name, &consumer);
        }

        Ok(PublishAck {
            stream: stream_name,
            sequence,
            duplicate: false,
        })
    }

    pub fn attach(self: &Arc<Self>, config: ConsumerConfig, member: Member) -> Result<String, Error> {
        let mut state = self.state.lock();

        let name = match &config.durable_name {
            Some(name) => name.clone(),
            None => {
                state.next_ephemeral += 1;
                format!("ephemeral-{}", state.next_ephemeral)
            }
        };

        let stream = state
            .streams
            .get_mut(&config.stream)
            .ok_or_else(|| Error::StreamNotFound(config.stream.clone()))?;

        if let Some(existing) = stream.consumers.get_mut(&name) {
            existing.members.retain(|m| !m.is_closed());
            if existing.config.deliver_group != config.deliver_group {
                return Err(Error::ConsumerGroupMismatch(name));
            }
            if existing.config.deliver_group.is_none() && !existing.members.is_empty() {
                return Err(Error::ConsumerInUse(name));
            }
            existing.members.push(member);
        } else {
            let cursor = start_cursor(&stream.messages, &config);
            debug!(stream = %config.stream, consumer = %name, cursor, "consumer created");
            stream.consumers.insert(
                name.clone(),
                ConsumerState {
                    ephemeral: config.durable_name.is_none(),
                    config: config.clone(),
                    cursor,
                    redeliveries: VecDeque::new(),
                    delivery_counts: HashMap::new(),
                    in_flight: 0,
                    members: vec![member],
                    next_member: 0,
                },
            );
        }

        self.pump(&mut state, &config.stream, &name);

        Ok(name)
    }

    pub fn delete_consumer(&self, stream: &str, consumer: &str) -> Result<(), Error> {
        self.count_admin_request();

        let mut state = self.state.lock();
        let stream = state
            .streams
            .get_mut(stream)
            .ok_or_else(|| Error::StreamNotFound(stream.to_string()))?;

        stream
            .consumers
            .remove(consumer)
            .map(|_| ())
            .ok_or_else(|| Error::ConsumerNotFound(consumer.to_string()))
    }

    pub fn consumer_names(&self, stream: &str) -> Vec<String> {
        self.state
            .lock()
            .streams
            .get(stream)
            .map(|stream| stream.consumers.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stream_messages(&self, stream: &str) -> Vec<Envelope> {
        self.state
            .lock()
            .streams
            .get(stream)
            .map(|stream| {
                stream
                    .messages
                    .iter()
                    .map(|stored| stored.envelope.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Marks a delivery as done and moves the consumer forward.
    pub fn settle(self: &Arc<Self>, stream: &str, consumer: &str, sequence: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        let consumer_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.consumers.get_mut(consumer))
            .ok_or_else(|| Error::ConsumerNotFound(consumer.to_string()))?;

        consumer_state.in_flight = consumer_state.in_flight.saturating_sub(1);
        consumer_state.delivery_counts.remove(&sequence);
        self.pump(&mut state, stream, consumer);

        Ok(())
    }

    /// Releases a delivery slot and queues the message for another attempt.
    pub fn requeue(self: &Arc<Self>, stream: &str, consumer: &str, sequence: u64) -> Result<(), Error> {
        let mut state = self.state.lock();
        let consumer_state = state
            .streams
            .get_mut(stream)
            .and_then(|s| s.consumers.get_mut(consumer))
            .ok_or_else(|| Error::ConsumerNotFound(consumer.to_string()))?;

        consumer_state.in_flight = consumer_state.in_flight.saturating_sub(1);
        consumer_state.redeliveries.push_back(sequence);
        self.pump(&mut state, stream, consumer);

        Ok(())
    }

    /// Releases a delivery slot now and queues the message after `delay`.
    pub fn release_later(
        self: &Arc<Self>,
        stream: &str,
        consumer: &str,
        sequence: u64,
        delay: Duration,
    ) -> Result<(), Error> {
        {
            let mut state = self.state.lock();
            let consumer_state = state
                .streams
                .get_mut(stream)
                .and_then(|s| s.consumers.get_mut(consumer))
                .ok_or_else(|| Error::ConsumerNotFound(consumer.to_string()))?;
            consumer_state.in_flight = consumer_state.in_flight.saturating_sub(1);
            self.pump(&mut state, stream, consumer);
        }

        let server = self.clone();
        let stream = stream.to_string();
        let consumer = consumer.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let mut state = server.state.lock();
            if let Some(consumer_state) = state
                .streams
                .get_mut(&stream)
                .and_then(|s| s.consumers.get_mut(&consumer))
            {
                consumer_state.redeliveries.push_back(sequence);
                server.pump(&mut state, &stream, &consumer);
            }
        });

        Ok(())
    }

    pub fn kv_put(&self, bucket: &str, key: &str, value: Bytes) -> u64 {
        let mut state = self.state.lock();
        let (revision, entries) = state.buckets.entry(bucket.to_string()).or_default();
        *revision += 1;
        entries.insert(key.to_string(), value);

        *revision
    }

    pub fn kv_get(&self, bucket: &str, key: &str) -> Option<Bytes> {
        self.state
            .lock()
            .buckets
            .get(bucket)
            .and_then(|(_, entries)| entries.get(key).cloned())
    }

    pub fn kv_create(&self, bucket: &str) {
        self.state
            .lock()
            .buckets
            .entry(bucket.to_string())
            .or_default();
    }

    /// Hands out as many deliveries as the consumer's members and in-flight bound allow.
    fn pump(self: &Arc<Self>, state: &mut State, stream_name: &str, consumer_name: &str) {
        let Some(stream) = state.streams.get_mut(stream_name) else {
            return;
        };
        let max_age = stream.config.max_age;
        let Some(consumer) = stream.consumers.get_mut(consumer_name) else {
            return;
        };

        consumer.members.retain(|m| !m.is_closed());
        let limit = usize::try_from(consumer.config.max_ack_pending)
            .ok()
            .filter(|limit| *limit > 0)
            .unwrap_or(usize::MAX);

        while consumer.in_flight < limit && !consumer.members.is_empty() {
            let sequence = if let Some(sequence) = consumer.redeliveries.pop_front() {
                sequence
            } else if let Some(sequence) = next_matching(&stream.messages, consumer) {
                consumer.cursor = sequence + 1;
                sequence
            } else {
                break;
            };

            let Some(stored) = usize::try_from(sequence - 1)
                .ok()
                .and_then(|index| stream.messages.get(index))
            else {
                continue;
            };
            if !max_age.is_zero() && stored.stored_at.elapsed() > max_age {
                consumer.delivery_counts.remove(&sequence);
                continue;
            }

            let count = consumer.delivery_counts.entry(sequence).or_insert(0);
            *count += 1;

            let delivery = MemoryDelivery::new(
                self.clone(),
                stream_name.to_string(),
                consumer_name.to_string(),
                sequence,
                stored.envelope.clone(),
                *count,
            );
            let settled = delivery.settled_flag();

            let member = &consumer.members[consumer.next_member % consumer.members.len()];
            consumer.next_member = consumer.next_member.wrapping_add(1);
            if member.send(Ok(delivery)).is_err() {
                consumer.redeliveries.push_front(sequence);
                consumer.members.retain(|m| !m.is_closed());
                continue;
            }
            consumer.in_flight += 1;

            let server = self.clone();
            let ack_wait = self.options.ack_wait;
            let stream = stream_name.to_string();
            let consumer_key = consumer_name.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(ack_wait).await;
                if !settled.swap(true, Ordering::SeqCst) {
                    trace!(%stream, consumer = %consumer_key, sequence, "ack wait expired");
                    let _ = server.requeue(&stream, &consumer_key, sequence);
                }
            });
        }

        if consumer.ephemeral && consumer.members.is_empty() {
            stream.consumers.remove(consumer_name);
        }
    }
}

fn validate(config: &StreamConfig) -> Result<(), Error> {
    if config.name.is_empty() {
        return Err(Error::InvalidStreamConfig("stream name is empty".to_string()));
    }
    if config.name.contains(['.', '*', '>', ' ']) {
        return Err(Error::InvalidStreamConfig(format!(
            "stream name {} contains illegal characters",
            config.name
        )));
    }
    if config.subjects.iter().any(String::is_empty) {
        return Err(Error::InvalidStreamConfig("empty subject".to_string()));
    }

    Ok(())
}

fn check_overlap(state: &State, config: &StreamConfig) -> Result<(), Error> {
    for other in state.streams.values() {
        if other.config.name == config.name {
            continue;
        }
        if let Some(subject) = config.subjects.iter().find(|s| other.config.has_subject(s)) {
            return Err(Error::SubjectsOverlap(subject.clone()));
        }
    }

    Ok(())
}

fn start_cursor(messages: &[Stored], config: &ConsumerConfig) -> u64 {
    let next = messages.len() as u64 + 1;
    match config.deliver_policy {
        DeliverPolicy::All => 1,
        DeliverPolicy::New => next,
        DeliverPolicy::Last => messages
            .iter()
            .rposition(|stored| filter_matches(&config.filter_subject, &stored.envelope.subject))
            .map_or(next, |index| index as u64 + 1),
    }
}

fn next_matching(messages: &[Stored], consumer: &ConsumerState) -> Option<u64> {
    let start = usize::try_from(consumer.cursor.saturating_sub(1)).ok()?;

    messages
        .iter()
        .enumerate()
        .skip(start)
        .find(|(_, stored)| filter_matches(&consumer.config.filter_subject, &stored.envelope.subject))
        .map(|(index, _)| index as u64 + 1)
}

fn filter_matches(filter: &str, subject: &str) -> bool {
    filter.is_empty() || subject_matches(filter, subject)
}

/// Token-wise subject matching with `*` (one token) and `>` (one or more trailing tokens).
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
