//! Durable publisher
//!
//! Publishes directly while the broker is reachable. On any send failure the
//! message goes to the memory queue, which spills into the overflow store
//! when full. On recovery the backlog is replayed: overflow store first,
//! then memory queue, each oldest first.
//!
//! All queue and store access is serialized behind one async mutex. A drain
//! holds it for the whole replay, so producers wait instead of overtaking
//! buffered messages.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{BufferConfig, DirectoryClaim};
use crate::connection::BrokerConnection;
use crate::error::{Result, SendError, StoreError};
use crate::memory_queue::MemoryQueue;
use crate::message::OutboundMessage;
use crate::overflow::OverflowStore;

/// Publisher counters
#[derive(Debug, Default)]
pub struct PublisherStats {
    /// Messages delivered on the first attempt
    pub published: AtomicU64,
    /// Messages that went to the memory queue
    pub buffered: AtomicU64,
    /// Messages written to the overflow store
    pub spilled: AtomicU64,
    /// Buffered messages delivered during recovery
    pub replayed: AtomicU64,
    /// Messages lost to limits or persistence failures
    pub dropped: AtomicU64,
}

impl PublisherStats {
    /// Get a snapshot of current stats
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            buffered: self.buffered.load(Ordering::Relaxed),
            spilled: self.spilled.load(Ordering::Relaxed),
            replayed: self.replayed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of publisher statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublisherStatsSnapshot {
    pub published: u64,
    pub buffered: u64,
    pub spilled: u64,
    pub replayed: u64,
    pub dropped: u64,
}

/// Failed reads of the same head segment before it is given up
const MAX_SEGMENT_READ_FAILURES: u32 = 3;

struct BufferState {
    queue: MemoryQueue,
    store: Option<OverflowStore>,
    /// Consecutive failed reads of the head segment
    read_failures: u32,
}

impl BufferState {
    fn has_backlog(&self) -> bool {
        !self.queue.is_empty() || self.store.as_ref().is_some_and(|s| !s.is_empty())
    }
}

struct Shared {
    pid: String,
    config: BufferConfig,
    connection: Arc<dyn BrokerConnection>,
    state: Mutex<BufferState>,
    stats: PublisherStats,
    drain_requested: Notify,
    recovery_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    shut_down: AtomicBool,
    _claim: Option<DirectoryClaim>,
}

/// Reliable fire-and-forget publisher for one outbound channel.
///
/// `publish` never returns an error: failures turn into buffering, or into a
/// logged and counted loss when local limits are exhausted.
pub struct DurablePublisher {
    shared: Arc<Shared>,
}

impl DurablePublisher {
    /// Validate `config`, claim the persistence directory and open the
    /// overflow store left by a previous run, if any.
    pub fn new(
        pid: impl Into<String>,
        config: BufferConfig,
        connection: Arc<dyn BrokerConnection>,
    ) -> Result<Self> {
        let pid = pid.into();
        config.validate()?;

        let claim = config
            .persistence_directory
            .as_deref()
            .map(DirectoryClaim::acquire)
            .transpose()?;

        let store = match (&claim, config.overflow_enabled()) {
            (Some(claim), true) => Some(OverflowStore::open(
                claim.path(),
                config.max_segments,
                config.max_segment_bytes,
            )?),
            _ => None,
        };

        if config.buffering_disabled() {
            warn!(
                pid = %pid,
                "Buffering disabled (max_buffer_bytes = 0), failed sends will be dropped"
            );
        }
        info!(
            pid = %pid,
            max_buffer_bytes = config.max_buffer_bytes,
            max_segments = config.max_segments,
            overflow = store.is_some(),
            "Durable publisher created"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                pid,
                config,
                connection,
                state: Mutex::new(BufferState {
                    queue: MemoryQueue::new(),
                    store,
                    read_failures: 0,
                }),
                stats: PublisherStats::default(),
                drain_requested: Notify::new(),
                recovery_task: parking_lot::Mutex::new(None),
                shut_down: AtomicBool::new(false),
                _claim: claim,
            }),
        })
    }

    pub fn pid(&self) -> &str {
        &self.shared.pid
    }

    pub fn config(&self) -> &BufferConfig {
        &self.shared.config
    }

    /// Start listening for recovery events. Must be called within a tokio
    /// runtime. If the connection is already up, a backlog left by a previous
    /// run is replayed right away. Calling it again has no effect.
    pub fn start(&self) {
        let mut task = self.shared.recovery_task.lock();
        if task.is_some() || self.shared.shut_down.load(Ordering::Acquire) {
            return;
        }

        // Subscribe before checking the state so no recovery is missed
        let mut listener = self.shared.connection.subscribe_recovery();
        let shared = Arc::clone(&self.shared);

        *task = Some(tokio::spawn(async move {
            if shared.connection.is_connected() {
                shared.drain().await;
            }
            loop {
                tokio::select! {
                    event = listener.recv() => match event {
                        Ok(event) => {
                            debug!(pid = %shared.pid, generation = event.generation, "Connection recovered");
                        },
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(pid = %shared.pid, skipped, "Recovery events lagged");
                        },
                        Err(RecvError::Closed) => {
                            debug!(pid = %shared.pid, "Recovery channel closed");
                            break;
                        },
                    },
                    _ = shared.drain_requested.notified() => {},
                }
                shared.drain().await;
            }
        }));
        debug!(pid = %self.shared.pid, "Recovery listener started");
    }

    /// Publish a message. Never fails from the caller's point of view.
    pub async fn publish(&self, routing_key: impl Into<String>, payload: impl Into<Bytes>) {
        let msg = OutboundMessage::new(routing_key, payload);
        self.shared.publish(msg).await;
    }

    /// Replay everything buffered. Normally driven by recovery events after
    /// `start`; returns the number of messages delivered.
    pub async fn on_recovered(&self) -> u64 {
        self.shared.drain().await
    }

    /// Stop the recovery listener and move the memory queue to disk.
    ///
    /// Waits for a running drain to finish. Without an overflow store the
    /// memory queue is discarded with a warning. Idempotent.
    pub async fn shutdown(&self) {
        if self.shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.shared.state.lock().await;
        if let Some(task) = self.shared.recovery_task.lock().take() {
            task.abort();
        }

        let state = &mut *guard;
        match state.store.as_mut() {
            Some(store) => {
                let pending = state.queue.len();
                if let Err(e) = store.compact() {
                    warn!(pid = %self.shared.pid, error = %e, "Overflow compaction failed");
                }
                self.shared.spill(&mut state.queue, store);
                if !state.queue.is_empty() {
                    let lost = state.queue.clear() as u64;
                    self.shared.stats.dropped.fetch_add(lost, Ordering::Relaxed);
                    error!(pid = %self.shared.pid, lost, "Could not persist buffered messages at shutdown");
                }
                info!(
                    pid = %self.shared.pid,
                    flushed = pending,
                    on_disk = store.record_count(),
                    "Publisher shut down"
                );
            },
            None => {
                let lost = state.queue.clear() as u64;
                if lost > 0 {
                    self.shared.stats.dropped.fetch_add(lost, Ordering::Relaxed);
                    warn!(
                        pid = %self.shared.pid,
                        lost,
                        "No overflow store configured, discarding buffered messages at shutdown"
                    );
                } else {
                    info!(pid = %self.shared.pid, "Publisher shut down");
                }
            },
        }
    }

    pub fn stats(&self) -> &PublisherStats {
        &self.shared.stats
    }

    /// Payload bytes held in the memory queue
    pub async fn buffered_bytes(&self) -> u64 {
        self.shared.state.lock().await.queue.peek_size()
    }

    /// Messages held in the memory queue
    pub async fn buffered_messages(&self) -> usize {
        self.shared.state.lock().await.queue.len()
    }

    /// Unreplayed records in the overflow store
    pub async fn stored_messages(&self) -> u64 {
        let state = self.shared.state.lock().await;
        state.store.as_ref().map_or(0, OverflowStore::record_count)
    }
}

impl Drop for DurablePublisher {
    fn drop(&mut self) {
        if let Some(task) = self.shared.recovery_task.lock().take() {
            task.abort();
        }
    }
}

impl Shared {
    async fn publish(&self, msg: OutboundMessage) {
        if self.shut_down.load(Ordering::Acquire) {
            let mut state = self.state.lock().await;
            self.persist_after_shutdown(&mut state, &msg);
            return;
        }

        // Anything still buffered goes out first
        let backlog = self.state.lock().await.has_backlog();
        if !backlog {
            match self.try_send(&msg).await {
                Ok(()) => {
                    self.stats.published.fetch_add(1, Ordering::Relaxed);
                    return;
                },
                Err(e) => {
                    debug!(
                        pid = %self.pid,
                        routing_key = msg.routing_key(),
                        error = %e,
                        "Send failed, buffering"
                    );
                },
            }
        }

        let mut state = self.state.lock().await;
        self.buffer_message(&mut state, msg);
        drop(state);

        if backlog && self.connection.is_connected() {
            self.drain_requested.notify_one();
        }
    }

    async fn try_send(&self, msg: &OutboundMessage) -> std::result::Result<(), SendError> {
        if !self.connection.is_connected() {
            return Err(SendError::NotConnected(self.connection.state().to_string()));
        }
        let timeout = self.config.send_timeout();
        match tokio::time::timeout(
            timeout,
            self.connection.send(msg.routing_key(), msg.payload()),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(SendError::Timeout(timeout)),
        }
    }

    fn buffer_message(&self, state: &mut BufferState, msg: OutboundMessage) {
        // Shutdown may have flushed the queue while this call waited for the lock
        if self.shut_down.load(Ordering::Acquire) {
            self.persist_after_shutdown(state, &msg);
            return;
        }

        let max = self.config.max_buffer_bytes;
        let len = msg.payload_len();

        if self.config.buffering_disabled() {
            self.drop_message(&msg, "buffering disabled");
            return;
        }

        if state.queue.peek_size() + len <= max {
            state.queue.enqueue(msg);
            self.stats.buffered.fetch_add(1, Ordering::Relaxed);
            return;
        }

        if let Some(store) = state.store.as_mut() {
            self.spill(&mut state.queue, store);

            if state.queue.peek_size() + len <= max {
                state.queue.enqueue(msg);
                self.stats.buffered.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if state.queue.is_empty() {
                // Larger than the RAM cap on its own
                self.append_to_store(store, &msg);
                return;
            }
            // Store is failing; older queued messages keep their place
            self.drop_message(&msg, "overflow store unavailable, memory queue full");
            return;
        }

        if len > max {
            self.drop_message(&msg, "message larger than max_buffer_bytes");
            return;
        }
        while state.queue.peek_size() + len > max {
            match state.queue.dequeue_oldest() {
                Some(evicted) => self.drop_message(&evicted, "memory queue full, dropped oldest"),
                None => break,
            }
        }
        state.queue.enqueue(msg);
        self.stats.buffered.fetch_add(1, Ordering::Relaxed);
    }

    /// Move the memory queue to disk, oldest first. Stops at the first I/O
    /// failure; messages not yet written stay in memory.
    fn spill(&self, queue: &mut MemoryQueue, store: &mut OverflowStore) {
        let evicted_before = store.evicted_records();
        let mut spilled = 0u64;

        while let Some(head) = queue.peek_oldest() {
            match store.append(head) {
                Ok(()) => {
                    queue.dequeue_oldest();
                    spilled += 1;
                },
                Err(StoreError::RecordTooLarge { size, limit }) => {
                    if let Some(msg) = queue.dequeue_oldest() {
                        error!(
                            pid = %self.pid,
                            routing_key = msg.routing_key(),
                            size,
                            limit,
                            "Message too large for overflow segment, dropped"
                        );
                        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                    }
                },
                Err(e) => {
                    error!(
                        pid = %self.pid,
                        error = %e,
                        remaining = queue.len(),
                        "Spill to overflow store failed, keeping messages in memory"
                    );
                    break;
                },
            }
        }

        if spilled > 0 {
            if let Err(e) = store.sync() {
                warn!(pid = %self.pid, error = %e, "Overflow sync failed");
            }
            self.stats.spilled.fetch_add(spilled, Ordering::Relaxed);
            debug!(pid = %self.pid, spilled, on_disk = store.record_count(), "Spilled memory queue to disk");
        }
        self.count_evictions(store, evicted_before);
    }

    fn append_to_store(&self, store: &mut OverflowStore, msg: &OutboundMessage) {
        let evicted_before = store.evicted_records();
        match store.append(msg).and_then(|()| store.sync()) {
            Ok(()) => {
                self.stats.spilled.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                error!(
                    pid = %self.pid,
                    routing_key = msg.routing_key(),
                    bytes = msg.payload_len(),
                    error = %e,
                    "Could not persist message, dropped"
                );
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            },
        }
        self.count_evictions(store, evicted_before);
    }

    fn count_evictions(&self, store: &OverflowStore, before: u64) {
        let lost = store.evicted_records().saturating_sub(before);
        if lost > 0 {
            self.stats.dropped.fetch_add(lost, Ordering::Relaxed);
        }
    }

    fn drop_message(&self, msg: &OutboundMessage, reason: &str) {
        error!(
            pid = %self.pid,
            routing_key = msg.routing_key(),
            bytes = msg.payload_len(),
            reason,
            "Message dropped"
        );
        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn persist_after_shutdown(&self, state: &mut BufferState, msg: &OutboundMessage) {
        match state.store.as_mut() {
            Some(store) => self.append_to_store(store, msg),
            None => self.drop_message(msg, "publisher shut down"),
        }
    }

    /// Replay the backlog. Stops at the first failed send; the failed
    /// message keeps its place at the head of its buffer.
    async fn drain(&self) -> u64 {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;
        if !state.has_backlog() {
            return 0;
        }

        info!(
            pid = %self.pid,
            in_memory = state.queue.len(),
            on_disk = state.store.as_ref().map_or(0, OverflowStore::record_count),
            "Replaying buffered messages"
        );

        let mut replayed = 0u64;
        let completed = self.drain_store(state, &mut replayed).await
            && self.drain_memory(state, &mut replayed).await;

        self.stats.replayed.fetch_add(replayed, Ordering::Relaxed);
        if completed {
            info!(pid = %self.pid, replayed, "Replay complete");
        } else {
            warn!(
                pid = %self.pid,
                replayed,
                in_memory = state.queue.len(),
                on_disk = state.store.as_ref().map_or(0, OverflowStore::record_count),
                "Replay interrupted, remaining messages wait for the next recovery"
            );
        }
        replayed
    }

    async fn drain_store(&self, state: &mut BufferState, replayed: &mut u64) -> bool {
        let Some(store) = state.store.as_mut() else {
            return true;
        };

        while let Some(segment) = store.list_segments().first().copied() {
            let mut read_error = None;
            let mut drain = store.iterate(segment);
            while let Some(item) = drain.next() {
                let msg = match item {
                    Ok(msg) => msg,
                    Err(StoreError::Corrupt { lost_records, .. }) => {
                        self.stats.dropped.fetch_add(lost_records, Ordering::Relaxed);
                        continue;
                    },
                    Err(e) => {
                        read_error = Some(e);
                        break;
                    },
                };

                if let Err(e) = self.try_send(&msg).await {
                    drain.requeue_last();
                    debug!(pid = %self.pid, routing_key = msg.routing_key(), error = %e, "Replay send failed");
                    return false;
                }
                *replayed += 1;
                self.throttle(*replayed).await;
            }
            drop(drain);

            if let Some(e) = read_error {
                state.read_failures += 1;
                if !e.is_not_found() && state.read_failures < MAX_SEGMENT_READ_FAILURES {
                    error!(
                        pid = %self.pid,
                        error = %e,
                        attempt = state.read_failures,
                        "Reading overflow store failed"
                    );
                    return false;
                }
                error!(pid = %self.pid, error = %e, %segment, "Overflow segment unreadable, discarding it");
                state.read_failures = 0;
                let evicted_before = store.evicted_records();
                if let Err(e) = store.discard_head() {
                    warn!(pid = %self.pid, error = %e, "Failed to clean up discarded segment");
                }
                self.count_evictions(store, evicted_before);
                continue;
            }
            state.read_failures = 0;

            if store.list_segments().first() == Some(&segment) {
                // Segment could not be consumed
                return false;
            }
        }
        true
    }

    async fn drain_memory(&self, state: &mut BufferState, replayed: &mut u64) -> bool {
        while let Some(msg) = state.queue.dequeue_oldest() {
            if let Err(e) = self.try_send(&msg).await {
                debug!(pid = %self.pid, routing_key = msg.routing_key(), error = %e, "Replay send failed");
                state.queue.requeue_front(msg);
                return false;
            }
            *replayed += 1;
            self.throttle(*replayed).await;
        }
        true
    }

    async fn throttle(&self, replayed: u64) {
        let chunk = self.config.recovery_chunk_size as u64;
        let delay = self.config.recovery_delay();
        if chunk > 0 && !delay.is_zero() && replayed % chunk == 0 {
            tokio::time::sleep(delay).await;
        }
    }
}
