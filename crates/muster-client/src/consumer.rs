//! Per-topic consumption
//!
//! Each subscribed topic gets one worker task that owns the topic's
//! partition readers across generations, mixes their messages into a single
//! application-facing channel, tracks acknowledgements per partition with an
//! [`AckTracker`], and commits acknowledged offsets — periodically, at every
//! generation change, and on close.
//!
//! ```text
//!  partition readers          topic worker               application
//!  ┌────────────┐  intake  ┌──────────────────┐ messages ┌──────────┐
//!  │ stream p0  ├────┐     │ track delivery    ├─────────►│ recv     │
//!  │ stream p1  ├────┼────►│ track acks        │   acks   │ done()   │
//!  │ stream p2  ├────┘     │ reconcile/commit  │◄─────────┤          │
//!  └────────────┘          └──────────────────┘           └──────────┘
//! ```
//!
//! The application channel has capacity 1: a slow application blocks the
//! worker, a blocked worker stops draining the intake, and full intake
//! blocks the partition readers — back-pressure reaches the broker fetches.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use muster_protocol::{
    Broker, ConsumerMessage, OffsetCommitRequest, OffsetFetchRequest, PartitionStream, TopicSource,
};

use crate::client::{Command, GenerationAssignment};
use crate::config::GroupConfig;
use crate::error::ClientError;
use crate::tracker::AckTracker;

/// A consumer of one topic within the group.
///
/// Messages from every partition currently assigned to this member arrive
/// on the channel returned by [`messages`](TopicConsumer::messages), in
/// partition order per partition and no particular order across partitions.
/// Every received message must eventually be passed to
/// [`done`](TopicConsumer::done); that acknowledgement is what lets the
/// worker advance the committed offset past it.
///
/// Call [`async_close`](TopicConsumer::async_close) to stop consuming, then
/// keep draining the message and error channels until both close.
pub struct TopicConsumer {
    topic: String,
    messages: Option<mpsc::Receiver<ConsumerMessage>>,
    errors: Option<mpsc::Receiver<ClientError>>,
    acks: mpsc::UnboundedSender<Ack>,
    close: CancellationToken,
}

impl TopicConsumer {
    /// The subscribed topic.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Take the message channel. The channel closes once the consumer has
    /// finished closing. May be called once; later calls return a channel
    /// that is already closed.
    pub fn messages(&mut self) -> mpsc::Receiver<ConsumerMessage> {
        self.messages.take().unwrap_or_else(closed_receiver)
    }

    /// Take the error channel. It carries partition-stream errors and
    /// offset fetch/commit errors, none of which stop consumption. Closes
    /// together with the message channel.
    pub fn errors(&mut self) -> mpsc::Receiver<ClientError> {
        self.errors.take().unwrap_or_else(closed_receiver)
    }

    /// Acknowledge that `msg` has been fully processed, allowing its offset
    /// to count toward the next commit. Acknowledging a message twice, or a
    /// message this consumer never delivered, has no defined effect on
    /// commit progress (it is dropped or mis-counted, never a crash).
    pub fn done(&self, msg: &ConsumerMessage) {
        let _ = self.acks.send(Ack {
            partition: msg.partition,
            offset: msg.offset,
        });
    }

    /// Begin closing the consumer. Idempotent. The worker commits the
    /// acknowledged offsets of every owned partition, then closes the
    /// message and error channels.
    pub fn async_close(&self) {
        self.close.cancel();
    }
}

/// One acknowledgement from the application.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Ack {
    partition: i32,
    offset: i64,
}

/// The coordination task's handle on one topic worker.
pub(crate) struct WorkerHandle {
    pub(crate) id: u64,
    pub(crate) assign_tx: watch::Sender<Option<Arc<GenerationAssignment>>>,
    pub(crate) close: CancellationToken,
    pub(crate) task: JoinHandle<()>,
}

/// Everything needed to start one topic worker.
pub(crate) struct WorkerSpec {
    pub(crate) id: u64,
    pub(crate) group: String,
    pub(crate) topic: String,
    pub(crate) config: GroupConfig,
    pub(crate) source: Box<dyn TopicSource>,
    pub(crate) cmd_tx: mpsc::Sender<Command>,
}

/// Spawn the worker task for one topic. Returns the application handle and
/// the coordination-side handle.
pub(crate) fn spawn_worker(spec: WorkerSpec) -> (TopicConsumer, WorkerHandle) {
    let (messages_tx, messages_rx) = mpsc::channel(1);
    let (errors_tx, errors_rx) = mpsc::channel(16);
    let (intake_tx, intake_rx) = mpsc::channel(1);
    let (acks_tx, acks_rx) = mpsc::unbounded_channel();
    let (assign_tx, assign_rx) = watch::channel(None);
    let close = CancellationToken::new();

    let consumer = TopicConsumer {
        topic: spec.topic.clone(),
        messages: Some(messages_rx),
        errors: Some(errors_rx),
        acks: acks_tx,
        close: close.clone(),
    };

    let id = spec.id;
    let worker = TopicWorker {
        id: spec.id,
        group: spec.group,
        topic: spec.topic,
        config: spec.config,
        source: spec.source,
        cmd_tx: spec.cmd_tx,
        assignments: assign_rx,
        intake_tx,
        intake_rx,
        acks_rx,
        messages_tx,
        errors_tx,
        close: close.clone(),
        generation_id: -1,
        member_id: String::new(),
        coordinator: None,
        partitions: HashMap::new(),
    };
    let task = tokio::spawn(worker.run());

    (
        consumer,
        WorkerHandle {
            id,
            assign_tx,
            close,
            task,
        },
    )
}

/// State of one currently-owned partition.
struct PartitionState {
    /// `None` until the first delivery when the partition started from a
    /// negative fetched offset (no committed offset yet).
    tracker: Option<AckTracker>,
    /// The offset most recently committed for this partition.
    last_committed: i64,
    reader: JoinHandle<()>,
}

impl PartitionState {
    async fn stop(self) -> Option<AckTracker> {
        self.reader.abort();
        let _ = self.reader.await;
        self.tracker
    }
}

/// The worker task for one topic.
struct TopicWorker {
    id: u64,
    group: String,
    topic: String,
    config: GroupConfig,
    source: Box<dyn TopicSource>,
    cmd_tx: mpsc::Sender<Command>,

    assignments: watch::Receiver<Option<Arc<GenerationAssignment>>>,
    intake_tx: mpsc::Sender<ConsumerMessage>,
    intake_rx: mpsc::Receiver<ConsumerMessage>,
    acks_rx: mpsc::UnboundedReceiver<Ack>,
    messages_tx: mpsc::Sender<ConsumerMessage>,
    errors_tx: mpsc::Sender<ClientError>,
    close: CancellationToken,

    // Generation state, refreshed atomically on every assignment.
    generation_id: i32,
    member_id: String,
    coordinator: Option<Arc<dyn Broker>>,
    partitions: HashMap<i32, PartitionState>,
}

impl TopicWorker {
    async fn run(mut self) {
        debug!(group = %self.group, topic = %self.topic, "Topic worker started");

        let mut commit_timer = tokio::time::interval(self.config.commit_interval);
        commit_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.close.cancelled() => break,

                changed = self.assignments.changed() => {
                    if changed.is_err() {
                        // Coordination task is gone; nothing more will come.
                        break;
                    }
                    let assignment = self.assignments.borrow_and_update().clone();
                    if let Some(assignment) = assignment {
                        self.apply_assignment(assignment).await;
                    }
                }

                Some(msg) = self.intake_rx.recv() => {
                    if self.track_delivery(&msg) && !self.forward(msg).await {
                        break;
                    }
                }

                Some(ack) = self.acks_rx.recv() => self.acknowledge(ack),

                _ = commit_timer.tick() => self.commit_progress().await,
            }
        }

        self.shutdown().await;
    }

    /// Deliver `msg` to the application, servicing acknowledgements,
    /// assignments and close while blocked on the (capacity-1) channel.
    /// Returns `false` when the worker should exit.
    async fn forward(&mut self, msg: ConsumerMessage) -> bool {
        let messages_tx = self.messages_tx.clone();
        loop {
            tokio::select! {
                permit = messages_tx.reserve() => {
                    match permit {
                        Ok(permit) => {
                            permit.send(msg);
                            return true;
                        }
                        // Application dropped the message channel.
                        Err(_) => return true,
                    }
                }

                _ = self.close.cancelled() => return false,

                Some(ack) = self.acks_rx.recv() => self.acknowledge(ack),

                changed = self.assignments.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                    let assignment = self.assignments.borrow_and_update().clone();
                    if let Some(assignment) = assignment {
                        self.apply_assignment(assignment).await;
                    }
                }
            }
        }
    }

    /// Record a delivery in the partition's tracker. Returns `false` when
    /// the message belongs to a stale stream and must not be forwarded.
    fn track_delivery(&mut self, msg: &ConsumerMessage) -> bool {
        let Some(state) = self.partitions.get_mut(&msg.partition) else {
            // Message from a partition this generation no longer owns.
            return false;
        };
        let tracker = state
            .tracker
            .get_or_insert_with(|| AckTracker::new(msg.offset));
        tracker.delivered(msg.offset)
    }

    fn acknowledge(&mut self, ack: Ack) {
        if let Some(state) = self.partitions.get_mut(&ack.partition) {
            if let Some(tracker) = state.tracker.as_mut() {
                tracker.acknowledge(ack.offset);
            }
        }
    }

    /// Reconcile owned partitions against a new generation's assignment.
    async fn apply_assignment(&mut self, assignment: Arc<GenerationAssignment>) {
        let next = assignment
            .assignments
            .get(&self.topic)
            .cloned()
            .unwrap_or_default();
        let owned: Vec<i32> = self.partitions.keys().copied().collect();
        let (added, removed) = difference(&owned, &next);

        info!(
            group = %self.group,
            topic = %self.topic,
            generation = assignment.generation_id,
            added = ?added,
            removed = ?removed,
            "Applying partition assignment"
        );

        // Stop and commit removed partitions while still in the previous
        // generation; their offsets belong to it.
        self.remove_partitions(&removed).await;

        self.generation_id = assignment.generation_id;
        self.member_id = assignment.member_id.clone();
        self.coordinator = Some(assignment.coordinator.clone());

        if added.is_empty() {
            return;
        }

        // Start the added partitions from their last committed offsets.
        let mut fetch = OffsetFetchRequest {
            group_id: self.group.clone(),
            ..Default::default()
        };
        for partition in &added {
            fetch.add_partition(&self.topic, *partition);
        }
        let fetched = match assignment.coordinator.fetch_offsets(fetch).await {
            Ok(resp) => resp,
            Err(e) => {
                // None of the added partitions can start without offsets.
                self.report(ClientError::Coordinator {
                    group: self.group.clone(),
                    context: "fetching committed offsets",
                    source: e,
                });
                return;
            }
        };

        for partition in added {
            let offset = match fetched.block(&self.topic, partition) {
                None => {
                    self.report(ClientError::MissingOffset {
                        topic: self.topic.clone(),
                        partition,
                    });
                    continue;
                }
                Some(block) if !block.error.is_none() => {
                    self.report(ClientError::OffsetFetch {
                        topic: self.topic.clone(),
                        partition,
                        code: block.error,
                    });
                    continue;
                }
                Some(block) => block.offset,
            };

            let stream = match self.source.open_partition(partition, offset).await {
                Ok(stream) => stream,
                Err(e) => {
                    self.report(ClientError::Coordinator {
                        group: self.group.clone(),
                        context: "starting partition stream",
                        source: e,
                    });
                    continue;
                }
            };

            let reader = tokio::spawn(run_partition_reader(
                stream,
                self.intake_tx.clone(),
                self.errors_tx.clone(),
                self.close.clone(),
            ));
            self.partitions.insert(
                partition,
                PartitionState {
                    // A negative fetched offset means no offset was ever
                    // committed; anchor the tracker at the first delivery.
                    tracker: (offset >= 0).then(|| AckTracker::new(offset)),
                    last_committed: offset,
                    reader,
                },
            );
            debug!(
                topic = %self.topic,
                partition,
                offset,
                "Partition reader started"
            );
        }
    }

    /// Stop the given partitions and batch-commit their acknowledged
    /// offsets under the current (outgoing) generation.
    async fn remove_partitions(&mut self, removed: &[i32]) {
        if removed.is_empty() {
            return;
        }
        let mut commit = self.commit_request();
        for partition in removed {
            if let Some(state) = self.partitions.remove(partition) {
                if let Some(tracker) = state.stop().await {
                    commit.add_partition(&self.topic, *partition, tracker.committable());
                }
            }
        }
        let Some(coordinator) = self.coordinator.clone() else {
            // Never reached a generation; nothing was consumed.
            return;
        };
        if commit.partitions.is_empty() {
            return;
        }
        match coordinator.commit_offsets(commit).await {
            Err(e) => self.report(ClientError::Coordinator {
                group: self.group.clone(),
                context: "committing offsets",
                source: e,
            }),
            Ok(resp) => {
                for result in resp.results {
                    if !result.error.is_none() {
                        // The next assignee starts from the last offset
                        // that did commit.
                        self.report(ClientError::OffsetCommit {
                            topic: result.topic,
                            partition: result.partition,
                            code: result.error,
                        });
                    }
                }
            }
        }
    }

    /// Commit every partition whose committable offset advanced since its
    /// last commit.
    async fn commit_progress(&mut self) {
        let Some(coordinator) = self.coordinator.clone() else {
            return;
        };
        let mut commit = self.commit_request();
        let mut offsets: HashMap<i32, i64> = HashMap::new();
        for (partition, state) in &self.partitions {
            if let Some(tracker) = &state.tracker {
                if tracker.committable() > state.last_committed {
                    commit.add_partition(&self.topic, *partition, tracker.committable());
                    offsets.insert(*partition, tracker.committable());
                }
            }
        }
        if commit.partitions.is_empty() {
            return;
        }
        match coordinator.commit_offsets(commit).await {
            Err(e) => self.report(ClientError::Coordinator {
                group: self.group.clone(),
                context: "committing offsets",
                source: e,
            }),
            Ok(resp) => {
                for result in resp.results {
                    if result.error.is_none() {
                        if let Some(state) = self.partitions.get_mut(&result.partition) {
                            if let Some(offset) = offsets.get(&result.partition) {
                                state.last_committed = *offset;
                            }
                        }
                    } else {
                        self.report(ClientError::OffsetCommit {
                            topic: result.topic,
                            partition: result.partition,
                            code: result.error,
                        });
                    }
                }
            }
        }
    }

    fn commit_request(&self) -> OffsetCommitRequest {
        OffsetCommitRequest {
            group_id: self.group.clone(),
            generation_id: self.generation_id,
            member_id: self.member_id.clone(),
            retention_time_ms: self.config.retention_time_ms(),
            partitions: Vec::new(),
        }
    }

    /// Surface a non-fatal error on the consumer's error channel. Dropped
    /// when the application is not keeping up with the channel.
    fn report(&self, error: ClientError) {
        warn!(group = %self.group, topic = %self.topic, %error, "Consumer error");
        let _ = self.errors_tx.try_send(error);
    }

    /// Final cleanup: commit everything still owned, release the topic
    /// source, close the application channels, deregister from the client.
    async fn shutdown(mut self) {
        // Acknowledgements sent before async_close still count toward the
        // final commit.
        while let Ok(ack) = self.acks_rx.try_recv() {
            self.acknowledge(ack);
        }
        let owned: Vec<i32> = self.partitions.keys().copied().collect();
        self.remove_partitions(&owned).await;
        self.source.close().await;

        // Closing the channels is what releases an application draining
        // them after async_close.
        drop(self.messages_tx);
        drop(self.errors_tx);

        let _ = self
            .cmd_tx
            .send(Command::Deregister {
                topic: self.topic.clone(),
                worker_id: self.id,
            })
            .await;
        debug!(group = %self.group, topic = %self.topic, "Topic worker stopped");
    }
}

/// Forward one partition's external stream into the worker intake. Runs
/// until the stream ends, the worker stops it, or the consumer closes.
async fn run_partition_reader(
    mut stream: PartitionStream,
    intake: mpsc::Sender<ConsumerMessage>,
    errors: mpsc::Sender<ClientError>,
    close: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = close.cancelled() => return,

            msg = stream.messages.recv() => match msg {
                Some(msg) => {
                    tokio::select! {
                        _ = close.cancelled() => return,
                        res = intake.send(msg) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
                None => {
                    // Stream finished; pass on any trailing errors.
                    while let Some(err) = stream.errors.recv().await {
                        tokio::select! {
                            _ = close.cancelled() => return,
                            res = errors.send(ClientError::Partition(err)) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    return;
                }
            },

            err = stream.errors.recv() => match err {
                Some(err) => {
                    tokio::select! {
                        _ = close.cancelled() => return,
                        res = errors.send(ClientError::Partition(err)) => {
                            if res.is_err() {
                                return;
                            }
                        }
                    }
                }
                None => {
                    // Error side finished; drain remaining messages.
                    while let Some(msg) = stream.messages.recv().await {
                        tokio::select! {
                            _ = close.cancelled() => return,
                            res = intake.send(msg) => {
                                if res.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    return;
                }
            },
        }
    }
}

/// The sorted additions and removals that turn `owned` into `next`.
pub(crate) fn difference(owned: &[i32], next: &[i32]) -> (Vec<i32>, Vec<i32>) {
    let mut owned = owned.to_vec();
    let mut next = next.to_vec();
    owned.sort_unstable();
    next.sort_unstable();

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < owned.len() && j < next.len() {
        match owned[i].cmp(&next[j]) {
            std::cmp::Ordering::Less => {
                removed.push(owned[i]);
                i += 1;
            }
            std::cmp::Ordering::Greater => {
                added.push(next[j]);
                j += 1;
            }
            std::cmp::Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    removed.extend_from_slice(&owned[i..]);
    added.extend_from_slice(&next[j..]);
    (added, removed)
}

fn closed_receiver<T>() -> mpsc::Receiver<T> {
    let (tx, rx) = mpsc::channel(1);
    drop(tx);
    rx
}
