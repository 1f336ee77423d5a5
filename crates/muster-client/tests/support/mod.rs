//! In-process scripted Kafka cluster for group-session tests.
//!
//! One broker, one group, and this client always wins leader election.
//! Tests script heartbeat error codes, extra group members and coordinator
//! failures, inject messages into partition streams, and inspect the
//! commit/fetch/open traffic the client produced.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use muster_protocol::{
    Broker, ConsumerMessage, HeartbeatRequest, HeartbeatResponse, JoinGroupMember,
    JoinGroupRequest, JoinGroupResponse, KafkaClient, KafkaCode, LeaveGroupRequest,
    LeaveGroupResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetCommitResult,
    OffsetFetchBlock, OffsetFetchRequest, OffsetFetchResponse, PartitionError, PartitionStream,
    Subscription, SyncGroupRequest, SyncGroupResponse, TopicSource, TransportError,
    TransportResult,
};

/// The member id the broker hands this client on its first join.
pub const MEMBER_ID: &str = "m-1";

/// Sender halves of one opened partition stream.
pub struct StreamFeeder {
    pub messages: mpsc::Sender<ConsumerMessage>,
    pub errors: mpsc::Sender<PartitionError>,
}

#[derive(Default)]
pub struct ClusterState {
    /// topic -> partition ids.
    pub topics: Mutex<HashMap<String, Vec<i32>>>,
    /// (topic, partition) -> committed offset.
    pub committed: Mutex<HashMap<(String, i32), i64>>,
    /// Every OffsetCommit request received, in order.
    pub commit_log: Mutex<Vec<OffsetCommitRequest>>,
    /// Every SyncGroup request received, in order.
    pub sync_log: Mutex<Vec<SyncGroupRequest>>,
    /// Additional group members echoed in join responses.
    pub extra_members: Mutex<Vec<JoinGroupMember>>,
    /// Scripted heartbeat error codes, consumed one per heartbeat.
    pub heartbeat_codes: Mutex<VecDeque<KafkaCode>>,
    /// Scripted join error codes, consumed one per join.
    pub join_codes: Mutex<VecDeque<KafkaCode>>,
    /// Remaining coordinator lookups that must fail.
    pub coordinator_failures: Mutex<u32>,
    /// (topic, partition) -> live stream feeder.
    pub streams: Mutex<HashMap<(String, i32), StreamFeeder>>,
    /// Every open_partition call: (topic, partition, offset).
    pub opens: Mutex<Vec<(String, i32, i64)>>,

    pub generation: AtomicI32,
    pub joins: AtomicUsize,
    pub heartbeats: AtomicUsize,
    pub leaves: AtomicUsize,
    pub refreshes: AtomicUsize,
    /// Total broker round-trips of any kind.
    pub requests: AtomicUsize,
}

impl ClusterState {
    /// Seed a committed offset, as if a previous group member left it.
    pub fn seed_offset(&self, topic: &str, partition: i32, offset: i64) {
        self.committed
            .lock()
            .unwrap()
            .insert((topic.to_string(), partition), offset);
    }

    pub fn committed_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.committed
            .lock()
            .unwrap()
            .get(&(topic.to_string(), partition))
            .copied()
    }

    /// Make the next heartbeat fail with `code`, forcing a rejoin (or a
    /// coordinator refresh for `NotCoordinator`).
    pub fn fail_next_heartbeat(&self, code: KafkaCode) {
        self.heartbeat_codes.lock().unwrap().push_back(code);
    }

    /// Add a fake member that subscribes `topics`; it participates in
    /// round-robin assignment from the next generation on.
    pub fn add_member(&self, member_id: &str, version: i16, topics: &[&str]) {
        self.extra_members.lock().unwrap().push(JoinGroupMember {
            member_id: member_id.to_string(),
            metadata: Subscription::new(version, topics.iter().map(|t| t.to_string()).collect())
                .encode(),
        });
    }

    pub fn clear_members(&self) {
        self.extra_members.lock().unwrap().clear();
    }

    /// Push `msg` into the live stream of its partition.
    pub async fn feed(&self, msg: ConsumerMessage) {
        let sender = {
            let streams = self.streams.lock().unwrap();
            streams
                .get(&(msg.topic.clone(), msg.partition))
                .map(|f| f.messages.clone())
                .expect("no open stream for partition")
        };
        sender.send(msg).await.expect("stream receiver dropped");
    }

    /// Wait until the client has opened a stream for (topic, partition).
    pub async fn wait_for_stream(&self, topic: &str, partition: i32) {
        loop {
            if self
                .streams
                .lock()
                .unwrap()
                .contains_key(&(topic.to_string(), partition))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `n` joins have been served.
    pub async fn wait_for_joins(&self, n: usize) {
        while self.joins.load(Ordering::SeqCst) < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Wait until at least `n` commit requests have been received.
    pub async fn wait_for_commits(&self, n: usize) {
        while self.commit_log.lock().unwrap().len() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// The scripted cluster: implements the client-side Kafka contract.
pub struct MockCluster {
    pub state: Arc<ClusterState>,
}

impl MockCluster {
    pub fn new(topics: &[(&str, Vec<i32>)]) -> Self {
        let state = ClusterState::default();
        *state.topics.lock().unwrap() = topics
            .iter()
            .map(|(t, p)| (t.to_string(), p.clone()))
            .collect();
        state.generation.store(0, Ordering::SeqCst);
        Self {
            state: Arc::new(state),
        }
    }

    pub fn client(&self) -> Arc<dyn KafkaClient> {
        Arc::new(MockKafka {
            state: Arc::clone(&self.state),
        })
    }
}

struct MockKafka {
    state: Arc<ClusterState>,
}

#[async_trait]
impl KafkaClient for MockKafka {
    async fn coordinator(&self, group: &str) -> TransportResult<Arc<dyn Broker>> {
        let mut failures = self.state.coordinator_failures.lock().unwrap();
        if *failures > 0 {
            *failures -= 1;
            return Err(TransportError::NoCoordinator(group.to_string()));
        }
        Ok(Arc::new(MockBroker {
            state: Arc::clone(&self.state),
        }))
    }

    async fn refresh_coordinator(&self, _group: &str) -> TransportResult<()> {
        self.state.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn partitions(&self, topic: &str) -> TransportResult<Vec<i32>> {
        self.state
            .topics
            .lock()
            .unwrap()
            .get(topic)
            .cloned()
            .ok_or_else(|| TransportError::UnexpectedResponse(format!("unknown topic {topic}")))
    }

    async fn topic_source(&self, topic: &str) -> TransportResult<Box<dyn TopicSource>> {
        Ok(Box::new(MockTopicSource {
            topic: topic.to_string(),
            state: Arc::clone(&self.state),
        }))
    }
}

struct MockBroker {
    state: Arc<ClusterState>,
}

#[async_trait]
impl Broker for MockBroker {
    async fn join_group(&self, req: JoinGroupRequest) -> TransportResult<JoinGroupResponse> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        self.state.joins.fetch_add(1, Ordering::SeqCst);

        if let Some(code) = self.state.join_codes.lock().unwrap().pop_front() {
            return Ok(JoinGroupResponse {
                error: code,
                ..Default::default()
            });
        }

        let member_id = if req.member_id.is_empty() {
            MEMBER_ID.to_string()
        } else {
            req.member_id.clone()
        };
        let generation_id = self.state.generation.fetch_add(1, Ordering::SeqCst) + 1;

        // This client always leads; its own subscription metadata comes
        // straight back, alongside any scripted members.
        let own_metadata = req
            .protocols
            .first()
            .map(|p| p.metadata.clone())
            .unwrap_or_else(Bytes::new);
        let mut members = vec![JoinGroupMember {
            member_id: member_id.clone(),
            metadata: own_metadata,
        }];
        members.extend(self.state.extra_members.lock().unwrap().iter().cloned());

        Ok(JoinGroupResponse {
            error: KafkaCode::None,
            generation_id,
            protocol_name: req
                .protocols
                .first()
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            leader_id: member_id.clone(),
            member_id,
            members,
        })
    }

    async fn sync_group(&self, req: SyncGroupRequest) -> TransportResult<SyncGroupResponse> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        let own = req
            .assignments
            .iter()
            .find(|a| a.member_id == req.member_id)
            .map(|a| a.assignment.clone())
            .unwrap_or_else(Bytes::new);
        self.state.sync_log.lock().unwrap().push(req);
        Ok(SyncGroupResponse {
            error: KafkaCode::None,
            assignment: own,
        })
    }

    async fn heartbeat(&self, _req: HeartbeatRequest) -> TransportResult<HeartbeatResponse> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        self.state.heartbeats.fetch_add(1, Ordering::SeqCst);
        let code = self
            .state
            .heartbeat_codes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(KafkaCode::None);
        Ok(HeartbeatResponse { error: code })
    }

    async fn leave_group(&self, _req: LeaveGroupRequest) -> TransportResult<LeaveGroupResponse> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        self.state.leaves.fetch_add(1, Ordering::SeqCst);
        Ok(LeaveGroupResponse {
            error: KafkaCode::None,
        })
    }

    async fn fetch_offsets(&self, req: OffsetFetchRequest) -> TransportResult<OffsetFetchResponse> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        let committed = self.state.committed.lock().unwrap();
        let blocks = req
            .partitions
            .iter()
            .map(|tp| OffsetFetchBlock {
                topic: tp.topic.clone(),
                partition: tp.partition,
                offset: committed
                    .get(&(tp.topic.clone(), tp.partition))
                    .copied()
                    .unwrap_or(-1),
                metadata: String::new(),
                error: KafkaCode::None,
            })
            .collect();
        Ok(OffsetFetchResponse { blocks })
    }

    async fn commit_offsets(
        &self,
        req: OffsetCommitRequest,
    ) -> TransportResult<OffsetCommitResponse> {
        self.state.requests.fetch_add(1, Ordering::SeqCst);
        let mut committed = self.state.committed.lock().unwrap();
        let results = req
            .partitions
            .iter()
            .map(|p| {
                committed.insert((p.topic.clone(), p.partition), p.offset);
                OffsetCommitResult {
                    topic: p.topic.clone(),
                    partition: p.partition,
                    error: KafkaCode::None,
                }
            })
            .collect();
        drop(committed);
        self.state.commit_log.lock().unwrap().push(req);
        Ok(OffsetCommitResponse { results })
    }
}

struct MockTopicSource {
    topic: String,
    state: Arc<ClusterState>,
}

#[async_trait]
impl TopicSource for MockTopicSource {
    async fn open_partition(
        &mut self,
        partition: i32,
        offset: i64,
    ) -> TransportResult<PartitionStream> {
        let (msg_tx, msg_rx) = mpsc::channel(64);
        let (err_tx, err_rx) = mpsc::channel(8);
        self.state
            .opens
            .lock()
            .unwrap()
            .push((self.topic.clone(), partition, offset));
        self.state.streams.lock().unwrap().insert(
            (self.topic.clone(), partition),
            StreamFeeder {
                messages: msg_tx,
                errors: err_tx,
            },
        );
        Ok(PartitionStream {
            messages: msg_rx,
            errors: err_rx,
        })
    }

    async fn close(&mut self) {}
}

/// A message at `offset` on (topic, partition) with a throwaway payload.
pub fn message(topic: &str, partition: i32, offset: i64) -> ConsumerMessage {
    ConsumerMessage {
        topic: topic.to_string(),
        partition,
        offset,
        key: None,
        value: Bytes::from_static(b"payload"),
        timestamp_ms: -1,
    }
}
