//! Contract with the external Kafka client library
//!
//! muster does not speak the Kafka wire protocol itself. Broker discovery,
//! connection management, frame encoding and the per-partition fetch loops
//! are the external library's job; these traits are the seam. The library is
//! handed in as an `Arc<dyn KafkaClient>` and must be internally
//! thread-safe — every task in this crate shares it.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::{TransportError, TransportResult};
use crate::messages::{
    HeartbeatRequest, HeartbeatResponse, JoinGroupRequest, JoinGroupResponse, LeaveGroupRequest,
    LeaveGroupResponse, OffsetCommitRequest, OffsetCommitResponse, OffsetFetchRequest,
    OffsetFetchResponse, SyncGroupRequest, SyncGroupResponse,
};

/// One message fetched from a partition.
#[derive(Debug, Clone)]
pub struct ConsumerMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Bytes>,
    pub value: Bytes,
    /// Broker-assigned timestamp, milliseconds since the epoch. `-1` when
    /// the broker predates message timestamps.
    pub timestamp_ms: i64,
}

/// A fetch-loop error tied to one partition.
#[derive(Debug)]
pub struct PartitionError {
    pub topic: String,
    pub partition: i32,
    pub error: TransportError,
}

impl std::fmt::Display for PartitionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "topic {:?} partition {}: {}",
            self.topic, self.partition, self.error
        )
    }
}

impl std::error::Error for PartitionError {}

/// Handle on one partition's running fetch loop.
///
/// The external library feeds both channels until the stream is dropped;
/// dropping the handle is the stop signal. Message order on `messages` is
/// the partition's log order.
#[derive(Debug)]
pub struct PartitionStream {
    pub messages: mpsc::Receiver<ConsumerMessage>,
    pub errors: mpsc::Receiver<PartitionError>,
}

/// The external Kafka client.
///
/// Implementations cache the coordinator lookup; `refresh_coordinator` is
/// how this crate invalidates that cache after a `NotCoordinator` response.
#[async_trait]
pub trait KafkaClient: Send + Sync {
    /// The broker currently coordinating `group` (cached).
    async fn coordinator(&self, group: &str) -> TransportResult<Arc<dyn Broker>>;

    /// Drop the cached coordinator for `group` and look it up again.
    async fn refresh_coordinator(&self, group: &str) -> TransportResult<()>;

    /// The partition ids of `topic`, from topic metadata.
    async fn partitions(&self, topic: &str) -> TransportResult<Vec<i32>>;

    /// Open a per-topic handle from which partition fetch loops are started.
    async fn topic_source(&self, topic: &str) -> TransportResult<Box<dyn TopicSource>>;
}

/// One broker connection, used for the group RPCs.
///
/// All six calls go to the group's coordinator; sending them elsewhere gets
/// a `NotCoordinator` response code, which is the caller's signal to refresh.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn join_group(&self, req: JoinGroupRequest) -> TransportResult<JoinGroupResponse>;

    async fn sync_group(&self, req: SyncGroupRequest) -> TransportResult<SyncGroupResponse>;

    async fn heartbeat(&self, req: HeartbeatRequest) -> TransportResult<HeartbeatResponse>;

    async fn leave_group(&self, req: LeaveGroupRequest) -> TransportResult<LeaveGroupResponse>;

    async fn fetch_offsets(&self, req: OffsetFetchRequest) -> TransportResult<OffsetFetchResponse>;

    async fn commit_offsets(
        &self,
        req: OffsetCommitRequest,
    ) -> TransportResult<OffsetCommitResponse>;
}

/// Factory for the fetch loops of one topic's partitions.
#[async_trait]
pub trait TopicSource: Send {
    /// Start fetching `partition` at `offset` (the next offset to consume).
    async fn open_partition(
        &mut self,
        partition: i32,
        offset: i64,
    ) -> TransportResult<PartitionStream>;

    /// Release the topic handle. Streams already opened keep running until
    /// dropped.
    async fn close(&mut self);
}
