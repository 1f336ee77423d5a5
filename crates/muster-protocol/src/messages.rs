//! Group coordination request and response messages
//!
//! Typed forms of the six broker round-trips group membership needs:
//! JoinGroup, SyncGroup, Heartbeat, LeaveGroup, OffsetFetch (v1) and
//! OffsetCommit (v2, with retention time). The external Kafka library owns
//! the wire encoding of these frames; the structs here are its call
//! contract.

use bytes::Bytes;

use crate::error::KafkaCode;

/// JoinGroup request (v1: carries a rebalance timeout, honored by brokers
/// >= 0.10.1).
#[derive(Debug, Clone, Default)]
pub struct JoinGroupRequest {
    pub group_id: String,
    pub session_timeout_ms: i32,
    pub rebalance_timeout_ms: i32,
    /// Empty on the very first join; the broker assigns one.
    pub member_id: String,
    /// Always `"consumer"` for this client.
    pub protocol_type: String,
    pub protocols: Vec<GroupProtocol>,
}

impl JoinGroupRequest {
    /// Attach one group protocol alternative with its opaque metadata blob.
    pub fn add_protocol(&mut self, name: impl Into<String>, metadata: Bytes) {
        self.protocols.push(GroupProtocol {
            name: name.into(),
            metadata,
        });
    }
}

/// One protocol alternative offered in a JoinGroup request.
#[derive(Debug, Clone)]
pub struct GroupProtocol {
    pub name: String,
    pub metadata: Bytes,
}

/// JoinGroup response.
#[derive(Debug, Clone, Default)]
pub struct JoinGroupResponse {
    pub error: KafkaCode,
    pub generation_id: i32,
    /// The protocol the broker selected from the offered alternatives.
    pub protocol_name: String,
    pub leader_id: String,
    pub member_id: String,
    /// Populated only in the leader's response.
    pub members: Vec<JoinGroupMember>,
}

impl JoinGroupResponse {
    /// True when this member was elected leader of the generation.
    pub fn is_leader(&self) -> bool {
        !self.member_id.is_empty() && self.leader_id == self.member_id
    }
}

/// One member's subscription metadata as relayed to the leader.
#[derive(Debug, Clone)]
pub struct JoinGroupMember {
    pub member_id: String,
    pub metadata: Bytes,
}

/// SyncGroup request. Followers send it empty; the leader attaches every
/// member's assignment blob.
#[derive(Debug, Clone, Default)]
pub struct SyncGroupRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    pub assignments: Vec<SyncGroupAssignment>,
}

impl SyncGroupRequest {
    pub fn add_assignment(&mut self, member_id: impl Into<String>, assignment: Bytes) {
        self.assignments.push(SyncGroupAssignment {
            member_id: member_id.into(),
            assignment,
        });
    }
}

/// Assignment blob for one member, carried in the leader's SyncGroup request.
#[derive(Debug, Clone)]
pub struct SyncGroupAssignment {
    pub member_id: String,
    pub assignment: Bytes,
}

/// SyncGroup response: this member's own assignment blob.
#[derive(Debug, Clone, Default)]
pub struct SyncGroupResponse {
    pub error: KafkaCode,
    pub assignment: Bytes,
}

/// Heartbeat request.
#[derive(Debug, Clone)]
pub struct HeartbeatRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
}

/// Heartbeat response.
#[derive(Debug, Clone)]
pub struct HeartbeatResponse {
    pub error: KafkaCode,
}

/// LeaveGroup request.
#[derive(Debug, Clone)]
pub struct LeaveGroupRequest {
    pub group_id: String,
    pub member_id: String,
}

/// LeaveGroup response.
#[derive(Debug, Clone)]
pub struct LeaveGroupResponse {
    pub error: KafkaCode,
}

/// OffsetFetch request (v1: offsets read from Kafka, not Zookeeper).
#[derive(Debug, Clone, Default)]
pub struct OffsetFetchRequest {
    pub group_id: String,
    pub partitions: Vec<TopicPartition>,
}

impl OffsetFetchRequest {
    pub fn add_partition(&mut self, topic: impl Into<String>, partition: i32) {
        self.partitions.push(TopicPartition {
            topic: topic.into(),
            partition,
        });
    }
}

/// A (topic, partition) pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

/// OffsetFetch response.
#[derive(Debug, Clone, Default)]
pub struct OffsetFetchResponse {
    pub blocks: Vec<OffsetFetchBlock>,
}

impl OffsetFetchResponse {
    /// Find the block for one partition, if the broker returned it.
    pub fn block(&self, topic: &str, partition: i32) -> Option<&OffsetFetchBlock> {
        self.blocks
            .iter()
            .find(|b| b.topic == topic && b.partition == partition)
    }
}

/// Committed-offset block for one partition.
///
/// By Kafka convention the stored offset is the next offset to consume, and
/// `-1` means no offset has ever been committed for the partition.
#[derive(Debug, Clone)]
pub struct OffsetFetchBlock {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: String,
    pub error: KafkaCode,
}

/// OffsetCommit request (v2: carries a retention time).
#[derive(Debug, Clone, Default)]
pub struct OffsetCommitRequest {
    pub group_id: String,
    pub generation_id: i32,
    pub member_id: String,
    /// Milliseconds the broker retains these offsets; `-1` selects the
    /// broker's configured default.
    pub retention_time_ms: i64,
    pub partitions: Vec<OffsetCommitPartition>,
}

impl OffsetCommitRequest {
    pub fn add_partition(&mut self, topic: impl Into<String>, partition: i32, offset: i64) {
        self.partitions.push(OffsetCommitPartition {
            topic: topic.into(),
            partition,
            offset,
            metadata: String::new(),
        });
    }
}

/// One partition's offset in an OffsetCommit request.
#[derive(Debug, Clone)]
pub struct OffsetCommitPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub metadata: String,
}

/// OffsetCommit response: a per-partition result code.
#[derive(Debug, Clone, Default)]
pub struct OffsetCommitResponse {
    pub results: Vec<OffsetCommitResult>,
}

/// Commit outcome for one partition.
#[derive(Debug, Clone)]
pub struct OffsetCommitResult {
    pub topic: String,
    pub partition: i32,
    pub error: KafkaCode,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leader_detection() {
        let mut resp = JoinGroupResponse {
            member_id: "m-1".into(),
            leader_id: "m-1".into(),
            ..Default::default()
        };
        assert!(resp.is_leader());

        resp.leader_id = "m-2".into();
        assert!(!resp.is_leader());
    }

    #[test]
    fn empty_member_is_never_leader() {
        let resp = JoinGroupResponse::default();
        assert!(!resp.is_leader());
    }

    #[test]
    fn offset_fetch_block_lookup() {
        let resp = OffsetFetchResponse {
            blocks: vec![OffsetFetchBlock {
                topic: "orders".into(),
                partition: 2,
                offset: 13,
                metadata: String::new(),
                error: KafkaCode::None,
            }],
        };
        assert_eq!(resp.block("orders", 2).unwrap().offset, 13);
        assert!(resp.block("orders", 0).is_none());
        assert!(resp.block("users", 2).is_none());
    }
}
