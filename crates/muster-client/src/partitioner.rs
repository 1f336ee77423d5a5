//! Partition assignment strategies
//!
//! When this member is elected leader of a generation, the partitioner
//! decides which member consumes which partitions and encodes that decision
//! into the SyncGroup exchange. Members that are not leader only encode
//! their subscription on join and decode their own assignment on sync.
//!
//! The default [`RoundRobin`] strategy distributes each topic's partitions
//! evenly across the members subscribed to it, in deterministic order.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tracing::{debug, warn};

use muster_protocol::{
    JoinGroupRequest, JoinGroupResponse, KafkaClient, MemberAssignment, Subscription,
    SyncGroupRequest, SyncGroupResponse,
};

use crate::error::{ClientError, Result};

/// Maps partitions to consumer-group members.
///
/// Implementations must be deterministic for a given join response: every
/// member of a generation must be able to predict nothing — only the leader
/// computes, and followers learn their share from the sync response.
#[async_trait]
pub trait Partitioner: Send + Sync {
    /// Attach this member's subscription metadata to the outgoing JoinGroup
    /// request.
    fn prepare_join(&self, join: &mut JoinGroupRequest, topics: &[String]);

    /// Compute the assignment for every member of the generation and attach
    /// it to the outgoing SyncGroup request. Invoked only on the leader.
    /// An error aborts the generation and forces a rejoin.
    async fn partition(
        &self,
        sync: &mut SyncGroupRequest,
        join: &JoinGroupResponse,
        kafka: &dyn KafkaClient,
    ) -> Result<()>;

    /// Decode this member's own assignment from the SyncGroup response.
    fn parse_sync(&self, sync: &SyncGroupResponse) -> Result<HashMap<String, Vec<i32>>>;
}

/// Protocol name the round-robin partitioner registers under.
pub const ROUND_ROBIN_PROTOCOL: &str = "round-robin";

/// Membership-blob version the round-robin partitioner speaks.
const METADATA_VERSION: i16 = 1;

/// Round-robin partition assignment.
///
/// For each topic: partitions sorted ascending, subscribed members sorted
/// lexicographically by member id, partition `i` goes to member
/// `i mod member_count`. Members that declared an incompatible metadata
/// version are skipped entirely rather than failing the whole group; their
/// sync response will carry an empty assignment.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

#[async_trait]
impl Partitioner for RoundRobin {
    fn prepare_join(&self, join: &mut JoinGroupRequest, topics: &[String]) {
        let subscription = Subscription::new(METADATA_VERSION, topics.to_vec());
        join.add_protocol(ROUND_ROBIN_PROTOCOL, subscription.encode());
    }

    async fn partition(
        &self,
        sync: &mut SyncGroupRequest,
        join: &JoinGroupResponse,
        kafka: &dyn KafkaClient,
    ) -> Result<()> {
        // The broker relays each member's subscription as an opaque blob
        // grouped by member; invert it into members-per-topic. BTreeMaps
        // keep the iteration order deterministic across leaders.
        let mut members_by_topic: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        let mut assignments: BTreeMap<&str, MemberAssignment> = BTreeMap::new();

        let mut subscriptions: Vec<(&str, Subscription)> = Vec::new();
        for member in &join.members {
            let subscription = Subscription::decode(member.metadata.clone())
                .map_err(|e| ClientError::Membership(e.to_string()))?;
            if subscription.version != METADATA_VERSION {
                // Assign only to members we can understand; an incompatible
                // member loses its share this generation instead of
                // blocking everyone else.
                warn!(
                    member = %member.member_id,
                    version = subscription.version,
                    "Skipping member with unsupported metadata version"
                );
                continue;
            }
            assignments
                .entry(member.member_id.as_str())
                .or_insert_with(|| MemberAssignment::new(METADATA_VERSION));
            subscriptions.push((member.member_id.as_str(), subscription));
        }
        for (member_id, subscription) in &subscriptions {
            for topic in &subscription.topics {
                members_by_topic
                    .entry(topic.as_str())
                    .or_default()
                    .push(*member_id);
            }
        }

        for (topic, members) in &mut members_by_topic {
            let mut partitions = kafka
                .partitions(topic)
                .await
                .map_err(|e| ClientError::Partitioner(format!("metadata for topic {topic:?}: {e}")))?;
            if partitions.is_empty() {
                // As if the topic didn't exist.
                debug!(topic, "Topic has no partitions; skipping");
                continue;
            }
            partitions.sort_unstable();
            members.sort_unstable();

            for (i, partition) in partitions.iter().enumerate() {
                let member = members[i % members.len()];
                if let Some(assignment) = assignments.get_mut(member) {
                    assignment.add_partition(*topic, *partition);
                }
            }
        }

        for (member_id, assignment) in &assignments {
            sync.add_assignment(*member_id, assignment.encode());
        }

        Ok(())
    }

    fn parse_sync(&self, sync: &SyncGroupResponse) -> Result<HashMap<String, Vec<i32>>> {
        if sync.assignment.is_empty() {
            // The leader did not understand this member's metadata.
            return Err(ClientError::Membership(
                "sync response carried no member assignment".into(),
            ));
        }
        let assignment = MemberAssignment::decode(sync.assignment.clone())
            .map_err(|e| ClientError::Membership(e.to_string()))?;
        if assignment.version != METADATA_VERSION {
            return Err(ClientError::Membership(format!(
                "unsupported member assignment version {}",
                assignment.version
            )));
        }
        Ok(assignment.topics.into_iter().collect())
    }
}
