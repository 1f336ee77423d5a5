//! muster-protocol — the contract between muster and the external Kafka client
//!
//! This crate holds everything both sides of the seam need to agree on:
//!
//! - **Messages**: typed request/response structs for the six group RPCs
//!   (JoinGroup, SyncGroup, Heartbeat, LeaveGroup, OffsetFetch, OffsetCommit).
//! - **Membership blobs**: the subscription metadata and member assignment
//!   payloads the broker relays opaquely between group members, with their
//!   wire codecs.
//! - **Traits**: [`KafkaClient`], [`Broker`] and [`TopicSource`], implemented
//!   by the external library and consumed by `muster-client`.
//! - **Errors**: the broker error codes ([`KafkaCode`]) and the transport
//!   error type ([`TransportError`]).
//!
//! The wire framing of the RPCs themselves, broker discovery, TCP/TLS/SASL
//! and the fetch loops are all on the far side of these traits.

pub mod client;
pub mod codec;
pub mod error;
pub mod membership;
pub mod messages;

pub use client::{Broker, ConsumerMessage, KafkaClient, PartitionError, PartitionStream, TopicSource};
pub use error::{KafkaCode, TransportError, TransportResult};
pub use membership::{MemberAssignment, Subscription, MIN_BROKER_VERSION, PROTOCOL_TYPE};
pub use messages::{
    GroupProtocol, HeartbeatRequest, HeartbeatResponse, JoinGroupMember, JoinGroupRequest,
    JoinGroupResponse, LeaveGroupRequest, LeaveGroupResponse, OffsetCommitPartition,
    OffsetCommitRequest, OffsetCommitResponse, OffsetCommitResult, OffsetFetchBlock,
    OffsetFetchRequest, OffsetFetchResponse, SyncGroupAssignment, SyncGroupRequest,
    SyncGroupResponse, TopicPartition,
};
