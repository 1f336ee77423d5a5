//! Error types for consumer-group operations.
//!
//! Errors fall into two delivery paths:
//!
//! - **Synchronous**: configuration and subscription mistakes, and a failed
//!   first join. Returned from [`GroupClient::connect`] and
//!   [`GroupClient::subscribe`] directly.
//! - **Asynchronous**: everything that happens after the group is running —
//!   coordination failures, per-partition offset trouble, fetch-stream
//!   errors. Delivered on the client's or the topic consumer's error
//!   channel; none of them tear the client down.
//!
//! [`GroupClient::connect`]: crate::GroupClient::connect
//! [`GroupClient::subscribe`]: crate::GroupClient::subscribe

use muster_protocol::{KafkaCode, PartitionError, TransportError};
use thiserror::Error;

/// Convenience type alias for `Result<T, ClientError>`.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors produced by the consumer-group client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Invalid client configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// The topic already has a consumer on this client. The group protocol
    /// gives one client one subscription per topic; use a second client to
    /// read a topic twice.
    #[error("Topic {0:?} is already being consumed by this client")]
    AlreadySubscribed(String),

    /// A coordination round-trip failed at the transport layer.
    #[error("Group {group:?}: {context}: {source}")]
    Coordinator {
        group: String,
        context: &'static str,
        source: TransportError,
    },

    /// The coordinator answered a coordination request with a non-zero
    /// error code.
    #[error("Group {group:?}: {context}: {code}")]
    Protocol {
        group: String,
        context: &'static str,
        code: KafkaCode,
    },

    /// The leader-side partitioner failed; the generation is aborted.
    #[error("Partitioning failed: {0}")]
    Partitioner(String),

    /// A membership blob could not be decoded, or carried an unsupported
    /// version.
    #[error("Member metadata error: {0}")]
    Membership(String),

    /// Committing one partition's offset failed. The next assignee starts
    /// from the last offset that did commit.
    #[error("Committing offset for topic {topic:?} partition {partition}: {code}")]
    OffsetCommit {
        topic: String,
        partition: i32,
        code: KafkaCode,
    },

    /// Fetching one partition's committed offset failed; the partition is
    /// skipped for this generation.
    #[error("Fetching offset for topic {topic:?} partition {partition}: {code}")]
    OffsetFetch {
        topic: String,
        partition: i32,
        code: KafkaCode,
    },

    /// The offset-fetch response had no block for a requested partition.
    #[error("Offset fetch response missing topic {topic:?} partition {partition}")]
    MissingOffset { topic: String, partition: i32 },

    /// A partition fetch loop reported an error.
    #[error("Consuming {0}")]
    Partition(#[from] PartitionError),

    /// A transport failure outside any more specific context.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The client has been closed; no further operations are possible.
    #[error("Client is closed")]
    Closed,
}
