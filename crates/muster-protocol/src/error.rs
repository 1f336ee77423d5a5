//! Protocol error handling
//!
//! Two error layers live here:
//!
//! - [`KafkaCode`]: the broker-assigned error codes carried inside group
//!   coordination responses. The subset below is what group membership and
//!   offset management can actually observe.
//! - [`TransportError`]: what the external Kafka client returns when a
//!   request never produced a usable response (socket trouble, codec
//!   trouble, no route to the coordinator).

use thiserror::Error;

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors returned by the external Kafka client's transport layer.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Connection closed")]
    Disconnected,

    #[error("No coordinator available for group: {0}")]
    NoCoordinator(String),

    #[error("Malformed response: {0}")]
    UnexpectedResponse(String),

    #[error("Broker refused request: {0}")]
    Kafka(KafkaCode),
}

/// Kafka protocol error codes observable during group coordination.
///
/// See: <https://kafka.apache.org/protocol#protocol_error_codes>
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(i16)]
pub enum KafkaCode {
    #[default]
    None = 0,
    Unknown = -1,
    UnknownTopicOrPartition = 3,
    CoordinatorLoadInProgress = 14,
    CoordinatorNotAvailable = 15,
    NotCoordinator = 16,
    IllegalGeneration = 22,
    InconsistentGroupProtocol = 23,
    InvalidGroupId = 24,
    UnknownMemberId = 25,
    InvalidSessionTimeout = 26,
    RebalanceInProgress = 27,
    InvalidCommitOffsetSize = 28,
    TopicAuthorizationFailed = 29,
    GroupAuthorizationFailed = 30,
}

impl KafkaCode {
    /// Map a wire error code onto the known set. Codes this client has no
    /// special handling for collapse to `Unknown`.
    pub fn from_i16(code: i16) -> Self {
        match code {
            0 => KafkaCode::None,
            3 => KafkaCode::UnknownTopicOrPartition,
            14 => KafkaCode::CoordinatorLoadInProgress,
            15 => KafkaCode::CoordinatorNotAvailable,
            16 => KafkaCode::NotCoordinator,
            22 => KafkaCode::IllegalGeneration,
            23 => KafkaCode::InconsistentGroupProtocol,
            24 => KafkaCode::InvalidGroupId,
            25 => KafkaCode::UnknownMemberId,
            26 => KafkaCode::InvalidSessionTimeout,
            27 => KafkaCode::RebalanceInProgress,
            28 => KafkaCode::InvalidCommitOffsetSize,
            29 => KafkaCode::TopicAuthorizationFailed,
            30 => KafkaCode::GroupAuthorizationFailed,
            _ => KafkaCode::Unknown,
        }
    }

    pub fn as_i16(self) -> i16 {
        self as i16
    }

    /// True when the code signals success.
    pub fn is_none(self) -> bool {
        self == KafkaCode::None
    }

    pub fn as_str(self) -> &'static str {
        match self {
            KafkaCode::None => "NONE",
            KafkaCode::Unknown => "UNKNOWN_SERVER_ERROR",
            KafkaCode::UnknownTopicOrPartition => "UNKNOWN_TOPIC_OR_PARTITION",
            KafkaCode::CoordinatorLoadInProgress => "COORDINATOR_LOAD_IN_PROGRESS",
            KafkaCode::CoordinatorNotAvailable => "COORDINATOR_NOT_AVAILABLE",
            KafkaCode::NotCoordinator => "NOT_COORDINATOR",
            KafkaCode::IllegalGeneration => "ILLEGAL_GENERATION",
            KafkaCode::InconsistentGroupProtocol => "INCONSISTENT_GROUP_PROTOCOL",
            KafkaCode::InvalidGroupId => "INVALID_GROUP_ID",
            KafkaCode::UnknownMemberId => "UNKNOWN_MEMBER_ID",
            KafkaCode::InvalidSessionTimeout => "INVALID_SESSION_TIMEOUT",
            KafkaCode::RebalanceInProgress => "REBALANCE_IN_PROGRESS",
            KafkaCode::InvalidCommitOffsetSize => "INVALID_COMMIT_OFFSET_SIZE",
            KafkaCode::TopicAuthorizationFailed => "TOPIC_AUTHORIZATION_FAILED",
            KafkaCode::GroupAuthorizationFailed => "GROUP_AUTHORIZATION_FAILED",
        }
    }
}

impl std::fmt::Display for KafkaCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.as_str(), self.as_i16())
    }
}
