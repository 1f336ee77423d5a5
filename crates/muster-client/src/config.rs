//! Client configuration.

use std::sync::Arc;
use std::time::Duration;

use crate::error::{ClientError, Result};
use crate::partitioner::{Partitioner, RoundRobin};

/// Configuration for a [`GroupClient`].
///
/// Build one with [`GroupConfig::default`], adjust the fields of interest
/// and pass it to [`GroupClient::connect`]. The configuration is read-only
/// once the client holds it.
///
/// [`GroupClient`]: crate::GroupClient
/// [`GroupClient::connect`]: crate::GroupClient::connect
#[derive(Clone)]
pub struct GroupConfig {
    /// Minimum interval between offset commits within a generation
    /// (defaults to 1s). Offsets are additionally committed at every
    /// generation change and on close.
    pub commit_interval: Duration,

    /// Retention of committed offsets at the broker. Zero (the default)
    /// selects the broker's configured retention; as a consequence a
    /// literal zero-millisecond retention cannot be requested. Sub-second
    /// values are truncated to whole milliseconds on the wire.
    pub offset_retention: Duration,

    /// Session timeout negotiated on join (defaults to 30s). Must be within
    /// the broker's allowed range.
    pub session_timeout: Duration,

    /// Rebalance timeout negotiated on join (defaults to 30s). Honored by
    /// brokers >= 0.10.1; older brokers use the session timeout.
    pub rebalance_timeout: Duration,

    /// Interval between heartbeats (defaults to 3s). Must be at most a
    /// third of `session_timeout`.
    pub heartbeat_interval: Duration,

    /// Maps partitions to group members each generation (defaults to
    /// [`RoundRobin`]).
    pub partitioner: Arc<dyn Partitioner>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_secs(1),
            offset_retention: Duration::ZERO,
            session_timeout: Duration::from_secs(30),
            rebalance_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(3),
            partitioner: Arc::new(RoundRobin),
        }
    }
}

impl std::fmt::Debug for GroupConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroupConfig")
            .field("commit_interval", &self.commit_interval)
            .field("offset_retention", &self.offset_retention)
            .field("session_timeout", &self.session_timeout)
            .field("rebalance_timeout", &self.rebalance_timeout)
            .field("heartbeat_interval", &self.heartbeat_interval)
            .finish_non_exhaustive()
    }
}

impl GroupConfig {
    /// Validate the configuration. Called by [`GroupClient::connect`].
    ///
    /// [`GroupClient::connect`]: crate::GroupClient::connect
    pub fn validate(&self) -> Result<()> {
        if self.commit_interval.is_zero() {
            return Err(ClientError::Config("commit_interval must be non-zero".into()));
        }
        if self.session_timeout.is_zero() {
            return Err(ClientError::Config("session_timeout must be non-zero".into()));
        }
        if self.rebalance_timeout.is_zero() {
            return Err(ClientError::Config(
                "rebalance_timeout must be non-zero".into(),
            ));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ClientError::Config(
                "heartbeat_interval must be non-zero".into(),
            ));
        }
        if self.heartbeat_interval > self.session_timeout / 3 {
            return Err(ClientError::Config(format!(
                "heartbeat_interval ({:?}) must be at most a third of session_timeout ({:?})",
                self.heartbeat_interval, self.session_timeout
            )));
        }
        Ok(())
    }

    /// The retention value OffsetCommit v2 carries: whole milliseconds, or
    /// -1 when zero was configured, meaning "use the broker's default".
    pub(crate) fn retention_time_ms(&self) -> i64 {
        if self.offset_retention.is_zero() {
            -1
        } else {
            self.offset_retention.as_millis() as i64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(GroupConfig::default().validate().is_ok());
    }

    #[test]
    fn heartbeat_must_fit_session_timeout() {
        let config = GroupConfig {
            session_timeout: Duration::from_secs(6),
            heartbeat_interval: Duration::from_secs(3),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));

        let config = GroupConfig {
            session_timeout: Duration::from_secs(9),
            heartbeat_interval: Duration::from_secs(3),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_timeouts_rejected() {
        for field in 0..4 {
            let mut config = GroupConfig::default();
            match field {
                0 => config.commit_interval = Duration::ZERO,
                1 => config.session_timeout = Duration::ZERO,
                2 => config.rebalance_timeout = Duration::ZERO,
                _ => config.heartbeat_interval = Duration::ZERO,
            }
            assert!(config.validate().is_err(), "field {field} accepted zero");
        }
    }

    #[test]
    fn zero_retention_encodes_broker_default() {
        let config = GroupConfig::default();
        assert_eq!(config.retention_time_ms(), -1);

        let config = GroupConfig {
            offset_retention: Duration::from_secs(7 * 24 * 3600),
            ..Default::default()
        };
        assert_eq!(config.retention_time_ms(), 7 * 24 * 3600 * 1000);
    }
}
