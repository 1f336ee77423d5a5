//! Consumer-protocol membership blobs
//!
//! The Kafka group coordinator relays two opaque byte blobs between members
//! without interpreting them: each member's subscription metadata (carried in
//! JoinGroup) and the per-member assignment the leader computes (carried in
//! SyncGroup). Their layout is fixed by the standard consumer protocol:
//!
//! ```text
//! Subscription       = version:i16  topics:[string]  user_data:bytes
//! MemberAssignment   = version:i16  [topic:string partitions:[i32]]  user_data:bytes
//! ```
//!
//! Encoding and decoding these blobs is the one piece of wire format this
//! client owns.

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec;
use crate::error::TransportResult;

/// The protocol type every Kafka consumer declares on JoinGroup.
pub const PROTOCOL_TYPE: &str = "consumer";

/// Minimum broker version the coordination protocol requires. Callers should
/// configure the external Kafka client with at least this version.
pub const MIN_BROKER_VERSION: &str = "0.9.0";

/// A member's subscription metadata: which topics it wants to consume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub version: i16,
    pub topics: Vec<String>,
    pub user_data: Bytes,
}

impl Subscription {
    pub fn new(version: i16, mut topics: Vec<String>) -> Self {
        // Deterministic blob for a given topic set.
        topics.sort_unstable();
        Self {
            version,
            topics,
            user_data: Bytes::new(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i16(self.version);
        codec::put_array(&mut buf, &self.topics, |b, t| codec::put_string(b, t));
        codec::put_bytes(&mut buf, &self.user_data);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> TransportResult<Self> {
        let version = codec::get_i16(&mut raw)?;
        let topics = codec::get_array(&mut raw, codec::get_string)?;
        let user_data = codec::get_bytes(&mut raw)?;
        Ok(Self {
            version,
            topics,
            user_data,
        })
    }
}

/// The partitions assigned to one member for one generation, keyed by topic.
///
/// Topics are kept in a `BTreeMap` so the encoded blob is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberAssignment {
    pub version: i16,
    pub topics: BTreeMap<String, Vec<i32>>,
    pub user_data: Bytes,
}

impl MemberAssignment {
    pub fn new(version: i16) -> Self {
        Self {
            version,
            topics: BTreeMap::new(),
            user_data: Bytes::new(),
        }
    }

    /// Append one partition to a topic's assignment.
    pub fn add_partition(&mut self, topic: impl Into<String>, partition: i32) {
        self.topics.entry(topic.into()).or_default().push(partition);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i16(self.version);
        let entries: Vec<(&String, &Vec<i32>)> = self.topics.iter().collect();
        codec::put_array(&mut buf, &entries, |b, (topic, partitions)| {
            codec::put_string(b, topic);
            codec::put_array(b, partitions, |b, p| b.put_i32(*p));
        });
        codec::put_bytes(&mut buf, &self.user_data);
        buf.freeze()
    }

    pub fn decode(mut raw: Bytes) -> TransportResult<Self> {
        let version = codec::get_i16(&mut raw)?;
        let entries = codec::get_array(&mut raw, |b| {
            let topic = codec::get_string(b)?;
            let partitions = codec::get_array(b, codec::get_i32)?;
            Ok((topic, partitions))
        })?;
        let user_data = codec::get_bytes(&mut raw)?;
        Ok(Self {
            version,
            topics: entries.into_iter().collect(),
            user_data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn subscription_roundtrip() {
        let sub = Subscription::new(1, vec!["orders".into(), "audit".into()]);
        let decoded = Subscription::decode(sub.encode()).unwrap();
        assert_eq!(decoded, sub);
        // Topic order is normalized on construction.
        assert_eq!(decoded.topics, vec!["audit".to_string(), "orders".into()]);
    }

    #[test]
    fn assignment_roundtrip() {
        let mut ma = MemberAssignment::new(1);
        ma.add_partition("orders", 0);
        ma.add_partition("orders", 2);
        ma.add_partition("audit", 1);
        let decoded = MemberAssignment::decode(ma.encode()).unwrap();
        assert_eq!(decoded, ma);
        assert_eq!(decoded.topics["orders"], vec![0, 2]);
    }

    #[test]
    fn empty_assignment_roundtrip() {
        let ma = MemberAssignment::new(1);
        let decoded = MemberAssignment::decode(ma.encode()).unwrap();
        assert!(decoded.topics.is_empty());
        assert_eq!(decoded.version, 1);
    }

    #[test]
    fn truncated_blob_is_rejected() {
        assert!(Subscription::decode(Bytes::from_static(&[0])).is_err());
        assert!(MemberAssignment::decode(Bytes::from_static(&[0, 1, 0, 0])).is_err());
    }

    proptest! {
        #[test]
        fn subscription_roundtrip_any(
            version in 0i16..16,
            topics in proptest::collection::vec("[a-z]{1,12}", 0..8),
        ) {
            let sub = Subscription::new(version, topics);
            let decoded = Subscription::decode(sub.encode()).unwrap();
            prop_assert_eq!(decoded, sub);
        }

        #[test]
        fn assignment_roundtrip_any(
            version in 0i16..16,
            topics in proptest::collection::btree_map(
                "[a-z]{1,12}",
                proptest::collection::vec(0i32..64, 0..8),
                0..6,
            ),
        ) {
            let ma = MemberAssignment { version, topics, user_data: Bytes::new() };
            let decoded = MemberAssignment::decode(ma.encode()).unwrap();
            prop_assert_eq!(decoded, ma);
        }

        #[test]
        fn decode_never_panics(raw in proptest::collection::vec(any::<u8>(), 0..256)) {
            let raw = Bytes::from(raw);
            let _ = Subscription::decode(raw.clone());
            let _ = MemberAssignment::decode(raw);
        }
    }
}
