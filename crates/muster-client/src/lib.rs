//! muster-client — consumer-group coordination on top of an external Kafka client
//!
//! This crate is a client-side participant in the Kafka 0.9+ consumer-group
//! protocol: many processes sharing a group name cooperatively consume the
//! partitions of their subscribed topics, each partition read by exactly one
//! member at a time, with committed offsets advancing only past messages the
//! application acknowledged.
//!
//! The wire protocol, broker discovery and partition fetch loops live behind
//! the traits of [`muster_protocol`]; this crate owns the interesting parts:
//! the membership state machine, the per-topic workers with their
//! acknowledgement tracking, and the pluggable partitioner.
//!
//! # Example
//!
//! ```ignore
//! use muster_client::{GroupClient, GroupConfig};
//!
//! let client = GroupClient::connect("analytics", GroupConfig::default(), kafka).await?;
//! let mut consumer = client.subscribe("orders").await?;
//!
//! let mut messages = consumer.messages();
//! while let Some(msg) = messages.recv().await {
//!     handle(&msg);
//!     consumer.done(&msg);
//! }
//! ```
//!
//! Delivery is at-least-once: commits cover only acknowledged prefixes, and
//! after a rebalance at most 63 already-acknowledged offsets per partition
//! may be seen again (the acknowledgement tracker works in buckets of 64).

pub mod client;
pub mod config;
pub mod consumer;
pub mod error;
pub mod partitioner;
mod tracker;

pub use client::GroupClient;
pub use config::GroupConfig;
pub use consumer::TopicConsumer;
pub use error::{ClientError, Result};
pub use partitioner::{Partitioner, RoundRobin, ROUND_ROBIN_PROTOCOL};

// Re-exported so applications can name the message and trait types without
// depending on the protocol crate directly.
pub use muster_protocol::{ConsumerMessage, KafkaClient, MIN_BROKER_VERSION};
