//! Message Data Structures
//!
//! This module defines the core types flowing through the playback engine.
//!
//! ## What is a MessageEvent?
//!
//! A `MessageEvent` is a single timestamped message read out of a recording
//! file, similar to:
//! - A ROS bag message
//! - A Kafka record with a timestamp
//! - One sample in a sensor log
//!
//! ## Structure
//!
//! Each event carries:
//! - **topic**: The named stream the message was recorded on (e.g. `/imu`)
//! - **receive_time**: When the recorder logged the message; this is the
//!   timeline position used for ordering, seeking and merging
//! - **publish_time**: When the producer stamped the message, if recorded
//! - **data**: The raw encoded payload (arbitrary bytes)
//! - **schema_name**: Name of the schema the payload was encoded against
//! - **size_in_bytes**: Cost of the event for cache accounting
//!
//! ## Design Decisions
//!
//! - Uses `bytes::Bytes` for zero-copy payloads: cloning an event while it
//!   moves through buffer, cache, and merge never copies the payload
//! - The pipeline never mutates `data`; the bytes delivered to the consumer
//!   are the bytes that were decoded from the file
//! - `size_in_bytes` is computed once at decode time so cache eviction does
//!   not re-measure events

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::time::Time;

/// A single timestamped message produced by playback iteration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEvent {
    /// Topic the message was recorded on
    pub topic: String,

    /// Timeline position of the message (recorder clock)
    pub receive_time: Time,

    /// Producer timestamp, if the recording carried one
    pub publish_time: Option<Time>,

    /// Raw encoded payload
    pub data: Bytes,

    /// Name of the schema describing the payload
    pub schema_name: String,

    /// Approximate in-memory cost, used for cache budgeting
    pub size_in_bytes: usize,
}

impl MessageEvent {
    /// Estimate the in-memory cost of a message with the given payload and
    /// topic/schema strings. Fixed fields are counted at their struct size.
    pub fn estimated_size(topic: &str, schema_name: &str, payload_len: usize) -> usize {
        topic.len() + schema_name.len() + payload_len + 8 + 8 + 8
    }
}

/// A named message stream within a recording.
///
/// Channels are created once while parsing the file header or summary and
/// are immutable afterwards. Every message in the file references a channel
/// by id, and every channel references exactly one schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Channel id, unique within one recording
    pub id: u16,

    /// Topic name (e.g. `/camera/front`)
    pub topic: String,

    /// Id of the schema payloads on this channel are encoded against
    pub schema_id: u16,

    /// Payload encoding (e.g. `json`, `protobuf`, `cdr`)
    pub message_encoding: String,
}

/// A payload schema referenced by one or more channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Schema id, unique within one recording
    pub id: u16,

    /// Schema name (e.g. `sensor_msgs/Imu`)
    pub name: String,

    /// Encoding of the definition itself (e.g. `jsonschema`, `protobuf`)
    pub encoding: String,

    /// Raw schema definition bytes
    pub data: Bytes,
}

/// A consumer's interest in one topic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Subscription {
    /// Topic to deliver messages for
    pub topic: String,

    /// Whether the whole range should be preloaded for this topic rather
    /// than only the window around the playback cursor
    #[serde(default)]
    pub preload: bool,
}

impl Subscription {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            preload: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimated_size_counts_strings_and_payload() {
        let size = MessageEvent::estimated_size("/imu", "sensor_msgs/Imu", 100);
        assert_eq!(size, 4 + 15 + 100 + 24);
    }

    #[test]
    fn test_message_event_clone_shares_payload() {
        let payload = Bytes::from(vec![7u8; 1024]);
        let event = MessageEvent {
            topic: "/scan".to_string(),
            receive_time: 42,
            publish_time: None,
            data: payload.clone(),
            schema_name: "LaserScan".to_string(),
            size_in_bytes: 1024,
        };

        let cloned = event.clone();
        // Bytes clones share the same backing storage
        assert_eq!(cloned.data.as_ptr(), payload.as_ptr());
    }

    #[test]
    fn test_subscription_defaults() {
        let sub = Subscription::new("/tf");
        assert_eq!(sub.topic, "/tf");
        assert!(!sub.preload);
    }
}
