//! Scripted in-memory sources for unit tests.

use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use rewind_core::{MessageEvent, Time, TimeRange};

use crate::error::Result;
use crate::source::{
    Initialization, IterableSource, IteratorItem, MessageIterator, ReadArgs,
};

/// Build a test message on `topic` at time `t` with a small payload.
pub fn msg(topic: &str, t: Time) -> MessageEvent {
    msg_sized(topic, t, 8)
}

/// Build a test message with an explicit payload size.
pub fn msg_sized(topic: &str, t: Time, payload_len: usize) -> MessageEvent {
    MessageEvent {
        topic: topic.to_string(),
        receive_time: t,
        publish_time: None,
        data: Bytes::from(vec![0xAB; payload_len]),
        schema_name: "Test".to_string(),
        size_in_bytes: MessageEvent::estimated_size(topic, "Test", payload_len),
    }
}

/// An [`IterableSource`] over a fixed, pre-sorted list of events.
///
/// Tracks how many iterators have been created so cache tests can assert
/// decode-once behavior.
pub struct ScriptedSource {
    events: Vec<MessageEvent>,
    iterators_created: AtomicUsize,
    fail_init: bool,
}

impl ScriptedSource {
    pub fn new(mut events: Vec<MessageEvent>) -> Self {
        events.sort_by_key(|e| e.receive_time);
        Self {
            events,
            iterators_created: AtomicUsize::new(0),
            fail_init: false,
        }
    }

    pub fn failing() -> Self {
        Self {
            events: Vec::new(),
            iterators_created: AtomicUsize::new(0),
            fail_init: true,
        }
    }

    pub fn iterators_created(&self) -> usize {
        self.iterators_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IterableSource for ScriptedSource {
    async fn initialize(&self) -> Result<Initialization> {
        if self.fail_init {
            return Err(crate::error::Error::NoValidTimeRange);
        }
        let range = match (self.events.first(), self.events.last()) {
            (Some(first), Some(last)) => TimeRange::new(first.receive_time, last.receive_time),
            _ => TimeRange::new(0, 0),
        };
        Ok(Initialization {
            time_range: range,
            channels: Vec::new(),
            schemas: Vec::new(),
            statistics: None,
        })
    }

    async fn message_iterator(&self, args: ReadArgs) -> Result<Box<dyn MessageIterator>> {
        self.iterators_created.fetch_add(1, Ordering::SeqCst);
        let events: Vec<MessageEvent> = self
            .events
            .iter()
            .filter(|e| args.range.contains(e.receive_time))
            .filter(|e| {
                args.topics
                    .as_ref()
                    .map(|t| t.contains(&e.topic))
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        Ok(Box::new(ScriptedIterator { events, next: 0 }))
    }

    async fn get_backfill(
        &self,
        time: Time,
        topics: &HashSet<String>,
    ) -> Result<Vec<MessageEvent>> {
        let mut latest: std::collections::HashMap<&str, &MessageEvent> =
            std::collections::HashMap::new();
        for event in &self.events {
            if event.receive_time <= time && topics.contains(&event.topic) {
                latest.insert(event.topic.as_str(), event);
            }
        }
        let mut events: Vec<MessageEvent> = latest.into_values().cloned().collect();
        events.sort_by(|a, b| {
            (a.receive_time, a.topic.as_str()).cmp(&(b.receive_time, b.topic.as_str()))
        });
        Ok(events)
    }
}

struct ScriptedIterator {
    events: Vec<MessageEvent>,
    next: usize,
}

#[async_trait]
impl MessageIterator for ScriptedIterator {
    async fn next(&mut self) -> Option<Result<IteratorItem>> {
        let event = self.events.get(self.next)?.clone();
        self.next += 1;
        // Yield to the scheduler so producer/consumer interleavings in the
        // buffering tests are realistic
        tokio::task::yield_now().await;
        Some(Ok(IteratorItem::Message(event)))
    }
}
