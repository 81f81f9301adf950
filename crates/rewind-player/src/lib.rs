//! rewind Playback Layer
//!
//! This crate turns one or more chunked recordings into a single ordered,
//! resumable, memory-bounded stream of timestamped events.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │ Player                                       │  play / pause / seek /
//! │ - state machine, tick task, subscriptions    │  set_speed / on_messages
//! └───────────────────────┬──────────────────────┘
//!                         ▼
//! ┌──────────────────────────────────────────────┐
//! │ BufferedSource                               │  read-ahead producer,
//! │ - time-window bounded queue, cancellation    │  backpressure
//! └───────────────────────┬──────────────────────┘
//!                         ▼
//! ┌──────────────────────────────────────────────┐
//! │ CachingSource                                │  decoded-message blocks,
//! │ - LRU under a byte ceiling, topic backfill   │  decode-once
//! └───────────────────────┬──────────────────────┘
//!                         ▼
//! ┌──────────────────────────────────────────────┐
//! │ MergedSource                                 │  k-way merge,
//! │ - (time, source index) min-heap              │  deterministic ties
//! └──────┬──────────────────┬────────────────────┘
//!        ▼                  ▼
//! ┌──────────────┐   ┌──────────────┐
//! │ LogSource    │   │ LogSource    │   one per recording
//! └──────────────┘   └──────────────┘
//! ```
//!
//! Every layer implements the same [`IterableSource`] contract, so the
//! stack composes freely and each layer is testable in isolation.

pub mod buffered;
pub mod caching;
pub mod config;
pub mod controller;
pub mod decode;
pub mod error;
pub mod merge;
pub mod source;

#[cfg(test)]
pub(crate) mod testutil;

pub use buffered::{BufferedIterator, BufferedSource};
pub use caching::{CachingSource, CachingSourceConfig};
pub use config::{InitFailurePolicy, PlayerConfig};
pub use controller::{MessageBatchCallback, Player, PlayerState};
pub use decode::{DecoderRegistry, MessageDecoder, WELL_KNOWN_ENCODINGS};
pub use error::{Error, Result};
pub use merge::MergedSource;
pub use source::{
    Initialization, IterableSource, IteratorItem, LogSource, MessageIterator, ReadArgs,
    ResourceDescriptor,
};
