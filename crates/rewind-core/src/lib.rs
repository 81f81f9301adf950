//! Core data model for the rewind playback engine.
//!
//! This crate holds the types shared by every layer of the engine: the
//! timeline representation, the message/channel/schema model produced by
//! recording decoders, subscriptions, and the non-fatal problem log.
//!
//! It deliberately contains no I/O and no async code so that the format
//! layer (`rewind-log`) and the playback layer (`rewind-player`) can both
//! depend on it without pulling in each other's stacks.

pub mod message;
pub mod problem;
pub mod time;

pub use message::{Channel, MessageEvent, Schema, Subscription};
pub use problem::{Problem, ProblemLog, Severity};
pub use time::{duration_to_nanos, Time, TimeRange};
