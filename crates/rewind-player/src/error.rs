//! Error Types for the Playback Layer
//!
//! Most failures during playback are *not* errors here: chunk corruption,
//! retry exhaustion, and unknown encodings become [`rewind_core::Problem`]s
//! and playback continues. This enum covers the failures that genuinely
//! stop a player: a source that cannot be opened, a merge with no valid
//! time range, or an operation issued in a state that cannot accept it.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("storage error: {0}")]
    Log(#[from] rewind_log::Error),

    #[error("source {index} failed to initialize: {source}")]
    SourceInit {
        index: usize,
        #[source]
        source: rewind_log::Error,
    },

    #[error("no source produced a valid time range")]
    NoValidTimeRange,

    #[error("player is not initialized")]
    NotInitialized,

    #[error("player is in the error state")]
    Halted,

    #[error("player is shutting down")]
    ShuttingDown,

    #[error("decode error for encoding {encoding}: {message}")]
    Decode { encoding: String, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;
