//! Error taxonomy shared by the library modules.
//!
//! Decode problems never show up here: the envelope decoder is total and
//! coerces bad fields to zero. What remains are storage and transport
//! failures, which callers either retry (the transform view) or surface.
use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("frame encoding error: {0}")]
    Encode(#[from] bincode::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("corrupt frame in {path:?} at byte {offset}: {reason}")]
    Corrupt {
        path: PathBuf,
        offset: u64,
        reason: String,
    },

    #[error("shut down")]
    ShutDown,
}

pub type Result<T> = std::result::Result<T, PipelineError>;
