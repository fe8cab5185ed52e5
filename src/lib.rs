//! Candle ingestion and deduplication pipeline.
//!
//! This crate provides the components used by the `candle-pipeline` binary
//! and the `facts` read tool:
//!
//! - `decode`: total decoder from a raw JSON payload to typed candle values;
//!   malformed fields become zero instead of failing the message
//! - `landing`: append-only landing log of every consumed message, with
//!   subscribers that replay from an offset and follow the tail
//! - `transform`: the continuous view that decodes landed messages, stamps
//!   them with a monotonic `landed_at` and appends them to the fact store
//! - `store`: the fact store, an append-only table of immutable parts whose
//!   background merge keeps only the newest version of each
//!   `(ticker, open_dt, close_dt)`
//! - `merge`: the thread that drives those merges
//! - `record`: on-disk schema and the CRC-checked frame codec shared by the
//!   landing log and the fact store
//!
//! Duplicates are expected: the queue delivers at least once, and replaying
//! the landing log is always allowed. Readers of the store may see several
//! versions of a fact until the next merge, or use
//! [`store::FactStore::query_final`] to collapse them at read time.
pub mod config;
pub mod cursor;
pub mod decode;
pub mod error;
pub mod ingest;
pub mod landing;
pub mod merge;
pub mod record;
pub mod store;
pub mod telemetry;
pub mod timestamp;
pub mod transform;

pub use error::{PipelineError, Result};
