//! Bourdain image ingest worker.
//!
//! Accepts jobs naming a target card and a source URL, fetches the image,
//! validates and classifies it, produces a canonical set of WebP size
//! variants, and records the results in the card catalog.

pub mod catalog;
pub mod collage_detector;
pub mod config;
pub mod decoder;
pub mod derivatives;
pub mod events;
pub mod fetcher;
pub mod hashing;
pub mod pipeline;
pub mod rate_limiter;
pub mod side_detector;
pub mod storage;
pub mod vision;

#[cfg(test)]
mod tests;

pub use pipeline::{ImageJob, IngestPipeline, ProcessResult, ProcessStatus};

/// Result type for bootstrap code in the worker binary.
pub type WorkerResult<T> = anyhow::Result<T>;
