//! Taxi ETL Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error handling, logging setup, and checksum utilities used by the
//! taxi-etl workspace members.
//!
//! # Example
//!
//! ```no_run
//! use taxi_common::checksum::{compute_file_checksum, ChecksumAlgorithm};
//! use taxi_common::Result;
//!
//! fn fingerprint(path: &str) -> Result<String> {
//!     compute_file_checksum(path, ChecksumAlgorithm::Sha256)
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{EtlError, Result};
