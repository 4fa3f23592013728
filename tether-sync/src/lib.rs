//! # tether-sync
//!
//! Digest-gated atomic output for rendered templates.
//!
//! [`FileSink`] writes to disk, [`DrySink`] echoes to a writer instead. Both
//! skip contents whose SHA-256 matches what the destination already holds.

pub mod digest;
pub mod error;
pub mod writer;

pub use digest::DigestCache;
pub use error::SyncError;
pub use writer::{DrySink, FileSink, OutputSink, WriteRequest, WriteResult};
