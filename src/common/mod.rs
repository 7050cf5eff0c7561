//! Shared infrastructure: retry backoff.

pub mod backoff;

pub use backoff::Backoff;
