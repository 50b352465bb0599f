//! Shared utilities for terrascan integration tests.
//!
//! - `TestHarness`: temp directories, blob store, in-memory catalog and
//!   helpers to write band assets and register ready scenes
//! - fake remote services for search, downloads and inference

pub mod fakes;
pub mod harness;

pub use fakes::*;
pub use harness::TestHarness;
