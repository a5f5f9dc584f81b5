//! Shared utilities for pglift integration tests.
//!
//! - `TestHarness`: a site in a temporary directory with a `Context`
//! - `FakeRunner`: scripted PostgreSQL programs
//! - builders for manifests

pub mod builders;
pub mod fake;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
