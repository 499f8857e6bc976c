//! Testing infrastructure for tasksmith.
//!
//! Test doubles for every collaborator the executor and coordinator depend on,
//! plus temporary-project fixtures (test-only).
//!
//! # Example
//!
//! ```rust,ignore
//! use tasksmith::testing::{MockVcs, ScriptedProvider, TestFixture};
//!
//! let vcs = MockVcs::new().with_commit_error("index.lock exists");
//! let provider = ScriptedProvider::new().then(result);
//! let fixture = TestFixture::minimal_project();
//! ```

#[cfg(test)]
pub mod fixtures;
pub mod mocks;

#[cfg(test)]
pub use fixtures::*;
pub use mocks::*;
