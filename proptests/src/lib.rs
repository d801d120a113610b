//! Property-based tests for the Strand fleet scheduler.
//!
//! ## Running Tests
//!
//! ```bash
//! # Run all property tests
//! cargo test -p proptests
//!
//! # Run with more test cases (slower but more thorough)
//! PROPTEST_CASES=10000 cargo test -p proptests
//!
//! # Run a specific test module
//! cargo test -p proptests election
//! ```
//!
//! ## Test Categories
//!
//! - **Election tests**: Validator split invariants (quota, disjointness,
//!   coverage, determinism)
//! - **Placement tests**: Edge/candidate selector constraints (exclusion,
//!   disk filter, dual-constraint stop condition)
//! - **Codec tests**: Report envelope and validation result round-trips

// Re-export for use in test modules
pub use common;
pub use scheduler;

/// Shared test strategies and helpers.
pub mod strategies;

// Test modules
#[cfg(test)]
mod codec;
#[cfg(test)]
mod election;
#[cfg(test)]
mod placement;
