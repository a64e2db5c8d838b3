//! Object transform pipeline test infrastructure
//!
//! Cross-module scenarios for the transform chain: round trips over every engine and key size,
//! tamper detection, master key rotation, configuration-driven chains and property tests.

pub mod harness;
pub mod proptest_pipeline;

#[cfg(test)]
mod tamper_tests;

pub use harness::{init_test_tracing, load, payload, sha1_hex, store, StoredObject, TestEnv};
pub use proptest_pipeline::{arb_data, arb_metadata};
