//! Integration tests for `logfold`
//!
//! This crate contains tests that drive engines from the `logfold` crate
//! against the in-memory log from `logfold-memory`, including several engines
//! sharing one log.

// This is a test-only crate
#![cfg(test)]
