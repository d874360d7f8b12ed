//! Integration test suite entry point
//!
//! All test modules are organized under `tests/integration/`. Each test
//! starts a full `NatEngine` over an in-memory `ChannelDevice`.
//!
//! # Running Integration Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests tcp_redirect
//! ```

mod integration;
