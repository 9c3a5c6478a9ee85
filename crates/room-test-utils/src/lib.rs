//! # Room Test Utilities
//!
//! Shared test utilities for Quorum: an in-process harness that wires
//! real client sessions to a real room controller over
//! `tokio::io::duplex` pipes, with a static token verifier standing in
//! for the identity collaborator and the loopback relay standing in
//! for the relay engine.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use room_test_utils::TestHarness;
//!
//! #[tokio::test]
//! async fn test_example() {
//!     let harness = TestHarness::new();
//!     let host = harness.spawn_session("Ada").await;
//!     let room = host.handle.create_room("Standup", 10, Default::default()).await.unwrap();
//!     // ...
//! }
//! ```

pub mod eventual;
pub mod harness;
pub mod verifier;

pub use eventual::eventually;
pub use harness::{TestHarness, TestSession};
pub use verifier::StaticVerifier;
