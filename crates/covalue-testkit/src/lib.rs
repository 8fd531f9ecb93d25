//! # CoValue Testkit
//!
//! Testing utilities for CoValue nodes.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: agents, storage backends and in-memory links between nodes
//! - **Generators**: Proptest strategies for JSON values, map and list edits
//! - **Golden vectors**: fixed inputs and outputs of the list pack codec and
//!   stable JSON, for cross-implementation checks
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use covalue_testkit::fixtures::{connect, memory_storage, TestAgent};
//!
//! async fn example() -> covalue::Result<()> {
//!     let server = TestAgent::new().node(Some(memory_storage()))?;
//!     let alice = TestAgent::new();
//!     let client = alice.node(None)?;
//!     let link = connect(&client, &server)?;
//!
//!     let group = client.create_group()?;
//!     client.wait_for_sync(&group).await?;
//!     link.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use covalue_testkit::generators::list_ops;
//!
//! proptest! {
//!     #[test]
//!     fn packing_keeps_ops(ops in list_ops(8)) {
//!         let packed = covalue_core::pack_changes(&ops);
//!         prop_assert_eq!(covalue_core::unpack_changes(&packed).unwrap(), ops);
//!     }
//! }
//! ```
//!
//! ## Golden Vectors
//!
//! ```rust
//! use covalue_testkit::vectors::verify_all_vectors;
//!
//! assert!(verify_all_vectors().iter().all(|(_, ok)| *ok));
//! ```

pub mod fixtures;
pub mod generators;
pub mod vectors;

pub use fixtures::{connect, memory_storage, multi_agent, test_config, Link, TestAgent};
pub use generators::{MapEdits, MapEditsParams};
pub use vectors::{pack_vectors, stringify_vectors, verify_all_vectors, PackVector, StringifyVector};
