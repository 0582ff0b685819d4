#![warn(missing_docs)]
#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

mod group;

pub mod hash_table;

/// A hash map implementation backed by the graveyard `HashTable`.
///
/// This module provides a `HashMap` that wraps the `HashTable` and provides
/// a standard key-value map interface with configurable hashers.
pub mod hash_map;

/// A hash set implementation backed by the graveyard `HashTable`.
///
/// This module provides a `HashSet` that wraps the `HashTable` and provides
/// a standard set interface with configurable hashers.
pub mod hash_set;

pub mod telemetry;

pub use hash_map::HashMap;
pub use hash_set::HashSet;
pub use hash_table::Entry;
pub use hash_table::HashTable;
pub use telemetry::Telemetry;
