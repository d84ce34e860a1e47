// File: `crates/rbx-core/src/lib.rs`
//! Component tree of a databox replica.
//!
//! A replica is a tree of [`Node`]s rooted in a [`Head`]. Keyed objects and
//! keyed arrays fence every key with the highest timestamp they accepted for
//! it, so replayed, duplicated or reordered writes converge on the same state.

pub mod head;
pub mod key_array;
pub mod node;
pub mod object;
pub mod options;
pub mod timestamp;

pub use head::Head;
pub use key_array::KeyedArray;
pub use node::{raw, Component, ModifyLevel, Node};
pub use object::KeyedObject;
pub use options::{compare_values, Comparator, ComponentOptions, ValueMerger};
pub use timestamp::{is_newer, Timestamp, TimestampFence};
