// File: `crates/rbx-cud/src/lib.rs`
//! # rbx-cud
//!
//! Cud (create/update/delete) protocol of a Replibox databox.
//!
//! This crate provides:
//! - The wire model of operations and packages ([`CudOperation`], [`CudPackage`])
//! - Selectors made of concrete keys and [`DbQuery`] conditions
//! - Dispatch of packages onto a [`rbx_core::Head`] ([`apply_package`])
//!
//! ## Example
//!
//! ```rust
//! use rbx_core::{ComponentOptions, Head};
//! use rbx_cud::{apply_package, CudId, CudOperation, CudPackage};
//! use serde_json::json;
//!
//! let mut head = Head::from_raw(json!({"___o___": {"a": 1}}), ComponentOptions::default());
//! let package = CudPackage::new(CudId(1), 5, vec![CudOperation::insert(["b"], json!(2))]);
//!
//! let report = apply_package(&mut head, &package, true);
//! assert!(report.data_changed);
//! assert_eq!(head.data(), json!({"a": 1, "b": 2}));
//! ```

pub mod dispatch;
pub mod error;
pub mod operation;
pub mod query;

pub use dispatch::{apply_operation, apply_package, ApplyReport, CudApplied};
pub use error::{CudError, Result};
pub use operation::{CudId, CudOperation, CudPackage, CudType, SelectorItem};
pub use query::{DbQuery, Query};
