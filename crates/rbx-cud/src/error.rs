//! Error types for decoding cud packages.

use crate::operation::CudType;
use thiserror::Error;

/// Structural problems with a cud package received from the wire.
///
/// A rejected mutation (stale timestamp, missing key, failed guard) is not
/// an error; it shows up as [`ModifyLevel::Nothing`](rbx_core::ModifyLevel).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CudError {
    #[error("Unknown cud type code: {0}")]
    UnknownType(u8),

    #[error("{0:?} operation without a value")]
    MissingValue(CudType),

    #[error("Malformed cud package: {0}")]
    Malformed(String),
}

impl From<serde_json::Error> for CudError {
    fn from(err: serde_json::Error) -> Self {
        CudError::Malformed(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CudError>;
