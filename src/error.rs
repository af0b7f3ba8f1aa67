//! Crate-level error taxonomy.
//!
//! Leaf modules carry their own `thiserror` enums; the managers surface every
//! failure as a [`SnapError`] so callers can branch on a stable set of kinds.

use thiserror::Error;

use crate::alloc::Tier;

/// Result alias used across the manager surfaces.
pub type SnapResult<T> = Result<T, SnapError>;

/// The failure kinds the core surfaces to callers.
#[derive(Error, Debug)]
pub enum SnapError {
    /// Handle, context, or model unknown.
    #[error("Not found: {0}")]
    NotFound(String),

    /// KV frame header does not match the target model.
    #[error("Incompatible shape: {reason}")]
    IncompatibleShape { reason: String },

    /// Allocator cannot place the request even after eviction.
    #[error("Out of space: {needed} bytes requested, {available} available in {tier}")]
    OutOfSpace {
        tier: Tier,
        needed: usize,
        available: usize,
    },

    /// Header magic/CRC mismatch, truncated frame, or a missing file behind
    /// an index entry.
    #[error("Corrupt artifact: {0}")]
    CorruptArtifact(String),

    /// The underlying inference call returned an error.
    #[error("Engine failure: {0}")]
    EngineFailure(String),

    /// Cooperative cancellation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Wall-clock deadline exceeded.
    #[error("Operation timed out")]
    Timeout,

    /// Disk read/write/rename failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Caller-supplied parameters failed validation.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

impl SnapError {
    /// Stable string name of the failure kind.
    pub fn kind(&self) -> &'static str {
        match self {
            SnapError::NotFound(_) => "not_found",
            SnapError::IncompatibleShape { .. } => "incompatible_shape",
            SnapError::OutOfSpace { .. } => "out_of_space",
            SnapError::CorruptArtifact(_) => "corrupt_artifact",
            SnapError::EngineFailure(_) => "engine_failure",
            SnapError::Cancelled => "cancelled",
            SnapError::Timeout => "timeout",
            SnapError::Io(_) => "io_error",
            SnapError::InvalidArgument(_) => "invalid_argument",
        }
    }

    /// Whether re-issuing the same call is safe after this error.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SnapError::Cancelled | SnapError::Timeout | SnapError::OutOfSpace { .. }
        )
    }
}

impl From<serde_json::Error> for SnapError {
    fn from(e: serde_json::Error) -> Self {
        SnapError::CorruptArtifact(format!("metadata parse error: {e}"))
    }
}

impl From<crate::kv::CodecError> for SnapError {
    fn from(e: crate::kv::CodecError) -> Self {
        SnapError::CorruptArtifact(e.to_string())
    }
}

impl From<crate::engine::EngineError> for SnapError {
    fn from(e: crate::engine::EngineError) -> Self {
        SnapError::EngineFailure(e.to_string())
    }
}

impl From<crate::alloc::AllocError> for SnapError {
    fn from(e: crate::alloc::AllocError) -> Self {
        match e {
            crate::alloc::AllocError::OutOfSpace {
                tier,
                needed,
                available,
            } => SnapError::OutOfSpace {
                tier,
                needed,
                available,
            },
            crate::alloc::AllocError::UnknownOwner(owner) => SnapError::NotFound(owner),
            crate::alloc::AllocError::Io(e) => SnapError::Io(e),
            other => SnapError::InvalidArgument(other.to_string()),
        }
    }
}

impl From<crate::dequant::DequantError> for SnapError {
    fn from(e: crate::dequant::DequantError) -> Self {
        use crate::dequant::DequantError;
        match e {
            DequantError::SourceMissing(p) => SnapError::NotFound(p.display().to_string()),
            DequantError::NoWorkspace(m) => SnapError::NotFound(m),
            DequantError::Corrupt(msg) => SnapError::CorruptArtifact(msg),
            DequantError::Gguf(g) => SnapError::CorruptArtifact(g.to_string()),
            DequantError::Kernel(k) => SnapError::CorruptArtifact(k.to_string()),
            DequantError::Store(s) => SnapError::Io(std::io::Error::other(s.to_string())),
            DequantError::Io(io) => SnapError::Io(io),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names() {
        assert_eq!(SnapError::NotFound("x".into()).kind(), "not_found");
        assert_eq!(SnapError::Cancelled.kind(), "cancelled");
        assert_eq!(
            SnapError::OutOfSpace {
                tier: Tier::Hot,
                needed: 10,
                available: 5
            }
            .kind(),
            "out_of_space"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(SnapError::Timeout.is_retryable());
        assert!(!SnapError::CorruptArtifact("bad magic".into()).is_retryable());
    }
}
