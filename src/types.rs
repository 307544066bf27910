//! Error types shared by the planner, the code generator and the driver.

use thiserror::Error;

/// Why the planner refused a convolution shape.
///
/// A rejection is an ordinary outcome: the caller is expected to fall back
/// to another kernel variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnimplementedReason {
    #[error("layout mismatch: {0}")]
    LayoutMismatch(String),
    #[error("{what} channels ({channels}) are not a multiple of the SIMD width {simd_w}")]
    ChannelDivisibility {
        what: &'static str,
        channels: usize,
        simd_w: usize,
    },
    #[error("padding does not fit the tiling: {0}")]
    PaddingTilingFit(String),
    #[error("right padding of the last full tile ({r_pad}) exceeds one tile width ({ur_w})")]
    TailPaddingFit { r_pad: usize, ur_w: usize },
    #[error("invalid shape: {0}")]
    InvalidShape(String),
}

#[derive(Debug, Error)]
pub enum ConvError {
    #[error("unimplemented: {0}")]
    Unimplemented(#[from] UnimplementedReason),
    #[error("codegen error: {0}")]
    Codegen(String),
    #[error("executable memory error: {0}")]
    Executable(String),
    #[error("unsupported ISA: {0}")]
    UnsupportedIsa(String),
    #[error("shape mismatch for {tensor}: expected {expected} elements, got {got}")]
    ShapeMismatch {
        tensor: &'static str,
        expected: usize,
        got: usize,
    },
}

impl ConvError {
    /// True when the planner rejected the shape (caller should fall back).
    pub fn is_unimplemented(&self) -> bool {
        matches!(self, ConvError::Unimplemented(_))
    }
}

pub type ConvResult<T> = Result<T, ConvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unimplemented_converts() {
        let err: ConvError = UnimplementedReason::TailPaddingFit { r_pad: 4, ur_w: 3 }.into();
        assert!(err.is_unimplemented());
        assert_eq!(
            err.to_string(),
            "unimplemented: right padding of the last full tile (4) exceeds one tile width (3)"
        );
    }

    #[test]
    fn test_codegen_is_not_unimplemented() {
        assert!(!ConvError::Codegen("bad operand".into()).is_unimplemented());
    }
}
