//! Definition of faceteer's error and result.

use std::fmt;

use log::error;
use thiserror::Error;

/// The library's error enum
#[derive(Debug, Clone, Error)]
pub enum FaceteerError {
    /// An internal invariant of the formula algebra was broken.
    ///
    /// This always signals a bug in formula-tree construction, never a
    /// user-facing condition. The offending tree shape is part of the message.
    #[error("Internal error: '{0}'. This is a bug in formula tree construction.")]
    InternalError(String),
    /// The request configuration or the supplied inputs were inconsistent.
    #[error("An invalid argument was passed: '{0}'")]
    InvalidArgument(String),
}

impl FaceteerError {
    /// Creates an `InternalError` carrying a rendering of the offending tree,
    /// and logs it so the shape survives for diagnosis.
    pub(crate) fn invariant_violation(msg: &str, tree: &dyn fmt::Display) -> FaceteerError {
        let full_msg = format!("{msg}; offending tree: {tree}");
        error!("{full_msg}");
        FaceteerError::InternalError(full_msg)
    }
}

#[cfg(test)]
mod tests {
    use super::FaceteerError;

    #[test]
    fn test_error_display_carries_context() {
        let err = FaceteerError::InternalError("expected exactly one mutable node".to_string());
        assert!(err.to_string().contains("exactly one mutable node"));
    }
}
