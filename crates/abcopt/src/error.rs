//! Error kinds raised by the optimizer.
//!
//! Everything in the crate returns [`anyhow::Result`]; failures that callers
//! may want to classify are raised as an [`AbcError`] so that they survive
//! `.context(..)` wrapping and can be recovered with `downcast_ref`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AbcError {
    /// Malformed input: bad header, truncated data, out-of-range pool index,
    /// unknown instruction or name kind.
    #[error("format error: {0}")]
    Format(String),

    /// Input that is well formed but violates a linking or emission policy.
    #[error("structural error: {0}")]
    Structural(String),

    /// An IR invariant was broken by a pass.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AbcError {
    pub fn format(msg: impl Into<String>) -> anyhow::Error {
        AbcError::Format(msg.into()).into()
    }

    pub fn structural(msg: impl Into<String>) -> anyhow::Error {
        AbcError::Structural(msg.into()).into()
    }

    pub fn internal(msg: impl Into<String>) -> anyhow::Error {
        AbcError::Internal(msg.into()).into()
    }
}

/// Returns the [`AbcError`] carried by `err`, if any.
pub fn classify(err: &anyhow::Error) -> Option<&AbcError> {
    err.chain().find_map(|cause| cause.downcast_ref::<AbcError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn classify_sees_through_context() {
        let err: anyhow::Result<()> = Err(AbcError::format("not an abc file"));
        let err = err.context("failed to read input").unwrap_err();
        assert!(matches!(classify(&err), Some(AbcError::Format(_))));
    }

    #[test]
    fn plain_errors_are_unclassified() {
        let err = anyhow::anyhow!("io");
        assert!(classify(&err).is_none());
    }
}
