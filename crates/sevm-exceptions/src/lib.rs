// SPDX-License-Identifier: AGPL-3.0

//! Error taxonomy for the symbolic execution engine.
//!
//! Mirrors the kinds in spec §7: a jump handler, the CFG navigation helpers,
//! and the simulation manager all propagate one of these instead of raising
//! arbitrary exceptions.

use thiserror::Error;

/// Marker for errors that end exploration of the current path rather than
/// escaping the simulation manager entirely.
pub trait PathEndingException: std::error::Error {}

/// Errors raised while stepping a single symbolic state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecError {
    /// A jump's destination register held a non-concrete value.
    #[error("symbolic jump target")]
    SymbolicJumpTarget,

    /// The solver reported `unknown` on a branch probe where a decision was
    /// required to pick a successor.
    #[error("intractable path: solver returned unknown")]
    IntractablePath,

    /// Fallthrough lookup found zero CFG successors for the current block.
    #[error("no successors for block {0}")]
    VMNoSuccessors(String),

    /// Fallthrough lookup found an inconsistent successor set (zero or
    /// multiple matches for a jump destination).
    #[error("unexpected successors for block {0}: {1}")]
    VMUnexpectedSuccessors(String, String),

    /// A handler required data this engine does not model (e.g. remote
    /// storage, an external call's real return value).
    #[error("external data required: {0}")]
    ExternalData(String),

    /// Generic in-handler failure not covered by a more specific kind.
    #[error("VM exception: {0}")]
    VMException(String),
}

impl PathEndingException for ExecError {}

impl ExecError {
    /// Whether this error, raised during fallthrough computation, should be
    /// absorbed into `halt = true` rather than surfaced as `state.error`
    /// (spec §7 propagation policy).
    pub fn halts_silently(&self) -> bool {
        matches!(
            self,
            ExecError::VMNoSuccessors(_) | ExecError::VMUnexpectedSuccessors(_, _)
        )
    }
}

/// Result type used throughout the engine's core crates.
pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbolic_jump_target_message() {
        let err = ExecError::SymbolicJumpTarget;
        assert_eq!(err.to_string(), "symbolic jump target");
    }

    #[test]
    fn no_successors_halts_silently() {
        let err = ExecError::VMNoSuccessors("0x10".to_string());
        assert!(err.halts_silently());
    }

    #[test]
    fn unexpected_successors_halts_silently() {
        let err = ExecError::VMUnexpectedSuccessors("0x10".to_string(), "2 matches".to_string());
        assert!(err.halts_silently());
    }

    #[test]
    fn vm_exception_does_not_halt_silently() {
        let err = ExecError::VMException("division trap".to_string());
        assert!(!err.halts_silently());
    }

    #[test]
    fn intractable_path_does_not_halt_silently() {
        assert!(!ExecError::IntractablePath.halts_silently());
    }
}
