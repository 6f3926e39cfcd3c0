//! Error type shared across the crate.

use thiserror::Error;

/// Catch-all error for this crate.
#[derive(Debug, Error)]
pub enum Error {
    /// Two pair states with mismatched endpoints were combined.
    #[error("cannot combine pair states: endpoint {left} does not match endpoint {right}")]
    NotComposable {
        /// Endpoint supplied by the left operand.
        left: usize,
        /// Endpoint supplied by the right operand.
        right: usize,
    },
    /// Operands belong to different state families or chemical species.
    #[error("mixed operands: {0}")]
    WrongType(String),
    /// A composed state fell outside the enumerated shell; the kinetic shell
    /// must be at least one hop larger than the thermodynamic shell.
    #[error("state {0} is missing from the Green-function star set")]
    OutOfShell(String),
    /// A query was made before the thermodynamic shell was generated.
    #[error("thermodynamic shell not initialized; generate with at least one shell first")]
    ShellNotInitialized,
    /// An input slice disagrees with the corresponding site list or network.
    #[error("length of `{name}` is {found}, expected {expected}")]
    ShapeMismatch {
        /// Name of the offending input.
        name: &'static str,
        /// Length required by the site list or network.
        expected: usize,
        /// Length that was supplied.
        found: usize,
    },
    /// An error that originates in this crate.
    #[error("{0}")]
    General(String),
    /// Error that does not originate from this crate.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Shorthand for results carrying [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;
