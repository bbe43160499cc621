//! Classified errors that decide the process exit code.
//!
//! Almost everything in this crate returns [`anyhow::Result`]. The few errors
//! which need to be told apart at the top level are wrapped in an
//! [`ExtractError`], and [`exit_code_for`] digs them back out of the chain.

use std::{error, fmt};

/// What kind of failure stopped the run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad flags, unknown preset, invalid preset file.
    Usage,
    /// The document cannot be opened, or the output root is not writable.
    DocumentUnreadable,
    /// The run was interrupted between pages.
    Aborted,
}

impl ErrorKind {
    /// The process exit code for this kind.
    pub fn exit_code(self) -> u8 {
        match self {
            ErrorKind::Usage => 1,
            ErrorKind::DocumentUnreadable => 2,
            ErrorKind::Aborted => 4,
        }
    }
}

/// An error with a known [`ErrorKind`].
#[derive(Debug)]
pub struct ExtractError {
    kind: ErrorKind,
    message: String,
}

impl ExtractError {
    pub fn usage(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Usage,
            message: message.into(),
        }
    }

    pub fn document_unreadable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::DocumentUnreadable,
            message: message.into(),
        }
    }

    pub fn aborted(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::Aborted,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl fmt::Display for ExtractError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl error::Error for ExtractError {}

/// Exit code for successful runs in which some pages failed.
pub const PARTIAL_EXIT_CODE: u8 = 3;

/// Map a top-level error to an exit code. Errors without a classified cause
/// are treated as an unreadable document, since they abort before any
/// output is produced.
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ExtractError>())
        .map(ExtractError::kind)
        .unwrap_or(ErrorKind::DocumentUnreadable)
        .exit_code()
}
