// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Fail-fast error model.
//!
//! Nothing here is recovered locally. A [`PagerError`] returned from fault
//! resolution means the owning domain has been terminated; the value is
//! surfaced so the domain's driver (and tests) can see why.

use thiserror::Error;

use crate::disk::DiskError;
use crate::substrate::{Access, DomainId, SysError};

/// Result alias for pager operations.
pub type Result<T> = core::result::Result<T, PagerError>;

/// Coarse classification of a [`PagerError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// A fault the domain has no business taking.
    ProtocolViolation,
    /// Frames or domains ran out.
    ResourceExhaustion,
    /// The sector device failed.
    StorageFailure,
    /// An internal consistency check failed.
    InvariantBreach,
}

/// Errors produced by fault resolution, fork and the block cache.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum PagerError {
    /// Fault outside any owned range, or a write fault on a non copy-on-write page.
    #[error("domain {domain}: unhandled {access:?} fault at {va:#010x}: {reason}")]
    ProtocolViolation {
        /// Faulting domain.
        domain: DomainId,
        /// Faulting address.
        va: usize,
        /// Access that faulted.
        access: Access,
        /// Why nobody resolved it.
        reason: &'static str,
    },
    /// Frame or domain allocation failed.
    #[error("{op}: {source}")]
    ResourceExhaustion {
        /// Primitive that failed.
        op: &'static str,
        /// Substrate error.
        #[source]
        source: SysError,
    },
    /// Sector read or write failed.
    #[error("sector {sector}: {source}")]
    StorageFailure {
        /// First sector of the failed transfer.
        sector: u32,
        /// Device error.
        #[source]
        source: DiskError,
    },
    /// A consistency check or mapping primitive failed.
    #[error("invariant breach: {0}")]
    InvariantBreach(String),
}

impl PagerError {
    /// Returns the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ProtocolViolation { .. } => ErrorKind::ProtocolViolation,
            Self::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Self::StorageFailure { .. } => ErrorKind::StorageFailure,
            Self::InvariantBreach(_) => ErrorKind::InvariantBreach,
        }
    }

    /// Classifies a failed substrate call made on behalf of `op`.
    pub(crate) fn sys(op: &'static str, err: SysError) -> Self {
        match err {
            SysError::NoMemory | SysError::NoFreeDomain => {
                Self::ResourceExhaustion { op, source: err }
            }
            _ => Self::InvariantBreach(format!("{op}: {err}")),
        }
    }

    pub(crate) fn storage(sector: u32, err: DiskError) -> Self {
        Self::StorageFailure { sector, source: err }
    }

    pub(crate) fn breach(msg: impl Into<String>) -> Self {
        Self::InvariantBreach(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substrate_errors_are_classified() {
        assert_eq!(
            PagerError::sys("page_alloc", SysError::NoMemory).kind(),
            ErrorKind::ResourceExhaustion
        );
        let err = PagerError::sys("page_map", SysError::Invalid);
        assert_eq!(err.kind(), ErrorKind::InvariantBreach);
        assert_eq!(err.to_string(), "invariant breach: page_map: invalid parameter");
    }

    #[test]
    fn storage_errors_keep_their_sector() {
        let err = PagerError::storage(24, DiskError::Io);
        assert_eq!(err.kind(), ErrorKind::StorageFailure);
        assert_eq!(err.to_string(), "sector 24: device i/o error");
    }
}
