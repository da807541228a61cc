//! Error types for membership operations.

use std::time::Duration;

use crate::{SiloAddress, SiloStatus};

/// Errors that can occur during membership operations.
///
/// A lost compare-and-swap is not an error: table writes report it as
/// `Ok(false)` and the retry loop decides what to do with it.
#[derive(Debug, thiserror::Error)]
pub enum MembershipError {
    /// Socket or file failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The table backend failed to read or write (storage or transport).
    #[error("membership table error: {0}")]
    Table(String),

    /// A conditional write kept losing to concurrent writers until the
    /// time budget ran out.
    #[error("{op} lost write contention after {attempts} attempts in {elapsed:?}")]
    Contention {
        op: &'static str,
        attempts: u32,
        elapsed: Duration,
    },

    /// A retried operation kept failing until the time budget ran out.
    #[error("{op} failed after {attempts} attempts: {source}")]
    RetriesExhausted {
        op: &'static str,
        attempts: u32,
        #[source]
        source: Box<MembershipError>,
    },

    /// A protocol invariant was broken. The instance stops itself.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The table already records this silo as dead.
    #[error("silo {0} is marked dead in the membership table")]
    FoundMyselfDead(SiloAddress),

    /// The silo has no row in the membership table.
    #[error("silo {0} not found in the membership table")]
    UnknownSilo(SiloAddress),

    /// A liveness ping got no answer.
    #[error("ping to {target} failed: {reason}")]
    PingFailed { target: SiloAddress, reason: String },

    /// Some active silos did not answer the pre-join connectivity check.
    #[error("{failed} of {total} active silos did not answer the join connectivity check")]
    ConnectivityCheckFailed { failed: usize, total: usize },

    /// The oracle was asked to act in a status that does not allow it.
    #[error("operation not allowed while silo is {0}")]
    InvalidStatus(SiloStatus),

    /// A row, address or message could not be decoded.
    #[error("parse error: {0}")]
    Parse(String),

    /// Configuration error.
    #[error("invalid membership configuration: {0}")]
    Configuration(String),
}

impl MembershipError {
    /// Returns true if retrying the operation cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            MembershipError::Protocol(_)
                | MembershipError::FoundMyselfDead(_)
                | MembershipError::InvalidStatus(_)
                | MembershipError::Configuration(_)
        )
    }

    /// Creates a table error from any displayable failure.
    pub fn table(reason: impl std::fmt::Display) -> Self {
        MembershipError::Table(reason.to_string())
    }

    /// Creates a parse error from any displayable failure.
    pub fn parse(reason: impl std::fmt::Display) -> Self {
        MembershipError::Parse(reason.to_string())
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, MembershipError>;
