//! Error types for the collector.

use crate::domain::DomainId;
use crate::kind::AllocKind;
use crate::trace::ThingRef;
use thiserror::Error;

/// Errors surfaced by the collector's public interface.
///
/// Allocation failure is the only error a well-behaved mutator should ever
/// see at runtime; the remaining variants report misuse of the API.
#[derive(Debug, Error)]
pub enum GcError {
    /// The heap could not satisfy an allocation even after a last-ditch GC.
    #[error("out of memory allocating {kind:?} in domain {domain}")]
    OutOfMemory {
        /// Domain the allocation was requested in
        domain: DomainId,
        /// Requested allocation kind
        kind: AllocKind,
    },

    /// The domain does not exist (never created or already destroyed).
    #[error("unknown domain {0}")]
    UnknownDomain(DomainId),

    /// The reference does not name a live thing.
    #[error("invalid thing reference {0}")]
    InvalidThing(ThingRef),

    /// The thing does not live in the domain the operation expected.
    #[error("thing {thing} does not belong to domain {expected}")]
    DomainMismatch {
        /// Offending thing
        thing: ThingRef,
        /// Domain the operation required
        expected: DomainId,
    },

    /// The operation is not permitted on the atoms domain.
    #[error("operation not permitted on the atoms domain")]
    AtomsDomain,

    /// The background helper thread could not be started.
    #[error("failed to spawn GC helper thread: {0}")]
    HelperThread(#[from] std::io::Error),

    /// Configuration could not be parsed.
    #[error("invalid GC configuration: {0}")]
    Config(#[from] serde_json::Error),
}

/// Result type for collector operations.
pub type GcResult<T> = Result<T, GcError>;
