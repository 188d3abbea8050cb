//! Typed error contract for graph reconstruction.
//!
//! Every failure aborts the pass: there is no partial-success result.
//! Structural errors (bad input to a single call) surface at that call;
//! unsatisfiability errors surface only from `run_completion` once no
//! further progress is possible.

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecyclePhase;
use crate::object_id::ObjectId;

// ---------------------------------------------------------------------------
// FixupError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
pub enum FixupError {
    #[error("invalid argument `{parameter}`: {reason}")]
    InvalidArgument { parameter: String, reason: String },
    #[error("a value was already registered for {0}")]
    DuplicateRegistration(ObjectId),
    #[error("{0} was referenced but never registered")]
    ObjectNeverSeen(ObjectId),
    #[error("{0} is an object reference that never resolved to a real object")]
    IncompleteObjectReference(ObjectId),
    #[error("{0} was registered but never became available")]
    ObjectNotSupplied(ObjectId),
    #[error("{id} exceeded the object reference depth limit of {limit}")]
    TooManyReferences { id: ObjectId, limit: u32 },
    #[error("invalid fixup type for {id}: {reason}")]
    InvalidFixupType { id: ObjectId, reason: String },
    #[error("no live container path to place value type {0}")]
    ValueTypeFixupUnresolvable(ObjectId),
    #[error("type {type_name} could not be loaded")]
    TypeLoadFailure { type_name: String },
    #[error("{0} has no value to complete")]
    MissingObject(ObjectId),
    #[error("{0} requires a state bag for custom reconstruction")]
    MissingStateInfo(ObjectId),
    #[error("surrogate {surrogate} changed the identity of {id}")]
    SurrogateIdentityChanged { id: ObjectId, surrogate: String },
    #[error("no state constructor registered for type {type_name}")]
    ConstructorNotFound { type_name: String },
    #[error("resolving object reference {id} failed: {reason}")]
    ResolutionFailed { id: ObjectId, reason: String },
    #[error("finalizing {id} failed: {reason}")]
    FinalizeFailed { id: ObjectId, reason: String },
    #[error("{phase} hook on {type_name} failed: {reason}")]
    HookFailed {
        type_name: String,
        phase: LifecyclePhase,
        reason: String,
    },
    #[error("fixup target {id} rejected the write: {reason}")]
    TargetMismatch { id: ObjectId, reason: String },
    #[error("{remaining} fixups outstanding with no diagnosable cause")]
    FixupCountMismatch { remaining: u64 },
    #[error("completion budget exhausted after {sweeps} sweeps")]
    CompletionBudgetExhausted { sweeps: u64 },
    #[error("completion pass already ran; the manager is closed")]
    PassClosed,
}

/// Broad grouping used by callers that only need to know who is at fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorClass {
    /// Bad input to a single call.
    Structural,
    /// The registered graph cannot be completed.
    Unsatisfiable,
    /// Malformed or adversarial graph shape.
    Adversarial,
    /// A host collaborator (resolver, surrogate, constructor, hook) failed.
    Collaborator,
    /// Engine bookkeeping or lifecycle misuse.
    Internal,
}

impl FixupError {
    /// Stable machine-readable code.  Codes are append-only and never reused.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidArgument { .. } => "FE-GFX-0001",
            Self::DuplicateRegistration(_) => "FE-GFX-0002",
            Self::InvalidFixupType { .. } => "FE-GFX-0003",
            Self::ObjectNeverSeen(_) => "FE-GFX-0100",
            Self::IncompleteObjectReference(_) => "FE-GFX-0101",
            Self::ObjectNotSupplied(_) => "FE-GFX-0102",
            Self::ValueTypeFixupUnresolvable(_) => "FE-GFX-0103",
            Self::TypeLoadFailure { .. } => "FE-GFX-0104",
            Self::TooManyReferences { .. } => "FE-GFX-0200",
            Self::TargetMismatch { .. } => "FE-GFX-0201",
            Self::ResolutionFailed { .. } => "FE-GFX-0300",
            Self::FinalizeFailed { .. } => "FE-GFX-0301",
            Self::SurrogateIdentityChanged { .. } => "FE-GFX-0302",
            Self::ConstructorNotFound { .. } => "FE-GFX-0303",
            Self::MissingStateInfo(_) => "FE-GFX-0304",
            Self::HookFailed { .. } => "FE-GFX-0305",
            Self::MissingObject(_) => "FE-GFX-0400",
            Self::FixupCountMismatch { .. } => "FE-GFX-0401",
            Self::CompletionBudgetExhausted { .. } => "FE-GFX-0402",
            Self::PassClosed => "FE-GFX-0403",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidArgument { .. }
            | Self::DuplicateRegistration(_)
            | Self::InvalidFixupType { .. } => ErrorClass::Structural,
            Self::ObjectNeverSeen(_)
            | Self::IncompleteObjectReference(_)
            | Self::ObjectNotSupplied(_)
            | Self::ValueTypeFixupUnresolvable(_)
            | Self::TypeLoadFailure { .. } => ErrorClass::Unsatisfiable,
            Self::TooManyReferences { .. } | Self::TargetMismatch { .. } => {
                ErrorClass::Adversarial
            }
            Self::ResolutionFailed { .. }
            | Self::FinalizeFailed { .. }
            | Self::SurrogateIdentityChanged { .. }
            | Self::ConstructorNotFound { .. }
            | Self::MissingStateInfo(_)
            | Self::HookFailed { .. } => ErrorClass::Collaborator,
            Self::MissingObject(_)
            | Self::FixupCountMismatch { .. }
            | Self::CompletionBudgetExhausted { .. }
            | Self::PassClosed => ErrorClass::Internal,
        }
    }

    /// True for errors raised immediately by the call that caused them.
    pub fn is_structural(&self) -> bool {
        self.class() == ErrorClass::Structural
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
