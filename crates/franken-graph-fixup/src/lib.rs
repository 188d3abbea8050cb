#![forbid(unsafe_code)]
//! Object-graph fixup engine.
//!
//! A reader that deserializes an object graph discovers objects and the
//! references between them in arbitrary order.  It hands each materialized
//! object to an [`ObjectManager`] under a numeric id, and every reference it
//! cannot yet satisfy as a *fixup*: "write object B into member `m` of
//! object A once B is available".  The manager applies fixups as soon as both
//! ends exist, tracks dependency counts so completion cascades, and finishes
//! whatever remains in [`ObjectManager::run_completion`]:
//!
//! * value types nested in other objects are patched in place through their
//!   container chain ([`value_fixup`]),
//! * objects rebuilt from serialized state (surrogates and self-describing
//!   types) are finalized once all their inputs are stable,
//! * indirection objects are replaced by the real objects they stand for,
//!   with a bounded chain depth.
//!
//! Host behaviour per type is supplied through a [`TypeCatalog`].

pub mod collaborator;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod event;
pub mod holder;
pub mod id_generator;
pub mod lifecycle;
pub mod manager;
pub mod object_id;
pub mod recorder;
pub mod table;
pub mod value;
pub mod value_fixup;

pub use collaborator::{
    ObjectReference, ReferenceError, StateBag, StateConstructor, Surrogate, SurrogateSelector,
    TypeCatalog,
};
pub use config::ManagerConfig;
pub use error::{ErrorClass, FixupError};
pub use lifecycle::LifecyclePhase;
pub use manager::{ObjectManager, PassPhase, RegisterOptions};
pub use object_id::ObjectId;
pub use value::{ObjectHandle, ObjectHeap, StructValue, Value};
