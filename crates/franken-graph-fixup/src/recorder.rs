//! Graph recording and replay.
//!
//! [`GraphRecorder`] walks a finished heap graph and produces the operation
//! stream a reader would feed the manager: one registration per object and
//! one fixup per reference.  References are never written inline, so every
//! edge, including back edges of cycles, goes through the fixup machinery.
//! [`replay`] feeds such a stream to an [`ObjectManager`], and
//! [`graph_digest`] fingerprints a graph independently of heap handles so a
//! rebuilt graph can be compared with its source.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::collaborator::{StateBag, SurrogateSelector, TypeCatalog};
use crate::error::FixupError;
use crate::id_generator::IdGenerator;
use crate::lifecycle::{HookChainCache, LifecyclePhase, invoke_hooks};
use crate::manager::{ObjectManager, RegisterOptions};
use crate::object_id::ObjectId;
use crate::value::{HeapObject, ObjectHandle, ObjectHeap, PathStep, StructValue, Value};

// ---------------------------------------------------------------------------
// Operations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordedValue {
    /// Allocated on the replaying manager's heap and registered by reference.
    Object(HeapObject),
    Inline(Value),
}

/// Where a nested struct lives inside its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub container_id: i64,
    pub step: PathStep,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOp {
    Register {
        id: i64,
        value: RecordedValue,
        placement: Option<Placement>,
        state: Option<StateBag>,
    },
    MemberFixup {
        object_to_be_fixed: i64,
        member: String,
        object_required: i64,
    },
    ArrayFixup {
        object_to_be_fixed: i64,
        indices: Vec<usize>,
        object_required: i64,
    },
    DelayedFixup {
        object_to_be_fixed: i64,
        member_name: String,
        object_required: i64,
    },
    SetRoot {
        id: i64,
    },
}

impl RecordOp {
    pub fn is_registration(&self) -> bool {
        matches!(self, Self::Register { .. })
    }
}

// ---------------------------------------------------------------------------
// RecordError
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordError {
    DanglingHandle(ObjectHandle),
    ExtractFailed { type_name: String, reason: String },
    /// State entries may reference objects only at the top level.
    NestedStateReference { type_name: String, entry: String },
    Hook(FixupError),
    Encoding(String),
}

impl fmt::Display for RecordError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingHandle(handle) => write!(f, "dangling handle {handle}"),
            Self::ExtractFailed { type_name, reason } => {
                write!(f, "extracting state of {type_name} failed: {reason}")
            }
            Self::NestedStateReference { type_name, entry } => {
                write!(f, "state entry '{entry}' of {type_name} nests a reference")
            }
            Self::Hook(err) => write!(f, "{err}"),
            Self::Encoding(reason) => write!(f, "canonical encoding failed: {reason}"),
        }
    }
}

impl std::error::Error for RecordError {}

// ---------------------------------------------------------------------------
// GraphRecorder
// ---------------------------------------------------------------------------

/// Breadth-first walker producing a [`RecordOp`] stream.
///
/// Types with a surrogate or state constructor are recorded as a member-less
/// shell plus a state bag; references inside the bag become delayed fixups.
pub struct GraphRecorder<'a> {
    catalog: &'a TypeCatalog,
    hooks: HookChainCache,
    ids: IdGenerator,
    queue: VecDeque<ObjectHandle>,
    ops: Vec<RecordOp>,
}

impl<'a> GraphRecorder<'a> {
    pub fn new(catalog: &'a TypeCatalog) -> Self {
        Self {
            catalog,
            hooks: HookChainCache::new(),
            ids: IdGenerator::new(),
            queue: VecDeque::new(),
            ops: Vec::new(),
        }
    }

    /// Record everything reachable from `root`.  Serialization hooks may
    /// mutate `heap`.
    pub fn record(
        mut self,
        heap: &mut ObjectHeap,
        root: ObjectHandle,
    ) -> Result<Vec<RecordOp>, RecordError> {
        let root_id = self.reference(root);
        self.ops.push(RecordOp::SetRoot { id: root_id });
        while let Some(handle) = self.queue.pop_front() {
            self.visit(heap, handle)?;
        }
        Ok(self.ops)
    }

    /// Id for `handle`, queueing it on first sight.
    fn reference(&mut self, handle: ObjectHandle) -> i64 {
        let (id, first_time) = self.ids.get_id(handle);
        if first_time {
            self.queue.push_back(handle);
        }
        raw(id)
    }

    fn visit(&mut self, heap: &mut ObjectHeap, handle: ObjectHandle) -> Result<(), RecordError> {
        let id = self
            .ids
            .has_id(handle)
            .map(raw)
            .ok_or(RecordError::DanglingHandle(handle))?;
        let value = Value::Ref(handle);
        invoke_hooks(
            &mut self.hooks,
            self.catalog,
            LifecyclePhase::Serializing,
            &value,
            heap,
        )
        .map_err(RecordError::Hook)?;

        let object = heap
            .get(handle)
            .cloned()
            .ok_or(RecordError::DanglingHandle(handle))?;
        match self.extract_state(&object, &value, heap)? {
            Some(bag) => self.record_custom(id, object, &bag)?,
            None => self.record_plain(id, object),
        }

        invoke_hooks(
            &mut self.hooks,
            self.catalog,
            LifecyclePhase::Serialized,
            &value,
            heap,
        )
        .map_err(RecordError::Hook)?;
        Ok(())
    }

    fn extract_state(
        &self,
        object: &HeapObject,
        value: &Value,
        heap: &ObjectHeap,
    ) -> Result<Option<StateBag>, RecordError> {
        let type_name = object.type_name();
        let extracted = if let Some(surrogate) = self.catalog.surrogate_for(type_name) {
            surrogate.extract_state(value, heap)
        } else if let Some(constructor) = self.catalog.constructor_for(type_name) {
            constructor.extract_state(value, heap)
        } else {
            return Ok(None);
        };
        extracted
            .map(Some)
            .map_err(|reason| RecordError::ExtractFailed {
                type_name: type_name.to_string(),
                reason,
            })
    }

    fn record_custom(
        &mut self,
        id: i64,
        object: HeapObject,
        bag: &StateBag,
    ) -> Result<(), RecordError> {
        let type_name = object.type_name().to_string();
        let mut kept = StateBag::new();
        let mut delayed = Vec::new();
        for (name, entry) in bag.iter() {
            match entry {
                Value::Ref(target) => {
                    kept.update(name, Value::Null);
                    delayed.push((name.to_string(), *target));
                }
                other if carries_reference(other) => {
                    return Err(RecordError::NestedStateReference {
                        type_name,
                        entry: name.to_string(),
                    });
                }
                other => kept.update(name, other.clone()),
            }
        }
        self.ops.push(RecordOp::Register {
            id,
            value: RecordedValue::Object(blank(object)),
            placement: None,
            state: Some(kept),
        });
        for (member_name, target) in delayed {
            let object_required = self.reference(target);
            self.ops.push(RecordOp::DelayedFixup {
                object_to_be_fixed: id,
                member_name,
                object_required,
            });
        }
        Ok(())
    }

    fn record_plain(&mut self, id: i64, mut object: HeapObject) {
        let detached = detach_references(&mut object);
        self.ops.push(RecordOp::Register {
            id,
            value: RecordedValue::Object(object),
            placement: None,
            state: None,
        });
        for (step, slot) in detached {
            self.record_slot(id, step, slot);
        }
    }

    /// Emit the fixup that puts `slot` back at `step` of `container`.  Structs
    /// carrying references become holders of their own, placed in the
    /// container.
    fn record_slot(&mut self, container: i64, step: PathStep, slot: Value) {
        match slot {
            Value::Ref(target) => {
                let required = self.reference(target);
                self.ops.push(fixup_op(container, step, required));
            }
            Value::Struct(mut nested) => {
                let nested_id = raw(self.ids.next_anonymous_id());
                self.ops.push(fixup_op(container, step.clone(), nested_id));
                let detached = detach_struct_references(&mut nested);
                self.ops.push(RecordOp::Register {
                    id: nested_id,
                    value: RecordedValue::Inline(Value::Struct(nested)),
                    placement: Some(Placement {
                        container_id: container,
                        step,
                    }),
                    state: None,
                });
                for (inner_step, inner) in detached {
                    self.record_slot(nested_id, inner_step, inner);
                }
            }
            _ => {}
        }
    }
}

fn raw(id: ObjectId) -> i64 {
    i64::try_from(id.as_u64()).unwrap_or(i64::MAX)
}

fn fixup_op(container: i64, step: PathStep, required: i64) -> RecordOp {
    match step {
        PathStep::Field(member) => RecordOp::MemberFixup {
            object_to_be_fixed: container,
            member,
            object_required: required,
        },
        PathStep::Element(indices) => RecordOp::ArrayFixup {
            object_to_be_fixed: container,
            indices,
            object_required: required,
        },
    }
}

fn carries_reference(value: &Value) -> bool {
    match value {
        Value::Ref(_) => true,
        Value::Struct(s) => s.fields.values().any(carries_reference),
        _ => false,
    }
}

/// Same type and member set, every slot `Null`.
fn blank(object: HeapObject) -> HeapObject {
    match object {
        HeapObject::Instance(mut o) => {
            o.fields.values_mut().for_each(|v| *v = Value::Null);
            HeapObject::Instance(o)
        }
        HeapObject::Array(mut a) => {
            a.elements.iter_mut().for_each(|v| *v = Value::Null);
            HeapObject::Array(a)
        }
    }
}

/// Replace every reference-carrying slot with `Null`, returning the taken
/// slots in member or row-major order.
fn detach_references(object: &mut HeapObject) -> Vec<(PathStep, Value)> {
    let mut out = Vec::new();
    match object {
        HeapObject::Instance(o) => {
            for (name, slot) in &mut o.fields {
                if carries_reference(slot) {
                    out.push((PathStep::Field(name.clone()), std::mem::replace(slot, Value::Null)));
                }
            }
        }
        HeapObject::Array(a) => {
            let lengths = a.lengths.clone();
            for (flat, slot) in a.elements.iter_mut().enumerate() {
                if carries_reference(slot) {
                    out.push((
                        PathStep::Element(unflatten(&lengths, flat)),
                        std::mem::replace(slot, Value::Null),
                    ));
                }
            }
        }
    }
    out
}

fn detach_struct_references(value: &mut StructValue) -> Vec<(PathStep, Value)> {
    value
        .fields
        .iter_mut()
        .filter(|(_, slot)| carries_reference(slot))
        .map(|(name, slot)| (PathStep::Field(name.clone()), std::mem::replace(slot, Value::Null)))
        .collect()
}

/// Row-major indices for flat offset `flat`.
fn unflatten(lengths: &[usize], mut flat: usize) -> Vec<usize> {
    let mut indices = vec![0; lengths.len()];
    for (axis, len) in lengths.iter().enumerate().rev() {
        if *len == 0 {
            continue;
        }
        indices[axis] = flat % len;
        flat /= len;
    }
    indices
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

/// Feed `ops` to `manager` in order.  Stops at the first rejected operation.
pub fn replay<I>(ops: I, manager: &mut ObjectManager) -> Result<(), FixupError>
where
    I: IntoIterator<Item = RecordOp>,
{
    for op in ops {
        match op {
            RecordOp::Register {
                id,
                value,
                placement,
                state,
            } => {
                let value = match value {
                    RecordedValue::Object(object) => Value::Ref(manager.heap_mut().alloc(object)),
                    RecordedValue::Inline(value) => value,
                };
                let mut options = RegisterOptions {
                    state,
                    ..RegisterOptions::default()
                };
                if let Some(placement) = placement {
                    options.container_id = Some(placement.container_id);
                    match placement.step {
                        PathStep::Field(name) => options.field = Some(name),
                        PathStep::Element(indices) => options.array_index = Some(indices),
                    }
                }
                manager.register_value(id, value, options)?;
            }
            RecordOp::MemberFixup {
                object_to_be_fixed,
                member,
                object_required,
            } => manager.record_member_fixup(object_to_be_fixed, &member, object_required)?,
            RecordOp::ArrayFixup {
                object_to_be_fixed,
                indices,
                object_required,
            } => manager.record_array_fixup_at(object_to_be_fixed, &indices, object_required)?,
            RecordOp::DelayedFixup {
                object_to_be_fixed,
                member_name,
                object_required,
            } => manager.record_delayed_fixup(object_to_be_fixed, &member_name, object_required)?,
            RecordOp::SetRoot { id } => manager.set_root(id)?,
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Canonical digest
// ---------------------------------------------------------------------------

#[derive(Serialize)]
enum CanonicalValue {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Ref(usize),
    Struct {
        type_name: String,
        fields: BTreeMap<String, CanonicalValue>,
    },
    TypeLoadFailure(String),
}

#[derive(Serialize)]
enum CanonicalNode {
    Instance {
        type_name: String,
        fields: BTreeMap<String, CanonicalValue>,
    },
    Array {
        type_name: String,
        lengths: Vec<usize>,
        elements: Vec<CanonicalValue>,
    },
}

#[derive(Default)]
struct Canonicalizer {
    order: BTreeMap<ObjectHandle, usize>,
    queue: VecDeque<ObjectHandle>,
}

impl Canonicalizer {
    fn value(&mut self, value: &Value) -> CanonicalValue {
        match value {
            Value::Null => CanonicalValue::Null,
            Value::Bool(b) => CanonicalValue::Bool(*b),
            Value::Int(i) => CanonicalValue::Int(*i),
            Value::Str(s) => CanonicalValue::Str(s.clone()),
            Value::Ref(handle) => {
                let next = self.order.len();
                let index = *self.order.entry(*handle).or_insert_with(|| {
                    self.queue.push_back(*handle);
                    next
                });
                CanonicalValue::Ref(index)
            }
            Value::Struct(s) => CanonicalValue::Struct {
                type_name: s.type_name.clone(),
                fields: s
                    .fields
                    .iter()
                    .map(|(name, v)| (name.clone(), self.value(v)))
                    .collect(),
            },
            Value::TypeLoadFailure { type_name } => {
                CanonicalValue::TypeLoadFailure(type_name.clone())
            }
        }
    }

    fn node(&mut self, object: &HeapObject) -> CanonicalNode {
        match object {
            HeapObject::Instance(o) => CanonicalNode::Instance {
                type_name: o.type_name.clone(),
                fields: o
                    .fields
                    .iter()
                    .map(|(name, v)| (name.clone(), self.value(v)))
                    .collect(),
            },
            HeapObject::Array(a) => CanonicalNode::Array {
                type_name: a.type_name.clone(),
                lengths: a.lengths.clone(),
                elements: a.elements.iter().map(|v| self.value(v)).collect(),
            },
        }
    }
}

/// `sha256:<hex>` over a handle-independent encoding of the graph reachable
/// from `root`.  Objects are numbered in breadth-first discovery order, so
/// isomorphic graphs on different heaps digest equally.
pub fn graph_digest(heap: &ObjectHeap, root: &Value) -> Result<String, RecordError> {
    let mut canon = Canonicalizer::default();
    let root = canon.value(root);
    let mut nodes = Vec::new();
    while let Some(handle) = canon.queue.pop_front() {
        let object = heap.get(handle).ok_or(RecordError::DanglingHandle(handle))?;
        nodes.push(canon.node(object));
    }
    let bytes = serde_json::to_vec(&(root, nodes))
        .map_err(|err| RecordError::Encoding(err.to_string()))?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("sha256:{}", hex::encode(digest)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
