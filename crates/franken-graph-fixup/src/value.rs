//! Object model for graphs under reconstruction.
//!
//! Reference objects (instances and arrays) live in an [`ObjectHeap`] arena
//! and are addressed by [`ObjectHandle`].  Value types ([`StructValue`]) have
//! no identity: they are copied on assignment, so once a struct has been
//! stored inside its container the only way to patch it is through a
//! [`PathStep`] walk that starts at the containing heap object.
//!
//! Members must exist before they can be written.  A reader allocates an
//! object with its full member set (usually `Null`-initialised) and the
//! fixup engine fills references in later; writing an undeclared member is a
//! [`ModelError::NoSuchField`], which catches reader/engine disagreement early.
//!
//! `BTreeMap` for deterministic member ordering.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// ObjectHandle — typed reference to heap objects
// ---------------------------------------------------------------------------

/// Opaque handle referencing an object on the reconstruction heap.  The
/// payload is the arena index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjectHandle(pub usize);

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Value — a slot's content
// ---------------------------------------------------------------------------

/// Content of a member, array slot, or holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    /// Reference to a heap object (instance or array).
    Ref(ObjectHandle),
    /// Inline value type.
    Struct(StructValue),
    /// Placeholder registered by a reader that could not resolve a type.
    TypeLoadFailure { type_name: String },
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn is_struct(&self) -> bool {
        matches!(self, Self::Struct(_))
    }

    pub fn as_handle(&self) -> Option<ObjectHandle> {
        match self {
            Self::Ref(h) => Some(*h),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&StructValue> {
        match self {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_struct_mut(&mut self) -> Option<&mut StructValue> {
        match self {
            Self::Struct(s) => Some(s),
            _ => None,
        }
    }

    /// Runtime type name used for catalog lookups.
    ///
    /// References resolve through `heap`; a dangling handle has no type.
    pub fn type_name<'a>(&'a self, heap: &'a ObjectHeap) -> Option<&'a str> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some("bool"),
            Self::Int(_) => Some("i64"),
            Self::Str(_) => Some("string"),
            Self::Ref(h) => heap.get(*h).map(HeapObject::type_name),
            Self::Struct(s) => Some(&s.type_name),
            Self::TypeLoadFailure { type_name } => Some(type_name),
        }
    }

    /// Navigate inside a detached value (a boxed struct) and return the slot
    /// at the end of `steps`.  An empty path addresses the value itself.
    pub fn slot_mut(&mut self, steps: &[PathStep]) -> Result<&mut Value, ModelError> {
        let mut slot = self;
        for step in steps {
            slot = step_into_value(slot, step)?;
        }
        Ok(slot)
    }

    /// Read-only counterpart of [`Value::slot_mut`].
    pub fn slot(&self, steps: &[PathStep]) -> Result<&Value, ModelError> {
        let mut slot = self;
        for step in steps {
            slot = match (slot, step) {
                (Value::Struct(s), PathStep::Field(name)) => s.field(name)?,
                (other, step) => {
                    return Err(ModelError::NotAStruct {
                        step: step.to_string(),
                        found: other.kind_name().to_string(),
                    });
                }
            };
        }
        Ok(slot)
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Null => "null",
            Self::Bool(_) => "bool",
            Self::Int(_) => "int",
            Self::Str(_) => "string",
            Self::Ref(_) => "reference",
            Self::Struct(_) => "struct",
            Self::TypeLoadFailure { .. } => "type-load-failure",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Ref(h) => write!(f, "[{h}]"),
            Self::Struct(s) => write!(f, "{}{{..{}}}", s.type_name, s.fields.len()),
            Self::TypeLoadFailure { type_name } => write!(f, "<unloadable {type_name}>"),
        }
    }
}

impl From<ObjectHandle> for Value {
    fn from(h: ObjectHandle) -> Self {
        Self::Ref(h)
    }
}

impl From<StructValue> for Value {
    fn from(s: StructValue) -> Self {
        Self::Struct(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

fn step_into_value<'a>(slot: &'a mut Value, step: &PathStep) -> Result<&'a mut Value, ModelError> {
    match (slot, step) {
        (Value::Struct(s), PathStep::Field(name)) => s.field_mut(name),
        (other, step) => Err(ModelError::NotAStruct {
            step: step.to_string(),
            found: other.kind_name().to_string(),
        }),
    }
}

// ---------------------------------------------------------------------------
// StructValue — inline value type
// ---------------------------------------------------------------------------

/// A value type: named fields, copied wholesale on assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructValue {
    pub type_name: String,
    pub fields: BTreeMap<String, Value>,
}

impl StructValue {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style field declaration.
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Result<&Value, ModelError> {
        self.fields.get(name).ok_or_else(|| ModelError::NoSuchField {
            type_name: self.type_name.clone(),
            field: name.to_string(),
        })
    }

    pub fn field_mut(&mut self, name: &str) -> Result<&mut Value, ModelError> {
        let type_name = &self.type_name;
        self.fields
            .get_mut(name)
            .ok_or_else(|| ModelError::NoSuchField {
                type_name: type_name.clone(),
                field: name.to_string(),
            })
    }
}

// ---------------------------------------------------------------------------
// Heap objects
// ---------------------------------------------------------------------------

/// A class instance with identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceObject {
    pub type_name: String,
    pub fields: BTreeMap<String, Value>,
}

impl InstanceObject {
    /// Instance with every listed member initialised to `Null`.
    pub fn with_fields<I, S>(type_name: impl Into<String>, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            type_name: type_name.into(),
            fields: names.into_iter().map(|n| (n.into(), Value::Null)).collect(),
        }
    }

    pub fn field(&self, name: &str) -> Result<&Value, ModelError> {
        self.fields.get(name).ok_or_else(|| ModelError::NoSuchField {
            type_name: self.type_name.clone(),
            field: name.to_string(),
        })
    }

    pub fn field_mut(&mut self, name: &str) -> Result<&mut Value, ModelError> {
        let type_name = &self.type_name;
        self.fields
            .get_mut(name)
            .ok_or_else(|| ModelError::NoSuchField {
                type_name: type_name.clone(),
                field: name.to_string(),
            })
    }
}

/// A possibly multi-dimensional array, stored row-major.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArrayObject {
    /// `Element[]`, `Element[,]`, ... derived from element type and rank.
    pub type_name: String,
    pub element_type: String,
    pub lengths: Vec<usize>,
    pub elements: Vec<Value>,
}

impl ArrayObject {
    pub fn new(element_type: impl Into<String>, lengths: Vec<usize>) -> Self {
        let element_type = element_type.into();
        let total = lengths.iter().product::<usize>();
        let commas = ",".repeat(lengths.len().saturating_sub(1));
        Self {
            type_name: format!("{element_type}[{commas}]"),
            element_type,
            lengths,
            elements: vec![Value::Null; total],
        }
    }

    pub fn rank(&self) -> usize {
        self.lengths.len()
    }

    /// Row-major flat offset for `indices`.
    pub fn flat_index(&self, indices: &[usize]) -> Result<usize, ModelError> {
        if indices.len() != self.lengths.len() {
            return Err(ModelError::RankMismatch {
                expected: self.lengths.len(),
                found: indices.len(),
            });
        }
        let mut offset = 0usize;
        for (&index, &len) in indices.iter().zip(&self.lengths) {
            if index >= len {
                return Err(ModelError::IndexOutOfBounds {
                    indices: indices.to_vec(),
                    lengths: self.lengths.clone(),
                });
            }
            offset = offset * len + index;
        }
        Ok(offset)
    }

    pub fn get(&self, indices: &[usize]) -> Result<&Value, ModelError> {
        let at = self.flat_index(indices)?;
        Ok(&self.elements[at])
    }

    pub fn get_mut(&mut self, indices: &[usize]) -> Result<&mut Value, ModelError> {
        let at = self.flat_index(indices)?;
        Ok(&mut self.elements[at])
    }
}

/// An object with identity on the heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HeapObject {
    Instance(InstanceObject),
    Array(ArrayObject),
}

impl HeapObject {
    pub fn type_name(&self) -> &str {
        match self {
            Self::Instance(o) => &o.type_name,
            Self::Array(a) => &a.type_name,
        }
    }

    pub fn is_array(&self) -> bool {
        matches!(self, Self::Array(_))
    }

    pub fn as_instance(&self) -> Option<&InstanceObject> {
        match self {
            Self::Instance(o) => Some(o),
            Self::Array(_) => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayObject> {
        match self {
            Self::Array(a) => Some(a),
            Self::Instance(_) => None,
        }
    }

    /// Outgoing references held directly or inside inline structs.
    pub fn references(&self) -> Vec<ObjectHandle> {
        let mut out = Vec::new();
        match self {
            Self::Instance(o) => o.fields.values().for_each(|v| collect_refs(v, &mut out)),
            Self::Array(a) => a.elements.iter().for_each(|v| collect_refs(v, &mut out)),
        }
        out
    }

    fn slot_mut(&mut self, step: &PathStep) -> Result<&mut Value, ModelError> {
        match (self, step) {
            (Self::Instance(o), PathStep::Field(name)) => o.field_mut(name),
            (Self::Array(a), PathStep::Element(indices)) => a.get_mut(indices),
            (Self::Instance(o), PathStep::Element(_)) => Err(ModelError::NotAnArray {
                type_name: o.type_name.clone(),
            }),
            (Self::Array(a), PathStep::Field(_)) => Err(ModelError::NotAnInstance {
                type_name: a.element_type.clone(),
            }),
        }
    }

    fn slot(&self, step: &PathStep) -> Result<&Value, ModelError> {
        match (self, step) {
            (Self::Instance(o), PathStep::Field(name)) => o.field(name),
            (Self::Array(a), PathStep::Element(indices)) => a.get(indices),
            (Self::Instance(o), PathStep::Element(_)) => Err(ModelError::NotAnArray {
                type_name: o.type_name.clone(),
            }),
            (Self::Array(a), PathStep::Field(_)) => Err(ModelError::NotAnInstance {
                type_name: a.element_type.clone(),
            }),
        }
    }
}

fn collect_refs(value: &Value, out: &mut Vec<ObjectHandle>) {
    match value {
        Value::Ref(h) => out.push(*h),
        Value::Struct(s) => s.fields.values().for_each(|v| collect_refs(v, out)),
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// PathStep — one hop from a container to a nested slot
// ---------------------------------------------------------------------------

/// One hop of a typed path: a member of an instance/struct, or an array slot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PathStep {
    Field(String),
    Element(Vec<usize>),
}

impl fmt::Display for PathStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Field(name) => write!(f, ".{name}"),
            Self::Element(indices) => {
                let parts: Vec<String> = indices.iter().map(usize::to_string).collect();
                write!(f, "[{}]", parts.join(","))
            }
        }
    }
}

// ---------------------------------------------------------------------------
// ModelError
// ---------------------------------------------------------------------------

/// Errors from object model operations.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelError {
    ObjectNotFound(ObjectHandle),
    NoSuchField { type_name: String, field: String },
    NotAnInstance { type_name: String },
    NotAnArray { type_name: String },
    /// A field step hit something other than an inline struct.
    NotAStruct { step: String, found: String },
    IndexOutOfBounds { indices: Vec<usize>, lengths: Vec<usize> },
    RankMismatch { expected: usize, found: usize },
    EmptyPath,
}

impl fmt::Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ObjectNotFound(h) => write!(f, "{h} not found"),
            Self::NoSuchField { type_name, field } => {
                write!(f, "type {type_name} has no member '{field}'")
            }
            Self::NotAnInstance { type_name } => {
                write!(f, "array of {type_name} has no members")
            }
            Self::NotAnArray { type_name } => write!(f, "{type_name} is not an array"),
            Self::NotAStruct { step, found } => {
                write!(f, "cannot apply step '{step}' to a {found} value")
            }
            Self::IndexOutOfBounds { indices, lengths } => {
                write!(f, "index {indices:?} out of bounds for lengths {lengths:?}")
            }
            Self::RankMismatch { expected, found } => {
                write!(f, "array rank {expected} addressed with {found} indices")
            }
            Self::EmptyPath => write!(f, "path must contain at least one step"),
        }
    }
}

impl std::error::Error for ModelError {}

// ---------------------------------------------------------------------------
// ObjectHeap — the arena
// ---------------------------------------------------------------------------

/// Arena of heap objects.  Handles are dense indices and never reused.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectHeap {
    objects: Vec<HeapObject>,
}

impl ObjectHeap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self, object: HeapObject) -> ObjectHandle {
        let handle = ObjectHandle(self.objects.len());
        self.objects.push(object);
        handle
    }

    /// Allocate an instance whose listed members start out `Null`.
    pub fn alloc_instance<I, S>(&mut self, type_name: impl Into<String>, fields: I) -> ObjectHandle
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.alloc(HeapObject::Instance(InstanceObject::with_fields(
            type_name, fields,
        )))
    }

    pub fn alloc_array(
        &mut self,
        element_type: impl Into<String>,
        lengths: Vec<usize>,
    ) -> ObjectHandle {
        self.alloc(HeapObject::Array(ArrayObject::new(element_type, lengths)))
    }

    pub fn get(&self, handle: ObjectHandle) -> Option<&HeapObject> {
        self.objects.get(handle.0)
    }

    pub fn get_mut(&mut self, handle: ObjectHandle) -> Option<&mut HeapObject> {
        self.objects.get_mut(handle.0)
    }

    fn object_mut(&mut self, handle: ObjectHandle) -> Result<&mut HeapObject, ModelError> {
        self.get_mut(handle).ok_or(ModelError::ObjectNotFound(handle))
    }

    fn object(&self, handle: ObjectHandle) -> Result<&HeapObject, ModelError> {
        self.get(handle).ok_or(ModelError::ObjectNotFound(handle))
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// All handles in allocation order.
    pub fn handles(&self) -> impl Iterator<Item = ObjectHandle> + '_ {
        (0..self.objects.len()).map(ObjectHandle)
    }

    pub fn member(&self, handle: ObjectHandle, name: &str) -> Result<&Value, ModelError> {
        self.object(handle)?.slot(&PathStep::Field(name.to_string()))
    }

    pub fn set_member(
        &mut self,
        handle: ObjectHandle,
        name: &str,
        value: Value,
    ) -> Result<Value, ModelError> {
        self.write_path(handle, &[PathStep::Field(name.to_string())], value)
    }

    pub fn element(&self, handle: ObjectHandle, indices: &[usize]) -> Result<&Value, ModelError> {
        self.object(handle)?.slot(&PathStep::Element(indices.to_vec()))
    }

    pub fn set_element(
        &mut self,
        handle: ObjectHandle,
        indices: &[usize],
        value: Value,
    ) -> Result<Value, ModelError> {
        self.write_path(handle, &[PathStep::Element(indices.to_vec())], value)
    }

    /// Read the slot at the end of `steps`, starting at a heap object.
    pub fn read_path(
        &self,
        handle: ObjectHandle,
        steps: &[PathStep],
    ) -> Result<&Value, ModelError> {
        let (first, rest) = steps.split_first().ok_or(ModelError::EmptyPath)?;
        self.object(handle)?.slot(first)?.slot(rest)
    }

    /// Mutable slot at the end of `steps`.  The first step addresses the heap
    /// object itself; every later step must be a field of an inline struct.
    pub fn slot_at_path_mut(
        &mut self,
        handle: ObjectHandle,
        steps: &[PathStep],
    ) -> Result<&mut Value, ModelError> {
        let (first, rest) = steps.split_first().ok_or(ModelError::EmptyPath)?;
        self.object_mut(handle)?.slot_mut(first)?.slot_mut(rest)
    }

    /// Store `value` at the end of `steps`, returning the previous content.
    pub fn write_path(
        &mut self,
        handle: ObjectHandle,
        steps: &[PathStep],
        value: Value,
    ) -> Result<Value, ModelError> {
        let slot = self.slot_at_path_mut(handle, steps)?;
        Ok(std::mem::replace(slot, value))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
