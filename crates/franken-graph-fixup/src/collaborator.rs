//! Host collaborators: object-reference resolvers, surrogates, state
//! constructors, lifecycle hooks, and the [`TypeCatalog`] that maps runtime
//! type names to them.
//!
//! A pass is single-threaded, so collaborators are shared with `Rc`.

use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::{Deserialize, Serialize};

use crate::lifecycle::LifecyclePhase;
use crate::value::{ObjectHeap, Value};

// ---------------------------------------------------------------------------
// StateBag
// ---------------------------------------------------------------------------

/// Ordered name/value pairs describing an object's serialized state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateBag {
    entries: Vec<(String, Value)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateBagError {
    DuplicateName(String),
}

impl fmt::Display for StateBagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DuplicateName(name) => write!(f, "state entry '{name}' already present"),
        }
    }
}

impl std::error::Error for StateBagError {}

impl StateBag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, value: Value) -> Result<(), StateBagError> {
        let name = name.into();
        if self.get(&name).is_some() {
            return Err(StateBagError::DuplicateName(name));
        }
        self.entries.push((name, value));
        Ok(())
    }

    /// Replace an existing entry in place, or append it.
    pub fn update(&mut self, name: &str, value: Value) {
        match self.entries.iter_mut().find(|(n, _)| n == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name.to_string(), value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.entries.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ObjectReference
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReferenceError {
    /// Not enough of the graph exists yet; try again later.
    MissingData,
    Failed(String),
}

/// A value that stands in for a different real object.
pub trait ObjectReference {
    /// `Ok(None)` means "not yet"; the holder is retried on the next sweep.
    fn real_object(&self, current: &Value, heap: &mut ObjectHeap)
    -> Result<Option<Value>, ReferenceError>;
}

impl<F> ObjectReference for F
where
    F: Fn(&Value, &mut ObjectHeap) -> Result<Option<Value>, ReferenceError>,
{
    fn real_object(
        &self,
        current: &Value,
        heap: &mut ObjectHeap,
    ) -> Result<Option<Value>, ReferenceError> {
        self(current, heap)
    }
}

// ---------------------------------------------------------------------------
// Surrogate / StateConstructor
// ---------------------------------------------------------------------------

/// External reconstruction strategy for a type.
pub trait Surrogate {
    fn name(&self) -> &str;

    /// When true, `finalize` must keep the registered object; dependents
    /// may link to it before reconstruction runs, so cycles through it work.
    fn preserves_identity(&self) -> bool {
        false
    }

    fn extract_state(&self, value: &Value, heap: &ObjectHeap) -> Result<StateBag, String>;

    /// Rebuild from `state`.  `Some(v)` replaces the registered value.
    fn finalize(
        &self,
        current: &Value,
        state: &StateBag,
        heap: &mut ObjectHeap,
    ) -> Result<Option<Value>, String>;
}

pub trait SurrogateSelector {
    fn surrogate_for(&self, type_name: &str) -> Option<Rc<dyn Surrogate>>;
}

/// In-place reconstruction for a type that describes its own state.
///
/// Reference objects are rebuilt through `heap`; value types are rebuilt by
/// mutating `target` itself.
pub trait StateConstructor {
    fn construct(&self, target: &mut Value, state: &StateBag, heap: &mut ObjectHeap)
    -> Result<(), String>;

    /// Serialization side.  Defaults to every member of an instance.
    fn extract_state(&self, value: &Value, heap: &ObjectHeap) -> Result<StateBag, String> {
        let instance = value
            .as_handle()
            .and_then(|h| heap.get(h))
            .and_then(|o| o.as_instance())
            .ok_or_else(|| format!("cannot extract state from {value}"))?;
        let mut bag = StateBag::new();
        for (name, field) in &instance.fields {
            bag.update(name, field.clone());
        }
        Ok(bag)
    }
}

impl<F> StateConstructor for F
where
    F: Fn(&mut Value, &StateBag, &mut ObjectHeap) -> Result<(), String>,
{
    fn construct(
        &self,
        target: &mut Value,
        state: &StateBag,
        heap: &mut ObjectHeap,
    ) -> Result<(), String> {
        self(target, state, heap)
    }
}

// ---------------------------------------------------------------------------
// Lifecycle hooks
// ---------------------------------------------------------------------------

pub type HookFn = Rc<dyn Fn(&Value, &mut ObjectHeap) -> Result<(), String>>;

#[derive(Clone)]
pub struct LifecycleHook {
    pub name: String,
    pub callback: HookFn,
}

impl fmt::Debug for LifecycleHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHook")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TypeCatalog
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct TypeEntry {
    base: Option<String>,
    resolver: Option<Rc<dyn ObjectReference>>,
    constructor: Option<Rc<dyn StateConstructor>>,
    surrogate: Option<Rc<dyn Surrogate>>,
    hooks: BTreeMap<LifecyclePhase, Vec<LifecycleHook>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatalogError {
    /// Declaring the base would make the type its own ancestor.
    BaseCycle { type_name: String, base: String },
}

impl fmt::Display for CatalogError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BaseCycle { type_name, base } => {
                write!(f, "making {base} the base of {type_name} creates a cycle")
            }
        }
    }
}

impl std::error::Error for CatalogError {}

/// Host registry of per-type behaviour.
#[derive(Clone, Default)]
pub struct TypeCatalog {
    types: BTreeMap<String, TypeEntry>,
}

impl fmt::Debug for TypeCatalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeCatalog")
            .field("types", &self.types.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl TypeCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&mut self, type_name: &str) -> &mut TypeEntry {
        self.types.entry(type_name.to_string()).or_default()
    }

    pub fn set_base(&mut self, type_name: &str, base: &str) -> Result<(), CatalogError> {
        let mut cursor = Some(base.to_string());
        while let Some(ancestor) = cursor {
            if ancestor == type_name {
                return Err(CatalogError::BaseCycle {
                    type_name: type_name.to_string(),
                    base: base.to_string(),
                });
            }
            cursor = self.base_of(&ancestor).map(str::to_string);
        }
        self.entry(type_name).base = Some(base.to_string());
        Ok(())
    }

    pub fn set_reference_resolver(&mut self, type_name: &str, resolver: Rc<dyn ObjectReference>) {
        self.entry(type_name).resolver = Some(resolver);
    }

    pub fn set_constructor(&mut self, type_name: &str, constructor: Rc<dyn StateConstructor>) {
        self.entry(type_name).constructor = Some(constructor);
    }

    pub fn set_surrogate(&mut self, type_name: &str, surrogate: Rc<dyn Surrogate>) {
        self.entry(type_name).surrogate = Some(surrogate);
    }

    /// Append a hook; hooks of one type run in the order they were added.
    pub fn add_hook<F>(&mut self, type_name: &str, phase: LifecyclePhase, name: &str, callback: F)
    where
        F: Fn(&Value, &mut ObjectHeap) -> Result<(), String> + 'static,
    {
        self.entry(type_name)
            .hooks
            .entry(phase)
            .or_default()
            .push(LifecycleHook {
                name: name.to_string(),
                callback: Rc::new(callback),
            });
    }

    pub fn base_of(&self, type_name: &str) -> Option<&str> {
        self.types.get(type_name)?.base.as_deref()
    }

    pub fn resolver_for(&self, type_name: &str) -> Option<Rc<dyn ObjectReference>> {
        self.types.get(type_name)?.resolver.clone()
    }

    pub fn constructor_for(&self, type_name: &str) -> Option<Rc<dyn StateConstructor>> {
        self.types.get(type_name)?.constructor.clone()
    }

    /// Hooks declared directly on `type_name` (no base types).
    pub fn hooks_declared(&self, type_name: &str, phase: LifecyclePhase) -> &[LifecycleHook] {
        self.types
            .get(type_name)
            .and_then(|e| e.hooks.get(&phase))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl SurrogateSelector for TypeCatalog {
    fn surrogate_for(&self, type_name: &str) -> Option<Rc<dyn Surrogate>> {
        self.types.get(type_name)?.surrogate.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    impl Surrogate for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn extract_state(&self, value: &Value, _heap: &ObjectHeap) -> Result<StateBag, String> {
            let mut bag = StateBag::new();
            bag.add("text", value.clone()).map_err(|e| e.to_string())?;
            Ok(bag)
        }

        fn finalize(
            &self,
            _current: &Value,
            state: &StateBag,
            _heap: &mut ObjectHeap,
        ) -> Result<Option<Value>, String> {
            match state.get("text") {
                Some(Value::Str(s)) => Ok(Some(Value::Str(s.to_uppercase()))),
                _ => Err("missing text".into()),
            }
        }
    }

    #[test]
    fn state_bag_add_update_get() {
        let mut bag = StateBag::new();
        bag.add("a", Value::Int(1)).unwrap();
        assert_eq!(
            bag.add("a", Value::Int(2)),
            Err(StateBagError::DuplicateName("a".into()))
        );
        bag.update("a", Value::Int(3));
        bag.update("b", Value::Null);
        assert_eq!(bag.get("a"), Some(&Value::Int(3)));
        assert_eq!(bag.names().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(bag.len(), 2);
    }

    #[test]
    fn catalog_rejects_base_cycles() {
        let mut catalog = TypeCatalog::new();
        catalog.set_base("Derived", "Base").unwrap();
        catalog.set_base("Base", "Root").unwrap();
        let err = catalog.set_base("Root", "Derived").unwrap_err();
        assert!(matches!(err, CatalogError::BaseCycle { .. }));
        assert!(catalog.set_base("Self", "Self").is_err());
        assert_eq!(catalog.base_of("Derived"), Some("Base"));
    }

    #[test]
    fn closures_act_as_collaborators() {
        let mut catalog = TypeCatalog::new();
        let resolver = |_: &Value, _: &mut ObjectHeap| -> Result<Option<Value>, ReferenceError> {
            Ok(Some(Value::Int(7)))
        };
        catalog.set_reference_resolver("Proxy", Rc::new(resolver));
        let mut heap = ObjectHeap::new();
        let found = catalog
            .resolver_for("Proxy")
            .unwrap()
            .real_object(&Value::Null, &mut heap);
        assert_eq!(found, Ok(Some(Value::Int(7))));
        assert!(catalog.resolver_for("Other").is_none());
    }

    #[test]
    fn surrogate_lookup_and_finalize() {
        let mut catalog = TypeCatalog::new();
        catalog.set_surrogate("Label", Rc::new(Upper));
        let surrogate = catalog.surrogate_for("Label").unwrap();
        assert!(!surrogate.preserves_identity());
        let mut heap = ObjectHeap::new();
        let bag = surrogate.extract_state(&Value::from("hi"), &heap).unwrap();
        let out = surrogate.finalize(&Value::Null, &bag, &mut heap).unwrap();
        assert_eq!(out, Some(Value::from("HI")));
    }

    #[test]
    fn default_extract_state_copies_members() {
        struct Noop;
        impl StateConstructor for Noop {
            fn construct(
                &self,
                _: &mut Value,
                _: &StateBag,
                _: &mut ObjectHeap,
            ) -> Result<(), String> {
                Ok(())
            }
        }
        let mut heap = ObjectHeap::new();
        let h = heap.alloc_instance("Pair", ["left", "right"]);
        heap.set_member(h, "left", Value::Int(1)).unwrap();
        let bag = Noop.extract_state(&Value::Ref(h), &heap).unwrap();
        assert_eq!(bag.get("left"), Some(&Value::Int(1)));
        assert_eq!(bag.get("right"), Some(&Value::Null));
        assert!(Noop.extract_state(&Value::Int(1), &heap).is_err());
    }

    #[test]
    fn hooks_keep_declaration_order() {
        let mut catalog = TypeCatalog::new();
        catalog.add_hook("T", LifecyclePhase::Deserialized, "first", |_, _| Ok(()));
        catalog.add_hook("T", LifecyclePhase::Deserialized, "second", |_, _| Ok(()));
        let names: Vec<&str> = catalog
            .hooks_declared("T", LifecyclePhase::Deserialized)
            .iter()
            .map(|h| h.name.as_str())
            .collect();
        assert_eq!(names, vec!["first", "second"]);
        assert!(catalog.hooks_declared("T", LifecyclePhase::Serializing).is_empty());
    }
}
