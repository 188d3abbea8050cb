//! Serialization lifecycle hooks.
//!
//! Hook discovery belongs to the host ([`TypeCatalog`]); this module only
//! fixes invocation order: base types before derived types, and declaration
//! order within a type.  Chains are computed once per type and cached.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborator::{LifecycleHook, TypeCatalog};
use crate::error::FixupError;
use crate::value::{ObjectHeap, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LifecyclePhase {
    Serializing,
    Serialized,
    Deserializing,
    Deserialized,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Serializing => "serializing",
            Self::Serialized => "serialized",
            Self::Deserializing => "deserializing",
            Self::Deserialized => "deserialized",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// HookChainCache
// ---------------------------------------------------------------------------

/// Per-type cache of the base-to-derived type chain.
#[derive(Debug, Clone, Default)]
pub struct HookChainCache {
    chains: BTreeMap<String, Vec<String>>,
}

impl HookChainCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ancestors first, `type_name` last.  A base cycle (which the catalog
    /// refuses to build) truncates the chain at the first repeat.
    pub fn chain(&mut self, catalog: &TypeCatalog, type_name: &str) -> &[String] {
        self.chains
            .entry(type_name.to_string())
            .or_insert_with(|| {
                let mut seen = BTreeSet::new();
                let mut chain = Vec::new();
                let mut cursor = Some(type_name);
                while let Some(current) = cursor {
                    if !seen.insert(current) {
                        break;
                    }
                    chain.push(current.to_string());
                    cursor = catalog.base_of(current);
                }
                chain.reverse();
                chain
            })
    }

    /// Every hook for `phase` along the chain, in invocation order.
    pub fn hooks(
        &mut self,
        catalog: &TypeCatalog,
        type_name: &str,
        phase: LifecyclePhase,
    ) -> Vec<(String, LifecycleHook)> {
        self.chain(catalog, type_name)
            .iter()
            .flat_map(|ty| {
                catalog
                    .hooks_declared(ty, phase)
                    .iter()
                    .map(move |hook| (ty.clone(), hook.clone()))
            })
            .collect()
    }

    pub fn cached_types(&self) -> usize {
        self.chains.len()
    }
}

/// Run every `phase` hook for `value`; returns the names that ran.
///
/// Values without a runtime type (null) have no hooks.
pub fn invoke_hooks(
    cache: &mut HookChainCache,
    catalog: &TypeCatalog,
    phase: LifecyclePhase,
    value: &Value,
    heap: &mut ObjectHeap,
) -> Result<Vec<String>, FixupError> {
    let Some(type_name) = value.type_name(heap).map(str::to_string) else {
        return Ok(Vec::new());
    };
    let mut ran = Vec::new();
    for (declaring, hook) in cache.hooks(catalog, &type_name, phase) {
        (hook.callback)(value, heap).map_err(|reason| FixupError::HookFailed {
            type_name: declaring.clone(),
            phase,
            reason,
        })?;
        ran.push(format!("{declaring}::{}", hook.name));
    }
    Ok(ran)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn layered_catalog(log: Rc<RefCell<Vec<String>>>) -> TypeCatalog {
        let mut catalog = TypeCatalog::new();
        catalog.set_base("Derived", "Middle").unwrap();
        catalog.set_base("Middle", "Base").unwrap();
        for (ty, name) in [
            ("Derived", "d1"),
            ("Base", "b1"),
            ("Middle", "m1"),
            ("Base", "b2"),
        ] {
            let log = Rc::clone(&log);
            let tag = format!("{ty}.{name}");
            catalog.add_hook(ty, LifecyclePhase::Deserialized, name, move |_, _| {
                log.borrow_mut().push(tag.clone());
                Ok(())
            });
        }
        catalog
    }

    #[test]
    fn chain_is_base_first() {
        let catalog = layered_catalog(Rc::default());
        let mut cache = HookChainCache::new();
        assert_eq!(cache.chain(&catalog, "Derived"), ["Base", "Middle", "Derived"]);
        assert_eq!(cache.chain(&catalog, "Unknown"), ["Unknown"]);
        assert_eq!(cache.cached_types(), 2);
    }

    #[test]
    fn hooks_run_base_to_derived_in_declaration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let catalog = layered_catalog(Rc::clone(&log));
        let mut cache = HookChainCache::new();
        let mut heap = ObjectHeap::new();
        let h = heap.alloc_instance("Derived", Vec::<String>::new());
        let ran = invoke_hooks(
            &mut cache,
            &catalog,
            LifecyclePhase::Deserialized,
            &Value::Ref(h),
            &mut heap,
        )
        .unwrap();
        assert_eq!(
            *log.borrow(),
            vec!["Base.b1", "Base.b2", "Middle.m1", "Derived.d1"]
        );
        assert_eq!(ran.len(), 4);
        assert_eq!(ran[0], "Base::b1");
    }

    #[test]
    fn failing_hook_names_declaring_type() {
        let mut catalog = TypeCatalog::new();
        catalog.set_base("Leaf", "Root").unwrap();
        catalog.add_hook("Root", LifecyclePhase::Deserializing, "boom", |_, _| {
            Err("nope".to_string())
        });
        let mut cache = HookChainCache::new();
        let mut heap = ObjectHeap::new();
        let h = heap.alloc_instance("Leaf", Vec::<String>::new());
        let err = invoke_hooks(
            &mut cache,
            &catalog,
            LifecyclePhase::Deserializing,
            &Value::Ref(h),
            &mut heap,
        )
        .unwrap_err();
        assert_eq!(
            err,
            FixupError::HookFailed {
                type_name: "Root".into(),
                phase: LifecyclePhase::Deserializing,
                reason: "nope".into(),
            }
        );
    }

    #[test]
    fn hooks_may_mutate_heap() {
        let mut catalog = TypeCatalog::new();
        catalog.add_hook("Counter", LifecyclePhase::Deserialized, "init", |v, heap| {
            let h = v.as_handle().ok_or("not a ref")?;
            heap.set_member(h, "count", Value::Int(1))
                .map(|_| ())
                .map_err(|e| e.to_string())
        });
        let mut cache = HookChainCache::new();
        let mut heap = ObjectHeap::new();
        let h = heap.alloc_instance("Counter", ["count"]);
        invoke_hooks(
            &mut cache,
            &catalog,
            LifecyclePhase::Deserialized,
            &Value::Ref(h),
            &mut heap,
        )
        .unwrap();
        assert_eq!(heap.member(h, "count").unwrap(), &Value::Int(1));
    }

    #[test]
    fn null_has_no_hooks() {
        let catalog = TypeCatalog::new();
        let mut cache = HookChainCache::new();
        let mut heap = ObjectHeap::new();
        let ran = invoke_hooks(
            &mut cache,
            &catalog,
            LifecyclePhase::Serializing,
            &Value::Null,
            &mut heap,
        )
        .unwrap();
        assert!(ran.is_empty());
    }
}
