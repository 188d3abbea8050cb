//! Placement of nested value types.
//!
//! A value type has no identity, so once it has been copied into its
//! container the boxed copy in its holder is no longer the live value.  A
//! later write to one of its members must instead walk up the chain of
//! containers to an *anchor* (a heap object, or a boxed struct that has not
//! been placed yet) and write through the composed path.
//!
//! ```text
//! O (heap object) .field1 -> V1 (struct) .field2 -> V2 (struct) .target
//!   anchor = O, path = [field1, field2, target]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::FixupError;
use crate::holder::{HolderFlags, ObjectHolder};
use crate::object_id::ObjectId;
use crate::table::IdentifierTable;
use crate::value::{ModelError, ObjectHandle, ObjectHeap, PathStep, Value};

/// Whether `holder`'s value already lives inside its container.
///
/// Either the container has copied it (flag set), or the container never
/// asked for it through a fixup and its slot already holds a struct, meaning
/// the reader wrote it inline.  A container that is not registered yet
/// counts as placed so the write waits for it.
pub fn is_placed(table: &IdentifierTable, heap: &ObjectHeap, holder: &ObjectHolder) -> bool {
    if holder.has(HolderFlags::VALUE_FIXUP_PERFORMED) {
        return true;
    }
    let Some(info) = &holder.value_fixup else {
        return false;
    };
    if holder.value.is_none() {
        return false;
    }
    let Some(container) = table.find(info.container) else {
        return true;
    };
    if container.has_unapplied_requiring(holder.id) {
        return false;
    }
    let step = std::slice::from_ref(&info.step);
    let live = match &container.value {
        None => return true,
        Some(Value::Ref(handle)) => heap.read_path(*handle, step).ok(),
        Some(other) => other.slot(step).ok(),
    };
    matches!(live, Some(Value::Struct(_)))
}

// ---------------------------------------------------------------------------
// ValueFixupChain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainAnchor {
    Heap(ObjectHandle),
    /// Boxed struct of a holder that is not itself placed yet.
    Boxed(ObjectId),
}

/// Resolved route from an anchor down to a placed value type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueFixupChain {
    pub anchor: ChainAnchor,
    /// Outermost step first.
    pub steps: Vec<PathStep>,
    /// Holders along the route, innermost first.
    pub holders: Vec<ObjectId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainResolution {
    Ready(ValueFixupChain),
    /// A container on the route has no value yet.
    Deferred { blocked_on: ObjectId },
}

impl ValueFixupChain {
    pub fn resolve(
        table: &IdentifierTable,
        heap: &ObjectHeap,
        id: ObjectId,
    ) -> Result<ChainResolution, FixupError> {
        let mut holders = Vec::new();
        let mut steps = Vec::new();
        let mut cursor = id;
        let anchor = loop {
            if holders.len() > table.len() {
                return Err(FixupError::TargetMismatch {
                    id,
                    reason: "value fixup chain does not terminate".into(),
                });
            }
            let holder = table.find(cursor).ok_or(FixupError::ObjectNeverSeen(cursor))?;
            let info = holder
                .value_fixup
                .as_ref()
                .ok_or_else(|| FixupError::TargetMismatch {
                    id: cursor,
                    reason: "value type has no placement descriptor".into(),
                })?;
            holders.push(cursor);
            steps.push(info.step.clone());
            let Some(container) = table.find(info.container) else {
                return Ok(ChainResolution::Deferred {
                    blocked_on: info.container,
                });
            };
            match &container.value {
                None => {
                    return Ok(ChainResolution::Deferred {
                        blocked_on: container.id,
                    });
                }
                Some(Value::Ref(handle)) => break ChainAnchor::Heap(*handle),
                Some(Value::Struct(_))
                    if container.requires_value_fixup() && is_placed(table, heap, container) =>
                {
                    cursor = container.id;
                }
                Some(Value::Struct(_)) => break ChainAnchor::Boxed(container.id),
                Some(other) => {
                    return Err(FixupError::TargetMismatch {
                        id: container.id,
                        reason: format!("container holds {other}, not an object or struct"),
                    });
                }
            }
        };
        steps.reverse();
        Ok(ChainResolution::Ready(Self {
            anchor,
            steps,
            holders,
        }))
    }

    /// Write `value` at `steps ++ tail`, then refresh the boxed copy of
    /// every holder on the route from the live location.
    pub fn write(
        &self,
        table: &mut IdentifierTable,
        heap: &mut ObjectHeap,
        tail: &[PathStep],
        value: Value,
    ) -> Result<(), FixupError> {
        let Some(&innermost) = self.holders.first() else {
            return Err(FixupError::InvalidArgument {
                parameter: "chain".into(),
                reason: "value fixup chain has no holders".into(),
            });
        };
        let mismatch = |e: ModelError| FixupError::TargetMismatch {
            id: innermost,
            reason: e.to_string(),
        };
        let mut path = self.steps.clone();
        path.extend_from_slice(tail);

        match self.anchor {
            ChainAnchor::Heap(handle) => {
                heap.write_path(handle, &path, value).map_err(mismatch)?;
            }
            ChainAnchor::Boxed(container) => {
                let boxed = table
                    .find_mut(container)
                    .and_then(|h| h.value.as_mut())
                    .ok_or(FixupError::MissingObject(container))?;
                *boxed.slot_mut(&path).map_err(mismatch)? = value;
            }
        }

        let depth = self.steps.len();
        for (level, id) in self.holders.iter().enumerate() {
            let prefix = &path[..depth - level];
            let live = match self.anchor {
                ChainAnchor::Heap(handle) => heap.read_path(handle, prefix).cloned(),
                ChainAnchor::Boxed(container) => table
                    .find(container)
                    .and_then(|h| h.value.as_ref())
                    .ok_or(ModelError::EmptyPath)
                    .and_then(|v| v.slot(prefix).cloned()),
            }
            .map_err(mismatch)?;
            if let Some(holder) = table.find_mut(*id) {
                holder.value = Some(live);
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Descendant counting
// ---------------------------------------------------------------------------

/// Apply `delta` to the descendant count of every value-type ancestor of
/// `id`.  Walks up while the container is itself a nested value type.
///
/// Returns the ancestors whose total dependency count dropped to zero.
pub fn adjust_descendants(table: &mut IdentifierTable, id: ObjectId, delta: i64) -> Vec<ObjectId> {
    let mut zeroed = Vec::new();
    if delta == 0 {
        return zeroed;
    }
    let Some(start) = table
        .find(id)
        .filter(|h| h.requires_value_fixup())
        .and_then(|h| h.value_fixup.as_ref())
        .map(|info| info.container)
    else {
        return zeroed;
    };
    let mut cursor = start;
    for _ in 0..=table.len() {
        let container = table.find_or_create(cursor);
        let next = i64::from(container.descendant_count) + delta;
        container.descendant_count = u32::try_from(next.max(0)).unwrap_or(u32::MAX);
        if delta < 0 && container.total_dependencies() == 0 {
            zeroed.push(container.id);
        }
        if !container.requires_value_fixup() {
            break;
        }
        match container.value_fixup.as_ref() {
            Some(info) => cursor = info.container,
            None => break,
        }
    }
    zeroed
}

/// Containers whose descendant count moves with `id`, innermost first.
pub fn value_ancestors(table: &IdentifierTable, id: ObjectId) -> Vec<ObjectId> {
    let mut ancestors = Vec::new();
    let mut cursor = table.find(id);
    while let Some(holder) = cursor {
        if !holder.requires_value_fixup() || ancestors.len() > table.len() {
            break;
        }
        let Some(info) = holder.value_fixup.as_ref() else {
            break;
        };
        ancestors.push(info.container);
        cursor = table.find(info.container);
    }
    ancestors
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::holder::{FixupRecord, FixupTarget, ValueFixupInfo};
    use crate::value::StructValue;

    fn id(n: u64) -> ObjectId {
        ObjectId::from_u64(n).unwrap()
    }

    fn field(name: &str) -> PathStep {
        PathStep::Field(name.to_string())
    }

    fn nest(table: &mut IdentifierTable, child: u64, container: u64, step: PathStep, value: Value) {
        let holder = table.find_or_create(id(child));
        holder.value = Some(value);
        holder.flags.insert(HolderFlags::REQUIRES_VALUE_FIXUP);
        holder.value_fixup = Some(ValueFixupInfo {
            container: id(container),
            step,
        });
    }

    /// O(1).outer = V1(2); V1.inner = V2(3); both placed.
    fn two_level() -> (IdentifierTable, ObjectHeap, ObjectHandle) {
        let mut heap = ObjectHeap::new();
        let o = heap.alloc_instance("Shape", ["outer"]);
        let v2 = StructValue::new("Inner").with_field("target", Value::Null);
        let v1 = StructValue::new("Outer").with_field("inner", Value::Struct(v2.clone()));
        heap.set_member(o, "outer", Value::Struct(v1.clone())).unwrap();

        let mut table = IdentifierTable::with_buckets(8);
        table.find_or_create(id(1)).value = Some(Value::Ref(o));
        nest(&mut table, 2, 1, field("outer"), Value::Struct(v1));
        nest(&mut table, 3, 2, field("inner"), Value::Struct(v2));
        (table, heap, o)
    }

    #[test]
    fn inline_written_value_counts_as_placed() {
        let (table, heap, _) = two_level();
        assert!(is_placed(&table, &heap, table.find(id(3)).unwrap()));
    }

    #[test]
    fn pending_container_fixup_means_not_placed() {
        let (mut table, heap, _) = two_level();
        table.find_or_create(id(2)).pending.push(FixupRecord {
            required: id(3),
            target: FixupTarget::Member("inner".into()),
            applied: false,
        });
        assert!(!is_placed(&table, &heap, table.find(id(3)).unwrap()));
        table.find_or_create(id(3)).flags.insert(HolderFlags::VALUE_FIXUP_PERFORMED);
        assert!(is_placed(&table, &heap, table.find(id(3)).unwrap()));
    }

    #[test]
    fn empty_container_slot_means_not_placed() {
        let mut heap = ObjectHeap::new();
        let o = heap.alloc_instance("Shape", ["outer"]);
        let mut table = IdentifierTable::with_buckets(8);
        table.find_or_create(id(1)).value = Some(Value::Ref(o));
        nest(&mut table, 2, 1, field("outer"), Value::Struct(StructValue::new("Outer")));
        assert!(!is_placed(&table, &heap, table.find(id(2)).unwrap()));
        heap.set_member(o, "outer", Value::Struct(StructValue::new("Outer")))
            .unwrap();
        assert!(is_placed(&table, &heap, table.find(id(2)).unwrap()));
    }

    #[test]
    fn resolves_two_levels_to_heap_anchor() {
        let (table, heap, o) = two_level();
        let ChainResolution::Ready(chain) = ValueFixupChain::resolve(&table, &heap, id(3)).unwrap()
        else {
            panic!("expected ready chain");
        };
        assert_eq!(chain.anchor, ChainAnchor::Heap(o));
        assert_eq!(chain.steps, vec![field("outer"), field("inner")]);
        assert_eq!(chain.holders, vec![id(3), id(2)]);
    }

    #[test]
    fn write_patches_heap_and_refreshes_boxes() {
        let (mut table, mut heap, o) = two_level();
        let ChainResolution::Ready(chain) = ValueFixupChain::resolve(&table, &heap, id(3)).unwrap()
        else {
            panic!("expected ready chain");
        };
        chain
            .write(&mut table, &mut heap, &[field("target")], Value::Int(42))
            .unwrap();
        let live = heap
            .read_path(o, &[field("outer"), field("inner"), field("target")])
            .unwrap();
        assert_eq!(live, &Value::Int(42));
        let boxed_v2 = table.find(id(3)).unwrap().value.as_ref().unwrap();
        assert_eq!(boxed_v2.slot(&[field("target")]).unwrap(), &Value::Int(42));
        let boxed_v1 = table.find(id(2)).unwrap().value.as_ref().unwrap();
        assert_eq!(
            boxed_v1.slot(&[field("inner"), field("target")]).unwrap(),
            &Value::Int(42)
        );
    }

    #[test]
    fn unplaced_struct_container_becomes_boxed_anchor() {
        let mut table = IdentifierTable::with_buckets(8);
        let inner = StructValue::new("Inner").with_field("target", Value::Null);
        let outer = StructValue::new("Outer").with_field("inner", Value::Struct(inner.clone()));
        // Outer (1) is a root-level struct with no container.
        table.find_or_create(id(1)).value = Some(Value::Struct(outer));
        nest(&mut table, 2, 1, field("inner"), Value::Struct(inner));
        let mut heap = ObjectHeap::new();
        let ChainResolution::Ready(chain) = ValueFixupChain::resolve(&table, &heap, id(2)).unwrap()
        else {
            panic!("expected ready chain");
        };
        assert_eq!(chain.anchor, ChainAnchor::Boxed(id(1)));
        chain
            .write(&mut table, &mut heap, &[field("target")], Value::Int(5))
            .unwrap();
        let outer = table.find(id(1)).unwrap().value.as_ref().unwrap();
        assert_eq!(
            outer.slot(&[field("inner"), field("target")]).unwrap(),
            &Value::Int(5)
        );
    }

    #[test]
    fn array_slot_anchor() {
        let mut heap = ObjectHeap::new();
        let arr = heap.alloc_array("Point", vec![3]);
        let point = StructValue::new("Point").with_field("tag", Value::Null);
        heap.set_element(arr, &[2], Value::Struct(point.clone())).unwrap();
        let mut table = IdentifierTable::with_buckets(8);
        table.find_or_create(id(10)).value = Some(Value::Ref(arr));
        nest(&mut table, 11, 10, PathStep::Element(vec![2]), Value::Struct(point));
        let ChainResolution::Ready(chain) = ValueFixupChain::resolve(&table, &heap, id(11)).unwrap()
        else {
            panic!("expected ready chain");
        };
        chain
            .write(&mut table, &mut heap, &[field("tag")], Value::from("x"))
            .unwrap();
        let slot = heap.element(arr, &[2]).unwrap();
        assert_eq!(slot.slot(&[field("tag")]).unwrap(), &Value::from("x"));
    }

    #[test]
    fn missing_container_value_defers() {
        let mut table = IdentifierTable::with_buckets(8);
        table.find_or_create(id(1));
        nest(&mut table, 2, 1, field("f"), Value::Struct(StructValue::new("S")));
        assert_eq!(
            ValueFixupChain::resolve(&table, &ObjectHeap::new(), id(2)).unwrap(),
            ChainResolution::Deferred { blocked_on: id(1) }
        );
    }

    #[test]
    fn scalar_container_is_a_mismatch() {
        let mut table = IdentifierTable::with_buckets(8);
        table.find_or_create(id(1)).value = Some(Value::Int(3));
        nest(&mut table, 2, 1, field("f"), Value::Struct(StructValue::new("S")));
        assert!(matches!(
            ValueFixupChain::resolve(&table, &ObjectHeap::new(), id(2)),
            Err(FixupError::TargetMismatch { .. })
        ));
    }

    #[test]
    fn descendant_counts_propagate_through_struct_ancestors() {
        let (mut table, _, _) = two_level();
        assert!(adjust_descendants(&mut table, id(3), 2).is_empty());
        assert_eq!(table.find(id(2)).unwrap().descendant_count, 2);
        assert_eq!(table.find(id(1)).unwrap().descendant_count, 2);

        let zeroed = adjust_descendants(&mut table, id(3), -2);
        assert_eq!(zeroed, vec![id(2), id(1)]);
        assert_eq!(table.find(id(1)).unwrap().total_dependencies(), 0);
    }

    #[test]
    fn ancestors_match_the_counted_containers() {
        let (table, _, _) = two_level();
        assert_eq!(value_ancestors(&table, id(3)), vec![id(2), id(1)]);
        assert_eq!(value_ancestors(&table, id(2)), vec![id(1)]);
        assert!(value_ancestors(&table, id(1)).is_empty());
        assert!(value_ancestors(&table, id(9)).is_empty());
    }

    #[test]
    fn non_value_types_do_not_propagate() {
        let mut table = IdentifierTable::with_buckets(8);
        table.find_or_create(id(1)).value = Some(Value::Int(1));
        assert!(adjust_descendants(&mut table, id(1), 1).is_empty());
        assert_eq!(table.find(id(1)).unwrap().descendant_count, 0);
    }
}
