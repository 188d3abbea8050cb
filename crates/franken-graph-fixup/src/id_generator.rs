//! Serialization-side id assignment.
//!
//! Heap objects receive dense ids starting at 1 in first-visit order.
//! Value types with no identity that must still be addressable (nested
//! structs carrying references) draw anonymous ids from the same sequence.

use std::collections::BTreeMap;

use crate::object_id::ObjectId;
use crate::value::ObjectHandle;

#[derive(Debug, Clone, Default)]
pub struct IdGenerator {
    ids: BTreeMap<ObjectHandle, ObjectId>,
    last: Option<ObjectId>,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Id for `handle`, and whether this call assigned it.
    pub fn get_id(&mut self, handle: ObjectHandle) -> (ObjectId, bool) {
        if let Some(id) = self.ids.get(&handle) {
            return (*id, false);
        }
        let id = self.next_anonymous_id();
        self.ids.insert(handle, id);
        (id, true)
    }

    pub fn has_id(&self, handle: ObjectHandle) -> Option<ObjectId> {
        self.ids.get(&handle).copied()
    }

    /// Fresh id bound to no heap object.
    pub fn next_anonymous_id(&mut self) -> ObjectId {
        let id = self.last.map_or(ObjectId::FIRST, ObjectId::successor);
        self.last = Some(id);
        id
    }

    /// Heap objects seen so far.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Ids issued, including anonymous ones.
    pub fn issued(&self) -> u64 {
        self.last.map_or(0, ObjectId::as_u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_and_stable() {
        let mut ids = IdGenerator::new();
        let (a, first_a) = ids.get_id(ObjectHandle(7));
        let (b, first_b) = ids.get_id(ObjectHandle(3));
        let (again, first_again) = ids.get_id(ObjectHandle(7));
        assert_eq!((a.as_u64(), first_a), (1, true));
        assert_eq!((b.as_u64(), first_b), (2, true));
        assert_eq!((again, first_again), (a, false));
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn anonymous_ids_share_the_sequence() {
        let mut ids = IdGenerator::new();
        ids.get_id(ObjectHandle(0));
        let anon = ids.next_anonymous_id();
        let (next, _) = ids.get_id(ObjectHandle(1));
        assert_eq!(anon.as_u64(), 2);
        assert_eq!(next.as_u64(), 3);
        assert_eq!(ids.len(), 2);
        assert_eq!(ids.issued(), 3);
        assert_eq!(ids.has_id(ObjectHandle(9)), None);
        assert!(!ids.is_empty());
    }
}
