//! Identifier table: id -> holder.
//!
//! Holders live in an insertion-ordered arena; buckets hold the arena index
//! of the first holder in a chain linked through `next_in_bucket`.  The
//! bucket vector doubles (full rehash) once more than half the buckets'
//! worth of holders are stored.

use crate::holder::ObjectHolder;
use crate::object_id::ObjectId;

#[derive(Debug, Clone)]
pub struct IdentifierTable {
    holders: Vec<ObjectHolder>,
    buckets: Vec<Option<usize>>,
}

impl IdentifierTable {
    /// `initial_buckets` must be a power of two; callers validate config.
    pub fn with_buckets(initial_buckets: usize) -> Self {
        Self {
            holders: Vec::new(),
            buckets: vec![None; initial_buckets.max(2)],
        }
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn slot_of(&self, id: ObjectId) -> Option<usize> {
        let mut cursor = self.buckets[id.bucket(self.buckets.len())];
        while let Some(index) = cursor {
            let holder = &self.holders[index];
            if holder.id == id {
                return Some(index);
            }
            cursor = holder.next_in_bucket;
        }
        None
    }

    pub fn find(&self, id: ObjectId) -> Option<&ObjectHolder> {
        self.slot_of(id).map(|i| &self.holders[i])
    }

    pub fn find_mut(&mut self, id: ObjectId) -> Option<&mut ObjectHolder> {
        self.slot_of(id).map(|i| &mut self.holders[i])
    }

    pub fn contains(&self, id: ObjectId) -> bool {
        self.slot_of(id).is_some()
    }

    /// Existing holder, or a fresh stub.
    pub fn find_or_create(&mut self, id: ObjectId) -> &mut ObjectHolder {
        let index = match self.slot_of(id) {
            Some(i) => i,
            None => self.insert(ObjectHolder::stub(id)),
        };
        &mut self.holders[index]
    }

    /// Insert a holder whose id is not yet present; returns its arena slot.
    fn insert(&mut self, mut holder: ObjectHolder) -> usize {
        if (self.holders.len() + 1) * 2 > self.buckets.len() {
            self.grow();
        }
        let index = self.holders.len();
        let bucket = holder.id.bucket(self.buckets.len());
        holder.next_in_bucket = self.buckets[bucket];
        self.buckets[bucket] = Some(index);
        self.holders.push(holder);
        index
    }

    fn grow(&mut self) {
        let size = self.buckets.len() * 2;
        self.buckets = vec![None; size];
        for index in 0..self.holders.len() {
            let bucket = self.holders[index].id.bucket(size);
            self.holders[index].next_in_bucket = self.buckets[bucket];
            self.buckets[bucket] = Some(index);
        }
    }

    /// Holders in first-mention order.
    pub fn iter(&self) -> impl Iterator<Item = &ObjectHolder> {
        self.holders.iter()
    }

    pub fn ids(&self) -> Vec<ObjectId> {
        self.holders.iter().map(|h| h.id).collect()
    }

    /// Longest bucket chain; a health metric for tests.
    pub fn max_chain_len(&self) -> usize {
        self.buckets
            .iter()
            .map(|head| {
                let mut len = 0;
                let mut cursor = *head;
                while let Some(i) = cursor {
                    len += 1;
                    cursor = self.holders[i].next_in_bucket;
                }
                len
            })
            .max()
            .unwrap_or(0)
    }
}
