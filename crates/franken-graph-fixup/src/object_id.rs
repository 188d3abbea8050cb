//! Object identifiers issued by the format reader.
//!
//! Readers hand out signed 64-bit ids; zero means "no object" and negative
//! values are malformed input.  [`ObjectId`] is the validated form used
//! everywhere inside the engine.

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::FixupError;

/// A validated, strictly positive object id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectId(NonZeroU64);

impl ObjectId {
    /// Validate a raw reader id, naming the offending parameter on failure.
    pub fn parse(raw: i64, parameter: &str) -> Result<Self, FixupError> {
        Self::new(raw).ok_or_else(|| FixupError::InvalidArgument {
            parameter: parameter.to_string(),
            reason: format!("object id must be positive, got {raw}"),
        })
    }

    pub fn new(raw: i64) -> Option<Self> {
        u64::try_from(raw).ok().and_then(NonZeroU64::new).map(Self)
    }

    pub(crate) fn from_u64(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }

    pub(crate) const FIRST: Self = Self(NonZeroU64::MIN);

    pub(crate) fn successor(self) -> Self {
        Self(self.0.saturating_add(1))
    }

    pub fn as_u64(self) -> u64 {
        self.0.get()
    }

    /// Bucket index for a table with `buckets` slots.
    pub(crate) fn bucket(self, buckets: usize) -> usize {
        (self.0.get() % buckets as u64) as usize
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_and_negative() {
        assert!(ObjectId::new(0).is_none());
        assert!(ObjectId::new(-7).is_none());
        assert_eq!(ObjectId::new(7).map(ObjectId::as_u64), Some(7));
    }

    #[test]
    fn parse_names_parameter() {
        let err = ObjectId::parse(-1, "object_required").unwrap_err();
        match err {
            FixupError::InvalidArgument { parameter, .. } => {
                assert_eq!(parameter, "object_required");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bucket_is_modulo() {
        let id = ObjectId::new(37).unwrap();
        assert_eq!(id.bucket(16), 5);
        assert_eq!(id.bucket(32), 5);
        assert_eq!(id.bucket(64), 37);
    }

    #[test]
    fn display_and_serde() {
        let id = ObjectId::new(12).unwrap();
        assert_eq!(id.to_string(), "obj-12");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "12");
        let back: ObjectId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
        assert!(serde_json::from_str::<ObjectId>("0").is_err());
    }
}
