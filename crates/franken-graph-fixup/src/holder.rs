//! Per-object bookkeeping: holders, fixup records and placement descriptors.
//!
//! A holder is created the first time an id is mentioned, either by a
//! registration or by a fixup that needs it.  Holders created by fixups are
//! stubs (no value) until the reader registers the object.
//!
//! Two counters drive completion:
//!
//! * `direct_count`: fixups on this holder whose required object has not yet
//!   announced itself as stable.
//! * `descendant_count`: the same quantity summed over value types nested
//!   (transitively) inside this holder and still waiting for placement.
//!
//! A holder is ready once `total_dependencies() == 0`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborator::StateBag;
use crate::error::FixupError;
use crate::object_id::ObjectId;
use crate::value::{PathStep, Value};

// ---------------------------------------------------------------------------
// HolderFlags
// ---------------------------------------------------------------------------

/// Bitset of holder capabilities and progress markers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HolderFlags(u16);

impl HolderFlags {
    /// Value is an indirection that has not resolved to its real object.
    pub const INCOMPLETE_REFERENCE: Self = Self(0x0001);
    /// Value rebuilds itself from a state bag.
    pub const HAS_SELF_DESCRIBING: Self = Self(0x0002);
    /// Value is rebuilt by a surrogate.
    pub const HAS_SURROGATE: Self = Self(0x0004);
    /// Value is a value type that must be written into its container.
    pub const REQUIRES_VALUE_FIXUP: Self = Self(0x0008);
    /// State-bag reconstruction has run.
    pub const STATE_INFO_FIXED: Self = Self(0x0010);
    /// Value has been copied into its container at least once.
    pub const VALUE_FIXUP_PERFORMED: Self = Self(0x0020);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    /// Reconstruction through a state bag is still outstanding.
    pub const fn requires_state_fixup(self) -> bool {
        (self.0 & (Self::HAS_SELF_DESCRIBING.0 | Self::HAS_SURROGATE.0)) != 0
            && !self.contains(Self::STATE_INFO_FIXED)
    }
}

impl std::ops::BitOr for HolderFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl fmt::Display for HolderFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const NAMES: [(HolderFlags, &str); 6] = [
            (HolderFlags::INCOMPLETE_REFERENCE, "incomplete-reference"),
            (HolderFlags::HAS_SELF_DESCRIBING, "self-describing"),
            (HolderFlags::HAS_SURROGATE, "surrogate"),
            (HolderFlags::REQUIRES_VALUE_FIXUP, "requires-value-fixup"),
            (HolderFlags::STATE_INFO_FIXED, "state-fixed"),
            (HolderFlags::VALUE_FIXUP_PERFORMED, "value-fixup-performed"),
        ];
        let set: Vec<&str> = NAMES
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, name)| *name)
            .collect();
        if set.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&set.join("|"))
        }
    }
}

// ---------------------------------------------------------------------------
// HolderKind
// ---------------------------------------------------------------------------

/// How a holder's value is reconstructed, decided once at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HolderKind {
    Plain,
    /// Value substitutes itself with a different real object.
    CustomReference,
    /// Value is built by its own state constructor.
    SelfDescribing,
    /// Value is built by an external surrogate.
    SurrogateBacked,
}

impl HolderKind {
    pub fn accepts_delayed_fixups(self) -> bool {
        matches!(self, Self::SelfDescribing | Self::SurrogateBacked)
    }
}

impl fmt::Display for HolderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Plain => "plain",
            Self::CustomReference => "custom-reference",
            Self::SelfDescribing => "self-describing",
            Self::SurrogateBacked => "surrogate-backed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// FixupRecord
// ---------------------------------------------------------------------------

/// Where a required object is written once it is available.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixupTarget {
    Member(String),
    ArrayElement(Vec<usize>),
    /// Named entry in the holder's state bag; consumed by reconstruction.
    DelayedNamed(String),
}

impl FixupTarget {
    pub fn is_delayed(&self) -> bool {
        matches!(self, Self::DelayedNamed(_))
    }

    /// Path step addressing the slot inside the target value.
    pub fn step(&self) -> PathStep {
        match self {
            Self::Member(name) | Self::DelayedNamed(name) => PathStep::Field(name.clone()),
            Self::ArrayElement(indices) => PathStep::Element(indices.clone()),
        }
    }
}

impl fmt::Display for FixupTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Member(name) => write!(f, "member '{name}'"),
            Self::ArrayElement(indices) => {
                write!(f, "element {}", PathStep::Element(indices.clone()))
            }
            Self::DelayedNamed(name) => write!(f, "delayed '{name}'"),
        }
    }
}

/// "Write the value of `required` into `target` of the owning holder."
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixupRecord {
    pub required: ObjectId,
    pub target: FixupTarget,
    pub applied: bool,
}

// ---------------------------------------------------------------------------
// ValueFixupInfo
// ---------------------------------------------------------------------------

/// Where a nested value type lives inside its container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueFixupInfo {
    pub container: ObjectId,
    pub step: PathStep,
}

impl ValueFixupInfo {
    /// Build a descriptor from the reader's optional placement arguments.
    ///
    /// `None` means the value is not nested anywhere (root case).
    pub fn from_parts(
        id: ObjectId,
        container: Option<i64>,
        field: Option<&str>,
        array_index: Option<&[usize]>,
    ) -> Result<Option<Self>, FixupError> {
        let Some(raw) = container else {
            if field.is_some() || array_index.is_some() {
                return Err(FixupError::InvalidArgument {
                    parameter: "container_id".into(),
                    reason: "placement given without a container".into(),
                });
            }
            return Ok(None);
        };
        let container = ObjectId::parse(raw, "container_id")?;
        if container == id {
            return Err(FixupError::InvalidArgument {
                parameter: "container_id".into(),
                reason: format!("{id} cannot be its own container"),
            });
        }
        let step = match (field, array_index) {
            (Some(_), Some(_)) => {
                return Err(FixupError::InvalidArgument {
                    parameter: "array_index".into(),
                    reason: "member and array index are mutually exclusive".into(),
                });
            }
            (None, None) => {
                return Err(FixupError::InvalidArgument {
                    parameter: "field".into(),
                    reason: format!("container {container} given without member or index"),
                });
            }
            (Some(""), None) => {
                return Err(FixupError::InvalidArgument {
                    parameter: "field".into(),
                    reason: "member name is empty".into(),
                });
            }
            (Some(name), None) => PathStep::Field(name.to_string()),
            (None, Some([])) => {
                return Err(FixupError::InvalidArgument {
                    parameter: "array_index".into(),
                    reason: "index list is empty".into(),
                });
            }
            (None, Some(indices)) => PathStep::Element(indices.to_vec()),
        };
        Ok(Some(Self { container, step }))
    }
}

// ---------------------------------------------------------------------------
// ObjectHolder
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectHolder {
    pub(crate) id: ObjectId,
    pub(crate) value: Option<Value>,
    pub(crate) flags: HolderFlags,
    pub(crate) kind: HolderKind,
    /// Surrogate result may differ from the registered value.
    pub(crate) identity_preserving: bool,
    pub(crate) pending: Vec<FixupRecord>,
    /// Holders awaiting this one; one entry per fixup.
    pub(crate) dependents: Vec<ObjectId>,
    pub(crate) direct_count: u32,
    pub(crate) descendant_count: u32,
    pub(crate) value_fixup: Option<ValueFixupInfo>,
    pub(crate) state: Option<StateBag>,
    pub(crate) reachable: bool,
    pub(crate) marked_for_completion: bool,
    /// Unplaced value type already copied into a dependent or state bag.
    pub(crate) handed_out: bool,
    pub(crate) next_in_bucket: Option<usize>,
}

impl ObjectHolder {
    pub(crate) fn stub(id: ObjectId) -> Self {
        Self {
            id,
            value: None,
            flags: HolderFlags::empty(),
            kind: HolderKind::Plain,
            identity_preserving: false,
            pending: Vec::new(),
            dependents: Vec::new(),
            direct_count: 0,
            descendant_count: 0,
            value_fixup: None,
            state: None,
            reachable: false,
            marked_for_completion: false,
            handed_out: false,
            next_in_bucket: None,
        }
    }

    pub fn id(&self) -> ObjectId {
        self.id
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn flags(&self) -> HolderFlags {
        self.flags
    }

    pub fn kind(&self) -> HolderKind {
        self.kind
    }

    pub fn has(&self, flag: HolderFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn is_registered(&self) -> bool {
        self.value.is_some()
    }

    pub fn total_dependencies(&self) -> u32 {
        self.direct_count.saturating_add(self.descendant_count)
    }

    pub fn requires_value_fixup(&self) -> bool {
        self.has(HolderFlags::REQUIRES_VALUE_FIXUP)
    }

    /// Value can still change identity, so dependents must not copy it yet.
    pub fn can_value_change(&self) -> bool {
        self.has(HolderFlags::INCOMPLETE_REFERENCE)
            || (self.has(HolderFlags::HAS_SURROGATE)
                && !self.identity_preserving
                && !self.has(HolderFlags::STATE_INFO_FIXED))
    }

    /// Registered and safe to hand out to dependents.
    ///
    /// Self-describing reference objects are stable before reconstruction
    /// (reconstruction runs in place); self-describing value types are not,
    /// since dependents would copy an unbuilt struct.  A value type with no
    /// container placement is copied out of its own box, so it is stable only
    /// once nothing it depends on is outstanding.
    pub fn is_stable(&self) -> bool {
        let Some(value) = &self.value else {
            return false;
        };
        if self.can_value_change() {
            return false;
        }
        if !value.is_struct() {
            return true;
        }
        if self.flags.requires_state_fixup() {
            return false;
        }
        self.requires_value_fixup() || self.total_dependencies() == 0
    }

    /// Value type copied by value rather than written through a placement.
    pub fn is_unplaced_struct(&self) -> bool {
        self.value.as_ref().is_some_and(Value::is_struct) && !self.requires_value_fixup()
    }

    /// Needs a turn in the special-holder loop of the completion pass.
    pub fn requires_delayed_fixup(&self) -> bool {
        self.has(HolderFlags::INCOMPLETE_REFERENCE) || self.flags.requires_state_fixup()
    }

    pub fn unapplied(&self) -> impl Iterator<Item = (usize, &FixupRecord)> {
        self.pending.iter().enumerate().filter(|(_, r)| !r.applied)
    }

    pub fn unapplied_count(&self) -> usize {
        self.pending.iter().filter(|r| !r.applied).count()
    }

    pub(crate) fn has_unapplied_requiring(&self, required: ObjectId) -> bool {
        self.pending.iter().any(|r| !r.applied && r.required == required)
    }

    pub(crate) fn take_completion_mark(&mut self) -> bool {
        std::mem::take(&mut self.marked_for_completion)
    }

    /// Point-in-time view for diagnostics and tests.
    pub fn summary(&self) -> HolderSummary {
        HolderSummary {
            id: self.id,
            kind: self.kind,
            flags: self.flags,
            registered: self.value.is_some(),
            stable: self.is_stable(),
            direct_count: self.direct_count,
            descendant_count: self.descendant_count,
            unapplied_fixups: self.unapplied_count(),
            dependents: self.dependents.clone(),
            reachable: self.reachable,
            marked_for_completion: self.marked_for_completion,
            value_fixup: self.value_fixup.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderSummary {
    pub id: ObjectId,
    pub kind: HolderKind,
    pub flags: HolderFlags,
    pub registered: bool,
    pub stable: bool,
    pub direct_count: u32,
    pub descendant_count: u32,
    pub unapplied_fixups: usize,
    pub dependents: Vec<ObjectId>,
    pub reachable: bool,
    pub marked_for_completion: bool,
    pub value_fixup: Option<ValueFixupInfo>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::StructValue;

    fn id(n: i64) -> ObjectId {
        ObjectId::new(n).unwrap()
    }

    #[test]
    fn flags_insert_remove_display() {
        let mut flags = HolderFlags::empty();
        assert_eq!(flags.to_string(), "none");
        flags.insert(HolderFlags::HAS_SURROGATE | HolderFlags::REQUIRES_VALUE_FIXUP);
        assert!(flags.contains(HolderFlags::HAS_SURROGATE));
        assert!(flags.requires_state_fixup());
        assert_eq!(flags.to_string(), "surrogate|requires-value-fixup");
        flags.insert(HolderFlags::STATE_INFO_FIXED);
        assert!(!flags.requires_state_fixup());
        flags.remove(HolderFlags::HAS_SURROGATE);
        assert!(!flags.contains(HolderFlags::HAS_SURROGATE));
    }

    #[test]
    fn stub_is_not_stable() {
        let holder = ObjectHolder::stub(id(1));
        assert!(!holder.is_registered());
        assert!(!holder.is_stable());
        assert_eq!(holder.total_dependencies(), 0);
    }

    #[test]
    fn surrogate_stability_depends_on_identity() {
        let mut holder = ObjectHolder::stub(id(1));
        holder.value = Some(Value::Int(1));
        holder.flags.insert(HolderFlags::HAS_SURROGATE);
        assert!(!holder.is_stable());
        holder.identity_preserving = true;
        assert!(holder.is_stable());
        holder.identity_preserving = false;
        holder.flags.insert(HolderFlags::STATE_INFO_FIXED);
        assert!(holder.is_stable());
    }

    #[test]
    fn self_describing_struct_waits_for_reconstruction() {
        let mut holder = ObjectHolder::stub(id(1));
        holder.value = Some(Value::Struct(StructValue::new("S")));
        holder.flags.insert(HolderFlags::HAS_SELF_DESCRIBING);
        assert!(!holder.is_stable());
        assert!(holder.requires_delayed_fixup());
        holder.flags.insert(HolderFlags::STATE_INFO_FIXED);
        assert!(holder.is_stable());
    }

    #[test]
    fn unplaced_struct_waits_for_its_own_fixups() {
        let mut holder = ObjectHolder::stub(id(2));
        holder.value = Some(Value::Struct(StructValue::new("Point")));
        assert!(holder.is_unplaced_struct());
        assert!(holder.is_stable());
        holder.direct_count = 1;
        assert!(!holder.is_stable());
        holder.direct_count = 0;
        holder.descendant_count = 2;
        assert!(!holder.is_stable());
        holder.descendant_count = 0;
        assert!(holder.is_stable());
    }

    #[test]
    fn placed_struct_is_stable_with_outstanding_fixups() {
        let mut holder = ObjectHolder::stub(id(2));
        holder.value = Some(Value::Struct(StructValue::new("Point")));
        holder.flags.insert(HolderFlags::REQUIRES_VALUE_FIXUP);
        holder.direct_count = 3;
        assert!(!holder.is_unplaced_struct());
        assert!(holder.is_stable());
    }

    #[test]
    fn value_fixup_info_root_case() {
        assert_eq!(ValueFixupInfo::from_parts(id(2), None, None, None), Ok(None));
    }

    #[test]
    fn value_fixup_info_rejects_conflicts() {
        let both = ValueFixupInfo::from_parts(id(2), Some(1), Some("f"), Some(&[0]));
        assert!(matches!(both, Err(FixupError::InvalidArgument { .. })));
        let neither = ValueFixupInfo::from_parts(id(2), Some(1), None, None);
        assert!(matches!(neither, Err(FixupError::InvalidArgument { .. })));
        let orphan = ValueFixupInfo::from_parts(id(2), None, Some("f"), None);
        assert!(matches!(orphan, Err(FixupError::InvalidArgument { .. })));
        let own = ValueFixupInfo::from_parts(id(2), Some(2), Some("f"), None);
        assert!(matches!(own, Err(FixupError::InvalidArgument { .. })));
        let bad = ValueFixupInfo::from_parts(id(2), Some(0), Some("f"), None);
        assert!(matches!(bad, Err(FixupError::InvalidArgument { .. })));
    }

    #[test]
    fn value_fixup_info_builds_steps() {
        let member = ValueFixupInfo::from_parts(id(2), Some(1), Some("origin"), None)
            .unwrap()
            .unwrap();
        assert_eq!(member.step, PathStep::Field("origin".into()));
        let slot = ValueFixupInfo::from_parts(id(2), Some(1), None, Some(&[1, 0]))
            .unwrap()
            .unwrap();
        assert_eq!(slot.step, PathStep::Element(vec![1, 0]));
    }

    #[test]
    fn summary_counts_unapplied_only() {
        let mut holder = ObjectHolder::stub(id(1));
        holder.pending.push(FixupRecord {
            required: id(2),
            target: FixupTarget::Member("a".into()),
            applied: true,
        });
        holder.pending.push(FixupRecord {
            required: id(3),
            target: FixupTarget::Member("b".into()),
            applied: false,
        });
        assert_eq!(holder.summary().unapplied_fixups, 1);
        assert!(holder.has_unapplied_requiring(id(3)));
        assert!(!holder.has_unapplied_requiring(id(2)));
    }

    #[test]
    fn delayed_targets_only_for_custom_kinds() {
        assert!(HolderKind::SelfDescribing.accepts_delayed_fixups());
        assert!(HolderKind::SurrogateBacked.accepts_delayed_fixups());
        assert!(!HolderKind::Plain.accepts_delayed_fixups());
        assert!(!HolderKind::CustomReference.accepts_delayed_fixups());
        assert!(FixupTarget::DelayedNamed("x".into()).is_delayed());
    }
}
