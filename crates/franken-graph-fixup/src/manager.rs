//! The object manager: registration, fixup recording, and the dependency
//! cascade that completes objects as their requirements become available.
//!
//! A pass has two phases.  While *recording*, the reader registers values
//! and records fixups in whatever order it discovers them; plain member and
//! array writes are applied as soon as both ends exist.  Custom
//! reconstruction (surrogates, self-describing objects, reference
//! indirections) is never finalized while recording.  `run_completion`
//! (see the `coordinator` module) switches to *completing*, finishes the
//! graph, and closes the manager.
//!
//! Counting follows two rules:
//!
//! * `fixup_count` is the number of recorded fixups not yet applied.
//! * a holder's `direct_count` is the number of its fixups whose required
//!   object has not yet announced itself stable.  A required object that is
//!   already stable when the fixup is recorded is never counted.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::collaborator::{ReferenceError, StateBag, SurrogateSelector, TypeCatalog};
use crate::config::{ConfigError, ManagerConfig};
use crate::error::FixupError;
use crate::event::{EventDraft, EventLog, EventOutcome, FixupEventKind};
use crate::holder::{
    FixupRecord, FixupTarget, HolderFlags, HolderKind, HolderSummary, ObjectHolder,
    ValueFixupInfo,
};
use crate::lifecycle::{HookChainCache, LifecyclePhase, invoke_hooks};
use crate::object_id::ObjectId;
use crate::table::IdentifierTable;
use crate::value::{ModelError, ObjectHandle, ObjectHeap, Value};
use crate::value_fixup::{
    ChainResolution, ValueFixupChain, adjust_descendants, is_placed, value_ancestors,
};

pub(crate) const COMPONENT_REGISTRY: &str = "registry";
pub(crate) const COMPONENT_COMPLETION: &str = "completion";
pub(crate) const COMPONENT_VALUE_FIXUP: &str = "value_fixup";
pub(crate) const COMPONENT_LIFECYCLE: &str = "lifecycle";

// ---------------------------------------------------------------------------
// RegisterOptions
// ---------------------------------------------------------------------------

/// Optional arguments to [`ObjectManager::register_value`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterOptions {
    /// Object that physically contains this value type.
    pub container_id: Option<i64>,
    /// Member of the container holding the value.
    pub field: Option<String>,
    /// Array slot of the container holding the value.
    pub array_index: Option<Vec<usize>>,
    /// Serialized state for surrogate or self-describing reconstruction.
    pub state: Option<StateBag>,
}

impl RegisterOptions {
    pub fn in_member(container_id: i64, field: impl Into<String>) -> Self {
        Self {
            container_id: Some(container_id),
            field: Some(field.into()),
            ..Self::default()
        }
    }

    pub fn in_element(container_id: i64, indices: Vec<usize>) -> Self {
        Self {
            container_id: Some(container_id),
            array_index: Some(indices),
            ..Self::default()
        }
    }

    pub fn with_state(mut self, state: StateBag) -> Self {
        self.state = Some(state);
        self
    }
}

// ---------------------------------------------------------------------------
// PassPhase
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassPhase {
    Recording,
    Completing,
    Closed,
}

impl fmt::Display for PassPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Recording => "recording",
            Self::Completing => "completing",
            Self::Closed => "closed",
        };
        f.write_str(name)
    }
}

// ---------------------------------------------------------------------------
// InvariantViolation
// ---------------------------------------------------------------------------

/// Bookkeeping inconsistency found by [`ObjectManager::check_invariants`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub object_id: Option<ObjectId>,
    pub detail: String,
}

impl fmt::Display for InvariantViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.object_id {
            Some(id) => write!(f, "invariant violated at {id}: {}", self.detail),
            None => write!(f, "invariant violated: {}", self.detail),
        }
    }
}

impl std::error::Error for InvariantViolation {}

/// Result of one `complete_object` attempt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Completion {
    pub applied: usize,
    /// The holder turned stable and its dependents must be told.
    pub newly_stable: bool,
}

enum WriteRoute {
    Heap(ObjectHandle),
    Boxed,
    Chain,
}

// ---------------------------------------------------------------------------
// ObjectManager
// ---------------------------------------------------------------------------

/// Rebuilds one object graph from registrations and fixups.
///
/// Not shared between passes: each deserialization gets its own manager.
#[derive(Debug)]
pub struct ObjectManager {
    pub(crate) config: ManagerConfig,
    pub(crate) catalog: TypeCatalog,
    pub(crate) heap: ObjectHeap,
    pub(crate) table: IdentifierTable,
    pub(crate) hook_cache: HookChainCache,
    pub(crate) events: EventLog,
    /// Holders needing a turn in the special loop, in registration order.
    pub(crate) special: Vec<ObjectId>,
    /// Holders whose `Deserialized` hooks wait for a successful pass.
    pub(crate) deferred_hooks: Vec<ObjectId>,
    pub(crate) fixup_count: u64,
    pub(crate) root: Option<ObjectId>,
    pub(crate) first_registered: Option<ObjectId>,
    pub(crate) phase: PassPhase,
}

impl ObjectManager {
    pub fn new(config: ManagerConfig, catalog: TypeCatalog) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            table: IdentifierTable::with_buckets(config.initial_table_size),
            events: EventLog::new(config.trace_id.clone(), config.record_events),
            config,
            catalog,
            heap: ObjectHeap::new(),
            hook_cache: HookChainCache::new(),
            special: Vec::new(),
            deferred_hooks: Vec::new(),
            fixup_count: 0,
            root: None,
            first_registered: None,
            phase: PassPhase::Recording,
        })
    }

    // -- accessors ----------------------------------------------------------

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn catalog(&self) -> &TypeCatalog {
        &self.catalog
    }

    pub fn heap(&self) -> &ObjectHeap {
        &self.heap
    }

    /// Readers allocate the objects they are about to register here.
    pub fn heap_mut(&mut self) -> &mut ObjectHeap {
        &mut self.heap
    }

    pub fn events(&self) -> &EventLog {
        &self.events
    }

    pub fn phase(&self) -> PassPhase {
        self.phase
    }

    /// Recorded fixups not yet applied.
    pub fn fixup_count(&self) -> u64 {
        self.fixup_count
    }

    pub fn holder_count(&self) -> usize {
        self.table.len()
    }

    pub fn holder(&self, id: ObjectId) -> Option<&ObjectHolder> {
        self.table.find(id)
    }

    pub fn holder_summary(&self, id: i64) -> Option<HolderSummary> {
        ObjectId::new(id)
            .and_then(|id| self.table.find(id))
            .map(ObjectHolder::summary)
    }

    /// Explicit root, else the first registered object.
    pub fn root_id(&self) -> Option<ObjectId> {
        self.root.or(self.first_registered)
    }

    /// The value registered for `id`, if it is stable.  Indirection
    /// placeholders and unfinalized surrogate values are never returned.
    pub fn get_object(&self, id: i64) -> Result<Option<&Value>, FixupError> {
        let id = ObjectId::parse(id, "id")?;
        Ok(self
            .table
            .find(id)
            .filter(|h| h.is_stable())
            .and_then(ObjectHolder::value))
    }

    /// Hand the rebuilt heap to the caller.
    pub fn into_graph(self) -> ObjectHeap {
        self.heap
    }

    pub(crate) fn is_stable(&self, id: ObjectId) -> bool {
        self.table.find(id).is_some_and(ObjectHolder::is_stable)
    }

    /// Stable, yet still listing holders that wait on it.
    fn releases_dependents(&self, id: ObjectId) -> bool {
        self.table
            .find(id)
            .is_some_and(|h| h.is_stable() && !h.dependents.is_empty())
    }

    /// `id` and the containers its counts propagate to, where stable now.
    fn stable_with_ancestors(&self, id: ObjectId) -> Vec<ObjectId> {
        std::iter::once(id)
            .chain(value_ancestors(&self.table, id))
            .filter(|candidate| self.is_stable(*candidate))
            .collect()
    }

    pub(crate) fn ensure_open(&self) -> Result<(), FixupError> {
        match self.phase {
            PassPhase::Recording => Ok(()),
            PassPhase::Completing | PassPhase::Closed => Err(FixupError::PassClosed),
        }
    }

    pub(crate) fn emit(
        &mut self,
        component: &str,
        event: FixupEventKind,
        object_id: Option<ObjectId>,
        outcome: EventOutcome,
        error: Option<&FixupError>,
        detail: String,
    ) {
        self.events.push(EventDraft {
            component,
            event,
            object_id,
            outcome,
            error_code: error.map(FixupError::error_code),
            detail,
        });
    }

    /// Record a failed public call and close the pass.
    fn abort(&mut self, event: FixupEventKind, raw_id: i64, err: FixupError) -> FixupError {
        self.emit(
            COMPONENT_REGISTRY,
            event,
            ObjectId::new(raw_id),
            EventOutcome::Failed,
            Some(&err),
            err.to_string(),
        );
        self.phase = PassPhase::Closed;
        err
    }

    // -- registration ---------------------------------------------------------

    /// Register the materialized value for `id`.
    ///
    /// Fixups already recorded against `id` are applied where their required
    /// objects are available, and holders waiting on `id` are notified.
    pub fn register_value(
        &mut self,
        id: i64,
        value: Value,
        options: RegisterOptions,
    ) -> Result<(), FixupError> {
        self.ensure_open()?;
        self.register_inner(id, value, options)
            .map_err(|err| self.abort(FixupEventKind::Register, id, err))
    }

    fn register_inner(
        &mut self,
        raw_id: i64,
        value: Value,
        options: RegisterOptions,
    ) -> Result<(), FixupError> {
        let id = ObjectId::parse(raw_id, "id")?;
        if value.is_null() {
            return Err(FixupError::InvalidArgument {
                parameter: "value".into(),
                reason: "cannot register a null value".into(),
            });
        }
        let placement = ValueFixupInfo::from_parts(
            id,
            options.container_id,
            options.field.as_deref(),
            options.array_index.as_deref(),
        )?;
        if self.table.find(id).is_some_and(ObjectHolder::is_registered) {
            return Err(FixupError::DuplicateRegistration(id));
        }

        let (kind, flags, identity_preserving) = self.classify(&value);
        if kind.accepts_delayed_fixups() && options.state.is_none() {
            return Err(FixupError::MissingStateInfo(id));
        }
        if let Some(existing) = self.table.find(id) {
            for (_, record) in existing.unapplied() {
                check_fixup_kind(id, kind, &record.target)?;
            }
        }

        let is_new = !self.table.contains(id);
        let nested = placement.filter(|_| value.is_struct());
        let (kind_label, flags_label) = {
            let holder = self.table.find_or_create(id);
            holder.value = Some(value);
            holder.kind = kind;
            holder.flags.insert(flags);
            holder.identity_preserving = identity_preserving;
            holder.state = options.state;
            if let Some(info) = nested.clone() {
                holder.flags.insert(HolderFlags::REQUIRES_VALUE_FIXUP);
                holder.value_fixup = Some(info);
            }
            (holder.kind.to_string(), holder.flags.to_string())
        };
        if let Some(info) = &nested {
            self.table.find_or_create(info.container);
            let outstanding = self
                .table
                .find(id)
                .map_or(0, ObjectHolder::total_dependencies);
            let was_stable = self.stable_with_ancestors(info.container);
            adjust_descendants(&mut self.table, id, i64::from(outstanding));
            self.withdraw_stability(was_stable)?;
        }
        self.first_registered.get_or_insert(id);
        self.emit(
            COMPONENT_REGISTRY,
            FixupEventKind::Register,
            Some(id),
            EventOutcome::Ok,
            None,
            match &nested {
                Some(info) => format!(
                    "kind={kind_label} flags={flags_label} in {}{}",
                    info.container, info.step
                ),
                None => format!("kind={kind_label} flags={flags_label}"),
            },
        );

        self.run_hooks(LifecyclePhase::Deserializing, id)?;

        let (delayed, marked) = {
            let holder = self.table.find_or_create(id);
            (holder.requires_delayed_fixup(), holder.take_completion_mark())
        };
        if delayed {
            self.add_special(id);
        }
        if marked {
            self.emit(
                COMPONENT_COMPLETION,
                FixupEventKind::CompleteObject,
                Some(id),
                EventOutcome::Ok,
                None,
                "completing holder whose dependencies resolved before registration".into(),
            );
        }
        self.complete_object(id)?;
        if self.is_stable(id) {
            self.cascade(id)?;
        }

        let settled = self
            .table
            .find(id)
            .is_some_and(|h| h.total_dependencies() == 0 && !h.requires_delayed_fixup());
        if !is_new && settled {
            self.run_hooks(LifecyclePhase::Deserialized, id)?;
        } else {
            self.deferred_hooks.push(id);
        }
        Ok(())
    }

    /// Decide once how a value is reconstructed.
    fn classify(&self, value: &Value) -> (HolderKind, HolderFlags, bool) {
        let Some(type_name) = value.type_name(&self.heap) else {
            return (HolderKind::Plain, HolderFlags::empty(), false);
        };
        let resolver = self.catalog.resolver_for(type_name).is_some();
        let indirection = if resolver {
            HolderFlags::INCOMPLETE_REFERENCE
        } else {
            HolderFlags::empty()
        };
        if let Some(surrogate) = self.catalog.surrogate_for(type_name) {
            return (
                HolderKind::SurrogateBacked,
                HolderFlags::HAS_SURROGATE,
                surrogate.preserves_identity(),
            );
        }
        if self.catalog.constructor_for(type_name).is_some() {
            return (
                HolderKind::SelfDescribing,
                HolderFlags::HAS_SELF_DESCRIBING | indirection,
                false,
            );
        }
        if resolver {
            return (HolderKind::CustomReference, indirection, false);
        }
        (HolderKind::Plain, HolderFlags::empty(), false)
    }

    fn add_special(&mut self, id: ObjectId) {
        if !self.special.contains(&id) {
            self.special.push(id);
        }
    }

    /// Mark the top-level object of the graph.
    pub fn set_root(&mut self, id: i64) -> Result<(), FixupError> {
        self.ensure_open()?;
        let root = ObjectId::parse(id, "id")
            .map_err(|err| self.abort(FixupEventKind::Register, id, err))?;
        self.root = Some(root);
        if let Some(holder) = self.table.find_mut(root) {
            holder.reachable = true;
        }
        Ok(())
    }

    // -- fixup recording ------------------------------------------------------

    /// `object_to_be_fixed.member = object_required` once available.
    pub fn record_member_fixup(
        &mut self,
        object_to_be_fixed: i64,
        member: &str,
        object_required: i64,
    ) -> Result<(), FixupError> {
        self.record_fixup(
            object_to_be_fixed,
            FixupTarget::Member(member.to_string()),
            object_required,
        )
    }

    /// `object_to_be_fixed[index] = object_required` for a one-dimensional array.
    pub fn record_array_fixup(
        &mut self,
        object_to_be_fixed: i64,
        index: usize,
        object_required: i64,
    ) -> Result<(), FixupError> {
        self.record_array_fixup_at(object_to_be_fixed, &[index], object_required)
    }

    /// Multi-dimensional form of [`ObjectManager::record_array_fixup`].
    pub fn record_array_fixup_at(
        &mut self,
        object_to_be_fixed: i64,
        indices: &[usize],
        object_required: i64,
    ) -> Result<(), FixupError> {
        self.record_fixup(
            object_to_be_fixed,
            FixupTarget::ArrayElement(indices.to_vec()),
            object_required,
        )
    }

    /// Fill state entry `member_name` of a custom-reconstruction holder.
    pub fn record_delayed_fixup(
        &mut self,
        object_to_be_fixed: i64,
        member_name: &str,
        object_required: i64,
    ) -> Result<(), FixupError> {
        self.record_fixup(
            object_to_be_fixed,
            FixupTarget::DelayedNamed(member_name.to_string()),
            object_required,
        )
    }

    fn record_fixup(
        &mut self,
        to_raw: i64,
        target: FixupTarget,
        required_raw: i64,
    ) -> Result<(), FixupError> {
        self.ensure_open()?;
        self.record_inner(to_raw, target, required_raw)
            .map_err(|err| self.abort(FixupEventKind::RecordFixup, to_raw, err))
    }

    fn record_inner(
        &mut self,
        to_raw: i64,
        target: FixupTarget,
        required_raw: i64,
    ) -> Result<(), FixupError> {
        let to = ObjectId::parse(to_raw, "object_to_be_fixed")?;
        let required = ObjectId::parse(required_raw, "object_required")?;
        validate_target(&target)?;

        if let Some(holder) = self.table.find(to) {
            if holder.is_registered() {
                check_fixup_kind(to, holder.kind, &target)?;
                if holder.handed_out {
                    return Err(FixupError::InvalidFixupType {
                        id: to,
                        reason: format!("{target} on a value type already copied out"),
                    });
                }
            } else if let Some((_, other)) = holder
                .unapplied()
                .find(|(_, r)| r.target.is_delayed() != target.is_delayed())
            {
                return Err(FixupError::InvalidFixupType {
                    id: to,
                    reason: format!("{target} mixed with {}", other.target),
                });
            }
        }

        let required_stable = self.is_stable(required);
        let detail = format!("{to} {target} <- {required}");
        self.table.find_or_create(to).pending.push(FixupRecord {
            required,
            target,
            applied: false,
        });
        self.fixup_count += 1;
        if !required_stable {
            let was_stable = self.stable_with_ancestors(to);
            self.table.find_or_create(to).direct_count += 1;
            adjust_descendants(&mut self.table, to, 1);
            self.table.find_or_create(required).dependents.push(to);
            self.withdraw_stability(was_stable)?;
        }
        self.emit(
            COMPONENT_REGISTRY,
            FixupEventKind::RecordFixup,
            Some(to),
            if required_stable {
                EventOutcome::Ok
            } else {
                EventOutcome::Deferred
            },
            None,
            detail,
        );
        if required_stable {
            self.complete_object(to)?;
        }
        Ok(())
    }

    // -- completion -------------------------------------------------------------

    /// Apply every fixup of `id` whose required object is stable.  During the
    /// completing phase a custom-reconstruction holder with no outstanding
    /// dependencies is finalized instead.
    pub(crate) fn complete_object(&mut self, id: ObjectId) -> Result<Completion, FixupError> {
        let Some(holder) = self.table.find(id) else {
            return Ok(Completion::default());
        };
        if holder.value.is_none() {
            return Ok(Completion::default());
        }
        let was_stable = holder.is_stable();
        if holder.flags.requires_state_fixup() {
            if self.phase != PassPhase::Completing || holder.total_dependencies() > 0 {
                return Ok(Completion::default());
            }
            let consumed = self.finalize_special(id)?;
            return Ok(Completion {
                applied: consumed,
                newly_stable: !was_stable && self.is_stable(id),
            });
        }
        let ready: Vec<usize> = holder
            .unapplied()
            .filter(|(_, r)| self.is_stable(r.required))
            .map(|(index, _)| index)
            .collect();
        let mut applied = 0;
        for index in ready {
            if self.apply_fixup(id, index)? {
                applied += 1;
            }
        }
        if applied > 0 {
            let remaining = self.table.find(id).map_or(0, ObjectHolder::unapplied_count);
            self.emit(
                COMPONENT_COMPLETION,
                FixupEventKind::CompleteObject,
                Some(id),
                EventOutcome::Ok,
                None,
                format!("applied {applied}, {remaining} remaining"),
            );
        }
        Ok(Completion {
            applied,
            newly_stable: !was_stable && self.is_stable(id),
        })
    }

    /// Holders in `was_stable` that lost stability are counted as unstable
    /// again by every holder still waiting on them.  A value type that was
    /// already copied out cannot be taken back.
    fn withdraw_stability(&mut self, was_stable: Vec<ObjectId>) -> Result<(), FixupError> {
        let mut queue = VecDeque::from(was_stable);
        let mut withdrawn: Vec<ObjectId> = Vec::new();
        while let Some(id) = queue.pop_front() {
            let Some(holder) = self.table.find(id) else {
                continue;
            };
            if holder.is_stable() || withdrawn.contains(&id) {
                continue;
            }
            if holder.handed_out {
                return Err(FixupError::InvalidFixupType {
                    id,
                    reason: "value type gained dependencies after it was copied out".into(),
                });
            }
            withdrawn.push(id);
            let mut waiting = Vec::new();
            for other in self.table.iter() {
                for (_, record) in other.unapplied() {
                    if record.required == id {
                        waiting.push(other.id);
                    }
                }
            }
            for dependent in waiting {
                queue.extend(self.stable_with_ancestors(dependent));
                self.table.find_or_create(dependent).direct_count += 1;
                adjust_descendants(&mut self.table, dependent, 1);
                self.table.find_or_create(id).dependents.push(dependent);
            }
        }
        Ok(())
    }

    /// Perform one recorded write.  Returns false when the write had to be
    /// deferred because a value-type container is not available yet.
    fn apply_fixup(&mut self, id: ObjectId, index: usize) -> Result<bool, FixupError> {
        let (record, reachable, route) = {
            let holder = self.table.find(id).ok_or(FixupError::ObjectNeverSeen(id))?;
            let record = holder.pending[index].clone();
            let route = match &holder.value {
                None => return Err(FixupError::MissingObject(id)),
                Some(Value::Ref(handle)) => WriteRoute::Heap(*handle),
                Some(Value::Struct(_))
                    if holder.requires_value_fixup()
                        && is_placed(&self.table, &self.heap, holder) =>
                {
                    WriteRoute::Chain
                }
                Some(Value::Struct(_)) => WriteRoute::Boxed,
                Some(other) => {
                    return Err(FixupError::TargetMismatch {
                        id,
                        reason: format!("cannot write {} into {other}", record.target),
                    });
                }
            };
            (record, holder.reachable, route)
        };
        if record.applied {
            return Ok(false);
        }
        let value = self
            .table
            .find(record.required)
            .and_then(|h| h.value.clone())
            .ok_or(FixupError::ObjectNeverSeen(record.required))?;
        if reachable {
            if let Value::TypeLoadFailure { type_name } = &value {
                return Err(FixupError::TypeLoadFailure {
                    type_name: type_name.clone(),
                });
            }
            self.table.find_or_create(record.required).reachable = true;
        }

        let step = [record.target.step()];
        let mismatch = |e: ModelError| FixupError::TargetMismatch {
            id,
            reason: e.to_string(),
        };
        match route {
            WriteRoute::Heap(handle) => {
                self.heap.write_path(handle, &step, value).map_err(mismatch)?;
            }
            WriteRoute::Boxed => {
                let boxed = self
                    .table
                    .find_mut(id)
                    .and_then(|h| h.value.as_mut())
                    .ok_or(FixupError::MissingObject(id))?;
                *boxed.slot_mut(&step).map_err(mismatch)? = value;
            }
            WriteRoute::Chain => match ValueFixupChain::resolve(&self.table, &self.heap, id)? {
                ChainResolution::Ready(chain) => {
                    chain.write(&mut self.table, &mut self.heap, &step, value)?;
                    self.emit(
                        COMPONENT_VALUE_FIXUP,
                        FixupEventKind::ValueTypeWrite,
                        Some(id),
                        EventOutcome::Ok,
                        None,
                        format!("{} through {} container steps", record.target, chain.steps.len()),
                    );
                }
                ChainResolution::Deferred { blocked_on } => {
                    self.emit(
                        COMPONENT_VALUE_FIXUP,
                        FixupEventKind::ValueTypeWrite,
                        Some(id),
                        EventOutcome::Deferred,
                        None,
                        format!("container {blocked_on} has no value yet"),
                    );
                    return Ok(false);
                }
            },
        }

        if let Some(holder) = self.table.find_mut(id) {
            holder.pending[index].applied = true;
        }
        debug_assert!(self.fixup_count > 0, "applied a fixup that was never counted");
        self.fixup_count = self.fixup_count.saturating_sub(1);
        if let Some(required) = self.table.find_mut(record.required)
            && required.is_unplaced_struct()
        {
            required.handed_out = true;
        }
        if let Some(required) = self.table.find_mut(record.required)
            && required.requires_value_fixup()
            && required
                .value_fixup
                .as_ref()
                .is_some_and(|info| info.container == id)
        {
            required.flags.insert(HolderFlags::VALUE_FIXUP_PERFORMED);
        }
        self.emit(
            COMPONENT_COMPLETION,
            FixupEventKind::ApplyFixup,
            Some(id),
            EventOutcome::Ok,
            None,
            format!("{} <- {}", record.target, record.required),
        );
        Ok(true)
    }

    /// Tell everything waiting on `id` that it is now stable, completing
    /// dependents (and their value-type ancestors) as their counts drop.
    pub(crate) fn cascade(&mut self, id: ObjectId) -> Result<(), FixupError> {
        let mut queue = VecDeque::from([id]);
        while let Some(current) = queue.pop_front() {
            let dependents = match self.table.find_mut(current) {
                Some(holder) => std::mem::take(&mut holder.dependents),
                None => continue,
            };
            for dependent in dependents {
                let mut touched = vec![dependent];
                if let Some(holder) = self.table.find_mut(dependent) {
                    debug_assert!(holder.direct_count > 0, "{dependent} notified without a count");
                    holder.direct_count = holder.direct_count.saturating_sub(1);
                }
                touched.extend(adjust_descendants(&mut self.table, dependent, -1));
                for target in touched {
                    let Some(holder) = self.table.find_mut(target) else {
                        continue;
                    };
                    if holder.value.is_none() {
                        if holder.total_dependencies() == 0 {
                            holder.marked_for_completion = true;
                        }
                        continue;
                    }
                    let completion = self.complete_object(target)?;
                    if completion.newly_stable || self.releases_dependents(target) {
                        queue.push_back(target);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run surrogate or self-describing reconstruction for `id`, consuming
    /// its fixups into the state bag.  Returns the number consumed.
    pub(crate) fn finalize_special(&mut self, id: ObjectId) -> Result<usize, FixupError> {
        let (mut value, mut state, records, has_surrogate, identity_preserving) = {
            let holder = self.table.find(id).ok_or(FixupError::ObjectNeverSeen(id))?;
            let value = holder.value.clone().ok_or(FixupError::MissingObject(id))?;
            let state = holder.state.clone().ok_or(FixupError::MissingStateInfo(id))?;
            let records: Vec<(usize, FixupRecord)> = holder
                .unapplied()
                .map(|(index, r)| (index, r.clone()))
                .collect();
            (
                value,
                state,
                records,
                holder.has(HolderFlags::HAS_SURROGATE),
                holder.identity_preserving,
            )
        };
        for (_, record) in &records {
            let name = match &record.target {
                FixupTarget::DelayedNamed(name) | FixupTarget::Member(name) => name,
                FixupTarget::ArrayElement(_) => {
                    return Err(FixupError::InvalidFixupType {
                        id,
                        reason: "array fixup on a custom-reconstruction holder".into(),
                    });
                }
            };
            let required = self
                .table
                .find_mut(record.required)
                .filter(|h| h.is_stable())
                .ok_or(FixupError::ObjectNotSupplied(record.required))?;
            if required.is_unplaced_struct() {
                required.handed_out = true;
            }
            let copied = required
                .value
                .clone()
                .ok_or(FixupError::ObjectNotSupplied(record.required))?;
            state.update(name, copied);
        }

        let type_name = value
            .type_name(&self.heap)
            .map(str::to_string)
            .ok_or_else(|| FixupError::TargetMismatch {
                id,
                reason: format!("{value} has no runtime type"),
            })?;
        let surrogate_name = if has_surrogate {
            let surrogate = self.catalog.surrogate_for(&type_name).ok_or_else(|| {
                FixupError::FinalizeFailed {
                    id,
                    reason: format!("no surrogate registered for {type_name}"),
                }
            })?;
            let produced = surrogate
                .finalize(&value, &state, &mut self.heap)
                .map_err(|reason| FixupError::FinalizeFailed { id, reason })?;
            if let Some(produced) = produced
                && produced != value
            {
                if identity_preserving {
                    return Err(FixupError::SurrogateIdentityChanged {
                        id,
                        surrogate: surrogate.name().to_string(),
                    });
                }
                value = produced;
            }
            Some(surrogate.name().to_string())
        } else {
            let constructor = self.catalog.constructor_for(&type_name).ok_or_else(|| {
                FixupError::ConstructorNotFound {
                    type_name: type_name.clone(),
                }
            })?;
            constructor
                .construct(&mut value, &state, &mut self.heap)
                .map_err(|reason| FixupError::FinalizeFailed { id, reason })?;
            None
        };

        let becomes_indirection = value
            .type_name(&self.heap)
            .is_some_and(|ty| self.catalog.resolver_for(ty).is_some());
        let consumed = records.len();
        {
            let holder = self.table.find_or_create(id);
            for (index, _) in &records {
                holder.pending[*index].applied = true;
            }
            holder.value = Some(value.clone());
            holder.state = Some(state);
            holder.flags.insert(HolderFlags::STATE_INFO_FIXED);
            if becomes_indirection {
                holder.flags.insert(HolderFlags::INCOMPLETE_REFERENCE);
            }
        }
        debug_assert!(
            self.fixup_count >= consumed as u64,
            "{id} consumed more fixups than were counted"
        );
        self.fixup_count = self.fixup_count.saturating_sub(consumed as u64);
        if becomes_indirection {
            self.add_special(id);
        }
        self.replace_placed_value(id, value)?;
        self.emit(
            COMPONENT_COMPLETION,
            FixupEventKind::FinalizeSpecial,
            Some(id),
            EventOutcome::Ok,
            None,
            match surrogate_name {
                Some(name) => format!("surrogate {name} consumed {consumed} fixups"),
                None => format!("constructor for {type_name} consumed {consumed} fixups"),
            },
        );
        Ok(consumed)
    }

    /// A value type that already sits in its container was replaced; copy
    /// the new value to the live location.
    fn replace_placed_value(&mut self, id: ObjectId, value: Value) -> Result<(), FixupError> {
        let placed = self
            .table
            .find(id)
            .is_some_and(|h| h.requires_value_fixup() && is_placed(&self.table, &self.heap, h));
        if !placed {
            return Ok(());
        }
        match ValueFixupChain::resolve(&self.table, &self.heap, id)? {
            ChainResolution::Ready(chain) => {
                chain.write(&mut self.table, &mut self.heap, &[], value)?;
                self.emit(
                    COMPONENT_VALUE_FIXUP,
                    FixupEventKind::ValueTypeWrite,
                    Some(id),
                    EventOutcome::Ok,
                    None,
                    "re-placed rebuilt value".into(),
                );
                Ok(())
            }
            ChainResolution::Deferred { .. } => Err(FixupError::ValueTypeFixupUnresolvable(id)),
        }
    }

    /// Follow the indirection chain of `id` to its real object.
    ///
    /// Returns false (value untouched) when a resolver lacks data; the holder
    /// is retried on the next sweep.
    pub(crate) fn resolve_reference(&mut self, id: ObjectId) -> Result<bool, FixupError> {
        let original = self
            .table
            .find(id)
            .and_then(|h| h.value.clone())
            .ok_or(FixupError::MissingObject(id))?;
        let limit = self.config.max_reference_depth;
        let mut current = original;
        let mut hops = 0u32;
        loop {
            let Some(type_name) = current.type_name(&self.heap).map(str::to_string) else {
                break;
            };
            let Some(resolver) = self.catalog.resolver_for(&type_name) else {
                break;
            };
            hops += 1;
            if hops > limit {
                let err = FixupError::TooManyReferences { id, limit };
                self.emit(
                    COMPONENT_COMPLETION,
                    FixupEventKind::ResolveReference,
                    Some(id),
                    EventOutcome::Failed,
                    Some(&err),
                    format!("gave up at {type_name}"),
                );
                return Err(err);
            }
            match resolver.real_object(&current, &mut self.heap) {
                Ok(Some(next)) if next == current => break,
                Ok(Some(next)) => current = next,
                Ok(None) | Err(ReferenceError::MissingData) => {
                    self.emit(
                        COMPONENT_COMPLETION,
                        FixupEventKind::ResolveReference,
                        Some(id),
                        EventOutcome::Deferred,
                        None,
                        format!("{type_name} lacks data after {hops} hops"),
                    );
                    return Ok(false);
                }
                Err(ReferenceError::Failed(reason)) => {
                    return Err(FixupError::ResolutionFailed { id, reason });
                }
            }
        }
        if let Some(holder) = self.table.find_mut(id) {
            holder.value = Some(current.clone());
            holder.flags.remove(HolderFlags::INCOMPLETE_REFERENCE);
        }
        self.replace_placed_value(id, current)?;
        self.emit(
            COMPONENT_COMPLETION,
            FixupEventKind::ResolveReference,
            Some(id),
            EventOutcome::Ok,
            None,
            format!("resolved after {hops} hops"),
        );
        Ok(true)
    }

    // -- lifecycle ----------------------------------------------------------------

    /// Invoke the `phase` hooks for `value`'s runtime type, base types first.
    pub fn notify_lifecycle_hook(
        &mut self,
        phase: LifecyclePhase,
        value: &Value,
    ) -> Result<Vec<String>, FixupError> {
        let ran = invoke_hooks(
            &mut self.hook_cache,
            &self.catalog,
            phase,
            value,
            &mut self.heap,
        )?;
        if !ran.is_empty() {
            self.emit(
                COMPONENT_LIFECYCLE,
                FixupEventKind::HookInvoked,
                None,
                EventOutcome::Ok,
                None,
                format!("{phase}: {}", ran.join(", ")),
            );
        }
        Ok(ran)
    }

    pub(crate) fn run_hooks(
        &mut self,
        phase: LifecyclePhase,
        id: ObjectId,
    ) -> Result<(), FixupError> {
        let Some(value) = self.table.find(id).and_then(|h| h.value.clone()) else {
            return Ok(());
        };
        self.notify_lifecycle_hook(phase, &value).map(|_| ())
    }

    // -- diagnostics ----------------------------------------------------------------

    /// Verify counter bookkeeping.  Intended for tests and debug assertions.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let unapplied: u64 = self.table.iter().map(|h| h.unapplied_count() as u64).sum();
        if unapplied != self.fixup_count {
            return Err(InvariantViolation {
                object_id: None,
                detail: format!(
                    "global counter {} but {unapplied} fixups unapplied",
                    self.fixup_count
                ),
            });
        }
        for holder in self.table.iter() {
            let awaiting = holder
                .unapplied()
                .filter(|(_, r)| !self.is_stable(r.required))
                .count();
            let awaiting = u32::try_from(awaiting).unwrap_or(u32::MAX);
            if holder.direct_count != awaiting {
                return Err(InvariantViolation {
                    object_id: Some(holder.id),
                    detail: format!(
                        "direct count {} but {awaiting} fixups await unstable objects",
                        holder.direct_count
                    ),
                });
            }
            let nested: u32 = self
                .table
                .iter()
                .filter(|child| child.requires_value_fixup())
                .filter(|child| {
                    child
                        .value_fixup
                        .as_ref()
                        .is_some_and(|info| info.container == holder.id)
                })
                .map(ObjectHolder::total_dependencies)
                .sum();
            if holder.descendant_count != nested {
                return Err(InvariantViolation {
                    object_id: Some(holder.id),
                    detail: format!(
                        "descendant count {} but nested value types await {nested}",
                        holder.descendant_count
                    ),
                });
            }
            if holder.is_stable() && !holder.dependents.is_empty() {
                return Err(InvariantViolation {
                    object_id: Some(holder.id),
                    detail: "stable holder still lists dependents".into(),
                });
            }
            if holder.pending.iter().any(|r| r.applied && !self.is_stable(r.required)) {
                return Err(InvariantViolation {
                    object_id: Some(holder.id),
                    detail: "fixup applied from an unstable object".into(),
                });
            }
        }
        Ok(())
    }
}

fn validate_target(target: &FixupTarget) -> Result<(), FixupError> {
    let (parameter, empty) = match target {
        FixupTarget::Member(name) => ("member", name.is_empty()),
        FixupTarget::DelayedNamed(name) => ("member_name", name.is_empty()),
        FixupTarget::ArrayElement(indices) => ("indices", indices.is_empty()),
    };
    if empty {
        return Err(FixupError::InvalidArgument {
            parameter: parameter.into(),
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

/// Delayed fixups belong to custom-reconstruction holders, member and array
/// fixups to everything else.
fn check_fixup_kind(
    id: ObjectId,
    kind: HolderKind,
    target: &FixupTarget,
) -> Result<(), FixupError> {
    if target.is_delayed() != kind.accepts_delayed_fixups() {
        return Err(FixupError::InvalidFixupType {
            id,
            reason: format!("{target} on a {kind} holder"),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::{PathStep, StructValue};

    fn manager() -> ObjectManager {
        ObjectManager::new(ManagerConfig::deterministic(), TypeCatalog::new()).expect("config")
    }

    fn node(m: &mut ObjectManager) -> ObjectHandle {
        m.heap_mut().alloc_instance("Node", ["next", "prev", "value"])
    }

    #[test]
    fn rejects_invalid_config() {
        let config = ManagerConfig {
            initial_table_size: 3,
            ..ManagerConfig::default()
        };
        assert!(ObjectManager::new(config, TypeCatalog::new()).is_err());
    }

    #[test]
    fn fixup_applies_immediately_when_both_ends_exist() {
        let mut m = manager();
        let a = node(&mut m);
        let b = node(&mut m);
        m.register_value(1, Value::Ref(a), RegisterOptions::default()).unwrap();
        m.register_value(2, Value::Ref(b), RegisterOptions::default()).unwrap();
        m.record_member_fixup(1, "next", 2).unwrap();
        assert_eq!(m.heap().member(a, "next").unwrap(), &Value::Ref(b));
        assert_eq!(m.fixup_count(), 0);
        m.check_invariants().unwrap();
    }

    #[test]
    fn forward_reference_waits_for_registration() {
        let mut m = manager();
        let a = node(&mut m);
        let b = node(&mut m);
        m.register_value(1, Value::Ref(a), RegisterOptions::default()).unwrap();
        m.record_member_fixup(1, "next", 2).unwrap();
        assert_eq!(m.fixup_count(), 1);
        let summary = m.holder_summary(1).unwrap();
        assert_eq!(summary.direct_count, 1);
        assert!(!m.holder_summary(2).unwrap().registered);
        m.check_invariants().unwrap();

        m.register_value(2, Value::Ref(b), RegisterOptions::default()).unwrap();
        assert_eq!(m.heap().member(a, "next").unwrap(), &Value::Ref(b));
        assert_eq!(m.holder_summary(1).unwrap().direct_count, 0);
        m.check_invariants().unwrap();
    }

    #[test]
    fn fixups_before_any_registration_complete_on_target_registration() {
        let mut m = manager();
        let a = node(&mut m);
        let b = node(&mut m);
        m.record_member_fixup(1, "next", 2).unwrap();
        m.register_value(2, Value::Ref(b), RegisterOptions::default()).unwrap();
        // 1 is a stub whose only dependency is now satisfied.
        assert!(m.holder_summary(1).unwrap().marked_for_completion);
        m.register_value(1, Value::Ref(a), RegisterOptions::default()).unwrap();
        assert_eq!(m.heap().member(a, "next").unwrap(), &Value::Ref(b));
        assert!(!m.holder_summary(1).unwrap().marked_for_completion);
        m.check_invariants().unwrap();
    }

    #[test]
    fn duplicate_registration_closes_the_pass() {
        let mut m = manager();
        let a = node(&mut m);
        m.register_value(1, Value::Ref(a), RegisterOptions::default()).unwrap();
        let err = m
            .register_value(1, Value::Ref(a), RegisterOptions::default())
            .unwrap_err();
        assert_eq!(err, FixupError::DuplicateRegistration(ObjectId::new(1).unwrap()));
        assert_eq!(m.phase(), PassPhase::Closed);
        assert_eq!(
            m.record_member_fixup(1, "next", 1),
            Err(FixupError::PassClosed)
        );
    }

    #[test]
    fn invalid_ids_and_arguments() {
        let mut m = manager();
        assert!(matches!(
            m.register_value(0, Value::Int(1), RegisterOptions::default()),
            Err(FixupError::InvalidArgument { .. })
        ));
        let mut m = manager();
        assert!(matches!(
            m.register_value(1, Value::Null, RegisterOptions::default()),
            Err(FixupError::InvalidArgument { .. })
        ));
        let mut m = manager();
        assert!(matches!(
            m.record_member_fixup(1, "", 2),
            Err(FixupError::InvalidArgument { .. })
        ));
        let mut m = manager();
        assert!(matches!(
            m.record_array_fixup_at(1, &[], 2),
            Err(FixupError::InvalidArgument { .. })
        ));
        let mut m = manager();
        match m.record_member_fixup(1, "f", -3) {
            Err(FixupError::InvalidArgument { parameter, .. }) => {
                assert_eq!(parameter, "object_required");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn delayed_fixup_on_plain_holder_is_invalid() {
        let mut m = manager();
        let a = node(&mut m);
        m.register_value(1, Value::Ref(a), RegisterOptions::default()).unwrap();
        assert!(matches!(
            m.record_delayed_fixup(1, "next", 2),
            Err(FixupError::InvalidFixupType { .. })
        ));
    }

    #[test]
    fn mixing_delayed_and_member_on_stub_is_invalid() {
        let mut m = manager();
        m.record_delayed_fixup(5, "a", 2).unwrap();
        assert!(matches!(
            m.record_member_fixup(5, "b", 3),
            Err(FixupError::InvalidFixupType { .. })
        ));
    }

    #[test]
    fn stub_with_delayed_fixups_cannot_become_plain() {
        let mut m = manager();
        let a = node(&mut m);
        m.record_delayed_fixup(1, "next", 2).unwrap();
        assert!(matches!(
            m.register_value(1, Value::Ref(a), RegisterOptions::default()),
            Err(FixupError::InvalidFixupType { .. })
        ));
    }

    #[test]
    fn get_object_hides_unregistered() {
        let mut m = manager();
        m.record_member_fixup(1, "next", 2).unwrap();
        assert_eq!(m.get_object(2).unwrap(), None);
        assert!(m.get_object(-1).is_err());
        m.register_value(2, Value::Int(9), RegisterOptions::default()).unwrap();
        assert_eq!(m.get_object(2).unwrap(), Some(&Value::Int(9)));
    }

    #[test]
    fn struct_registration_propagates_outstanding_counts() {
        let mut m = manager();
        let o = m.heap_mut().alloc_instance("Shape", ["origin"]);
        m.register_value(1, Value::Ref(o), RegisterOptions::default()).unwrap();
        m.record_member_fixup(1, "origin", 2).unwrap();
        // 2.tag awaits 3 before 2 is registered.
        m.record_member_fixup(2, "tag", 3).unwrap();
        let point = StructValue::new("Point").with_field("tag", Value::Null);
        m.register_value(
            2,
            Value::Struct(point),
            RegisterOptions::in_member(1, "origin"),
        )
        .unwrap();
        assert_eq!(m.holder_summary(1).unwrap().descendant_count, 1);
        m.check_invariants().unwrap();
        // The struct was copied into 1.origin before its own fixup ran.
        assert!(m.holder_summary(2).unwrap().flags.contains(HolderFlags::VALUE_FIXUP_PERFORMED));

        m.register_value(3, Value::from("t"), RegisterOptions::default()).unwrap();
        let live = m
            .heap()
            .read_path(o, &[PathStep::Field("origin".into()), PathStep::Field("tag".into())])
            .unwrap();
        assert_eq!(live, &Value::from("t"));
        assert_eq!(m.holder_summary(1).unwrap().descendant_count, 0);
        m.check_invariants().unwrap();
    }

    #[test]
    fn events_trace_registration_and_application() {
        let mut m = manager();
        let a = node(&mut m);
        m.record_member_fixup(1, "value", 2).unwrap();
        m.register_value(1, Value::Ref(a), RegisterOptions::default()).unwrap();
        m.register_value(2, Value::Int(4), RegisterOptions::default()).unwrap();
        let kinds: Vec<FixupEventKind> = m.events().events().iter().map(|e| e.event).collect();
        assert_eq!(kinds[0], FixupEventKind::RecordFixup);
        assert!(kinds.contains(&FixupEventKind::ApplyFixup));
        assert_eq!(m.events().events()[0].outcome, EventOutcome::Deferred);
        assert!(m.events().events().iter().all(|e| e.trace_id == "deterministic"));
    }
}
