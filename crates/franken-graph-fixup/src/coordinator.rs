//! Completion pass.
//!
//! Runs once, after the reader has delivered every registration and fixup:
//!
//! 1. mark the objects reachable from the root,
//! 2. drive custom-reconstruction and indirection holders to a fixed point,
//! 3. sweep remaining fixups until nothing more can be applied,
//! 4. diagnose whatever is left,
//! 5. validate the root and reachable type loads,
//! 6. run the deferred `Deserialized` hooks.
//!
//! Any failure closes the manager; a pass is never retried.

use std::collections::BTreeSet;

use crate::error::FixupError;
use crate::event::{EventOutcome, FixupEventKind};
use crate::holder::{HolderFlags, ObjectHolder};
use crate::lifecycle::LifecyclePhase;
use crate::manager::{ObjectManager, PassPhase};
use crate::object_id::ObjectId;
use crate::value::Value;

const COMPONENT: &str = "coordinator";

/// Counts describing a finished pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PassStats {
    special_rounds: u64,
    sweeps: u64,
    applied: usize,
}

impl ObjectManager {
    /// Finish the graph and return the root value.
    ///
    /// With no root set and nothing registered the result is `Value::Null`.
    pub fn run_completion(&mut self) -> Result<Value, FixupError> {
        self.ensure_open()?;
        self.phase = PassPhase::Completing;
        let result = self.completion_pass();
        self.phase = PassPhase::Closed;
        match &result {
            Ok((_, stats)) => self.emit(
                COMPONENT,
                FixupEventKind::CompletionPass,
                self.root_id(),
                EventOutcome::Ok,
                None,
                format!(
                    "{} special rounds, {} sweeps, {} late fixups",
                    stats.special_rounds, stats.sweeps, stats.applied
                ),
            ),
            Err(err) => self.emit(
                COMPONENT,
                FixupEventKind::CompletionPass,
                self.root_id(),
                EventOutcome::Failed,
                Some(err),
                err.to_string(),
            ),
        }
        result.map(|(value, _)| value)
    }

    fn completion_pass(&mut self) -> Result<(Value, PassStats), FixupError> {
        let mut stats = PassStats::default();
        self.mark_reachable_from_root();
        self.drain_special(&mut stats)?;
        self.sweep(&mut stats)?;
        if self.fixup_count > 0 {
            return Err(self.diagnose());
        }
        let root = self.root_value()?;
        self.check_type_loads()?;
        for id in std::mem::take(&mut self.deferred_hooks) {
            self.run_hooks(LifecyclePhase::Deserialized, id)?;
        }
        Ok((root, stats))
    }

    /// Special rounds and fixup sweeps draw on one budget.
    fn charge_sweep(&self, stats: &PassStats) -> Result<(), FixupError> {
        let used = stats.special_rounds + stats.sweeps;
        match self.config.max_completion_sweeps {
            Some(max) if used > max => Err(FixupError::CompletionBudgetExhausted { sweeps: max }),
            _ => Ok(()),
        }
    }

    // -- reachability -----------------------------------------------------------

    /// Objects the root needs, transitively through recorded fixups.
    pub(crate) fn mark_reachable_from_root(&mut self) {
        let Some(root) = self.root_id() else {
            return;
        };
        let mut seen = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            let holder = self.table.find_or_create(id);
            holder.reachable = true;
            stack.extend(holder.pending.iter().map(|r| r.required));
        }
    }

    // -- special holders ----------------------------------------------------------

    /// Finalize custom-reconstruction holders and resolve indirections until
    /// no more progress is made.
    fn drain_special(&mut self, stats: &mut PassStats) -> Result<(), FixupError> {
        loop {
            stats.special_rounds += 1;
            self.charge_sweep(stats)?;
            let mut progressed = false;
            for id in self.special.clone() {
                let Some(holder) = self.table.find(id) else {
                    continue;
                };
                if holder.value.is_none() || holder.total_dependencies() > 0 {
                    continue;
                }
                let state_pending = holder.flags.requires_state_fixup();
                let indirection = holder.has(HolderFlags::INCOMPLETE_REFERENCE);
                if state_pending {
                    let completion = self.complete_object(id)?;
                    if completion.applied > 0 || completion.newly_stable {
                        progressed = true;
                    }
                    if completion.newly_stable {
                        self.cascade(id)?;
                    }
                } else if !indirection {
                    stats.applied += self.complete_object(id)?.applied;
                }
                let still_indirect = self
                    .table
                    .find(id)
                    .is_some_and(|h| h.has(HolderFlags::INCOMPLETE_REFERENCE));
                if still_indirect && self.resolve_reference(id)? {
                    progressed = true;
                    stats.applied += self.complete_object(id)?.applied;
                    if self.is_stable(id) {
                        self.cascade(id)?;
                    }
                }
            }
            self.special.retain(|id| {
                self.table
                    .find(*id)
                    .is_some_and(ObjectHolder::requires_delayed_fixup)
            });
            if !progressed || self.special.is_empty() {
                return Ok(());
            }
        }
    }

    /// Apply remaining fixups until a sweep makes no progress.
    fn sweep(&mut self, stats: &mut PassStats) -> Result<(), FixupError> {
        while self.fixup_count > 0 {
            stats.sweeps += 1;
            self.charge_sweep(stats)?;
            let waiting: Vec<ObjectId> = self
                .table
                .iter()
                .filter(|h| h.value.is_some() && h.unapplied_count() > 0)
                .map(ObjectHolder::id)
                .collect();
            let mut applied = 0;
            for id in waiting {
                applied += self.complete_object(id)?.applied;
            }
            if applied == 0 {
                break;
            }
            stats.applied += applied;
        }
        Ok(())
    }

    // -- diagnosis ------------------------------------------------------------------

    /// Name the most specific cause of outstanding fixups.  Holders reachable
    /// from the root are blamed first.
    pub(crate) fn diagnose(&self) -> FixupError {
        let mut candidates: Vec<&ObjectHolder> = self
            .table
            .iter()
            .filter(|h| h.unapplied_count() > 0)
            .collect();
        candidates.sort_by_key(|h| !h.reachable);
        for holder in candidates {
            for (_, record) in holder.unapplied() {
                match self.table.find(record.required) {
                    Some(required) if required.is_stable() => {}
                    Some(required) if required.value.is_none() => {
                        return FixupError::ObjectNeverSeen(required.id);
                    }
                    None => return FixupError::ObjectNeverSeen(record.required),
                    Some(required) if required.has(HolderFlags::INCOMPLETE_REFERENCE) => {
                        return FixupError::IncompleteObjectReference(required.id);
                    }
                    Some(required) => return FixupError::ObjectNotSupplied(required.id),
                }
            }
            if holder.value.is_none() {
                return FixupError::ObjectNeverSeen(holder.id);
            }
            if holder.requires_value_fixup() {
                return FixupError::ValueTypeFixupUnresolvable(holder.id);
            }
            if holder.flags.requires_state_fixup() {
                return FixupError::ObjectNotSupplied(holder.id);
            }
        }
        FixupError::FixupCountMismatch {
            remaining: self.fixup_count,
        }
    }

    fn root_value(&self) -> Result<Value, FixupError> {
        let Some(root) = self.root_id() else {
            return Ok(Value::Null);
        };
        let holder = self.table.find(root).ok_or(FixupError::ObjectNeverSeen(root))?;
        let value = holder.value.clone().ok_or(FixupError::ObjectNeverSeen(root))?;
        if holder.has(HolderFlags::INCOMPLETE_REFERENCE) {
            return Err(FixupError::IncompleteObjectReference(root));
        }
        if holder.flags.requires_state_fixup() {
            return Err(FixupError::ObjectNotSupplied(root));
        }
        if let Value::TypeLoadFailure { type_name } = value {
            return Err(FixupError::TypeLoadFailure { type_name });
        }
        Ok(value)
    }

    /// Unreachable objects may carry failed type loads; reachable ones may not.
    fn check_type_loads(&self) -> Result<(), FixupError> {
        for holder in self.table.iter().filter(|h| h.reachable) {
            if let Some(Value::TypeLoadFailure { type_name }) = &holder.value {
                return Err(FixupError::TypeLoadFailure {
                    type_name: type_name.clone(),
                });
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
