//! Structured events emitted while a graph is rebuilt.
//!
//! There is no global logger: the manager appends one [`FixupEvent`] per
//! significant step to its [`EventLog`].  The log exports as JSON lines and
//! hashes to a stable digest, so two replays of the same operation stream
//! can be compared byte for byte.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::object_id::ObjectId;

// ---------------------------------------------------------------------------
// FixupEventKind / EventOutcome
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FixupEventKind {
    Register,
    RecordFixup,
    ApplyFixup,
    CompleteObject,
    ResolveReference,
    FinalizeSpecial,
    ValueTypeWrite,
    CompletionPass,
    HookInvoked,
}

impl fmt::Display for FixupEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Register => "register",
            Self::RecordFixup => "record_fixup",
            Self::ApplyFixup => "apply_fixup",
            Self::CompleteObject => "complete_object",
            Self::ResolveReference => "resolve_reference",
            Self::FinalizeSpecial => "finalize_special",
            Self::ValueTypeWrite => "value_type_write",
            Self::CompletionPass => "completion_pass",
            Self::HookInvoked => "hook_invoked",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOutcome {
    Ok,
    /// Step could not run yet and will be retried.
    Deferred,
    Failed,
}

// ---------------------------------------------------------------------------
// FixupEvent
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixupEvent {
    /// Monotonic sequence number within one manager.
    pub sequence: u64,
    pub trace_id: String,
    /// Subsystem that emitted the event (`registry`, `completion`, ...).
    pub component: String,
    pub event: FixupEventKind,
    pub object_id: Option<ObjectId>,
    pub outcome: EventOutcome,
    pub error_code: Option<String>,
    pub detail: String,
}

// ---------------------------------------------------------------------------
// EventLog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventLog {
    trace_id: String,
    enabled: bool,
    next_sequence: u64,
    events: Vec<FixupEvent>,
}

/// Borrowed description of an event about to be appended.
pub(crate) struct EventDraft<'a> {
    pub component: &'a str,
    pub event: FixupEventKind,
    pub object_id: Option<ObjectId>,
    pub outcome: EventOutcome,
    pub error_code: Option<&'a str>,
    pub detail: String,
}

impl EventLog {
    pub fn new(trace_id: impl Into<String>, enabled: bool) -> Self {
        Self {
            trace_id: trace_id.into(),
            enabled,
            next_sequence: 0,
            events: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, draft: EventDraft<'_>) {
        if !self.enabled {
            return;
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.events.push(FixupEvent {
            sequence,
            trace_id: self.trace_id.clone(),
            component: draft.component.to_string(),
            event: draft.event,
            object_id: draft.object_id,
            outcome: draft.outcome,
            error_code: draft.error_code.map(str::to_string),
            detail: draft.detail,
        });
    }

    pub fn events(&self) -> &[FixupEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Events of one kind, in emission order.
    pub fn of_kind(&self, kind: FixupEventKind) -> impl Iterator<Item = &FixupEvent> {
        self.events.iter().filter(move |e| e.event == kind)
    }

    pub fn to_jsonl(&self) -> String {
        let mut out = String::new();
        for event in &self.events {
            // FixupEvent holds only strings, integers and unit enums.
            if let Ok(line) = serde_json::to_string(event) {
                out.push_str(&line);
                out.push('\n');
            }
        }
        out
    }

    /// `sha256:<hex>` over the JSONL export.
    pub fn digest(&self) -> String {
        let digest = Sha256::digest(self.to_jsonl().as_bytes());
        format!("sha256:{}", hex::encode(digest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft(kind: FixupEventKind, outcome: EventOutcome) -> EventDraft<'static> {
        EventDraft {
            component: "registry",
            event: kind,
            object_id: ObjectId::new(1),
            outcome,
            error_code: None,
            detail: "d".to_string(),
        }
    }

    #[test]
    fn sequence_is_monotonic() {
        let mut log = EventLog::new("t", true);
        log.push(draft(FixupEventKind::Register, EventOutcome::Ok));
        log.push(draft(FixupEventKind::ApplyFixup, EventOutcome::Deferred));
        let seqs: Vec<u64> = log.events().iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![0, 1]);
        assert_eq!(log.events()[1].trace_id, "t");
        assert_eq!(log.of_kind(FixupEventKind::ApplyFixup).count(), 1);
    }

    #[test]
    fn disabled_log_records_nothing() {
        let mut log = EventLog::new("t", false);
        log.push(draft(FixupEventKind::Register, EventOutcome::Ok));
        assert!(log.is_empty());
        assert_eq!(log.to_jsonl(), "");
    }

    #[test]
    fn jsonl_has_one_line_per_event() {
        let mut log = EventLog::new("t", true);
        log.push(draft(FixupEventKind::Register, EventOutcome::Ok));
        log.push(draft(FixupEventKind::CompletionPass, EventOutcome::Failed));
        let jsonl = log.to_jsonl();
        assert_eq!(jsonl.lines().count(), 2);
        let first: FixupEvent = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first.event, FixupEventKind::Register);
    }

    #[test]
    fn digest_is_stable_and_content_sensitive() {
        let mut a = EventLog::new("t", true);
        let mut b = EventLog::new("t", true);
        a.push(draft(FixupEventKind::Register, EventOutcome::Ok));
        b.push(draft(FixupEventKind::Register, EventOutcome::Ok));
        assert_eq!(a.digest(), b.digest());
        assert!(a.digest().starts_with("sha256:"));
        b.push(draft(FixupEventKind::Register, EventOutcome::Ok));
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn kind_display() {
        assert_eq!(FixupEventKind::ValueTypeWrite.to_string(), "value_type_write");
    }
}
