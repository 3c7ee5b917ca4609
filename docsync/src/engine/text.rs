//! Step-based transform engine for plain text.
//!
//! A [`TextStep`] replaces the characters in `[from, to)` with `insert`.
//! Positions count Unicode scalar values, not bytes.
//!
//! Merging follows the usual collaborative-editing rebase: the confirmed
//! document only ever moves forward through committed steps, and pending
//! local steps are transformed past the remote ones and reapplied on top.
//!
//! ```text
//!   confirmed ──R──► confirmed'
//!       │                │
//!       L                L'        L' = L transformed past R
//!       ▼                ▼         R' = R transformed past L (selection mapping)
//!      doc  ───R'──►   doc'
//! ```
//!
//! Steps are split into pure deletions and pure insertions before
//! transforming, so every pair transform yields at most one step per side.
//! An insertion that lands strictly inside a concurrently deleted range is
//! swallowed by that deletion.

use serde::{Deserialize, Serialize};

use super::{Merge, TransformEngine};
use crate::error::EngineError;
use crate::protocol::{ClientId, Selection};

/// Replace `[from, to)` with `insert`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextStep {
    pub from: usize,
    pub to: usize,
    pub insert: String,
}

impl TextStep {
    pub fn insert(at: usize, text: impl Into<String>) -> Self {
        Self { from: at, to: at, insert: text.into() }
    }

    pub fn delete(from: usize, to: usize) -> Self {
        Self { from, to, insert: String::new() }
    }

    pub fn replace(from: usize, to: usize, text: impl Into<String>) -> Self {
        Self { from, to, insert: text.into() }
    }

    fn inserted_len(&self) -> usize {
        self.insert.chars().count()
    }

    fn deleted_len(&self) -> usize {
        self.to - self.from
    }

    fn is_noop(&self) -> bool {
        self.from == self.to && self.insert.is_empty()
    }

    fn is_insertion(&self) -> bool {
        self.from == self.to
    }

    /// Map a position in the document before this step to the document
    /// after it. `assoc` picks a side when the position touches the
    /// replaced range: negative sticks left, positive sticks right.
    pub fn map_pos(&self, pos: usize, assoc: i8) -> usize {
        if pos < self.from {
            return pos;
        }
        if pos > self.to {
            return pos - self.deleted_len() + self.inserted_len();
        }
        let side = if self.from == self.to {
            assoc
        } else if pos == self.from {
            -1
        } else if pos == self.to {
            1
        } else {
            assoc
        };
        if side < 0 {
            self.from
        } else {
            self.from + self.inserted_len()
        }
    }

    /// Apply to `doc`, checking bounds.
    pub fn apply(&self, doc: &str) -> Result<String, EngineError> {
        let len = doc.chars().count();
        if self.from > self.to || self.to > len {
            return Err(EngineError::InvalidStep(format!(
                "replace {}..{} outside document of length {len}",
                self.from, self.to
            )));
        }
        let start = byte_offset(doc, self.from);
        let end = byte_offset(doc, self.to);
        let mut out = String::with_capacity(doc.len() - (end - start) + self.insert.len());
        out.push_str(&doc[..start]);
        out.push_str(&self.insert);
        out.push_str(&doc[end..]);
        Ok(out)
    }

    /// Split into a pure deletion followed by a pure insertion.
    fn split(self) -> impl Iterator<Item = TextStep> {
        let deletion = (self.to > self.from).then(|| TextStep::delete(self.from, self.to));
        let insertion =
            (!self.insert.is_empty()).then(|| TextStep::insert(self.from, self.insert));
        deletion.into_iter().chain(insertion)
    }

    fn shifted(mut self, delta: isize) -> Self {
        self.from = self.from.saturating_add_signed(delta);
        self.to = self.to.saturating_add_signed(delta);
        self
    }
}

fn byte_offset(doc: &str, pos: usize) -> usize {
    doc.char_indices().nth(pos).map(|(i, _)| i).unwrap_or(doc.len())
}

fn apply_all(doc: &str, steps: &[TextStep]) -> Result<String, EngineError> {
    steps.iter().try_fold(doc.to_string(), |doc, step| step.apply(&doc))
}

/// Transform an insertion against a concurrent deletion.
/// Returns `(insertion after deletion, deletion after insertion)`.
fn insertion_vs_deletion(ins: TextStep, del: TextStep) -> (Option<TextStep>, Option<TextStep>) {
    let n = ins.inserted_len();
    if ins.from <= del.from {
        (Some(ins), Some(del.shifted(n as isize)))
    } else if ins.from >= del.to {
        let removed = del.deleted_len() as isize;
        (Some(ins.shifted(-removed)), Some(del))
    } else {
        let swallowed = TextStep::delete(del.from, del.to + n);
        (None, Some(swallowed))
    }
}

/// Shrink deletion `a` to the part `b` did not already delete.
fn deletion_past_deletion(a: &TextStep, b: &TextStep) -> Option<TextStep> {
    let map = |pos: usize| {
        if pos <= b.from {
            pos
        } else if pos >= b.to {
            pos - b.deleted_len()
        } else {
            b.from
        }
    };
    let step = TextStep::delete(map(a.from), map(a.to));
    (!step.is_noop()).then_some(step)
}

/// Transform one local and one remote primitive step against each other.
/// Concurrent insertions at the same position place the remote text first.
fn transform_pair(local: TextStep, remote: TextStep) -> (Option<TextStep>, Option<TextStep>) {
    match (local.is_insertion(), remote.is_insertion()) {
        (true, true) => {
            if local.from < remote.from {
                let n = local.inserted_len() as isize;
                (Some(local), Some(remote.shifted(n)))
            } else {
                let n = remote.inserted_len() as isize;
                (Some(local.shifted(n)), Some(remote))
            }
        }
        (true, false) => insertion_vs_deletion(local, remote),
        (false, true) => {
            let (remote, local) = insertion_vs_deletion(remote, local);
            (local, remote)
        }
        (false, false) => (
            deletion_past_deletion(&local, &remote),
            deletion_past_deletion(&remote, &local),
        ),
    }
}

/// Transform two step sequences based on the same document.
/// Returns `(local past remote, remote past local)`.
fn transform_sequences(
    local: Vec<TextStep>,
    remote: Vec<TextStep>,
) -> (Vec<TextStep>, Vec<TextStep>) {
    let mut remote: Vec<TextStep> = remote.into_iter().flat_map(TextStep::split).collect();
    let mut rebased = Vec::new();

    for step in local.into_iter().flat_map(TextStep::split) {
        let mut current = Some(step);
        let mut next_remote = Vec::with_capacity(remote.len());
        for r in remote {
            match current.take() {
                Some(l) => {
                    let (l, r) = transform_pair(l, r);
                    current = l;
                    next_remote.extend(r);
                }
                None => next_remote.push(r),
            }
        }
        remote = next_remote;
        rebased.extend(current);
    }

    (rebased, remote)
}

/// Editor state for [`TextEngine`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TextState {
    /// Text after every merged committed step
    confirmed: String,
    /// `confirmed` with `unconfirmed` applied
    doc: String,
    unconfirmed: Vec<TextStep>,
    selection: Selection,
}

impl TextState {
    pub fn text(&self) -> &str {
        &self.doc
    }

    pub fn confirmed_text(&self) -> &str {
        &self.confirmed
    }

    pub fn unconfirmed(&self) -> &[TextStep] {
        &self.unconfirmed
    }

    pub fn selection(&self) -> Selection {
        self.selection
    }

    pub fn len(&self) -> usize {
        self.doc.chars().count()
    }

    pub fn is_empty(&self) -> bool {
        self.doc.is_empty()
    }
}

/// Plain-text [`TransformEngine`].
#[derive(Debug, Clone)]
pub struct TextEngine {
    client_id: ClientId,
}

impl TextEngine {
    pub fn new(client_id: ClientId) -> Self {
        Self { client_id }
    }
}

impl TransformEngine for TextEngine {
    type State = TextState;
    type Operation = TextStep;

    fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    fn empty_state(&self) -> TextState {
        TextState::default()
    }

    fn restore(&self, snapshot: &[u8]) -> Result<TextState, EngineError> {
        let text = String::from_utf8(snapshot.to_vec())
            .map_err(|e| EngineError::Codec(e.to_string()))?;
        Ok(TextState {
            confirmed: text.clone(),
            doc: text,
            unconfirmed: Vec::new(),
            selection: Selection::default(),
        })
    }

    fn snapshot(&self, state: &TextState) -> Vec<u8> {
        state.doc.as_bytes().to_vec()
    }

    fn encode_operation(&self, op: &TextStep) -> Result<Vec<u8>, EngineError> {
        bincode::serde::encode_to_vec(op, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))
    }

    fn decode_operation(&self, bytes: &[u8]) -> Result<TextStep, EngineError> {
        let (step, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| EngineError::Codec(e.to_string()))?;
        Ok(step)
    }

    fn apply_local(
        &self,
        state: &TextState,
        ops: &[TextStep],
        selection: Option<Selection>,
    ) -> Result<TextState, EngineError> {
        let ops: Vec<TextStep> = ops.iter().filter(|s| !s.is_noop()).cloned().collect();
        let doc = apply_all(&state.doc, &ops)?;
        let selection = selection.unwrap_or_else(|| self.map_selection(state.selection, &ops));
        let mut unconfirmed = state.unconfirmed.clone();
        unconfirmed.extend(ops);
        Ok(TextState {
            confirmed: state.confirmed.clone(),
            doc,
            unconfirmed,
            selection,
        })
    }

    fn apply_remote(
        &self,
        state: &TextState,
        ops: &[TextStep],
        origins: &[ClientId],
    ) -> Result<Merge<TextState, TextStep>, EngineError> {
        let own = origins
            .iter()
            .take_while(|origin| **origin == self.client_id)
            .count()
            .min(ops.len())
            .min(state.unconfirmed.len());

        let confirmed = apply_all(&state.confirmed, &ops[..own])?;
        let remote = &ops[own..];
        let pending = state.unconfirmed[own..].to_vec();

        if remote.is_empty() {
            return Ok(Merge {
                state: TextState {
                    confirmed,
                    doc: state.doc.clone(),
                    unconfirmed: pending,
                    selection: state.selection,
                },
                mapping: Vec::new(),
            });
        }

        let confirmed = apply_all(&confirmed, remote)?;
        let (rebased, mapping) = transform_sequences(pending, remote.to_vec());
        let doc = apply_all(&confirmed, &rebased)?;
        let selection = self.map_selection(state.selection, &mapping);

        Ok(Merge {
            state: TextState { confirmed, doc, unconfirmed: rebased, selection },
            mapping,
        })
    }

    fn compute_sendable(&self, state: &TextState) -> Option<Vec<TextStep>> {
        (!state.unconfirmed.is_empty()).then(|| state.unconfirmed.clone())
    }

    fn map_selection(&self, selection: Selection, ops: &[TextStep]) -> Selection {
        ops.iter().fold(selection, |sel, step| {
            Selection::new(step.map_pos(sel.anchor, 1), step.map_pos(sel.head, 1))
        })
    }

    fn selection(&self, state: &TextState) -> Selection {
        state.selection
    }

    fn max_position(&self, state: &TextState) -> usize {
        state.len()
    }
}
