//! Transform engine boundary.
//!
//! The sync client never interprets operations itself. It asks the engine
//! to apply local edits, merge remote ones (rebasing whatever is still
//! unconfirmed), list the operations that still need publishing, and map
//! selections through a change.
//!
//! [`text::TextEngine`] is a step-based engine for plain text.

pub mod text;

use std::fmt::Debug;

use crate::error::EngineError;
use crate::protocol::{ClientId, Selection};

/// Result of merging remote operations into a local state.
#[derive(Debug, Clone)]
pub struct Merge<S, O> {
    pub state: S,
    /// Operations that carry positions in the pre-merge state to the
    /// merged one. Empty when the visible document did not change.
    pub mapping: Vec<O>,
}

/// Document model and rebase algorithm used by a [`SyncClient`](crate::client::SyncClient).
///
/// States are immutable values: every method returns a new state.
pub trait TransformEngine: Send + Sync + 'static {
    type State: Clone + Send + Sync + 'static;
    type Operation: Clone + Debug + Send + Sync + 'static;

    /// Identity used to recognise this client's own operations on merge.
    fn client_id(&self) -> &ClientId;

    fn empty_state(&self) -> Self::State;

    /// Rebuild a state from a checkpoint snapshot.
    fn restore(&self, snapshot: &[u8]) -> Result<Self::State, EngineError>;

    /// Serialize the document of `state`, unconfirmed operations included.
    fn snapshot(&self, state: &Self::State) -> Vec<u8>;

    fn encode_operation(&self, op: &Self::Operation) -> Result<Vec<u8>, EngineError>;

    fn decode_operation(&self, bytes: &[u8]) -> Result<Self::Operation, EngineError>;

    /// Apply a local edit. The operations become unconfirmed until they
    /// are merged back with this client's own origin. `selection` replaces
    /// the state's selection; `None` maps the current one through `ops`.
    fn apply_local(
        &self,
        state: &Self::State,
        ops: &[Self::Operation],
        selection: Option<Selection>,
    ) -> Result<Self::State, EngineError>;

    /// Merge committed operations. `origins[i]` is the client that
    /// produced `ops[i]`; a leading run of this client's own id
    /// acknowledges that many unconfirmed operations.
    fn apply_remote(
        &self,
        state: &Self::State,
        ops: &[Self::Operation],
        origins: &[ClientId],
    ) -> Result<Merge<Self::State, Self::Operation>, EngineError>;

    /// Every unconfirmed operation, in order, or `None` if there are none.
    fn compute_sendable(&self, state: &Self::State) -> Option<Vec<Self::Operation>>;

    fn map_selection(&self, selection: Selection, ops: &[Self::Operation]) -> Selection;

    /// The local selection held in `state`.
    fn selection(&self, state: &Self::State) -> Selection;

    /// Largest valid position in `state`'s document.
    fn max_position(&self, state: &Self::State) -> usize;
}
