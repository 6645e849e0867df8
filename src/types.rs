//! Core types for cellflow.
//!
//! Small shared types that flow through the engine: stable identities for
//! cells and aggregates, the cell-kind tag, and the action an invalidation
//! strategy hands back to the engine.

use std::cell::Cell;
use std::fmt;

// =============================================================================
// Identities
// =============================================================================

/// Stable identity of a cell in the dependency graph.
///
/// Ids are allocated from a thread-local monotonic counter and are never
/// reused within a thread, so a dangling handle can always be distinguished
/// from a handle to a newer cell.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u64);

/// Stable identity of a field-bearing user aggregate.
///
/// Every [`FieldOwner`](crate::field::FieldOwner) construction allocates a
/// fresh id, so copies of an aggregate are distinct aggregates as far as the
/// field index is concerned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggregateId(u64);

thread_local! {
    static NEXT_NODE_ID: Cell<u64> = const { Cell::new(0) };
    static NEXT_AGGREGATE_ID: Cell<u64> = const { Cell::new(0) };
}

impl NodeId {
    /// Allocate the next node id for this thread.
    pub(crate) fn next() -> Self {
        NEXT_NODE_ID.with(|c| {
            let id = c.get();
            c.set(id + 1);
            NodeId(id)
        })
    }
}

impl AggregateId {
    /// Allocate the next aggregate id for this thread.
    pub(crate) fn next() -> Self {
        NEXT_AGGREGATE_ID.with(|c| {
            let id = c.get();
            c.set(id + 1);
            AggregateId(id)
        })
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl fmt::Display for AggregateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "agg#{}", self.0)
    }
}

// =============================================================================
// Cell kind
// =============================================================================

/// What a cell is, which determines what can be done with it.
///
/// | Kind     | Holds value | User-writable   | Has closure |
/// |----------|-------------|-----------------|-------------|
/// | Source   | yes         | yes             | no          |
/// | Const    | yes         | no              | no          |
/// | Computed | yes         | no (recomputed) | yes         |
/// | Action   | no          | no              | yes         |
/// | Field    | yes         | yes             | no          |
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CellKind {
    Source,
    Const,
    Computed,
    Action,
    Field,
}

impl CellKind {
    /// Whether `set` and the compound assignment operators are allowed.
    pub fn is_writable(self) -> bool {
        matches!(self, CellKind::Source | CellKind::Field)
    }

    /// Whether the cell carries a recomputation or side-effect closure.
    pub fn has_closure(self) -> bool {
        matches!(self, CellKind::Computed | CellKind::Action)
    }
}

// =============================================================================
// Invalidation outcome
// =============================================================================

/// What the engine should do with a cell whose last user handle was dropped.
///
/// Returned by [`Invalidate::on_invalid`](crate::invalidate::Invalidate);
/// the engine executes the action after the strategy returns, so strategies
/// never hold engine state while deciding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvalidAction {
    /// Cascade-close the cell and everything that transitively observes it.
    Close,
    /// Leave the cell in place; it keeps recomputing for its observers.
    Keep,
    /// Drop the cell's inputs and pin its current value forever.
    FreezeLastValue,
    /// Detach a field sub-cell from the field index, then close it.
    DetachField,
}
