//! Field subsystem - reactive sub-cells of user aggregates.
//!
//! A user struct opts into reactivity by embedding a [`FieldOwner`] and
//! declaring its reactive members as [`Field`] sub-cells created with
//! [`field`](crate::api::field). The thread-local field index maps the
//! aggregate's identity to its sub-cells so that:
//!
//! - wrapping the aggregate in a source cell (`var_struct`) points every
//!   sub-cell at the enclosing container,
//! - writing a sub-cell fires the sub-cell's own observers first and the
//!   container's observers second,
//! - reassigning the container's value re-points the index to the new
//!   embedded aggregate before any observer fires.
//!
//! Copies of an aggregate are distinct aggregates: cloning a `FieldOwner`
//! allocates a fresh identity, and the copy's constructor registers fresh
//! sub-cells under it. Sub-cells orphaned by a reassignment are cleaned up
//! by their [`FieldStrategy`](crate::invalidate::FieldStrategy) when the
//! old aggregate (and with it the old field handles) is dropped.
//!
//! # Example
//!
//! ```ignore
//! struct Person {
//!     owner: FieldOwner,
//!     name: Field<String>,
//! }
//!
//! impl Person {
//!     fn new(name: &str) -> Self {
//!         let owner = FieldOwner::new();
//!         let name = field(&owner, name.to_string());
//!         Self { owner, name }
//!     }
//! }
//!
//! impl FieldStruct for Person {
//!     fn field_owner(&self) -> &FieldOwner { &self.owner }
//! }
//! ```

use std::cell::RefCell;
use std::collections::HashMap;

use tracing::debug;

use crate::engine::runtime;
use crate::handle::Handle;
use crate::types::{AggregateId, NodeId};

/// A field sub-cell handle. Field cells hold a value, are writable, and
/// route their reactivity through the enclosing container cell.
pub type Field<T> = Handle<T>;

// =============================================================================
// Aggregate identity
// =============================================================================

/// Embedded by field-bearing aggregates; carries the aggregate's stable
/// identity. Each construction (including clones) gets a fresh identity,
/// because a copy of an aggregate owns its own sub-cells.
#[derive(Debug)]
pub struct FieldOwner {
    id: AggregateId,
}

impl FieldOwner {
    pub fn new() -> Self {
        Self {
            id: AggregateId::next(),
        }
    }

    pub fn id(&self) -> AggregateId {
        self.id
    }
}

impl Default for FieldOwner {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for FieldOwner {
    fn clone(&self) -> Self {
        Self::new()
    }
}

/// Implemented by aggregates that embed a [`FieldOwner`]. Required by
/// [`var_struct`](crate::api::var_struct) so the engine can find the
/// aggregate identity inside a stored value.
pub trait FieldStruct {
    fn field_owner(&self) -> &FieldOwner;
}

// =============================================================================
// Field index
// =============================================================================

#[derive(Default)]
struct FieldIndex {
    /// Aggregate identity -> its registered sub-cells, in declaration order.
    by_owner: HashMap<AggregateId, Vec<NodeId>>,
    /// Sub-cell -> the source cell currently containing its aggregate.
    container: HashMap<NodeId, NodeId>,
    /// Sub-cell -> the aggregate it was registered under.
    owner_of: HashMap<NodeId, AggregateId>,
}

thread_local! {
    static INDEX: RefCell<FieldIndex> = RefCell::new(FieldIndex::default());
}

/// Register a freshly created sub-cell under its aggregate's identity.
pub(crate) fn register_field(owner: AggregateId, cell: NodeId) {
    INDEX.with(|i| {
        let mut i = i.borrow_mut();
        i.by_owner.entry(owner).or_default().push(cell);
        i.owner_of.insert(cell, owner);
    });
}

/// Point every sub-cell of `owner` at the container source cell. Called
/// when an aggregate is wrapped by `var_struct` and again, before any
/// observers fire, whenever the container's value is reassigned.
pub(crate) fn bind_container(owner: AggregateId, container: NodeId) {
    INDEX.with(|i| {
        let mut i = i.borrow_mut();
        let subs = i.by_owner.get(&owner).cloned().unwrap_or_default();
        for sub in &subs {
            i.container.insert(*sub, container);
        }
        debug!(%owner, %container, count = subs.len(), "field index re-pointed");
    });
}

/// The container source cell whose aggregate holds this sub-cell, if any.
pub(crate) fn container_of(cell: NodeId) -> Option<NodeId> {
    INDEX.with(|i| i.borrow().container.get(&cell).copied())
}

/// Remove one sub-cell from the index entirely.
pub(crate) fn detach(cell: NodeId) {
    INDEX.with(|i| {
        let mut i = i.borrow_mut();
        if let Some(owner) = i.owner_of.remove(&cell) {
            if let Some(subs) = i.by_owner.get_mut(&owner) {
                subs.retain(|&s| s != cell);
                if subs.is_empty() {
                    i.by_owner.remove(&owner);
                }
            }
        }
        i.container.remove(&cell);
    });
}

/// Prune index entries whose cells no longer exist. Run after a close
/// cascade, which can take field sub-cells and containers with it.
pub(crate) fn forget_closed_cells() {
    INDEX.with(|i| {
        let mut i = i.borrow_mut();
        i.owner_of.retain(|cell, _| runtime::is_open(*cell));
        i.container
            .retain(|cell, container| runtime::is_open(*cell) && runtime::is_open(*container));
        for subs in i.by_owner.values_mut() {
            subs.retain(|&s| runtime::is_open(s));
        }
        i.by_owner.retain(|_, subs| !subs.is_empty());
    });
}

/// Sub-cells registered under an aggregate, in declaration order.
#[cfg(test)]
pub(crate) fn sub_cells_of(owner: AggregateId) -> Vec<NodeId> {
    INDEX.with(|i| i.borrow().by_owner.get(&owner).cloned().unwrap_or_default())
}

/// Drop the whole index. Test support, called from `reset_engine`.
pub(crate) fn reset_index() {
    INDEX.with(|i| *i.borrow_mut() = FieldIndex::default());
}
