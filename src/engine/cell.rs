//! Cell payload - the value slot, closure, and policies of one cell.
//!
//! One runtime struct covers every cell kind; the differences are tagged
//! (`CellKind`, optional closure, optional slot) rather than encoded in
//! the type system, so the engine can own a heterogeneous cell map behind
//! a single thread-local.
//!
//! Values are stored as `Rc<dyn Any>` so reads can hand out a cheap strong
//! reference and run user code (clone, closures) outside any engine
//! borrow. The engine is the only long-term owner; the `Rc` never crosses
//! threads.

use std::any::{Any, TypeId};
use std::rc::Rc;

use crate::invalidate::Invalidate;
use crate::trigger::Trigger;
use crate::types::{AggregateId, CellKind};

// =============================================================================
// Value slot
// =============================================================================

/// Polymorphic value storage. Empty only for action cells and for a
/// computed cell between registration and its first evaluation.
#[derive(Default)]
pub(crate) struct ValueSlot {
    value: Option<Rc<dyn Any>>,
}

impl ValueSlot {
    pub fn empty() -> Self {
        Self { value: None }
    }

    pub fn with(value: Rc<dyn Any>) -> Self {
        Self { value: Some(value) }
    }

    /// A strong reference to the current value, if any.
    pub fn get(&self) -> Option<Rc<dyn Any>> {
        self.value.clone()
    }

    /// Replace the stored value, handing the previous one back. Callers
    /// inside an engine borrow must drop the returned value only after the
    /// borrow ends: dropping it can run user `Drop` impls that re-enter
    /// the engine.
    #[must_use]
    pub fn store(&mut self, value: Rc<dyn Any>) -> Option<Rc<dyn Any>> {
        self.value.replace(value)
    }
}

// =============================================================================
// Closure and probes
// =============================================================================

/// The bound behavior of a computed or action cell.
pub(crate) enum Closure {
    /// Recompute the cell's value from its current inputs.
    Compute(Box<dyn FnMut() -> Rc<dyn Any>>),
    /// Run a side effect; produces no value.
    Act(Box<dyn FnMut()>),
}

/// Type-erased equality probe used to derive the changed hint.
pub(crate) type EqProbe = fn(&dyn Any, &dyn Any) -> bool;

/// Monomorphized probe for a concrete value type.
pub(crate) fn eq_probe_of<T: PartialEq + 'static>() -> EqProbe {
    fn probe<T: PartialEq + 'static>(a: &dyn Any, b: &dyn Any) -> bool {
        match (a.downcast_ref::<T>(), b.downcast_ref::<T>()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
    probe::<T>
}

/// Extracts the aggregate id out of a field-bearing value so the field
/// index can be re-pointed before observers fire on reassignment.
pub(crate) type FieldHook = Box<dyn Fn(&dyn Any) -> Option<AggregateId>>;

// =============================================================================
// Cell node
// =============================================================================

/// One cell: payload, policies, and the weak-reference count that drives
/// invalidation. Topology lives in [`Graph`](super::graph::Graph), keyed
/// by the same id.
pub(crate) struct CellNode {
    pub kind: CellKind,
    /// Debug name, used in log lines and error messages.
    pub name: Option<String>,
    pub slot: ValueSlot,
    /// `None` for value cells, and transiently while a closure is checked
    /// out of the engine for execution.
    pub closure: Option<Closure>,
    /// Value type fixed at construction; rebinds must preserve it.
    pub value_type: TypeId,
    pub value_type_name: &'static str,
    /// Equality probe for the changed hint. Absent on action cells.
    pub eq: Option<EqProbe>,
    /// Transiently `None` while checked out for consultation.
    pub trigger: Option<Box<dyn Trigger>>,
    pub invalidate: Rc<dyn Invalidate>,
    /// Count of live user handles. Zero triggers the invalidation
    /// strategy exactly once.
    pub weak_count: u32,
    /// Set on source cells wrapping a field-bearing aggregate.
    pub field_hook: Option<FieldHook>,
}

impl CellNode {
    /// A cell holding a value of type `T`.
    pub fn value_cell<T: PartialEq + 'static>(
        kind: CellKind,
        slot: ValueSlot,
        trigger: Box<dyn Trigger>,
        invalidate: Rc<dyn Invalidate>,
    ) -> Self {
        Self {
            kind,
            name: None,
            slot,
            closure: None,
            value_type: TypeId::of::<T>(),
            value_type_name: std::any::type_name::<T>(),
            eq: Some(eq_probe_of::<T>()),
            trigger: Some(trigger),
            invalidate,
            weak_count: 1,
            field_hook: None,
        }
    }

    /// A valueless side-effect cell.
    pub fn action_cell(trigger: Box<dyn Trigger>, invalidate: Rc<dyn Invalidate>) -> Self {
        Self {
            kind: CellKind::Action,
            name: None,
            slot: ValueSlot::empty(),
            closure: None,
            value_type: TypeId::of::<()>(),
            value_type_name: "()",
            eq: None,
            trigger: Some(trigger),
            invalidate,
            weak_count: 1,
            field_hook: None,
        }
    }
}
