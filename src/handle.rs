//! Caller-facing handles - weak references that drive invalidation.
//!
//! The engine strongly owns every cell; callers only ever hold handles.
//! A [`Handle`] participates in the cell's weak-reference count: cloning
//! increments it, dropping decrements it, and when the count reaches zero
//! the cell's invalidation strategy runs. A [`Reader`] is the non-counting
//! sibling for use *inside* closures: it reads and registers in the
//! capture sink but does not keep the cell's count up, so a cell whose
//! user handles are gone still invalidates even while other cells' bound
//! closures read it.
//!
//! Handles are thread-bound like the engine itself; they are deliberately
//! neither `Send` nor `Sync`.
//!
//! # Reads and faults
//!
//! `get`, `with_ref`, `set`, and the compound assignment operators fault
//! (panic) on a handle whose referent was closed; `try_get` and `is_open`
//! are the checked path, and a closed handle is simply `false`-like.

use std::marker::PhantomData;
use std::ops::{AddAssign, DivAssign, MulAssign, SubAssign};

use crate::api::{bind_action_capture, bind_action_deps, bind_compute_capture, bind_compute_deps};
use crate::api::{DepFn, DepList};
use crate::engine::runtime;
use crate::error::{AccessError, BindError};
use crate::types::{CellKind, NodeId};

/// Bounds every cell value satisfies: cloneable out of the slot,
/// equality-comparable for the changed hint, and owned.
pub trait CellValue: Clone + PartialEq + 'static {}

impl<T: Clone + PartialEq + 'static> CellValue for T {}

// =============================================================================
// Handle
// =============================================================================

/// Weak, counted reference to a value cell.
pub struct Handle<T> {
    id: NodeId,
    // *const keeps handles off other threads; the engine is thread-local.
    _marker: PhantomData<*const T>,
}

impl<T: CellValue> Handle<T> {
    pub(crate) fn from_id(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    /// Stable identity of the referenced cell.
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current value by clone.
    ///
    /// Registers the read in the capture sink when one is active.
    ///
    /// # Panics
    ///
    /// When the referent was closed or destroyed.
    pub fn get(&self) -> T {
        runtime::read_noted::<T>(self.id)
    }

    /// Checked read for the non-panicking path.
    pub fn try_get(&self) -> Result<T, AccessError> {
        runtime::try_read::<T>(self.id).ok_or(AccessError::ClosedHandle)
    }

    /// What kind of cell this handle refers to.
    ///
    /// # Panics
    ///
    /// When the referent was closed or destroyed.
    pub fn kind(&self) -> CellKind {
        runtime::cell_kind(self.id)
            .unwrap_or_else(|| panic!("kind query through closed cell handle {}", self.id))
    }

    /// Borrow the value without cloning. The engine is not held while `f`
    /// runs, so `f` may read or write other cells.
    ///
    /// # Panics
    ///
    /// When the referent was closed or destroyed.
    pub fn with_ref<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        runtime::with_value_ref::<T, R>(self.id, f)
    }

    /// Re-evaluate the cell's closure from current inputs, store and
    /// return the result without notifying observers. On a value cell
    /// this is just `get`.
    pub fn update(&self) -> T {
        runtime::update_value::<T>(self.id)
    }

    /// Write a new value and run the propagation pulse.
    ///
    /// # Panics
    ///
    /// When the referent was closed, or the cell is not writable
    /// (`const_var` and `calc` cells reject writes).
    pub fn set(&self, value: T) {
        runtime::write_value(self.id, value);
    }

    /// A non-counting reader for use inside bound closures.
    pub fn reader(&self) -> Reader<T> {
        Reader {
            id: self.id,
            _marker: PhantomData,
        }
    }

    /// Whether the referent still exists. The truthiness of a handle.
    pub fn is_open(&self) -> bool {
        runtime::is_open(self.id)
    }

    /// Close the cell and cascade over everything that transitively
    /// observes it. During a pulse the cascade is deferred to pulse end.
    ///
    /// # Panics
    ///
    /// When the referent was already closed.
    pub fn close(&self) {
        assert!(
            self.is_open(),
            "close through closed cell handle {}",
            self.id
        );
        runtime::close_cell(self.id);
    }

    /// Attach a debug name, used in log lines and error messages.
    pub fn set_name(&self, name: &str) {
        runtime::set_name(self.id, name);
    }

    pub fn name(&self) -> Option<String> {
        runtime::name_of(self.id)
    }

    /// Rebind a computed cell to a capture-style closure: dependencies are
    /// whatever `f` reads through handles or readers during its first
    /// evaluation.
    ///
    /// Pre-checks run before anything commits; on `Err` the cell keeps its
    /// prior closure and edges. The closure's return type must equal the
    /// cell's declared value type.
    ///
    /// # Panics
    ///
    /// When the referent was closed, or the cell is not a computed cell.
    pub fn rebind<R, F>(&self, f: F) -> Result<(), BindError>
    where
        R: CellValue,
        F: FnMut() -> R + 'static,
    {
        self.assert_computed();
        runtime::check_value_type::<R>(self.id)?;
        bind_compute_capture(self.id, f)
    }

    /// Rebind a computed cell to an arguments-style closure over an
    /// explicit dependency list. Same guarantees as [`Handle::rebind`].
    pub fn rebind_with<D, F, R>(&self, f: F, deps: D) -> Result<(), BindError>
    where
        D: DepList,
        R: CellValue,
        F: DepFn<D, R> + 'static,
    {
        self.assert_computed();
        runtime::check_value_type::<R>(self.id)?;
        bind_compute_deps(self.id, f, deps)
    }

    /// Gate this cell behind a predicate: the cell re-evaluates and
    /// propagates only while `predicate` returns true. Replaces the cell's
    /// current trigger policy with a threshold.
    ///
    /// The predicate may read any cells; it runs after the cell's inputs
    /// have settled, so it always observes pulse-final values.
    pub fn set_threshold(&self, predicate: impl FnMut() -> bool + 'static) {
        runtime::set_threshold_pred(self.id, Box::new(predicate));
    }

    fn assert_computed(&self) {
        assert_eq!(
            runtime::cell_kind(self.id),
            Some(CellKind::Computed),
            "only computed cells can be rebound"
        );
    }
}

/// Arithmetic convenience on numeric sources: add one.
impl<T: CellValue + std::ops::Add<Output = T> + From<u8>> Handle<T> {
    pub fn inc(&self) {
        let next = runtime::read_value::<T>(self.id) + T::from(1);
        self.set(next);
    }
}

/// Arithmetic convenience on numeric sources: subtract one.
impl<T: CellValue + std::ops::Sub<Output = T> + From<u8>> Handle<T> {
    pub fn dec(&self) {
        let next = runtime::read_value::<T>(self.id) - T::from(1);
        self.set(next);
    }
}

impl<T: CellValue> Clone for Handle<T> {
    fn clone(&self) -> Self {
        runtime::add_weak_ref(self.id);
        Self {
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for Handle<T> {
    fn drop(&mut self) {
        runtime::release_weak_ref(self.id);
    }
}

impl<T: CellValue> From<&Handle<T>> for bool {
    fn from(h: &Handle<T>) -> bool {
        h.is_open()
    }
}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle").field("id", &self.id).finish()
    }
}

macro_rules! impl_write_op {
    ($assign:ident, $method:ident, $op:tt, $binop:ident) => {
        impl<T: CellValue + std::ops::$binop<Output = T>> $assign<T> for Handle<T> {
            fn $method(&mut self, rhs: T) {
                let next = runtime::read_value::<T>(self.id) $op rhs;
                self.set(next);
            }
        }
    };
}

impl_write_op!(AddAssign, add_assign, +, Add);
impl_write_op!(SubAssign, sub_assign, -, Sub);
impl_write_op!(MulAssign, mul_assign, *, Mul);
impl_write_op!(DivAssign, div_assign, /, Div);

// =============================================================================
// Reader
// =============================================================================

/// Non-counting read access to a cell, for use inside bound closures and
/// threshold predicates. Copyable; does not keep the cell alive.
pub struct Reader<T> {
    id: NodeId,
    _marker: PhantomData<*const T>,
}

impl<T: CellValue> Reader<T> {
    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Current value by clone; registers in the capture sink.
    ///
    /// # Panics
    ///
    /// When the cell was closed or destroyed.
    pub fn get(&self) -> T {
        runtime::read_noted::<T>(self.id)
    }

    /// Checked read for the non-panicking path.
    pub fn try_get(&self) -> Result<T, AccessError> {
        runtime::try_read::<T>(self.id).ok_or(AccessError::ClosedHandle)
    }

    pub fn is_open(&self) -> bool {
        runtime::is_open(self.id)
    }
}

impl<T> Clone for Reader<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl<T> Copy for Reader<T> {}

impl<T> std::fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reader").field("id", &self.id).finish()
    }
}

// =============================================================================
// Action handle
// =============================================================================

/// Weak, counted reference to an action cell. Actions hold no value, so
/// the surface is lifecycle-only.
pub struct ActionHandle {
    id: NodeId,
    _marker: PhantomData<*const ()>,
}

impl ActionHandle {
    pub(crate) fn from_id(id: NodeId) -> Self {
        Self {
            id,
            _marker: PhantomData,
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Re-run the side effect once, without any propagation.
    pub fn update(&self) {
        runtime::update_action(self.id);
    }

    pub fn is_open(&self) -> bool {
        runtime::is_open(self.id)
    }

    /// Close the action cell.
    ///
    /// # Panics
    ///
    /// When the referent was already closed.
    pub fn close(&self) {
        assert!(
            self.is_open(),
            "close through closed cell handle {}",
            self.id
        );
        runtime::close_cell(self.id);
    }

    pub fn set_name(&self, name: &str) {
        runtime::set_name(self.id, name);
    }

    pub fn name(&self) -> Option<String> {
        runtime::name_of(self.id)
    }

    /// Rebind to a capture-style side effect; dependencies are whatever
    /// `f` reads during its first run (which happens immediately).
    pub fn rebind(&self, f: impl FnMut() + 'static) -> Result<(), BindError> {
        bind_action_capture(self.id, f)
    }

    /// Rebind to an arguments-style side effect over explicit
    /// dependencies. The effect runs once on success.
    pub fn rebind_with<D, F>(&self, f: F, deps: D) -> Result<(), BindError>
    where
        D: DepList,
        F: DepFn<D, ()> + 'static,
    {
        bind_action_deps(self.id, f, deps)
    }

    /// Gate the side effect behind a predicate, as
    /// [`Handle::set_threshold`] does for computed cells.
    pub fn set_threshold(&self, predicate: impl FnMut() -> bool + 'static) {
        runtime::set_threshold_pred(self.id, Box::new(predicate));
    }
}

impl Clone for ActionHandle {
    fn clone(&self) -> Self {
        runtime::add_weak_ref(self.id);
        Self {
            id: self.id,
            _marker: PhantomData,
        }
    }
}

impl Drop for ActionHandle {
    fn drop(&mut self) {
        runtime::release_weak_ref(self.id);
    }
}

impl From<&ActionHandle> for bool {
    fn from(h: &ActionHandle) -> bool {
        h.is_open()
    }
}

impl std::fmt::Debug for ActionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionHandle").field("id", &self.id).finish()
    }
}
