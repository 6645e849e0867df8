//! Public constructors - the thin glue over the engine core.
//!
//! Every constructor registers a strong cell inside the engine and hands
//! back a weak handle with the count at one:
//!
//! - [`var`] / [`var_opts`] - writable source cell
//! - [`const_var`] - immutable source cell
//! - [`var_struct`] - source cell wrapping a field-bearing aggregate
//! - [`calc`] / [`calc_with`] - computed cell (capture / explicit deps)
//! - [`action`] / [`action_with`] - side-effect cell
//! - [`expr_cell`] - computed cell folded from an arithmetic tree
//! - [`field`] - field sub-cell of an aggregate
//!
//! The `*_opts` variants take any [`Trigger`] and [`Invalidate`]
//! implementation; the plain variants default to [`AlwaysTrigger`] and
//! [`CloseStrategy`].

use std::any::Any;
use std::rc::Rc;

use crate::engine::capture;
use crate::engine::cell::{CellNode, Closure, ValueSlot};
use crate::engine::runtime;
use crate::error::BindError;
use crate::expr::Expr;
use crate::field::{self, Field, FieldOwner, FieldStruct};
use crate::handle::{ActionHandle, CellValue, Handle};
use crate::invalidate::{CloseStrategy, FieldStrategy, Invalidate};
use crate::trigger::{AlwaysTrigger, Trigger};
use crate::types::{CellKind, NodeId};

// =============================================================================
// Explicit dependency lists
// =============================================================================

/// A tuple of handle references usable as an explicit dependency list,
/// e.g. `(&a,)` or `(&a, &b, &c)`. Implemented for arities 1 through 8.
pub trait DepList {
    type Values: 'static;

    /// Node ids of the dependencies, in declaration order.
    fn ids(&self) -> Vec<NodeId>;

    /// A reader producing the dependencies' current values. Captures ids
    /// only, so bound closures do not keep weak counts up.
    fn reader(&self) -> Box<dyn Fn() -> Self::Values>;
}

/// A closure callable with the unpacked values of a [`DepList`], so
/// `calc_with(|x, y| x + y, (&a, &b))` reads naturally instead of taking
/// one tuple argument.
pub trait DepFn<D: DepList, R> {
    fn call(&mut self, values: D::Values) -> R;
}

macro_rules! impl_dep_list {
    ($($ty:ident),+) => {
        impl<'a, $($ty: CellValue),+> DepList for ($(&'a Handle<$ty>,)+) {
            type Values = ($($ty,)+);

            fn ids(&self) -> Vec<NodeId> {
                #[allow(non_snake_case)]
                let ($($ty,)+) = self;
                vec![$($ty.id()),+]
            }

            fn reader(&self) -> Box<dyn Fn() -> Self::Values> {
                #[allow(non_snake_case)]
                let ($($ty,)+) = self;
                $(let $ty = $ty.id();)+
                Box::new(move || ($(runtime::read_value::<$ty>($ty),)+))
            }
        }

        impl<'a, Func, Ret, $($ty: CellValue),+> DepFn<($(&'a Handle<$ty>,)+), Ret> for Func
        where
            Func: FnMut($($ty),+) -> Ret,
        {
            fn call(&mut self, values: ($($ty,)+)) -> Ret {
                #[allow(non_snake_case)]
                let ($($ty,)+) = values;
                self($($ty),+)
            }
        }
    };
}

impl_dep_list!(T1);
impl_dep_list!(T1, T2);
impl_dep_list!(T1, T2, T3);
impl_dep_list!(T1, T2, T3, T4);
impl_dep_list!(T1, T2, T3, T4, T5);
impl_dep_list!(T1, T2, T3, T4, T5, T6);
impl_dep_list!(T1, T2, T3, T4, T5, T6, T7);
impl_dep_list!(T1, T2, T3, T4, T5, T6, T7, T8);

// =============================================================================
// Value cells
// =============================================================================

/// A writable source cell holding `value`.
pub fn var<T: CellValue>(value: T) -> Handle<T> {
    var_opts(value, AlwaysTrigger, CloseStrategy)
}

/// [`var`] with explicit trigger and invalidation policies.
pub fn var_opts<T: CellValue>(
    value: T,
    trigger: impl Trigger,
    invalidate: impl Invalidate,
) -> Handle<T> {
    let id = runtime::register_cell(CellNode::value_cell::<T>(
        CellKind::Source,
        ValueSlot::with(Rc::new(value)),
        Box::new(trigger),
        Rc::new(invalidate),
    ));
    Handle::from_id(id)
}

/// An immutable source cell. Reads and dependencies work as for [`var`];
/// writes fault.
pub fn const_var<T: CellValue>(value: T) -> Handle<T> {
    let id = runtime::register_cell(CellNode::value_cell::<T>(
        CellKind::Const,
        ValueSlot::with(Rc::new(value)),
        Box::new(AlwaysTrigger),
        Rc::new(CloseStrategy),
    ));
    Handle::from_id(id)
}

/// A source cell wrapping a field-bearing aggregate. Every sub-cell the
/// aggregate registered is pointed at this cell, so field writes also wake
/// this cell's observers; reassigning the value re-points the index to the
/// new aggregate before observers fire.
pub fn var_struct<T: CellValue + FieldStruct>(value: T) -> Handle<T> {
    let aggregate = value.field_owner().id();
    let id = runtime::register_cell(CellNode::value_cell::<T>(
        CellKind::Source,
        ValueSlot::with(Rc::new(value)),
        Box::new(AlwaysTrigger),
        Rc::new(CloseStrategy),
    ));
    runtime::set_field_hook(
        id,
        Box::new(|any: &dyn Any| any.downcast_ref::<T>().map(|v| v.field_owner().id())),
    );
    field::bind_container(aggregate, id);
    Handle::from_id(id)
}

/// A field sub-cell of an aggregate, registered under the owner's
/// identity. Writable; fires its own observers first and the enclosing
/// container's observers second.
pub fn field<T: CellValue>(owner: &FieldOwner, value: T) -> Field<T> {
    let id = runtime::register_cell(CellNode::value_cell::<T>(
        CellKind::Field,
        ValueSlot::with(Rc::new(value)),
        Box::new(AlwaysTrigger),
        Rc::new(FieldStrategy),
    ));
    field::register_field(owner.id(), id);
    Handle::from_id(id)
}

// =============================================================================
// Computed cells
// =============================================================================

/// A computed cell bound capture-style: dependencies are whatever `f`
/// reads through handles or readers during its first evaluation.
pub fn calc<R, F>(f: F) -> Handle<R>
where
    R: CellValue,
    F: FnMut() -> R + 'static,
{
    calc_opts(f, AlwaysTrigger, CloseStrategy)
}

/// [`calc`] with explicit trigger and invalidation policies.
pub fn calc_opts<R, F>(f: F, trigger: impl Trigger, invalidate: impl Invalidate) -> Handle<R>
where
    R: CellValue,
    F: FnMut() -> R + 'static,
{
    let id = runtime::register_cell(CellNode::value_cell::<R>(
        CellKind::Computed,
        ValueSlot::empty(),
        Box::new(trigger),
        Rc::new(invalidate),
    ));
    bind_compute_capture(id, f).expect("a freshly constructed cell cannot form a cycle");
    Handle::from_id(id)
}

/// A computed cell bound arguments-style: dependencies are exactly the
/// handles in `deps`, and `f` receives their current values.
pub fn calc_with<D, F, R>(f: F, deps: D) -> Handle<R>
where
    D: DepList,
    R: CellValue,
    F: DepFn<D, R> + 'static,
{
    calc_with_opts(f, deps, AlwaysTrigger, CloseStrategy)
}

/// [`calc_with`] with explicit trigger and invalidation policies.
pub fn calc_with_opts<D, F, R>(
    f: F,
    deps: D,
    trigger: impl Trigger,
    invalidate: impl Invalidate,
) -> Handle<R>
where
    D: DepList,
    R: CellValue,
    F: DepFn<D, R> + 'static,
{
    let id = runtime::register_cell(CellNode::value_cell::<R>(
        CellKind::Computed,
        ValueSlot::empty(),
        Box::new(trigger),
        Rc::new(invalidate),
    ));
    bind_compute_deps(id, f, deps).expect("a freshly constructed cell cannot form a cycle");
    Handle::from_id(id)
}

/// A computed cell folded from an arithmetic expression tree. Dependencies
/// are the distinct leaf handles of the tree.
pub fn expr_cell<T>(expr: Expr<T>) -> Handle<T>
where
    T: CellValue,
{
    expr_cell_opts(expr, AlwaysTrigger, CloseStrategy)
}

/// [`expr_cell`] with explicit trigger and invalidation policies.
pub fn expr_cell_opts<T>(
    expr: Expr<T>,
    trigger: impl Trigger,
    invalidate: impl Invalidate,
) -> Handle<T>
where
    T: CellValue,
{
    calc_opts(move || expr.eval(), trigger, invalidate)
}

// =============================================================================
// Action cells
// =============================================================================

/// A side-effect cell bound capture-style. The effect runs once
/// immediately (that run records the dependencies) and again on every
/// pulse that reaches it.
pub fn action(f: impl FnMut() + 'static) -> ActionHandle {
    action_opts(f, AlwaysTrigger, CloseStrategy)
}

/// [`action`] with explicit trigger and invalidation policies.
pub fn action_opts(
    f: impl FnMut() + 'static,
    trigger: impl Trigger,
    invalidate: impl Invalidate,
) -> ActionHandle {
    let id = runtime::register_cell(CellNode::action_cell(
        Box::new(trigger),
        Rc::new(invalidate),
    ));
    bind_action_capture(id, f).expect("a freshly constructed cell cannot form a cycle");
    ActionHandle::from_id(id)
}

/// A side-effect cell over explicit dependencies. The effect runs once at
/// construction with the dependencies' current values.
pub fn action_with<D, F>(f: F, deps: D) -> ActionHandle
where
    D: DepList,
    F: DepFn<D, ()> + 'static,
{
    action_with_opts(f, deps, AlwaysTrigger, CloseStrategy)
}

/// [`action_with`] with explicit trigger and invalidation policies.
pub fn action_with_opts<D, F>(
    f: F,
    deps: D,
    trigger: impl Trigger,
    invalidate: impl Invalidate,
) -> ActionHandle
where
    D: DepList,
    F: DepFn<D, ()> + 'static,
{
    let id = runtime::register_cell(CellNode::action_cell(
        Box::new(trigger),
        Rc::new(invalidate),
    ));
    bind_action_deps(id, f, deps).expect("a freshly constructed cell cannot form a cycle");
    ActionHandle::from_id(id)
}

// =============================================================================
// Bind plumbing (shared with handle rebinds)
// =============================================================================

pub(crate) fn bind_compute_capture<R: CellValue>(
    id: NodeId,
    mut f: impl FnMut() -> R + 'static,
) -> Result<(), BindError> {
    let (first, deps) = capture::record(|| f());
    runtime::bind_cell(id, &deps)?;
    runtime::store_value(id, Rc::new(first));
    runtime::install_closure(
        id,
        Closure::Compute(Box::new(move || Rc::new(f()) as Rc<dyn Any>)),
    );
    Ok(())
}

pub(crate) fn bind_compute_deps<D, F, R>(id: NodeId, f: F, deps: D) -> Result<(), BindError>
where
    D: DepList,
    R: CellValue,
    F: DepFn<D, R> + 'static,
{
    let ids = deps.ids();
    runtime::bind_cell(id, &ids)?;
    let read = deps.reader();
    let mut f = f;
    let mut compute = move || Rc::new(f.call(read())) as Rc<dyn Any>;
    let first = compute();
    runtime::store_value(id, first);
    runtime::install_closure(id, Closure::Compute(Box::new(compute)));
    Ok(())
}

pub(crate) fn bind_action_capture(
    id: NodeId,
    mut f: impl FnMut() + 'static,
) -> Result<(), BindError> {
    let ((), deps) = capture::record(|| f());
    runtime::bind_cell(id, &deps)?;
    runtime::install_closure(id, Closure::Act(Box::new(f)));
    Ok(())
}

pub(crate) fn bind_action_deps<D, F>(id: NodeId, f: F, deps: D) -> Result<(), BindError>
where
    D: DepList,
    F: DepFn<D, ()> + 'static,
{
    let ids = deps.ids();
    runtime::bind_cell(id, &ids)?;
    let read = deps.reader();
    let mut f = f;
    let mut act = move || f.call(read());
    act();
    runtime::install_closure(id, Closure::Act(Box::new(act)));
    Ok(())
}
