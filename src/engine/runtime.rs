//! Engine runtime - the thread-local cell store and the propagation pulse.
//!
//! One engine per thread. All public entry points run on the owning
//! thread; there is no locking anywhere, and handles must not cross
//! threads. State is a single `thread_local` holding:
//!
//! - the cell map (the engine strongly owns every cell)
//! - the dependency [`Graph`]
//! - pulse bookkeeping (depth, closes deferred to pulse end)
//!
//! # Borrow discipline
//!
//! User code (closures, trigger predicates, `Clone`/`Drop` impls of stored
//! values) can re-enter the engine at any time, so nothing user-provided
//! ever runs while the engine is borrowed. Closures and triggers are
//! checked out of their cell, run, and put back; values are handed out as
//! `Rc` clones and examined after the borrow ends.
//!
//! # The pulse
//!
//! A write starts exactly one pulse. The pulse computes the affected set
//! (transitive observers of the root) and a per-cell count of affected
//! inputs, then settles cells recursively: settling a cell walks its
//! observers in attach order, delivers the changed hint, and decrements
//! their counts; a cell processes exactly when its count reaches zero,
//! i.e. when its last relevant input has settled. A cell none of whose
//! inputs actually fired settles silently without consulting its trigger.
//! Every cell settles once per pulse, and every closure sees its inputs
//! at their pulse-final values.

use std::any::TypeId;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;

use tracing::{error, info, warn};

use super::cell::{CellNode, Closure, FieldHook};
use super::graph::Graph;
use crate::error::BindError;
use crate::field;
use crate::invalidate::Invalidate;
use crate::trigger::ThresholdTrigger;
use crate::types::{CellKind, InvalidAction, NodeId};

// =============================================================================
// Engine state
// =============================================================================

#[derive(Default)]
struct Engine {
    cells: HashMap<NodeId, CellNode>,
    graph: Graph,
    /// Nesting depth of in-flight pulses. Writes from inside an action
    /// closure start a nested pulse.
    pulse_depth: u32,
    /// Close requests received while a pulse was in flight; the cascades
    /// run when the outermost pulse completes.
    pending_close: Vec<NodeId>,
}

thread_local! {
    static ENGINE: RefCell<Engine> = RefCell::new(Engine::default());
}

fn with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> R {
    ENGINE.with(|e| f(&mut e.borrow_mut()))
}

/// Like [`with_engine`], but a no-op when the thread-local engine has
/// already been torn down. Handle drops run during thread exit and must
/// not fault on a dead engine.
fn try_with_engine<R>(f: impl FnOnce(&mut Engine) -> R) -> Option<R> {
    ENGINE.try_with(|e| f(&mut e.borrow_mut())).ok()
}

/// Debug name of a cell for diagnostics, falling back to its id.
pub(crate) fn display_name(id: NodeId) -> String {
    with_engine(|e| e.cells.get(&id).and_then(|c| c.name.clone()))
        .unwrap_or_else(|| id.to_string())
}

// =============================================================================
// Registration and introspection
// =============================================================================

pub(crate) fn register_cell(cell: CellNode) -> NodeId {
    let id = NodeId::next();
    with_engine(|e| {
        e.cells.insert(id, cell);
        e.graph.register(id);
    });
    id
}

/// Whether the cell behind `id` still exists. This is the truthiness of a
/// handle.
pub fn is_open(id: NodeId) -> bool {
    with_engine(|e| e.cells.contains_key(&id))
}

/// Number of live cells in this thread's engine.
pub fn cell_count() -> usize {
    with_engine(|e| e.cells.len())
}

/// The cells `id` currently reads, in declaration order.
pub fn dependents_of(id: NodeId) -> Vec<NodeId> {
    with_engine(|e| e.graph.dependents(id).to_vec())
}

/// The cells currently reading `id`, in attach order.
pub fn observers_of(id: NodeId) -> Vec<NodeId> {
    with_engine(|e| e.graph.observers(id).to_vec())
}

/// Whether `target` is one of `source`'s repeat dependencies: a declared
/// input that `source` also reaches through another path.
pub fn is_repeat_dependent(source: NodeId, target: NodeId) -> bool {
    with_engine(|e| e.graph.is_repeat_target(source, target))
}

pub(crate) fn cell_kind(id: NodeId) -> Option<CellKind> {
    with_engine(|e| e.cells.get(&id).map(|c| c.kind))
}

pub(crate) fn set_name(id: NodeId, name: &str) {
    with_engine(|e| {
        if let Some(c) = e.cells.get_mut(&id) {
            c.name = Some(name.to_string());
        }
    });
}

pub(crate) fn name_of(id: NodeId) -> Option<String> {
    with_engine(|e| e.cells.get(&id).and_then(|c| c.name.clone()))
}

/// Drop every cell and all engine state for this thread. Test support.
///
/// Cells are dropped outside the engine borrow: dropping a closure can
/// drop captured handles, which re-enter the engine to release their weak
/// references.
pub fn reset_engine() {
    let cells = with_engine(|e| {
        e.graph.clear();
        e.pulse_depth = 0;
        e.pending_close.clear();
        std::mem::take(&mut e.cells)
    });
    field::reset_index();
    super::capture::reset();
    drop(cells);
}

// =============================================================================
// Reads
// =============================================================================

fn value_rc(id: NodeId) -> Option<Rc<dyn std::any::Any>> {
    with_engine(|e| e.cells.get(&id).and_then(|c| c.slot.get()))
}

/// Read the current value by clone. Panics on a closed handle or an empty
/// slot; this is the runtime fault of a dead-handle access.
pub(crate) fn read_value<T: Clone + 'static>(id: NodeId) -> T {
    let rc = value_rc(id).unwrap_or_else(|| {
        panic!("read through closed or empty cell handle {}", display_name(id))
    });
    let typed = rc
        .downcast::<T>()
        .unwrap_or_else(|_| panic!("cell {} holds a different value type", display_name(id)));
    (*typed).clone()
}

/// Read and record the access in the capture sink. Field sub-cells are
/// read without recording: their reactivity routes through the container.
pub(crate) fn read_noted<T: Clone + 'static>(id: NodeId) -> T {
    if cell_kind(id) != Some(CellKind::Field) {
        super::capture::note_read(id);
    }
    read_value(id)
}

/// Checked read: `None` when the cell is closed, empty, or of another type.
pub(crate) fn try_read<T: Clone + 'static>(id: NodeId) -> Option<T> {
    let rc = value_rc(id)?;
    rc.downcast::<T>().ok().map(|t| (*t).clone())
}

/// Borrow the current value without cloning. The engine is not borrowed
/// while `f` runs, so `f` may freely read other cells.
pub(crate) fn with_value_ref<T: 'static, R>(id: NodeId, f: impl FnOnce(&T) -> R) -> R {
    let rc = value_rc(id).unwrap_or_else(|| {
        panic!("read through closed or empty cell handle {}", display_name(id))
    });
    let typed = rc
        .downcast_ref::<T>()
        .unwrap_or_else(|| panic!("cell {} holds a different value type", display_name(id)));
    f(typed)
}

// =============================================================================
// Writes
// =============================================================================

/// Write a source or field cell and run the resulting pulse.
///
/// For a source wrapping a field-bearing aggregate, the field index is
/// re-pointed to the new value's aggregate before any observer fires.
/// For a field sub-cell, the sub-cell's own observers fire first and the
/// enclosing container's observers second.
///
/// Panics when the handle is closed or the cell is not writable.
pub(crate) fn write_value<T: PartialEq + 'static>(id: NodeId, value: T) {
    let old = with_engine(|e| {
        let cell = e
            .cells
            .get(&id)
            .unwrap_or_else(|| panic!("write through closed cell handle {id}"));
        assert!(
            cell.kind.is_writable(),
            "cell {} is not writable ({:?})",
            cell.name.as_deref().unwrap_or("?"),
            cell.kind
        );
        cell.slot.get()
    });

    // User equality runs outside the borrow: a PartialEq impl on an
    // aggregate may read its field cells.
    let changed = match old.as_ref().and_then(|o| o.downcast_ref::<T>()) {
        Some(o) => *o != value,
        None => true,
    };
    drop(old);

    let stored = with_engine(|e| match e.cells.get_mut(&id) {
        Some(cell) => {
            let repoint = cell.field_hook.as_ref().and_then(|hook| hook(&value));
            let previous = cell.slot.store(Rc::new(value));
            Ok((repoint, previous))
        }
        None => Err(value),
    });
    let (repoint, previous) = match stored {
        Ok(pair) => pair,
        // Closed from inside the equality check; nothing left to write.
        Err(value) => {
            drop(value);
            return;
        }
    };
    // The displaced value may own handles (field-bearing aggregates do);
    // dropping it re-enters the engine, so it happens outside the borrow.
    drop(previous);

    // Re-point field sub-cells at this container before observers fire.
    if let Some(aggregate) = repoint {
        field::bind_container(aggregate, id);
    }

    let kind = cell_kind(id);
    pulse(id, changed);

    // A field write also wakes the enclosing container's observers.
    if kind == Some(CellKind::Field) {
        if let Some(container) = field::container_of(id) {
            pulse(container, true);
        }
    }
}

// =============================================================================
// Binding
// =============================================================================

/// Verify that a rebind preserves the cell's declared value type.
pub(crate) fn check_value_type<R: 'static>(id: NodeId) -> Result<(), BindError> {
    let (expected, expected_name) = with_engine(|e| {
        let c = e
            .cells
            .get(&id)
            .unwrap_or_else(|| panic!("rebind through closed cell handle {id}"));
        (c.value_type, c.value_type_name)
    });
    if expected == TypeId::of::<R>() {
        Ok(())
    } else {
        Err(BindError::ReturnTypeMismatch {
            expected: expected_name,
            found: std::any::type_name::<R>(),
        })
    }
}

/// Install the dependency set of `id` after running the staged pre-checks.
/// On rejection the cell keeps whatever edges it had.
pub(crate) fn bind_cell(id: NodeId, deps: &[NodeId]) -> Result<(), BindError> {
    let outcome = with_engine(|e| e.graph.bind(id, deps));
    match outcome {
        Err(cycle) => {
            let err = BindError::CycleDependency {
                cell: display_name(id),
                target: display_name(cycle.target),
            };
            error!(
                cell = %display_name(id),
                target = %display_name(cycle.target),
                "bind rejected: dependency cycle"
            );
            Err(err)
        }
        Ok(outcome) => {
            for r in &outcome.repeats {
                info!(
                    cell = %display_name(id),
                    target = %display_name(*r),
                    "repeat dependency: deferred notification in effect"
                );
            }
            Ok(())
        }
    }
}

pub(crate) fn install_closure(id: NodeId, closure: Closure) {
    let displaced = with_engine(|e| match e.cells.get_mut(&id) {
        Some(c) => c.closure.replace(closure),
        None => Some(closure),
    });
    // A displaced closure may own captured handles; drop outside the borrow.
    drop(displaced);
}

pub(crate) fn store_value(id: NodeId, value: Rc<dyn std::any::Any>) {
    let previous = with_engine(|e| match e.cells.get_mut(&id) {
        Some(c) => c.slot.store(value),
        None => None,
    });
    drop(previous);
}

pub(crate) fn set_field_hook(id: NodeId, hook: FieldHook) {
    with_engine(|e| {
        if let Some(c) = e.cells.get_mut(&id) {
            c.field_hook = Some(hook);
        }
    });
}

/// Replace the cell's trigger policy with a threshold over `predicate`.
pub(crate) fn set_threshold_pred(id: NodeId, predicate: Box<dyn FnMut() -> bool>) {
    let threshold: Box<dyn crate::trigger::Trigger> = Box::new(ThresholdTrigger::with(predicate));
    let displaced = with_engine(|e| match e.cells.get_mut(&id) {
        Some(c) => c.trigger.replace(threshold),
        None => Some(threshold),
    });
    // A displaced trigger may own a predicate with captured handles.
    drop(displaced);
}

// =============================================================================
// Re-evaluation without propagation
// =============================================================================

/// Re-run the closure of a computed cell from current committed inputs,
/// store the result, and return it. No observers are notified.
pub(crate) fn update_value<T: Clone + 'static>(id: NodeId) -> T {
    match take_closure(id) {
        Some(Closure::Compute(mut f)) => {
            let fresh = f();
            let stored = with_engine(|e| match e.cells.get_mut(&id) {
                Some(c) => {
                    c.closure = Some(Closure::Compute(f));
                    Ok(c.slot.store(fresh))
                }
                None => Err((f, fresh)),
            });
            match stored {
                Ok(previous) => drop(previous),
                Err(leftover) => drop(leftover),
            }
            read_value(id)
        }
        Some(other) => {
            put_back_closure(id, other);
            read_value(id)
        }
        // Value cells have nothing to recompute.
        None => read_value(id),
    }
}

/// Re-run an action cell's side effect. No propagation (actions have no
/// observers).
pub(crate) fn update_action(id: NodeId) {
    if let Some(closure) = take_closure(id) {
        match closure {
            Closure::Act(mut f) => {
                f();
                put_back_closure(id, Closure::Act(f));
            }
            other => put_back_closure(id, other),
        }
    }
}

fn take_closure(id: NodeId) -> Option<Closure> {
    with_engine(|e| e.cells.get_mut(&id).and_then(|c| c.closure.take()))
}

fn put_back_closure(id: NodeId, closure: Closure) {
    let leftover = with_engine(|e| match e.cells.get_mut(&id) {
        Some(c) => {
            c.closure = Some(closure);
            None
        }
        // Cell closed while its closure was out; the closure may own
        // captured handles, so it drops outside the borrow.
        None => Some(closure),
    });
    drop(leftover);
}

// =============================================================================
// The pulse
// =============================================================================

struct PulseState {
    /// Transitive observers of the root; only these participate.
    affected: HashSet<NodeId>,
    /// Unsettled affected inputs per affected cell. A cell processes when
    /// its count reaches zero, i.e. when its last relevant input settles.
    /// This is the per-pulse wait set: a cell with several paths from the
    /// root waits here until every path has delivered.
    pending: HashMap<NodeId, usize>,
    /// OR-accumulated changed hints from inputs that actually fired. A
    /// cell with no entry was never notified (every upstream refused) and
    /// settles silently.
    hints: HashMap<NodeId, bool>,
    /// Cells whose pulse-final value is committed.
    settled: HashSet<NodeId>,
}

/// Consult the cell's trigger policy. The trigger is checked out of the
/// cell while it runs: threshold predicates are user closures and may read
/// other cells.
fn consult_trigger(id: NodeId, changed: bool) -> bool {
    let trigger = with_engine(|e| e.cells.get_mut(&id).and_then(|c| c.trigger.take()));
    match trigger {
        Some(mut t) => {
            let fire = t.should_fire(changed);
            let leftover = with_engine(|e| match e.cells.get_mut(&id) {
                Some(c) => {
                    c.trigger = Some(t);
                    None
                }
                // Closed while consulted; a threshold predicate may own
                // captured handles, so it drops outside the borrow.
                None => Some(t),
            });
            drop(leftover);
            fire
        }
        None => true,
    }
}

/// Run one pulse rooted at a freshly written cell.
///
/// Every affected cell settles exactly once: evaluated when it was
/// notified and its trigger approves, silently otherwise. Because a cell
/// only processes once its last affected input has settled, closures see
/// their inputs at pulse-final values.
fn pulse(root: NodeId, root_changed: bool) {
    // The root's own policy decides whether to notify at all.
    if !consult_trigger(root, root_changed) {
        return;
    }

    let order = with_engine(|e| e.graph.observer_closure(root));
    let affected: HashSet<NodeId> = order.iter().copied().collect();
    let pending: HashMap<NodeId, usize> = with_engine(|e| {
        order
            .iter()
            .map(|&n| {
                let count = e
                    .graph
                    .dependents(n)
                    .iter()
                    .filter(|d| affected.contains(d))
                    .count();
                (n, count)
            })
            .collect()
    });

    let mut st = PulseState {
        affected,
        pending,
        hints: HashMap::new(),
        settled: HashSet::new(),
    };

    with_engine(|e| e.pulse_depth += 1);
    settle(root, true, root_changed, &mut st);
    let depth = with_engine(|e| {
        e.pulse_depth -= 1;
        e.pulse_depth
    });

    // Cascades requested mid-pulse run once the outermost pulse is done.
    if depth == 0 {
        loop {
            let next = with_engine(|e| e.pending_close.pop());
            match next {
                Some(id) => close_now(id),
                None => break,
            }
        }
    }
}

/// Commit a cell as settled and walk its observers in attach order. An
/// observer that just lost its last unsettled input processes immediately;
/// one with outstanding inputs keeps waiting and fires later, from the
/// settle of whichever input delivers last.
fn settle(id: NodeId, fired: bool, changed: bool, st: &mut PulseState) {
    if !st.settled.insert(id) {
        return;
    }
    let observers = with_engine(|e| e.graph.observers(id).to_vec());
    for o in observers {
        if !st.affected.contains(&o) || st.settled.contains(&o) {
            continue;
        }
        if fired {
            let hint = st.hints.entry(o).or_insert(false);
            *hint |= changed;
        }
        let remaining = match st.pending.get_mut(&o) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => continue,
        };
        if remaining == 0 {
            process(o, st);
        }
    }
}

/// All of a cell's affected inputs have settled: evaluate it if it was
/// notified and its trigger approves, otherwise settle it silently.
fn process(id: NodeId, st: &mut PulseState) {
    let hint = match st.hints.get(&id).copied() {
        // Every upstream refused to propagate; nothing to re-evaluate.
        None => {
            settle(id, false, false, st);
            return;
        }
        Some(hint) => hint,
    };

    if !consult_trigger(id, hint) {
        // The value is pulse-final, it just was not recomputed.
        settle(id, false, false, st);
        return;
    }

    match take_closure(id) {
        Some(Closure::Act(mut f)) => {
            f();
            put_back_closure(id, Closure::Act(f));
            settle(id, false, false, st);
        }
        Some(Closure::Compute(mut f)) => {
            let fresh = f();
            // Equality may be user code; run it with the engine released.
            let (eq, old) = with_engine(|e| match e.cells.get(&id) {
                Some(c) => (c.eq, c.slot.get()),
                None => (None, None),
            });
            let outgoing = match (eq, old.as_ref()) {
                (Some(eq), Some(old)) => !eq(old.as_ref(), fresh.as_ref()),
                _ => true,
            };
            drop(old);

            let stored = with_engine(|e| match e.cells.get_mut(&id) {
                Some(c) => {
                    c.closure = Some(Closure::Compute(f));
                    Ok(c.slot.store(fresh))
                }
                // Closed mid-pulse; nothing to store or propagate.
                None => Err((f, fresh)),
            });
            match stored {
                Ok(previous) => {
                    drop(previous);
                    settle(id, true, outgoing, st);
                }
                Err(leftover) => {
                    drop(leftover);
                    settle(id, false, false, st);
                }
            }
        }
        // Cell closed mid-pulse or a value cell wired as an observer.
        None => settle(id, false, false, st),
    }
}

// =============================================================================
// Close and invalidation
// =============================================================================

/// Close a cell: cascade over everything that transitively observes it.
/// During a pulse the cascade is deferred to pulse completion.
pub(crate) fn close_cell(id: NodeId) {
    let deferred = with_engine(|e| {
        if !e.cells.contains_key(&id) {
            return None;
        }
        if e.pulse_depth > 0 {
            e.pending_close.push(id);
            return Some(true);
        }
        Some(false)
    });
    match deferred {
        Some(true) => warn!(cell = %display_name(id), "close requested mid-pulse; deferred"),
        Some(false) => close_now(id),
        None => {}
    }
}

fn close_now(id: NodeId) {
    // Collect the cascade set, detach it from the graph, and take the
    // cells out; they are dropped after the borrow ends because dropping
    // a closure can drop captured handles that re-enter the engine.
    let removed: Vec<CellNode> = with_engine(|e| {
        let victims = e.graph.observer_closure(id);
        victims
            .iter()
            .filter_map(|v| {
                e.graph.remove(*v);
                e.cells.remove(v)
            })
            .collect()
    });
    // Field bookkeeping does not survive a close.
    field::forget_closed_cells();
    drop(removed);
}

pub(crate) fn add_weak_ref(id: NodeId) {
    with_engine(|e| {
        if let Some(c) = e.cells.get_mut(&id) {
            c.weak_count += 1;
        }
    });
}

/// Drop one weak reference; at zero, run the cell's invalidation strategy
/// exactly once and execute the action it returns.
pub(crate) fn release_weak_ref(id: NodeId) {
    let strategy: Option<Rc<dyn Invalidate>> = try_with_engine(|e| {
        let c = e.cells.get_mut(&id)?;
        c.weak_count = c.weak_count.saturating_sub(1);
        if c.weak_count == 0 {
            Some(c.invalidate.clone())
        } else {
            None
        }
    })
    .flatten();
    let Some(strategy) = strategy else { return };

    match strategy.on_invalid(id) {
        InvalidAction::Close => close_cell(id),
        InvalidAction::Keep => {}
        InvalidAction::FreezeLastValue => freeze_cell(id),
        InvalidAction::DetachField => {
            field::detach(id);
            close_cell(id);
        }
    }
}

/// Pin a cell at its current value: drop its inputs and swap the closure
/// for one returning the frozen value, so downstream observers keep
/// working against a constant input.
fn freeze_cell(id: NodeId) {
    let previous = with_engine(|e| {
        e.graph.unbind(id);
        match e.cells.get_mut(&id) {
            Some(c) => match c.slot.get() {
                Some(frozen) => c
                    .closure
                    .replace(Closure::Compute(Box::new(move || frozen.clone()))),
                None => None,
            },
            None => None,
        }
    });
    // The replaced closure may own captured handles; drop outside the borrow.
    drop(previous);
}

// =============================================================================
// Tests
// =============================================================================
