//! # cellflow
//!
//! Single-threaded reactive dataflow engine.
//!
//! Programs build a DAG of *cells* whose values recompute automatically
//! when their inputs change; side effects (*actions*) run on every
//! relevant change. Intended for embedding in UI, game-logic,
//! form-validation, or animation code.
//!
//! ## Architecture
//!
//! The engine is a thread-local singleton that strongly owns every cell.
//! Callers hold weak, counted handles; dropping the last handle runs the
//! cell's invalidation strategy. A write starts exactly one *pulse*:
//! observers fire in attach order, every cell runs at most once, and a
//! cell with several paths from the written root is deferred until all of
//! its inputs have settled, so closures only ever see pulse-final values.
//!
//! ```text
//! var / calc / action ──▶ engine (cells + graph) ──▶ pulse ──▶ observers
//! ```
//!
//! ## Example
//!
//! ```
//! use cellflow::{calc_with, var, reset_engine};
//!
//! reset_engine();
//! let a = var(1);
//! let b = var(3.14);
//! let s = calc_with(|x: i32, y: f64| format!("{x}|{y:.2}"), (&a, &b));
//! assert_eq!(s.get(), "1|3.14");
//!
//! a.set(2);
//! assert_eq!(s.get(), "2|3.14");
//! ```
//!
//! Capture-style binding discovers dependencies from what a closure
//! actually reads:
//!
//! ```
//! use cellflow::{calc, var, reset_engine};
//!
//! reset_engine();
//! let a = var(10);
//! let r = a.reader();
//! let doubled = calc(move || r.get() * 2);
//! assert_eq!(doubled.get(), 20);
//! ```
//!
//! ## Modules
//!
//! - [`api`] - constructors: `var`, `const_var`, `calc`, `action`, `expr_cell`, `field`
//! - [`handle`] - weak handles, readers, write operators
//! - [`trigger`] / [`invalidate`] - pluggable policies
//! - [`expr`] - arithmetic expression trees
//! - [`field`] - reactive fields of user aggregates
//! - [`engine`] - graph, pulse, capture sink
//!
//! ## Threading
//!
//! One engine per thread, all state in thread-local storage, no locking.
//! Handles are neither `Send` nor `Sync`; cross-thread sharing is not
//! supported.

pub mod api;
pub mod engine;
pub mod error;
pub mod expr;
pub mod field;
pub mod handle;
pub mod invalidate;
pub mod trigger;
pub mod types;

pub use api::{
    action, action_opts, action_with, action_with_opts, calc, calc_opts, calc_with,
    calc_with_opts, const_var, expr_cell, expr_cell_opts, field, var, var_opts, var_struct,
    DepFn, DepList,
};

pub use engine::{
    cell_count, dependents_of, is_open, is_repeat_dependent, observers_of, reset_engine,
};

pub use error::{AccessError, BindError};
pub use expr::{val, Expr};
pub use field::{Field, FieldOwner, FieldStruct};
pub use handle::{ActionHandle, CellValue, Handle, Reader};
pub use invalidate::{
    CloseStrategy, FieldStrategy, Invalidate, KeepStrategy, LastValueStrategy,
};
pub use trigger::{AlwaysTrigger, ChangeTrigger, ThresholdTrigger, Trigger};
pub use types::{AggregateId, CellKind, InvalidAction, NodeId};
