//! Typed errors returned by bind and rebind operations.
//!
//! The engine never panics inside a pulse on behalf of graph violations:
//! a bind that would corrupt the graph is rejected as a value before any
//! state changes. Reads through a dead handle are the one runtime fault
//! (see [`Handle::get`](crate::handle::Handle::get)); everything else is
//! a `Result`.

use thiserror::Error;

/// A bind or rebind was rejected. The cell keeps its prior bindings.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BindError {
    /// The proposed dependency set would create a cycle, including the
    /// degenerate self-edge. Nothing was committed.
    #[error("binding `{cell}` to `{target}` would create a dependency cycle")]
    CycleDependency {
        /// Debug name (or id) of the cell being bound.
        cell: String,
        /// Debug name (or id) of the offending target.
        target: String,
    },

    /// A rebind closure produces a value of a different type than the cell
    /// was constructed with. The value type of a cell is fixed for life.
    #[error("rebind closure returns `{found}` but the cell holds `{expected}`")]
    ReturnTypeMismatch {
        /// Type name the cell was constructed with.
        expected: &'static str,
        /// Type name the rejected closure produces.
        found: &'static str,
    },
}

/// A checked access through a handle failed.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The handle's referent was closed or destroyed.
    #[error("cell handle is closed")]
    ClosedHandle,
}
