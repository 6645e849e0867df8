//! Capture sink - dependency discovery for capture-style binding.
//!
//! When a computed or action cell is bound from a nullary closure, the
//! engine cannot see which cells the closure reads. The capture sink is a
//! small piece of thread-local state installed around the closure's first
//! evaluation: every tracked handle read during that window records its
//! node id here, and the recorded set becomes the cell's dependent list.
//!
//! Sinks nest: a `calc` constructed inside another cell's closure gets its
//! own recording window, and the outer window resumes afterwards.

use std::cell::RefCell;

use crate::types::NodeId;

thread_local! {
    /// Stack of active recording windows. Innermost last.
    static SINKS: RefCell<Vec<Vec<NodeId>>> = const { RefCell::new(Vec::new()) };
}

/// Run `f` with a fresh recording window and return its result together
/// with the node ids read during the evaluation, in first-read order and
/// with duplicates removed.
pub(crate) fn record<R>(f: impl FnOnce() -> R) -> (R, Vec<NodeId>) {
    SINKS.with(|s| s.borrow_mut().push(Vec::new()));
    let out = f();
    let reads = SINKS.with(|s| {
        s.borrow_mut()
            .pop()
            .expect("capture sink stack underflow")
    });
    (out, reads)
}

/// Note a tracked read into the innermost window, if one is active.
///
/// No-op outside a recording window, so ordinary reads cost one
/// thread-local lookup. Field sub-cells never call this: their reactivity
/// routes through the enclosing container cell.
pub(crate) fn note_read(id: NodeId) {
    SINKS.with(|s| {
        if let Some(sink) = s.borrow_mut().last_mut() {
            if !sink.contains(&id) {
                sink.push(id);
            }
        }
    });
}

/// Whether a recording window is currently active.
#[cfg(test)]
pub(crate) fn is_recording() -> bool {
    SINKS.with(|s| !s.borrow().is_empty())
}

/// Drop any open windows. Test support, called from `reset_engine`.
pub(crate) fn reset() {
    SINKS.with(|s| s.borrow_mut().clear());
}
