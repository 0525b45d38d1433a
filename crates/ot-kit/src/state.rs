//! Materialized replica state.

/// A mutable projection of a replica's state that operations are applied to.
///
/// One state object belongs to exactly one [`StateManager`](crate::StateManager).
pub trait OtState<D> {
    /// Reset to the empty state that root commits start from.
    fn init(&mut self);

    /// Apply a single operation.
    fn apply(&mut self, op: &D);
}

/// Apply `ops` in order.
pub fn replay<D, S: OtState<D> + ?Sized>(state: &mut S, ops: &[D]) {
    for op in ops {
        state.apply(op);
    }
}

/// Reset `state` and rebuild it from `ops`.
pub fn materialize<D, S: OtState<D> + ?Sized>(state: &mut S, ops: &[D]) {
    state.init();
    replay(state, ops);
}
