//! The operation algebra every domain plugs into.

use std::fmt;

use crate::error::TransformError;

/// Outcome of transforming two concurrent operation sequences.
///
/// Both inputs start from the same state. `left` carries the left input's
/// effect rebased so it can be applied *after* the right input, and `right`
/// carries the right input's effect rebased to apply after the left one:
///
/// ```text
/// state + left_input  + right  ==  state + right_input + left
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformResult<D> {
    /// Left effect, to be applied after the right input.
    pub left: Vec<D>,
    /// Right effect, to be applied after the left input.
    pub right: Vec<D>,
}

impl<D> TransformResult<D> {
    /// Build a result from both rebased sides.
    pub fn new(left: Vec<D>, right: Vec<D>) -> Self {
        Self { left, right }
    }

    /// Both sides already reach the same state.
    pub fn empty() -> Self {
        Self::new(Vec::new(), Vec::new())
    }

    /// The operations touch disjoint state and commute.
    pub fn independent(left: D, right: D) -> Self {
        Self::new(vec![left], vec![right])
    }

    /// Exchange the two sides, turning a result for `(a, b)` into one for `(b, a)`.
    #[must_use]
    pub fn swap(self) -> Self {
        Self::new(self.right, self.left)
    }
}

/// How two adjacent operations combine under [`OtSystem::squash_pair`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SquashResult<D> {
    /// The operations cannot be combined; keep both.
    Both,
    /// The pair is equivalent to this single operation.
    Single(D),
    /// The pair cancels out.
    Cancelled,
}

/// An operation algebra: transform, invert, squash and emptiness.
///
/// Implementors supply the pairwise rules; the provided methods lift them
/// to whole sequences.
///
/// # Laws
///
/// For operations `a`, `b` valid on the same state `S`:
/// - **Confluence:** `S + a + T(a, b).right == S + b + T(a, b).left`
/// - **Invertibility:** `S + a + invert(a) == S`
/// - **Squash equivalence:** `S + squash(ops) == S + ops`
pub trait OtSystem {
    /// The domain operation type.
    type Op: Clone + fmt::Debug;

    /// Transform two operations issued concurrently against the same state.
    fn transform_op(
        &self,
        left: &Self::Op,
        right: &Self::Op,
    ) -> Result<TransformResult<Self::Op>, TransformError>;

    /// The operation that undoes `op`.
    fn invert_op(&self, op: &Self::Op) -> Self::Op;

    /// Try to combine `first` followed by `second` into fewer operations.
    fn squash_pair(&self, first: &Self::Op, second: &Self::Op) -> SquashResult<Self::Op>;

    /// Whether `op` leaves every state unchanged.
    fn is_empty(&self, op: &Self::Op) -> bool;

    /// Transform two concurrent sequences.
    ///
    /// Empty operations are dropped first. Longer sequences are split on
    /// their first element and transformed recursively.
    fn transform(
        &self,
        left: &[Self::Op],
        right: &[Self::Op],
    ) -> Result<TransformResult<Self::Op>, TransformError> {
        let left: Vec<Self::Op> = left.iter().filter(|op| !self.is_empty(op)).cloned().collect();
        let right: Vec<Self::Op> = right.iter().filter(|op| !self.is_empty(op)).cloned().collect();
        transform_sequences(self, &left, &right)
    }

    /// Invert a sequence: reversed, each operation inverted.
    fn invert(&self, ops: &[Self::Op]) -> Vec<Self::Op> {
        ops.iter().rev().map(|op| self.invert_op(op)).collect()
    }

    /// Compact a sequence into an equivalent, no longer one.
    fn squash(&self, ops: &[Self::Op]) -> Vec<Self::Op> {
        let mut result: Vec<Self::Op> = Vec::with_capacity(ops.len());
        for op in ops {
            if self.is_empty(op) {
                continue;
            }
            let Some(last) = result.last() else {
                result.push(op.clone());
                continue;
            };
            match self.squash_pair(last, op) {
                SquashResult::Both => result.push(op.clone()),
                SquashResult::Single(combined) => {
                    result.pop();
                    if !self.is_empty(&combined) {
                        result.push(combined);
                    }
                }
                SquashResult::Cancelled => {
                    result.pop();
                }
            }
        }
        result
    }

    /// Whether every operation in `ops` is empty.
    fn all_empty(&self, ops: &[Self::Op]) -> bool {
        ops.iter().all(|op| self.is_empty(op))
    }
}

fn transform_sequences<S: OtSystem + ?Sized>(
    system: &S,
    left: &[S::Op],
    right: &[S::Op],
) -> Result<TransformResult<S::Op>, TransformError> {
    if left.is_empty() {
        return Ok(TransformResult::new(Vec::new(), right.to_vec()));
    }
    if right.is_empty() {
        return Ok(TransformResult::new(left.to_vec(), Vec::new()));
    }
    if left.len() == 1 && right.len() == 1 {
        return system.transform_op(&left[0], &right[0]);
    }
    if left.len() > 1 {
        // head of left against all of right, then the tail against what is left of right
        let head = transform_sequences(system, &left[..1], right)?;
        let tail = transform_sequences(system, &left[1..], &head.right)?;
        let mut rebased = head.left;
        rebased.extend(tail.left);
        return Ok(TransformResult::new(rebased, tail.right));
    }
    let head = transform_sequences(system, left, &right[..1])?;
    let tail = transform_sequences(system, &head.left, &right[1..])?;
    let mut rebased = head.right;
    rebased.extend(tail.right);
    Ok(TransformResult::new(tail.left, rebased))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counter::{CounterOp, CounterSystem};
    use crate::state::{replay, OtState};

    fn value_after(start: i64, ops: &[CounterOp]) -> i64 {
        let mut state = start;
        replay(&mut state, ops);
        state
    }

    #[test]
    fn transform_with_empty_side_passes_other_through() {
        let system = CounterSystem;
        let ops = vec![CounterOp::Add(3), CounterOp::Add(4)];
        let result = system.transform(&[], &ops).unwrap();
        assert!(result.left.is_empty());
        assert_eq!(result.right, ops);

        let result = system.transform(&ops, &[CounterOp::Add(0)]).unwrap();
        assert_eq!(result.left, ops);
        assert!(result.right.is_empty());
    }

    #[test]
    fn sequence_transform_converges() {
        let system = CounterSystem;
        let left = vec![
            CounterOp::Add(1),
            CounterOp::Set { prev: 1, next: 10 },
            CounterOp::Add(2),
        ];
        let right = vec![CounterOp::Add(5), CounterOp::Set { prev: 5, next: 7 }];
        let result = system.transform(&left, &right).unwrap();

        let mut via_left = value_after(0, &left);
        replay(&mut via_left, &result.right);
        let mut via_right = value_after(0, &right);
        replay(&mut via_right, &result.left);
        assert_eq!(via_left, via_right);
        // the larger set wins, the later add survives on top of it
        assert_eq!(via_left, 12);
    }

    #[test]
    fn invert_reverses_order() {
        let system = CounterSystem;
        let ops = vec![CounterOp::Add(2), CounterOp::Set { prev: 2, next: 9 }];
        let inverted = system.invert(&ops);
        assert_eq!(
            inverted,
            vec![CounterOp::Set { prev: 9, next: 2 }, CounterOp::Add(-2)]
        );
        let mut state = 0;
        replay(&mut state, &ops);
        replay(&mut state, &inverted);
        assert_eq!(state, 0);
    }

    #[test]
    fn squash_drops_cancelling_pairs() {
        let system = CounterSystem;
        let ops = vec![CounterOp::Add(4), CounterOp::Add(-4), CounterOp::Add(1)];
        assert_eq!(system.squash(&ops), vec![CounterOp::Add(1)]);
        assert!(system.squash(&[CounterOp::Add(0)]).is_empty());
    }

    #[test]
    fn swap_exchanges_sides() {
        let result = TransformResult::new(vec![1], vec![2, 3]).swap();
        assert_eq!(result, TransformResult::new(vec![2, 3], vec![1]));
    }

    #[test]
    fn independent_keeps_both() {
        let result = TransformResult::independent('l', 'r');
        assert_eq!(result.left, vec!['l']);
        assert_eq!(result.right, vec!['r']);
    }

    #[test]
    fn init_resets_counter() {
        let mut state = 42i64;
        state.init();
        assert_eq!(state, 0);
    }
}
