//! Product composition of two algebras.
//!
//! [`MergedSystem`] lets one commit graph carry two independent domains,
//! for example a room's call state next to a message counter. Each
//! operation holds a sequence for either side; every algebra function acts
//! on both components separately.

use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::state::{replay, OtState};
use crate::system::{OtSystem, SquashResult, TransformResult};

/// An operation of a [`MergedSystem`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedOp<A, B> {
    /// Operations for the first system.
    pub first: Vec<A>,
    /// Operations for the second system.
    pub second: Vec<B>,
}

impl<A, B> MergedOp<A, B> {
    /// Combine operations for both sides.
    pub fn new(first: Vec<A>, second: Vec<B>) -> Self {
        Self { first, second }
    }

    /// An operation touching only the first side.
    pub fn first(ops: Vec<A>) -> Self {
        Self::new(ops, Vec::new())
    }

    /// An operation touching only the second side.
    pub fn second(ops: Vec<B>) -> Self {
        Self::new(Vec::new(), ops)
    }
}

/// Two algebras side by side.
///
/// # Example
///
/// ```
/// use ot_kit::call::{CallInfo, CallOp, CallSystem};
/// use ot_kit::counter::{CounterOp, CounterSystem};
/// use ot_kit::{MergedOp, MergedSystem, OtSystem};
///
/// let system = MergedSystem::new(CallSystem, CounterSystem);
/// let left = MergedOp::new(vec![CallOp::call(None, CallInfo::new("a", 1, 10))], vec![CounterOp::Add(1)]);
/// let right = MergedOp::second(vec![CounterOp::Add(2)]);
///
/// let result = system.transform(&[left], &[right]).unwrap();
/// assert_eq!(result.right[0].second, vec![CounterOp::Add(2)]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MergedSystem<A, B> {
    first: A,
    second: B,
}

impl<A, B> MergedSystem<A, B> {
    /// Pair two systems.
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A, B> OtSystem for MergedSystem<A, B>
where
    A: OtSystem,
    B: OtSystem,
{
    type Op = MergedOp<A::Op, B::Op>;

    fn transform_op(
        &self,
        left: &Self::Op,
        right: &Self::Op,
    ) -> Result<TransformResult<Self::Op>, TransformError> {
        let first = self.first.transform(&left.first, &right.first)?;
        let second = self.second.transform(&left.second, &right.second)?;
        let wrap = |a: Vec<A::Op>, b: Vec<B::Op>| {
            if a.is_empty() && b.is_empty() {
                Vec::new()
            } else {
                vec![MergedOp::new(a, b)]
            }
        };
        Ok(TransformResult::new(
            wrap(first.left, second.left),
            wrap(first.right, second.right),
        ))
    }

    fn invert_op(&self, op: &Self::Op) -> Self::Op {
        MergedOp::new(self.first.invert(&op.first), self.second.invert(&op.second))
    }

    fn squash_pair(&self, first: &Self::Op, second: &Self::Op) -> SquashResult<Self::Op> {
        let mut a = first.first.clone();
        a.extend(second.first.iter().cloned());
        let mut b = first.second.clone();
        b.extend(second.second.iter().cloned());
        let combined = MergedOp::new(self.first.squash(&a), self.second.squash(&b));
        if combined.first.is_empty() && combined.second.is_empty() {
            SquashResult::Cancelled
        } else {
            SquashResult::Single(combined)
        }
    }

    fn is_empty(&self, op: &Self::Op) -> bool {
        self.first.all_empty(&op.first) && self.second.all_empty(&op.second)
    }
}

/// State of a [`MergedSystem`]: one state per side.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergedState<SA, SB> {
    /// State of the first system.
    pub first: SA,
    /// State of the second system.
    pub second: SB,
}

impl<A, B, SA, SB> OtState<MergedOp<A, B>> for MergedState<SA, SB>
where
    SA: OtState<A>,
    SB: OtState<B>,
{
    fn init(&mut self) {
        self.first.init();
        self.second.init();
    }

    fn apply(&mut self, op: &MergedOp<A, B>) {
        replay(&mut self.first, &op.first);
        replay(&mut self.second, &op.second);
    }
}
