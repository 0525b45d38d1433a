//! A numeric register with relative and absolute updates.
//!
//! Useful on its own and as the simplest non-trivial algebra for exercising
//! the merge engine: additions commute, assignments conflict.
//!
//! Arithmetic wraps at the `i64` bounds, so every operation stays invertible.

use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::state::OtState;
use crate::system::{OtSystem, SquashResult, TransformResult};

/// An edit to an `i64` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CounterOp {
    /// Add a delta.
    Add(i64),
    /// Replace `prev` with `next`.
    Set {
        /// Value the register must hold before the assignment.
        prev: i64,
        /// Value after the assignment.
        next: i64,
    },
}

/// Algebra for [`CounterOp`].
///
/// Concurrent assignments resolve to the larger value, and an assignment
/// overrides a concurrent addition.
///
/// # Example
///
/// ```
/// use ot_kit::counter::{CounterOp, CounterSystem};
/// use ot_kit::OtSystem;
///
/// let result = CounterSystem
///     .transform(&[CounterOp::Add(2)], &[CounterOp::Add(3)])
///     .unwrap();
/// assert_eq!(result.left, vec![CounterOp::Add(2)]);
/// assert_eq!(result.right, vec![CounterOp::Add(3)]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterSystem;

impl OtSystem for CounterSystem {
    type Op = CounterOp;

    fn transform_op(
        &self,
        left: &CounterOp,
        right: &CounterOp,
    ) -> Result<TransformResult<CounterOp>, TransformError> {
        use CounterOp::{Add, Set};

        match (*left, *right) {
            (Add(_), Add(_)) => Ok(TransformResult::independent(*left, *right)),
            (Add(delta), Set { prev, next }) => Ok(TransformResult::new(
                Vec::new(),
                vec![Set {
                    prev: prev.wrapping_add(delta),
                    next,
                }],
            )),
            (Set { .. }, Add(_)) => Ok(self.transform_op(right, left)?.swap()),
            (Set { prev: lp, next: ln }, Set { prev: rp, next: rn }) => {
                if lp != rp {
                    return Err(TransformError::incompatible(format!(
                        "assignments from different values {lp} and {rp}"
                    )));
                }
                if ln == rn {
                    Ok(TransformResult::empty())
                } else if ln > rn {
                    Ok(TransformResult::new(vec![Set { prev: rn, next: ln }], Vec::new()))
                } else {
                    Ok(TransformResult::new(Vec::new(), vec![Set { prev: ln, next: rn }]))
                }
            }
        }
    }

    fn invert_op(&self, op: &CounterOp) -> CounterOp {
        match *op {
            CounterOp::Add(delta) => CounterOp::Add(delta.wrapping_neg()),
            CounterOp::Set { prev, next } => CounterOp::Set {
                prev: next,
                next: prev,
            },
        }
    }

    fn squash_pair(&self, first: &CounterOp, second: &CounterOp) -> SquashResult<CounterOp> {
        use CounterOp::{Add, Set};

        match (*first, *second) {
            (Add(a), Add(b)) => SquashResult::Single(Add(a.wrapping_add(b))),
            (Add(delta), Set { prev, next }) => SquashResult::Single(Set {
                prev: prev.wrapping_sub(delta),
                next,
            }),
            (Set { prev, next }, Add(delta)) => SquashResult::Single(Set {
                prev,
                next: next.wrapping_add(delta),
            }),
            (Set { prev, next: mid }, Set { prev: mid2, next }) if mid == mid2 => {
                SquashResult::Single(Set { prev, next })
            }
            (Set { .. }, Set { .. }) => SquashResult::Both,
        }
    }

    fn is_empty(&self, op: &CounterOp) -> bool {
        match *op {
            CounterOp::Add(delta) => delta == 0,
            CounterOp::Set { prev, next } => prev == next,
        }
    }
}

impl OtState<CounterOp> for i64 {
    fn init(&mut self) {
        *self = 0;
    }

    fn apply(&mut self, op: &CounterOp) {
        match *op {
            CounterOp::Add(delta) => *self = self.wrapping_add(delta),
            CounterOp::Set { next, .. } => *self = next,
        }
    }
}
