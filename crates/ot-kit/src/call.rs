//! Call signaling for a chat room.
//!
//! A room holds at most one active call. Participants accept or reject it,
//! and anyone may drop it. Concurrent edits resolve with fixed precedence:
//!
//! | Left \ Right | `Call`                  | `DropCall`              | `HandleCall`            |
//! |--------------|-------------------------|-------------------------|-------------------------|
//! | `Call`       | newer call wins         | placing a call wins     | independent             |
//! | `DropCall`   | drop beats a withdrawal | same call, same outcome | drop wins               |
//! | `HandleCall` | independent             | drop wins               | accept > reject > none  |
//!
//! Every winning side is rewritten into a direct edit from the loser's
//! result, so transformed sequences never grow undo chains.
//!
//! # Example
//!
//! ```
//! use ot_kit::call::{CallInfo, CallOp, CallState, CallSystem};
//! use ot_kit::{replay, OtSystem};
//!
//! let first = CallOp::call(None, CallInfo::new("alice", 1, 100));
//! let second = CallOp::call(None, CallInfo::new("bob", 2, 200));
//! let result = CallSystem.transform(&[first.clone()], &[second.clone()]).unwrap();
//!
//! let mut a = CallState::default();
//! replay(&mut a, &[first]);
//! replay(&mut a, &result.right);
//!
//! let mut b = CallState::default();
//! replay(&mut b, &[second]);
//! replay(&mut b, &result.left);
//!
//! assert_eq!(a, b);
//! assert_eq!(a.call.unwrap().caller, "bob");
//! ```

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::TransformError;
use crate::state::OtState;
use crate::system::{OtSystem, SquashResult, TransformResult};

/// The call currently ringing in a room.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallInfo {
    /// User who placed the call.
    pub caller: String,
    /// Transport peer of the caller.
    pub peer_id: u64,
    /// When the call was placed, in milliseconds.
    pub timestamp: u64,
}

impl CallInfo {
    /// Describe a call.
    pub fn new(caller: impl Into<String>, peer_id: u64, timestamp: u64) -> Self {
        Self {
            caller: caller.into(),
            peer_id,
            timestamp,
        }
    }
}

impl Ord for CallInfo {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.caller.cmp(&other.caller))
            .then_with(|| self.peer_id.cmp(&other.peer_id))
    }
}

impl PartialOrd for CallInfo {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Materialized call state of a room.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallState {
    /// The active call, if any.
    pub call: Option<CallInfo>,
    /// Per participant: `true` accepted, `false` rejected.
    pub handled: BTreeMap<String, bool>,
}

/// An edit to a room's call state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallOp {
    /// Replace the active call `prev` with `next`. `next: None` withdraws it.
    Call {
        /// Call expected before the edit.
        prev: Option<CallInfo>,
        /// Call after the edit.
        next: Option<CallInfo>,
    },
    /// End the active call and forget who handled it.
    ///
    /// The inverted form restores both and expects a room with no call and
    /// no answers, which is what a drop leaves behind.
    DropCall {
        /// Call being dropped.
        call: CallInfo,
        /// Handled map at the time of the drop.
        handled: BTreeMap<String, bool>,
        /// When the drop happened, in milliseconds.
        dropped_at: u64,
        /// Whether this is the undo of a drop.
        inverted: bool,
    },
    /// Change one participant's answer.
    HandleCall {
        /// Participant answering.
        participant: String,
        /// Answer before the edit.
        prev: Option<bool>,
        /// Answer after the edit.
        next: Option<bool>,
    },
}

impl CallOp {
    /// Place `next` over the currently active `prev`.
    pub fn call(prev: Option<CallInfo>, next: CallInfo) -> Self {
        Self::Call {
            prev,
            next: Some(next),
        }
    }

    /// Withdraw the active call without recording a drop.
    pub fn withdraw(prev: CallInfo) -> Self {
        Self::Call {
            prev: Some(prev),
            next: None,
        }
    }

    /// Drop `call`, given the handled map it currently has.
    pub fn drop_call(call: CallInfo, handled: BTreeMap<String, bool>, dropped_at: u64) -> Self {
        Self::DropCall {
            call,
            handled,
            dropped_at,
            inverted: false,
        }
    }

    /// `participant` accepts the call.
    pub fn accept(participant: impl Into<String>, prev: Option<bool>) -> Self {
        Self::HandleCall {
            participant: participant.into(),
            prev,
            next: Some(true),
        }
    }

    /// `participant` rejects the call.
    pub fn reject(participant: impl Into<String>, prev: Option<bool>) -> Self {
        Self::HandleCall {
            participant: participant.into(),
            prev,
            next: Some(false),
        }
    }

    /// The inverse operation.
    #[must_use]
    pub fn invert(&self) -> Self {
        match self {
            Self::Call { prev, next } => Self::Call {
                prev: next.clone(),
                next: prev.clone(),
            },
            Self::DropCall {
                call,
                handled,
                dropped_at,
                inverted,
            } => Self::DropCall {
                call: call.clone(),
                handled: handled.clone(),
                dropped_at: *dropped_at,
                inverted: !inverted,
            },
            Self::HandleCall {
                participant,
                prev,
                next,
            } => Self::HandleCall {
                participant: participant.clone(),
                prev: *next,
                next: *prev,
            },
        }
    }
}

/// Algebra for [`CallOp`].
#[derive(Debug, Clone, Copy, Default)]
pub struct CallSystem;

/// accept > reject > no answer
fn answer_rank(answer: Option<bool>) -> u8 {
    match answer {
        Some(true) => 2,
        Some(false) => 1,
        None => 0,
    }
}

/// Answers that turn the `from` handled map into `to`.
fn rewrite_handled(from: &BTreeMap<String, bool>, to: &BTreeMap<String, bool>) -> Vec<CallOp> {
    let participants: BTreeSet<&String> = from.keys().chain(to.keys()).collect();
    participants
        .into_iter()
        .filter_map(|participant| {
            let prev = from.get(participant).copied();
            let next = to.get(participant).copied();
            (prev != next).then(|| CallOp::HandleCall {
                participant: participant.clone(),
                prev,
                next,
            })
        })
        .collect()
}

/// Turn a room restored to `from_call` into one restored to `to_call`.
fn restore_over(
    from_call: &CallInfo,
    from: &BTreeMap<String, bool>,
    to_call: &CallInfo,
    to: &BTreeMap<String, bool>,
) -> Vec<CallOp> {
    let mut ops = Vec::new();
    if from_call != to_call {
        ops.push(CallOp::Call {
            prev: Some(from_call.clone()),
            next: Some(to_call.clone()),
        });
    }
    ops.extend(rewrite_handled(from, to));
    ops
}

impl CallSystem {
    fn call_vs_call(
        left: &CallOp,
        right: &CallOp,
        (lp, ln): (&Option<CallInfo>, &Option<CallInfo>),
        (rp, rn): (&Option<CallInfo>, &Option<CallInfo>),
    ) -> Result<TransformResult<CallOp>, TransformError> {
        if lp != rp {
            return Err(TransformError::incompatible(format!(
                "calls replace different active calls: {left:?} / {right:?}"
            )));
        }
        Ok(match ln.cmp(rn) {
            Ordering::Equal => TransformResult::empty(),
            Ordering::Greater => TransformResult::new(
                vec![CallOp::Call {
                    prev: rn.clone(),
                    next: ln.clone(),
                }],
                Vec::new(),
            ),
            Ordering::Less => TransformResult::new(
                Vec::new(),
                vec![CallOp::Call {
                    prev: ln.clone(),
                    next: rn.clone(),
                }],
            ),
        })
    }

    fn call_vs_drop(
        left: &CallOp,
        right: &CallOp,
    ) -> Result<TransformResult<CallOp>, TransformError> {
        let (
            CallOp::Call { prev, next },
            CallOp::DropCall {
                call,
                handled,
                inverted,
                ..
            },
        ) = (left, right)
        else {
            return Err(TransformError::unsupported(left, right));
        };
        let nobody = BTreeMap::new();
        match (next, inverted) {
            // the new call lands on the dropped room and picks the answers back up
            (Some(_), false) => {
                let mut rebased = vec![CallOp::Call {
                    prev: None,
                    next: next.clone(),
                }];
                rebased.extend(rewrite_handled(&nobody, handled));
                Ok(TransformResult::new(rebased, Vec::new()))
            }
            // a withdrawal loses to the drop, which also clears the answers
            (None, false) => Ok(TransformResult::new(
                Vec::new(),
                rewrite_handled(handled, &nobody),
            )),
            (_, true) if prev.is_some() => Err(TransformError::incompatible(format!(
                "a restore needs an empty room: {left:?} / {right:?}"
            ))),
            (Some(_), true) => {
                let mut rebased = vec![CallOp::Call {
                    prev: Some(call.clone()),
                    next: next.clone(),
                }];
                rebased.extend(rewrite_handled(handled, &nobody));
                Ok(TransformResult::new(rebased, Vec::new()))
            }
            (None, true) => Ok(TransformResult::new(Vec::new(), vec![right.clone()])),
        }
    }

    fn drop_vs_drop(
        left: &CallOp,
        right: &CallOp,
    ) -> Result<TransformResult<CallOp>, TransformError> {
        let (
            CallOp::DropCall {
                call: lc,
                handled: lh,
                dropped_at: lt,
                inverted: li,
            },
            CallOp::DropCall {
                call: rc,
                handled: rh,
                dropped_at: rt,
                inverted: ri,
            },
        ) = (left, right)
        else {
            return Err(TransformError::unsupported(left, right));
        };
        if left == right {
            return Ok(TransformResult::empty());
        }
        if li != ri {
            return Err(TransformError::incompatible(format!(
                "a drop and a restore cannot share a state: {left:?} / {right:?}"
            )));
        }
        if !li {
            // both end the same call; whichever came first, the room ends up empty
            if lc != rc {
                return Err(TransformError::incompatible(format!(
                    "drops of different calls: {left:?} / {right:?}"
                )));
            }
            return Ok(TransformResult::empty());
        }
        // two restores: the newer call comes back with its answers
        Ok(if (rc, rt) < (lc, lt) {
            TransformResult::new(restore_over(rc, rh, lc, lh), Vec::new())
        } else {
            TransformResult::new(Vec::new(), restore_over(lc, lh, rc, rh))
        })
    }

    fn drop_vs_handle(
        left: &CallOp,
        right: &CallOp,
    ) -> Result<TransformResult<CallOp>, TransformError> {
        let (
            CallOp::DropCall {
                call,
                handled,
                dropped_at,
                inverted,
            },
            CallOp::HandleCall {
                participant, next, ..
            },
        ) = (left, right)
        else {
            return Err(TransformError::unsupported(left, right));
        };
        if *inverted {
            // a restore overwrites every answer
            return Ok(TransformResult::new(vec![left.clone()], Vec::new()));
        }
        let mut handled = handled.clone();
        match next {
            Some(answer) => handled.insert(participant.clone(), *answer),
            None => handled.remove(participant),
        };
        Ok(TransformResult::new(
            vec![CallOp::DropCall {
                call: call.clone(),
                handled,
                dropped_at: *dropped_at,
                inverted: false,
            }],
            Vec::new(),
        ))
    }
}

impl OtSystem for CallSystem {
    type Op = CallOp;

    fn transform_op(
        &self,
        left: &CallOp,
        right: &CallOp,
    ) -> Result<TransformResult<CallOp>, TransformError> {
        match (left, right) {
            (CallOp::Call { prev: lp, next: ln }, CallOp::Call { prev: rp, next: rn }) => {
                Self::call_vs_call(left, right, (lp, ln), (rp, rn))
            }
            (CallOp::Call { .. }, CallOp::DropCall { .. }) => Self::call_vs_drop(left, right),
            (CallOp::Call { .. }, CallOp::HandleCall { .. }) => {
                Ok(TransformResult::independent(left.clone(), right.clone()))
            }
            (CallOp::DropCall { .. }, CallOp::DropCall { .. }) => Self::drop_vs_drop(left, right),
            (CallOp::DropCall { .. }, CallOp::HandleCall { .. }) => {
                Self::drop_vs_handle(left, right)
            }
            (
                CallOp::HandleCall {
                    participant: lu,
                    prev: lp,
                    next: ln,
                },
                CallOp::HandleCall {
                    participant: ru,
                    prev: rp,
                    next: rn,
                },
            ) => {
                if lu != ru {
                    return Ok(TransformResult::independent(left.clone(), right.clone()));
                }
                if lp != rp {
                    return Err(TransformError::incompatible(format!(
                        "answers from different previous answers: {left:?} / {right:?}"
                    )));
                }
                let answer = |prev: &Option<bool>, next: &Option<bool>| CallOp::HandleCall {
                    participant: lu.clone(),
                    prev: *prev,
                    next: *next,
                };
                Ok(match answer_rank(*ln).cmp(&answer_rank(*rn)) {
                    Ordering::Equal => TransformResult::empty(),
                    Ordering::Greater => TransformResult::new(vec![answer(rn, ln)], Vec::new()),
                    Ordering::Less => TransformResult::new(Vec::new(), vec![answer(ln, rn)]),
                })
            }
            (CallOp::DropCall { .. }, CallOp::Call { .. })
            | (CallOp::HandleCall { .. }, CallOp::Call { .. })
            | (CallOp::HandleCall { .. }, CallOp::DropCall { .. }) => {
                Ok(self.transform_op(right, left)?.swap())
            }
        }
    }

    fn invert_op(&self, op: &CallOp) -> CallOp {
        op.invert()
    }

    fn squash_pair(&self, first: &CallOp, second: &CallOp) -> SquashResult<CallOp> {
        match (first, second) {
            (CallOp::Call { prev, next: mid }, CallOp::Call { prev: mid2, next }) if mid == mid2 => {
                SquashResult::Single(CallOp::Call {
                    prev: prev.clone(),
                    next: next.clone(),
                })
            }
            (
                CallOp::HandleCall {
                    participant: first_user,
                    prev,
                    next: mid,
                },
                CallOp::HandleCall {
                    participant: second_user,
                    prev: mid2,
                    next,
                },
            ) if first_user == second_user && mid == mid2 => {
                SquashResult::Single(CallOp::HandleCall {
                    participant: first_user.clone(),
                    prev: *prev,
                    next: *next,
                })
            }
            (
                CallOp::DropCall {
                    inverted: false, ..
                },
                CallOp::DropCall { inverted: true, .. },
            ) if first.invert() == *second => SquashResult::Cancelled,
            _ => SquashResult::Both,
        }
    }

    fn is_empty(&self, op: &CallOp) -> bool {
        match op {
            CallOp::Call { prev, next } => prev == next,
            CallOp::HandleCall { prev, next, .. } => prev == next,
            CallOp::DropCall { .. } => false,
        }
    }
}

impl OtState<CallOp> for CallState {
    fn init(&mut self) {
        self.call = None;
        self.handled.clear();
    }

    fn apply(&mut self, op: &CallOp) {
        match op {
            CallOp::Call { next, .. } => self.call = next.clone(),
            CallOp::DropCall {
                call,
                handled,
                inverted,
                ..
            } => {
                if *inverted {
                    self.call = Some(call.clone());
                    self.handled = handled.clone();
                } else {
                    self.call = None;
                    self.handled.clear();
                }
            }
            CallOp::HandleCall {
                participant, next, ..
            } => match next {
                Some(answer) => {
                    self.handled.insert(participant.clone(), *answer);
                }
                None => {
                    self.handled.remove(participant);
                }
            },
        }
    }
}
