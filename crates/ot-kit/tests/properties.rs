//! Property tests for the operation algebra and the sync engine.
//!
//! Operations are generated from seeds replayed against a running state, so
//! every generated sequence is valid on the state it starts from.
//!
//! # Coverage
//!
//! - **Confluence**: concurrent sequences transformed against each other meet
//! - **Invertibility**: a sequence followed by its inverse is a no-op
//! - **Squash equivalence**: a squashed sequence has the same effect
//! - **Head invariant**: no head is an ancestor of another, under random
//!   interleavings of commit, push, sync and pull across replicas
//! - **Idempotent checkout**: checking out twice yields the same state

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use proptest::prelude::*;

use ot_kit::call::{CallInfo, CallOp, CallState, CallSystem};
use ot_kit::counter::{CounterOp, CounterSystem};
use ot_kit::prelude::*;
use ot_kit::replay;

// ---------------------------------------------------------------------------
// Counter strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum CounterSeed {
    Add(i64),
    Set(i64),
}

fn arb_counter_seed() -> impl Strategy<Value = CounterSeed> {
    prop_oneof![
        3 => (-50i64..50).prop_map(CounterSeed::Add),
        1 => (-100i64..100).prop_map(CounterSeed::Set),
    ]
}

fn counter_ops(start: i64, seeds: &[CounterSeed]) -> Vec<CounterOp> {
    let mut current = start;
    seeds
        .iter()
        .map(|seed| match *seed {
            CounterSeed::Add(delta) => {
                current += delta;
                CounterOp::Add(delta)
            }
            CounterSeed::Set(next) => {
                let op = CounterOp::Set {
                    prev: current,
                    next,
                };
                current = next;
                op
            }
        })
        .collect()
}

fn counter_after(start: i64, ops: &[CounterOp]) -> i64 {
    let mut state = start;
    replay(&mut state, ops);
    state
}

// ---------------------------------------------------------------------------
// Call strategies
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum CallSeed {
    Place { caller: u8, at: u64 },
    Withdraw,
    Drop { at: u64 },
    Answer { who: u8, answer: Option<bool> },
}

fn arb_call_seed() -> impl Strategy<Value = CallSeed> {
    prop_oneof![
        2 => (0u8..3, 0u64..40).prop_map(|(caller, at)| CallSeed::Place { caller, at }),
        1 => Just(CallSeed::Withdraw),
        1 => (0u64..40).prop_map(|at| CallSeed::Drop { at }),
        3 => (0u8..4, prop::option::of(any::<bool>()))
            .prop_map(|(who, answer)| CallSeed::Answer { who, answer }),
    ]
}

/// Turn seeds into operations valid on `start`; seeds that make no sense in
/// the running state are skipped.
fn call_ops(start: &CallState, seeds: &[CallSeed]) -> Vec<CallOp> {
    let mut state = start.clone();
    let mut ops = Vec::new();
    for seed in seeds {
        let op = match (seed, &state.call) {
            (CallSeed::Place { caller, at }, _) => CallOp::Call {
                prev: state.call.clone(),
                next: Some(CallInfo::new(format!("user{caller}"), u64::from(*caller), *at)),
            },
            (CallSeed::Withdraw, Some(call)) => CallOp::withdraw(call.clone()),
            (CallSeed::Drop { at }, Some(call)) => {
                CallOp::drop_call(call.clone(), state.handled.clone(), *at)
            }
            (CallSeed::Answer { who, answer }, Some(_)) => {
                let participant = format!("user{who}");
                CallOp::HandleCall {
                    prev: state.handled.get(&participant).copied(),
                    participant,
                    next: *answer,
                }
            }
            _ => continue,
        };
        state.apply(&op);
        ops.push(op);
    }
    ops
}

fn call_after(start: &CallState, ops: &[CallOp]) -> CallState {
    let mut state = start.clone();
    replay(&mut state, ops);
    state
}

// ---------------------------------------------------------------------------
// Algebra properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn counter_transform_is_confluent(
        start in -100i64..100,
        left in prop::collection::vec(arb_counter_seed(), 0..6),
        right in prop::collection::vec(arb_counter_seed(), 0..6),
    ) {
        let left = counter_ops(start, &left);
        let right = counter_ops(start, &right);
        let result = CounterSystem.transform(&left, &right).unwrap();

        let via_left = counter_after(counter_after(start, &left), &result.right);
        let via_right = counter_after(counter_after(start, &right), &result.left);
        prop_assert_eq!(via_left, via_right);
    }

    #[test]
    fn counter_inverse_restores_state(
        start in -100i64..100,
        seeds in prop::collection::vec(arb_counter_seed(), 0..8),
    ) {
        let ops = counter_ops(start, &seeds);
        let undo = CounterSystem.invert(&ops);
        prop_assert_eq!(counter_after(counter_after(start, &ops), &undo), start);
    }

    #[test]
    fn counter_squash_preserves_effect(
        start in -100i64..100,
        seeds in prop::collection::vec(arb_counter_seed(), 0..10),
    ) {
        let ops = counter_ops(start, &seeds);
        let squashed = CounterSystem.squash(&ops);
        prop_assert!(squashed.len() <= ops.len());
        prop_assert_eq!(counter_after(start, &squashed), counter_after(start, &ops));
    }

    #[test]
    fn call_transform_is_confluent(
        prefix in prop::collection::vec(arb_call_seed(), 0..5),
        left in prop::collection::vec(arb_call_seed(), 0..5),
        right in prop::collection::vec(arb_call_seed(), 0..5),
    ) {
        let start = call_after(&CallState::default(), &call_ops(&CallState::default(), &prefix));
        let left = call_ops(&start, &left);
        let right = call_ops(&start, &right);
        let result = CallSystem.transform(&left, &right).unwrap();

        let via_left = call_after(&call_after(&start, &left), &result.right);
        let via_right = call_after(&call_after(&start, &right), &result.left);
        prop_assert_eq!(via_left, via_right);
    }

    #[test]
    fn call_inverse_restores_state(
        prefix in prop::collection::vec(arb_call_seed(), 0..5),
        seeds in prop::collection::vec(arb_call_seed(), 0..8),
    ) {
        let start = call_after(&CallState::default(), &call_ops(&CallState::default(), &prefix));
        let ops = call_ops(&start, &seeds);
        let undo = CallSystem.invert(&ops);
        prop_assert_eq!(call_after(&call_after(&start, &ops), &undo), start);
    }

    #[test]
    fn call_squash_preserves_effect(
        prefix in prop::collection::vec(arb_call_seed(), 0..5),
        seeds in prop::collection::vec(arb_call_seed(), 0..8),
        undo in any::<bool>(),
    ) {
        let start = call_after(&CallState::default(), &call_ops(&CallState::default(), &prefix));
        let mut ops = call_ops(&start, &seeds);
        if undo {
            ops.extend(CallSystem.invert(&ops));
        }
        let squashed = CallSystem.squash(&ops);
        prop_assert!(squashed.len() <= ops.len());
        prop_assert_eq!(call_after(&start, &squashed), call_after(&start, &ops));
    }
}

// ---------------------------------------------------------------------------
// Replica schedules
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Step {
    Add(i64),
    Commit,
    Push,
    Sync,
    Pull,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        4 => (1i64..20).prop_map(Step::Add),
        1 => Just(Step::Commit),
        1 => Just(Step::Push),
        2 => Just(Step::Sync),
        1 => Just(Step::Pull),
    ]
}

type Replica = StateManager<CounterSystem, MemoryRepository<CounterOp>, i64>;

async fn run_schedule(replica_count: usize, schedule: Vec<(usize, Step)>) -> Result<(), OtError> {
    let repo = Arc::new(MemoryRepository::<CounterOp>::new());
    let root = repo.create_commit(BTreeMap::new(), 1).await?;
    let root_id = root.id;
    repo.push(vec![root]).await?;
    repo.update_heads(&BTreeSet::from([root_id]), &BTreeSet::new())
        .await?;

    let mut replicas: Vec<Replica> = Vec::new();
    for _ in 0..replica_count {
        let mut replica = StateManager::new(CounterSystem, repo.clone(), 0);
        replica.checkout().await?;
        replicas.push(replica);
    }

    let mut total = 0;
    for (index, step) in schedule {
        let replica = &mut replicas[index % replica_count];
        match step {
            Step::Add(delta) => {
                total += delta;
                replica.add(CounterOp::Add(delta))?;
            }
            Step::Commit => {
                replica.commit().await?;
            }
            Step::Push => replica.push().await?,
            Step::Sync => {
                replica.sync().await?;
            }
            Step::Pull => {
                replica.pull().await?;
            }
        }
        let heads = repo.get_heads().await?;
        let independent = replica.algorithms().exclude_parents(&heads).await?;
        assert_eq!(independent, heads, "a head descends from another head");
    }

    for replica in &mut replicas {
        replica.sync().await?;
    }
    let head = replicas[0].algorithms().merge_heads_and_push().await?;
    for replica in &mut replicas {
        replica.pull().await?;
        assert_eq!(replica.revision(), Some(head));
        assert_eq!(*replica.state(), total);
    }

    let mut fresh = StateManager::new(CounterSystem, repo.clone(), 0);
    fresh.checkout().await?;
    let first = *fresh.state();
    fresh.checkout().await?;
    assert_eq!(*fresh.state(), first);
    assert_eq!(first, total);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn replicas_converge_under_any_schedule(
        replica_count in 1usize..4,
        schedule in prop::collection::vec((0usize..4, arb_step()), 0..24),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        runtime.block_on(run_schedule(replica_count, schedule)).unwrap();
    }
}
