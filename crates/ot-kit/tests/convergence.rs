//! Integration tests driving several replicas through a shared repository.
//!
//! Every replica owns its own [`StateManager`]; the repository is the only
//! thing they share. After everyone has synced and pulled, all replicas must
//! hold the same materialized state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use ot_kit::call::{CallInfo, CallOp, CallState, CallSystem};
use ot_kit::counter::{CounterOp, CounterSystem};
use ot_kit::prelude::*;
use ot_kit::{ManagerStatus, MergedOp, MergedState, MergedSystem, OtAlgorithms};

async fn seeded<D>(repo: MemoryRepository<D>) -> Arc<MemoryRepository<D>>
where
    D: Clone + Send + Sync + 'static,
{
    let root = repo.create_commit(BTreeMap::new(), 1).await.unwrap();
    let id = root.id;
    repo.push(vec![root]).await.unwrap();
    repo.update_heads(&BTreeSet::from([id]), &BTreeSet::new())
        .await
        .unwrap();
    Arc::new(repo)
}

fn user1() -> CallInfo {
    CallInfo::new("user1", 1, 100)
}

fn user2() -> CallInfo {
    CallInfo::new("user2", 2, 200)
}

type CallReplica = StateManager<CallSystem, MemoryRepository<CallOp>, CallState>;
type CounterReplica = StateManager<CounterSystem, MemoryRepository<CounterOp>, i64>;

async fn call_replica(repo: &Arc<MemoryRepository<CallOp>>) -> CallReplica {
    let mut replica = StateManager::new(CallSystem, repo.clone(), CallState::default());
    replica.checkout().await.unwrap();
    replica
}

async fn counter_replica(repo: &Arc<MemoryRepository<CounterOp>>) -> CounterReplica {
    let mut replica = StateManager::new(CounterSystem, repo.clone(), 0);
    replica.checkout().await.unwrap();
    replica
}

// ---------------------------------------------------------------------------
// Call signaling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn concurrent_calls_converge_on_newer_call() {
    let repo = seeded(MemoryRepository::<CallOp>::new()).await;
    let mut a = call_replica(&repo).await;
    let mut b = call_replica(&repo).await;

    a.add(CallOp::call(None, user1())).unwrap();
    b.add(CallOp::call(None, user2())).unwrap();
    a.sync().await.unwrap();
    let merged = b.sync().await.unwrap();
    assert!(a.pull().await.unwrap());

    assert_eq!(a.revision(), Some(merged));
    assert_eq!(b.revision(), Some(merged));
    assert_eq!(a.state(), b.state());
    assert_eq!(a.state().call, Some(user2()));
    assert_eq!(repo.get_heads().await.unwrap(), BTreeSet::from([merged]));
}

#[tokio::test]
async fn drop_wins_over_concurrent_accept() {
    let repo = seeded(MemoryRepository::<CallOp>::new()).await;
    let mut a = call_replica(&repo).await;
    a.add(CallOp::call(None, user1())).unwrap();
    a.sync().await.unwrap();
    let mut b = call_replica(&repo).await;
    assert_eq!(b.state().call, Some(user1()));

    a.add(CallOp::drop_call(user1(), BTreeMap::new(), 200)).unwrap();
    b.add(CallOp::accept("user1", None)).unwrap();
    a.sync().await.unwrap();
    b.sync().await.unwrap();
    a.pull().await.unwrap();

    assert_eq!(*a.state(), CallState::default());
    assert_eq!(*b.state(), CallState::default());
}

#[tokio::test]
async fn independent_edits_merge_into_union() {
    type Room = MergedSystem<CallSystem, CounterSystem>;
    type RoomOp = MergedOp<CallOp, CounterOp>;
    type RoomState = MergedState<CallState, i64>;

    let repo = seeded(MemoryRepository::<RoomOp>::new()).await;
    let room = || Room::new(CallSystem, CounterSystem);
    let mut a = StateManager::new(room(), repo.clone(), RoomState::default());
    let mut b = StateManager::new(room(), repo.clone(), RoomState::default());
    let base = a.checkout().await.unwrap();
    b.checkout().await.unwrap();

    a.add(RoomOp::first(vec![CallOp::call(None, user1())])).unwrap();
    b.add(RoomOp::second(vec![CounterOp::Add(7)])).unwrap();
    let a_commit = a.sync().await.unwrap();
    let merge = b.sync().await.unwrap();
    a.pull().await.unwrap();

    let commit = repo.load_commit(merge).await.unwrap();
    assert_eq!(commit.parents.len(), 2);
    assert!(commit.parents.contains_key(&a_commit));
    assert!(!commit.parents.contains_key(&base));
    assert_eq!(commit.level, 3);

    for replica in [&a, &b] {
        assert_eq!(replica.state().first.call, Some(user1()));
        assert_eq!(replica.state().second, 7);
    }
}

#[tokio::test]
async fn accept_and_reject_from_different_participants_are_kept() {
    let repo = seeded(MemoryRepository::<CallOp>::new()).await;
    let mut a = call_replica(&repo).await;
    a.add(CallOp::call(None, user1())).unwrap();
    a.sync().await.unwrap();
    let mut b = call_replica(&repo).await;
    let mut c = call_replica(&repo).await;

    b.add(CallOp::accept("carol", None)).unwrap();
    c.add(CallOp::reject("dave", None)).unwrap();
    a.add(CallOp::reject("carol", None)).unwrap();
    for replica in [&mut a, &mut b, &mut c] {
        replica.sync().await.unwrap();
    }
    for replica in [&mut a, &mut b, &mut c] {
        replica.pull().await.unwrap();
    }

    let expected: BTreeMap<String, bool> =
        [("carol".to_string(), true), ("dave".to_string(), false)].into();
    for replica in [&a, &b, &c] {
        assert_eq!(replica.state().handled, expected);
        assert_eq!(replica.state().call, Some(user1()));
    }
}

// ---------------------------------------------------------------------------
// Counter replicas
// ---------------------------------------------------------------------------

#[tokio::test]
async fn three_replicas_converge() {
    let repo = seeded(MemoryRepository::<CounterOp>::new()).await;
    let mut a = counter_replica(&repo).await;
    let mut b = counter_replica(&repo).await;
    let mut c = counter_replica(&repo).await;

    a.add(CounterOp::Add(1)).unwrap();
    b.add(CounterOp::Add(20)).unwrap();
    c.add(CounterOp::Add(300)).unwrap();
    a.sync().await.unwrap();
    b.sync().await.unwrap();
    c.sync().await.unwrap();
    a.pull().await.unwrap();
    b.pull().await.unwrap();

    for replica in [&a, &b, &c] {
        assert_eq!(*replica.state(), 321);
        assert_eq!(replica.revision(), c.revision());
    }
    assert_eq!(repo.get_heads().await.unwrap().len(), 1);
}

#[tokio::test]
async fn larger_assignment_wins_and_additions_follow() {
    let repo = seeded(MemoryRepository::<CounterOp>::new()).await;
    let mut a = counter_replica(&repo).await;
    let mut b = counter_replica(&repo).await;

    a.add_all([CounterOp::Set { prev: 0, next: 50 }, CounterOp::Add(1)])
        .unwrap();
    b.add_all([CounterOp::Add(4), CounterOp::Set { prev: 4, next: 10 }])
        .unwrap();
    a.sync().await.unwrap();
    b.sync().await.unwrap();
    a.pull().await.unwrap();

    assert_eq!(a.state(), b.state());
    assert_eq!(*a.state(), 51);
}

#[tokio::test]
async fn local_work_survives_pull() {
    let repo = seeded(MemoryRepository::<CounterOp>::new()).await;
    let mut a = counter_replica(&repo).await;
    let mut b = counter_replica(&repo).await;

    a.add(CounterOp::Add(5)).unwrap();
    a.sync().await.unwrap();

    b.add(CounterOp::Add(2)).unwrap();
    assert!(b.pull().await.unwrap());
    assert_eq!(*b.state(), 7);
    assert_eq!(b.working(), &[CounterOp::Add(2)]);

    b.sync().await.unwrap();
    a.pull().await.unwrap();
    assert_eq!(*a.state(), 7);
    assert!(!b.has_pending_changes());
}

#[tokio::test]
async fn checkout_twice_is_identical() {
    let repo = seeded(MemoryRepository::<CounterOp>::new()).await;
    let mut a = counter_replica(&repo).await;
    let mut b = counter_replica(&repo).await;
    a.add(CounterOp::Add(3)).unwrap();
    b.add(CounterOp::Set { prev: 0, next: 8 }).unwrap();
    a.sync().await.unwrap();
    b.sync().await.unwrap();

    let mut fresh = counter_replica(&repo).await;
    let first = *fresh.state();
    let head = fresh.checkout().await.unwrap();
    assert_eq!(*fresh.state(), first);
    assert_eq!(fresh.revision(), Some(head));
    // the assignment beats the concurrent addition
    assert_eq!(first, 8);
}

#[tokio::test]
async fn snapshot_shortens_checkout() {
    let repo = seeded(MemoryRepository::<CounterOp>::new()).await;
    let mut a = counter_replica(&repo).await;
    for delta in 1..=4 {
        a.add(CounterOp::Add(delta)).unwrap();
        a.sync().await.unwrap();
    }
    a.save_snapshot().await.unwrap();
    let head = a.revision().unwrap();
    assert_eq!(
        repo.load_snapshot(head).await.unwrap(),
        Some(vec![CounterOp::Add(10)])
    );
    assert!(repo.load_commit(head).await.unwrap().snapshot_hint);

    a.add(CounterOp::Add(5)).unwrap();
    a.sync().await.unwrap();
    let fresh = counter_replica(&repo).await;
    assert_eq!(*fresh.state(), 15);
}

// ---------------------------------------------------------------------------
// Head races and failures
// ---------------------------------------------------------------------------

#[tokio::test]
async fn losing_merge_race_leaves_orphan_for_cleanup() {
    let repo = seeded(MemoryRepository::<CounterOp>::new().with_delete_margin(Duration::ZERO)).await;
    let root = *repo.get_heads().await.unwrap().first().unwrap();
    let mut branches = BTreeSet::new();
    for delta in [1, 2] {
        let commit = repo
            .create_commit(BTreeMap::from([(root, vec![CounterOp::Add(delta)])]), 2)
            .await
            .unwrap();
        branches.insert(commit.id);
        repo.push(vec![commit]).await.unwrap();
    }
    repo.update_heads(&branches, &BTreeSet::from([root]))
        .await
        .unwrap();

    let algorithms = OtAlgorithms::new(CounterSystem, repo.clone());
    let (parents, level) = algorithms.merge(&branches).await.unwrap();
    let winner = repo.create_commit(parents.clone(), level).await.unwrap();
    let loser = repo
        .create_commit(parents, level)
        .await
        .unwrap()
        .with_timestamp(1);
    let (winner_id, loser_id) = (winner.id, loser.id);
    repo.push(vec![winner, loser]).await.unwrap();

    repo.update_heads(&BTreeSet::from([winner_id]), &branches)
        .await
        .unwrap();
    let err = repo
        .update_heads(&BTreeSet::from([loser_id]), &branches)
        .await
        .unwrap_err();
    assert!(err.is_retriable());
    assert_eq!(repo.get_heads().await.unwrap(), BTreeSet::from([winner_id]));

    assert_eq!(algorithms.merge_heads_and_push().await.unwrap(), winner_id);
    assert_eq!(repo.cleanup(winner_id).await.unwrap(), 1);
    assert!(!repo.contains(loser_id).unwrap());
    assert!(repo.contains(root).unwrap());

    let state = algorithms.checkout(winner_id).await.unwrap();
    let mut value = 0i64;
    ot_kit::replay(&mut value, &state);
    assert_eq!(value, 3);
}

#[tokio::test]
async fn heads_never_contain_ancestors() {
    let repo = seeded(MemoryRepository::<CounterOp>::new()).await;
    let mut replicas = Vec::new();
    for _ in 0..3 {
        replicas.push(counter_replica(&repo).await);
    }
    for round in 0..3 {
        for (i, replica) in replicas.iter_mut().enumerate() {
            replica.add(CounterOp::Add(round * 10 + i as i64)).unwrap();
            replica.commit().await.unwrap();
            replica.push().await.unwrap();

            let heads = repo.get_heads().await.unwrap();
            let algorithms = replica.algorithms();
            assert_eq!(algorithms.exclude_parents(&heads).await.unwrap(), heads);
        }
        replicas[0].algorithms().merge_heads_and_push().await.unwrap();
        replicas[0].pull().await.unwrap();
    }
}

#[tokio::test]
async fn disjoint_histories_invalidate_the_replica() {
    let repo = seeded(MemoryRepository::<CounterOp>::new()).await;
    let second_root = repo.create_commit(BTreeMap::new(), 1).await.unwrap();
    let second_root_id = second_root.id;
    repo.push(vec![second_root]).await.unwrap();
    repo.update_heads(&BTreeSet::from([second_root_id]), &BTreeSet::new())
        .await
        .unwrap();

    let mut a = counter_replica(&repo).await;
    assert_eq!(a.revision(), Some(second_root_id));
    a.add(CounterOp::Add(1)).unwrap();
    let err = a.sync().await.unwrap_err();
    assert!(matches!(err, OtError::DivergentHistory { .. }));
    assert_eq!(a.status(), ManagerStatus::Failed);
    assert!(matches!(
        a.add(CounterOp::Add(1)),
        Err(OtError::Invalidated)
    ));
}
