use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use ot_kit::call::{CallInfo, CallOp, CallState, CallSystem};
use ot_kit::counter::{CounterOp, CounterSystem};
use ot_kit::prelude::*;
use ot_kit::{CommitGraph, Node};

fn bench_counter_transform(c: &mut Criterion) {
    let left: Vec<CounterOp> = (1..=50).map(CounterOp::Add).collect();
    let right: Vec<CounterOp> = (1..=50).map(|i| CounterOp::Add(-i)).collect();

    c.bench_function("CounterSystem::transform 50x50", |b| {
        b.iter(|| black_box(CounterSystem.transform(&left, &right).unwrap()))
    });
}

fn bench_call_transform(c: &mut Criterion) {
    let call = CallInfo::new("alice", 1, 100);
    let left: Vec<CallOp> = (0..20)
        .map(|i| CallOp::accept(format!("user{i}"), None))
        .collect();
    let mut right: Vec<CallOp> = (0..20)
        .map(|i| CallOp::reject(format!("user{i}"), None))
        .collect();
    let handled = (0..20).map(|i| (format!("user{i}"), false)).collect();
    right.push(CallOp::drop_call(call, handled, 500));

    c.bench_function("CallSystem::transform answers vs drop", |b| {
        b.iter(|| black_box(CallSystem.transform(&left, &right).unwrap()))
    });
}

fn bench_squash(c: &mut Criterion) {
    let ops: Vec<CounterOp> = (0..1000)
        .map(|i| {
            if i % 10 == 0 {
                CounterOp::Set { prev: 0, next: i }
            } else {
                CounterOp::Add(i)
            }
        })
        .collect();

    c.bench_function("CounterSystem::squash x1000", |b| {
        b.iter(|| black_box(CounterSystem.squash(&ops)))
    });

    let mut prev = None;
    let calls: Vec<CallOp> = (0..1000u64)
        .map(|i| {
            let next = CallInfo::new("caller", i, i);
            CallOp::call(prev.replace(next.clone()), next)
        })
        .collect();

    c.bench_function("CallSystem::squash call chain x1000", |b| {
        b.iter(|| black_box(CallSystem.squash(&calls)))
    });
}

/// A root with `heads` branches of `depth` commits each.
fn fan_out(heads: u64, depth: u64) -> (CommitGraph<CounterOp>, BTreeSet<Node>) {
    let mut graph = CommitGraph::new();
    graph.add_commit(&Commit::root(CommitId::new(0)));
    let mut tips = BTreeSet::new();
    let mut next_id = 1;
    for branch in 0..heads {
        let mut parent = CommitId::new(0);
        for level in 2..depth + 2 {
            let id = CommitId::new(next_id);
            next_id += 1;
            let parents = BTreeMap::from([(parent, vec![CounterOp::Add(branch as i64 + 1)])]);
            graph.add_commit(&Commit::new(id, parents, level));
            parent = id;
        }
        tips.insert(Node::Commit(parent));
    }
    (graph, tips)
}

fn bench_graph_merge(c: &mut Criterion) {
    let (graph, heads) = fan_out(2, 20);
    c.bench_function("CommitGraph::merge 2 heads depth 20", |b| {
        b.iter(|| {
            let mut graph = graph.clone();
            black_box(graph.merge(&CounterSystem, &heads).unwrap())
        })
    });

    let (graph, heads) = fan_out(10, 5);
    c.bench_function("CommitGraph::merge 10 heads depth 5", |b| {
        b.iter(|| {
            let mut graph = graph.clone();
            black_box(graph.merge(&CounterSystem, &heads).unwrap())
        })
    });
}

fn bench_manager_sync(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();

    c.bench_function("StateManager::sync two replicas", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let repo = Arc::new(MemoryRepository::<CallOp>::new());
                let root = repo.create_commit(BTreeMap::new(), 1).await.unwrap();
                let root_id = root.id;
                repo.push(vec![root]).await.unwrap();
                repo.update_heads(&BTreeSet::from([root_id]), &BTreeSet::new())
                    .await
                    .unwrap();

                let mut alice = StateManager::new(CallSystem, repo.clone(), CallState::default());
                let mut bob = StateManager::new(CallSystem, repo.clone(), CallState::default());
                alice.checkout().await.unwrap();
                bob.checkout().await.unwrap();
                alice.add(CallOp::call(None, CallInfo::new("a", 1, 1))).unwrap();
                bob.add(CallOp::call(None, CallInfo::new("b", 2, 2))).unwrap();
                alice.sync().await.unwrap();
                bob.sync().await.unwrap();
                alice.pull().await.unwrap();
                black_box(alice.state().clone())
            })
        })
    });
}

criterion_group!(
    benches,
    bench_counter_transform,
    bench_call_transform,
    bench_squash,
    bench_graph_merge,
    bench_manager_sync,
);
criterion_main!(benches);
