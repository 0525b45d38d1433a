//! Example: two devices signaling a call in the same room.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ot_kit::call::{CallInfo, CallOp, CallState, CallSystem};
use ot_kit::prelude::*;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), OtError> {
    println!("=== Call Signaling Example ===\n");

    // Shared repository with an empty root commit
    let repo = Arc::new(MemoryRepository::<CallOp>::new());
    let root = repo.create_commit(BTreeMap::new(), 1).await?;
    let root_id = root.id;
    repo.push(vec![root]).await?;
    repo.update_heads(&BTreeSet::from([root_id]), &BTreeSet::new())
        .await?;

    let mut phone = StateManager::new(CallSystem, repo.clone(), CallState::default());
    let mut laptop = StateManager::new(CallSystem, repo.clone(), CallState::default());
    phone.checkout().await?;
    laptop.checkout().await?;

    // Both devices place a call while offline
    phone.add(CallOp::call(None, CallInfo::new("alice", 1, 100)))?;
    laptop.add(CallOp::call(None, CallInfo::new("bob", 2, 200)))?;
    println!("Phone sees:  {:?}", phone.state().call);
    println!("Laptop sees: {:?}", laptop.state().call);

    phone.sync().await?;
    laptop.sync().await?;
    phone.pull().await?;
    println!("\nAfter sync, both see: {:?}", phone.state().call);

    // Carol answers on the phone while the laptop drops the call
    let active = laptop.state().call.clone();
    phone.add(CallOp::accept("carol", None))?;
    if let Some(call) = active {
        laptop.add(CallOp::drop_call(call, BTreeMap::new(), 300))?;
    }

    phone.sync().await?;
    laptop.sync().await?;
    phone.pull().await?;
    println!("After drop vs accept: {:?}", phone.state());
    assert_eq!(phone.state(), laptop.state());

    println!("\nHeads: {:?}", repo.get_heads().await?);
    Ok(())
}
