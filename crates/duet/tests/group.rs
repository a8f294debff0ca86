mod support;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use duet::{Endpoint, EndpointOptions, Group, GroupChannel, Handlers, handler};
use duet_memory::{MemoryTransport, memory_pair};
use serde_json::{Value, json};

use support::init_tracing;

/// Spawn a remote peer over a fresh memory pair; returns the group-side
/// transport and the peer's endpoint.
fn spawn_peer(functions: Handlers) -> (MemoryTransport, Endpoint) {
    let (group_side, peer_side) = memory_pair(64);
    let (peer, driver) = Endpoint::new(peer_side, functions, EndpointOptions::default());
    tokio::spawn(driver.run());
    (group_side, peer)
}

fn greeter(name: &'static str) -> Handlers {
    let functions = Handlers::new();
    functions.insert(
        "hi",
        handler(move |_ctx, args| async move {
            let caller = args.first().and_then(Value::as_str).unwrap_or("?");
            Ok(json!(format!("Hi {caller}, I am {name}")))
        }),
    );
    functions
}

#[tokio::test]
async fn broadcast_aggregates_in_member_order() {
    init_tracing();
    let group: Group<MemoryTransport> = Group::new(Handlers::new());

    let (t0, _p0) = spawn_peer(greeter("Bob"));
    let (t1, _p1) = spawn_peer(Handlers::new()); // no `hi` here
    let (t2, _p2) = spawn_peer(greeter("Carol"));

    group.update_channels(|channels| {
        channels.push(GroupChannel::new(t0));
        channels.push(GroupChannel::new(t1));
        channels.push(GroupChannel::new(t2));
    });
    assert_eq!(group.clients().len(), 3);

    // One member misses the function: the strict broadcast fails as a whole.
    let err = group.call("hi", vec![json!("A")]).await.unwrap_err();
    assert!(err.is_not_found(), "unexpected error: {err}");

    // The tolerant form substitutes null in that slot, in list order.
    let results = group.call_optional("hi", vec![json!("A")]).await.unwrap();
    assert_eq!(
        results,
        vec![
            json!("Hi A, I am Bob"),
            Value::Null,
            json!("Hi A, I am Carol"),
        ]
    );
}

#[tokio::test]
async fn update_channels_closes_removed_members_and_adds_new_ones() {
    let group: Group<MemoryTransport> = Group::new(Handlers::new());

    let (t0, _p0) = spawn_peer(greeter("Bob"));
    let (t1, _p1) = spawn_peer(greeter("Carol"));
    group.update_channels(|channels| {
        channels.push(GroupChannel::new(t0));
        channels.push(GroupChannel::new(t1));
    });

    let clients = group.clients();
    assert_eq!(clients.len(), 2);
    let removed = clients[0].clone();

    group.update_channels(|channels| {
        channels.remove(0);
    });
    assert!(removed.is_closed(), "removed member should be closed");
    assert_eq!(group.clients().len(), 1);

    let (t2, _p2) = spawn_peer(greeter("Dan"));
    group.update_channels(|channels| {
        channels.push(GroupChannel::new(t2));
    });

    let results = group.call("hi", vec![json!("A")]).await.unwrap();
    assert_eq!(results, vec![json!("Hi A, I am Carol"), json!("Hi A, I am Dan")]);
}

#[tokio::test]
async fn group_events_fan_out_to_every_member() {
    let group: Group<MemoryTransport> = Group::new(Handlers::new());
    let counter = Arc::new(AtomicU32::new(0));

    let mut transports = Vec::new();
    for _ in 0..3 {
        let functions = Handlers::new();
        functions.insert("bump", {
            let counter = counter.clone();
            handler(move |_ctx, _args| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            })
        });
        let (t, _peer) = spawn_peer(functions);
        transports.push(t);
    }
    group.update_channels(|channels| {
        channels.extend(transports.drain(..).map(GroupChannel::new));
    });

    group.remote("bump").event(vec![]).await.unwrap();
    for _ in 0..50 {
        if counter.load(Ordering::SeqCst) == 3 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("events did not reach all members");
}

#[tokio::test]
async fn members_share_one_function_tree_with_their_own_meta() {
    // The peers call back into the group members; each member answers with
    // its own metadata through the shared tree.
    let shared = Handlers::new();
    shared.insert(
        "whoami",
        handler(|ctx, _args| async move { Ok(ctx.meta().cloned().unwrap_or(Value::Null)) }),
    );
    let group: Group<MemoryTransport> = Group::new(shared);

    let (t0, p0) = spawn_peer(Handlers::new());
    let (t1, p1) = spawn_peer(Handlers::new());
    group.update_channels(|channels| {
        channels.push(GroupChannel::new(t0).meta(json!("member-zero")));
        channels.push(GroupChannel::new(t1).meta(json!("member-one")));
    });

    assert_eq!(p0.call("whoami", vec![]).await.unwrap(), json!("member-zero"));
    assert_eq!(p1.call("whoami", vec![]).await.unwrap(), json!("member-one"));
}

#[tokio::test]
async fn group_remote_builder_navigates_nested_paths() {
    let functions = Handlers::new();
    functions.insert(
        "math.double",
        handler(|_ctx, args| async move {
            let n = args.first().and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(n * 2))
        }),
    );
    let group: Group<MemoryTransport> = Group::new(Handlers::new());
    let (t0, _p0) = spawn_peer(functions.clone());
    let (t1, _p1) = spawn_peer(functions);
    group.update_channels(|channels| {
        channels.push(GroupChannel::new(t0));
        channels.push(GroupChannel::new(t1));
    });

    let results = group
        .remote("math")
        .join("double")
        .call(vec![json!(21)])
        .await
        .unwrap();
    assert_eq!(results, vec![json!(42), json!(42)]);
}
