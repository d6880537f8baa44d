//! End-to-end: scope registration, keyed lookup, scope events, discard.
//!
//! A hosts a stored, keyed scope and announces it; B materializes the
//! remote handle, raises scope events against it, and both sides observe
//! the discard.

use duplex_rpc::{ProcessorOptions, RpcError, ScopeBuilder, ScopeTypes};
use drpc_test_utils::{ProcessorPair, test_api, unique_key};
use serde_json::json;
use std::time::Duration;

fn scoped_options() -> ProcessorOptions {
    let scope_types = ScopeTypes::default();
    scope_types.register_tag("session");
    ProcessorOptions {
        apis: test_api(),
        scope_types,
        ..ProcessorOptions::default()
    }
}

fn scoped_pair() -> ProcessorPair {
    ProcessorPair::connect(scoped_options(), scoped_options())
}

#[tokio::test]
async fn announced_scope_is_addressable_by_id_and_key_at_the_peer() {
    let pair = scoped_pair();
    let key = unique_key("session");

    let scope = pair
        .a
        .register_scope(
            ScopeBuilder::new("session")
                .key(&key)
                .stored()
                .value(json!({ "user": "u-1" })),
        )
        .expect("local registration");
    pair.a.announce_scope(&scope).await.expect("announce acked");

    let remote = pair
        .b
        .remote_scope_by_key(&key)
        .expect("peer must store the remote handle by key");
    assert_eq!(remote.id(), scope.id());
    assert_eq!(remote.scope_type(), "session");
    assert_eq!(remote.state(), Some(json!({ "user": "u-1" })));
    assert!(pair.b.remote_scope(scope.id()).is_some(), "and by id");

    pair.shutdown().await;
}

#[tokio::test]
async fn scope_events_reach_the_owning_scope() {
    let pair = scoped_pair();
    let key = unique_key("session");

    let scope = pair
        .a
        .register_scope(ScopeBuilder::new("session").key(&key).stored())
        .unwrap();
    let (seen_tx, mut seen_rx) = tokio::sync::mpsc::unbounded_channel();
    scope
        .events()
        .register("changed", move |ctx| {
            let seen_tx = seen_tx.clone();
            async move {
                let _ = seen_tx.send(ctx.arguments().cloned());
                Ok(())
            }
        })
        .unwrap();
    pair.a.announce_scope(&scope).await.unwrap();

    let remote = pair.b.remote_scope_by_key(&key).unwrap();
    remote
        .raise_event("changed", Some(json!({ "field": "name" })), true)
        .await
        .expect("waited scope event must ack");

    let seen = seen_rx.recv().await.expect("handler must run");
    assert_eq!(seen, Some(json!({ "field": "name" })));

    // An event for a name nobody registered errors when waited.
    let unknown = remote.raise_event("missing", None, true).await;
    assert!(matches!(unknown, Err(RpcError::Remote(_))));

    pair.shutdown().await;
}

#[tokio::test]
async fn discard_removes_the_scope_on_both_sides() {
    let pair = scoped_pair();
    let key = unique_key("session");

    let scope = pair
        .a
        .register_scope(ScopeBuilder::new("session").key(&key).stored())
        .unwrap();
    pair.a.announce_scope(&scope).await.unwrap();
    assert!(pair.b.remote_scope_by_key(&key).is_some());

    scope.discard().await;
    assert!(pair.a.local_scope_by_key(&key).is_none(), "gone locally");

    // The peer learns via scope_discarded.
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if pair.b.remote_scope_by_key(&key).is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("peer must drop the remote handle");

    pair.shutdown().await;
}

#[tokio::test]
async fn keyed_replacement_swaps_exactly_one_instance() {
    let pair = scoped_pair();
    let key = unique_key("session");

    let first = pair
        .a
        .register_scope(ScopeBuilder::new("session").key(&key).stored())
        .unwrap();

    // Same key without the replace flag: conflict.
    let conflict = pair
        .a
        .register_scope(ScopeBuilder::new("session").key(&key).stored());
    assert!(matches!(
        conflict,
        Err(RpcError::Call { code, .. }) if code == duplex_rpc::error_codes::SCOPE_CONFLICT
    ));

    // With the flag: the new instance wins, ids differ.
    let second = pair
        .a
        .register_scope(
            ScopeBuilder::new("session")
                .key(&key)
                .stored()
                .replace_existing(),
        )
        .unwrap();
    assert_ne!(first.id(), second.id());
    let current = pair.a.local_scope_by_key(&key).unwrap();
    assert_eq!(current.id(), second.id());

    pair.shutdown().await;
}

#[tokio::test]
async fn unknown_scope_type_is_fatal_for_the_receiver() {
    // B registers no scope types at all, so A's announcement is out of
    // contract for it.
    let pair = ProcessorPair::connect(
        scoped_options(),
        ProcessorOptions {
            apis: test_api(),
            ..ProcessorOptions::default()
        },
    );

    let scope = pair
        .a
        .register_scope(ScopeBuilder::new("session").key(unique_key("session")).stored())
        .unwrap();
    let announce = pair.a.announce_scope(&scope).await;
    assert!(announce.is_err(), "ack cannot arrive from a dying peer");

    tokio::time::timeout(Duration::from_secs(2), pair.b.closed())
        .await
        .expect("receiver must stop exceptionally");
    assert!(matches!(pair.b.last_error(), Some(RpcError::Protocol(_))));
}
