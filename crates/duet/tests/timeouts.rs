mod support;

use std::time::{Duration, Instant};

use duet::{Endpoint, EndpointOptions, Handlers, handler};
use duet_memory::memory_pair;
use serde_json::{Value, json};

use support::{connect, init_tracing};

fn sleepy_functions(delay: Duration) -> Handlers {
    let functions = Handlers::new();
    functions.insert(
        "slow",
        handler(move |_ctx, _args| async move {
            tokio::time::sleep(delay).await;
            Ok(json!("eventually"))
        }),
    );
    functions
}

#[tokio::test]
async fn ack_timeout_fires_when_nobody_listens() {
    init_tracing();
    let (a, _deaf_peer) = memory_pair(16);
    let (caller, driver) = Endpoint::new(
        a,
        Handlers::new(),
        EndpointOptions::default().ack_timeout(Duration::from_millis(100)),
    );
    tokio::spawn(driver.run());

    let started = Instant::now();
    let err = caller.call("anything", vec![]).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(
        err.to_string().contains("ack timeout"),
        "unexpected error: {err}"
    );
    assert!(
        elapsed >= Duration::from_millis(90) && elapsed < Duration::from_secs(1),
        "ack timeout fired after {elapsed:?}"
    );
}

#[tokio::test]
async fn response_timer_starts_only_after_the_ack() {
    // The peer acks immediately (before invoking) but answers late. With a
    // generous ack timeout and a tight response timeout, the rejection must
    // be a plain timeout.
    let (_peer, caller) = connect(
        sleepy_functions(Duration::from_millis(300)),
        EndpointOptions::default(),
        Handlers::new(),
        EndpointOptions::default()
            .ack_timeout(Duration::from_secs(1))
            .response_timeout(Duration::from_millis(100)),
    );

    let err = caller.call("slow", vec![]).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("timeout on calling \"slow\""), "got: {message}");
    assert!(!message.contains("ack timeout"), "got: {message}");
}

#[tokio::test]
async fn response_timer_runs_from_post_when_no_ack_timeout_is_set() {
    let (_peer, caller) = connect(
        sleepy_functions(Duration::from_millis(300)),
        EndpointOptions::default(),
        Handlers::new(),
        EndpointOptions::default().response_timeout(Duration::from_millis(100)),
    );
    let err = caller.call("slow", vec![]).await.unwrap_err();
    assert!(err.is_timeout(), "unexpected error: {err}");
}

#[tokio::test]
async fn disabled_response_timeout_waits_out_slow_handlers() {
    let (_peer, caller) = connect(
        sleepy_functions(Duration::from_millis(150)),
        EndpointOptions::default(),
        Handlers::new(),
        EndpointOptions::default().no_response_timeout(),
    );
    let value = caller.call("slow", vec![]).await.unwrap();
    assert_eq!(value, json!("eventually"));
}

#[tokio::test]
async fn timeout_handler_can_suppress_the_rejection() {
    let (_peer, caller) = connect(
        sleepy_functions(Duration::from_secs(600)),
        EndpointOptions::default(),
        Handlers::new(),
        EndpointOptions::default()
            .response_timeout(Duration::from_millis(50))
            .on_timeout(|method, _args| method == "slow"),
    );
    // Suppressed: the call resolves with null instead of rejecting.
    let value = caller.call("slow", vec![]).await.unwrap();
    assert_eq!(value, Value::Null);
}

#[tokio::test]
async fn ack_timeout_handler_sees_the_call_site_arguments() {
    init_tracing();
    let (a, _deaf_peer) = memory_pair(16);
    let seen = std::sync::Arc::new(std::sync::Mutex::new(None::<Vec<Value>>));
    let (caller, driver) = Endpoint::new(
        a,
        Handlers::new(),
        EndpointOptions::default()
            .ack_timeout(Duration::from_millis(50))
            .on_ack_timeout({
                let seen = seen.clone();
                move |_method, args| {
                    *seen.lock().unwrap() = Some(args.to_vec());
                    true
                }
            }),
    );
    tokio::spawn(driver.run());

    let value = caller
        .call("anything", vec![json!("original"), json!(2)])
        .await
        .unwrap();
    assert_eq!(value, Value::Null);
    let captured = seen.lock().unwrap().take().expect("handler should have run");
    assert_eq!(captured, vec![json!("original"), json!(2)]);
}

#[tokio::test]
async fn late_response_after_timeout_is_ignored() {
    let (_peer, caller) = connect(
        sleepy_functions(Duration::from_millis(200)),
        EndpointOptions::default(),
        Handlers::new(),
        EndpointOptions::default().response_timeout(Duration::from_millis(50)),
    );
    let err = caller.call("slow", vec![]).await.unwrap_err();
    assert!(err.is_timeout());

    // When the stale response eventually lands, the record is long gone;
    // the endpoint stays healthy.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!caller.is_closed());
    assert!(caller.call("missing", vec![]).await.unwrap_err().is_not_found());
}
