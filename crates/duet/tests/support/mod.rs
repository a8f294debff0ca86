#![allow(dead_code)]

use duet::{Endpoint, EndpointOptions, Handlers};
use duet_memory::memory_pair;

/// Opt-in test logging: `RUST_LOG=duet_core=trace cargo test`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Connected endpoint pair over an in-memory transport, drivers spawned.
pub fn connect(
    left: Handlers,
    left_options: EndpointOptions,
    right: Handlers,
    right_options: EndpointOptions,
) -> (Endpoint, Endpoint) {
    init_tracing();
    let (a, b) = memory_pair(256);
    let (left_ep, left_driver) = Endpoint::new(a, left, left_options);
    let (right_ep, right_driver) = Endpoint::new(b, right, right_options);
    tokio::spawn(left_driver.run());
    tokio::spawn(right_driver.run());
    (left_ep, right_ep)
}

/// Connected pair with default options on both sides.
pub fn connect_default(left: Handlers, right: Handlers) -> (Endpoint, Endpoint) {
    connect(
        left,
        EndpointOptions::default(),
        right,
        EndpointOptions::default(),
    )
}
