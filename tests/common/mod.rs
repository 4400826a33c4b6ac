#![allow(dead_code)]

use std::time::Duration;
use tokio::time::Instant;

use homebus::bus::{Transport, TransportOptions};

const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// Polls `condition` until it holds, panics after a few seconds.
pub async fn wait_for<F: FnMut() -> bool>(what: &str, mut condition: F) {
    let deadline = Instant::now() + WAIT_LIMIT;
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn options(instance_name: &str) -> TransportOptions {
    TransportOptions {
        cleanup_quiescence: Duration::from_millis(50),
        rpc_timeout: Duration::from_millis(300),
        ..TransportOptions::new(instance_name)
    }
}

pub async fn wait_online(transport: &Transport) {
    let name = format!("'{}' online", transport.instance_name());
    wait_for(&name, || transport.online()).await;
}
