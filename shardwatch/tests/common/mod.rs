//! Helpers shared by the integration tests.
//!
//! Every test runs on a paused current-thread runtime inside a `LocalSet`, so
//! retry timers and connect timeouts elapse instantly and deterministically.

#![allow(dead_code)]

use std::time::Duration;

use shardwatch::{
    AvailabilityClient, HaConfig, HaEvent, HaEventReceiver, InMemoryCoordination, ReconnectPolicy,
    ResourceGroupState,
};
use tracing_subscriber::EnvFilter;

pub const BASE: &str = "/shardwatch/groups";

pub type Client = AvailabilityClient<InMemoryCoordination>;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Fast retries, one second to connect.
pub fn config() -> HaConfig {
    HaConfig::new("127.0.0.1:2181")
        .with_connect_timeout(Duration::from_secs(1))
        .with_reconnect(ReconnectPolicy::for_testing())
}

pub fn group_path(name: &str) -> String {
    format!("{BASE}/{name}")
}

pub fn group(master: &str, slaves: &[&str]) -> ResourceGroupState {
    ResourceGroupState::new(master, slaves.iter().map(|s| s.to_string()).collect())
}

pub fn write_group(coordination: &InMemoryCoordination, name: &str, state: &ResourceGroupState) {
    coordination.write(&group_path(name), state.to_bytes().expect("encode"));
}

/// Next event, failing the test if none arrives within a minute of virtual time.
pub async fn next_event(events: &mut HaEventReceiver) -> HaEvent {
    tokio::time::timeout(Duration::from_secs(60), events.recv())
        .await
        .expect("timed out waiting for event")
        .expect("event channel closed")
}

/// Collect events up to and including the first one matching `done`.
pub async fn events_until(
    events: &mut HaEventReceiver,
    done: impl Fn(&HaEvent) -> bool,
) -> Vec<HaEvent> {
    let mut seen = Vec::new();
    loop {
        let event = next_event(events).await;
        let finished = done(&event);
        seen.push(event);
        if finished {
            return seen;
        }
    }
}

/// Let spawned tasks drain without advancing far in virtual time.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Start a client and wait for its first `Ready`.
pub async fn ready_client(coordination: &InMemoryCoordination) -> (Client, HaEventReceiver) {
    let client = AvailabilityClient::new(coordination.clone(), config()).expect("client");
    let mut events = client.subscribe();
    client.start();
    events_until(&mut events, |e| *e == HaEvent::Ready).await;
    (client, events)
}
