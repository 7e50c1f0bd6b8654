//! Master / slave selection and membership checks.

use shardwatch::{AvailabilityClient, ConnectionState, HaEvent, InMemoryCoordination, Role};
use tokio::task::LocalSet;

use crate::common::{
    config, group, init_tracing, next_event, ready_client, settle, write_group,
};

#[tokio::test(start_paused = true)]
async fn test_slaves_round_robin() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g", &group("m", &["a", "b", "c"]));
            let (client, _events) = ready_client(&coordination).await;

            let picks: Vec<String> = (0..4)
                .map(|_| client.get_client("g", Role::Slave).expect("slave"))
                .collect();
            assert_eq!(picks, vec!["a", "b", "c", "a"]);

            assert_eq!(client.get_client("g", Role::Master).as_deref(), Some("m"));
            assert_eq!(client.master("g").as_deref(), Some("m"));
            assert_eq!(client.state(), ConnectionState::Ready);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_round_robin_is_per_group() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g1", &group("m", &["a", "b"]));
            write_group(&coordination, "g2", &group("m", &["x", "y"]));
            let (client, _events) = ready_client(&coordination).await;

            assert_eq!(client.slave("g1").as_deref(), Some("a"));
            assert_eq!(client.slave("g2").as_deref(), Some("x"));
            assert_eq!(client.slave("g1").as_deref(), Some("b"));
            assert_eq!(client.slave("g2").as_deref(), Some("y"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_cursor_survives_shrinking_slave_list() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g", &group("m", &["a", "b", "c"]));
            let (client, mut events) = ready_client(&coordination).await;

            assert_eq!(client.slave("g").as_deref(), Some("a"));
            assert_eq!(client.slave("g").as_deref(), Some("b"));

            write_group(&coordination, "g", &group("m", &["a"]));
            assert!(matches!(next_event(&mut events).await, HaEvent::Change { .. }));

            assert_eq!(client.slave("g").as_deref(), Some("a"));
            assert_eq!(client.slave("g").as_deref(), Some("a"));
            assert_eq!(client.state(), ConnectionState::Ready);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_lookups_wait_for_ready() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g", &group("m", &["s"]));
            coordination.set_manual_connect(true);

            let client = AvailabilityClient::new(coordination.clone(), config()).expect("client");
            client.start();
            settle().await;

            assert!(client.get_client("g", Role::Master).is_none());
            assert!(!client.check_valid("g", "m"));
            assert!(client.group("g").is_none());
            // Not ready is not a miss: no reconnect is scheduled
            assert_eq!(client.state(), ConnectionState::Connecting);
            assert_eq!(coordination.connect_count(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_check_valid_membership() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            let state = group("m", &["s1", "s2"]).with_unavailable(vec!["down".into()]);
            write_group(&coordination, "g", &state);
            let (client, _events) = ready_client(&coordination).await;

            for member in ["m", "s1", "s2", "down"] {
                assert!(client.check_valid("g", member), "{member}");
            }
            assert!(!client.check_valid("g", "ghost"));
            assert!(!client.check_valid("unknown", "m"));

            // Membership checks never trigger a reconnect
            assert_eq!(client.state(), ConnectionState::Ready);
            assert_eq!(coordination.connect_count(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_group_without_master() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            coordination.write(
                &crate::common::group_path("g"),
                br#"{"master":null,"slaves":["s"]}"#,
            );
            let (client, _events) = ready_client(&coordination).await;

            assert_eq!(client.slave("g").as_deref(), Some("s"));
            assert!(client.master("g").is_none());
            assert_eq!(client.state(), ConnectionState::Reconnecting);
        })
        .await;
}
