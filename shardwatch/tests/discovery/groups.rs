//! Children and data watches.

use shardwatch::{ConnectionState, CoordinationError, HaEvent, InMemoryCoordination};
use tokio::task::LocalSet;

use crate::common::{
    BASE, events_until, group, group_path, init_tracing, next_event, ready_client, settle,
    write_group,
};

fn is_master_change(event: &HaEvent) -> bool {
    matches!(event, HaEvent::MasterChange { .. })
}

#[tokio::test(start_paused = true)]
async fn test_children_watch_is_rearmed() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g1", &group("m1", &[]));
            let (client, mut events) = ready_client(&coordination).await;
            assert_eq!(coordination.child_watch_count(BASE), 1);

            for name in ["g2", "g3"] {
                let state = group("m", &["s"]);
                write_group(&coordination, name, &state);
                assert_eq!(
                    next_event(&mut events).await,
                    HaEvent::NodeAdd {
                        name: name.to_string(),
                        state
                    }
                );
                settle().await;
                assert_eq!(coordination.child_watch_count(BASE), 1);
            }

            assert_eq!(client.group_names(), vec!["g1", "g2", "g3"]);
            // Relisting does not re-announce known groups
            assert!(events.try_recv().is_err());
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_data_watch_is_rearmed() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g", &group("m1", &["s1"]));
            let (client, mut events) = ready_client(&coordination).await;
            assert_eq!(coordination.data_watch_count(&group_path("g")), 1);

            let grown = group("m1", &["s1", "s2"]);
            write_group(&coordination, "g", &grown);
            assert_eq!(
                next_event(&mut events).await,
                HaEvent::Change {
                    name: "g".into(),
                    state: grown
                }
            );
            settle().await;
            assert_eq!(coordination.data_watch_count(&group_path("g")), 1);

            let failover = group("s1", &["s2"]);
            write_group(&coordination, "g", &failover);
            assert_eq!(
                next_event(&mut events).await,
                HaEvent::Change {
                    name: "g".into(),
                    state: failover.clone()
                }
            );
            assert_eq!(
                next_event(&mut events).await,
                HaEvent::MasterChange {
                    name: "g".into(),
                    state: failover.clone()
                }
            );
            assert_eq!(client.group("g"), Some(failover));
            assert_eq!(client.master("g").as_deref(), Some("s1"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_identical_rewrite_is_silent() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            let state = group("m", &["s"]);
            write_group(&coordination, "g", &state);
            let (_client, mut events) = ready_client(&coordination).await;

            write_group(&coordination, "g", &state);
            settle().await;
            assert!(events.try_recv().is_err());
            assert_eq!(coordination.data_watch_count(&group_path("g")), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_deleted_group_is_removed() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            let doomed = group("m1", &["s1"]);
            write_group(&coordination, "g1", &doomed);
            write_group(&coordination, "g2", &group("m2", &[]));
            let (client, mut events) = ready_client(&coordination).await;

            assert!(coordination.remove(&group_path("g1")));
            assert_eq!(
                next_event(&mut events).await,
                HaEvent::NodeRemove {
                    name: "g1".into(),
                    state: doomed
                }
            );

            settle().await;
            assert!(events.try_recv().is_err());
            assert!(client.group("g1").is_none());
            assert!(!client.check_valid("g1", "m1"));
            assert_eq!(client.group_names(), vec!["g2"]);
            assert_eq!(client.master("g2").as_deref(), Some("m2"));
            assert_eq!(coordination.child_watch_count(BASE), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_undecodable_data_waits_for_next_write() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            coordination.write(BASE, b"");
            let (client, mut events) = ready_client(&coordination).await;

            coordination.write(&group_path("g"), b"{\"master\":");
            settle().await;
            assert!(events.try_recv().is_err());
            assert!(client.group("g").is_none());
            assert_eq!(coordination.data_watch_count(&group_path("g")), 1);

            let state = group("m", &[]);
            write_group(&coordination, "g", &state);
            assert_eq!(
                next_event(&mut events).await,
                HaEvent::NodeAdd {
                    name: "g".into(),
                    state
                }
            );
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_group_recreated_after_delete() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g", &group("m1", &[]));
            let (client, mut events) = ready_client(&coordination).await;

            coordination.remove(&group_path("g"));
            assert!(matches!(
                next_event(&mut events).await,
                HaEvent::NodeRemove { .. }
            ));
            settle().await;

            let state = group("m2", &[]);
            write_group(&coordination, "g", &state);
            assert_eq!(
                next_event(&mut events).await,
                HaEvent::NodeAdd {
                    name: "g".into(),
                    state
                }
            );
            assert_eq!(client.master("g").as_deref(), Some("m2"));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_rewatch_is_retried() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g", &group("m1", &[]));
            let (client, mut events) = ready_client(&coordination).await;

            coordination.fail_next_read(&group_path("g"), CoordinationError::Backend("io".into()));
            let moved = group("m2", &[]);
            write_group(&coordination, "g", &moved);

            // The refetch failed: the old state is served until the retry
            settle().await;
            assert!(events.try_recv().is_err());
            assert_eq!(client.master("g").as_deref(), Some("m1"));
            assert_eq!(client.state(), ConnectionState::Ready);

            let seen = events_until(&mut events, is_master_change).await;
            assert_eq!(
                seen,
                vec![
                    HaEvent::Change {
                        name: "g".into(),
                        state: moved.clone()
                    },
                    HaEvent::MasterChange {
                        name: "g".into(),
                        state: moved
                    },
                ]
            );
            assert_eq!(coordination.data_watch_count(&group_path("g")), 1);

            write_group(&coordination, "g", &group("m3", &[]));
            events_until(&mut events, is_master_change).await;
            assert_eq!(client.master("g").as_deref(), Some("m3"));
            assert_eq!(coordination.connect_count(), 1);
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_relisting_is_retried() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g1", &group("m1", &[]));
            let (client, mut events) = ready_client(&coordination).await;

            coordination.fail_next_read(BASE, CoordinationError::ConnectionLoss);
            let added = group("m2", &[]);
            write_group(&coordination, "g2", &added);

            settle().await;
            assert_eq!(coordination.child_watch_count(BASE), 0);
            assert!(client.group("g2").is_none());

            assert_eq!(
                next_event(&mut events).await,
                HaEvent::NodeAdd {
                    name: "g2".into(),
                    state: added
                }
            );
            settle().await;
            assert_eq!(coordination.child_watch_count(BASE), 1);
            // Still the same cycle: no second ready
            assert!(events.try_recv().is_err());

            write_group(&coordination, "g3", &group("m3", &[]));
            assert!(matches!(
                next_event(&mut events).await,
                HaEvent::NodeAdd { name, .. } if name == "g3"
            ));
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_read_of_watched_group_stays_stale() {
    init_tracing();
    LocalSet::new()
        .run_until(async {
            let coordination = InMemoryCoordination::new();
            write_group(&coordination, "g1", &group("m1", &[]));
            let (client, mut events) = ready_client(&coordination).await;

            // Relisting re-reads g1 through its armed watch and fails
            coordination.fail_next_read(&group_path("g1"), CoordinationError::Backend("io".into()));
            write_group(&coordination, "g2", &group("m2", &[]));
            assert!(matches!(
                next_event(&mut events).await,
                HaEvent::NodeAdd { name, .. } if name == "g2"
            ));
            settle().await;
            assert!(events.try_recv().is_err());
            assert_eq!(client.master("g1").as_deref(), Some("m1"));
            assert_eq!(coordination.data_watch_count(&group_path("g1")), 1);

            write_group(&coordination, "g1", &group("m9", &[]));
            events_until(&mut events, is_master_change).await;
            assert_eq!(client.master("g1").as_deref(), Some("m9"));
        })
        .await;
}
