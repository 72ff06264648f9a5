//! Liveness and recovery integration tests.
//!
//! Leases are driven by the manual clock; restarts go to the recording
//! machine-control client.

use chrono::Duration;

use agentroom::clock::Clock;
use agentroom::core::{
    AgentStatus, ChatroomId, Classification, LegacyStatus, Participant, TaskStatus,
};
use agentroom::readiness::TeamReadiness;
use agentroom::restart::{CommandType, SkipReason};
use agentroom::role::RoleKey;
use agentroom::{CoordinatorEvent, Error};

use crate::fixtures::{machine_configs, TestHarness, ROLES, TOKEN};

fn lease_plus(ms: i64) -> Duration {
    Duration::seconds(agentroom::config::DEFAULT_LEASE_SECS as i64) + Duration::milliseconds(ms)
}

fn cooldown() -> Duration {
    Duration::seconds(agentroom::config::DEFAULT_RESTART_COOLDOWN_SECS as i64 + 1)
}

async fn participant(h: &TestHarness, room: ChatroomId, role: &str) -> Participant {
    h.coordinator
        .participants(TOKEN, room)
        .await
        .unwrap()
        .into_iter()
        .find(|p| p.role == RoleKey::new(role))
        .expect("participant not found")
}

/// Test: Lease expiry by one millisecond
/// Given a team where the reviewer stopped heartbeating
/// When readiness is read 1ms after its lease ended
/// Then the reviewer is expired but not missing, and is marked dead
#[tokio::test]
async fn test_expired_reviewer_is_not_missing() {
    let mut h = TestHarness::new().await;
    let room = h.joined_room().await;

    h.clock.advance(Duration::seconds(60));
    h.coordinator.heartbeat(TOKEN, room.id, "planner").await.unwrap();
    h.coordinator.heartbeat(TOKEN, room.id, "builder").await.unwrap();
    h.clock.advance(Duration::seconds(30) + Duration::milliseconds(1));
    h.drain_events();

    let readiness = h.coordinator.readiness(TOKEN, room.id).await.unwrap();
    let snapshot = readiness.snapshot().unwrap();
    assert!(!snapshot.is_ready);
    assert!(snapshot.missing_roles.is_empty());
    assert_eq!(snapshot.expired_roles, vec!["reviewer".to_string()]);
    assert_eq!(snapshot.present_roles.len(), 3);

    let reviewer = snapshot
        .participants
        .iter()
        .find(|p| p.role == "reviewer")
        .unwrap();
    assert!(reviewer.is_expired);
    assert_eq!(reviewer.legacy_status, LegacyStatus::Waiting);

    assert_eq!(
        participant(&h, room.id, "reviewer").await.status,
        AgentStatus::Dead
    );
    assert_eq!(
        participant(&h, room.id, "planner").await.status,
        AgentStatus::Ready
    );
    let expired: Vec<_> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CoordinatorEvent::RolesExpired { roles, .. } => Some(roles),
            _ => None,
        })
        .collect();
    assert_eq!(expired, vec![vec![RoleKey::new("reviewer")]]);
}

/// Test: Missing role
/// Given a team where the reviewer never joined
/// Then readiness lists it as missing, not expired
#[tokio::test]
async fn test_readiness_with_missing_reviewer() {
    let h = TestHarness::new().await;
    let room = h.team_room().await;
    h.coordinator.heartbeat(TOKEN, room.id, "planner").await.unwrap();
    h.coordinator.heartbeat(TOKEN, room.id, "builder").await.unwrap();

    let readiness = h.coordinator.readiness(TOKEN, room.id).await.unwrap();
    let snapshot = readiness.snapshot().unwrap();
    assert!(!snapshot.is_ready);
    assert_eq!(snapshot.missing_roles, vec!["reviewer".to_string()]);
    assert!(snapshot.expired_roles.is_empty());
    assert_eq!(
        snapshot.present_roles,
        vec!["planner".to_string(), "builder".to_string()]
    );
}

/// Test: Chatrooms without a team
/// Then readiness reports no team rather than a ready flag, and nothing is restarted
#[tokio::test]
async fn test_no_team_has_no_readiness_flag() {
    let h = TestHarness::new().await;
    let room = h.coordinator.start_session(TOKEN, None).await.unwrap();

    let readiness = h.coordinator.readiness(TOKEN, room.id).await.unwrap();
    assert!(matches!(readiness, TeamReadiness::NoTeam));
    assert_eq!(readiness.is_ready(), None);
    assert!(h
        .coordinator
        .restart_offline(TOKEN, room.id, &machine_configs(&ROLES))
        .await
        .unwrap()
        .is_none());
}

/// Test: Leases never shrink
/// Given a heartbeat at t0
/// When a second heartbeat arrives with an earlier clock reading
/// Then ready_until stays at t0 + lease
#[tokio::test]
async fn test_heartbeat_never_moves_lease_backwards() {
    let h = TestHarness::new().await;
    let room = h.team_room().await;
    let t0 = h.clock.now();

    let first = h.coordinator.heartbeat(TOKEN, room.id, "planner").await.unwrap();
    assert_eq!(first.ready_until, Some(t0 + lease_plus(0)));

    h.clock.set(t0 - Duration::seconds(30));
    let second = h.coordinator.heartbeat(TOKEN, room.id, "planner").await.unwrap();
    assert_eq!(second.ready_until, first.ready_until);

    h.clock.set(t0 + Duration::seconds(10));
    let third = h.coordinator.heartbeat(TOKEN, room.id, "planner").await.unwrap();
    assert_eq!(third.ready_until, Some(t0 + Duration::seconds(10) + lease_plus(0)));
}

/// Test: Expired roles cannot start work
/// Given a classified task and a planner whose lease lapsed
/// When the planner claims it
/// Then InvalidTransition is returned and the task stays pending
#[tokio::test]
async fn test_claim_requires_live_lease() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h.classified_task(&room, Classification::Question).await;

    h.clock.advance(lease_plus(1));
    let err = h.coordinator.claim(TOKEN, task.id, "planner").await.unwrap_err();
    assert!(matches!(
        err,
        Error::InvalidTransition {
            to: AgentStatus::Working,
            ..
        }
    ));

    let task = h.coordinator.tasks(TOKEN, room.id).await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::Pending);

    // A fresh heartbeat revives the role and the claim goes through.
    h.coordinator.heartbeat(TOKEN, room.id, "planner").await.unwrap();
    let task = h.coordinator.claim(TOKEN, task.id, "planner").await.unwrap();
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(
        participant(&h, room.id, "planner").await.legacy_status(),
        LegacyStatus::Active
    );
}

/// Test: Restarts are debounced per chatroom
/// Given a team whose leases all lapsed
/// When restart is requested twice within the cooldown
/// Then the second call returns None and sends nothing
#[tokio::test]
async fn test_restart_debounced_within_cooldown() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let configs = machine_configs(&ROLES);
    h.clock.advance(lease_plus(1));

    let report = h
        .coordinator
        .restart_offline(TOKEN, room.id, &configs)
        .await
        .unwrap()
        .expect("first restart should run");
    assert_eq!(report.restarted.len(), 3);
    assert!(report.skipped.is_empty());

    let sent = h.machine.sent();
    assert_eq!(sent.len(), 6);
    assert!(sent[..3]
        .iter()
        .all(|c| c.command_type == CommandType::StopAgent));
    assert!(sent[3..]
        .iter()
        .all(|c| c.command_type == CommandType::StartAgent));
    assert!(sent.iter().all(|c| c.machine_id == "machine-a"));
    assert!(sent
        .iter()
        .all(|c| c.payload.model.as_deref() == Some("large")));

    h.clock.advance(Duration::seconds(2));
    let again = h
        .coordinator
        .restart_offline(TOKEN, room.id, &configs)
        .await
        .unwrap();
    assert!(again.is_none());
    assert_eq!(h.machine.sent().len(), 6);

    h.clock.advance(cooldown());
    let later = h
        .coordinator
        .restart_offline(TOKEN, room.id, &configs)
        .await
        .unwrap();
    assert!(later.is_some());
    assert_eq!(h.machine.count(CommandType::StartAgent), 6);
}

/// Test: Restart then heartbeat
/// Given a role that was restarted
/// When the new agent heartbeats
/// Then the role is ready with its attempt counter reset
#[tokio::test]
async fn test_heartbeat_after_restart_resets_attempts() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    h.clock.advance(lease_plus(1));

    h.coordinator
        .restart_offline(TOKEN, room.id, &machine_configs(&ROLES))
        .await
        .unwrap()
        .unwrap();
    let restarting = participant(&h, room.id, "builder").await;
    assert_eq!(restarting.status, AgentStatus::Restarting);
    assert_eq!(restarting.restart_attempts, 1);

    for role in ROLES {
        h.coordinator.heartbeat(TOKEN, room.id, role).await.unwrap();
    }
    let builder = participant(&h, room.id, "builder").await;
    assert_eq!(builder.status, AgentStatus::Ready);
    assert_eq!(builder.restart_attempts, 0);

    let statuses: Vec<AgentStatus> = builder.history.iter().map(|t| t.to).collect();
    assert_eq!(
        statuses,
        vec![
            AgentStatus::Ready,
            AgentStatus::Dead,
            AgentStatus::Restarting,
            AgentStatus::Ready
        ]
    );
    let readiness = h.coordinator.readiness(TOKEN, room.id).await.unwrap();
    assert_eq!(readiness.is_ready(), Some(true));
}

/// Test: Restart attempts run out
/// Given a role that never comes back after restarts
/// When the attempts are exhausted
/// Then it is dead_failed_revive, ignores heartbeats, and recovers after a reset
#[tokio::test]
async fn test_exhausted_restarts_need_manual_reset() {
    let h = TestHarness::new().await;
    let room = h.team_room().await;
    h.coordinator.heartbeat(TOKEN, room.id, "reviewer").await.unwrap();
    let configs = machine_configs(&["reviewer"]);
    h.clock.advance(lease_plus(1));

    for attempt in 1..=3u32 {
        let report = h
            .coordinator
            .restart_offline(TOKEN, room.id, &configs)
            .await
            .unwrap()
            .unwrap();
        assert!(report
            .restarted
            .iter()
            .any(|r| r.role == RoleKey::new("reviewer")));
        assert_eq!(
            participant(&h, room.id, "reviewer").await.restart_attempts,
            attempt
        );
        h.clock.advance(cooldown());
    }

    let sent_before = h.machine.sent().len();
    let report = h
        .coordinator
        .restart_offline(TOKEN, room.id, &configs)
        .await
        .unwrap()
        .unwrap();
    assert!(report.restarted.is_empty());
    let reviewer_skip = report
        .skipped
        .iter()
        .find(|s| s.role == RoleKey::new("reviewer"))
        .unwrap();
    assert_eq!(reviewer_skip.reason, SkipReason::ReviveExhausted);
    assert_eq!(h.machine.sent().len(), sent_before);
    assert_eq!(
        participant(&h, room.id, "reviewer").await.status,
        AgentStatus::DeadFailedRevive
    );

    // Roles never configured are reported, not restarted.
    for role in ["planner", "builder"] {
        let skip = report
            .skipped
            .iter()
            .find(|s| s.role == RoleKey::new(role))
            .unwrap();
        assert_eq!(skip.reason, SkipReason::NoMachineConfig);
    }

    assert!(matches!(
        h.coordinator.heartbeat(TOKEN, room.id, "reviewer").await,
        Err(Error::InvalidTransition {
            from: AgentStatus::DeadFailedRevive,
            ..
        })
    ));

    let reset = h.coordinator.reset_role(TOKEN, room.id, "reviewer").await.unwrap();
    assert_eq!(reset.status, AgentStatus::Offline);
    assert_eq!(reset.restart_attempts, 0);

    let back = h.coordinator.heartbeat(TOKEN, room.id, "reviewer").await.unwrap();
    assert_eq!(back.status, AgentStatus::Ready);
}

/// Test: Daemon failures are reported per role
/// Given a machine that refuses every command for the builder
/// When the team is restarted
/// Then the builder is skipped with the error and the others restart
#[tokio::test]
async fn test_failing_role_does_not_block_others() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    h.machine.fail_role("builder");
    h.clock.advance(lease_plus(1));

    let report = h
        .coordinator
        .restart_offline(TOKEN, room.id, &machine_configs(&ROLES))
        .await
        .unwrap()
        .unwrap();

    let restarted: Vec<&str> = report.restarted.iter().map(|r| r.role.as_str()).collect();
    assert_eq!(restarted.len(), 2);
    assert!(!restarted.contains(&"builder"));
    assert_eq!(report.skipped.len(), 1);
    assert_eq!(report.skipped[0].role, RoleKey::new("builder"));
    assert!(matches!(report.skipped[0].reason, SkipReason::StopFailed(_)));

    // No start goes out for a role whose stop failed.
    assert!(h
        .machine
        .sent()
        .iter()
        .all(|c| c.payload.role != "builder"));
    assert_eq!(h.machine.count(CommandType::StartAgent), 2);
}

/// Test: Leaving and rejoining
#[tokio::test]
async fn test_leave_then_rejoin() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;

    let left = h.coordinator.leave(TOKEN, room.id, "builder").await.unwrap();
    assert_eq!(left.status, AgentStatus::Offline);
    assert_eq!(left.ready_until, None);
    let snapshot = h.coordinator.readiness(TOKEN, room.id).await.unwrap();
    assert_eq!(
        snapshot.snapshot().unwrap().expired_roles,
        vec!["builder".to_string()]
    );

    assert!(matches!(
        h.coordinator.leave(TOKEN, room.id, "builder").await,
        Err(Error::InvalidTransition { .. })
    ));

    let back = h.coordinator.heartbeat(TOKEN, room.id, "builder").await.unwrap();
    assert_eq!(back.status, AgentStatus::Ready);
}
