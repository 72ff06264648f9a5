//! Contention integration tests.
//!
//! These tests verify that queue positions stay unique and that a task
//! only ever has one agent working on it when requests race.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;

use agentroom::core::{AgentStatus, Classification, TaskStatus};
use agentroom::queue::QueueAllocator;
use agentroom::role::RoleKey;
use agentroom::store::{MemoryStore, Store};
use agentroom::tasks::TaskStore;
use agentroom::Error;

use crate::fixtures::{TestHarness, TOKEN};

/// Test: Concurrent message submission
/// Given one chatroom
/// When 50 messages are submitted at once
/// Then every task gets a distinct position from 1 to 50
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_create_task_yields_distinct_positions() {
    let h = TestHarness::new().await;
    let room = h.team_room().await;

    let handles: Vec<_> = (0..50)
        .map(|i| {
            let coordinator = Arc::clone(&h.coordinator);
            tokio::spawn(async move {
                coordinator
                    .submit_message(TOKEN, room.id, &format!("message {}", i), None)
                    .await
            })
        })
        .collect();

    let mut positions = HashSet::new();
    for handle in handles {
        let task = handle.await.unwrap().unwrap();
        assert!(positions.insert(task.queue_position), "duplicate position");
    }
    assert_eq!(positions.len(), 50);
    assert_eq!(positions.iter().min(), Some(&1));
    assert_eq!(positions.iter().max(), Some(&50));

    let listed = h.coordinator.tasks(TOKEN, room.id).await.unwrap();
    let ordered: Vec<u64> = listed.iter().map(|t| t.queue_position).collect();
    assert_eq!(ordered, (1..=50).collect::<Vec<_>>());
}

/// Test: Two core instances share a store
/// Given two task stores with their own allocators over one store
/// When both create tasks concurrently in the same chatroom
/// Then no position is handed out twice
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_instances_never_share_a_position() {
    let h = TestHarness::new().await;
    let room = h.team_room().await;
    let store: Arc<dyn Store> = h.store.clone();
    let first = TaskStore::new(store.clone(), QueueAllocator::new(store.clone()));
    let second = TaskStore::new(store.clone(), QueueAllocator::new(store.clone()));

    let futures = (0..40).map(|i| {
        let tasks = if i % 2 == 0 { first.clone() } else { second.clone() };
        async move {
            tasks
                .create_task(room.id, "work", None, chrono::Utc::now())
                .await
        }
    });
    let results = join_all(futures).await;

    let positions: HashSet<u64> = results
        .into_iter()
        .map(|r| r.unwrap().queue_position)
        .collect();
    assert_eq!(positions.len(), 40);
}

/// Test: Chatrooms do not contend with each other
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_positions_are_per_chatroom() {
    let h = TestHarness::new().await;
    let a = h.team_room().await;
    let b = h.team_room().await;

    let submissions = (0..10).flat_map(|_| [a.id, b.id]).map(|room| {
        let coordinator = Arc::clone(&h.coordinator);
        async move { coordinator.submit_message(TOKEN, room, "hi", None).await }
    });
    for result in join_all(submissions).await {
        result.unwrap();
    }

    for room in [a.id, b.id] {
        let positions: Vec<u64> = h
            .coordinator
            .tasks(TOKEN, room)
            .await
            .unwrap()
            .iter()
            .map(|t| t.queue_position)
            .collect();
        assert_eq!(positions, (1..=10).collect::<Vec<_>>());
    }
}

/// Test: Racing claims
/// Given one classified task
/// When the assignee claims it from several requests at once
/// Then exactly one claim succeeds and the role is working once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_racing_claims_have_one_winner() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h.classified_task(&room, Classification::Question).await;

    let claims = (0..8).map(|_| {
        let coordinator = Arc::clone(&h.coordinator);
        async move { coordinator.claim(TOKEN, task.id, "planner").await }
    });
    let results = join_all(claims).await;

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    for err in results.into_iter().filter_map(|r| r.err()) {
        assert!(
            matches!(
                err,
                Error::InvalidTransition { .. }
                    | Error::IllegalTransition { .. }
                    | Error::ConcurrentModification(_)
            ),
            "unexpected error: {}",
            err
        );
    }

    let participants = h.coordinator.participants(TOKEN, room.id).await.unwrap();
    let planner = participants
        .iter()
        .find(|p| p.role == RoleKey::new("planner"))
        .unwrap();
    assert_eq!(planner.status, AgentStatus::Working);
    let task = h.coordinator.tasks(TOKEN, room.id).await.unwrap().remove(0);
    assert_eq!(task.status, TaskStatus::InProgress);
}

/// Test: Stale task writes are rejected
/// Given two writers holding the same task version
/// When both write
/// Then the second fails with ConcurrentModification and asks for a retry
#[tokio::test]
async fn test_second_writer_with_stale_version_fails() {
    let store = Arc::new(MemoryStore::new());
    let room = agentroom::core::Chatroom::new(Some(crate::fixtures::team()), chrono::Utc::now());
    store.insert_chatroom(room.clone()).await.unwrap();
    let tasks = TaskStore::new(store.clone(), QueueAllocator::new(store.clone()));
    let task = tasks
        .create_task(room.id, "work", Some(Classification::Question), chrono::Utc::now())
        .await
        .unwrap();

    let mut first = store.get_task(task.id).await.unwrap().unwrap();
    let mut second = first.clone();
    first.status = TaskStatus::InProgress;
    second.status = TaskStatus::Cancelled;

    store.update_task(first).await.unwrap();
    let err = store.update_task(second).await.unwrap_err();
    assert!(matches!(err, Error::ConcurrentModification(_)));
    assert!(err.is_retryable());
    assert!(err.user_message().contains("retry"));
}
