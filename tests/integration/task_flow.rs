//! Task lifecycle integration tests.
//!
//! These tests walk tasks from a user message to completion through the
//! coordinator, including the review gate for new features.

use agentroom::core::{AgentStatus, Chatroom, Classification, Task, TaskStatus, TeamSpec};
use agentroom::role::RoleKey;
use agentroom::store::Store;
use agentroom::{CoordinatorEvent, Error};
use chrono::Utc;

use crate::fixtures::{feature, TestHarness, STRANGER, TOKEN};

/// Test: New feature goes through review
/// Given a new_feature task
/// When it passes planner -> builder -> reviewer -> user
/// Then it completes and every role ends up ready
#[tokio::test]
async fn test_new_feature_through_reviewer_completes() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h.classified_task(&room, feature()).await;

    h.pass(&task, "planner", "builder").await.unwrap();
    h.pass(&task, "builder", "reviewer").await.unwrap();
    let done = h.pass(&task, "reviewer", "user").await.unwrap();

    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.assigned_role, Some(RoleKey::new("user")));
    let path: Vec<&str> = done.handoff_path().map(|r| r.as_str()).collect();
    assert_eq!(path, vec!["planner", "builder", "reviewer"]);

    for p in h.coordinator.participants(TOKEN, room.id).await.unwrap() {
        assert_eq!(p.status, AgentStatus::Ready, "{} should be ready", p.role);
    }
}

/// Test: Builder cannot skip review
/// Given a new_feature task held by the builder
/// When the builder hands it straight to the user
/// Then PolicyViolation is returned and the task stays with the builder
#[tokio::test]
async fn test_new_feature_builder_to_user_rejected() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h.classified_task(&room, feature()).await;
    h.pass(&task, "planner", "builder").await.unwrap();
    h.coordinator.claim(TOKEN, task.id, "builder").await.unwrap();

    let err = h
        .coordinator
        .handoff(TOKEN, task.id, "builder", "user", None)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::PolicyViolation(_)));
    assert!(err.user_message().contains("reviewer"));

    let tasks = h.coordinator.tasks(TOKEN, room.id).await.unwrap();
    assert_eq!(tasks[0].status, TaskStatus::InProgress);
    assert_eq!(tasks[0].assigned_role, Some(RoleKey::new("builder")));

    // Sending it to review instead works.
    let task = h
        .coordinator
        .handoff(TOKEN, task.id, "builder", "reviewer", Some("please review"))
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Queued);
}

/// Test: Review has to follow the last build
/// Given a new_feature reviewed once, then sent back to the builder
/// When the builder hands to the planner who hands to the user
/// Then PolicyViolation is returned
#[tokio::test]
async fn test_rework_requires_fresh_review() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h.classified_task(&room, feature()).await;

    h.pass(&task, "planner", "builder").await.unwrap();
    h.pass(&task, "builder", "reviewer").await.unwrap();
    h.pass(&task, "reviewer", "builder").await.unwrap();
    h.pass(&task, "builder", "planner").await.unwrap();

    let err = h.pass(&task, "planner", "user").await.unwrap_err();
    assert!(matches!(err, Error::PolicyViolation(_)));
}

/// Test: Questions are not gated
#[tokio::test]
async fn test_question_goes_straight_to_user() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h.classified_task(&room, Classification::Question).await;

    let done = h.pass(&task, "planner", "user").await.unwrap();
    assert_eq!(done.status, TaskStatus::Completed);
}

/// Test: Unclassified tasks cannot be claimed
#[tokio::test]
async fn test_claim_requires_classification() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h
        .coordinator
        .submit_message(TOKEN, room.id, "hello", None)
        .await
        .unwrap();

    assert!(matches!(
        h.coordinator.claim(TOKEN, task.id, "planner").await,
        Err(Error::ClassificationRequired(_))
    ));
}

/// Test: Only the assignee classifies
#[tokio::test]
async fn test_only_assignee_classifies() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h
        .coordinator
        .submit_message(TOKEN, room.id, "hello", None)
        .await
        .unwrap();

    let err = h
        .coordinator
        .classify(TOKEN, task.id, "builder", Classification::Question)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongActor { .. }));

    let err = h
        .coordinator
        .classify(
            TOKEN,
            task.id,
            "planner",
            Classification::new_feature("Title", "", "specs"),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidClassification(_)));
}

/// Test: Finished tasks never move again
/// Given a completed task and a cancelled task
/// When any transition is attempted
/// Then IllegalTransition is returned
#[tokio::test]
async fn test_finished_tasks_are_frozen() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let completed = h.classified_task(&room, Classification::Question).await;
    h.pass(&completed, "planner", "user").await.unwrap();
    let cancelled = h.classified_task(&room, Classification::FollowUp).await;
    h.coordinator.cancel_task(TOKEN, cancelled.id).await.unwrap();

    for task in [&completed, &cancelled] {
        assert!(matches!(
            h.coordinator.claim(TOKEN, task.id, "planner").await,
            Err(Error::IllegalTransition { .. })
        ));
        assert!(matches!(
            h.coordinator.defer(TOKEN, task.id, "user").await,
            Err(Error::IllegalTransition { .. })
        ));
        assert!(matches!(
            h.coordinator.cancel_task(TOKEN, task.id).await,
            Err(Error::IllegalTransition { .. })
        ));
        assert!(matches!(
            h.coordinator
                .handoff(TOKEN, task.id, "planner", "builder", None)
                .await,
            Err(Error::IllegalTransition { .. })
        ));
    }
}

/// Test: Entry point override
/// Given a team whose entry point is the builder
/// When a message arrives
/// Then the builder owns the new task
#[tokio::test]
async fn test_entry_point_receives_messages() {
    let h = TestHarness::new().await;
    let spec = TeamSpec::new("squad", &["planner", "builder"]).with_entry_point("Builder");
    let room = h.coordinator.start_session(TOKEN, Some(spec)).await.unwrap();

    let task = h
        .coordinator
        .submit_message(TOKEN, room.id, "fix the build", None)
        .await
        .unwrap();
    assert_eq!(task.assigned_role, Some(RoleKey::new("builder")));
}

/// Test: Backlog keeps queue position
/// Given three tasks where the first is deferred
/// When it is promoted again
/// Then it sits ahead of later tasks in the queue
#[tokio::test]
async fn test_backlog_round_trip_keeps_order() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let first = h.classified_task(&room, Classification::FollowUp).await;
    let second = h.classified_task(&room, Classification::FollowUp).await;

    h.coordinator.claim(TOKEN, first.id, "planner").await.unwrap();
    h.coordinator.defer(TOKEN, first.id, "planner").await.unwrap();
    h.pass(&second, "planner", "builder").await.unwrap();

    let promoted = h.coordinator.promote(TOKEN, first.id, "user").await.unwrap();
    assert_eq!(promoted.queue_position, first.queue_position);

    let queue: Vec<Task> = h.coordinator.queue(TOKEN, room.id).await.unwrap();
    let ids: Vec<_> = queue.iter().map(|t| t.id).collect();
    assert_eq!(ids, vec![first.id, second.id]);
}

/// Test: Legacy chatroom queue counter
/// Given a chatroom without a counter and tasks at positions 1, 3, 5
/// When a new message arrives
/// Then it gets position 6 and the counter is persisted
#[tokio::test]
async fn test_legacy_chatroom_continues_after_highest_position() {
    let h = TestHarness::new().await;
    let room = Chatroom::legacy(Some(crate::fixtures::team()), Utc::now()).with_owner("owner");
    h.store.insert_chatroom(room.clone()).await.unwrap();
    for position in [1, 3, 5] {
        let task = Task::new(room.id, "old", position, None, Utc::now());
        h.store.insert_task(task).await.unwrap();
    }

    let task = h
        .coordinator
        .submit_message(TOKEN, room.id, "new work", None)
        .await
        .unwrap();
    assert_eq!(task.queue_position, 6);

    let stored = h.store.get_chatroom(room.id).await.unwrap().unwrap();
    assert_eq!(stored.next_queue_position, Some(7));
}

/// Test: Sessions gate every operation
#[tokio::test]
async fn test_strangers_cannot_touch_the_chatroom() {
    let h = TestHarness::new().await;
    let room = h.joined_room().await;
    let task = h.classified_task(&room, Classification::Question).await;

    assert!(matches!(
        h.coordinator.heartbeat(STRANGER, room.id, "planner").await,
        Err(Error::AccessDenied(_))
    ));
    assert!(matches!(
        h.coordinator.handoff(STRANGER, task.id, "planner", "user", None).await,
        Err(Error::AccessDenied(_))
    ));
    assert!(matches!(
        h.coordinator.claim("expired", task.id, "planner").await,
        Err(Error::AuthFailed)
    ));
}

/// Test: Task events reach the presentation layer
#[tokio::test]
async fn test_task_events_are_emitted() {
    let mut h = TestHarness::new().await;
    let room = h.joined_room().await;
    h.drain_events();

    let task = h.classified_task(&room, Classification::Question).await;
    h.pass(&task, "planner", "user").await.unwrap();

    let statuses: Vec<TaskStatus> = h
        .drain_events()
        .into_iter()
        .filter_map(|e| match e {
            CoordinatorEvent::TaskChanged { status, .. } => Some(status),
            _ => None,
        })
        .collect();
    assert_eq!(
        statuses,
        vec![
            TaskStatus::Pending,
            TaskStatus::InProgress,
            TaskStatus::Completed
        ]
    );
}
