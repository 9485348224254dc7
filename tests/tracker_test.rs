//! Integration tests for redundancy and completion tracking.

use std::sync::Arc;

use crowdsched::error::Error;
use crowdsched::model::*;
use crowdsched::repo::{InMemoryRepository, TaskRepository};
use crowdsched::tracker::{RedundancyEffect, RedundancyTracker};
use serde_json::json;

mod common;
use common::FaultyRepo;

async fn setup(n_answers: u32) -> (Arc<InMemoryRepository>, RedundancyTracker, Task) {
    let repo = Arc::new(InMemoryRepository::new());
    let project = repo.create_project(NewProject::new("tracker")).await.unwrap();
    let task = repo
        .insert_task(project.id, &NewTask::new(json!({})).n_answers(n_answers))
        .await
        .unwrap();
    let tracker = RedundancyTracker::new(repo.clone());
    (repo, tracker, task)
}

fn answer(task: &Task, user: i64) -> NewAnswer {
    NewAnswer {
        task_id: task.id,
        project_id: task.project_id,
        requester: Requester::User(user),
        info: json!({"label": "cat"}),
    }
}

#[tokio::test]
async fn state_follows_recorded_count() {
    let (_, tracker, task) = setup(2).await;

    let t = tracker.record_answer(answer(&task, 1)).await.unwrap();
    assert_eq!(t.state, TaskState::Ongoing);

    let t = tracker.record_answer(answer(&task, 2)).await.unwrap();
    assert_eq!(t.state, TaskState::Completed);
}

#[tokio::test]
async fn duplicate_answer_is_rejected_and_not_counted() {
    let (repo, tracker, task) = setup(2).await;
    tracker.record_answer(answer(&task, 1)).await.unwrap();

    let err = tracker.record_answer(answer(&task, 1)).await.unwrap_err();
    assert!(matches!(err, Error::AlreadyAnswered { .. }));
    assert_eq!(repo.count_answers(task.id).await.unwrap(), 1);
    assert_eq!(repo.get_task(task.id).await.unwrap().state, TaskState::Ongoing);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_answers_complete_exactly_at_redundancy() {
    let (repo, tracker, task) = setup(10).await;

    let handles: Vec<_> = (0..10)
        .map(|user| {
            let tracker = tracker.clone();
            let a = answer(&task, user);
            tokio::spawn(async move { tracker.record_answer(a).await.unwrap() })
        })
        .collect();
    for h in handles {
        h.await.unwrap();
    }

    let stored = repo.get_task(task.id).await.unwrap();
    assert_eq!(repo.count_answers(task.id).await.unwrap(), 10);
    assert_eq!(stored.state, TaskState::Completed);
}

#[tokio::test]
async fn raising_redundancy_reopens_and_invalidates_export() {
    let (repo, tracker, task) = setup(1).await;
    tracker.record_answer(answer(&task, 1)).await.unwrap();
    assert!(tracker.mark_exported(task.id).await.unwrap());

    let (t, effect) = tracker.set_redundancy(task.id, 3).await.unwrap();
    assert_eq!(effect, RedundancyEffect::Reopened);
    assert_eq!(t.state, TaskState::Ongoing);
    assert!(!t.exported);
    assert_eq!(t.n_answers, 3);

    let stored = repo.get_task(task.id).await.unwrap();
    assert_eq!(stored.state, TaskState::Ongoing);
    assert!(!stored.exported);
}

#[tokio::test]
async fn lowering_redundancy_completes_and_keeps_answers_and_export() {
    let (repo, tracker, task) = setup(1).await;
    tracker.record_answer(answer(&task, 1)).await.unwrap();
    tracker.mark_exported(task.id).await.unwrap();

    // Reopen, collect more answers, then lower again.
    tracker.set_redundancy(task.id, 4).await.unwrap();
    tracker.record_answer(answer(&task, 2)).await.unwrap();
    tracker.record_answer(answer(&task, 3)).await.unwrap();

    let (t, effect) = tracker.set_redundancy(task.id, 2).await.unwrap();
    assert_eq!(effect, RedundancyEffect::Completed);
    assert_eq!(t.state, TaskState::Completed);
    assert!(!t.exported);
    assert_eq!(repo.count_answers(task.id).await.unwrap(), 3);
}

#[tokio::test]
async fn lowering_redundancy_on_exported_task_leaves_flag() {
    let (_, tracker, task) = setup(3).await;
    tracker.record_answer(answer(&task, 1)).await.unwrap();
    tracker.record_answer(answer(&task, 2)).await.unwrap();
    tracker.record_answer(answer(&task, 3)).await.unwrap();
    tracker.mark_exported(task.id).await.unwrap();

    let (t, effect) = tracker.set_redundancy(task.id, 1).await.unwrap();
    assert_eq!(effect, RedundancyEffect::Unchanged);
    assert_eq!(t.state, TaskState::Completed);
    assert!(t.exported);
}

#[tokio::test]
async fn zero_redundancy_is_rejected() {
    let (_, tracker, task) = setup(1).await;
    let err = tracker.set_redundancy(task.id, 0).await.unwrap_err();
    assert!(matches!(err, Error::InvalidRedundancy(0)));
}

#[tokio::test]
async fn priority_edit_leaves_state_alone() {
    let (_, tracker, task) = setup(1).await;
    tracker.record_answer(answer(&task, 1)).await.unwrap();

    let t = tracker.set_priority(task.id, 0.75).await.unwrap();
    assert_eq!(t.priority, 0.75);
    assert_eq!(t.state, TaskState::Completed);

    assert!(tracker.set_priority(task.id, f64::NAN).await.is_err());
}

#[tokio::test]
async fn only_completed_tasks_are_marked_exported() {
    let (repo, tracker, task) = setup(2).await;
    assert!(!tracker.mark_exported(task.id).await.unwrap());
    assert!(!repo.get_task(task.id).await.unwrap().exported);

    tracker.record_answer(answer(&task, 1)).await.unwrap();
    tracker.record_answer(answer(&task, 2)).await.unwrap();
    assert!(tracker.mark_exported(task.id).await.unwrap());
    assert!(!tracker.mark_exported(task.id).await.unwrap());
}

#[tokio::test]
async fn stale_write_loses_to_answer_append() {
    let (repo, tracker, task) = setup(1).await;
    let stale = repo.get_task(task.id).await.unwrap();

    tracker.record_answer(answer(&task, 1)).await.unwrap();

    // A writer holding the pre-answer row must not overwrite the new state.
    let mut edited = stale;
    edited.n_answers = 5;
    let err = repo.update_task(&edited).await.unwrap_err();
    assert!(matches!(err, Error::Conflict { .. }));
}

#[tokio::test]
async fn answer_derives_state_without_a_separate_update() {
    let repo = Arc::new(FaultyRepo::new());
    let project = repo.create_project(NewProject::new("atomic")).await.unwrap();
    let task = repo
        .insert_task(project.id, &NewTask::new(json!({})))
        .await
        .unwrap();
    repo.reject_updates(true);
    let tracker = RedundancyTracker::new(repo.clone());

    let t = tracker.record_answer(answer(&task, 1)).await.unwrap();
    assert_eq!(t.state, TaskState::Completed);

    let stored = repo.get_task(task.id).await.unwrap();
    assert_eq!(stored.state, TaskState::Completed);
    assert_eq!(repo.count_answers(task.id).await.unwrap(), 1);
}

#[tokio::test]
async fn append_returns_the_task_as_stored() {
    let (repo, _, task) = setup(2).await;

    let (stored, t) = repo.append_answer(answer(&task, 1)).await.unwrap();
    assert_eq!(stored.task_id, task.id);
    assert_eq!(t.state, TaskState::Ongoing);
    assert_eq!(t.version, task.version + 1);

    let (_, t) = repo.append_answer(answer(&task, 2)).await.unwrap();
    assert_eq!(t.state, TaskState::Completed);
    assert_eq!(repo.get_task(task.id).await.unwrap().state, TaskState::Completed);
}
