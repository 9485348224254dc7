//! Integration tests for the contribution guard.

use std::sync::Arc;
use std::time::Duration;

use crowdsched::guard::ContributionGuard;
use crowdsched::lock::MemoryLockStore;
use crowdsched::model::*;
use crowdsched::repo::{InMemoryRepository, TaskRepository};
use serde_json::json;

const TTL: Duration = Duration::from_secs(60);

async fn task() -> Task {
    let repo = InMemoryRepository::new();
    let project = repo.create_project(NewProject::new("guard")).await.unwrap();
    repo.insert_task(project.id, &NewTask::new(json!({"q": 1})).n_answers(3))
        .await
        .unwrap()
}

fn guard() -> ContributionGuard {
    ContributionGuard::new(Arc::new(MemoryLockStore::new()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquire_for_same_pair_has_one_winner() {
    let guard = guard();
    let task = task().await;
    let requester = Requester::User(7);

    let handles: Vec<_> = (0..32)
        .map(|_| {
            let guard = guard.clone();
            let task = task.clone();
            let requester = requester.clone();
            tokio::spawn(async move { guard.acquire(&task, &requester, TTL).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for h in handles {
        if h.await.unwrap() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(start_paused = true)]
async fn expired_reservation_can_be_reacquired() {
    let guard = guard();
    let task = task().await;
    let requester = Requester::Anonymous("10.0.0.1".into());

    assert!(guard.acquire(&task, &requester, TTL).await.unwrap());
    assert!(!guard.acquire(&task, &requester, TTL).await.unwrap());

    tokio::time::advance(TTL + Duration::from_secs(1)).await;

    assert!(!guard.is_reserved(&task, &requester).await.unwrap());
    assert!(guard.acquire(&task, &requester, TTL).await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn refresh_restarts_the_ttl() {
    let guard = guard();
    let task = task().await;
    let requester = Requester::User(1);

    guard.acquire(&task, &requester, TTL).await.unwrap();
    tokio::time::advance(Duration::from_secs(50)).await;
    guard.refresh(&task, &requester, TTL).await.unwrap();
    tokio::time::advance(Duration::from_secs(30)).await;

    let locks = guard.active_locks(task.project_id, task.id).await.unwrap();
    assert_eq!(locks.get(&requester), Some(&Duration::from_secs(30)));
}

#[tokio::test]
async fn distinct_requesters_reserve_the_same_task() {
    let guard = guard();
    let task = task().await;

    assert!(guard.acquire(&task, &Requester::User(1), TTL).await.unwrap());
    assert!(guard.acquire(&task, &Requester::User(2), TTL).await.unwrap());

    let locks = guard.active_locks(task.project_id, task.id).await.unwrap();
    assert_eq!(locks.len(), 2);

    let by_task = guard.project_locks(task.project_id).await.unwrap();
    assert_eq!(by_task.get(&task.id).map(|l| l.len()), Some(2));
}

#[tokio::test]
async fn release_frees_the_pair() {
    let guard = guard();
    let task = task().await;
    let requester = Requester::User(3);

    guard.acquire(&task, &requester, TTL).await.unwrap();
    assert!(guard.release(&task, &requester).await.unwrap());
    assert!(!guard.release(&task, &requester).await.unwrap());
    assert!(guard.acquire(&task, &requester, TTL).await.unwrap());
}

#[tokio::test]
async fn presentation_stamp_is_one_shot_and_separate_from_reservation() {
    let guard = guard();
    let task = task().await;
    let requester = Requester::User(4);

    assert!(!guard.has_presented(&task, &requester).await.unwrap());
    let first = guard.mark_presented(&task, &requester).await.unwrap();
    let again = guard.mark_presented(&task, &requester).await.unwrap();

    assert_eq!(first, again);
    assert!(guard.has_presented(&task, &requester).await.unwrap());
    assert!(!guard.is_reserved(&task, &requester).await.unwrap());
    assert!(guard.active_locks(task.project_id, task.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn zero_ttl_is_rejected() {
    let guard = guard();
    let task = task().await;
    let err = guard
        .acquire(&task, &Requester::User(1), Duration::ZERO)
        .await
        .unwrap_err();
    assert!(err.is_client_error());
}
