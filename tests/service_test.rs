//! End-to-end contributor and administrator flows through `TaskService`.

use std::sync::Arc;
use std::time::Duration;

use crowdsched::error::Error;
use crowdsched::lock::MemoryLockStore;
use crowdsched::model::*;
use crowdsched::queue::MemoryQueue;
use crowdsched::repo::{InMemoryRepository, TaskRepository};
use crowdsched::router::{RoutePolicy, RouteTable};
use crowdsched::sched::SchedulerPolicy;
use crowdsched::service::{Contribution, TaskService};
use serde_json::json;

fn routes() -> RouteTable {
    let mut table = RouteTable::default();
    // Keep exports inline so their effect is visible in the test.
    table.set(OperationKind::Export, RoutePolicy::new(1000, 60, false));
    table
}

async fn setup(n_answers: u32) -> (Arc<InMemoryRepository>, TaskService, Project, Task) {
    let repo = Arc::new(InMemoryRepository::new());
    let service = TaskService::new(
        repo.clone(),
        Arc::new(MemoryLockStore::new()),
        Arc::new(MemoryQueue::new()),
        routes(),
    );
    let project = service.create_project(NewProject::new("svc")).await.unwrap();
    let task = repo
        .insert_task(project.id, &NewTask::new(json!({"img": "a.png"})).n_answers(n_answers))
        .await
        .unwrap();
    (repo, service, project, task)
}

fn user(id: i64) -> Requester {
    Requester::User(id)
}

#[tokio::test]
async fn two_answers_complete_the_task_and_stop_scheduling() {
    let (_, service, project, task) = setup(2).await;
    let (a, b, c) = (user(1), user(2), user(3));

    let got_a = service.next_task(project.id, &a, 0).await.unwrap().unwrap();
    let got_b = service.next_task(project.id, &b, 0).await.unwrap().unwrap();
    assert_eq!(got_a.id, task.id);
    assert_eq!(got_b.id, task.id);

    // Both slots are reserved.
    assert!(service.next_task(project.id, &c, 0).await.unwrap().is_none());

    let after_a = service.submit_answer(project.id, task.id, &a, json!("cat")).await.unwrap();
    assert_eq!(after_a.state, TaskState::Ongoing);

    let after_b = service.submit_answer(project.id, task.id, &b, json!("cat")).await.unwrap();
    assert_eq!(after_b.state, TaskState::Completed);

    assert!(service.next_task(project.id, &c, 0).await.unwrap().is_none());
    assert!(service.next_task(project.id, &a, 0).await.unwrap().is_none());
}

#[tokio::test]
async fn raising_redundancy_reopens_an_exported_task() {
    let (repo, service, project, task) = setup(1).await;
    let a = user(1);

    service.next_task(project.id, &a, 0).await.unwrap().unwrap();
    service.submit_answer(project.id, task.id, &a, json!(1)).await.unwrap();
    service
        .export_tasks(project.id, Selector::Ids(vec![task.id]), "admin")
        .await
        .unwrap();
    let t = repo.get_task(task.id).await.unwrap();
    assert_eq!(t.state, TaskState::Completed);
    assert!(t.exported);

    let outcome = service
        .set_redundancy(project.id, Selector::Ids(vec![task.id]), 3, "admin")
        .await
        .unwrap();
    assert!(!outcome.is_enqueued());

    let t = repo.get_task(task.id).await.unwrap();
    assert_eq!(t.state, TaskState::Ongoing);
    assert!(!t.exported);
    assert_eq!(t.n_answers, 3);

    let b = user(2);
    let got = service.next_task(project.id, &b, 0).await.unwrap().unwrap();
    assert_eq!(got.id, task.id);
}

#[tokio::test]
async fn answers_need_a_live_reservation() {
    let (_, service, project, task) = setup(2).await;
    let a = user(1);

    let err = service
        .submit_answer(project.id, task.id, &a, json!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotReserved { .. }));
    assert!(err.is_client_error());

    service.next_task(project.id, &a, 0).await.unwrap().unwrap();
    service.submit_answer(project.id, task.id, &a, json!(1)).await.unwrap();

    let err = service
        .submit_answer(project.id, task.id, &a, json!(2))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyAnswered { .. }));
}

#[tokio::test]
async fn reservation_check_can_be_disabled() {
    let (_, service, project, task) = setup(1).await;
    let service = service.require_reservation(false);

    let t = service
        .submit_answer(project.id, task.id, &Requester::Anonymous("10.0.0.1".into()), json!(1))
        .await
        .unwrap();
    assert_eq!(t.state, TaskState::Completed);
}

#[tokio::test]
async fn answer_releases_the_reservation() {
    let (_, service, project, task) = setup(3).await;
    let a = user(1);

    service.next_task(project.id, &a, 0).await.unwrap().unwrap();
    assert!(service.guard().is_reserved(&task, &a).await.unwrap());

    service.submit_answer(project.id, task.id, &a, json!(1)).await.unwrap();
    assert!(!service.guard().is_reserved(&task, &a).await.unwrap());
}

#[tokio::test]
async fn task_status_lists_answers_then_reservations() {
    let (_, service, project, task) = setup(3).await;
    let (a, b) = (user(1), user(2));

    service.next_task(project.id, &a, 0).await.unwrap().unwrap();
    service.next_task(project.id, &b, 0).await.unwrap().unwrap();
    service.submit_answer(project.id, task.id, &a, json!(1)).await.unwrap();

    let status = service.task_status(project.id, task.id).await.unwrap();
    assert_eq!(status.recorded, 1);
    assert_eq!(status.task.state, TaskState::Ongoing);
    assert_eq!(status.contributors.len(), 2);
    assert_eq!(status.contributors[0].requester, a);
    assert_eq!(status.contributors[0].contribution, Contribution::Completed);
    assert_eq!(status.contributors[1].requester, b);
    assert!(matches!(
        status.contributors[1].contribution,
        Contribution::Locked { remaining_secs } if remaining_secs > 0
    ));
}

#[tokio::test]
async fn presenting_twice_keeps_the_first_stamp() {
    let (_, service, project, task) = setup(1).await;
    let a = user(1);
    service.next_task(project.id, &a, 0).await.unwrap().unwrap();

    let first = service.present_task(project.id, task.id, &a).await.unwrap();
    let second = service.present_task(project.id, task.id, &a).await.unwrap();
    assert_eq!(first, second);
    assert!(service.guard().is_reserved(&task, &a).await.unwrap());
}

#[tokio::test]
async fn task_from_another_project_is_rejected() {
    let (_, service, _, task) = setup(1).await;
    let other = service.create_project(NewProject::new("other")).await.unwrap();

    let err = service
        .submit_answer(other.id, task.id, &user(1), json!(1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::WrongProject { .. }));
}

#[tokio::test]
async fn configure_project_rejects_zero_timeout() {
    let (_, service, project, _) = setup(1).await;

    let updated = service
        .configure_project(
            project.id,
            Some(SchedulerPolicy::DepthFirst),
            Some(Duration::from_secs(30)),
        )
        .await
        .unwrap();
    assert_eq!(updated.scheduler, SchedulerPolicy::DepthFirst);
    assert_eq!(updated.task_timeout, Duration::from_secs(30));

    let err = service
        .configure_project(project.id, None, Some(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTtl(_)));

    let err = service
        .create_project(NewProject::new("zero").task_timeout(Duration::ZERO))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTtl(_)));
}

#[tokio::test]
async fn locked_scheduler_follows_assignments() {
    let (repo, service, project, first) = setup(1).await;
    let second = repo
        .insert_task(project.id, &NewTask::new(json!({})))
        .await
        .unwrap();
    service
        .configure_project(project.id, Some(SchedulerPolicy::Locked), None)
        .await
        .unwrap();

    let a = user(1);
    assert!(service.next_task(project.id, &a, 0).await.unwrap().is_none());

    service.assign(project.id, &a, &[second.id, first.id]).await.unwrap();
    let got = service.next_task(project.id, &a, 0).await.unwrap().unwrap();
    assert_eq!(got.id, second.id);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_for_the_last_slot_has_one_winner() {
    let (_, service, project, task) = setup(1).await;

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let service = service.clone();
            tokio::spawn(async move { service.next_task(project.id, &user(i), 0).await.unwrap() })
        })
        .collect();

    let mut winners = 0;
    for h in handles {
        if let Some(t) = h.await.unwrap() {
            assert_eq!(t.id, task.id);
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}
