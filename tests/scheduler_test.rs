//! Integration tests for the task scheduler over the in-memory adapters.

use std::sync::Arc;
use std::time::Duration;

use crowdsched::guard::ContributionGuard;
use crowdsched::lock::MemoryLockStore;
use crowdsched::model::*;
use crowdsched::repo::{InMemoryRepository, TaskRepository};
use crowdsched::sched::{Scheduler, SchedulerPolicy};
use crowdsched::tracker::RedundancyTracker;
use serde_json::json;

const TTL: Duration = Duration::from_secs(60);

struct Fixture {
    repo: Arc<InMemoryRepository>,
    guard: ContributionGuard,
    scheduler: Scheduler,
    tracker: RedundancyTracker,
    project: Project,
}

async fn fixture(policy: SchedulerPolicy) -> Fixture {
    let repo = Arc::new(InMemoryRepository::new());
    let guard = ContributionGuard::new(Arc::new(MemoryLockStore::new()));
    let project = repo
        .create_project(NewProject::new("sched").scheduler(policy))
        .await
        .unwrap();
    Fixture {
        scheduler: Scheduler::new(repo.clone(), guard.clone()),
        tracker: RedundancyTracker::new(repo.clone()),
        repo,
        guard,
        project,
    }
}

impl Fixture {
    async fn add(&self, priority: f64, n_answers: u32) -> Task {
        self.repo
            .insert_task(
                self.project.id,
                &NewTask::new(json!({})).priority(priority).n_answers(n_answers),
            )
            .await
            .unwrap()
    }

    async fn answer(&self, task: &Task, requester: &Requester) -> Task {
        self.tracker
            .record_answer(NewAnswer {
                task_id: task.id,
                project_id: task.project_id,
                requester: requester.clone(),
                info: json!({"a": 1}),
            })
            .await
            .unwrap()
    }

    async fn next(&self, requester: &Requester, offset: usize) -> Option<TaskId> {
        self.scheduler
            .next_task(self.project.id, self.project.scheduler, requester, offset)
            .await
            .unwrap()
            .map(|t| t.id)
    }
}

#[tokio::test]
async fn never_offers_a_task_the_requester_answered() {
    let f = fixture(SchedulerPolicy::PriorityFirst).await;
    let low = f.add(0.1, 3).await;
    let high = f.add(0.9, 3).await;
    let me = Requester::User(1);

    assert_eq!(f.next(&me, 0).await, Some(high.id));
    f.answer(&high, &me).await;
    assert_eq!(f.next(&me, 0).await, Some(low.id));
    f.answer(&low, &me).await;
    assert_eq!(f.next(&me, 0).await, None);

    // Someone else still sees both.
    assert_eq!(f.next(&Requester::User(2), 0).await, Some(high.id));
}

#[tokio::test]
async fn completed_tasks_are_not_offered() {
    let f = fixture(SchedulerPolicy::PriorityFirst).await;
    let task = f.add(1.0, 1).await;
    let done = f.answer(&task, &Requester::User(1)).await;
    assert_eq!(done.state, TaskState::Completed);
    assert_eq!(f.next(&Requester::User(2), 0).await, None);
}

#[tokio::test(start_paused = true)]
async fn other_reservations_fill_the_remaining_slots() {
    let f = fixture(SchedulerPolicy::PriorityFirst).await;
    let task = f.add(1.0, 2).await;
    f.answer(&task, &Requester::User(1)).await;

    // One slot left, taken by a live reservation.
    assert!(f.guard.acquire(&task, &Requester::User(2), TTL).await.unwrap());
    assert_eq!(f.next(&Requester::User(3), 0).await, None);

    // Abandoned: the reservation runs out and the slot reopens.
    tokio::time::advance(TTL + Duration::from_secs(1)).await;
    assert_eq!(f.next(&Requester::User(3), 0).await, Some(task.id));
}

#[tokio::test]
async fn own_reservation_is_not_re_offered() {
    let f = fixture(SchedulerPolicy::PriorityFirst).await;
    let first = f.add(1.0, 5).await;
    let second = f.add(0.5, 5).await;
    let me = Requester::Anonymous("192.0.2.1".into());

    f.guard.acquire(&first, &me, TTL).await.unwrap();
    assert_eq!(f.next(&me, 0).await, Some(second.id));
}

#[tokio::test]
async fn offset_skips_eligible_candidates() {
    let f = fixture(SchedulerPolicy::DepthFirst).await;
    let a = f.add(0.0, 1).await;
    let b = f.add(0.0, 1).await;
    let me = Requester::User(1);

    assert_eq!(f.next(&me, 0).await, Some(a.id));
    assert_eq!(f.next(&me, 1).await, Some(b.id));
    assert_eq!(f.next(&me, 2).await, None);
}

#[tokio::test]
async fn breadth_first_prefers_newest() {
    let f = fixture(SchedulerPolicy::BreadthFirst).await;
    f.add(5.0, 1).await;
    let newest = f.add(0.0, 1).await;
    assert_eq!(f.next(&Requester::User(1), 0).await, Some(newest.id));
}

#[tokio::test]
async fn locked_policy_follows_assignment_list() {
    let f = fixture(SchedulerPolicy::Locked).await;
    let a = f.add(9.0, 1).await;
    let b = f.add(0.0, 1).await;
    let c = f.add(0.0, 1).await;
    let me = Requester::User(1);

    assert_eq!(f.next(&me, 0).await, None);

    f.repo.assign(f.project.id, &me, &[c.id, b.id]).await.unwrap();
    assert_eq!(f.next(&me, 0).await, Some(c.id));
    assert_eq!(f.next(&me, 1).await, Some(b.id));
    assert_ne!(f.next(&me, 0).await, Some(a.id));

    // Others have no list, so nothing.
    assert_eq!(f.next(&Requester::User(2), 0).await, None);
}

#[tokio::test]
async fn locked_policy_ignores_the_reservation_cap() {
    let f = fixture(SchedulerPolicy::Locked).await;
    let task = f.add(0.0, 1).await;
    let me = Requester::User(1);
    f.repo.assign(f.project.id, &me, &[task.id]).await.unwrap();
    f.guard.acquire(&task, &Requester::User(2), TTL).await.unwrap();

    assert_eq!(f.next(&me, 0).await, Some(task.id));
}

#[tokio::test]
async fn random_draws_from_top_priority_band() {
    let f = fixture(SchedulerPolicy::Random).await;
    f.add(0.1, 1).await;
    let a = f.add(0.7, 1).await;
    let b = f.add(0.7, 1).await;

    for _ in 0..20 {
        let picked = f.next(&Requester::User(1), 0).await.unwrap();
        assert!(picked == a.id || picked == b.id);
    }
}
