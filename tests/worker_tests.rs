//! Drives the lifecycle worker directly through its queues.


use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;

use gridbridge::error::{BatchError, Result};
use gridbridge::scheduler::{JobId, JobRequest, RunningJobs, UpdatedJob, WaitingJob};
use gridbridge::worker::{NewJob, Worker, WorkerChannels, WorkerSettings};
use test_harness::{assert_eventually, StubDriver};

struct WorkerUnderTest {
    new_jobs: UnboundedSender<NewJob>,
    kills: UnboundedSender<JobId>,
    updated: UnboundedReceiver<UpdatedJob>,
    killed: UnboundedReceiver<JobId>,
    running: Arc<Mutex<RunningJobs>>,
    task: JoinHandle<Result<()>>,
}

fn spawn_worker(stub: &Arc<StubDriver>, max_running: usize, tick: Duration) -> WorkerUnderTest {
    spawn_polling_worker(stub, max_running, tick, Duration::ZERO)
}

fn spawn_polling_worker(
    stub: &Arc<StubDriver>,
    max_running: usize,
    tick: Duration,
    state_polling_wait: Duration,
) -> WorkerUnderTest {
    let (new_jobs_tx, new_jobs_rx) = mpsc::unbounded_channel();
    let (updated_tx, updated_rx) = mpsc::unbounded_channel();
    let (kill_tx, kill_rx) = mpsc::unbounded_channel();
    let (killed_tx, killed_rx) = mpsc::unbounded_channel();
    let running = Arc::new(Mutex::new(RunningJobs::new()));

    let worker = Worker::new(
        stub.clone(),
        WorkerChannels {
            new_jobs: new_jobs_rx,
            updated: updated_tx,
            kills: kill_rx,
            killed: killed_tx,
        },
        running.clone(),
        Arc::new(RwLock::new(HashMap::new())),
        WorkerSettings {
            max_running,
            state_polling_wait,
            kill_poll_interval: Duration::from_millis(10),
            tick,
        },
    );

    WorkerUnderTest {
        new_jobs: new_jobs_tx,
        kills: kill_tx,
        updated: updated_rx,
        killed: killed_rx,
        running,
        task: tokio::spawn(worker.run()),
    }
}

fn job(id: u64, command: &str) -> NewJob {
    NewJob::Job(WaitingJob::new(JobId::from(id), &JobRequest::new(command)))
}

async fn join(task: JoinHandle<Result<()>>) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("worker exits")
        .expect("worker does not panic")
}

#[tokio::test]
async fn test_sentinel_stops_worker() {
    let stub = StubDriver::new();
    let w = spawn_worker(&stub, 2, Duration::from_millis(5));

    w.new_jobs.send(job(1, "a")).unwrap();
    w.new_jobs.send(NewJob::Shutdown).unwrap();

    join(w.task).await.unwrap();
    assert_eq!(stub.submitted(), vec![JobId::from(1)]);
}

#[tokio::test]
async fn test_dropped_facade_stops_worker() {
    let stub = StubDriver::new();
    let w = spawn_worker(&stub, 2, Duration::from_millis(5));

    drop(w.new_jobs);
    join(w.task).await.unwrap();
}

#[tokio::test]
async fn test_one_new_job_per_iteration() {
    let stub = StubDriver::new();
    let w = spawn_worker(&stub, 10, Duration::from_millis(100));

    for id in 1..=3 {
        w.new_jobs.send(job(id, "x")).unwrap();
    }
    assert_eventually(|| stub.submitted().len() == 1, "first job submitted").await;
    assert_eq!(w.running.lock().await.len(), 1);

    assert_eventually(|| stub.submitted().len() == 3, "all jobs submitted").await;
    assert_eq!(
        stub.submitted(),
        vec![JobId::from(1), JobId::from(2), JobId::from(3)]
    );

    w.new_jobs.send(NewJob::Shutdown).unwrap();
    join(w.task).await.unwrap();
}

#[tokio::test]
async fn test_kill_finds_job_still_on_new_job_queue() {
    let stub = StubDriver::new();
    let mut w = spawn_worker(&stub, 1, Duration::from_millis(20));

    w.new_jobs.send(job(1, "runs")).unwrap();
    w.new_jobs.send(job(2, "killed")).unwrap();
    w.kills.send(JobId::from(2)).unwrap();

    let killed = tokio::time::timeout(Duration::from_secs(5), w.killed.recv())
        .await
        .unwrap();
    assert_eq!(killed, Some(JobId::from(2)));

    stub.finish(JobId::from(1), 0);
    let update = tokio::time::timeout(Duration::from_secs(5), w.updated.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.job_id, JobId::from(1));

    w.new_jobs.send(NewJob::Shutdown).unwrap();
    join(w.task).await.unwrap();
    assert_eq!(stub.submitted(), vec![JobId::from(1)]);
}

#[tokio::test]
async fn test_sentinel_absorbed_during_kill_is_honoured() {
    let stub = StubDriver::new();
    let mut w = spawn_worker(&stub, 1, Duration::from_millis(20));

    w.new_jobs.send(job(1, "a")).unwrap();
    w.new_jobs.send(NewJob::Shutdown).unwrap();
    w.kills.send(JobId::from(1)).unwrap();

    join(w.task).await.unwrap();
    assert_eq!(w.killed.recv().await, Some(JobId::from(1)));
    assert!(stub.submitted().is_empty());
}

#[tokio::test]
async fn test_duplicate_kills_confirmed_once() {
    let stub = StubDriver::new();
    let mut w = spawn_worker(&stub, 1, Duration::from_millis(5));

    w.new_jobs.send(job(1, "a")).unwrap();
    assert_eventually(|| stub.submitted().len() == 1, "job submitted").await;

    w.kills.send(JobId::from(1)).unwrap();
    w.kills.send(JobId::from(1)).unwrap();
    assert_eq!(w.killed.recv().await, Some(JobId::from(1)));

    w.new_jobs.send(NewJob::Shutdown).unwrap();
    join(w.task).await.unwrap();
    assert!(w.killed.try_recv().is_err());
    assert_eq!(stub.killed(), vec![JobId::from(1)]);
}

#[tokio::test]
async fn test_exhausted_kill_retries_are_fatal() {
    let stub = StubDriver::new();
    let w = spawn_worker(&stub, 1, Duration::from_millis(5));

    w.new_jobs.send(job(1, "a")).unwrap();
    assert_eventually(|| stub.submitted().len() == 1, "job submitted").await;

    stub.fail_next_kills(3);
    w.kills.send(JobId::from(1)).unwrap();

    let err = join(w.task).await.unwrap_err();
    assert!(matches!(err, BatchError::CommandFailed { .. }));
    assert_eq!(stub.kill_calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_transient_query_failures_are_retried() {
    let stub = StubDriver::new();
    let mut w = spawn_worker(&stub, 1, Duration::from_millis(5));

    w.new_jobs.send(job(1, "a")).unwrap();
    assert_eventually(|| stub.submitted().len() == 1, "job submitted").await;

    stub.finish(JobId::from(1), 9);
    stub.fail_next_queries(2);
    let update = tokio::time::timeout(Duration::from_secs(5), w.updated.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.exit_code, 9);
    assert!(w.running.lock().await.is_empty());

    w.new_jobs.send(NewJob::Shutdown).unwrap();
    join(w.task).await.unwrap();
}

#[tokio::test]
async fn test_completion_polls_throttled_by_polling_wait() {
    let stub = StubDriver::new();
    let mut w = spawn_polling_worker(
        &stub,
        2,
        Duration::from_millis(5),
        Duration::from_millis(400),
    );

    w.new_jobs.send(job(1, "a")).unwrap();
    w.new_jobs.send(job(2, "b")).unwrap();
    assert_eventually(|| stub.submitted().len() == 2, "jobs submitted").await;
    let first_round = stub.query_calls.load(Ordering::SeqCst);
    assert!(first_round <= 2, "one query per running job, got {first_round}");

    // Dozens of ticks pass inside the wait without another query.
    stub.finish(JobId::from(1), 0);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(stub.query_calls.load(Ordering::SeqCst), first_round);
    assert!(w.updated.try_recv().is_err());

    // Once the wait expires the finished job is picked up.
    let update = tokio::time::timeout(Duration::from_secs(5), w.updated.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(update.job_id, JobId::from(1));
    assert!(stub.query_calls.load(Ordering::SeqCst) > first_round);

    w.new_jobs.send(NewJob::Shutdown).unwrap();
    join(w.task).await.unwrap();
}
