//! End-to-end job tests: client → job worker → task workers, observed
//! through events.

use dips::broker::{Broker, BrokerMessage, MemoryBroker};
use dips::eval::SimpleEvaluator;
use dips::event::{Event, EventKind, Status};
use dips::job::{JobClient, JobPoolConfig, JobWorkerPool};
use dips::model::{Job, JobId, Output, Pipeline, PipelineTask, Stage, TaskRequest};
use dips::mux::{Consumer, Multiplexer, MuxConfig};
use dips::queues;
use dips::rpc::RetryPolicy;
use dips::sandbox::LocalContextFactory;
use dips::worker::{FnHandler, TaskPoolConfig, TaskWorkerPool};
use serde_json::{Value, json};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn process(broker: &MemoryBroker) -> Multiplexer {
    Multiplexer::start(
        Arc::new(broker.clone()),
        MuxConfig {
            reconnect_delay: Duration::from_millis(20),
            declare_interval: Duration::from_millis(20),
            receive_wait: Duration::from_millis(50),
            redelivery_backoff: Duration::from_millis(5),
            ..MuxConfig::default()
        },
    )
}

fn object(value: Value) -> Output {
    value.as_object().cloned().unwrap_or_default()
}

type Calls = Arc<Mutex<Vec<(String, Output)>>>;

/// A running cluster: one job worker process, one task worker process
/// serving `build`, and a client process that also watches events.
struct Cluster {
    broker: MemoryBroker,
    client: JobClient,
    events: [Consumer; 3],
    calls: Calls,
    stop: CancellationToken,
    _work_dir: TempDir,
}

impl Cluster {
    async fn start() -> Self {
        let broker = MemoryBroker::new();
        let jobs = process(&broker);
        let tasks = process(&broker);
        let client = process(&broker);
        let work_dir = tempfile::tempdir().unwrap();
        let stop = CancellationToken::new();

        // Succeeds unless asked to fail; records every invocation.
        let calls: Calls = Arc::default();
        let recorded = Arc::clone(&calls);
        let handler = FnHandler::new(move |request: TaskRequest| {
            let recorded = Arc::clone(&recorded);
            async move {
                recorded
                    .lock()
                    .unwrap()
                    .push((request.name.clone(), request.parameters.clone()));
                if request.parameters.get("fail") == Some(&json!(true)) {
                    anyhow::bail!("{} failed on purpose", request.name);
                }
                Ok(object(json!({"ok": true, "artifact": format!("{}.tar", request.name)})))
            }
        });
        let pool = TaskWorkerPool::new(
            tasks,
            "build",
            Arc::new(handler),
            Arc::new(LocalContextFactory::new(work_dir.path())),
            TaskPoolConfig { concurrency: 2 },
        );
        let token = stop.clone();
        tokio::spawn(async move { pool.run(token).await });

        let workers = JobWorkerPool::new(
            jobs,
            Arc::new(SimpleEvaluator),
            JobPoolConfig {
                concurrency: 2,
                task_timeout: Duration::from_secs(5),
                retry: RetryPolicy::none(),
            },
        );
        let token = stop.clone();
        tokio::spawn(async move { workers.run(token).await });

        let events = [
            client.register_consumer(queues::EVENT_STATUS),
            client.register_consumer(queues::EVENT_MESSAGE),
            client.register_consumer(queues::EVENT_VARIABLE),
        ];
        Self {
            broker,
            client: JobClient::new(&client),
            events,
            calls,
            stop,
            _work_dir: work_dir,
        }
    }

    async fn next_event(&self, wait: Duration) -> Option<Event> {
        let [status, message, variable] = &self.events;
        let msg = tokio::time::timeout(wait, async {
            tokio::select! {
                msg = status.recv() => msg,
                msg = message.recv() => msg,
                msg = variable.recv() => msg,
            }
        })
        .await
        .ok()
        .flatten()?;
        Some(msg.decode_payload().unwrap())
    }

    /// Submit `job` and collect its events until it finishes.
    async fn run(&self, job: Job) -> Vec<Event> {
        let job_id = self.client.submit(job).await.unwrap();
        let mut events = Vec::new();
        loop {
            let event = self
                .next_event(Duration::from_secs(10))
                .await
                .expect("job did not finish");
            let done = event.job_id == job_id && event.task_index.is_none() && is_final(&event);
            if event.job_id == job_id {
                events.push(event);
            }
            if done {
                break;
            }
        }
        // Message and variable events travel on other queues.
        while let Some(event) = self.next_event(Duration::from_millis(200)).await {
            if event.job_id == job_id {
                events.push(event);
            }
        }
        events
    }

    fn called(&self) -> Vec<String> {
        self.calls.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }
}

impl Drop for Cluster {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

fn is_final(event: &Event) -> bool {
    matches!(
        event.kind,
        EventKind::Status {
            status: Status::Completed | Status::Failed,
            ..
        }
    )
}

fn job_status(events: &[Event]) -> Option<Status> {
    events.iter().rev().find_map(|e| match (&e.kind, e.task_index) {
        (EventKind::Status { status, .. }, None) => Some(*status),
        _ => None,
    })
}

fn task_statuses(events: &[Event], index: usize) -> Vec<Status> {
    events
        .iter()
        .filter(|e| e.task_index == Some(index))
        .filter_map(|e| match &e.kind {
            EventKind::Status { status, .. } => Some(*status),
            _ => None,
        })
        .collect()
}

fn task(name: &str) -> PipelineTask {
    PipelineTask::new(name, "build")
}

fn failing(name: &str) -> PipelineTask {
    task(name).parameters(object(json!({"fail": true})))
}

fn job(stages: Vec<(&str, Vec<PipelineTask>)>) -> Job {
    Job::new(
        "test-job",
        Pipeline {
            stages: stages
                .into_iter()
                .map(|(name, tasks)| Stage {
                    name: name.to_string(),
                    tasks,
                })
                .collect(),
        },
    )
}

// ---------------------------------------------------------------------------
// Ordering and failure
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stages_run_in_order() {
    let cluster = Cluster::start().await;
    let events = cluster
        .run(job(vec![
            ("compile", vec![task("a"), task("b")]),
            ("package", vec![task("c")]),
        ]))
        .await;

    assert_eq!(cluster.called(), vec!["a", "b", "c"]);
    assert_eq!(job_status(&events), Some(Status::Completed));
    for index in 0..3 {
        assert_eq!(
            task_statuses(&events, index),
            vec![Status::Running, Status::Succeeded]
        );
    }
}

#[tokio::test]
async fn failure_in_first_stage_prevents_second_stage() {
    let cluster = Cluster::start().await;
    let events = cluster
        .run(job(vec![
            ("compile", vec![failing("a"), task("b")]),
            ("deploy", vec![task("c")]),
        ]))
        .await;

    assert_eq!(cluster.called(), vec!["a"]);
    assert_eq!(job_status(&events), Some(Status::Failed));
    assert_eq!(task_statuses(&events, 0), vec![Status::Running, Status::Failed]);
    assert!(task_statuses(&events, 1).is_empty());
    assert!(task_statuses(&events, 2).is_empty());

    let error = events.iter().find_map(|e| match (&e.kind, e.task_index) {
        (EventKind::Status { error: Some(error), .. }, Some(0)) => Some(error.clone()),
        _ => None,
    });
    assert!(error.unwrap().contains("a failed on purpose"));
}

#[tokio::test]
async fn ignored_failure_lets_the_job_continue() {
    let cluster = Cluster::start().await;
    let events = cluster
        .run(job(vec![
            ("lint", vec![failing("lint").ignore_errors()]),
            ("compile", vec![task("compile")]),
        ]))
        .await;

    assert_eq!(cluster.called(), vec!["lint", "compile"]);
    assert_eq!(task_statuses(&events, 0), vec![Status::Running, Status::Failed]);
    assert_eq!(job_status(&events), Some(Status::Completed));
}

// ---------------------------------------------------------------------------
// Guards, variables, notifications
// ---------------------------------------------------------------------------

#[tokio::test]
async fn falsy_guard_skips_without_dispatch() {
    let cluster = Cluster::start().await;
    let events = cluster
        .run(job(vec![
            ("one", vec![task("skipped").when("false"), task("runs")]),
            ("two", vec![task("later")]),
        ]))
        .await;

    assert_eq!(cluster.called(), vec!["runs", "later"]);
    assert_eq!(task_statuses(&events, 0), vec![Status::Skipped]);
    assert_eq!(job_status(&events), Some(Status::Completed));
}

#[tokio::test]
async fn registered_output_feeds_guards_and_parameters() {
    let cluster = Cluster::start().await;
    let job = job(vec![
        ("inspect", vec![task("inspect").register("inspect")]),
        (
            "deploy",
            vec![
                task("deploy")
                    .when("inspect.ok == true")
                    .parameters(object(json!({"artifact": "{{ inspect.artifact }}"})))
                    .notify("deployed"),
                task("rollback").when("{{ inspect.ok != true }}"),
            ],
        ),
    ])
    .parameters(object(json!({"env": "staging"})));
    let events = cluster.run(job).await;

    assert_eq!(cluster.called(), vec!["inspect", "deploy"]);
    let calls = cluster.calls.lock().unwrap().clone();
    assert_eq!(calls[1].1["artifact"], json!("inspect.tar"));
    assert_eq!(task_statuses(&events, 2), vec![Status::Skipped]);

    let variable = events.iter().find_map(|e| match &e.kind {
        EventKind::Variable { name, value } => Some((name.clone(), value.clone())),
        _ => None,
    });
    assert_eq!(
        variable,
        Some(("inspect".to_string(), json!({"ok": true, "artifact": "inspect.tar"})))
    );

    let message = events.iter().find_map(|e| match &e.kind {
        EventKind::Message { text, .. } => Some((e.task_index, text.clone())),
        _ => None,
    });
    assert_eq!(message, Some((Some(1), "deployed".to_string())));
}

#[tokio::test]
async fn malformed_guard_fails_the_task() {
    let cluster = Cluster::start().await;
    let events = cluster
        .run(job(vec![("only", vec![task("guarded").when("  ")])]))
        .await;

    assert!(cluster.called().is_empty());
    assert_eq!(task_statuses(&events, 0), vec![Status::Failed]);
    assert_eq!(job_status(&events), Some(Status::Failed));
}

#[tokio::test]
async fn jobs_are_identified_in_events() {
    let cluster = Cluster::start().await;
    let job = job(vec![("only", vec![task("x")])]);
    let id: JobId = job.id;
    let events = cluster.run(job).await;
    assert!(!events.is_empty());
    assert!(events.iter().all(|e| e.job_id == id));
    assert_eq!(
        events.first().map(|e| (&e.kind, e.task_index)),
        Some((
            &EventKind::Status {
                status: Status::Running,
                error: None
            },
            None
        ))
    );
}

// ---------------------------------------------------------------------------
// Malformed input and stopping
// ---------------------------------------------------------------------------

#[tokio::test]
async fn malformed_job_requests_are_skipped() {
    let cluster = Cluster::start().await;
    let conn = cluster.broker.connect().await.unwrap();
    conn.declare(queues::JOB).await.unwrap();
    conn.publish(queues::JOB, b"{{{").await.unwrap();
    let not_a_job = BrokerMessage::new("", b"{\"job\": 7}".to_vec());
    conn.publish(queues::JOB, &not_a_job.encode().unwrap()).await.unwrap();

    let events = cluster
        .run(job(vec![("only", vec![task("after-garbage")])]))
        .await;

    assert_eq!(cluster.called(), vec!["after-garbage"]);
    assert_eq!(job_status(&events), Some(Status::Completed));
}

async fn next_status(consumer: &Consumer, wait: Duration) -> Option<Event> {
    let msg = tokio::time::timeout(wait, consumer.recv()).await.ok().flatten()?;
    Some(msg.decode_payload().unwrap())
}

#[tokio::test]
async fn stopped_job_pool_leaves_unstarted_jobs_to_other_pools() {
    let broker = MemoryBroker::new();
    let work_dir = tempfile::tempdir().unwrap();
    let stop = CancellationToken::new();

    let handler = FnHandler::new(|request: TaskRequest| async move {
        tokio::time::sleep(Duration::from_millis(150)).await;
        Ok::<_, anyhow::Error>(object(json!({"task": request.name})))
    });
    let tasks = TaskWorkerPool::new(
        process(&broker),
        "build",
        Arc::new(handler),
        Arc::new(LocalContextFactory::new(work_dir.path())),
        TaskPoolConfig { concurrency: 4 },
    );
    let token = stop.clone();
    tokio::spawn(async move { tasks.run(token).await });

    let pool_config = JobPoolConfig {
        concurrency: 1,
        task_timeout: Duration::from_secs(5),
        retry: RetryPolicy::none(),
    };
    let first = process(&broker);
    let first_pool = JobWorkerPool::new(first.clone(), Arc::new(SimpleEvaluator), pool_config.clone());
    let stop_first = CancellationToken::new();
    let token = stop_first.clone();
    let first_run = tokio::spawn(async move { first_pool.run(token).await });

    let client = process(&broker);
    let statuses = client.register_consumer(queues::EVENT_STATUS);
    let submitter = JobClient::new(&client);
    let mut pending = HashSet::new();
    for n in 0..4 {
        let id = submitter
            .submit(job(vec![("only", vec![task(&format!("t{n}"))])]))
            .await
            .unwrap();
        pending.insert(id);
    }

    let mut finished = Vec::new();
    let mut record = |event: Event, pending: &mut HashSet<JobId>| {
        if event.task_index.is_none() && is_final(&event) && pending.remove(&event.job_id) {
            finished.push(event);
        }
    };

    // Stop the first pool as soon as it is running a job.
    loop {
        let event = next_status(&statuses, Duration::from_secs(5))
            .await
            .expect("no job started");
        let started = event.task_index.is_none()
            && matches!(event.kind, EventKind::Status { status: Status::Running, .. });
        record(event, &mut pending);
        if started {
            break;
        }
    }
    stop_first.cancel();
    first_run.await.unwrap().unwrap();
    first.shutdown(Duration::from_secs(2)).await;

    let second = process(&broker);
    let second_pool = JobWorkerPool::new(second, Arc::new(SimpleEvaluator), pool_config);
    let token = stop.clone();
    tokio::spawn(async move { second_pool.run(token).await });

    while !pending.is_empty() {
        let event = next_status(&statuses, Duration::from_secs(10))
            .await
            .unwrap_or_else(|| panic!("jobs never finished: {pending:?}"));
        record(event, &mut pending);
    }
    drop(record);

    assert_eq!(finished.len(), 4);
    assert!(finished.iter().all(|e| matches!(
        e.kind,
        EventKind::Status { status: Status::Completed, .. }
    )));
    stop.cancel();
}
