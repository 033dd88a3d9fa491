use std::sync::Arc;
use std::time::Duration;

use loomwork::backend::sqlite::SqliteBackend;
use loomwork::backend::{Backend, BackendError, BackendOptions, TaskKind};
use loomwork::{
    ActivityContext, ActivityOptions, Client, Worker, WorkflowContext, WorkflowError, WorkflowInstanceOptions,
};
use tokio_util::sync::CancellationToken;

mod common;
use common::kind_names;

async fn double(_ctx: ActivityContext, input: i64) -> Result<i64, String> {
    Ok(input * 2)
}

fn doubler(ctx: WorkflowContext, input: i64) -> Result<i64, WorkflowError> {
    ctx.execute_activity(ActivityOptions::default(), double, input).get(&ctx)
}

fn napper(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    ctx.schedule_timer(Duration::from_millis(60)).get(&ctx)?;
    Ok("rested".to_string())
}

#[tokio::test]
async fn sqlite_backend_runs_workflows_end_to_end() {
    let backend = Arc::new(
        SqliteBackend::new_in_memory(BackendOptions::default())
            .await
            .unwrap(),
    );
    let client = Client::new(backend.clone());
    let worker = Arc::new(Worker::new(backend.clone()));
    worker.register_workflow(doubler);
    worker.register_activity(double);
    let shutdown = CancellationToken::new();
    worker.clone().start(shutdown.clone());

    client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("sq-1"), doubler, 21i64)
        .await
        .unwrap();
    let result: i64 = client.wait_for_result("sq-1", Duration::from_secs(10)).await.unwrap();
    assert_eq!(result, 42);

    let history = client.read_history("sq-1").await.unwrap();
    assert_eq!(
        kind_names(&history),
        vec![
            "WorkflowExecutionStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "WorkflowExecutionFinished",
        ]
    );
    shutdown.cancel();
}

#[tokio::test]
async fn sqlite_defers_timer_events_until_visible() {
    let backend = Arc::new(
        SqliteBackend::new_in_memory(BackendOptions::default())
            .await
            .unwrap(),
    );
    let client = Client::new(backend.clone());
    let worker = Arc::new(Worker::new(backend.clone()));
    worker.register_workflow(napper);
    let shutdown = CancellationToken::new();
    worker.clone().start(shutdown.clone());

    client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("sq-2"), napper, ())
        .await
        .unwrap();
    let result: String = client.wait_for_result("sq-2", Duration::from_secs(10)).await.unwrap();
    assert_eq!(result, "rested");

    let history = client.read_history("sq-2").await.unwrap();
    let kinds = kind_names(&history);
    assert!(kinds.contains(&"TimerScheduled"));
    assert!(kinds.contains(&"TimerFired"));
    shutdown.cancel();
}

#[tokio::test]
async fn expired_lease_lets_a_second_worker_redo_the_task() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("lease.db");
    let options = BackendOptions {
        workflow_lock_timeout: Duration::from_millis(150),
        activity_lock_timeout: Duration::from_millis(150),
        sticky_timeout: Duration::from_millis(50),
    };
    let worker_a = SqliteBackend::new(&path, options.clone())
        .await
        .unwrap()
        .with_worker_name("worker-a");
    let worker_b = SqliteBackend::new(&path, options)
        .await
        .unwrap()
        .with_worker_name("worker-b");

    let client = Client::new(Arc::new(
        SqliteBackend::new(&path, BackendOptions::default()).await.unwrap(),
    ));
    client
        .create_workflow_instance_named(WorkflowInstanceOptions::with_instance_id("sq-3"), "doubler", 1i64)
        .await
        .unwrap();

    // Worker A leases the task and crashes before committing.
    let task_a = worker_a
        .get_workflow_task()
        .await
        .unwrap()
        .expect("task for worker a");
    assert_eq!(task_a.kind, TaskKind::New);

    // Before the lease expires nobody else can take the instance.
    assert!(worker_b.get_workflow_task().await.unwrap().is_none());
    tokio::time::sleep(Duration::from_millis(250)).await;

    // After expiry the second worker sees the identical task.
    let task_b = worker_b
        .get_workflow_task()
        .await
        .unwrap()
        .expect("task for worker b");
    assert_eq!(task_b.instance, task_a.instance);
    assert_eq!(
        task_a.new_events.iter().map(|e| e.id.clone()).collect::<Vec<_>>(),
        task_b.new_events.iter().map(|e| e.id.clone()).collect::<Vec<_>>()
    );
    assert_eq!(task_a.history.len(), task_b.history.len());

    // Worker B commits; worker A's late commit is rejected.
    worker_b
        .complete_workflow_task(&task_b.instance, task_b.new_events.clone(), Vec::new())
        .await
        .unwrap();
    let late = worker_a
        .complete_workflow_task(&task_a.instance, task_a.new_events.clone(), Vec::new())
        .await;
    assert_eq!(late, Err(BackendError::LostLease));

    // The events moved from pending to history exactly once.
    let history = worker_b.read_history("sq-3").await.unwrap();
    assert_eq!(history.len(), task_b.new_events.len());
}

#[tokio::test]
async fn sqlite_rejects_cancel_of_unknown_instance() {
    let backend = SqliteBackend::new_in_memory(BackendOptions::default()).await.unwrap();
    let ghost = loomwork::WorkflowInstance::new("nope", "e1");
    assert!(matches!(
        backend.cancel_workflow_instance(&ghost).await,
        Err(BackendError::NotFound(_))
    ));
}

#[tokio::test]
async fn sqlite_create_is_idempotent_per_execution() {
    let backend = SqliteBackend::new_in_memory(BackendOptions::default()).await.unwrap();

    let instance = loomwork::WorkflowInstance::new("sq-4", "e1");
    let event = loomwork::Event::new(loomwork::EventKind::WorkflowExecutionStarted {
        name: "doubler".to_string(),
        inputs: Vec::new(),
    });
    let we = loomwork::WorkflowEvent {
        instance: instance.clone(),
        event,
    };
    backend.create_workflow_instance(we.clone()).await.unwrap();
    backend.create_workflow_instance(we.clone()).await.unwrap();

    let other = loomwork::WorkflowEvent {
        instance: loomwork::WorkflowInstance::new("sq-4", "e2"),
        event: loomwork::Event::new(loomwork::EventKind::WorkflowExecutionStarted {
            name: "doubler".to_string(),
            inputs: Vec::new(),
        }),
    };
    assert_eq!(
        backend.create_workflow_instance(other).await,
        Err(BackendError::AlreadyExists)
    );
}
