use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use loomwork::{
    ActivityContext, ActivityOptions, BackoffStrategy, ClientError, RetryPolicy, WorkflowContext,
    WorkflowError, WorkflowInstanceOptions,
};

mod common;
use common::{kind_names, Harness};

async fn add(_ctx: ActivityContext, input: (i64, i64)) -> Result<i64, String> {
    Ok(input.0 + input.1)
}

fn adder(ctx: WorkflowContext, input: (i64, i64)) -> Result<i64, WorkflowError> {
    ctx.execute_activity(ActivityOptions::default(), add, input).get(&ctx)
}

#[tokio::test]
async fn hello_activity() {
    let h = Harness::new();
    h.worker.register_workflow(adder);
    h.worker.register_activity(add);
    h.start();

    let instance = h
        .client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("hello-1"), adder, (3i64, 4i64))
        .await
        .unwrap();
    let result: i64 = h
        .client
        .wait_for_result(&instance.instance_id, Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, 7);

    let history = h.client.read_history("hello-1").await.unwrap();
    assert_eq!(
        kind_names(&history),
        vec![
            "WorkflowExecutionStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "WorkflowExecutionFinished",
        ]
    );
    // Completion correlates back to the schedule event.
    assert_eq!(history[1].schedule_event_id, history[2].schedule_event_id);
}

async fn upper(_ctx: ActivityContext, input: String) -> Result<String, String> {
    Ok(input.to_uppercase())
}

async fn exclaim(_ctx: ActivityContext, input: String) -> Result<String, String> {
    Ok(format!("{input}!"))
}

fn chain(ctx: WorkflowContext, input: String) -> Result<String, WorkflowError> {
    let step1: String = ctx
        .execute_activity(ActivityOptions::default(), upper, input)
        .get(&ctx)?;
    ctx.execute_activity(ActivityOptions::default(), exclaim, step1).get(&ctx)
}

#[tokio::test]
async fn activities_chain_across_tasks() {
    let h = Harness::new();
    h.worker.register_workflow(chain);
    h.worker.register_activity(upper);
    h.worker.register_activity(exclaim);
    h.start();

    h.client
        .create_workflow_instance(
            WorkflowInstanceOptions::with_instance_id("chain-1"),
            chain,
            "hey".to_string(),
        )
        .await
        .unwrap();
    let result: String = h
        .client
        .wait_for_result("chain-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "HEY!");

    let history = h.client.read_history("chain-1").await.unwrap();
    let schedules: Vec<u64> = history
        .iter()
        .filter(|e| e.kind_name() == "ActivityScheduled")
        .map(|e| e.schedule_event_id)
        .collect();
    assert_eq!(schedules, vec![1, 2]);
}

fn failing_workflow(_ctx: WorkflowContext, _input: ()) -> Result<(), WorkflowError> {
    Err(WorkflowError::application("nope"))
}

#[tokio::test]
async fn workflow_failure_is_recorded() {
    let h = Harness::new();
    h.worker.register_workflow(failing_workflow);
    h.start();

    h.client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("fail-1"), failing_workflow, ())
        .await
        .unwrap();
    let err = h
        .client
        .wait_for_result::<()>("fail-1", Duration::from_secs(5))
        .await
        .unwrap_err();
    match err {
        ClientError::WorkflowFailed(details) => assert_eq!(details.message, "nope"),
        other => panic!("unexpected error: {other}"),
    }
}

async fn flaky(_ctx: ActivityContext, _input: ()) -> Result<String, String> {
    static CALLS: AtomicU32 = AtomicU32::new(0);
    if CALLS.fetch_add(1, Ordering::SeqCst) == 0 {
        Err("transient".to_string())
    } else {
        Ok("recovered".to_string())
    }
}

fn flaky_caller(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    let options = ActivityOptions {
        retry: RetryPolicy::new(3).with_backoff(BackoffStrategy::None),
    };
    ctx.execute_activity(options, flaky, ()).get(&ctx)
}

#[tokio::test]
async fn activity_retries_until_success() {
    let h = Harness::new();
    h.worker.register_workflow(flaky_caller);
    h.worker.register_activity(flaky);
    h.start();

    h.client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("flaky-1"), flaky_caller, ())
        .await
        .unwrap();
    let result: String = h
        .client
        .wait_for_result("flaky-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "recovered");

    let history = h.client.read_history("flaky-1").await.unwrap();
    let kinds = kind_names(&history);
    assert_eq!(kinds.iter().filter(|k| **k == "ActivityScheduled").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "ActivityFailed").count(), 1);
    assert_eq!(kinds.iter().filter(|k| **k == "ActivityCompleted").count(), 1);
}

async fn always_fails(_ctx: ActivityContext, _input: ()) -> Result<(), String> {
    Err("broken".to_string())
}

fn surfacing(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    let options = ActivityOptions {
        retry: RetryPolicy::new(2).with_backoff(BackoffStrategy::None),
    };
    match ctx.execute_activity::<_, _, ()>(options, always_fails, ()).get(&ctx) {
        Err(WorkflowError::ActivityFailed { message }) => Ok(format!("saw: {message}")),
        other => Ok(format!("unexpected: {other:?}")),
    }
}

#[tokio::test]
async fn exhausted_retries_surface_the_error() {
    let h = Harness::new();
    h.worker.register_workflow(surfacing);
    h.worker.register_activity(always_fails);
    h.start();

    h.client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("exhaust-1"), surfacing, ())
        .await
        .unwrap();
    let result: String = h
        .client
        .wait_for_result("exhaust-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(result, "saw: broken");

    let history = h.client.read_history("exhaust-1").await.unwrap();
    let kinds = kind_names(&history);
    assert_eq!(kinds.iter().filter(|k| **k == "ActivityScheduled").count(), 2);
    assert_eq!(kinds.iter().filter(|k| **k == "ActivityFailed").count(), 2);
}

fn effectful(ctx: WorkflowContext, _input: ()) -> Result<(String, String), WorkflowError> {
    // Recorded once, identical during replay.
    let token: String = ctx.side_effect(|| "t-123".to_string()).get(&ctx)?;
    let echoed: String = ctx
        .execute_activity(ActivityOptions::default(), upper, token.clone())
        .get(&ctx)?;
    Ok((token, echoed))
}

#[tokio::test]
async fn side_effects_are_recorded_and_replayed() {
    let h = Harness::new();
    h.worker.register_workflow(effectful);
    h.worker.register_activity(upper);
    h.start();

    h.client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("fx-1"), effectful, ())
        .await
        .unwrap();
    let (token, echoed): (String, String) = h
        .client
        .wait_for_result("fx-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert_eq!(token, "t-123");
    assert_eq!(echoed, "T-123");

    let history = h.client.read_history("fx-1").await.unwrap();
    assert!(kind_names(&history).contains(&"SideEffectResult"));
}

async fn panicky(_ctx: ActivityContext, _input: ()) -> Result<(), String> {
    panic!("activity blew up");
}

fn panic_observer(ctx: WorkflowContext, _input: ()) -> Result<String, WorkflowError> {
    match ctx.execute_activity::<_, _, ()>(ActivityOptions::default(), panicky, ()).get(&ctx) {
        Err(WorkflowError::ActivityFailed { message }) => Ok(message),
        other => Ok(format!("unexpected: {other:?}")),
    }
}

#[tokio::test]
async fn activity_panic_becomes_failure() {
    let h = Harness::new();
    h.worker.register_workflow(panic_observer);
    h.worker.register_activity(panicky);
    h.start();

    h.client
        .create_workflow_instance(WorkflowInstanceOptions::with_instance_id("panic-1"), panic_observer, ())
        .await
        .unwrap();
    let message: String = h
        .client
        .wait_for_result("panic-1", Duration::from_secs(5))
        .await
        .unwrap();
    assert!(message.contains("activity blew up"), "got: {message}");
}
