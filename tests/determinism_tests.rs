use std::sync::Arc;
use std::time::Duration;

use loomwork::backend::{TaskKind, WorkflowTask};
use loomwork::command::CommandKind;
use loomwork::converter::JsonConverter;
use loomwork::executor::{ExecutorError, WorkflowExecutor};
use loomwork::registry::{FnWorkflow, Registry};
use loomwork::{
    ActivityOptions, Event, EventKind, WorkflowContext, WorkflowError, WorkflowInstance,
};

fn test_registry<F>(name: &str, f: F) -> Arc<Registry>
where
    F: Fn(WorkflowContext, String) -> Result<String, WorkflowError> + Send + Sync + 'static,
{
    let registry = Arc::new(Registry::new());
    registry.register_workflow_handler(name, Arc::new(FnWorkflow::new(f, Arc::new(JsonConverter))));
    registry
}

fn executor(registry: &Arc<Registry>) -> WorkflowExecutor {
    WorkflowExecutor::new(registry.clone(), Arc::new(JsonConverter))
}

fn started(name: &str) -> Event {
    Event::new(EventKind::WorkflowExecutionStarted {
        name: name.to_string(),
        inputs: serde_json::to_vec("in").unwrap(),
    })
}

fn pipeline(ctx: WorkflowContext, input: String) -> Result<String, WorkflowError> {
    let first: String = ctx
        .execute_activity_named(ActivityOptions::default(), "StepOne", input)
        .get(&ctx)?;
    ctx.schedule_timer(Duration::from_millis(10)).get(&ctx)?;
    let second: String = ctx
        .execute_activity_named(ActivityOptions::default(), "StepTwo", first)
        .get(&ctx)?;
    Ok(second)
}

fn command_shape(executor: &WorkflowExecutor, task: &WorkflowTask) -> (Vec<(u64, &'static str)>, Vec<String>) {
    let (output, _run) = executor.execute(task).expect("task executes");
    let commands = output
        .commands
        .iter()
        .map(|c| (c.schedule_event_id, c.kind_name()))
        .collect();
    let events = output
        .executed_events
        .iter()
        .map(|e| format!("{}#{}", e.kind_name(), e.schedule_event_id))
        .collect();
    (commands, events)
}

#[tokio::test]
async fn replay_of_identical_history_yields_identical_commands() {
    let registry = test_registry("pipeline", pipeline);
    let instance = WorkflowInstance::new("det-1", "e1");

    // First task: only the start event.
    let first_task = WorkflowTask {
        instance: instance.clone(),
        history: Vec::new(),
        new_events: vec![started("pipeline")],
        kind: TaskKind::New,
    };
    let (commands_a, events_a) = command_shape(&executor(&registry), &first_task);
    let (commands_b, events_b) = command_shape(&executor(&registry), &first_task);
    assert_eq!(commands_a, commands_b);
    assert_eq!(events_a, events_b);
    assert_eq!(commands_a, vec![(1, "ScheduleActivity")]);

    // Later task: activity completed in history, timer completion arriving.
    let exec = executor(&registry);
    let (first_output, _run) = exec.execute(&first_task).expect("first task");
    let mut history = first_output.executed_events.clone();
    history.push(
        Event::new(EventKind::ActivityCompleted {
            result: serde_json::to_vec("mid").unwrap(),
        })
        .with_schedule_event_id(1),
    );

    // Run the instance forward once so the timer schedule event exists.
    let (mid_output, _run) = executor(&registry)
        .execute(&WorkflowTask {
            instance: instance.clone(),
            history: history.clone(),
            new_events: Vec::new(),
            kind: TaskKind::New,
        })
        .expect("mid task");
    let timer_scheduled = mid_output
        .executed_events
        .iter()
        .find(|e| e.kind_name() == "TimerScheduled")
        .expect("timer command materialized")
        .clone();

    let mut full_history = history.clone();
    full_history.push(timer_scheduled);
    let fired = Event::new(EventKind::TimerFired { fire_at_ms: 0 }).with_schedule_event_id(2);
    let third_task = WorkflowTask {
        instance: instance.clone(),
        history: full_history,
        new_events: vec![fired],
        kind: TaskKind::New,
    };
    let (commands_a, events_a) = command_shape(&executor(&registry), &third_task);
    let (commands_b, events_b) = command_shape(&executor(&registry), &third_task);
    assert_eq!(commands_a, commands_b);
    assert_eq!(events_a, events_b);
    assert_eq!(commands_a, vec![(3, "ScheduleActivity")]);
}

fn timer_first(ctx: WorkflowContext, _input: String) -> Result<String, WorkflowError> {
    ctx.schedule_timer(Duration::from_millis(10)).get(&ctx)?;
    Ok("t".to_string())
}

#[tokio::test]
async fn swapped_workflow_body_is_detected_as_nondeterministic() {
    // History was produced by a workflow that scheduled an activity first.
    let registry = test_registry("pipeline", pipeline);
    let (first_output, _run) = executor(&registry)
        .execute(&WorkflowTask {
            instance: WorkflowInstance::new("det-2", "e1"),
            history: Vec::new(),
            new_events: vec![started("pipeline")],
            kind: TaskKind::New,
        })
        .expect("original code runs");

    // The deployed code now schedules a timer first. Replay must fail rather
    // than commit diverging commands.
    let swapped = test_registry("pipeline", timer_first);
    let result = executor(&swapped).execute(&WorkflowTask {
        instance: WorkflowInstance::new("det-2", "e1"),
        history: first_output.executed_events.clone(),
        new_events: Vec::new(),
        kind: TaskKind::New,
    });
    match result {
        Err(ExecutorError::NonDeterministic(_)) => {}
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("nondeterminism not detected"),
    }
}

#[tokio::test]
async fn executed_events_start_with_consumed_events() {
    let registry = test_registry("pipeline", pipeline);
    let start = started("pipeline");
    let start_id = start.id.clone();
    let (output, _run) = executor(&registry)
        .execute(&WorkflowTask {
            instance: WorkflowInstance::new("det-3", "e1"),
            history: Vec::new(),
            new_events: vec![start],
            kind: TaskKind::New,
        })
        .expect("task executes");
    assert_eq!(output.executed_events[0].id, start_id);
    assert!(output.executed_events.len() > 1);
    assert!(!output.completed);
}

#[tokio::test]
async fn missing_cache_refuses_continuation() {
    let registry = test_registry("pipeline", pipeline);
    let exec = executor(&registry);
    let result = exec.execute(&WorkflowTask {
        instance: WorkflowInstance::new("det-4", "e1"),
        history: vec![started("pipeline")],
        new_events: Vec::new(),
        kind: TaskKind::Continuation,
    });
    assert!(matches!(result, Err(ExecutorError::MissingCache)));
}

#[tokio::test]
async fn unregistered_workflow_fails_the_task() {
    let registry = Arc::new(Registry::new());
    let exec = WorkflowExecutor::new(registry, Arc::new(JsonConverter));
    let result = exec.execute(&WorkflowTask {
        instance: WorkflowInstance::new("det-5", "e1"),
        history: Vec::new(),
        new_events: vec![started("ghost")],
        kind: TaskKind::New,
    });
    assert!(matches!(result, Err(ExecutorError::WorkflowNotRegistered(_))));
}

#[tokio::test]
async fn completing_workflow_emits_finished_event() {
    let registry = test_registry("trivial", |_ctx, input: String| Ok(input));
    let (output, _run) = executor(&registry)
        .execute(&WorkflowTask {
            instance: WorkflowInstance::new("det-6", "e1"),
            history: Vec::new(),
            new_events: vec![started("trivial")],
            kind: TaskKind::New,
        })
        .expect("task executes");
    assert!(output.completed);
    assert!(output.executed_events.last().unwrap().is_terminal());
    assert!(output
        .commands
        .iter()
        .any(|c| matches!(c.kind, CommandKind::CompleteWorkflow { .. })));
}
