//! Recovery tests.
//!
//! Tests for step retries, sandbox recreation, iteration limits,
//! non-critical failures and cancellation.

use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mosaic::agent::ArtifactKind;
use mosaic::llm::Message;
use mosaic::orchestration::{RunOptions, Scheduler, SchedulerEvent, RUN_SUMMARY_FILE};
use mosaic::{Error, RunStatus, StepStatus};

use crate::fixtures::{
    agent_doc, call, flaky_sandboxes, runtime_with, scripted, system, MockLlm, WorkflowDir,
};

/// Given: a step whose model never stops calling tools, followed by a summary
/// When: the looping step reaches max_iterations
/// Then: it completes with a note after exactly that many model turns and
///       the summary runs on its history and artifacts
#[tokio::test]
async fn test_max_iterations_reported_and_run_continues() {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.looper]
next = "summary"
agent_config = "looper.toml"

[steps.summary]
agent_config = "summary.toml"
"#,
    )
    .file(
        "looper.toml",
        r#"
max_iterations = 5

[llm]
model = "mock"

[prompt]
system = "looper"

[tools.file_system]
"#,
    )
    .file("summary.toml", &agent_doc("summary", ""));
    let llm = MockLlm::new(|messages, _| {
        if system(messages) == "looper" {
            return Ok(call("ls", "file_system:list_files", json!({})));
        }
        Ok(Message::assistant("summary done"))
    });

    let report = dir
        .run(runtime_with(llm.clone()).build(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.state.status("looper"), Some(StepStatus::Completed));
    assert_eq!(llm.calls(), 6);

    let looper = &report.outputs["looper"];
    assert_eq!(
        looper.final_answer(),
        Some("Agent looper exceeded max iterations (5)")
    );
    let tool_calls = looper
        .artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::ToolCall)
        .count();
    assert_eq!(tool_calls, 5);

    let summary = &report.outputs["summary"];
    assert_eq!(summary.final_answer(), Some("summary done"));
    assert_eq!(summary.artifacts, looper.artifacts);
}

/// Given: a step with one retry whose first attempt fails
/// When: the workflow runs
/// Then: the second attempt succeeds and both attempts are recorded
#[tokio::test]
async fn test_step_retry_recovers() {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.agent]
agent_config = "a.toml"
retries = 1
"#,
    )
    .file("a.toml", &agent_doc("a", ""));

    // The loop retries a model error once on its own, so the first
    // attempt consumes two failures.
    let failures = Arc::new(AtomicUsize::new(2));
    let remaining = failures.clone();
    let llm = MockLlm::new(move |_, _| {
        if remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Llm("rate limited".into()));
        }
        Ok(Message::assistant("recovered"))
    });
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = dir
        .run(
            runtime_with(llm.clone()).build(),
            RunOptions {
                load_cache: false,
                events: Some(tx),
            },
        )
        .await
        .unwrap();

    assert_eq!(report.final_answer(), Some("recovered"));
    assert_eq!(llm.calls(), 3);
    assert_eq!(report.state.record("agent").unwrap().attempts, 2);

    let mut attempts = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::StepStarted { attempt, .. } = event {
            attempts.push(attempt);
        }
    }
    assert_eq!(attempts, [1, 2]);
}

fn executor_dir(max_resets: u32) -> WorkflowDir {
    let dir = WorkflowDir::new();
    dir.file(
        "agent.toml",
        &format!(
            r#"
[llm]
model = "mock"

[tools.code_executor]
max_resets = {}
"#,
            max_resets
        ),
    );
    dir
}

/// Given: a sandbox that crashes once
/// When: the model runs code
/// Then: the sandbox is recreated and the code runs
#[tokio::test]
async fn test_sandbox_recreated_after_crash() {
    let dir = executor_dir(1);
    let (factory, stats) = flaky_sandboxes(1);
    let llm = scripted(vec![call(
        "c1",
        "code_executor:shell_executor",
        json!({"code": "echo hi"}),
    )]);

    let report = dir
        .run(
            runtime_with(llm).sandbox_factory(factory).build(),
            RunOptions::default(),
        )
        .await
        .unwrap();

    let answer = report.final_answer().unwrap();
    assert!(answer.contains("ran echo hi"), "{}", answer);
    assert_eq!(stats.starts.load(Ordering::SeqCst), 2);
    assert_eq!(stats.executions.load(Ordering::SeqCst), 2);
    // One stop for the crashed sandbox, one at cleanup.
    assert_eq!(stats.stops.load(Ordering::SeqCst), 2);
}

/// Given: a sandbox that keeps crashing
/// When: resets are exhausted
/// Then: the model is told and the agent still finishes
#[tokio::test]
async fn test_sandbox_resets_exhausted() {
    let dir = executor_dir(1);
    let (factory, stats) = flaky_sandboxes(10);
    let llm = scripted(vec![call(
        "c1",
        "code_executor:shell_executor",
        json!({"code": "echo hi"}),
    )]);

    let report = dir
        .run(
            runtime_with(llm).sandbox_factory(factory).build(),
            RunOptions::default(),
        )
        .await
        .unwrap();

    assert_eq!(
        report.final_answer(),
        Some("Tool calling failed: Sandbox error: sandbox crashed")
    );
    assert_eq!(stats.executions.load(Ordering::SeqCst), 2);
}

fn gate_then_summary(critical: bool) -> WorkflowDir {
    let dir = WorkflowDir::new();
    dir.workflow(&format!(
        r#"
[steps.gate]
next = "summary"
agent_config = "gate.toml"
critical = {}

[steps.summary]
agent_config = "summary.toml"
"#,
        critical
    ))
    .file("gate.toml", &agent_doc("gate", ""))
    .file("summary.toml", &agent_doc("summary", ""));
    dir
}

/// Fails every "gate" prompt; answers the rest.
fn failing_gate() -> Arc<MockLlm> {
    MockLlm::new(|messages, _| {
        if system(messages) == "gate" {
            return Err(Error::Llm("gate is down".into()));
        }
        Ok(Message::assistant(format!("{} done", system(messages))))
    })
}

/// Given: a failing non-critical step
/// When: the workflow runs
/// Then: its successor runs on the failed step's input
#[tokio::test]
async fn test_non_critical_failure_passes_input_on() {
    let dir = gate_then_summary(false);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = dir
        .run(
            runtime_with(failing_gate()).build(),
            RunOptions {
                load_cache: false,
                events: Some(tx),
            },
        )
        .await
        .unwrap();

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(report.state.status("gate"), Some(StepStatus::Failed));
    assert_eq!(report.state.status("summary"), Some(StepStatus::Completed));
    assert_eq!(report.final_answer(), Some("summary done"));
    assert!(report.outputs["gate"].messages.is_empty());

    let mut failed = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::StepFailed { step, critical, .. } = event {
            failed.push((step, critical));
        }
    }
    assert_eq!(failed, [("gate".to_string(), false)]);
}

/// Given: a failing critical step
/// When: the workflow runs
/// Then: the run halts before its successor and the summary says failed
#[tokio::test]
async fn test_critical_failure_halts_run() {
    let dir = gate_then_summary(true);
    let llm = failing_gate();

    let err = dir
        .run(runtime_with(llm.clone()).build(), RunOptions::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::StepFailed { ref step, .. } if step == "gate"));
    assert_eq!(llm.calls(), 2);

    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.output_dir().join(RUN_SUMMARY_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["status"], json!("failed"));
    assert_eq!(summary["steps"]["gate"]["status"], json!("failed"));
    assert_eq!(summary["steps"]["summary"]["status"], json!("pending"));
}

/// Given: a slow model
/// When: the run is cancelled mid-call
/// Then: the run stops promptly and is recorded as cancelled
#[tokio::test]
async fn test_cancellation_stops_run() {
    let dir = gate_then_summary(true);
    let llm = MockLlm::delayed(
        |_| Duration::from_secs(30),
        |_, _| Ok(Message::assistant("too late")),
    );
    let mut scheduler =
        Scheduler::new(dir.load().unwrap(), runtime_with(llm).build(), RunOptions::default())
            .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = scheduler.run(dir.context(), &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));

    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.output_dir().join(RUN_SUMMARY_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["status"], json!("cancelled"));
    assert_eq!(summary["steps"]["summary"]["status"], json!("pending"));
}

/// Given: a parent that split into children, each holding a sandbox
/// When: the run is cancelled while the children wait on the model
/// Then: every child and the parent stop their sandboxes before the run ends
#[tokio::test]
async fn test_cancellation_releases_child_sandboxes() {
    let dir = WorkflowDir::new();
    dir.file(
        "agent.toml",
        r#"
[llm]
model = "mock"

[prompt]
system = "parent"
query = "Check both services"

[tools.code_executor]

[tools.split_task]
"#,
    );
    let llm = MockLlm::delayed(
        |messages| {
            if system(messages) == "child" {
                Duration::from_secs(30)
            } else {
                Duration::ZERO
            }
        },
        |messages, _| {
            if system(messages) == "child" {
                return Ok(Message::assistant("too late"));
            }
            Ok(call(
                "split-1",
                "split_task:split_to_sub_task",
                json!({"tasks": [
                    {"system": "child", "query": "check api"},
                    {"system": "child", "query": "check db"}
                ]}),
            ))
        },
    );
    let (factory, stats) = flaky_sandboxes(0);
    let mut scheduler = Scheduler::new(
        dir.load().unwrap(),
        runtime_with(llm.clone()).sandbox_factory(factory).build(),
        RunOptions::default(),
    )
    .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let err = scheduler.run(dir.context(), &cancel).await.unwrap_err();

    assert!(matches!(err, Error::Cancelled));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(llm.calls(), 3);
    assert_eq!(stats.starts.load(Ordering::SeqCst), 3);
    assert_eq!(stats.stops.load(Ordering::SeqCst), 3);
}
