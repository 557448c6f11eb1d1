//! End-to-end workflow execution tests.

use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use mosaic::agent::ExecutionContext;
use mosaic::llm::{Message, Role};
use mosaic::orchestration::{RunOptions, Scheduler, SchedulerEvent, RUN_SUMMARY_FILE};
use mosaic::{Error, Result, RunStatus, StepStatus};

use crate::fixtures::{agent_doc, last_user, runtime_with, system, MockLlm, WorkflowDir};

/// Answers "<system> done" to every prompt.
fn echo_llm() -> Arc<MockLlm> {
    MockLlm::new(|messages, _| Ok(Message::assistant(format!("{} done", system(messages)))))
}

fn diamond() -> WorkflowDir {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.plan]
next = ["research", "draft"]
agent_config = "plan.toml"

[steps.research]
next = "review"
agent_config = "research.toml"

[steps.draft]
next = "review"
agent_config = "draft.toml"

[steps.review]
agent_config = "review.toml"
"#,
    );
    for name in ["plan", "research", "draft", "review"] {
        dir.file(&format!("{}.toml", name), &agent_doc(name, ""));
    }
    dir
}

/// Given: a diamond plan -> {research, draft} -> review
/// When: the workflow runs
/// Then: every step runs once and the join sees both branches on one shared history
#[tokio::test]
async fn test_diamond_workflow_runs_every_step_once() {
    let dir = diamond();
    let llm = echo_llm();
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

    assert_eq!(report.status(), RunStatus::Completed);
    assert_eq!(llm.calls(), 4);
    assert_eq!(report.state.count(StepStatus::Completed), 4);
    assert_eq!(report.final_answer(), Some("review done"));

    let review = &report.outputs["review"];
    let answers: Vec<&str> = review
        .messages
        .iter()
        .filter(|m| m.role == Role::Assistant)
        .map(|m| m.content.as_str())
        .collect();
    assert!(answers.contains(&"research done"));
    assert!(answers.contains(&"draft done"));
    assert_eq!(answers.iter().filter(|a| **a == "plan done").count(), 1);
    let systems: Vec<&str> = review
        .messages
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| m.content.as_str())
        .collect();
    assert_eq!(systems, ["review"]);
    assert_eq!(review.messages.len(), 6);

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert_eq!(
        events.first(),
        Some(&SchedulerEvent::StepStarted {
            step: "plan".into(),
            attempt: 1
        })
    );
    assert_eq!(
        events.last(),
        Some(&SchedulerEvent::RunCompleted {
            run_id: report.run_id(),
            status: RunStatus::Completed
        })
    );
}

/// Given: a finished run
/// When: the run summary is read back
/// Then: it records the run id, status and every step
#[tokio::test]
async fn test_run_summary_written() {
    let dir = diamond();
    let report = dir
        .run(runtime_with(echo_llm()).build(), RunOptions::default())
        .await
        .unwrap();

    let summary: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(dir.output_dir().join(RUN_SUMMARY_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(summary["run_id"], json!(report.run_id().to_string()));
    assert_eq!(summary["status"], json!("completed"));
    assert_eq!(summary["steps"].as_object().unwrap().len(), 4);
}

/// Given: two steps naming each other as successor
/// When: the workflow is loaded
/// Then: loading fails with a configuration error mentioning the cycle
#[test]
fn test_cycle_rejected_at_load() {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.a]
next = "b"
agent_config = "a.toml"

[steps.b]
next = "a"
"#,
    )
    .file("a.toml", &agent_doc("a", ""));

    match dir.load() {
        Err(Error::Config(msg)) => assert!(msg.contains("cycle"), "{}", msg),
        other => panic!("expected a cycle error, got {:?}", other.map(|w| w.len())),
    }
}

/// Given: a successor to a step that is not defined
/// When: the workflow is loaded
/// Then: loading fails
#[test]
fn test_unknown_successor_rejected() {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.a]
next = "missing"
agent_config = "a.toml"
"#,
    )
    .file("a.toml", &agent_doc("a", ""));

    assert!(dir.load().is_err());
}

/// Given: a step without an agent document
/// When: the workflow is loaded
/// Then: it inherits its first predecessor's configuration
#[test]
fn test_step_inherits_predecessor_config() {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.outline]
next = "expand"
agent_config = "outline.toml"

[steps.expand]
"#,
    )
    .file("outline.toml", &agent_doc("outline", ""));

    let workflow = dir.load().unwrap();
    assert_eq!(workflow.order(), ["outline", "expand"]);
    let expand = workflow.step("expand").unwrap();
    assert_eq!(expand.config.prompt.system.as_deref(), Some("outline"));
    assert!(Arc::ptr_eq(
        &expand.config,
        &workflow.step("outline").unwrap().config
    ));
}

/// Given: a directory holding only agent.toml
/// When: it runs
/// Then: it is a one-step workflow whose answer is the run's answer
#[tokio::test]
async fn test_single_agent_directory() {
    let dir = WorkflowDir::new();
    dir.file(
        "agent.toml",
        r#"
[llm]
model = "mock"

[prompt]
system = "solo"
query = "hi"
"#,
    );

    let report = dir
        .run(runtime_with(echo_llm()).build(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(report.outputs.len(), 1);
    assert_eq!(report.final_answer(), Some("solo done"));
    assert_eq!(report.outputs["agent"].messages[1], Message::user("hi"));
}

/// User message contents, in order.
fn user_turns(ctx: &ExecutionContext) -> Vec<&str> {
    ctx.messages
        .iter()
        .filter(|m| m.role == Role::User)
        .map(|m| m.content.as_str())
        .collect()
}

/// Given: a step inheriting the configuration of a step with a query
/// When: the chain runs
/// Then: the query is asked once, by the step that declares it
#[tokio::test]
async fn test_inherited_step_does_not_repeat_query() {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.outline]
next = "expand"
agent_config = "outline.toml"

[steps.expand]
"#,
    )
    .file(
        "outline.toml",
        r#"
[llm]
model = "mock"

[prompt]
system = "writer"
query = "Outline a talk on ownership"
"#,
    );
    let llm = MockLlm::new(|messages, _| {
        let turn = messages.iter().filter(|m| m.role == Role::Assistant).count();
        Ok(Message::assistant(format!("draft {}", turn + 1)))
    });

    let report = dir
        .run(runtime_with(llm.clone()).build(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(llm.calls(), 2);
    let expand = &report.outputs["expand"];
    assert_eq!(user_turns(expand), ["Outline a talk on ownership"]);
    assert_eq!(expand.final_answer(), Some("draft 2"));
}

/// Given: an agent with a configured query and a query from the caller
/// When: it runs
/// Then: the caller's query is the only question asked
#[tokio::test]
async fn test_caller_query_replaces_configured_query() {
    let dir = WorkflowDir::new();
    dir.file(
        "agent.toml",
        r#"
[llm]
model = "mock"

[prompt]
system = "solo"
query = "hi"
"#,
    );
    let llm = MockLlm::new(|messages, _| Ok(Message::assistant(last_user(messages).to_string())));
    let mut initial = dir.context();
    initial.messages.push(Message::user("what is a lifetime?"));

    let mut scheduler = Scheduler::new(
        dir.load().unwrap(),
        runtime_with(llm).build(),
        RunOptions::default(),
    )
    .unwrap();
    let report = scheduler
        .run(initial, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(user_turns(&report.context), ["what is a lifetime?"]);
    assert_eq!(report.final_answer(), Some("what is a lifetime?"));
}

fn stamped_chain() -> WorkflowDir {
    let dir = WorkflowDir::new();
    dir.workflow(
        r#"
[steps.prepare]
next = "answer"
agent = { name = "CodeAgent", kwargs = { code = "stamp" } }

[steps.answer]
agent_config = "answer.toml"
"#,
    )
    .file("answer.toml", &agent_doc("answer", ""));
    dir
}

fn stamp(mut ctx: ExecutionContext) -> Result<ExecutionContext> {
    ctx.set_var("stamped", json!(true));
    ctx.messages.push(Message::user("use the stamp"));
    Ok(ctx)
}

/// Given: a code step feeding an LLM step
/// When: it runs
/// Then: the LLM step sees what the code step produced
#[tokio::test]
async fn test_code_step_feeds_llm_step() {
    let dir = stamped_chain();
    let llm = MockLlm::new(|messages, _| {
        Ok(Message::assistant(last_user(messages).to_uppercase()))
    });
    let runtime = runtime_with(llm)
        .code("stamp", Arc::new(stamp))
        .trust_remote_code(true)
        .build();

    let report = dir.run(runtime, RunOptions::default()).await.unwrap();
    assert_eq!(report.final_answer(), Some("USE THE STAMP"));
    assert_eq!(report.context.var("stamped"), Some(&json!(true)));
}

/// Given: a completed run
/// When: the same workflow runs again with load_cache
/// Then: every step is served from history and the model is not called
#[tokio::test]
async fn test_load_cache_reuses_unchanged_steps() {
    let dir = stamped_chain();
    let llm = echo_llm();
    let runtime = runtime_with(llm.clone())
        .code("stamp", Arc::new(stamp))
        .trust_remote_code(true)
        .build();

    let first = dir.run(runtime.clone(), RunOptions::default()).await.unwrap();
    assert_eq!(llm.calls(), 1);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let second = dir
        .run(
            runtime,
            RunOptions {
                load_cache: true,
                events: Some(tx),
            },
        )
        .await
        .unwrap();

    assert_eq!(llm.calls(), 1);
    assert_eq!(second.final_answer(), first.final_answer());
    assert_ne!(second.run_id(), first.run_id());
    assert_eq!(second.context.run_id, second.run_id());
    assert!(second.state.steps.values().all(|s| s.cached));

    let mut cached = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let SchedulerEvent::StepCached { step } = event {
            cached.push(step);
        }
    }
    assert_eq!(cached, ["prepare", "answer"]);
}
