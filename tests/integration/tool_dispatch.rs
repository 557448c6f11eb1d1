//! Tool resolution, permission and timeout tests.

use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

use mosaic::agent::ArtifactKind;
use mosaic::llm::{Message, Role, ToolCall};
use mosaic::orchestration::RunOptions;
use mosaic::tools::RemoteToolHandler;
use mosaic::{Error, Result};

use crate::fixtures::{call, runtime_with, scripted, WorkflowDir};

fn agent_dir(tools: &str) -> WorkflowDir {
    let dir = WorkflowDir::new();
    dir.file(
        "agent.toml",
        &format!(
            r#"
[llm]
model = "mock"

[prompt]
system = "worker"
query = "do the work"

{}
"#,
            tools
        ),
    );
    dir
}

fn tool_messages(messages: &[Message]) -> Vec<(&str, &str)> {
    messages
        .iter()
        .filter(|m| m.role == Role::Tool)
        .map(|m| {
            (
                m.tool_call_id.as_deref().unwrap_or_default(),
                m.content.as_str(),
            )
        })
        .collect()
}

/// Given: two writes requested in one turn
/// When: the agent runs them
/// Then: both files exist and results come back in request order
#[tokio::test]
async fn test_parallel_calls_answered_in_request_order() {
    let dir = agent_dir("[tools.file_system]");
    let llm = scripted(vec![Message::assistant_with_tools(
        "",
        vec![
            ToolCall::new("w1", "file_system:write_file", json!({"path": "a.txt", "content": "alpha"})),
            ToolCall::new("w2", "file_system:write_file", json!({"path": "notes/b.txt", "content": "beta"})),
        ],
    )]);

    let report = dir
        .run(runtime_with(llm).build(), RunOptions::default())
        .await
        .unwrap();

    let out = dir.output_dir();
    assert_eq!(std::fs::read_to_string(out.join("a.txt")).unwrap(), "alpha");
    assert_eq!(std::fs::read_to_string(out.join("notes/b.txt")).unwrap(), "beta");

    let results = tool_messages(&report.context.messages);
    assert_eq!(results.len(), 2);
    assert_eq!(results[0], ("w1", "Wrote 5 bytes to a.txt"));
    assert_eq!(results[1], ("w2", "Wrote 4 bytes to notes/b.txt"));

    let files: Vec<&str> = report
        .context
        .artifacts
        .iter()
        .filter(|a| a.kind == ArtifactKind::File)
        .map(|a| a.name.as_str())
        .collect();
    assert_eq!(files, ["a.txt", "notes/b.txt"]);
}

/// Given: a model that encodes its arguments as a JSON string
/// When: the call is dispatched
/// Then: the arguments are decoded before the tool sees them
#[tokio::test]
async fn test_string_encoded_arguments() {
    let dir = agent_dir("[tools.file_system]");
    let encoded = Value::String(json!({"path": "s.txt", "content": "ok"}).to_string());
    let llm = scripted(vec![call("c1", "file_system:write_file", encoded)]);

    dir.run(runtime_with(llm).build(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(
        std::fs::read_to_string(dir.output_dir().join("s.txt")).unwrap(),
        "ok"
    );
}

/// Given: a provider filtered to read_file
/// When: the model calls write_file
/// Then: the model is told the tool is not allowed and which tools are
#[tokio::test]
async fn test_disallowed_tool_reported_to_model() {
    let dir = agent_dir("[tools.file_system]\ninclude = [\"read_file\"]");
    let llm = scripted(vec![call(
        "c1",
        "file_system:write_file",
        json!({"path": "x.txt", "content": "no"}),
    )]);

    let report = dir
        .run(runtime_with(llm).build(), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(
        report.final_answer(),
        Some(
            "Tool calling failed: Tool not allowed: file_system:write_file \
             (available: file_system:read_file)"
        )
    );
    assert!(!dir.output_dir().join("x.txt").exists());
}

/// Given: a path outside the output directory
/// When: the model writes to it
/// Then: the write is refused and the agent continues
#[tokio::test]
async fn test_path_escape_refused() {
    let dir = agent_dir("[tools.file_system]");
    let llm = scripted(vec![call(
        "c1",
        "file_system:write_file",
        json!({"path": "../escape.txt", "content": "no"}),
    )]);

    let report = dir
        .run(runtime_with(llm).build(), RunOptions::default())
        .await
        .unwrap();

    let answer = report.final_answer().unwrap();
    assert!(answer.starts_with("Tool calling failed: Validation error"), "{}", answer);
    assert!(!dir.output_dir().parent().unwrap().join("escape.txt").exists());
}

/// Answers lookups; sleeps first when asked to.
struct Directory;

#[async_trait]
impl RemoteToolHandler for Directory {
    async fn call(&self, server: &str, tool: &str, args: Value) -> Result<String> {
        if let Some(ms) = args.get("sleep_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        let q = args.get("q").and_then(Value::as_str).unwrap_or_default();
        Ok(format!("{}:{} found {}", server, tool, q))
    }
}

const REMOTE: &str = r#"
[tools]
timeout_secs = 1

[tools.remote.directory]
description = "Company directory"
tools = [{ name = "lookup" }]
"#;

/// Given: a declared remote tool with a registered handler
/// When: the model calls it
/// Then: the call is bridged to the handler
#[tokio::test]
async fn test_remote_tool_bridged_to_handler() {
    let dir = agent_dir(REMOTE);
    let llm = scripted(vec![call("c1", "directory:lookup", json!({"q": "ada"}))]);
    let runtime = runtime_with(llm)
        .remote_handler("directory", Arc::new(Directory))
        .build();

    let report = dir.run(runtime, RunOptions::default()).await.unwrap();
    assert_eq!(report.final_answer(), Some("directory:lookup found ada"));
}

/// Given: a handler slower than the tool timeout
/// When: the model calls it
/// Then: the model is told the call timed out
#[tokio::test]
async fn test_remote_tool_timeout() {
    let dir = agent_dir(REMOTE);
    let llm = scripted(vec![call(
        "c1",
        "directory:lookup",
        json!({"q": "ada", "sleep_ms": 3000}),
    )]);
    let runtime = runtime_with(llm)
        .remote_handler("directory", Arc::new(Directory))
        .build();

    let report = dir.run(runtime, RunOptions::default()).await.unwrap();
    let answer = report.final_answer().unwrap();
    assert!(answer.starts_with("Tool calling failed: Operation timed out"), "{}", answer);
}

/// Given: a declared remote server without a handler
/// When: the agent resolves its tools
/// Then: the step fails with a configuration error
#[tokio::test]
async fn test_remote_server_without_handler() {
    let dir = agent_dir(REMOTE);
    let llm = scripted(Vec::new());

    let err = dir
        .run(runtime_with(llm.clone()).build(), RunOptions::default())
        .await
        .unwrap_err();

    match err {
        Error::StepFailed { source, .. } => assert!(matches!(*source, Error::Config(_))),
        other => panic!("expected StepFailed, got {:?}", other),
    }
    assert_eq!(llm.calls(), 0);
}
