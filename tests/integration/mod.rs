//! Integration test suite for Mosaic.
//!
//! These tests drive workflows from their documents on disk through the
//! scheduler, the LLM loop and the tool providers, and verify that the
//! components work together correctly.
//!
//! # Test Categories
//!
//! - `workflow_e2e`: Full workflow execution tests
//! - `subtasks`: Splitting a task into concurrent children
//! - `tool_dispatch`: Tool resolution, permissions and timeouts
//! - `recovery`: Retries, sandbox resets and cancellation
//!
//! # CI Compatibility
//!
//! These tests use scripted model responses and an in-memory sandbox and
//! do not make network calls, making them safe to run in CI environments.

mod fixtures;

mod recovery;
mod tool_dispatch;
mod workflow_e2e;
