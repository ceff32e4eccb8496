//! Tool call coordination.
//!
//! Tracks every call id the model issues, runs the executor for each on its
//! own task, and answers every call that is not withdrawn with exactly one
//! tool response. Completions come back through a channel and are applied by
//! the owner of the coordinator, so the call table has a single writer.

use crate::error::{ExecutorError, Result};
use crate::protocol::ToolCallRequest;
use crate::protocol::messages::{EXECUTE_FUNCTION, TASK_ARGUMENT, error_payload, success_payload};
use crate::session::LiveSession;
use crate::tools::executor::TaskExecutor;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of one call id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCallStatus {
    Executing,
    Completed,
    Failed,
}

/// One tracked tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveToolCall {
    pub call_id: String,
    pub function_name: String,
    pub task: String,
    pub status: ToolCallStatus,
}

/// Executor result for one call id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCompletion {
    pub call_id: String,
    pub result: std::result::Result<String, ExecutorError>,
}

/// Destination for tool responses.
pub trait ToolResponder: Send + Sync {
    fn send_tool_response(&self, call_id: &str, response: serde_json::Value) -> Result<()>;
}

impl ToolResponder for LiveSession {
    fn send_tool_response(&self, call_id: &str, response: serde_json::Value) -> Result<()> {
        LiveSession::send_tool_response(self, call_id, response)
    }
}

struct TrackedCall {
    call: ActiveToolCall,
    abort: Option<AbortHandle>,
}

pub struct ToolCallCoordinator {
    executor: Arc<dyn TaskExecutor>,
    responder: Arc<dyn ToolResponder>,
    completions: mpsc::UnboundedSender<ToolCompletion>,
    calls: HashMap<String, TrackedCall>,
    latest: Option<String>,
}

impl ToolCallCoordinator {
    /// Executor results are delivered on `completions` and must be fed back
    /// through [`on_completion`](Self::on_completion).
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        responder: Arc<dyn ToolResponder>,
        completions: mpsc::UnboundedSender<ToolCompletion>,
    ) -> Self {
        Self {
            executor,
            responder,
            completions,
            calls: HashMap::new(),
            latest: None,
        }
    }

    /// Start tracking `request` and launch its executor task.
    ///
    /// Returns the transcript line describing what happened. Malformed calls
    /// are answered with an error response straight away. A call reusing the
    /// id of one still executing is ignored; the running call answers it.
    pub fn on_tool_call(&mut self, request: ToolCallRequest) -> String {
        // Finished calls are only kept until the next call arrives.
        self.calls
            .retain(|_, c| c.call.status == ToolCallStatus::Executing);

        if self.calls.contains_key(&request.id) {
            warn!(call_id = %request.id, "ignoring tool call with an id already executing");
            return format!("ignored duplicate call: {}", request.id);
        }

        let task = request
            .args
            .get(TASK_ARGUMENT)
            .map(|t| t.trim().to_owned())
            .unwrap_or_default();

        let mut call = ActiveToolCall {
            call_id: request.id.clone(),
            function_name: request.name.clone(),
            task: task.clone(),
            status: ToolCallStatus::Executing,
        };
        self.latest = Some(request.id.clone());

        let invalid = if request.name != EXECUTE_FUNCTION {
            Some(format!("unknown function: {}", request.name))
        } else if task.is_empty() {
            Some(format!("missing required argument: {TASK_ARGUMENT}"))
        } else {
            None
        };

        if let Some(reason) = invalid {
            warn!(call_id = %request.id, %reason, "rejecting tool call");
            call.status = ToolCallStatus::Failed;
            self.respond(&request.id, error_payload(&reason));
            self.calls
                .insert(request.id, TrackedCall { call, abort: None });
            return format!("failed: {reason}");
        }

        info!(call_id = %request.id, %task, "executing tool call");
        let executor = Arc::clone(&self.executor);
        let completions = self.completions.clone();
        let call_id = request.id.clone();
        let task_for_executor = task.clone();
        let handle = tokio::spawn(async move {
            let run = AssertUnwindSafe(executor.execute_task(&task_for_executor));
            // A panicking executor still owes the model an answer.
            let result = match run.catch_unwind().await {
                Ok(result) => result,
                Err(_) => {
                    error!(call_id = %call_id, "task executor panicked");
                    Err(ExecutorError::Request("executor panicked".into()))
                }
            };
            let _ = completions.send(ToolCompletion { call_id, result });
        });

        self.calls.insert(
            request.id,
            TrackedCall {
                call,
                abort: Some(handle.abort_handle()),
            },
        );
        format!("executing: {task}")
    }

    /// Forget withdrawn calls and abort their executor tasks. No response is
    /// sent. Returns the ids that were still tracked.
    pub fn on_cancellation(&mut self, ids: &[String]) -> Vec<String> {
        let mut cancelled = Vec::new();
        for id in ids {
            match self.calls.remove(id) {
                Some(tracked) => {
                    if let Some(abort) = tracked.abort {
                        abort.abort();
                    }
                    info!(call_id = %id, "tool call cancelled");
                    cancelled.push(id.clone());
                }
                None => debug!(call_id = %id, "cancellation for unknown call"),
            }
        }
        cancelled
    }

    /// Apply an executor result and answer the model.
    ///
    /// Returns the transcript line, or `None` when the id is no longer being
    /// executed (cancelled, or already answered).
    pub fn on_completion(&mut self, completion: ToolCompletion) -> Option<String> {
        let Some(tracked) = self.calls.get_mut(&completion.call_id) else {
            debug!(call_id = %completion.call_id, "completion for untracked call ignored");
            return None;
        };
        if tracked.call.status != ToolCallStatus::Executing {
            debug!(call_id = %completion.call_id, "duplicate completion ignored");
            return None;
        }
        tracked.abort = None;

        let (payload, line) = match completion.result {
            Ok(content) => {
                tracked.call.status = ToolCallStatus::Completed;
                info!(call_id = %completion.call_id, "tool call completed");
                let line = format!("completed: {content}");
                (success_payload(&content), line)
            }
            Err(e) => {
                tracked.call.status = ToolCallStatus::Failed;
                warn!(call_id = %completion.call_id, error = %e, "tool call failed");
                let message = e.to_string();
                let line = format!("failed: {message}");
                (error_payload(&message), line)
            }
        };
        self.respond(&completion.call_id, payload);
        Some(line)
    }

    /// The most recently issued call, if still tracked.
    pub fn active(&self) -> Option<&ActiveToolCall> {
        self.latest.as_deref().and_then(|id| self.get(id))
    }

    pub fn get(&self, call_id: &str) -> Option<&ActiveToolCall> {
        self.calls.get(call_id).map(|t| &t.call)
    }

    /// Calls still waiting on the executor.
    pub fn in_flight(&self) -> usize {
        self.calls
            .values()
            .filter(|t| t.call.status == ToolCallStatus::Executing)
            .count()
    }

    /// Abort every executor task and forget all calls.
    pub fn clear(&mut self) {
        for (_, tracked) in self.calls.drain() {
            if let Some(abort) = tracked.abort {
                abort.abort();
            }
        }
        self.latest = None;
    }

    fn respond(&self, call_id: &str, payload: serde_json::Value) {
        if let Err(e) = self.responder.send_tool_response(call_id, payload) {
            warn!(call_id = %call_id, "tool response not delivered: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

    use super::*;
    use crate::test_utils::{RecordingResponder, StaticExecutor};
    use async_trait::async_trait;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(2);

    fn call(id: &str, name: &str, task: Option<&str>) -> ToolCallRequest {
        let mut args = BTreeMap::new();
        if let Some(task) = task {
            args.insert("task".to_owned(), task.to_owned());
        }
        ToolCallRequest {
            id: id.to_owned(),
            name: name.to_owned(),
            args,
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl TaskExecutor for PanickingExecutor {
        async fn execute_task(&self, _task: &str) -> std::result::Result<String, ExecutorError> {
            panic!("executor bug");
        }
    }

    fn coordinator(
        executor: impl TaskExecutor + 'static,
    ) -> (
        ToolCallCoordinator,
        Arc<RecordingResponder>,
        mpsc::UnboundedReceiver<ToolCompletion>,
    ) {
        let responder = Arc::new(RecordingResponder::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = ToolCallCoordinator::new(Arc::new(executor), responder.clone(), tx);
        (coordinator, responder, rx)
    }

    #[tokio::test]
    async fn successful_call_answers_with_result() {
        let (mut coord, responder, mut rx) = coordinator(StaticExecutor::ok("Added."));

        let line = coord.on_tool_call(call("c1", "execute", Some("add milk to list")));
        assert_eq!(line, "executing: add milk to list");
        assert_eq!(
            coord.get("c1"),
            Some(&ActiveToolCall {
                call_id: "c1".into(),
                function_name: "execute".into(),
                task: "add milk to list".into(),
                status: ToolCallStatus::Executing,
            })
        );

        let completion = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            coord.on_completion(completion).as_deref(),
            Some("completed: Added.")
        );
        assert_eq!(coord.get("c1").unwrap().status, ToolCallStatus::Completed);
        assert_eq!(
            responder.responses(),
            vec![("c1".to_owned(), serde_json::json!({"result": "Added."}))]
        );
    }

    #[tokio::test]
    async fn failed_call_still_answers() {
        let (mut coord, responder, mut rx) =
            coordinator(StaticExecutor::err(ExecutorError::Status {
                status: 502,
                body: "bad gateway".into(),
            }));
        coord.on_tool_call(call("c2", "execute", Some("book a table")));
        let completion = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        let line = coord.on_completion(completion).unwrap();
        assert!(line.starts_with("failed: "));
        assert_eq!(coord.get("c2").unwrap().status, ToolCallStatus::Failed);

        let responses = responder.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "c2");
        assert!(responses[0].1["error"].as_str().unwrap().contains("502"));
    }

    #[tokio::test]
    async fn cancelled_call_gets_no_response() {
        let (mut coord, responder, _rx) =
            coordinator(StaticExecutor::ok("late").with_delay(Duration::from_millis(50)));
        coord.on_tool_call(call("c3", "execute", Some("slow thing")));
        assert_eq!(coord.on_cancellation(&["c3".into()]), vec!["c3".to_owned()]);
        assert!(coord.get("c3").is_none());

        // A completion racing the abort is a no-op.
        let late = ToolCompletion {
            call_id: "c3".into(),
            result: Ok("late".into()),
        };
        assert!(coord.on_completion(late).is_none());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(responder.responses().is_empty());
    }

    #[tokio::test]
    async fn unknown_completion_is_noop() {
        let (mut coord, responder, _rx) = coordinator(StaticExecutor::ok("x"));
        let stray = ToolCompletion {
            call_id: "nope".into(),
            result: Ok("x".into()),
        };
        assert!(coord.on_completion(stray).is_none());
        assert!(responder.responses().is_empty());
    }

    #[tokio::test]
    async fn duplicate_completion_answers_once() {
        let (mut coord, responder, mut rx) = coordinator(StaticExecutor::ok("ok"));
        coord.on_tool_call(call("c4", "execute", Some("t")));
        let completion = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert!(coord.on_completion(completion.clone()).is_some());
        assert!(coord.on_completion(completion).is_none());
        assert_eq!(responder.responses().len(), 1);
    }

    #[tokio::test]
    async fn invalid_calls_fail_without_executing() {
        let executor = StaticExecutor::ok("should not run");
        let counter = executor.calls();
        let (mut coord, responder, _rx) = coordinator(executor);

        let line = coord.on_tool_call(call("c5", "search", Some("x")));
        assert_eq!(line, "failed: unknown function: search");
        let line = coord.on_tool_call(call("c6", "execute", None));
        assert_eq!(line, "failed: missing required argument: task");

        assert_eq!(coord.get("c6").unwrap().status, ToolCallStatus::Failed);
        let ids: Vec<String> = responder.responses().into_iter().map(|r| r.0).collect();
        assert_eq!(ids, vec!["c5".to_owned(), "c6".to_owned()]);
        assert_eq!(counter.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn overlapping_calls_are_tracked_independently() {
        let (mut coord, responder, mut rx) = coordinator(StaticExecutor::ok("done"));
        coord.on_tool_call(call("a", "execute", Some("one")));
        coord.on_tool_call(call("b", "execute", Some("two")));
        assert_eq!(coord.in_flight(), 2);
        assert_eq!(coord.active().unwrap().call_id, "b");

        for _ in 0..2 {
            let completion = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
            coord.on_completion(completion);
        }
        assert_eq!(coord.in_flight(), 0);
        let mut ids: Vec<String> = responder.responses().into_iter().map(|r| r.0).collect();
        ids.sort();
        assert_eq!(ids, vec!["a".to_owned(), "b".to_owned()]);
    }

    #[tokio::test]
    async fn finished_calls_are_pruned_on_next_call() {
        let (mut coord, _responder, mut rx) = coordinator(StaticExecutor::ok("done"));
        coord.on_tool_call(call("old", "execute", Some("one")));
        let completion = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        coord.on_completion(completion);
        assert!(coord.get("old").is_some());

        coord.on_tool_call(call("new", "execute", Some("two")));
        assert!(coord.get("old").is_none());
        assert!(coord.get("new").is_some());
    }

    #[tokio::test]
    async fn panicking_executor_still_answers() {
        let (mut coord, responder, mut rx) = coordinator(PanickingExecutor);
        coord.on_tool_call(call("c7", "execute", Some("crash please")));

        let completion = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            completion.result,
            Err(ExecutorError::Request("executor panicked".into()))
        );
        let line = coord.on_completion(completion).unwrap();
        assert_eq!(line, "failed: request failed: executor panicked");
        assert_eq!(coord.get("c7").unwrap().status, ToolCallStatus::Failed);

        let responses = responder.responses();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].0, "c7");
        assert!(responses[0].1["error"].as_str().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn reused_in_flight_id_is_answered_once() {
        let (mut coord, responder, mut rx) =
            coordinator(StaticExecutor::ok("first").with_delay(Duration::from_millis(50)));
        coord.on_tool_call(call("dup", "execute", Some("first task")));
        let line = coord.on_tool_call(call("dup", "execute", Some("second task")));
        assert_eq!(line, "ignored duplicate call: dup");
        assert_eq!(coord.get("dup").unwrap().task, "first task");
        assert_eq!(coord.in_flight(), 1);

        let completion = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(
            coord.on_completion(completion).as_deref(),
            Some("completed: first")
        );
        assert!(
            timeout(Duration::from_millis(150), rx.recv()).await.is_err(),
            "only one executor task should run"
        );
        assert_eq!(
            responder.responses(),
            vec![("dup".to_owned(), serde_json::json!({"result": "first"}))]
        );
    }
}
