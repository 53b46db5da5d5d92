//! Concurrent, failure-isolated execution of one batch of tool calls.
//!
//! Every request yields exactly one [`ToolExecutionResult`], in request
//! order. Unknown tools, malformed or schema-invalid arguments, returned
//! errors, panics, timeouts and cancellation all become error results for
//! that call alone.

use super::core::{
    DEFAULT_TOOL_TIMEOUT, ToolRegistry, log_tool_call, parse_raw_arguments,
    validate_tool_arguments,
};
use crate::ToolCall;
use crate::error::ToolError;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolExecutionResult {
    pub tool_call_id: String,
    pub tool_name: String,
    /// Tool output. Empty when `error` is set.
    pub output: String,
    pub error: Option<String>,
}

impl ToolExecutionResult {
    fn ok(call: &ToolCall, output: String) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output,
            error: None,
        }
    }

    fn failed(call: &ToolCall, error: &ToolError) -> Self {
        Self {
            tool_call_id: call.id.clone(),
            tool_name: call.name.clone(),
            output: String::new(),
            error: Some(error.to_string()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text recorded as the tool result message.
    pub fn content(&self) -> String {
        match &self.error {
            Some(e) => format!("Error: {e}"),
            None => self.output.clone(),
        }
    }
}

/// Runs tool call batches against a [`ToolRegistry`].
#[derive(Debug)]
pub struct Dispatcher<'a> {
    registry: &'a ToolRegistry,
    timeout: Duration,
    cancel: CancellationToken,
}

impl<'a> Dispatcher<'a> {
    /// Uses the registry's default timeout, or [`DEFAULT_TOOL_TIMEOUT`].
    pub fn new(registry: &'a ToolRegistry) -> Self {
        Self {
            registry,
            timeout: registry.default_timeout().unwrap_or(DEFAULT_TOOL_TIMEOUT),
            cancel: CancellationToken::new(),
        }
    }

    /// Per-call timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Execute all calls concurrently. Returns one result per call, in
    /// request order, once the whole batch has resolved.
    pub async fn dispatch(&self, calls: &[ToolCall]) -> Vec<ToolExecutionResult> {
        if calls.is_empty() {
            return Vec::new();
        }
        debug!("Dispatching {} tool call(s)", calls.len());
        let results =
            futures::future::join_all(calls.iter().map(|call| self.execute_one(call))).await;
        let failed = results.iter().filter(|r| r.is_error()).count();
        if failed > 0 {
            info!("{failed} of {} tool call(s) failed", results.len());
        }
        results
    }

    async fn execute_one(&self, call: &ToolCall) -> ToolExecutionResult {
        log_tool_call(&call.name, &call.arguments);
        match self.run_tool(call).await {
            Ok(output) => ToolExecutionResult::ok(call, output),
            Err(e) => {
                warn!("Tool call {} ({}) failed: {e}", call.id, call.name);
                ToolExecutionResult::failed(call, &e)
            }
        }
    }

    async fn run_tool(&self, call: &ToolCall) -> Result<String, ToolError> {
        let tool = self
            .registry
            .get(&call.name)
            .ok_or_else(|| ToolError::UnknownTool(call.name.clone()))?;
        let arguments = parse_raw_arguments(&call.name, &call.arguments)?;
        if self.registry.validates_args() {
            validate_tool_arguments(tool, &arguments)?;
        }

        let started = Instant::now();
        // A panic may happen while building the future or while polling it.
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| tool.execute(arguments)))
            .map_err(|_| ToolError::Panicked(call.name.clone()))?;
        let guarded = AssertUnwindSafe(future).catch_unwind();

        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(ToolError::Cancelled),
            outcome = tokio::time::timeout(self.timeout, guarded) => match outcome {
                Err(_) => {
                    info!("[tool] {} timed out after {:?}", call.name, self.timeout);
                    Err(ToolError::Timeout { tool: call.name.clone(), after: self.timeout })
                }
                Ok(Err(_)) => Err(ToolError::Panicked(call.name.clone())),
                Ok(Ok(result)) => result,
            },
        };
        debug!("[tool] {} finished in {:?}", call.name, started.elapsed());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolDef;
    use crate::tools::core::{FnTool, Tool, ToolFuture};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn schema() -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "ms": { "type": "integer" } },
            "required": ["ms"]
        })
    }

    /// Sleeps for `ms`, then echoes it.
    fn sleeper() -> FnTool {
        #[derive(serde::Deserialize)]
        struct Args {
            ms: u64,
        }
        FnTool::new(ToolDef::new("sleep", "Sleep", schema()), |a: Args| async move {
            tokio::time::sleep(Duration::from_millis(a.ms)).await;
            Ok(format!("slept {}", a.ms))
        })
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl Tool for Counting {
        fn definition(&self) -> ToolDef {
            ToolDef::new("count", "Count calls", serde_json::json!({"type": "object"}))
        }

        fn execute(&self, _arguments: serde_json::Value) -> ToolFuture<'_> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok("counted".to_string()) })
        }
    }

    struct Panicky;

    fn explode() -> Result<String, ToolError> {
        panic!("tool blew up")
    }

    impl Tool for Panicky {
        fn definition(&self) -> ToolDef {
            ToolDef::new("panic", "Always panics", serde_json::json!({"type": "object"}))
        }

        fn execute(&self, _arguments: serde_json::Value) -> ToolFuture<'_> {
            Box::pin(async { explode() })
        }
    }

    fn failing() -> FnTool {
        FnTool::new(
            ToolDef::new("fail", "Always fails", serde_json::json!({"type": "object"})),
            |_: serde_json::Value| async { Err(ToolError::Failed("disk full".into())) },
        )
    }

    #[tokio::test]
    async fn results_follow_request_order() {
        let registry = ToolRegistry::new().with(sleeper());
        let calls = vec![
            ToolCall::new("a", "sleep", r#"{"ms": 40}"#),
            ToolCall::new("b", "sleep", r#"{"ms": 1}"#),
            ToolCall::new("c", "sleep", r#"{"ms": 20}"#),
        ];
        let results = Dispatcher::new(&registry).dispatch(&calls).await;
        let ids: Vec<&str> = results.iter().map(|r| r.tool_call_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(results[0].content(), "slept 40");
    }

    #[tokio::test]
    async fn failures_are_isolated() {
        let calls_made = Arc::new(AtomicUsize::new(0));
        let registry = ToolRegistry::new()
            .with(Counting {
                calls: calls_made.clone(),
            })
            .with(Panicky)
            .with(failing());
        let calls = vec![
            ToolCall::new("1", "panic", "{}"),
            ToolCall::new("2", "count", "{}"),
            ToolCall::new("3", "missing", "{}"),
            ToolCall::new("4", "fail", ""),
            ToolCall::new("5", "count", "{not json"),
        ];
        let results = Dispatcher::new(&registry).dispatch(&calls).await;

        assert_eq!(results.len(), 5);
        assert!(results[0].error.as_deref().unwrap().contains("panicked"));
        assert_eq!(results[1].content(), "counted");
        assert!(results[2].error.as_deref().unwrap().contains("unknown tool"));
        assert_eq!(results[3].content(), "Error: disk full");
        assert!(results[4].error.as_deref().unwrap().contains("not valid JSON"));
        // Malformed arguments never reach the tool.
        assert_eq!(calls_made.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn schema_validation_when_enabled() {
        let registry = ToolRegistry::new().with(sleeper()).with_arg_validation(true);
        let results = Dispatcher::new(&registry)
            .dispatch(&[ToolCall::new("x", "sleep", r#"{"ms": "soon"}"#)])
            .await;
        assert!(results[0].error.as_deref().unwrap().contains("invalid arguments"));
    }

    #[tokio::test]
    async fn slow_call_times_out_alone() {
        let registry = ToolRegistry::new().with(sleeper());
        let calls = vec![
            ToolCall::new("slow", "sleep", r#"{"ms": 5000}"#),
            ToolCall::new("fast", "sleep", r#"{"ms": 1}"#),
        ];
        let results = Dispatcher::new(&registry)
            .with_timeout(Duration::from_millis(50))
            .dispatch(&calls)
            .await;
        assert!(results[0].error.as_deref().unwrap().contains("timed out"));
        assert!(!results[1].is_error());
    }

    #[tokio::test]
    async fn cancellation_keeps_completed_outputs() {
        let registry = ToolRegistry::new().with(sleeper());
        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });
        let calls = vec![
            ToolCall::new("done", "sleep", r#"{"ms": 1}"#),
            ToolCall::new("pending", "sleep", r#"{"ms": 5000}"#),
        ];
        let results = Dispatcher::new(&registry)
            .with_cancellation(token)
            .dispatch(&calls)
            .await;
        assert_eq!(results[0].content(), "slept 1");
        assert_eq!(results[1].error.as_deref(), Some("cancelled"));
    }
}
