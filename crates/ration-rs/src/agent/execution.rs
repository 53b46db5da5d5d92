//! Request dispatch, retry, and tool-result recording.
//!
//! These functions are called by [`super::harness::Harness::run()`] to handle
//! the per-iteration mechanics: sending the model request under timeout and
//! cancellation, retrying transient failures when enabled, and appending
//! truncated tool results to the session.

use super::events::{EventHandler, LoopEvent};
use super::session::SessionLease;
use crate::api::client::{GenerateRequest, LlmClient, LlmResponse};
use crate::api::retry::RetryConfig;
use crate::context::tokens;
use crate::context::truncate::Truncator;
use crate::error::{LoopError, StoreError};
use crate::tools::dispatch::ToolExecutionResult;
use crate::Message;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ── Send request ──────────────────────────────────────────────────

/// Send one request. `Err` and `Ok(None)` from the client are both failures.
pub(crate) async fn send_request(
    client: &dyn LlmClient,
    request: &GenerateRequest,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<LlmResponse, LoopError> {
    debug!(
        "Sending request: model={}, {} message(s), {} tool(s)",
        request.model,
        request.messages.len(),
        request.tools.as_ref().map_or(0, Vec::len)
    );
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LoopError::Cancelled),
        outcome = tokio::time::timeout(timeout, client.generate(request)) => match outcome {
            Err(_) => Err(LoopError::Timeout(timeout)),
            Ok(Err(e)) => Err(LoopError::Provider(e)),
            Ok(Ok(None)) => Err(LoopError::EmptyResponse),
            Ok(Ok(Some(response))) => Ok(response),
        },
    }
}

/// Retry an async call with exponential backoff for transient errors.
///
/// With `max_retries = 0` the first failure is returned as-is.
pub(crate) async fn retry_api_call<T, F, Fut>(
    config: &RetryConfig,
    event_handler: &dyn EventHandler,
    cancel: &CancellationToken,
    mut call: F,
) -> Result<T, LoopError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, LoopError>>,
{
    let mut attempt = 0;
    loop {
        match call().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < config.max_retries && e.is_transient() => {
                let delay = config.delay_for_attempt(attempt);
                let error = e.to_string();
                warn!(
                    "Transient API error (attempt {}/{}): {error}. Retrying in {delay:?}...",
                    attempt + 1,
                    config.max_retries,
                );
                event_handler.on_event(&LoopEvent::RetryScheduled {
                    attempt: attempt + 1,
                    max_retries: config.max_retries,
                    delay,
                    error: &error,
                });
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => return Err(LoopError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ── Tool results ──────────────────────────────────────────────────

/// Truncate and append a resolved batch in request order. The batch is
/// appended whole or not at all.
///
/// Returns the estimated tokens the appended messages add to the next
/// prompt.
pub(crate) fn record_tool_results(
    lease: &SessionLease,
    results: Vec<ToolExecutionResult>,
    truncator: &Truncator,
    event_handler: &dyn EventHandler,
) -> Result<u64, StoreError> {
    let mut messages = Vec::with_capacity(results.len());
    for result in results {
        let is_error = result.is_error();
        let truncation = truncator.apply(&result.tool_call_id, result.content());
        if truncation.truncated {
            event_handler.on_event(&LoopEvent::OutputTruncated {
                call_id: &result.tool_call_id,
                original_bytes: truncation.original_bytes,
                spill_handle: truncation.spill_handle.as_deref(),
            });
        }
        event_handler.on_event(&LoopEvent::ToolResult {
            name: &result.tool_name,
            call_id: &result.tool_call_id,
            result: &truncation.content,
            is_error,
        });
        messages.push(Message::tool_result(
            result.tool_call_id,
            result.tool_name,
            truncation.content,
        ));
    }

    let added = tokens::estimate_total(&messages);
    lease.write(|session| session.append_batch(messages))?;
    Ok(added)
}
