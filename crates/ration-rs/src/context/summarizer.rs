//! Tier 3: anchored incremental summarization.
//!
//! The running summary is updated incrementally. Each pass hands the
//! summarizer the span since the last boundary plus the previous summary's
//! text, and the result replaces both. History is never re-summarized from
//! scratch.

use crate::api::client::{GenerateRequest, LlmClient};
use crate::{Message, MessageKind};
use std::fmt::Write as _;
use std::future::Future;
use std::pin::Pin;

/// The prompt used for summarization. Instructs the model to produce a
/// concise, factual summary that can stand in for the span it replaces.
pub const SUMMARIZATION_PROMPT: &str = "\
Summarize the following conversation messages concisely. Focus on:
- What the user asked for and what was accomplished
- Key findings and decisions made
- Failed approaches (what was tried and why it failed)
- Identifiers mentioned: file paths, function names, ids, error messages
- What remains to be done

Rules:
- Only include facts explicitly stated in the messages. Do not infer or extrapolate.
- Preserve identifiers and error messages verbatim.
- If there is an existing summary, merge the new information into it to produce a single \
  cohesive summary. Integrate, deduplicate, and update rather than append. The result \
  must be a standalone summary that replaces the existing one entirely.";

/// Boxed future returned by [`Summarizer::summarize`].
pub type SummaryFuture<'a> = Pin<Box<dyn Future<Output = Result<String, String>> + Send + 'a>>;

/// Condenses a block of transcript text.
pub trait Summarizer: Send + Sync {
    /// Summarize `text_block`, merging `previous_summary` when present.
    fn summarize<'a>(
        &'a self,
        text_block: &'a str,
        previous_summary: Option<&'a str>,
    ) -> SummaryFuture<'a>;
}

/// Render a span of messages as plain text for the summarizer.
pub fn render_transcript(span: &[Message]) -> String {
    let mut out = String::new();
    for msg in span {
        match msg.kind {
            MessageKind::ToolCall => {
                if !msg.content.is_empty() {
                    let _ = writeln!(out, "[assistant]: {}", msg.content);
                }
                for call in &msg.tool_calls {
                    let _ = writeln!(out, "[assistant -> {}]: {}", call.name, call.arguments);
                }
                out.push('\n');
            }
            MessageKind::ToolResult => {
                let name = msg.tool_name.as_deref().unwrap_or("tool");
                let _ = writeln!(out, "[{name} result]: {}\n", msg.content);
            }
            MessageKind::Summary => {
                let _ = writeln!(out, "[earlier summary]: {}\n", msg.content);
            }
            MessageKind::Text => {
                let _ = writeln!(out, "[{}]: {}\n", msg.role, msg.content);
            }
        }
    }
    out
}

/// Build the (system, user) prompt pair for a one-shot summarization call.
pub fn build_summarization_request(
    text_block: &str,
    previous_summary: Option<&str>,
) -> (String, String) {
    let mut content = String::new();
    if let Some(existing) = previous_summary {
        content.push_str("=== EXISTING SUMMARY ===\n");
        content.push_str(existing);
        content.push_str("\n\n=== NEW MESSAGES TO SUMMARIZE ===\n");
    }
    content.push_str(text_block);
    (SUMMARIZATION_PROMPT.to_string(), content)
}

/// Configuration for [`LlmSummarizer`].
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// Model for summarization; the main model when unset.
    pub model: Option<String>,
    pub max_summary_tokens: u32,
    pub temperature: f32,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            model: None,
            max_summary_tokens: 2048,
            temperature: 0.3,
        }
    }
}

/// Summarizer backed by any [`LlmClient`].
pub struct LlmSummarizer<'a> {
    client: &'a dyn LlmClient,
    model: String,
    config: SummarizerConfig,
}

impl<'a> LlmSummarizer<'a> {
    /// `main_model` is used when the config names no summarization model.
    pub fn new(client: &'a dyn LlmClient, main_model: &str, config: SummarizerConfig) -> Self {
        let model = config
            .model
            .clone()
            .unwrap_or_else(|| main_model.to_string());
        Self {
            client,
            model,
            config,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

impl Summarizer for LlmSummarizer<'_> {
    fn summarize<'b>(
        &'b self,
        text_block: &'b str,
        previous_summary: Option<&'b str>,
    ) -> SummaryFuture<'b> {
        Box::pin(async move {
            let (system, user) = build_summarization_request(text_block, previous_summary);
            let request = GenerateRequest {
                model: self.model.clone(),
                system_prompt: Some(system),
                messages: vec![Message::user(user)],
                max_tokens: self.config.max_summary_tokens,
                temperature: self.config.temperature,
                tools: None,
            };
            match self.client.generate(&request).await? {
                Some(response) => match response.content {
                    Some(text) if !text.trim().is_empty() => Ok(text),
                    _ => Err("summarizer returned empty text".to_string()),
                },
                None => Err("summarizer returned no response".to_string()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ToolCall;
    use crate::api::client::{GenerateFuture, LlmResponse};
    use std::sync::Mutex;

    #[test]
    fn build_request_without_existing_summary() {
        let (system, user) = build_summarization_request("[user]: Read src/main.rs", None);
        assert!(system.contains("Summarize"));
        assert!(user.contains("Read src/main.rs"));
        assert!(!user.contains("EXISTING SUMMARY"));
    }

    #[test]
    fn build_request_with_existing_summary() {
        let (_, user) = build_summarization_request(
            "[user]: Now read lib.rs",
            Some("Previously: read main.rs and found entry point."),
        );
        assert!(user.contains("EXISTING SUMMARY"));
        assert!(user.contains("Previously:"));
        let existing = user.find("Previously:").unwrap();
        let new = user.find("Now read lib.rs").unwrap();
        assert!(existing < new);
    }

    #[test]
    fn transcript_renders_calls_and_results() {
        let span = vec![
            Message::user("find the TODOs"),
            Message::assistant_tool_calls(
                "Searching.",
                vec![ToolCall::new("c1", "grep", r#"{"pattern":"TODO"}"#)],
            ),
            Message::tool_result("c1", "grep", "src/lib.rs:10: TODO"),
        ];
        let text = render_transcript(&span);
        assert!(text.contains("[user]: find the TODOs"));
        assert!(text.contains("[assistant]: Searching."));
        assert!(text.contains(r#"[assistant -> grep]: {"pattern":"TODO"}"#));
        assert!(text.contains("[grep result]: src/lib.rs:10: TODO"));
    }

    #[test]
    fn transcript_preserves_full_content() {
        let long = "x".repeat(5000);
        let text = render_transcript(&[Message::assistant_text(&long)]);
        assert!(text.contains(&long));
    }

    struct CapturingClient {
        reply: Option<String>,
        seen: Mutex<Vec<GenerateRequest>>,
    }

    impl LlmClient for CapturingClient {
        fn generate<'a>(&'a self, request: &'a GenerateRequest) -> GenerateFuture<'a> {
            self.seen.lock().unwrap().push(request.clone());
            let reply = self.reply.clone();
            Box::pin(async move { Ok(reply.map(LlmResponse::text)) })
        }
    }

    #[tokio::test]
    async fn llm_summarizer_uses_configured_model() {
        let client = CapturingClient {
            reply: Some("condensed".into()),
            seen: Mutex::new(Vec::new()),
        };
        let config = SummarizerConfig {
            model: Some("cheap-model".into()),
            ..Default::default()
        };
        let summarizer = LlmSummarizer::new(&client, "main-model", config);
        let summary = summarizer.summarize("[user]: hi", Some("old")).await.unwrap();
        assert_eq!(summary, "condensed");

        let seen = client.seen.lock().unwrap();
        assert_eq!(seen[0].model, "cheap-model");
        assert!(seen[0].tools.is_none());
        assert!(seen[0].messages[0].content.contains("EXISTING SUMMARY"));
    }

    #[tokio::test]
    async fn llm_summarizer_rejects_missing_text() {
        let client = CapturingClient {
            reply: None,
            seen: Mutex::new(Vec::new()),
        };
        let summarizer = LlmSummarizer::new(&client, "main-model", SummarizerConfig::default());
        assert_eq!(summarizer.model(), "main-model");
        assert!(summarizer.summarize("text", None).await.is_err());
    }
}
