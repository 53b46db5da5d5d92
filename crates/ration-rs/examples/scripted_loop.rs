//! Scripted loop example: run the harness offline against a canned model.
//!
//! Demonstrates:
//! - Typed argument structs with `Deserialize` + `JsonSchema`
//! - A closure tool via `FnTool`
//! - Event handling with `CompositeEventHandler` and `FnEventHandler`
//! - Persisting a session with `JsonFilePersistence`
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info cargo run --example scripted_loop
//! ```

use ration_rs::agent::persistence::JsonFilePersistence;
use ration_rs::prelude::*;
use ration_rs::schemars;
use schemars::JsonSchema;
use serde::Deserialize;
use std::sync::{Arc, Mutex};

// ── Typed argument structs ──────────────────────────────────────────

/// Arguments for the `word_count` tool.
#[derive(Deserialize, JsonSchema)]
struct WordCountArgs {
    /// Text to count words in.
    text: String,
}

// ── Canned model ────────────────────────────────────────────────────

/// Asks for one tool call, then answers.
struct CannedModel {
    replies: Mutex<Vec<LlmResponse>>,
}

impl LlmClient for CannedModel {
    fn generate<'a>(&'a self, _request: &'a GenerateRequest) -> GenerateFuture<'a> {
        Box::pin(async move { Ok(self.replies.lock().unwrap_or_else(|e| e.into_inner()).pop()) })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let word_count = FnTool::new(
        ToolDef::new(
            "word_count",
            "Count the words in a piece of text.",
            json_schema_for::<WordCountArgs>(),
        ),
        |args: WordCountArgs| async move { Ok(args.text.split_whitespace().count().to_string()) },
    );
    let tools = ToolRegistry::new().with(word_count).with_arg_validation(true);

    let client = CannedModel {
        replies: Mutex::new(vec![
            LlmResponse::text("That sentence has four words."),
            LlmResponse::tool_calls(vec![ToolCall::new(
                "call-1",
                "word_count",
                r#"{"text": "the quick brown fox"}"#,
            )]),
        ]),
    };

    let handler = CompositeEventHandler::new()
        .with(LoggingHandler)
        .with(FnEventHandler::new(|event| {
            if let LoopEvent::ToolResult { name, result, .. } = event {
                println!("  [{name}] -> {result}");
            }
        }));

    let dir = std::env::temp_dir().join("ration-scripted-loop");
    let store = MessageStore::new().with_persistence(Arc::new(JsonFilePersistence::new(&dir)?));
    let session = store.open("demo", "example-user")?;

    let config = HarnessConfig::new("canned").with_system_prompt("Count carefully.");
    let outcome = Harness::new(&client, &tools, config)
        .with_event_handler(&handler)
        .with_store(&store)
        .run(&session, "How many words are in 'the quick brown fox'?")
        .await?;

    println!("{}", outcome.final_text);
    println!(
        "{} iteration(s), {} message(s) saved under {}",
        outcome.iterations,
        session.read(|s| s.len()),
        dir.display()
    );
    Ok(())
}
