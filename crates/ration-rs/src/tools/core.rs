//! Tool abstraction for function-calling loops.
//!
//! The [`Tool`] trait defines the interface that every tool must implement:
//! a static API definition (name, description, JSON schema) and an async
//! `execute` method. Tools are collected into a [`ToolRegistry`], which is
//! constructed explicitly and handed to the harness; there is no global
//! registry.

use crate::ToolDef;
use crate::error::ToolError;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Boxed future returned by [`Tool::execute`].
pub type ToolFuture<'a> = Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send + 'a>>;

/// Default timeout for one tool execution.
pub const DEFAULT_TOOL_TIMEOUT: Duration = Duration::from_secs(60);

// ── Tool trait ─────────────────────────────────────────────────────

/// A tool the model can invoke via function-calling.
///
/// # Example
///
/// ```ignore
/// struct ReadFile { root: PathBuf }
///
/// impl Tool for ReadFile {
///     fn definition(&self) -> ToolDef {
///         ToolDef::new("read_file", "Read a file", json_schema_for::<ReadArgs>())
///     }
///
///     fn execute(&self, arguments: serde_json::Value) -> ToolFuture<'_> {
///         Box::pin(async move {
///             let args: ReadArgs = parse_tool_args(arguments)?;
///             std::fs::read_to_string(self.root.join(args.path))
///                 .map_err(|e| ToolError::Failed(e.to_string()))
///         })
///     }
/// }
/// ```
pub trait Tool: Send + Sync {
    /// The definition sent to the model.
    fn definition(&self) -> ToolDef;

    /// Execute with already-parsed JSON arguments.
    ///
    /// Errors become error tool results; they never abort the loop. Uses a
    /// boxed future so the trait stays dyn-compatible.
    fn execute(&self, arguments: serde_json::Value) -> ToolFuture<'_>;

    fn name(&self) -> String {
        self.definition().function.name
    }
}

// ── ToolRegistry ───────────────────────────────────────────────────

/// The set of tools available to one harness, dispatched by name.
///
/// ```ignore
/// let tools = ToolRegistry::new()
///     .with(ReadFile::new(root))
///     .with_if(allow_shell, Shell::new())
///     .with_arg_validation(true)
///     .with_default_timeout(Duration::from_secs(30));
/// ```
pub struct ToolRegistry {
    tools: HashMap<String, Box<dyn Tool>>,
    /// Validate arguments against JSON Schema before execution.
    validate_args: bool,
    /// Overrides the harness's configured tool timeout when set.
    default_timeout: Option<Duration>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&String> = self.tools.keys().collect();
        names.sort();
        f.debug_struct("ToolRegistry")
            .field("tools", &names)
            .field("validate_args", &self.validate_args)
            .field("default_timeout", &self.default_timeout)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
            validate_args: false,
            default_timeout: None,
        }
    }

    pub fn with_arg_validation(mut self, enabled: bool) -> Self {
        self.validate_args = enabled;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Register a tool. Replaces any existing tool with the same name.
    pub fn register(&mut self, tool: impl Tool + 'static) {
        self.tools.insert(tool.name(), Box::new(tool));
    }

    /// Register a tool (builder pattern).
    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    /// Conditionally register a tool (builder pattern).
    pub fn with_if(self, condition: bool, tool: impl Tool + 'static) -> Self {
        if condition { self.with(tool) } else { self }
    }

    /// All tool definitions, sorted by name.
    pub fn definitions(&self) -> Vec<ToolDef> {
        let mut defs: Vec<ToolDef> = self.tools.values().map(|t| t.definition()).collect();
        defs.sort_by(|a, b| a.function.name.cmp(&b.function.name));
        defs
    }

    pub fn get(&self, name: &str) -> Option<&dyn Tool> {
        self.tools.get(name).map(|t| t.as_ref())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn validates_args(&self) -> bool {
        self.validate_args
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ── FnTool ────────────────────────────────────────────────────────

/// Type-erased async handler for [`FnTool`].
type ErasedToolHandler = Box<
    dyn Fn(serde_json::Value) -> Pin<Box<dyn Future<Output = Result<String, ToolError>> + Send>>
        + Send
        + Sync,
>;

/// A closure-based tool that auto-parses arguments and delegates to a handler.
///
/// Use [`FnTool`] for stateless tools. For tools that need shared state,
/// define a struct and implement [`Tool`] directly.
///
/// ```ignore
/// #[derive(Deserialize, JsonSchema)]
/// struct EchoArgs { text: String }
///
/// let tool = FnTool::new(
///     ToolDef::new("echo", "Echo text back", json_schema_for::<EchoArgs>()),
///     |args: EchoArgs| async move { Ok(args.text) },
/// );
/// ```
pub struct FnTool {
    def: ToolDef,
    handler: ErasedToolHandler,
}

impl FnTool {
    /// Create a closure-based tool. Arguments that do not deserialize into
    /// `A` become [`ToolError::InvalidArguments`] without calling `handler`.
    pub fn new<A, F, Fut>(def: ToolDef, handler: F) -> Self
    where
        A: serde::de::DeserializeOwned + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ToolError>> + Send + 'static,
    {
        let tool_name = def.function.name.clone();
        let erased = move |raw: serde_json::Value| -> Pin<
            Box<dyn Future<Output = Result<String, ToolError>> + Send>,
        > {
            match serde_json::from_value::<A>(raw) {
                Ok(args) => Box::pin(handler(args)),
                Err(e) => {
                    let err = ToolError::InvalidArguments {
                        tool: tool_name.clone(),
                        reason: e.to_string(),
                    };
                    Box::pin(async move { Err(err) })
                }
            }
        };

        Self {
            def,
            handler: Box::new(erased),
        }
    }
}

impl Tool for FnTool {
    fn definition(&self) -> ToolDef {
        self.def.clone()
    }

    fn execute(&self, arguments: serde_json::Value) -> ToolFuture<'_> {
        (self.handler)(arguments)
    }
}

impl fmt::Debug for FnTool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnTool")
            .field("name", &self.def.function.name)
            .finish()
    }
}

// ── Helpers ────────────────────────────────────────────────────────

/// Parse the model's raw argument string. Empty or whitespace-only input is
/// treated as an empty object.
pub fn parse_raw_arguments(tool: &str, raw: &str) -> Result<serde_json::Value, ToolError> {
    if raw.trim().is_empty() {
        return Ok(serde_json::Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: format!("arguments are not valid JSON: {e}"),
    })
}

/// Validate arguments against the tool's declared JSON Schema. A schema
/// that does not compile skips validation.
pub fn validate_tool_arguments(
    tool: &dyn Tool,
    arguments: &serde_json::Value,
) -> Result<(), ToolError> {
    let schema = tool.definition().function.parameters;
    let Ok(validator) = jsonschema::validator_for(&schema) else {
        return Ok(());
    };

    let errors: Vec<String> = validator
        .iter_errors(arguments)
        .map(|e| format!("{}: {e}", e.instance_path()))
        .collect();

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ToolError::InvalidArguments {
            tool: tool.name(),
            reason: errors.join("; "),
        })
    }
}

/// Log a tool call at INFO level with a truncated preview of arguments.
pub fn log_tool_call(name: &str, arguments: &str) {
    let args_preview: String = arguments.chars().take(120).collect();
    info!(
        "[tool] {}({args_preview}{})",
        name,
        if arguments.len() > 120 { "..." } else { "" }
    );
    debug!("[tool] {name} full args ({} bytes)", arguments.len());
    trace!("[tool] {name} arguments: {arguments}");
}

/// Deserialize parsed arguments into a typed struct.
///
/// ```ignore
/// fn execute(&self, arguments: serde_json::Value) -> ToolFuture<'_> {
///     Box::pin(async move {
///         let args: MyArgs = parse_tool_args("my_tool", arguments)?;
///         Ok(format!("got {}", args.name))
///     })
/// }
/// ```
pub fn parse_tool_args<T: serde::de::DeserializeOwned>(
    tool: &str,
    arguments: serde_json::Value,
) -> Result<T, ToolError> {
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}
