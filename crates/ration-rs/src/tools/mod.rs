//! Tool abstractions and batch dispatch.
//!
//! Every capability the model can invoke is a [`Tool`] implementor. Tools
//! are collected into an explicitly constructed [`ToolRegistry`] and run a
//! batch at a time by the [`Dispatcher`].
//!
//! # Defining tools
//!
//! - **[`FnTool`]**: closure-based, auto-parses arguments. Best for simple
//!   stateless tools.
//! - **`impl Tool`**: a struct with [`Tool::definition()`] and
//!   [`Tool::execute()`]. Best for tools with shared state.
//!
//! # Submodules
//!
//! - [`core`]: [`Tool`] trait, [`ToolRegistry`], [`FnTool`], argument
//!   parsing and schema validation.
//! - [`dispatch`]: [`Dispatcher`] and [`ToolExecutionResult`].

pub mod core;
pub mod dispatch;

// Re-export commonly used items at the module level.
pub use core::{
    DEFAULT_TOOL_TIMEOUT, FnTool, Tool, ToolFuture, ToolRegistry, parse_tool_args,
    validate_tool_arguments,
};
pub use dispatch::{Dispatcher, ToolExecutionResult};
