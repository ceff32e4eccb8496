//! Model-initiated tool calls and the external executor they run on.

pub mod coordinator;
pub mod executor;

pub use coordinator::{
    ActiveToolCall, ToolCallCoordinator, ToolCallStatus, ToolCompletion, ToolResponder,
};
pub use executor::{HttpTaskExecutor, TaskExecutor, UnconfiguredExecutor, executor_from_config};
