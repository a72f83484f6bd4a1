//! Invocable operations carried by register events.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::chain::Chain;

/// Result of a command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub success: bool,
    pub output: String,
}

impl Outcome {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
        }
    }

    pub fn fail(output: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
        }
    }
}

/// Failure of a task body.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Failure the task itself anticipated.
    #[error("Error: {0}")]
    Failed(String),

    /// Anything the task did not anticipate.
    #[error("Unexpected Error({kind}): {message}")]
    Unexpected { kind: String, message: String },
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        TaskError::Failed(message.into())
    }
}

impl From<std::io::Error> for TaskError {
    fn from(err: std::io::Error) -> Self {
        TaskError::Unexpected {
            kind: format!("{:?}", err.kind()),
            message: err.to_string(),
        }
    }
}

type CommandBody = dyn Fn(&[String], Chain) -> Outcome + Send + Sync;
type TaskBody = dyn Fn(Chain, &[String]) -> Result<String, TaskError> + Send + Sync;

/// Handler of a command, called with (args, chain).
#[derive(Clone)]
pub struct CommandFn(Arc<CommandBody>);

impl CommandFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&[String], Chain) -> Outcome + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, args: &[String], chain: Chain) -> Outcome {
        (self.0)(args, chain)
    }
}

impl fmt::Debug for CommandFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CommandFn(..)")
    }
}

impl PartialEq for CommandFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Handler of a task, called with (chain, args).
#[derive(Clone)]
pub struct TaskFn(Arc<TaskBody>);

impl TaskFn {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Chain, &[String]) -> Result<String, TaskError> + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn call(&self, chain: Chain, args: &[String]) -> Result<String, TaskError> {
        (self.0)(chain, args)
    }
}

impl fmt::Debug for TaskFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TaskFn(..)")
    }
}

impl PartialEq for TaskFn {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
