//! Event definitions.
//!
//! Every message on the bus is an [`Event`]: common metadata plus one
//! [`EventBody`] variant. The body's serde representation is the wire shape
//! `{"type": "<VariantName>", "payload": {...}}`; the metadata is folded into
//! the payload by [`crate::wire`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chain::Chain;
use crate::ops::{CommandFn, TaskFn};

// ============================================================================
// Log levels
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Critical,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warning => "warning",
            LogLevel::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warning" => Some(LogLevel::Warning),
            "critical" => Some(LogLevel::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event kinds
// ============================================================================

/// Discriminant of [`EventBody`], used as the dispatch key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Log,
    Shutdown,
    Restart,
    Command,
    CommandRegister,
    CommandExecuted,
    Task,
    TaskRegister,
    TaskRegistered,
    TaskCompletion,
    ClientActivation,
    Error,
    UserInput,
    Response,
}

impl EventKind {
    pub const ALL: [EventKind; 14] = [
        EventKind::Log,
        EventKind::Shutdown,
        EventKind::Restart,
        EventKind::Command,
        EventKind::CommandRegister,
        EventKind::CommandExecuted,
        EventKind::Task,
        EventKind::TaskRegister,
        EventKind::TaskRegistered,
        EventKind::TaskCompletion,
        EventKind::ClientActivation,
        EventKind::Error,
        EventKind::UserInput,
        EventKind::Response,
    ];

    /// Variant name as it appears in the `type` field of a wire record.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Log => "LogEvent",
            EventKind::Shutdown => "ShutdownEvent",
            EventKind::Restart => "RestartEvent",
            EventKind::Command => "CommandEvent",
            EventKind::CommandRegister => "CommandRegisterEvent",
            EventKind::CommandExecuted => "CommandExecutedEvent",
            EventKind::Task => "TaskEvent",
            EventKind::TaskRegister => "TaskRegisterEvent",
            EventKind::TaskRegistered => "TaskRegisteredEvent",
            EventKind::TaskCompletion => "TaskCompletionEvent",
            EventKind::ClientActivation => "ClientActivationEvent",
            EventKind::Error => "ErrorEvent",
            EventKind::UserInput => "UserInputEvent",
            EventKind::Response => "ResponseEvent",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }

    /// Register events carry in-process handlers and never leave the process.
    pub fn is_local_only(&self) -> bool {
        matches!(self, EventKind::CommandRegister | EventKind::TaskRegister)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Event bodies
// ============================================================================

/// The (module, command, args) triple a command was invoked with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub module: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventBody {
    #[serde(rename = "LogEvent")]
    Log { level: LogLevel, message: String },

    #[serde(rename = "ShutdownEvent")]
    Shutdown { emergency: bool, reason: String },

    #[serde(rename = "RestartEvent")]
    Restart { reason: String },

    #[serde(rename = "CommandEvent")]
    Command {
        module: String,
        command: String,
        #[serde(default)]
        args: Vec<String>,
    },

    #[serde(skip)]
    CommandRegister {
        module: String,
        command: String,
        info: String,
        handler: CommandFn,
    },

    #[serde(rename = "CommandExecutedEvent")]
    CommandExecuted {
        invocation: Invocation,
        success: bool,
        output: String,
    },

    #[serde(rename = "TaskEvent")]
    Task {
        namespace: String,
        task: String,
        #[serde(default)]
        args: Vec<String>,
    },

    #[serde(skip)]
    TaskRegister {
        namespace: String,
        task: String,
        arg_spec: Vec<String>,
        info: String,
        handler: TaskFn,
    },

    #[serde(rename = "TaskRegisteredEvent")]
    TaskRegistered {
        namespace: String,
        task: String,
        #[serde(default)]
        arg_spec: Vec<String>,
        info: String,
    },

    #[serde(rename = "TaskCompletionEvent")]
    TaskCompletion {
        namespace: String,
        task: String,
        #[serde(default)]
        args: Vec<String>,
        success: bool,
        output: String,
    },

    #[serde(rename = "ClientActivationEvent")]
    ClientActivation { message: String },

    #[serde(rename = "ErrorEvent")]
    Error { message: String },

    #[serde(rename = "UserInputEvent")]
    UserInput { message: String },

    #[serde(rename = "ResponseEvent")]
    Response { message: String },
}

impl EventBody {
    pub fn kind(&self) -> EventKind {
        match self {
            EventBody::Log { .. } => EventKind::Log,
            EventBody::Shutdown { .. } => EventKind::Shutdown,
            EventBody::Restart { .. } => EventKind::Restart,
            EventBody::Command { .. } => EventKind::Command,
            EventBody::CommandRegister { .. } => EventKind::CommandRegister,
            EventBody::CommandExecuted { .. } => EventKind::CommandExecuted,
            EventBody::Task { .. } => EventKind::Task,
            EventBody::TaskRegister { .. } => EventKind::TaskRegister,
            EventBody::TaskRegistered { .. } => EventKind::TaskRegistered,
            EventBody::TaskCompletion { .. } => EventKind::TaskCompletion,
            EventBody::ClientActivation { .. } => EventKind::ClientActivation,
            EventBody::Error { .. } => EventKind::Error,
            EventBody::UserInput { .. } => EventKind::UserInput,
            EventBody::Response { .. } => EventKind::Response,
        }
    }

    pub fn log(level: LogLevel, message: impl Into<String>) -> Self {
        EventBody::Log {
            level,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        EventBody::Error {
            message: message.into(),
        }
    }

    pub fn command(
        module: impl Into<String>,
        command: impl Into<String>,
        args: Vec<String>,
    ) -> Self {
        EventBody::Command {
            module: module.into(),
            command: command.into(),
            args,
        }
    }

    pub fn task(namespace: impl Into<String>, task: impl Into<String>, args: Vec<String>) -> Self {
        EventBody::Task {
            namespace: namespace.into(),
            task: task.into(),
            args,
        }
    }
}

// ============================================================================
// Event
// ============================================================================

/// An immutable bus message.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub sender: String,
    pub timestamp: String,
    pub chain: Chain,
    pub body: EventBody,
}

impl Event {
    /// Build an event stamped with the local wall-clock time.
    pub fn new(sender: impl Into<String>, chain: Chain, body: EventBody) -> Self {
        Self {
            sender: sender.into(),
            timestamp: timestamp_now(),
            chain,
            body,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.body.kind()
    }

    pub fn is_local_only(&self) -> bool {
        self.kind().is_local_only()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{} {} {}]",
            self.kind(),
            self.chain,
            self.timestamp,
            self.sender
        )?;
        match &self.body {
            EventBody::CommandRegister {
                module,
                command,
                info,
                ..
            } => write!(f, " {module}::{command} ({info})"),
            EventBody::TaskRegister {
                namespace,
                task,
                info,
                ..
            } => write!(f, " {namespace}::{task} ({info})"),
            body => match serde_json::to_value(body) {
                Ok(value) => write!(f, " {}", value["payload"]),
                Err(_) => Ok(()),
            },
        }
    }
}

/// Wall-clock time formatted the way every event and log line carries it.
pub fn timestamp_now() -> String {
    chrono::Local::now().format("%H:%M:%S").to_string()
}
