//! The contract every capability module implements.

use std::any::Any;

use async_trait::async_trait;
use halogen_protocol::{Chain, CommandFn, Event, EventKind, Outcome, TaskError, TaskFn};

use crate::config::{ModuleConfig, Settings};
use crate::event_bus::Emitter;

/// What a module is constructed with.
#[derive(Debug, Clone)]
pub struct ModuleContext {
    pub emitter: Emitter,
    pub config: ModuleConfig,
}

// ============================================================================
// Declared operations
// ============================================================================

pub struct CommandSpec {
    pub name: String,
    pub info: String,
    pub handler: CommandFn,
}

pub struct TaskSpec {
    pub name: String,
    pub info: String,
    pub args: Vec<String>,
    pub handler: TaskFn,
}

/// Commands and tasks a module exposes, harvested by the registry.
#[derive(Default)]
pub struct Operations {
    pub commands: Vec<CommandSpec>,
    pub tasks: Vec<TaskSpec>,
}

impl Operations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn command<F>(mut self, name: &str, info: &str, f: F) -> Self
    where
        F: Fn(&[String], Chain) -> Outcome + Send + Sync + 'static,
    {
        self.commands.push(CommandSpec {
            name: name.to_string(),
            info: info.to_string(),
            handler: CommandFn::new(f),
        });
        self
    }

    pub fn task<F>(mut self, name: &str, args: &[&str], info: &str, f: F) -> Self
    where
        F: Fn(Chain, &[String]) -> Result<String, TaskError> + Send + Sync + 'static,
    {
        self.tasks.push(TaskSpec {
            name: name.to_string(),
            info: info.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            handler: TaskFn::new(f),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty() && self.tasks.is_empty()
    }
}

// ============================================================================
// Module trait
// ============================================================================

#[async_trait]
pub trait Module: Send {
    /// Unique name, also the key of the module's configuration section.
    fn name(&self) -> &str;

    fn info(&self) -> String {
        String::new()
    }

    /// Called once after every module has been constructed.
    async fn start(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Called once at shutdown. Must not fail.
    async fn end(&mut self) -> (bool, String);

    fn handled_events(&self) -> Vec<EventKind>;

    async fn handle(&mut self, event: &Event) -> anyhow::Result<()>;

    fn operations(&self) -> Operations {
        Operations::default()
    }
}

type BuildFn = dyn Fn(ModuleContext) -> anyhow::Result<Box<dyn Module>> + Send + Sync;

/// Named constructor of a module.
pub struct ModuleFactory {
    pub name: &'static str,
    build: Box<BuildFn>,
}

impl ModuleFactory {
    pub fn new<F>(name: &'static str, build: F) -> Self
    where
        F: Fn(ModuleContext) -> anyhow::Result<Box<dyn Module>> + Send + Sync + 'static,
    {
        Self {
            name,
            build: Box::new(build),
        }
    }

    pub fn build(&self, context: ModuleContext) -> anyhow::Result<Box<dyn Module>> {
        (self.build)(context)
    }
}

impl std::fmt::Debug for ModuleFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleFactory")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Supplies module factories beyond the built-ins.
pub trait ModuleLoader: Send + Sync {
    fn discover(&self, settings: &Settings) -> Vec<ModuleFactory>;
}

/// A loader that finds nothing.
pub struct NoModules;

impl ModuleLoader for NoModules {
    fn discover(&self, _settings: &Settings) -> Vec<ModuleFactory> {
        Vec::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRecord {
    pub name: String,
    pub exposes_commands: bool,
    pub exposes_tasks: bool,
    pub subscriptions: Vec<EventKind>,
}

/// Text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
