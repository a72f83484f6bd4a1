//! Publish/subscribe orchestration core of the halogen assistant.

pub mod config;
pub mod control;
pub mod error;
pub mod event_bus;
pub mod module;
pub mod modules;
pub mod registry;

pub use crate::config::{ModuleConfig, Settings};
pub use crate::control::{Core, CoreExit, CoreState};
pub use crate::error::{HalogenError, Result};
pub use crate::event_bus::{Emitter, EventBus};
pub use crate::module::{Module, ModuleContext, ModuleFactory, ModuleLoader, Operations};
pub use crate::registry::ModuleRegistry;
