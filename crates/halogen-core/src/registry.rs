use std::collections::HashMap;

use halogen_protocol::{ChainSource, EventBody, EventKind};

use crate::config::Settings;
use crate::error::{HalogenError, Result};
use crate::event_bus::Emitter;
use crate::module::{Module, ModuleContext, ModuleFactory, ModuleLoader, ModuleRecord};

/// Name of the module that outlives every other one at shutdown.
pub const LOGGER_MODULE: &str = "logger";

/// Owns every module instance and the event-type → subscriber table.
pub struct ModuleRegistry {
    modules: Vec<Box<dyn Module>>,
    records: Vec<ModuleRecord>,
    /// event kind -> indices into `modules`, in registration order
    dispatch: HashMap<EventKind, Vec<usize>>,
    emitter: Emitter,
}

impl ModuleRegistry {
    pub fn new(emitter: Emitter) -> Self {
        Self {
            modules: Vec::new(),
            records: Vec::new(),
            dispatch: HashMap::new(),
            emitter: emitter.scoped("registry"),
        }
    }

    /// Register built-ins first, then whatever the loader discovers.
    pub fn load(&mut self, builtins: Vec<ModuleFactory>, loader: &dyn ModuleLoader, settings: &Settings) {
        for factory in builtins {
            self.register(factory, settings);
        }
        for factory in loader.discover(settings) {
            self.register(factory, settings);
        }
    }

    /// Instantiate a module and record its subscriptions and operations.
    ///
    /// Returns false when the module was rejected.
    pub fn register(&mut self, factory: ModuleFactory, settings: &Settings) -> bool {
        let chain = self.emitter.chain(None);

        if self.contains(factory.name) {
            self.emitter.warning(
                chain,
                format!("Module '{}' already registered, ignoring duplicate", factory.name),
            );
            return false;
        }

        let context = ModuleContext {
            emitter: self.emitter.scoped(factory.name),
            config: settings.module_config(factory.name),
        };
        let module = match factory.build(context) {
            Ok(module) => module,
            Err(err) => {
                self.emitter.critical(
                    chain,
                    format!("Could not load module '{}': {err:#}", factory.name),
                );
                return false;
            }
        };

        let name = module.name().to_string();
        if name != factory.name {
            self.emitter.warning(
                chain,
                format!(
                    "Module factory '{}' produced a module named '{name}', ignoring it",
                    factory.name
                ),
            );
            return false;
        }

        let subscriptions = module.handled_events();
        let operations = module.operations();
        let index = self.modules.len();
        for kind in &subscriptions {
            let subscribers = self.dispatch.entry(*kind).or_default();
            if !subscribers.contains(&index) {
                subscribers.push(index);
            }
        }

        self.emitter.info(
            chain,
            format!("Initialized module '{name}'. Info : {}", module.info()),
        );
        self.emitter.debug(
            chain,
            format!(
                "Module '{name}' handles events: [{}]",
                subscriptions
                    .iter()
                    .map(EventKind::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        self.records.push(ModuleRecord {
            name: name.clone(),
            exposes_commands: !operations.commands.is_empty(),
            exposes_tasks: !operations.tasks.is_empty(),
            subscriptions,
        });
        self.modules.push(module);

        for command in operations.commands {
            self.emitter.send(
                chain,
                EventBody::CommandRegister {
                    module: name.clone(),
                    command: command.name,
                    info: command.info,
                    handler: command.handler,
                },
            );
        }
        for task in operations.tasks {
            self.emitter.send(
                chain,
                EventBody::TaskRegister {
                    namespace: name.clone(),
                    task: task.name,
                    arg_spec: task.args,
                    info: task.info,
                    handler: task.handler,
                },
            );
        }
        true
    }

    /// Start every module in registration order.
    ///
    /// A failing start is logged critical and an emergency shutdown is
    /// requested. In strict mode the first failure is returned right away;
    /// otherwise the remaining modules are still started.
    pub async fn start_all(&mut self, strict: bool) -> Result<()> {
        let mut first_fault = None;
        for module in self.modules.iter_mut() {
            let Err(err) = module.start().await else {
                continue;
            };
            let name = module.name().to_string();
            let chain = self.emitter.chain(None);
            self.emitter.critical(
                chain,
                format!(
                    "Could not start module with name '{name}'. Encountered Error = {err:#}. Shutting down halogen!"
                ),
            );
            self.emitter.send(
                chain,
                EventBody::Shutdown {
                    emergency: true,
                    reason: "critical".to_string(),
                },
            );
            let fault = HalogenError::StartupFault {
                module: name,
                message: format!("{err:#}"),
            };
            if strict {
                return Err(fault);
            }
            first_fault.get_or_insert(fault);
        }
        if let Some(fault) = first_fault {
            tracing::error!(error = %fault, "module startup failed");
        }
        Ok(())
    }

    /// End every module except the logger, which is handed back for final flushing.
    pub async fn end_all(&mut self) -> Option<Box<dyn Module>> {
        self.dispatch.clear();
        let mut logger = None;
        for mut module in std::mem::take(&mut self.modules) {
            if module.name() == LOGGER_MODULE {
                logger = Some(module);
                continue;
            }
            let name = module.name().to_string();
            let (success, message) = module.end().await;
            let chain = self.emitter.chain(None);
            if success {
                self.emitter.info(chain, format!("Ended {name}: {message}"));
            } else {
                self.emitter.warning(chain, format!("Ended {name}: {message}"));
            }
        }
        logger
    }

    pub fn subscribers(&self, kind: EventKind) -> Vec<usize> {
        self.dispatch.get(&kind).cloned().unwrap_or_default()
    }

    pub fn module_mut(&mut self, index: usize) -> Option<&mut Box<dyn Module>> {
        self.modules.get_mut(index)
    }

    pub fn records(&self) -> &[ModuleRecord] {
        &self.records
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.iter().any(|r| r.name == name)
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn chains(&self) -> &std::sync::Arc<dyn ChainSource> {
        self.emitter.chains()
    }
}
