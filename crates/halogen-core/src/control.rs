//! The core control loop.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use halogen_protocol::{Chain, ChainSource, Event, EventBody, EventKind, Outcome};
use tokio::sync::watch;

use crate::config::Settings;
use crate::error::{HalogenError, Result};
use crate::event_bus::{Emitter, EventBus};
use crate::module::{ModuleFactory, ModuleLoader, Operations, panic_message};
use crate::registry::ModuleRegistry;

/// Namespace of the commands the core itself answers.
pub const CORE_NAMESPACE: &str = "core";

/// How long the loop waits on an empty bus before re-checking stop requests.
pub const IDLE_WAIT: Duration = Duration::from_millis(50);

const GET_TERMS: [&str; 4] = ["chain", "user", "config", "help"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Stopped,
    Initializing,
    Running,
    ShuttingDown,
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreExit {
    Shutdown,
    Restart,
}

struct StopRequest {
    exit: CoreExit,
    reason: String,
    emergency: bool,
}

pub struct Core {
    settings: Settings,
    bus: Arc<EventBus>,
    emitter: Emitter,
    registry: ModuleRegistry,
    state: watch::Sender<CoreState>,
    stop: Option<StopRequest>,
    event_log: Option<File>,
}

impl Core {
    /// Construct every module and queue the registration of their operations.
    pub fn init(
        settings: Settings,
        bus: Arc<EventBus>,
        chains: Arc<dyn ChainSource>,
        builtins: Vec<ModuleFactory>,
        loader: &dyn ModuleLoader,
    ) -> Self {
        let (state, _) = watch::channel(CoreState::Initializing);
        let emitter = Emitter::new(CORE_NAMESPACE, bus.clone(), chains);

        let registration = emitter.chain(None);
        for command in core_operations(&emitter, &settings).commands {
            emitter.send(
                registration,
                EventBody::CommandRegister {
                    module: CORE_NAMESPACE.to_string(),
                    command: command.name,
                    info: command.info,
                    handler: command.handler,
                },
            );
        }

        let mut registry = ModuleRegistry::new(emitter.clone());
        registry.load(builtins, loader, &settings);

        let event_log = if settings.dev.enabled {
            open_event_log(&settings.dev.event_logfile)
        } else {
            None
        };

        Self {
            settings,
            bus,
            emitter,
            registry,
            state,
            stop: None,
            event_log,
        }
    }

    pub fn state(&self) -> CoreState {
        *self.state.borrow()
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn registry(&self) -> &ModuleRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn strict(&self) -> bool {
        self.settings.dev.enabled
    }

    /// Start every module and dispatch events until a stop is requested.
    pub async fn run(&mut self) -> Result<CoreExit> {
        if let Err(fault) = self.registry.start_all(self.strict()).await {
            self.shutdown(&fault.shutdown_reason()).await;
            return Err(fault);
        }
        self.state.send_replace(CoreState::Running);
        tracing::info!(modules = self.registry.len(), "halogen core running");

        loop {
            if let Some(stop) = self.take_stop() {
                self.shutdown(&stop.reason).await;
                return Ok(stop.exit);
            }
            let Some(event) = self.bus.receive(IDLE_WAIT).await else {
                continue;
            };
            if let Err(fault) = self.pass_event(event).await {
                self.shutdown(&fault.shutdown_reason()).await;
                return Err(fault);
            }
        }
    }

    /// Emergency requests stop right away, others once the bus has drained.
    fn take_stop(&mut self) -> Option<StopRequest> {
        let ready = self
            .stop
            .as_ref()
            .is_some_and(|stop| stop.emergency || self.bus.is_empty());
        if ready { self.stop.take() } else { None }
    }

    fn request_stop(&mut self, exit: CoreExit, reason: &str, emergency: bool) {
        let replaces = match &self.stop {
            None => true,
            Some(current) => emergency && !current.emergency,
        };
        if !replaces {
            return;
        }
        if emergency {
            self.state.send_replace(CoreState::ShuttingDown);
        }
        self.stop = Some(StopRequest {
            exit,
            reason: reason.to_string(),
            emergency,
        });
    }

    /// Handle core events, then hand the event to every subscriber in turn.
    async fn pass_event(&mut self, event: Event) -> Result<()> {
        self.record_event(&event);

        match &event.body {
            EventBody::Shutdown { emergency, reason } => {
                self.request_stop(CoreExit::Shutdown, reason, *emergency)
            }
            EventBody::Restart { reason } => self.request_stop(CoreExit::Restart, reason, false),
            _ => {}
        }

        for index in self.registry.subscribers(event.kind()) {
            let Some(module) = self.registry.module_mut(index) else {
                continue;
            };
            let name = module.name().to_string();
            let message = match AssertUnwindSafe(module.handle(&event)).catch_unwind().await {
                Ok(Ok(())) => continue,
                Ok(Err(err)) => format!("{err:#}"),
                Err(payload) => format!("panic: {}", panic_message(payload.as_ref())),
            };
            self.catch_fault(&name, &event, message)?;
        }
        Ok(())
    }

    fn catch_fault(&self, module: &str, event: &Event, message: String) -> Result<()> {
        tracing::error!(module, kind = %event.kind(), error = %message, "module fault");
        self.emitter.critical(
            event.chain,
            format!(
                "Module '{module}' could not handle an event! Event = {event}. Encountered Error = {message}"
            ),
        );
        if self.strict() {
            return Err(HalogenError::ModuleFault {
                module: module.to_string(),
                event: event.to_string(),
                message,
            });
        }
        Ok(())
    }

    fn record_event(&mut self, event: &Event) {
        let Some(file) = self.event_log.as_mut() else {
            return;
        };
        if let Err(err) = writeln!(file, "{event}") {
            tracing::warn!(error = %err, "failed to write event log");
        }
    }

    /// End every module, flush the remaining log records into the logger, end it last.
    async fn shutdown(&mut self, reason: &str) {
        self.state.send_replace(CoreState::ShuttingDown);

        let logger = self.registry.end_all().await;
        let chain = self.emitter.chain(None);
        self.emitter
            .info(chain, format!("Halogen is now shutting down. Reason : {reason}"));

        let pending = self.bus.drain();
        match logger {
            Some(mut logger) => {
                for event in pending.iter().filter(|e| e.kind() == EventKind::Log) {
                    let handled = AssertUnwindSafe(logger.handle(event)).catch_unwind().await;
                    if !matches!(handled, Ok(Ok(()))) {
                        tracing::warn!(event = %event, "logger could not record a pending event");
                    }
                }
                let (success, message) = logger.end().await;
                if !success {
                    tracing::warn!(%message, "logger did not end cleanly");
                }
            }
            None => tracing::info!(reason, dropped = pending.len(), "halogen shutting down without a logger"),
        }

        if let Some(mut file) = self.event_log.take() {
            let _ = file.flush();
        }
        self.state.send_replace(CoreState::Stopped);
    }
}

fn open_event_log(path: &str) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            tracing::warn!(path, error = %err, "could not open event log");
            None
        }
    }
}

fn core_operations(emitter: &Emitter, settings: &Settings) -> Operations {
    let shutdown = emitter.clone();
    let restart = emitter.clone();
    let user = settings.user.name.clone();
    let config_dir = settings.directory_display();

    Operations::new()
        .command("shutdown", "Shut halogen down", move |_, chain| {
            shutdown.send(
                chain,
                EventBody::Shutdown {
                    emergency: false,
                    reason: "User request.".to_string(),
                },
            );
            Outcome::ok("Requested Halogen to shutdown.")
        })
        .command("restart", "Restart halogen", move |_, chain| {
            restart.send(
                chain,
                EventBody::Restart {
                    reason: "User request.".to_string(),
                },
            );
            Outcome::ok("Requested Halogen to restart.")
        })
        .command(
            "get",
            "Read a core term: chain, user, config or help",
            move |args, chain| get_term(args, chain, &user, &config_dir),
        )
}

fn get_term(args: &[String], chain: Chain, user: &str, config_dir: &str) -> Outcome {
    let terms = format!("Accessible terms: [{}]", GET_TERMS.join(", "));
    match args.first().map(String::as_str) {
        Some("chain") => Outcome::ok(chain.to_string()),
        Some("user") => Outcome::ok(user),
        Some("config") => Outcome::ok(format!("Using config dir : {config_dir}")),
        Some("help") => Outcome::ok(terms),
        Some(other) => Outcome::fail(format!("Unknown term '{other}'. {terms}")),
        None => Outcome::fail(format!("Missing term. {terms}")),
    }
}
