use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use halogen_protocol::{CommandFn, Event, EventBody, EventKind, Invocation, Outcome};

use crate::event_bus::Emitter;
use crate::module::{Module, ModuleContext, Operations, panic_message};

pub const NAME: &str = "command";

struct CommandEntry {
    info: String,
    handler: CommandFn,
}

/// module -> command -> entry
type Namespaces = Arc<Mutex<BTreeMap<String, BTreeMap<String, CommandEntry>>>>;

/// Keeps every registered command and executes command events.
pub struct CommandHandler {
    emitter: Emitter,
    namespaces: Namespaces,
}

impl CommandHandler {
    pub fn new(context: ModuleContext) -> Self {
        Self {
            emitter: context.emitter,
            namespaces: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    fn register(&self, event: &Event, module: &str, command: &str, info: &str, handler: &CommandFn) {
        let mut namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        let namespace = namespaces.entry(module.to_string()).or_default();
        if namespace.contains_key(command) {
            drop(namespaces);
            self.emitter.warning(
                event.chain,
                format!("Command '{command}' for module '{module}' already registered"),
            );
            return;
        }
        namespace.insert(
            command.to_string(),
            CommandEntry {
                info: info.to_string(),
                handler: handler.clone(),
            },
        );
        drop(namespaces);
        self.emitter
            .debug(event.chain, format!("Registered command {module}::{command}"));
    }

    fn lookup(&self, module: &str, command: &str) -> Option<CommandFn> {
        let namespaces = self.namespaces.lock().unwrap_or_else(PoisonError::into_inner);
        namespaces
            .get(module)
            .and_then(|namespace| namespace.get(command))
            .map(|entry| entry.handler.clone())
    }

    fn execute(&self, event: &Event, module: &str, command: &str, args: &[String]) {
        let chain = event.chain;
        let outcome = match self.lookup(module, command) {
            None => {
                self.emitter.warning(
                    chain,
                    format!("Client with chain id '{chain}' tried to execute invalid command {module}::{command}"),
                );
                Outcome::fail(format!("Undefined Command: {module}::{command}"))
            }
            Some(handler) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| handler.call(args, chain)))
                    .unwrap_or_else(|payload| {
                        Outcome::fail(format!(
                            "Failed to execute command. Encountered panic: {}",
                            panic_message(payload.as_ref())
                        ))
                    });
                let shown = if module == NAME && command == "help" {
                    "*help-message*"
                } else {
                    outcome.output.as_str()
                };
                let message = format!(
                    "Client with chain id '{chain}' requested command '{module}::{command}'. Returned Output: {shown}"
                );
                if outcome.success {
                    self.emitter.info(chain, message);
                } else {
                    self.emitter.warning(chain, message);
                }
                outcome
            }
        };

        self.emitter.send(
            chain,
            EventBody::CommandExecuted {
                invocation: Invocation {
                    module: module.to_string(),
                    command: command.to_string(),
                    args: args.to_vec(),
                },
                success: outcome.success,
                output: outcome.output,
            },
        );
    }
}

fn render_help(namespaces: &Namespaces) -> String {
    let namespaces = namespaces.lock().unwrap_or_else(PoisonError::into_inner);
    let mut help = String::from("Available commands (invoke as module::command [args]):\n");
    for (module, commands) in namespaces.iter() {
        for (command, entry) in commands {
            let _ = writeln!(help, "{module:<8}::{command:<10} : {}", entry.info);
        }
    }
    help
}

#[async_trait]
impl Module for CommandHandler {
    fn name(&self) -> &str {
        NAME
    }

    fn info(&self) -> String {
        "Executes registered commands".to_string()
    }

    async fn end(&mut self) -> (bool, String) {
        (true, "Command handler stopped.".to_string())
    }

    fn handled_events(&self) -> Vec<EventKind> {
        vec![EventKind::CommandRegister, EventKind::Command]
    }

    async fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        match &event.body {
            EventBody::CommandRegister {
                module,
                command,
                info,
                handler,
            } => self.register(event, module, command, info, handler),
            EventBody::Command {
                module,
                command,
                args,
            } => self.execute(event, module, command, args),
            _ => {}
        }
        Ok(())
    }

    fn operations(&self) -> Operations {
        let namespaces = self.namespaces.clone();
        Operations::new().command("help", "List every available command", move |_, _| {
            Outcome::ok(render_help(&namespaces))
        })
    }
}
