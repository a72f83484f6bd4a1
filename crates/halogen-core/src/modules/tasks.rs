use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};

use async_trait::async_trait;
use halogen_protocol::{Event, EventBody, EventKind, TaskFn};

use crate::event_bus::Emitter;
use crate::module::{Module, ModuleContext, panic_message};

pub const NAME: &str = "tasks";

struct TaskEntry {
    arg_spec: Vec<String>,
    info: String,
    handler: TaskFn,
}

/// Keeps every registered task and runs task events.
pub struct TaskManager {
    emitter: Emitter,
    /// namespace -> task -> entry
    namespaces: BTreeMap<String, BTreeMap<String, TaskEntry>>,
}

impl TaskManager {
    pub fn new(context: ModuleContext) -> Self {
        Self {
            emitter: context.emitter,
            namespaces: BTreeMap::new(),
        }
    }

    pub fn is_registered(&self, namespace: &str, task: &str) -> bool {
        self.namespaces
            .get(namespace)
            .is_some_and(|tasks| tasks.contains_key(task))
    }

    pub fn task_count(&self) -> usize {
        self.namespaces.values().map(BTreeMap::len).sum()
    }

    fn register(
        &mut self,
        event: &Event,
        namespace: &str,
        task: &str,
        arg_spec: &[String],
        info: &str,
        handler: &TaskFn,
    ) {
        let tasks = self.namespaces.entry(namespace.to_string()).or_default();
        if tasks.contains_key(task) {
            self.emitter.warning(
                event.chain,
                format!("Task with name '{task}' for namespace '{namespace}' already registered"),
            );
            return;
        }
        tasks.insert(
            task.to_string(),
            TaskEntry {
                arg_spec: arg_spec.to_vec(),
                info: info.to_string(),
                handler: handler.clone(),
            },
        );

        self.emitter
            .info(event.chain, format!("Registered task {namespace}::{task}"));
        self.emitter.send(
            event.chain,
            EventBody::TaskRegistered {
                namespace: namespace.to_string(),
                task: task.to_string(),
                arg_spec: arg_spec.to_vec(),
                info: info.to_string(),
            },
        );
    }

    fn execute(&self, event: &Event, namespace: &str, task: &str, args: &[String]) {
        let chain = event.chain;
        self.emitter.debug(
            chain,
            format!("Executing task {chain} {namespace}::{task} with args {args:?}"),
        );

        let Some(entry) = self.namespaces.get(namespace).and_then(|tasks| tasks.get(task)) else {
            self.emitter.warning(
                chain,
                format!("Client with chain id '{chain}' tried to execute unknown task {namespace}::{task}"),
            );
            let output = format!("Undefined Task: {namespace}::{task}");
            self.complete(event, namespace, task, args, false, output);
            return;
        };

        let called = catch_unwind(AssertUnwindSafe(|| entry.handler.call(chain, args)));
        let (success, output) = match called {
            Ok(Ok(output)) => (true, output),
            Ok(Err(err)) => (false, err.to_string()),
            Err(payload) => (
                false,
                format!("Unexpected Error(panic): {}", panic_message(payload.as_ref())),
            ),
        };

        self.complete(event, namespace, task, args, success, output.clone());
        self.emitter.info(
            chain,
            format!("Executed task {chain} {namespace}::{task}. Success = {success}"),
        );
        let returned = format!("Task {chain} {namespace}::{task} returned {output}");
        if success {
            self.emitter.debug(chain, returned);
        } else {
            self.emitter.warning(chain, returned);
        }
    }

    fn complete(
        &self,
        event: &Event,
        namespace: &str,
        task: &str,
        args: &[String],
        success: bool,
        output: String,
    ) {
        self.emitter.send(
            event.chain,
            EventBody::TaskCompletion {
                namespace: namespace.to_string(),
                task: task.to_string(),
                args: args.to_vec(),
                success,
                output,
            },
        );
    }
}

#[async_trait]
impl Module for TaskManager {
    fn name(&self) -> &str {
        NAME
    }

    fn info(&self) -> String {
        "Runs registered tasks".to_string()
    }

    async fn end(&mut self) -> (bool, String) {
        let summary: Vec<String> = self
            .namespaces
            .iter()
            .flat_map(|(namespace, tasks)| {
                tasks.iter().map(move |(task, entry)| {
                    format!("{namespace}::{task}({}) {}", entry.arg_spec.join(", "), entry.info)
                })
            })
            .collect();
        tracing::debug!(tasks = ?summary, "task manager stopping");
        (true, format!("Released {} tasks.", summary.len()))
    }

    fn handled_events(&self) -> Vec<EventKind> {
        vec![EventKind::TaskRegister, EventKind::Task]
    }

    async fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        match &event.body {
            EventBody::TaskRegister {
                namespace,
                task,
                arg_spec,
                info,
                handler,
            } => self.register(event, namespace, task, arg_spec, info, handler),
            EventBody::Task {
                namespace,
                task,
                args,
            } => self.execute(event, namespace, task, args),
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use halogen_protocol::{Chain, ChainAllocator, LogLevel, TaskError};

    use super::*;
    use crate::config::ModuleConfig;
    use crate::event_bus::EventBus;

    fn manager() -> (TaskManager, Arc<EventBus>) {
        let bus = Arc::new(EventBus::new());
        let emitter = Emitter::new(NAME, bus.clone(), Arc::new(ChainAllocator::default()));
        let module = TaskManager::new(ModuleContext {
            emitter,
            config: ModuleConfig::empty(NAME),
        });
        (module, bus)
    }

    fn register(task: &str, f: fn(Chain, &[String]) -> Result<String, TaskError>) -> Event {
        Event::new(
            "registry",
            Chain::new(0, 0),
            EventBody::TaskRegister {
                namespace: "demo".to_string(),
                task: task.to_string(),
                arg_spec: vec!["value".to_string()],
                info: "demo task".to_string(),
                handler: TaskFn::new(f),
            },
        )
    }

    fn run(task: &str) -> Event {
        Event::new("client", Chain::new(2, 5), EventBody::task("demo", task, vec!["x".to_string()]))
    }

    fn completion(bus: &EventBus) -> (bool, String, Chain) {
        bus.drain()
            .into_iter()
            .find_map(|e| match e.body {
                EventBody::TaskCompletion { success, output, .. } => Some((success, output, e.chain)),
                _ => None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_register_announces_task() {
        let (mut tasks, bus) = manager();
        tasks.handle(&register("echo", |_, args| Ok(args.join(",")))).await.unwrap();
        assert!(tasks.is_registered("demo", "echo"));

        let announced = bus
            .drain()
            .into_iter()
            .any(|e| matches!(e.body, EventBody::TaskRegistered { ref task, .. } if task == "echo"));
        assert!(announced);
    }

    #[tokio::test]
    async fn test_duplicate_registration_warns_once() {
        let (mut tasks, bus) = manager();
        tasks.handle(&register("echo", |_, _| Ok("first".to_string()))).await.unwrap();
        tasks.handle(&register("echo", |_, _| Ok("second".to_string()))).await.unwrap();
        assert_eq!(tasks.task_count(), 1);

        let warnings: Vec<String> = bus
            .drain()
            .into_iter()
            .filter_map(|e| match e.body {
                EventBody::Log {
                    level: LogLevel::Warning,
                    message,
                } => Some(message),
                _ => None,
            })
            .collect();
        assert_eq!(
            warnings,
            vec!["Task with name 'echo' for namespace 'demo' already registered"]
        );

        tasks.handle(&run("echo")).await.unwrap();
        assert_eq!(completion(&bus).1, "first");
    }

    #[tokio::test]
    async fn test_success_and_failures_fold_into_completion() {
        let (mut tasks, bus) = manager();
        tasks.handle(&register("ok", |_, args| Ok(args.join(",")))).await.unwrap();
        tasks
            .handle(&register("expected", |_, _| Err(TaskError::failed("bad input"))))
            .await
            .unwrap();
        tasks
            .handle(&register("panics", |_, _| panic!("oh no")))
            .await
            .unwrap();
        bus.drain();

        tasks.handle(&run("ok")).await.unwrap();
        assert_eq!(completion(&bus), (true, "x".to_string(), Chain::new(2, 5)));

        tasks.handle(&run("expected")).await.unwrap();
        assert_eq!(completion(&bus).1, "Error: bad input");

        tasks.handle(&run("panics")).await.unwrap();
        let (success, output, _) = completion(&bus);
        assert!(!success);
        assert_eq!(output, "Unexpected Error(panic): oh no");
    }

    #[tokio::test]
    async fn test_unknown_task_still_completes() {
        let (mut tasks, bus) = manager();
        tasks.handle(&run("missing")).await.unwrap();
        let (success, output, chain) = completion(&bus);
        assert!(!success);
        assert_eq!(output, "Undefined Task: demo::missing");
        assert_eq!(chain, Chain::new(2, 5));
    }
}
