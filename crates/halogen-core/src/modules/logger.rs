use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;
use halogen_protocol::{Event, EventBody, EventKind, LogLevel};

use crate::config::ModuleConfig;
use crate::event_bus::Emitter;
use crate::module::{Module, ModuleContext};

pub const NAME: &str = "logger";

/// Writes accepted log records to a file and to the tracing subscriber.
pub struct LoggerModule {
    emitter: Emitter,
    config: ModuleConfig,
    threshold: LogLevel,
    terminal: bool,
    path: PathBuf,
    file: Option<File>,
}

impl LoggerModule {
    pub fn new(context: ModuleContext) -> Self {
        Self {
            emitter: context.emitter,
            config: context.config,
            threshold: LogLevel::Info,
            terminal: true,
            path: PathBuf::from("halogen.log"),
            file: None,
        }
    }

    fn record(&mut self, event: &Event, level: LogLevel, message: &str) {
        if level < self.threshold {
            return;
        }

        if let Some(file) = self.file.as_mut() {
            let line = format!(
                "[{}] [{}] ({}) {}",
                event.timestamp,
                level.as_str().to_uppercase(),
                capitalize(&event.sender),
                message
            );
            // never emit a LogEvent from here, it would come straight back
            if let Err(err) = writeln!(file, "{line}") {
                tracing::warn!(path = %self.path.display(), error = %err, "failed to write log file");
            }
        }

        if self.terminal {
            let sender = event.sender.as_str();
            let chain = event.chain.to_string();
            match level {
                LogLevel::Debug => tracing::debug!(sender, chain = %chain, "{message}"),
                LogLevel::Info => tracing::info!(sender, chain = %chain, "{message}"),
                LogLevel::Warning => tracing::warn!(sender, chain = %chain, "{message}"),
                LogLevel::Critical => tracing::error!(sender, chain = %chain, "{message}"),
            }
        }
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[async_trait]
impl Module for LoggerModule {
    fn name(&self) -> &str {
        NAME
    }

    fn info(&self) -> String {
        "Filters log events by level and writes them to a file and the terminal".to_string()
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let chain = self.emitter.chain(None);

        let level = self.config.get("level", "info".to_string());
        self.threshold = match LogLevel::parse(&level) {
            Some(level) => level,
            None => {
                self.emitter.warning(
                    chain,
                    format!("Invalid log level specified in config.toml '{level}'. Defaulting to 'info'"),
                );
                LogLevel::Info
            }
        };
        self.terminal = self.config.get("terminal", true);
        self.path = PathBuf::from(self.config.get("logfile", "halogen.log".to_string()));

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("could not open log file {}", self.path.display()))?;
        self.file = Some(file);

        let absolute = std::path::absolute(&self.path).unwrap_or_else(|_| self.path.clone());
        self.emitter
            .info(chain, format!("Now logging into file: {}", absolute.display()));
        Ok(())
    }

    async fn end(&mut self) -> (bool, String) {
        match self.file.take() {
            Some(mut file) => match file.flush() {
                Ok(()) => (true, "Closed log file.".to_string()),
                Err(err) => (false, format!("Could not flush log file: {err}")),
            },
            None => (true, "No log file was open.".to_string()),
        }
    }

    fn handled_events(&self) -> Vec<EventKind> {
        vec![EventKind::Log]
    }

    async fn handle(&mut self, event: &Event) -> anyhow::Result<()> {
        if let EventBody::Log { level, message } = &event.body {
            self.record(event, *level, message);
        }
        Ok(())
    }
}
