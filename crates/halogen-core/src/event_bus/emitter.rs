use std::sync::Arc;

use halogen_protocol::{Chain, ChainSource, Event, EventBody, LogLevel};

use super::EventBus;

/// Emit helper handed to each module, stamping events with the module's name.
#[derive(Clone)]
pub struct Emitter {
    sender: String,
    bus: Arc<EventBus>,
    chains: Arc<dyn ChainSource>,
}

impl Emitter {
    pub fn new(sender: impl Into<String>, bus: Arc<EventBus>, chains: Arc<dyn ChainSource>) -> Self {
        Self {
            sender: sender.into(),
            bus,
            chains,
        }
    }

    /// Same bus and chain source, different sender name.
    pub fn scoped(&self, sender: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            bus: self.bus.clone(),
            chains: self.chains.clone(),
        }
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn chains(&self) -> &Arc<dyn ChainSource> {
        &self.chains
    }

    /// Chain of `cause`, or a fresh process chain.
    pub fn chain(&self, cause: Option<&Event>) -> Chain {
        self.chains.next(cause)
    }

    pub fn emit(&self, event: Event) {
        self.bus.emit(event);
    }

    pub fn send(&self, chain: Chain, body: EventBody) {
        self.bus.emit(Event::new(self.sender.clone(), chain, body));
    }

    pub fn log(&self, chain: Chain, level: LogLevel, message: impl Into<String>) {
        self.send(chain, EventBody::log(level, message));
    }

    pub fn debug(&self, chain: Chain, message: impl Into<String>) {
        self.log(chain, LogLevel::Debug, message);
    }

    pub fn info(&self, chain: Chain, message: impl Into<String>) {
        self.log(chain, LogLevel::Info, message);
    }

    pub fn warning(&self, chain: Chain, message: impl Into<String>) {
        self.log(chain, LogLevel::Warning, message);
    }

    pub fn critical(&self, chain: Chain, message: impl Into<String>) {
        self.log(chain, LogLevel::Critical, message);
    }
}

impl std::fmt::Debug for Emitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Emitter")
            .field("sender", &self.sender)
            .finish_non_exhaustive()
    }
}
