//! Shared definitions for the halogen core and its remote clients.
//!
//! Everything that crosses a process boundary lives here: the chain model used
//! to correlate causally related events, the event variants themselves, the
//! operation handler types carried by register events, and the line-delimited
//! JSON wire codec.

pub mod chain;
pub mod error;
pub mod event;
pub mod ops;
pub mod wire;

pub use chain::{Chain, ChainAllocator, ChainSource, ContextPolicy, PROCESS_CONTEXT};
pub use error::{ProtocolError, Result};
pub use event::{Event, EventBody, EventKind, Invocation, LogLevel};
pub use ops::{CommandFn, Outcome, TaskError, TaskFn};

/// Default address the gateway listens on and clients connect to.
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 6240;
