// Event Bus
//
// A single FIFO queue every module emits into. The core loop is the only
// consumer; fan-out to subscribers happens at dispatch time.

pub mod bus;
pub mod emitter;

pub use bus::EventBus;
pub use emitter::Emitter;
