use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use halogen_protocol::Event;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

/// Thread-safe FIFO of events.
///
/// Producers may be sync or async code on any thread; `emit` never blocks
/// beyond the queue lock.
#[derive(Debug, Default)]
pub struct EventBus {
    queue: Mutex<VecDeque<Event>>,
    available: Notify,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Event>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue an event.
    pub fn emit(&self, event: Event) {
        self.queue().push_back(event);
        self.available.notify_one();
    }

    /// Dequeue the next event without waiting.
    pub fn try_receive(&self) -> Option<Event> {
        self.queue().pop_front()
    }

    /// Wait up to `timeout` for the next event.
    pub async fn receive(&self, timeout: Duration) -> Option<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.available.notified();
            if let Some(event) = self.try_receive() {
                return Some(event);
            }
            if timeout_at(deadline, notified).await.is_err() {
                return self.try_receive();
            }
        }
    }

    /// Advisory: may be stale as soon as it returns.
    pub fn count(&self) -> usize {
        self.queue().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue().is_empty()
    }

    /// Take every queued event.
    pub fn drain(&self) -> Vec<Event> {
        self.queue().drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use halogen_protocol::{Chain, EventBody};

    use super::*;

    fn error(n: u64) -> Event {
        Event::new("test", Chain::new(0, n), EventBody::error(format!("e{n}")))
    }

    #[test]
    fn test_fifo_single_producer() {
        let bus = EventBus::new();
        for n in 0..5 {
            bus.emit(error(n));
        }
        assert_eq!(bus.count(), 5);
        let flows: Vec<u64> = std::iter::from_fn(|| bus.try_receive())
            .map(|e| e.chain.flow)
            .collect();
        assert_eq!(flows, vec![0, 1, 2, 3, 4]);
        assert!(bus.is_empty());
    }

    #[tokio::test]
    async fn test_receive_times_out() {
        let bus = EventBus::new();
        let started = std::time::Instant::now();
        assert!(bus.receive(Duration::from_millis(50)).await.is_none());
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn test_receive_wakes_on_emit() {
        let bus = Arc::new(EventBus::new());
        let producer = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.emit(error(7));
        });

        let event = bus.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.chain.flow, 7);
    }

    #[test]
    fn test_drain_empties_queue() {
        let bus = EventBus::new();
        bus.emit(error(1));
        bus.emit(error(2));
        assert_eq!(bus.drain().len(), 2);
        assert_eq!(bus.count(), 0);
    }
}
