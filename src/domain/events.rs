//! Subscriber registry
//!
//! Every consumer registers independently and gets its own [`Subscription`].
//! Dropping the subscription (or calling [`Subscription::unsubscribe`])
//! removes it; nobody can replace another consumer's registration.

use crate::domain::models::{ScaleEvent, StatusEvent, WeightReading};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;

/// Callback-style subscriber. Called on the publishing task, keep it short.
pub trait ScaleObserver: Send + Sync {
    fn on_weight(&self, _reading: &WeightReading) {}
    fn on_status(&self, _status: &StatusEvent) {}
}

enum Sink {
    Channel(mpsc::UnboundedSender<ScaleEvent>),
    Observer(Arc<dyn ScaleObserver>),
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    sinks: Vec<(u64, Sink)>,
}

#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel subscription: events queue until read.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.register(Sink::Channel(tx));
        Subscription {
            id,
            receiver: Some(rx),
            registry: Arc::downgrade(&self.registry),
        }
    }

    /// Callback subscription. Keep the returned handle alive to stay registered.
    pub fn subscribe_observer(&self, observer: Arc<dyn ScaleObserver>) -> Subscription {
        let id = self.register(Sink::Observer(observer));
        Subscription {
            id,
            receiver: None,
            registry: Arc::downgrade(&self.registry),
        }
    }

    fn register(&self, sink: Sink) -> u64 {
        let mut registry = self
            .registry
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        registry.next_id += 1;
        let id = registry.next_id;
        registry.sinks.push((id, sink));
        id
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry
            .lock()
            .map(|r| r.sinks.len())
            .unwrap_or(0)
    }

    pub fn publish(&self, event: ScaleEvent) {
        let observers: Vec<Arc<dyn ScaleObserver>> = {
            let mut registry = self
                .registry
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());

            // Closed channels unsubscribe themselves
            registry.sinks.retain(|(_, sink)| match sink {
                Sink::Channel(tx) => tx.send(event.clone()).is_ok(),
                Sink::Observer(_) => true,
            });

            registry
                .sinks
                .iter()
                .filter_map(|(_, sink)| match sink {
                    Sink::Observer(o) => Some(o.clone()),
                    Sink::Channel(_) => None,
                })
                .collect()
        };

        // Outside the lock so observers may subscribe or unsubscribe
        for observer in observers {
            match &event {
                ScaleEvent::Weight(reading) => observer.on_weight(reading),
                ScaleEvent::Status(status) => observer.on_status(status),
            }
        }
    }

    pub fn publish_weight(&self, reading: WeightReading) {
        self.publish(ScaleEvent::Weight(reading));
    }

    pub fn publish_status(&self, status: StatusEvent) {
        self.publish(ScaleEvent::Status(status));
    }

    fn remove(registry: &Weak<Mutex<Registry>>, id: u64) {
        if let Some(registry) = registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.sinks.retain(|(sink_id, _)| *sink_id != id);
            }
        }
    }
}

/// Cancellation handle for one registration.
pub struct Subscription {
    id: u64,
    receiver: Option<mpsc::UnboundedReceiver<ScaleEvent>>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    /// Next event. Always `None` for observer subscriptions.
    pub async fn recv(&mut self) -> Option<ScaleEvent> {
        match self.receiver.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    pub fn try_recv(&mut self) -> Option<ScaleEvent> {
        self.receiver.as_mut().and_then(|rx| rx.try_recv().ok())
    }

    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        EventBus::remove(&self.registry, self.id);
    }
}
