use std::sync::Arc;
use parking_lot::RwLock;

use crate::brokers::queue::options::QueueStatus;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Created { queue: String },
    Removed { queue: String },
    StatusChanged { queue: String, from: QueueStatus, to: QueueStatus },
}

pub type EventListener = Arc<dyn Fn(&QueueEvent) + Send + Sync>;

/// Listeners run synchronously, in registration order.
#[derive(Default)]
pub struct EventRegistry {
    listeners: RwLock<Vec<EventListener>>,
}

impl EventRegistry {
    pub fn subscribe(&self, listener: EventListener) {
        self.listeners.write().push(listener);
    }

    pub fn emit(&self, event: QueueEvent) {
        let listeners = self.listeners.read().clone();
        for listener in listeners {
            listener(&event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn test_listeners_run_in_order() {
        let registry = EventRegistry::default();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second"] {
            let seen = seen.clone();
            registry.subscribe(Arc::new(move |event: &QueueEvent| {
                if let QueueEvent::Created { queue } = event {
                    seen.lock().push(format!("{}:{}", tag, queue));
                }
            }));
        }

        registry.emit(QueueEvent::Created { queue: "orders".into() });
        assert_eq!(*seen.lock(), vec!["first:orders", "second:orders"]);
    }
}
