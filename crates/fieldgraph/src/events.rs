//! Change notifications emitted by the engine.
//!
//! Subscribers receive events through a tokio broadcast channel. Events are
//! hints for recomputation, not a durable log: a receiver that falls behind
//! by more than the configured capacity sees `RecvError::Lagged`.

use crate::domain::FieldId;
use tokio::sync::broadcast;

/// Something changed in the dependency graph
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyEvent {
    /// The outgoing edge set of a field was replaced
    DependenciesRebuilt {
        /// The field whose edges changed
        field_id: FieldId,
    },

    /// Fields whose values derive from `source` need recalculation
    DependantsChanged {
        /// The field that changed
        source: FieldId,
        /// Every transitive dependant of `source`
        dependants: Vec<FieldId>,
    },

    /// A field was moved to the trash
    FieldTrashed {
        /// The trashed field
        field_id: FieldId,
    },

    /// A field was restored from the trash
    FieldRestored {
        /// The restored field
        field_id: FieldId,
    },

    /// A field was permanently deleted
    FieldDeleted {
        /// The deleted field
        field_id: FieldId,
    },
}

/// Sending half of the event channel, owned by the engine
#[derive(Debug, Clone)]
pub(crate) struct EventBus {
    sender: broadcast::Sender<DependencyEvent>,
}

impl EventBus {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DependencyEvent> {
        self.sender.subscribe()
    }

    /// Publish an event. Having no subscribers is not an error.
    pub(crate) fn publish(&self, event: DependencyEvent) {
        if self.sender.send(event).is_err() {
            tracing::trace!("No dependency event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();

        bus.publish(DependencyEvent::FieldTrashed {
            field_id: FieldId(9),
        });

        assert_eq!(
            rx.recv().await.unwrap(),
            DependencyEvent::FieldTrashed {
                field_id: FieldId(9)
            }
        );
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(1);
        bus.publish(DependencyEvent::FieldDeleted {
            field_id: FieldId(1),
        });
    }
}
