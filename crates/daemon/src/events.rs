// Engine change notifications.
//
// Every committed write publishes one event after its transaction commits.
// Subscribers that fall behind lose the oldest events; publishing never
// blocks and never fails the write.

use loam_common::protocol::sync::ChangeKind;
use loam_common::types::Role;
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    EntityCreated { entity_id: String, root_id: String },
    EntityUpdated { entity_id: String, root_id: String, local_revision: i64 },
    EntityDeleted { entity_id: String, root_id: String },
    /// An inbound item changed local state.
    EntityMerged { entity_id: String, root_id: String, server_revision: i64 },
    CollaborationChanged { entity_id: String, collaborator_id: String, role: Option<Role> },
    ReactionChanged { entity_id: String, reaction: String, count: i64 },
    /// The outbox gave up on a mutation after repeated transport failures.
    MutationFailed { mutation_id: Uuid, entity_id: String, error: String },
    /// The central service rejected a mutation and its local effect was undone.
    MutationReverted { mutation_id: Uuid, entity_id: String },
    /// One pull cycle for a stream finished.
    SyncCompleted { root_id: String, kind: ChangeKind, cursor: i64 },
}

impl EngineEvent {
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Self::EntityCreated { entity_id, .. }
            | Self::EntityUpdated { entity_id, .. }
            | Self::EntityDeleted { entity_id, .. }
            | Self::EntityMerged { entity_id, .. }
            | Self::CollaborationChanged { entity_id, .. }
            | Self::ReactionChanged { entity_id, .. }
            | Self::MutationFailed { entity_id, .. }
            | Self::MutationReverted { entity_id, .. } => Some(entity_id),
            Self::SyncCompleted { .. } => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    /// Fire and forget. Having no subscribers is not an error.
    pub fn publish(&self, event: EngineEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = EngineEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events_in_order() {
        let events = EventPublisher::new();
        let mut rx = events.subscribe();
        events.publish(EngineEvent::EntityCreated { entity_id: "p1".into(), root_id: "s1".into() });
        events.publish(EngineEvent::EntityDeleted { entity_id: "p1".into(), root_id: "s1".into() });

        assert!(matches!(rx.recv().await, Ok(EngineEvent::EntityCreated { .. })));
        let second = rx.recv().await.expect("second event");
        assert_eq!(second.entity_id(), Some("p1"));
        assert!(matches!(second, EngineEvent::EntityDeleted { .. }));
    }

    #[test]
    fn publishing_without_subscribers_is_fine() {
        let events = EventPublisher::with_capacity(1);
        events.publish(EngineEvent::SyncCompleted {
            root_id: "s1".into(),
            kind: ChangeKind::Tombstones,
            cursor: 3,
        });
    }
}
