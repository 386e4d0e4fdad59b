// Inbound revision-cursor protocol.
//
// The client asks for items of one change kind within one root whose
// revision is strictly greater than its cursor. Items arrive in strictly
// increasing revision order; an empty page means the stream is caught up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Role;

/// The independent change streams pulled per root.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    EntityUpdates,
    Tombstones,
    Collaborations,
    Reactions,
    Interactions,
}

impl ChangeKind {
    pub const ALL: [ChangeKind; 5] = [
        ChangeKind::Collaborations,
        ChangeKind::EntityUpdates,
        ChangeKind::Tombstones,
        ChangeKind::Reactions,
        ChangeKind::Interactions,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::EntityUpdates => "entity_updates",
            Self::Tombstones => "tombstones",
            Self::Collaborations => "collaborations",
            Self::Reactions => "reactions",
            Self::Interactions => "interactions",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "entity_updates" => Some(Self::EntityUpdates),
            "tombstones" => Some(Self::Tombstones),
            "collaborations" => Some(Self::Collaborations),
            "reactions" => Some(Self::Reactions),
            "interactions" => Some(Self::Interactions),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PullRequest {
    pub root_id: String,
    pub kind: ChangeKind,
    /// Last revision the client has applied for this stream.
    pub cursor: i64,
    pub limit: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PullResponse {
    pub items: Vec<SyncItem>,
}

/// One remote change with its server revision.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncItem {
    pub revision: i64,
    pub payload: SyncPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncPayload {
    /// An authoritative CRDT delta for an entity.
    EntityUpdate {
        entity_id: String,
        root_id: String,
        delta_id: Uuid,
        data_b64: String,
        created_at: DateTime<Utc>,
        created_by: String,
    },
    Tombstone {
        entity_id: String,
        root_id: String,
        deleted_at: DateTime<Utc>,
        deleted_by: String,
    },
    Collaboration {
        entity_id: String,
        collaborator_id: String,
        role: Role,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted_at: Option<DateTime<Utc>>,
    },
    Reaction {
        entity_id: String,
        root_id: String,
        collaborator_id: String,
        reaction: String,
        created_at: DateTime<Utc>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        deleted_at: Option<DateTime<Utc>>,
    },
    Interaction {
        entity_id: String,
        root_id: String,
        collaborator_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        first_seen_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_seen_at: Option<DateTime<Utc>>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        last_opened_at: Option<DateTime<Utc>>,
    },
}

impl SyncPayload {
    /// The stream this payload belongs to.
    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::EntityUpdate { .. } => ChangeKind::EntityUpdates,
            Self::Tombstone { .. } => ChangeKind::Tombstones,
            Self::Collaboration { .. } => ChangeKind::Collaborations,
            Self::Reaction { .. } => ChangeKind::Reactions,
            Self::Interaction { .. } => ChangeKind::Interactions,
        }
    }

    pub fn entity_id(&self) -> &str {
        match self {
            Self::EntityUpdate { entity_id, .. }
            | Self::Tombstone { entity_id, .. }
            | Self::Collaboration { entity_id, .. }
            | Self::Reaction { entity_id, .. }
            | Self::Interaction { entity_id, .. } => entity_id,
        }
    }
}
