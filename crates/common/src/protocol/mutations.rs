// Outbound mutation batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A locally originated intent, shipped to the central service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mutation {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub data: MutationData,
}

/// Typed mutation payload. Binary CRDT deltas travel as base64.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MutationData {
    CreateEntity {
        entity_id: String,
        root_id: String,
        delta_id: Uuid,
        data_b64: String,
        created_at: DateTime<Utc>,
    },
    UpdateEntity {
        entity_id: String,
        root_id: String,
        delta_id: Uuid,
        data_b64: String,
        created_at: DateTime<Utc>,
    },
    DeleteEntity {
        entity_id: String,
        root_id: String,
        deleted_at: DateTime<Utc>,
    },
    CreateReaction {
        entity_id: String,
        root_id: String,
        reaction: String,
        created_at: DateTime<Utc>,
    },
    DeleteReaction {
        entity_id: String,
        root_id: String,
        reaction: String,
        deleted_at: DateTime<Utc>,
    },
}

impl MutationData {
    pub fn kind(&self) -> MutationKind {
        match self {
            Self::CreateEntity { .. } => MutationKind::CreateEntity,
            Self::UpdateEntity { .. } => MutationKind::UpdateEntity,
            Self::DeleteEntity { .. } => MutationKind::DeleteEntity,
            Self::CreateReaction { .. } => MutationKind::CreateReaction,
            Self::DeleteReaction { .. } => MutationKind::DeleteReaction,
        }
    }

    /// The entity this mutation targets.
    pub fn entity_id(&self) -> &str {
        match self {
            Self::CreateEntity { entity_id, .. }
            | Self::UpdateEntity { entity_id, .. }
            | Self::DeleteEntity { entity_id, .. }
            | Self::CreateReaction { entity_id, .. }
            | Self::DeleteReaction { entity_id, .. } => entity_id,
        }
    }

    pub fn root_id(&self) -> &str {
        match self {
            Self::CreateEntity { root_id, .. }
            | Self::UpdateEntity { root_id, .. }
            | Self::DeleteEntity { root_id, .. }
            | Self::CreateReaction { root_id, .. }
            | Self::DeleteReaction { root_id, .. } => root_id,
        }
    }
}

/// Mutation type tag, stored in the outbox `type` column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MutationKind {
    CreateEntity,
    UpdateEntity,
    DeleteEntity,
    CreateReaction,
    DeleteReaction,
}

impl MutationKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CreateEntity => "create_entity",
            Self::UpdateEntity => "update_entity",
            Self::DeleteEntity => "delete_entity",
            Self::CreateReaction => "create_reaction",
            Self::DeleteReaction => "delete_reaction",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "create_entity" => Some(Self::CreateEntity),
            "update_entity" => Some(Self::UpdateEntity),
            "delete_entity" => Some(Self::DeleteEntity),
            "create_reaction" => Some(Self::CreateReaction),
            "delete_reaction" => Some(Self::DeleteReaction),
            _ => None,
        }
    }
}

/// Request body for the mutation submission endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubmitMutationsRequest {
    pub mutations: Vec<Mutation>,
}

/// Per-mutation outcome reported by the central service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MutationStatus {
    Success,
    /// Terminal rejection (e.g. authorization revoked). Never retried.
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MutationResult {
    pub id: Uuid,
    pub status: MutationStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SubmitMutationsResponse {
    pub results: Vec<MutationResult>,
}
