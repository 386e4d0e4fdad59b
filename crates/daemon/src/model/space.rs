// Spaces: root entities that own a collaborator map.

use loam_common::types::Role;

use super::{AuthContext, EntityModel, COLLABORATORS_FIELD};
use crate::engine::{FieldKind, FieldSpec, Schema};

const FIELDS: &[FieldSpec] = &[
    FieldSpec::required("type", FieldKind::String),
    FieldSpec::required("name", FieldKind::String),
    FieldSpec::optional("description", FieldKind::String),
    FieldSpec::optional("avatar", FieldKind::String),
    FieldSpec::optional(COLLABORATORS_FIELD, FieldKind::Map),
];
const SCHEMA: Schema = Schema::new(FIELDS);

pub struct SpaceModel;

impl EntityModel for SpaceModel {
    fn type_tag(&self) -> &'static str {
        "space"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn parent_types(&self) -> &'static [&'static str] {
        &[]
    }

    /// The creator must list themselves as admin.
    fn can_create(&self, ctx: &AuthContext<'_>) -> bool {
        self.collaborators(ctx.attributes)
            .and_then(|map| map.get(ctx.user_id).copied())
            .is_some_and(|role| role == Role::Admin)
    }

    fn can_update_attributes(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Admin)
    }

    fn can_update_document(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Admin)
    }

    fn can_delete(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Admin)
    }
}
