use loam_common::types::Role;

use super::{AuthContext, EntityModel, COLLABORATORS_FIELD};
use crate::engine::{FieldKind, FieldSpec, Schema};

const FIELDS: &[FieldSpec] = &[
    FieldSpec::required("type", FieldKind::String),
    FieldSpec::required("parent_id", FieldKind::String),
    FieldSpec::required("name", FieldKind::String),
    FieldSpec::optional("description", FieldKind::String),
    FieldSpec::optional(COLLABORATORS_FIELD, FieldKind::Map),
];
const SCHEMA: Schema = Schema::new(FIELDS);

/// Folders group pages and files. Their collaborator map overrides the space's.
pub struct FolderModel;

impl EntityModel for FolderModel {
    fn type_tag(&self) -> &'static str {
        "folder"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn parent_types(&self) -> &'static [&'static str] {
        &["space", "folder"]
    }

    fn can_create(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Editor)
    }

    fn can_update_attributes(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Editor)
    }

    fn can_update_document(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Editor)
    }

    fn can_delete(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Editor)
    }
}
