use loam_common::types::Role;
use serde_json::Value;

use super::{AuthContext, EntityModel};
use crate::engine::{CrdtError, FieldKind, FieldSpec, Schema};

const FIELDS: &[FieldSpec] = &[
    FieldSpec::required("type", FieldKind::String),
    FieldSpec::required("parent_id", FieldKind::String),
    FieldSpec::required("name", FieldKind::String),
    FieldSpec::required("mime_type", FieldKind::String),
    FieldSpec::required("size", FieldKind::Number),
    FieldSpec::optional("extension", FieldKind::String),
];
const SCHEMA: Schema = Schema::new(FIELDS);

/// Uploaded files. Creating one starts an upload.
pub struct FileModel;

impl EntityModel for FileModel {
    fn type_tag(&self) -> &'static str {
        "file"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn parent_types(&self) -> &'static [&'static str] {
        &["space", "folder", "page"]
    }

    fn validate(&self, attributes: &Value) -> Result<(), CrdtError> {
        SCHEMA.validate(attributes)?;
        if attributes.get("type").and_then(Value::as_str) != Some(self.type_tag()) {
            return Err(CrdtError::InvalidAttributes("`type` must be `file`".into()));
        }
        match attributes.get("size").and_then(Value::as_u64) {
            Some(_) => Ok(()),
            None => Err(CrdtError::InvalidAttributes("`size` must be a non-negative integer".into())),
        }
    }

    fn tracks_transfer(&self) -> bool {
        true
    }

    fn can_create(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Collaborator)
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
