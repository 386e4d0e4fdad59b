use loam_common::types::Role;

use super::{AuthContext, EntityModel};
use crate::engine::{FieldKind, FieldSpec, Schema};

const FIELDS: &[FieldSpec] = &[
    FieldSpec::required("type", FieldKind::String),
    FieldSpec::required("parent_id", FieldKind::String),
    FieldSpec::required("name", FieldKind::String),
    FieldSpec::optional("icon", FieldKind::String),
    FieldSpec::optional("cover", FieldKind::Json),
    FieldSpec::optional("body", FieldKind::Text),
];
const SCHEMA: Schema = Schema::new(FIELDS);

/// Pages carry a rich-text `body` that collaborators may edit.
pub struct PageModel;

impl EntityModel for PageModel {
    fn type_tag(&self) -> &'static str {
        "page"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn parent_types(&self) -> &'static [&'static str] {
        &["space", "folder", "page"]
    }

    fn can_create(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Editor)
    }

    fn can_update_attributes(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Editor)
    }

    fn can_update_document(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Collaborator)
    }

    fn can_delete(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Editor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn collaborators_edit_body_but_not_attributes() {
        let attrs = json!({ "type": "page", "parent_id": "space-1", "name": "p", "body": "text" });
        let ctx = AuthContext { user_id: "u", role: Some(Role::Collaborator), ancestors: &[], attributes: &attrs };
        assert!(PageModel.can_update_document(&ctx));
        assert!(!PageModel.can_update_attributes(&ctx));

        let viewer = AuthContext { role: Some(Role::Viewer), ..ctx };
        assert!(!PageModel.can_update_document(&viewer));
        assert!(PageModel.can_react(&viewer));
    }

    #[test]
    fn page_search_text_includes_body() {
        let attrs = json!({ "type": "page", "parent_id": "space-1", "name": "Plan", "body": "ship it" });
        let text = PageModel.extract_text(&attrs);
        assert_eq!(text.name, "Plan");
        assert_eq!(text.text, "ship it");
        assert!(PageModel.collaborators(&attrs).is_none());
    }
}
