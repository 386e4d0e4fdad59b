// Entity type registry.
//
// Each type tag maps to an `EntityModel` carrying its schema, derived-data
// extractors and capability checks. Callers resolve the model once per
// operation and pass it around.

pub mod file;
pub mod folder;
pub mod page;
pub mod space;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use loam_common::types::Role;
use serde_json::Value;

use crate::engine::{CrdtError, FieldKind, Schema};
use crate::error::{EngineError, EngineResult};
use crate::store::EntityRow;

pub use file::FileModel;
pub use folder::FolderModel;
pub use page::PageModel;
pub use space::SpaceModel;

pub const COLLABORATORS_FIELD: &str = "collaborators";

/// What a capability check sees.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub user_id: &'a str,
    /// Effective role from the collaboration index, if any.
    pub role: Option<Role>,
    /// Root-first chain. Ends at the parent for creates, at the entity otherwise.
    pub ancestors: &'a [EntityRow],
    /// Candidate attributes of the operation.
    pub attributes: &'a Value,
}

impl AuthContext<'_> {
    pub fn has_role(&self, minimum: Role) -> bool {
        self.role.is_some_and(|role| role.at_least(minimum))
    }
}

/// Text pushed into the search index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchText {
    pub name: String,
    pub text: String,
}

pub trait EntityModel: Send + Sync {
    fn type_tag(&self) -> &'static str;

    fn schema(&self) -> &Schema;

    /// Types allowed as parent. Empty means the type is a root.
    fn parent_types(&self) -> &'static [&'static str];

    fn is_root(&self) -> bool {
        self.parent_types().is_empty()
    }

    /// Schema validation plus the checks every type shares.
    fn validate(&self, attributes: &Value) -> Result<(), CrdtError> {
        self.schema().validate(attributes)?;
        match attributes.get("type").and_then(Value::as_str) {
            Some(tag) if tag == self.type_tag() => {}
            other => {
                return Err(CrdtError::InvalidAttributes(format!(
                    "`type` must be `{}`, got {other:?}",
                    self.type_tag()
                )));
            }
        }
        if let Some(map) = attributes.get(COLLABORATORS_FIELD).and_then(Value::as_object) {
            for (user, role) in map {
                if role.as_str().and_then(Role::parse).is_none() {
                    return Err(CrdtError::InvalidAttributes(format!(
                        "collaborator `{user}` has unknown role {role}"
                    )));
                }
            }
        }
        Ok(())
    }

    fn extract_text(&self, attributes: &Value) -> SearchText {
        let name = attributes.get("name").and_then(Value::as_str).unwrap_or_default().to_owned();
        let text = self
            .schema()
            .text_fields()
            .filter_map(|field| attributes.get(field).and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n");
        SearchText { name, text }
    }

    fn extract_mentions(&self, attributes: &Value) -> Vec<String> {
        let mut targets: Vec<String> = self
            .schema()
            .text_fields()
            .filter_map(|field| attributes.get(field).and_then(Value::as_str))
            .flat_map(loam_common::mention::mention_targets)
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    /// Collaborator map embedded in the attributes, when the type has one.
    fn collaborators(&self, attributes: &Value) -> Option<BTreeMap<String, Role>> {
        let field = self.schema().field(COLLABORATORS_FIELD)?;
        if field.kind != FieldKind::Map {
            return None;
        }
        let map = attributes
            .get(COLLABORATORS_FIELD)
            .and_then(Value::as_object)
            .map(|object| {
                object
                    .iter()
                    .filter_map(|(user, role)| role.as_str().and_then(Role::parse).map(|role| (user.clone(), role)))
                    .collect()
            })
            .unwrap_or_default();
        Some(map)
    }

    /// Whether creating this type starts a file upload.
    fn tracks_transfer(&self) -> bool {
        false
    }

    fn can_create(&self, ctx: &AuthContext<'_>) -> bool;
    fn can_update_attributes(&self, ctx: &AuthContext<'_>) -> bool;
    fn can_update_document(&self, ctx: &AuthContext<'_>) -> bool;
    fn can_delete(&self, ctx: &AuthContext<'_>) -> bool;

    fn can_react(&self, ctx: &AuthContext<'_>) -> bool {
        ctx.has_role(Role::Viewer)
    }
}

#[derive(Clone)]
pub struct ModelRegistry {
    models: HashMap<&'static str, Arc<dyn EntityModel>>,
}

impl ModelRegistry {
    pub fn empty() -> Self {
        Self { models: HashMap::new() }
    }

    /// Registry with the built-in space, folder, page and file types.
    pub fn standard() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(SpaceModel));
        registry.register(Arc::new(FolderModel));
        registry.register(Arc::new(PageModel));
        registry.register(Arc::new(FileModel));
        registry
    }

    pub fn register(&mut self, model: Arc<dyn EntityModel>) {
        self.models.insert(model.type_tag(), model);
    }

    pub fn get(&self, type_tag: &str) -> EngineResult<Arc<dyn EntityModel>> {
        self.models.get(type_tag).cloned().ok_or_else(|| EngineError::UnknownType(type_tag.to_owned()))
    }

    /// Resolve the model named by an attribute object's `type`.
    pub fn for_attributes(&self, attributes: &Value) -> EngineResult<Arc<dyn EntityModel>> {
        let tag = attributes
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::InvalidAttributes("`type` is required".into()))?;
        self.get(tag)
    }
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn standard_registry_resolves_all_types() {
        let registry = ModelRegistry::standard();
        for tag in ["space", "folder", "page", "file"] {
            assert_eq!(registry.get(tag).expect("registered").type_tag(), tag);
        }
        assert!(matches!(registry.get("chat"), Err(EngineError::UnknownType(tag)) if tag == "chat"));
    }

    #[test]
    fn for_attributes_requires_type() {
        let registry = ModelRegistry::standard();
        assert!(matches!(
            registry.for_attributes(&json!({ "name": "x" })),
            Err(EngineError::InvalidAttributes(_))
        ));
        assert_eq!(registry.for_attributes(&json!({ "type": "page" })).expect("page").type_tag(), "page");
    }

    #[test]
    fn validate_rejects_mismatched_type_tag() {
        let err = PageModel
            .validate(&json!({ "type": "folder", "parent_id": "space-1", "name": "n" }))
            .expect_err("wrong tag");
        assert!(matches!(err, CrdtError::InvalidAttributes(_)));
    }

    #[test]
    fn validate_rejects_unknown_roles() {
        let err = SpaceModel
            .validate(&json!({ "type": "space", "name": "s", "collaborators": { "u1": "owner" } }))
            .expect_err("unknown role");
        assert!(matches!(err, CrdtError::InvalidAttributes(message) if message.contains("owner")));
    }

    #[test]
    fn mentions_are_deduplicated_and_sorted() {
        let attrs = json!({
            "type": "page",
            "parent_id": "space-1",
            "name": "n",
            "body": "ping @[user-2] and @[user-1|Ana], again @[user-2]"
        });
        assert_eq!(PageModel.extract_mentions(&attrs), vec!["user-1", "user-2"]);
        let text = PageModel.extract_text(&attrs);
        assert_eq!(text.name, "n");
        assert!(text.text.starts_with("ping"));
    }
}
