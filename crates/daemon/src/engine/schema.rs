// Attribute schemas: which fields a type has and how each one merges.

use serde_json::{Map, Value};

use super::CrdtError;

/// How a field is stored in the replica and merged across writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// JSON string, last writer wins.
    String,
    /// JSON number, last writer wins.
    Number,
    /// JSON boolean, last writer wins.
    Boolean,
    /// Any JSON value replaced as a whole, last writer wins.
    Json,
    /// String→string record; each key is its own last-writer-wins register.
    Map,
    /// Long text merged with character-level splices.
    Text,
}

impl FieldKind {
    fn matches(self, value: &Value) -> bool {
        match self {
            Self::String | Self::Text => value.is_string(),
            Self::Number => value.is_number(),
            Self::Boolean => value.is_boolean(),
            Self::Json => true,
            Self::Map => value.as_object().is_some_and(|map| map.values().all(Value::is_string)),
        }
    }

    /// Fields stored as a single register in the shared attribute map.
    pub fn is_scalar(self) -> bool {
        matches!(self, Self::String | Self::Number | Self::Boolean | Self::Json)
    }

    fn label(self) -> &'static str {
        match self {
            Self::String => "a string",
            Self::Number => "a number",
            Self::Boolean => "a boolean",
            Self::Json => "a JSON value",
            Self::Map => "an object of strings",
            Self::Text => "a string",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub required: bool,
}

impl FieldSpec {
    pub const fn required(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: true }
    }

    pub const fn optional(name: &'static str, kind: FieldKind) -> Self {
        Self { name, kind, required: false }
    }
}

/// The attribute layout of one entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schema {
    fields: &'static [FieldSpec],
}

impl Schema {
    pub const fn new(fields: &'static [FieldSpec]) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &'static [FieldSpec] {
        self.fields
    }

    pub fn field(&self, name: &str) -> Option<&'static FieldSpec> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Names of the text (document body) fields.
    pub fn text_fields(&self) -> impl Iterator<Item = &'static str> {
        self.fields.iter().filter(|field| field.kind == FieldKind::Text).map(|field| field.name)
    }

    /// Check that `value` is an object matching this schema exactly.
    ///
    /// Unknown keys are rejected, required keys must be present and
    /// non-null, and every present value must match its field kind.
    pub fn validate(&self, value: &Value) -> Result<(), CrdtError> {
        let object = value
            .as_object()
            .ok_or_else(|| CrdtError::InvalidAttributes("attributes must be an object".into()))?;

        for key in object.keys() {
            if self.field(key).is_none() {
                return Err(CrdtError::InvalidAttributes(format!("unknown field `{key}`")));
            }
        }

        for field in self.fields {
            match object.get(field.name) {
                None | Some(Value::Null) if field.required => {
                    return Err(CrdtError::InvalidAttributes(format!(
                        "field `{}` is required",
                        field.name
                    )));
                }
                None | Some(Value::Null) => {}
                Some(value) if !field.kind.matches(value) => {
                    return Err(CrdtError::InvalidAttributes(format!(
                        "field `{}` must be {}",
                        field.name,
                        field.kind.label()
                    )));
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}

/// Drop null-valued keys so they compare equal to absent ones.
pub(crate) fn without_nulls(object: &Map<String, Value>) -> Map<String, Value> {
    object.iter().filter(|(_, value)| !value.is_null()).map(|(k, v)| (k.clone(), v.clone())).collect()
}
