use flowx_types::{FlowError, Result};
use jsonschema::JSONSchema;
use serde_json::{json, Value};

/// Checks a parsed response against a structural schema.
pub trait SchemaValidator: Send + Sync {
    /// Name of the type the response must conform to.
    fn type_name(&self) -> &str;

    /// Schema text shown to the model.
    fn schema_text(&self) -> &str;

    /// `Err` carries a human-readable description of every violation.
    fn validate(&self, value: &Value) -> std::result::Result<(), String>;
}

/// Builds a validator for a scheme node's schema text and target type.
pub trait ValidatorFactory: Send + Sync {
    fn create(&self, schema_text: &str, type_name: Option<&str>) -> Result<Box<dyn SchemaValidator>>;
}

// ---------------------------------------------------------------------------
// JSON Schema
// ---------------------------------------------------------------------------

/// Type name used when the node names none and the schema has no `title`.
pub const DEFAULT_TYPE_NAME: &str = "Response";

/// Validator backed by a compiled JSON Schema.
///
/// With a type name, validation targets the matching entry of the schema's
/// `$defs` (or legacy `definitions`) table; without one, the whole schema.
pub struct JsonSchemaValidator {
    schema_text: String,
    type_name: String,
    compiled: JSONSchema,
}

impl std::fmt::Debug for JsonSchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchemaValidator")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

impl JsonSchemaValidator {
    pub fn new(schema_text: &str, type_name: Option<&str>) -> Result<Self> {
        let schema: Value = serde_json::from_str(schema_text)
            .map_err(|e| FlowError::config(format!("schema is not valid JSON: {e}")))?;

        let (target, type_name) = match type_name {
            Some(name) => (definition_ref(&schema, name)?, name.to_string()),
            None => {
                let title = schema
                    .get("title")
                    .and_then(Value::as_str)
                    .unwrap_or(DEFAULT_TYPE_NAME)
                    .to_string();
                (schema, title)
            }
        };

        let compiled = JSONSchema::compile(&target)
            .map_err(|e| FlowError::config(format!("schema does not compile: {e}")))?;

        Ok(Self {
            schema_text: schema_text.to_string(),
            type_name,
            compiled,
        })
    }
}

/// A schema whose root is a `$ref` into the definitions table holding `name`.
fn definition_ref(schema: &Value, name: &str) -> Result<Value> {
    let table = ["$defs", "definitions"]
        .into_iter()
        .find(|key| schema.get(*key).and_then(|d| d.get(name)).is_some())
        .ok_or_else(|| FlowError::config(format!("type `{name}` is not defined in schema")))?;

    let mut wrapper = json!({
        "$ref": format!("#/{table}/{name}"),
        table: schema[table].clone(),
    });
    if let Some(dialect) = schema.get("$schema") {
        wrapper["$schema"] = dialect.clone();
    }
    Ok(wrapper)
}

impl SchemaValidator for JsonSchemaValidator {
    fn type_name(&self) -> &str {
        &self.type_name
    }

    fn schema_text(&self) -> &str {
        &self.schema_text
    }

    fn validate(&self, value: &Value) -> std::result::Result<(), String> {
        match self.compiled.validate(value) {
            Ok(()) => Ok(()),
            Err(errors) => Err(errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect::<Vec<_>>()
                .join("\n")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSchemaFactory;

impl ValidatorFactory for JsonSchemaFactory {
    fn create(&self, schema_text: &str, type_name: Option<&str>) -> Result<Box<dyn SchemaValidator>> {
        Ok(Box::new(JsonSchemaValidator::new(schema_text, type_name)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SENTIMENT: &str = r#"{
        "$defs": {
            "Sentiment": {
                "type": "object",
                "properties": {
                    "label": {"enum": ["positive", "negative", "neutral"]},
                    "score": {"type": "number"}
                },
                "required": ["label"]
            }
        }
    }"#;

    #[test]
    fn validates_named_definition() {
        let v = JsonSchemaValidator::new(SENTIMENT, Some("Sentiment")).unwrap();
        assert_eq!(v.type_name(), "Sentiment");
        assert!(v.validate(&json!({"label": "positive", "score": 0.9})).is_ok());

        let err = v.validate(&json!({"label": "meh"})).unwrap_err();
        assert!(err.starts_with("/label"), "{err}");
    }

    #[test]
    fn missing_required_field_is_reported() {
        let v = JsonSchemaValidator::new(SENTIMENT, Some("Sentiment")).unwrap();
        let err = v.validate(&json!({"score": 1})).unwrap_err();
        assert!(err.contains("label"), "{err}");
    }

    #[test]
    fn whole_schema_used_without_type() {
        let v = JsonSchemaValidator::new(
            r#"{"title": "Point", "type": "object", "required": ["x"]}"#,
            None,
        )
        .unwrap();
        assert_eq!(v.type_name(), "Point");
        assert!(v.validate(&json!({"x": 1})).is_ok());
        assert!(v.validate(&json!([])).is_err());
    }

    #[test]
    fn legacy_definitions_table_is_supported() {
        let v = JsonSchemaValidator::new(
            r#"{"definitions": {"Tag": {"type": "string"}}}"#,
            Some("Tag"),
        )
        .unwrap();
        assert!(v.validate(&json!("rust")).is_ok());
        assert!(v.validate(&json!(3)).is_err());
    }

    #[test]
    fn unknown_type_is_configuration_error() {
        let Err(err) = JsonSchemaValidator::new(SENTIMENT, Some("Missing")) else {
            panic!("expected an unknown type to be rejected");
        };
        assert!(matches!(err, FlowError::Configuration(_)));
        assert!(err.to_string().contains("Missing"));
    }

    #[test]
    fn invalid_schema_json_is_configuration_error() {
        let Err(err) = JsonSchemaFactory.create("{not json", None) else {
            panic!("expected malformed schema text to be rejected");
        };
        assert!(matches!(err, FlowError::Configuration(_)));
    }

    #[test]
    fn schema_text_is_kept_verbatim() {
        let v = JsonSchemaFactory.create(SENTIMENT, Some("Sentiment")).unwrap();
        assert_eq!(v.schema_text(), SENTIMENT);
    }
}
