//! JSON schemas for OpenAI strict structured outputs.
//!
//! `schemars` output needs three fixes before strict mode accepts it: every
//! object gets `additionalProperties: false`, every property is listed in
//! `required` (nullable ones included), and `$ref`s are inlined because the
//! validator does not follow them.

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Any `JsonSchema + DeserializeOwned` type can be requested as structured output.
pub trait StructuredOutput: JsonSchema + DeserializeOwned {
    fn openai_schema() -> Value {
        let mut value = serde_json::to_value(schema_for!(Self)).unwrap_or_default();

        let definitions = match &mut value {
            Value::Object(root) => {
                root.remove("$schema");
                root.remove("definitions")
            }
            _ => None,
        };

        let definitions = match definitions {
            Some(Value::Object(defs)) => defs,
            _ => Map::new(),
        };
        strictify(&mut value, &definitions);
        value
    }

    fn type_name() -> String {
        <Self as JsonSchema>::schema_name()
    }
}

impl<T: JsonSchema + DeserializeOwned> StructuredOutput for T {}

/// Inline `#/definitions/*` refs and close every object schema, depth first.
fn strictify(value: &mut Value, definitions: &Map<String, Value>) {
    match value {
        Value::Object(map) => {
            let inlined = map
                .get("$ref")
                .and_then(Value::as_str)
                .and_then(|r| r.strip_prefix("#/definitions/"))
                .and_then(|name| definitions.get(name))
                .cloned();
            if let Some(def) = inlined {
                *value = def;
                strictify(value, definitions);
                return;
            }

            if map.get("type").and_then(Value::as_str) == Some("object") {
                map.insert("additionalProperties".to_string(), Value::Bool(false));
                if let Some(Value::Object(props)) = map.get("properties") {
                    let required = props.keys().cloned().map(Value::String).collect();
                    map.insert("required".to_string(), Value::Array(required));
                }
            }

            for child in map.values_mut() {
                strictify(child, definitions);
            }
        }
        Value::Array(items) => {
            for item in items {
                strictify(item, definitions);
            }
        }
        _ => {}
    }
}
