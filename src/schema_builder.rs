//! A schema builder that infers a JSON schema from example objects and partial schemas.
use std::collections::BTreeSet;

use serde_json::{json, Map, Value};

use crate::types::ToJsonSchema;

/// The `$schema` URI written at the top of every generated schema.
pub const SCHEMA_URI: &str = "http://json-schema.org/schema#";

#[derive(Debug, Clone, Default)]
struct SchemaNode {
    scalars: BTreeSet<&'static str>,
    object: Option<ObjectNode>,
    items: Option<Box<SchemaNode>>,
}

#[derive(Debug, Clone, Default)]
struct ObjectNode {
    properties: Vec<(String, SchemaNode)>,
    /// `None` until an object or a schema with `required` has been seen.
    required: Option<BTreeSet<String>>,
}

impl ObjectNode {
    fn property(&mut self, name: &str) -> &mut SchemaNode {
        let index = match self.properties.iter().position(|(n, _)| n == name) {
            Some(index) => index,
            None => {
                self.properties.push((name.to_string(), SchemaNode::default()));
                self.properties.len() - 1
            }
        };
        &mut self.properties[index].1
    }

    fn restrict_required(&mut self, keys: BTreeSet<String>) {
        self.required = Some(match self.required.take() {
            Some(required) => required.intersection(&keys).cloned().collect(),
            None => keys,
        });
    }
}

fn scalar_name(name: &str) -> Option<&'static str> {
    match name {
        "boolean" => Some("boolean"),
        "integer" => Some("integer"),
        "null" => Some("null"),
        "number" => Some("number"),
        "string" => Some("string"),
        _ => None,
    }
}

impl SchemaNode {
    fn add_object(&mut self, value: &Value) {
        match value {
            Value::Null => {
                self.scalars.insert("null");
            }
            Value::Bool(_) => {
                self.scalars.insert("boolean");
            }
            Value::Number(n) if n.is_i64() || n.is_u64() => {
                self.scalars.insert("integer");
            }
            Value::Number(_) => {
                self.scalars.insert("number");
            }
            Value::String(_) => {
                self.scalars.insert("string");
            }
            Value::Array(items) => {
                let node = self.items.get_or_insert_with(Default::default);
                for item in items {
                    node.add_object(item);
                }
            }
            Value::Object(object) => {
                let node = self.object.get_or_insert_with(Default::default);
                for (key, value) in object {
                    node.property(key).add_object(value);
                }
                node.restrict_required(object.keys().cloned().collect());
            }
        }
    }

    fn add_schema(&mut self, schema: &Value) {
        let Value::Object(schema) = schema else {
            return;
        };
        let types: Vec<&str> = match schema.get("type") {
            Some(Value::String(name)) => vec![name.as_str()],
            Some(Value::Array(names)) => names.iter().filter_map(Value::as_str).collect(),
            _ if schema.contains_key("properties") => vec!["object"],
            _ if schema.contains_key("items") => vec!["array"],
            _ => Vec::new(),
        };
        for name in types {
            match name {
                "object" => {
                    let node = self.object.get_or_insert_with(Default::default);
                    if let Some(Value::Object(properties)) = schema.get("properties") {
                        for (key, subschema) in properties {
                            node.property(key).add_schema(subschema);
                        }
                    }
                    if let Some(Value::Array(required)) = schema.get("required") {
                        node.restrict_required(
                            required
                                .iter()
                                .filter_map(Value::as_str)
                                .map(str::to_string)
                                .collect(),
                        );
                    }
                }
                "array" => {
                    let node = self.items.get_or_insert_with(Default::default);
                    if let Some(items) = schema.get("items") {
                        node.add_schema(items);
                    }
                }
                other => {
                    if let Some(scalar) = scalar_name(other) {
                        self.scalars.insert(scalar);
                    }
                }
            }
        }
    }

    fn to_schema(&self) -> Map<String, Value> {
        let mut scalars = self.scalars.clone();
        if scalars.contains("number") {
            scalars.remove("integer");
        }
        let mut alternatives: Vec<Map<String, Value>> = Vec::new();
        if let Some(object) = &self.object {
            let mut schema = Map::new();
            schema.insert("type".to_string(), json!("object"));
            let properties: Map<String, Value> = object
                .properties
                .iter()
                .map(|(name, node)| (name.clone(), Value::Object(node.to_schema())))
                .collect();
            schema.insert("properties".to_string(), Value::Object(properties));
            if let Some(required) = object.required.as_ref().filter(|r| !r.is_empty()) {
                schema.insert("required".to_string(), json!(required));
            }
            alternatives.push(schema);
        }
        if let Some(items) = &self.items {
            let mut schema = Map::new();
            schema.insert("type".to_string(), json!("array"));
            schema.insert("items".to_string(), Value::Object(items.to_schema()));
            alternatives.push(schema);
        }
        if !scalars.is_empty() {
            let mut schema = Map::new();
            let value = match scalars.len() {
                1 => json!(scalars.iter().next()),
                _ => json!(scalars),
            };
            schema.insert("type".to_string(), value);
            alternatives.push(schema);
        }
        match alternatives.len() {
            0 => Map::new(),
            1 => alternatives.remove(0),
            _ => {
                let mut schema = Map::new();
                schema.insert(
                    "anyOf".to_string(),
                    Value::Array(alternatives.into_iter().map(Value::Object).collect()),
                );
                schema
            }
        }
    }
}

/// Infers a JSON schema from the schemas and example objects added to it.
///
/// Differing scalar types become a type list, and a property is required only when every
/// object seen so far carries it.
#[derive(Debug, Clone, Default)]
pub struct SchemaBuilder {
    root: SchemaNode,
}

impl SchemaBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges a partial schema.
    pub fn add_schema(&mut self, schema: &Value) -> &mut Self {
        self.root.add_schema(schema);
        self
    }

    /// Merges an example instance.
    pub fn add_object(&mut self, object: &Value) -> &mut Self {
        self.root.add_object(object);
        self
    }

    /// The schema inferred so far.
    pub fn to_schema(&self) -> Value {
        let mut schema = Map::new();
        schema.insert("$schema".to_string(), json!(SCHEMA_URI));
        schema.extend(self.root.to_schema());
        Value::Object(schema)
    }
}

impl ToJsonSchema for SchemaBuilder {
    fn to_json_schema(&self) -> Value {
        self.to_schema()
    }

    fn type_name(&self) -> String {
        "SchemaBuilder".to_string()
    }
}
