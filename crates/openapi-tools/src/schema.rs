//! `OpenAPI` 3.0 schema -> JSON Schema translation.
//!
//! Internal `$ref`s are inlined so every tool schema is self-contained. A reference that is
//! reached again while it is still being expanded (a recursive type) is emitted once under the
//! root schema's `$defs` and referenced as `#/$defs/<Name>`.

use crate::resolver::{RefResolver, ref_name};
use openapiv3::ReferenceOr;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};

/// Keywords that mean the same thing in `OpenAPI` 3.0 and JSON Schema.
const PASSTHROUGH_KEYWORDS: &[&str] = &[
    "title",
    "description",
    "format",
    "const",
    "default",
    "minimum",
    "maximum",
    "exclusiveMinimum",
    "exclusiveMaximum",
    "multipleOf",
    "minLength",
    "maxLength",
    "pattern",
    "minItems",
    "maxItems",
    "uniqueItems",
    "minProperties",
    "maxProperties",
    "required",
];

const SUBSCHEMA_LISTS: &[&str] = &["allOf", "anyOf", "oneOf"];

pub struct SchemaConverter<'a> {
    resolver: &'a RefResolver,
    /// References currently being expanded (innermost last).
    stack: Vec<String>,
    /// References found to be recursive.
    recursive: HashSet<String>,
    /// Reference -> `$defs` key.
    def_names: HashMap<String, String>,
    defs: BTreeMap<String, Value>,
}

impl<'a> SchemaConverter<'a> {
    #[must_use]
    pub fn new(resolver: &'a RefResolver) -> Self {
        Self {
            resolver,
            stack: Vec::new(),
            recursive: HashSet::new(),
            def_names: HashMap::new(),
            defs: BTreeMap::new(),
        }
    }

    /// Convert a typed `openapiv3` schema (or reference to one). `T` is `Schema` or `Box<Schema>`.
    pub fn convert_ref<T: Serialize>(&mut self, schema: &ReferenceOr<T>) -> Value {
        match schema {
            ReferenceOr::Reference { reference } => self.expand_reference(reference, None),
            ReferenceOr::Item(item) => match serde_json::to_value(item) {
                Ok(v) => self.convert(&v),
                Err(e) => {
                    tracing::warn!(error = %e, "failed to serialize OpenAPI schema");
                    json!({})
                }
            },
        }
    }

    /// Convert a raw `OpenAPI` schema value.
    pub fn convert(&mut self, schema: &Value) -> Value {
        let Some(obj) = schema.as_object() else {
            return schema.clone();
        };

        if let Some(reference) = obj.get("$ref").and_then(Value::as_str) {
            let description = obj.get("description").and_then(Value::as_str);
            return self.expand_reference(reference, description);
        }

        let mut out = Map::new();
        let nullable = obj.get("nullable").and_then(Value::as_bool) == Some(true);

        if let Some(ty) = obj.get("type") {
            let ty = if nullable && ty.is_string() {
                json!([ty, "null"])
            } else {
                ty.clone()
            };
            out.insert("type".to_string(), ty);
        }

        for key in PASSTHROUGH_KEYWORDS {
            if let Some(v) = obj.get(*key) {
                out.insert((*key).to_string(), v.clone());
            }
        }

        if let Some(values) = obj.get("enum").and_then(Value::as_array) {
            let mut values = values.clone();
            if nullable && !values.contains(&Value::Null) {
                values.push(Value::Null);
            }
            out.insert("enum".to_string(), Value::Array(values));
        }

        if let Some(props) = obj.get("properties").and_then(Value::as_object) {
            let converted: Map<String, Value> = props
                .iter()
                .map(|(name, prop)| (name.clone(), self.convert(prop)))
                .collect();
            out.insert("properties".to_string(), Value::Object(converted));
        }

        match obj.get("additionalProperties") {
            Some(Value::Bool(b)) => {
                out.insert("additionalProperties".to_string(), Value::Bool(*b));
            }
            Some(extra @ Value::Object(_)) => {
                let converted = self.convert(extra);
                out.insert("additionalProperties".to_string(), converted);
            }
            _ => {}
        }

        if let Some(items) = obj.get("items") {
            let converted = self.convert(items);
            out.insert("items".to_string(), converted);
        }

        if let Some(not) = obj.get("not") {
            let converted = self.convert(not);
            out.insert("not".to_string(), converted);
        }

        for key in SUBSCHEMA_LISTS {
            if let Some(list) = obj.get(*key).and_then(Value::as_array) {
                let converted: Vec<Value> = list.iter().map(|s| self.convert(s)).collect();
                out.insert((*key).to_string(), Value::Array(converted));
            }
        }

        Value::Object(out)
    }

    /// Attach collected recursive definitions to a root schema.
    #[must_use]
    pub fn finish(self, mut root: Value) -> Value {
        if !self.defs.is_empty()
            && let Some(obj) = root.as_object_mut()
        {
            let defs: Map<String, Value> = self.defs.into_iter().collect();
            obj.insert("$defs".to_string(), Value::Object(defs));
        }
        root
    }

    fn expand_reference(&mut self, reference: &str, description: Option<&str>) -> Value {
        if self.stack.iter().any(|r| r == reference) {
            self.recursive.insert(reference.to_string());
            return self.def_pointer(reference, description);
        }

        if let Some(name) = self.def_names.get(reference)
            && self.defs.contains_key(name)
        {
            return self.def_pointer(reference, description);
        }

        let target = match self.resolver.lookup(reference) {
            Ok(v) => v.clone(),
            Err(e) => {
                tracing::warn!(reference = %reference, error = %e, "leaving schema unresolved");
                return json!({ "description": format!("Unresolved schema reference {reference}") });
            }
        };

        self.stack.push(reference.to_string());
        let mut converted = self.convert(&target);
        self.stack.pop();

        if self.recursive.contains(reference) {
            let name = self.def_name(reference);
            self.defs.insert(name, converted);
            return self.def_pointer(reference, description);
        }

        if let Some(desc) = description
            && let Some(obj) = converted.as_object_mut()
        {
            obj.insert("description".to_string(), Value::String(desc.to_string()));
        }
        converted
    }

    fn def_pointer(&mut self, reference: &str, description: Option<&str>) -> Value {
        let name = self.def_name(reference);
        let mut out = json!({ "$ref": format!("#/$defs/{name}") });
        if let Some(desc) = description {
            out["description"] = Value::String(desc.to_string());
        }
        out
    }

    fn def_name(&mut self, reference: &str) -> String {
        if let Some(name) = self.def_names.get(reference) {
            return name.clone();
        }
        let base = ref_name(reference).to_string();
        let mut name = base.clone();
        let mut counter = 2;
        while self.def_names.values().any(|n| *n == name) {
            name = format!("{base}_{counter}");
            counter += 1;
        }
        self.def_names.insert(reference.to_string(), name.clone());
        name
    }
}
