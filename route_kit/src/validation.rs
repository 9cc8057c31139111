//! Request validation middleware.
//!
//! [`validate`] builds a middleware that parses one request section with a
//! [`Schema`]. On success the parsed value replaces the raw section and is
//! stored in [`ValidatedData`](crate::request::ValidatedData); on failure the
//! request is rejected with `"Validation failed for <section>"` and a list of
//! issues.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use jsonschema::JSONSchema;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{Error, HttpError, Result};
use crate::middleware::{Middleware, MiddlewareResult};
use crate::request::{RouteRequest, Section};

/// One problem found in the input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    /// JSON pointer into the validated section; empty for the root.
    pub path: String,
    pub message: String,
}

impl Issue {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ParseOptions {
    /// Drop properties the schema does not declare.
    pub strip_unknown: bool,
}

/// Anything that can turn raw input into validated output.
pub trait Schema: Send + Sync + 'static {
    fn parse(&self, input: &Value, options: &ParseOptions) -> std::result::Result<Value, Vec<Issue>>;
}

impl<F> Schema for F
where
    F: Fn(&Value, &ParseOptions) -> std::result::Result<Value, Vec<Issue>> + Send + Sync + 'static,
{
    fn parse(&self, input: &Value, options: &ParseOptions) -> std::result::Result<Value, Vec<Issue>> {
        self(input, options)
    }
}

/// A JSON Schema document compiled with `jsonschema`.
///
/// Before validating, input is conformed to the schema: missing properties
/// with a `default` are filled in, string scalars are coerced to the declared
/// `integer`, `number` or `boolean` type (query and route parameters always
/// arrive as strings) and undeclared properties are dropped when
/// `strip_unknown` is set, unless the object allows `additionalProperties`.
pub struct JsonSchema {
    schema: Value,
    compiled: JSONSchema,
}

impl JsonSchema {
    pub fn new(schema: Value) -> Result<Self> {
        let compiled = JSONSchema::options()
            .should_validate_formats(true)
            .compile(&schema)
            .map_err(|e| Error::Schema(e.to_string()))?;
        Ok(Self { schema, compiled })
    }

    pub fn schema(&self) -> &Value {
        &self.schema
    }
}

impl std::fmt::Debug for JsonSchema {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JsonSchema").field("schema", &self.schema).finish()
    }
}

impl Schema for JsonSchema {
    fn parse(&self, input: &Value, options: &ParseOptions) -> std::result::Result<Value, Vec<Issue>> {
        let value = conform(&self.schema, input.clone(), options);
        // The error iterator borrows `value`; collect it before handing `value` back.
        let outcome = self.compiled.validate(&value).map_err(|errors| {
            errors
                .map(|e| Issue::new(e.instance_path.to_string(), e.to_string()))
                .collect::<Vec<_>>()
        });
        outcome.map(|()| value)
    }
}

fn conform(schema: &Value, value: Value, options: &ParseOptions) -> Value {
    let Some(schema) = schema.as_object() else {
        return value;
    };
    match value {
        Value::Object(map) => Value::Object(conform_object(schema, map, options)),
        Value::Array(items) => match schema.get("items") {
            Some(item_schema) => Value::Array(
                items
                    .into_iter()
                    .map(|item| conform(item_schema, item, options))
                    .collect(),
            ),
            None => Value::Array(items),
        },
        Value::String(s) => coerce_string(schema, s),
        other => other,
    }
}

fn conform_object(
    schema: &Map<String, Value>,
    mut map: Map<String, Value>,
    options: &ParseOptions,
) -> Map<String, Value> {
    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return map;
    };
    for (name, property) in properties {
        if map.contains_key(name) {
            continue;
        }
        if let Some(default) = property.get("default") {
            map.insert(name.clone(), default.clone());
        }
    }
    let keep_unknown = !options.strip_unknown || schema.get("additionalProperties") == Some(&Value::Bool(true));
    map.into_iter()
        .filter_map(|(name, value)| match properties.get(&name) {
            Some(property) => Some((name, conform(property, value, options))),
            None if keep_unknown => Some((name, value)),
            None => None,
        })
        .collect()
}

fn declared_types(schema: &Map<String, Value>) -> Vec<&str> {
    match schema.get("type") {
        Some(Value::String(t)) => vec![t.as_str()],
        Some(Value::Array(types)) => types.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    }
}

fn coerce_string(schema: &Map<String, Value>, s: String) -> Value {
    let types = declared_types(schema);
    if types.contains(&"string") {
        return Value::String(s);
    }
    for ty in types {
        let coerced = match ty {
            "integer" => s
                .parse::<i64>()
                .map(Value::from)
                .or_else(|_| s.parse::<u64>().map(Value::from))
                .ok(),
            "number" => s
                .parse::<i64>()
                .map(Value::from)
                .ok()
                .or_else(|| s.parse::<f64>().ok().and_then(|n| serde_json::Number::from_f64(n).map(Value::Number))),
            "boolean" => match s.as_str() {
                "true" => Some(Value::Bool(true)),
                "false" => Some(Value::Bool(false)),
                _ => None,
            },
            _ => None,
        };
        if let Some(value) = coerced {
            return value;
        }
    }
    Value::String(s)
}

#[derive(Debug, Clone, Copy)]
pub struct ValidationOptions {
    pub strip_unknown: bool,
    /// Status of the rejection response.
    pub error_status: StatusCode,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            strip_unknown: true,
            error_status: StatusCode::BAD_REQUEST,
        }
    }
}

/// Validates one request section before the controller method runs.
pub struct ValidationMiddleware {
    section: Section,
    schema: Arc<dyn Schema>,
    options: ValidationOptions,
}

impl ValidationMiddleware {
    pub fn section(&self) -> Section {
        self.section
    }
}

#[async_trait]
impl Middleware for ValidationMiddleware {
    async fn handle(&self, request: &mut RouteRequest) -> MiddlewareResult {
        let parse_options = ParseOptions {
            strip_unknown: self.options.strip_unknown,
        };
        match self.schema.parse(request.section(self.section), &parse_options) {
            Ok(value) => {
                *request.section_mut(self.section) = value.clone();
                request.validated.set(self.section, value);
                Ok(None)
            }
            Err(issues) => {
                let mut data = Map::new();
                data.insert(
                    "errors".into(),
                    serde_json::to_value(&issues).unwrap_or_else(|_| Value::Array(Vec::new())),
                );
                Err(HttpError::validation(
                    format!("Validation failed for {}", self.section),
                    self.options.error_status,
                    data,
                ))
            }
        }
    }
}

pub fn validate<S: Schema>(section: Section, schema: S, options: ValidationOptions) -> ValidationMiddleware {
    ValidationMiddleware {
        section,
        schema: Arc::new(schema),
        options,
    }
}

pub fn validate_body<S: Schema>(schema: S) -> ValidationMiddleware {
    validate(Section::Body, schema, ValidationOptions::default())
}

pub fn validate_query<S: Schema>(schema: S) -> ValidationMiddleware {
    validate(Section::Query, schema, ValidationOptions::default())
}

pub fn validate_params<S: Schema>(schema: S) -> ValidationMiddleware {
    validate(Section::Params, schema, ValidationOptions::default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RouteRequest;
    use axum::http::{Method, Uri};
    use serde_json::json;

    fn user_schema() -> JsonSchema {
        JsonSchema::new(json!({
            "type": "object",
            "properties": {
                "name": {"type": "string", "minLength": 2},
                "age": {"type": "integer", "minimum": 0},
                "admin": {"type": "boolean", "default": false}
            },
            "required": ["name"]
        }))
        .unwrap()
    }

    fn post(body: Value) -> RouteRequest {
        let mut req = RouteRequest::new(Method::POST, Uri::from_static("/users"));
        req.body = body;
        req
    }

    #[test]
    fn conform_applies_defaults_coercion_and_stripping() {
        let schema = user_schema();
        let parsed = schema
            .parse(&json!({"name": "Ann", "age": "31", "extra": 1}), &ParseOptions { strip_unknown: true })
            .unwrap();
        assert_eq!(parsed, json!({"name": "Ann", "age": 31, "admin": false}));

        let kept = schema
            .parse(&json!({"name": "Ann", "extra": 1}), &ParseOptions { strip_unknown: false })
            .unwrap();
        assert_eq!(kept["extra"], 1);
    }

    #[test]
    fn valid_input_is_handed_back_once_validated() {
        let schema = user_schema();
        let input = json!({"name": "Ann", "age": 31, "admin": true});
        let options = ParseOptions { strip_unknown: true };
        assert_eq!(schema.parse(&input, &options).unwrap(), input);
        assert!(schema.parse(&json!({"age": 1}), &options).is_err());
    }

    #[test]
    fn issues_point_at_the_offending_field() {
        let issues = user_schema()
            .parse(&json!({"name": "A", "age": "old"}), &ParseOptions { strip_unknown: true })
            .unwrap_err();
        let paths: Vec<&str> = issues.iter().map(|i| i.path.as_str()).collect();
        assert!(paths.contains(&"/name"));
        assert!(paths.contains(&"/age"));
    }

    #[test]
    fn invalid_schema_is_rejected_up_front() {
        let err = JsonSchema::new(json!({"type": 12})).unwrap_err();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[tokio::test]
    async fn success_overwrites_section_and_records_validated_data() {
        let middleware = validate_body(user_schema());
        let mut req = post(json!({"name": "Ann", "age": "5"}));
        assert!(middleware.handle(&mut req).await.unwrap().is_none());
        assert_eq!(req.body["age"], 5);
        assert_eq!(req.validated.get(Section::Body), Some(&req.body));
    }

    #[tokio::test]
    async fn failure_carries_status_and_issues() {
        let middleware = validate(
            Section::Body,
            user_schema(),
            ValidationOptions {
                strip_unknown: true,
                error_status: StatusCode::UNPROCESSABLE_ENTITY,
            },
        );
        let mut req = post(json!({}));
        let err = middleware.handle(&mut req).await.unwrap_err();
        assert_eq!(err.message(), "Validation failed for body");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert!(err.data().unwrap()["errors"].as_array().is_some_and(|e| !e.is_empty()));
        assert!(req.validated.get(Section::Body).is_none());
    }

    #[tokio::test]
    async fn closures_are_schemas() {
        let only_ids = |input: &Value, _: &ParseOptions| match input.get("id").and_then(Value::as_str) {
            Some(id) if id.chars().all(|c| c.is_ascii_digit()) => Ok(json!({"id": id.parse::<u64>().unwrap_or(0)})),
            _ => Err(vec![Issue::new("/id", "must be numeric")]),
        };
        let middleware = validate_params(only_ids);
        let mut req = post(json!({}));
        req.params = json!({"id": "7"});
        middleware.handle(&mut req).await.unwrap();
        assert_eq!(req.params, json!({"id": 7}));
    }
}
