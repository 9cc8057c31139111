//! Request and response objects seen by middleware and controller methods.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use axum::body::Body;
use axum::extract::rejection::PathRejection;
use axum::extract::{FromRequestParts, Path};
use axum::http::header::{self, HeaderMap, HeaderName, HeaderValue};
use axum::http::request::Parts;
use axum::http::{Extensions, Method, Request, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::HttpError;
use crate::metadata::ControllerId;

/// Default cap on buffered request bodies, matching axum's `DefaultBodyLimit`.
pub const DEFAULT_BODY_LIMIT: usize = 2 * 1024 * 1024;

/// A request section that validation can target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    Body,
    Query,
    Params,
}

impl Section {
    pub fn as_str(&self) -> &'static str {
        match self {
            Section::Body => "body",
            Section::Query => "query",
            Section::Params => "params",
        }
    }
}

impl fmt::Display for Section {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Output of successful validations for the current request.
///
/// A present section takes precedence over the raw section during parameter
/// extraction.
#[derive(Debug, Clone, Default)]
pub struct ValidatedData {
    pub body: Option<Value>,
    pub query: Option<Value>,
    pub params: Option<Value>,
}

impl ValidatedData {
    pub fn get(&self, section: Section) -> Option<&Value> {
        match section {
            Section::Body => self.body.as_ref(),
            Section::Query => self.query.as_ref(),
            Section::Params => self.params.as_ref(),
        }
    }

    pub fn set(&mut self, section: Section, value: Value) {
        match section {
            Section::Body => self.body = Some(value),
            Section::Query => self.query = Some(value),
            Section::Params => self.params = Some(value),
        }
    }
}

/// Session data placed in the request extensions by an upstream middleware.
#[derive(Debug, Clone)]
pub struct Session(pub Value);

/// The controller instance whose method is handling the request.
#[derive(Clone)]
pub struct ActiveController {
    pub id: ControllerId,
    pub(crate) instance: Arc<dyn Any + Send + Sync>,
}

impl ActiveController {
    pub(crate) fn is_instance(&self, instance: &Arc<dyn Any + Send + Sync>) -> bool {
        Arc::ptr_eq(&self.instance, instance)
    }
}

impl fmt::Debug for ActiveController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActiveController").field("id", &self.id).finish()
    }
}

/// The live request: parsed sections plus a bag for request-scoped data.
#[derive(Debug)]
pub struct RouteRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Route parameters as a JSON object of strings.
    pub params: Value,
    /// Query string as a JSON object; repeated keys become arrays.
    pub query: Value,
    /// Parsed body; `{}` when the content type is not understood.
    pub body: Value,
    /// Populated by the cookie parser middleware.
    pub cookies: Option<Map<String, Value>>,
    pub validated: ValidatedData,
    pub controller: Option<ActiveController>,
    pub extensions: Extensions,
}

impl RouteRequest {
    /// Buffers and parses an incoming axum request.
    pub async fn from_http(req: Request<Body>, body_limit: usize) -> Result<Self, HttpError> {
        let (parts, body) = req.into_parts();
        let bytes = axum::body::to_bytes(body, body_limit)
            .await
            .map_err(|e| read_error(e, body_limit))?;
        let body = parse_body(&parts.headers, &bytes)?;
        Self::from_parts(parts, body).await
    }

    async fn from_parts(mut parts: Parts, body: Value) -> Result<Self, HttpError> {
        let params = match Path::<HashMap<String, String>>::from_request_parts(&mut parts, &()).await {
            Ok(Path(params)) => params,
            // Not routed through a `Router`, so there are no captures.
            Err(PathRejection::MissingPathParams(_)) => HashMap::new(),
            Err(rejection) => {
                return Err(HttpError::with_status(rejection.body_text(), StatusCode::BAD_REQUEST))
            }
        };
        let params = Value::Object(
            params
                .into_iter()
                .map(|(k, v)| (k, Value::String(v)))
                .collect(),
        );
        let query = parse_query(parts.uri.query());

        Ok(Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            params,
            query,
            body,
            cookies: None,
            validated: ValidatedData::default(),
            controller: None,
            extensions: parts.extensions,
        })
    }

    /// Builds a request from already parsed sections.
    pub fn new(method: Method, uri: Uri) -> Self {
        let query = parse_query(uri.query());
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            params: Value::Object(Map::new()),
            query,
            body: Value::Object(Map::new()),
            cookies: None,
            validated: ValidatedData::default(),
            controller: None,
            extensions: Extensions::new(),
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn section(&self, section: Section) -> &Value {
        match section {
            Section::Body => &self.body,
            Section::Query => &self.query,
            Section::Params => &self.params,
        }
    }

    pub fn section_mut(&mut self, section: Section) -> &mut Value {
        match section {
            Section::Body => &mut self.body,
            Section::Query => &mut self.query,
            Section::Params => &mut self.params,
        }
    }

    /// Header value by name, case-insensitively; repeated values are joined with `", "`.
    pub fn header(&self, name: &str) -> Option<String> {
        let name = HeaderName::from_bytes(name.to_ascii_lowercase().as_bytes()).ok()?;
        let values: Vec<&str> = self
            .headers
            .get_all(&name)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .collect();
        if values.is_empty() {
            None
        } else {
            Some(values.join(", "))
        }
    }

    /// All headers as a JSON object keyed by lowercase name.
    pub fn headers_json(&self) -> Value {
        let mut map = Map::new();
        for name in self.headers.keys() {
            if let Some(value) = self.header(name.as_str()) {
                map.insert(name.as_str().to_string(), Value::String(value));
            }
        }
        Value::Object(map)
    }

    pub fn session(&self) -> Option<&Session> {
        self.extensions.get::<Session>()
    }
}

fn read_error(error: axum::Error, limit: usize) -> HttpError {
    let too_large = error
        .into_inner()
        .downcast_ref::<http_body_util::LengthLimitError>()
        .is_some();
    if too_large {
        HttpError::with_status(
            format!("request body exceeds {} bytes", limit),
            StatusCode::PAYLOAD_TOO_LARGE,
        )
    } else {
        HttpError::with_status("failed to read request body", StatusCode::BAD_REQUEST)
    }
}

/// Parses a query string into a JSON object of strings.
pub(crate) fn parse_query(query: Option<&str>) -> Value {
    let mut map = Map::new();
    let Some(query) = query else {
        return Value::Object(map);
    };
    if let Ok(pairs) = serde_urlencoded::from_str::<Vec<(String, String)>>(query) {
        for (key, value) in pairs {
            insert_repeated(&mut map, key, Value::String(value));
        }
    }
    Value::Object(map)
}

fn insert_repeated(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(items)) => items.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

fn parse_body(headers: &HeaderMap, bytes: &[u8]) -> Result<Value, HttpError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if bytes.is_empty() {
        return Ok(Value::Object(Map::new()));
    }
    if content_type.starts_with("application/json") || content_type.contains("+json") {
        return serde_json::from_slice(bytes).map_err(|e| {
            HttpError::with_status(format!("invalid JSON body: {}", e), StatusCode::BAD_REQUEST)
        });
    }
    if content_type.starts_with("application/x-www-form-urlencoded") {
        let mut map = Map::new();
        if let Ok(pairs) = serde_urlencoded::from_bytes::<Vec<(String, String)>>(bytes) {
            for (key, value) in pairs {
                insert_repeated(&mut map, key, Value::String(value));
            }
        }
        return Ok(Value::Object(map));
    }
    Ok(Value::Object(Map::new()))
}

/// What a controller method produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Serialised as the full JSON response body.
    Json(Value),
    /// Nothing returned; the handler may have answered through its `ResponseHandle`.
    Empty,
}

/// Conversion of a controller method's return value into a [`Reply`].
pub trait IntoReply {
    fn into_reply(self) -> Result<Reply, HttpError>;
}

impl IntoReply for () {
    fn into_reply(self) -> Result<Reply, HttpError> {
        Ok(Reply::Empty)
    }
}

impl IntoReply for Reply {
    fn into_reply(self) -> Result<Reply, HttpError> {
        Ok(self)
    }
}

impl IntoReply for Value {
    fn into_reply(self) -> Result<Reply, HttpError> {
        Ok(Reply::Json(self))
    }
}

impl<T: Serialize> IntoReply for axum::Json<T> {
    fn into_reply(self) -> Result<Reply, HttpError> {
        serde_json::to_value(self.0)
            .map(Reply::Json)
            .map_err(HttpError::from_error)
    }
}

impl<T: IntoReply> IntoReply for Option<T> {
    fn into_reply(self) -> Result<Reply, HttpError> {
        match self {
            Some(inner) => inner.into_reply(),
            None => Ok(Reply::Empty),
        }
    }
}

impl<T, E> IntoReply for Result<T, E>
where
    T: IntoReply,
    E: Into<HttpError>,
{
    fn into_reply(self) -> Result<Reply, HttpError> {
        self.map_err(Into::into)?.into_reply()
    }
}

#[derive(Debug, Default)]
struct ResponseState {
    status: Option<StatusCode>,
    headers: HeaderMap,
    body: Option<(Vec<u8>, &'static str)>,
    sent: bool,
}

/// The response object handed to controller methods that take over the reply.
///
/// Once one of the sending methods ran, [`ResponseHandle::headers_sent`]
/// reports `true` and the returned value of the method is no longer
/// serialised.
#[derive(Debug, Clone, Default)]
pub struct ResponseHandle {
    state: Arc<Mutex<ResponseState>>,
}

impl ResponseHandle {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ResponseState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn status(&self, status: StatusCode) -> &Self {
        self.lock().status = Some(status);
        self
    }

    pub fn header(&self, name: HeaderName, value: HeaderValue) -> &Self {
        self.lock().headers.insert(name, value);
        self
    }

    /// Serialises `body` as JSON and marks the response as sent.
    pub fn json<T: Serialize>(&self, body: &T) -> Result<(), HttpError> {
        let bytes = serde_json::to_vec(body).map_err(HttpError::from_error)?;
        let mut state = self.lock();
        state.body = Some((bytes, "application/json"));
        state.sent = true;
        Ok(())
    }

    /// Sends a plain-text body.
    pub fn send(&self, body: impl Into<String>) {
        let mut state = self.lock();
        state.body = Some((body.into().into_bytes(), "text/plain; charset=utf-8"));
        state.sent = true;
    }

    /// Ends the response without a body.
    pub fn end(&self) {
        self.lock().sent = true;
    }

    pub fn headers_sent(&self) -> bool {
        self.lock().sent
    }

    /// The response produced through this handle, if it was sent.
    pub(crate) fn take_sent(&self) -> Option<Response> {
        let mut state = self.lock();
        if !state.sent {
            return None;
        }
        let status = state.status.unwrap_or(StatusCode::OK);
        let body = state.body.take();
        Some(build_response(status, std::mem::take(&mut state.headers), body))
    }

    /// Renders a returned value using the status and headers set so far.
    pub(crate) fn finish_json(&self, value: &Value) -> Response {
        let bytes = match serde_json::to_vec(value) {
            Ok(bytes) => bytes,
            Err(e) => return HttpError::from_error(e).into_response(),
        };
        let mut state = self.lock();
        let status = state.status.unwrap_or(StatusCode::OK);
        build_response(
            status,
            std::mem::take(&mut state.headers),
            Some((bytes, "application/json")),
        )
    }

    /// Renders a method that returned nothing and never sent a response.
    pub(crate) fn finish_empty(&self) -> Response {
        let mut state = self.lock();
        let status = state.status.unwrap_or(StatusCode::NO_CONTENT);
        build_response(status, std::mem::take(&mut state.headers), None)
    }
}

fn build_response(
    status: StatusCode,
    headers: HeaderMap,
    body: Option<(Vec<u8>, &'static str)>,
) -> Response {
    let mut response = match body {
        Some((bytes, content_type)) => {
            let mut response = Response::new(Body::from(bytes));
            response
                .headers_mut()
                .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
            response
        }
        None => Response::new(Body::empty()),
    };
    *response.status_mut() = status;
    response.headers_mut().extend(headers);
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn json_request(body: &'static str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/users?page=2&tag=a&tag=b")
            .header("content-type", "application/json")
            .header("X-Trace", "one")
            .header("x-trace", "two")
            .body(Body::from(body))
            .unwrap()
    }

    #[tokio::test]
    async fn parses_json_body_and_query() {
        let req = RouteRequest::from_http(json_request(r#"{"name":"Ann"}"#), DEFAULT_BODY_LIMIT)
            .await
            .unwrap();
        assert_eq!(req.body, json!({"name": "Ann"}));
        assert_eq!(req.query, json!({"page": "2", "tag": ["a", "b"]}));
        assert_eq!(req.params, json!({}));
        assert_eq!(req.header("X-TRACE").as_deref(), Some("one, two"));
    }

    #[tokio::test]
    async fn malformed_json_is_a_400() {
        let err = RouteRequest::from_http(json_request("{oops"), DEFAULT_BODY_LIMIT)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn oversized_body_is_a_413() {
        let err = RouteRequest::from_http(json_request(r#"{"name":"Ann"}"#), 4)
            .await
            .unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn form_bodies_become_objects() {
        let req = Request::builder()
            .method("POST")
            .uri("/")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from("a=1&b=two"))
            .unwrap();
        let req = RouteRequest::from_http(req, DEFAULT_BODY_LIMIT).await.unwrap();
        assert_eq!(req.body, json!({"a": "1", "b": "two"}));
    }

    #[test]
    fn response_handle_tracks_sending() {
        let res = ResponseHandle::new();
        assert!(!res.headers_sent());
        assert!(res.take_sent().is_none());
        res.status(StatusCode::CREATED).json(&json!({"ok": true})).unwrap();
        assert!(res.headers_sent());
        let response = res.take_sent().unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[test]
    fn replies_from_return_values() {
        assert_eq!(().into_reply().unwrap(), Reply::Empty);
        assert_eq!(json!(1).into_reply().unwrap(), Reply::Json(json!(1)));
        let none: Option<Value> = None;
        assert_eq!(none.into_reply().unwrap(), Reply::Empty);
        let failed: Result<Value, HttpError> = Err(HttpError::new("nope", 404));
        assert_eq!(failed.into_reply().unwrap_err().status(), StatusCode::NOT_FOUND);
    }
}
