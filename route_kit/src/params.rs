//! Parameter extraction.
//!
//! Each declared parameter kind is turned into an [`ArgFactory`] once, at
//! route registration; the factory runs once per request. Factories never
//! fail: a kind that cannot produce anything yields [`Arg::Undefined`].

use std::fmt;
use std::sync::Arc;

use axum::http::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::error::HttpError;
use crate::request::{ResponseHandle, RouteRequest, Section};

/// User supplied extraction for [`ParamKind::Custom`].
pub type Extractor = Arc<dyn Fn(&RouteRequest, &ResponseHandle) -> Value + Send + Sync>;

/// The declared kind of a controller method parameter.
///
/// A `None` name means "the whole section".
#[derive(Clone)]
pub enum ParamKind {
    Request,
    Response,
    Body(Option<String>),
    Query(Option<String>),
    Param(Option<String>),
    Headers(Option<String>),
    Cookies(Option<String>),
    Session,
    Custom(Extractor),
    /// A kind named in a string declaration that this crate does not know.
    Unrecognized(String),
}

impl ParamKind {
    pub fn body(name: Option<&str>) -> Self {
        ParamKind::Body(name.map(str::to_string))
    }

    pub fn query(name: Option<&str>) -> Self {
        ParamKind::Query(name.map(str::to_string))
    }

    pub fn param(name: Option<&str>) -> Self {
        ParamKind::Param(name.map(str::to_string))
    }

    pub fn headers(name: Option<&str>) -> Self {
        ParamKind::Headers(name.map(str::to_string))
    }

    pub fn cookies(name: Option<&str>) -> Self {
        ParamKind::Cookies(name.map(str::to_string))
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&RouteRequest, &ResponseHandle) -> Value + Send + Sync + 'static,
    {
        ParamKind::Custom(Arc::new(f))
    }

    /// Resolves a kind from its name, as used by string-based declarations.
    pub fn parse(kind: &str, name: Option<&str>) -> Self {
        match kind {
            "req" | "request" => ParamKind::Request,
            "res" | "response" => ParamKind::Response,
            "body" => ParamKind::body(name),
            "query" => ParamKind::query(name),
            "param" | "params" => ParamKind::param(name),
            "headers" => ParamKind::headers(name),
            "cookies" => ParamKind::cookies(name),
            "session" => ParamKind::Session,
            other => ParamKind::Unrecognized(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ParamKind::Request => "request",
            ParamKind::Response => "response",
            ParamKind::Body(_) => "body",
            ParamKind::Query(_) => "query",
            ParamKind::Param(_) => "param",
            ParamKind::Headers(_) => "headers",
            ParamKind::Cookies(_) => "cookies",
            ParamKind::Session => "session",
            ParamKind::Custom(_) => "custom",
            ParamKind::Unrecognized(kind) => kind,
        }
    }
}

impl fmt::Debug for ParamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamKind::Body(name)
            | ParamKind::Query(name)
            | ParamKind::Param(name)
            | ParamKind::Headers(name)
            | ParamKind::Cookies(name) => f.debug_tuple(self.name()).field(name).finish(),
            other => f.write_str(other.name()),
        }
    }
}

/// One extracted argument.
#[derive(Debug, Clone)]
pub enum Arg {
    Undefined,
    Value(Value),
    Request(Arc<RouteRequest>),
    Response(ResponseHandle),
}

impl Arg {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Arg::Undefined)
    }

    /// The argument as JSON; `Undefined` and the request/response objects become `null`.
    pub fn into_value(self) -> Value {
        match self {
            Arg::Value(value) => value,
            _ => Value::Null,
        }
    }
}

pub type ArgFactory = Arc<dyn Fn(&Arc<RouteRequest>, &ResponseHandle) -> Arg + Send + Sync>;

/// The arguments of one controller method call, in parameter order.
#[derive(Debug, Default)]
pub struct Args {
    values: Vec<Arg>,
}

impl Args {
    pub fn new(values: Vec<Arg>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Takes the argument at `index`, leaving `Undefined` behind.
    pub fn take(&mut self, index: usize) -> Arg {
        match self.values.get_mut(index) {
            Some(slot) => std::mem::replace(slot, Arg::Undefined),
            None => Arg::Undefined,
        }
    }

    /// Deserializes the argument at `index` into the declared parameter type.
    ///
    /// `Undefined` deserializes from `null`, so `Option<T>` parameters see `None`.
    /// A string that does not fit `T` is retried as the number or boolean it
    /// spells, since query and route parameters always arrive as strings.
    pub fn extract<T: DeserializeOwned>(&mut self, index: usize) -> Result<T, HttpError> {
        let value = self.take(index).into_value();
        <T as Deserialize>::deserialize(&value).or_else(|e| {
            coerce_scalar(&value)
                .and_then(|coerced| <T as Deserialize>::deserialize(&coerced).ok())
                .ok_or_else(|| {
                    HttpError::with_status(
                        format!("invalid value for argument {}: {}", index, e),
                        StatusCode::BAD_REQUEST,
                    )
                })
        })
    }

    pub fn request(&mut self, index: usize) -> Result<Arc<RouteRequest>, HttpError> {
        match self.take(index) {
            Arg::Request(request) => Ok(request),
            _ => Err(HttpError::internal(format!(
                "argument {} is not the request object",
                index
            ))),
        }
    }

    pub fn response(&mut self, index: usize) -> Result<ResponseHandle, HttpError> {
        match self.take(index) {
            Arg::Response(response) => Ok(response),
            _ => Err(HttpError::internal(format!(
                "argument {} is not the response object",
                index
            ))),
        }
    }
}

fn coerce_scalar(value: &Value) -> Option<Value> {
    let Value::String(s) = value else {
        return None;
    };
    match s.as_str() {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    s.parse::<i64>()
        .map(Value::from)
        .or_else(|_| s.parse::<u64>().map(Value::from))
        .ok()
        .or_else(|| {
            s.parse::<f64>()
                .ok()
                .and_then(serde_json::Number::from_f64)
                .map(Value::Number)
        })
}

/// Builds the extraction function for one declared parameter.
pub fn extractor(kind: &ParamKind) -> ArgFactory {
    match kind.clone() {
        ParamKind::Request => Arc::new(|req, _| Arg::Request(Arc::clone(req))),
        ParamKind::Response => Arc::new(|_, res| Arg::Response(res.clone())),
        ParamKind::Body(name) => section_extractor(Section::Body, name),
        ParamKind::Query(name) => section_extractor(Section::Query, name),
        ParamKind::Param(name) => section_extractor(Section::Params, name),
        ParamKind::Headers(name) => Arc::new(move |req, _| match &name {
            Some(name) => req
                .header(name)
                .map(|v| Arg::Value(Value::String(v)))
                .unwrap_or(Arg::Undefined),
            None => Arg::Value(req.headers_json()),
        }),
        ParamKind::Cookies(name) => Arc::new(move |req, _| {
            let Some(cookies) = &req.cookies else {
                return Arg::Undefined;
            };
            match &name {
                Some(name) => cookies
                    .get(name)
                    .cloned()
                    .map(Arg::Value)
                    .unwrap_or(Arg::Undefined),
                None => Arg::Value(Value::Object(cookies.clone())),
            }
        }),
        ParamKind::Session => Arc::new(|req, _| {
            req.session()
                .map(|session| Arg::Value(session.0.clone()))
                .unwrap_or(Arg::Undefined)
        }),
        ParamKind::Custom(f) => Arc::new(move |req, res| Arg::Value(f(req, res))),
        ParamKind::Unrecognized(_) => Arc::new(|_, _| Arg::Undefined),
    }
}

/// Validated data for the section wins over the raw section.
fn section_extractor(section: Section, name: Option<String>) -> ArgFactory {
    Arc::new(move |req, _| {
        let source = req
            .validated
            .get(section)
            .unwrap_or_else(|| req.section(section));
        match &name {
            None => Arg::Value(source.clone()),
            Some(name) => source
                .get(name.as_str())
                .cloned()
                .map(Arg::Value)
                .unwrap_or(Arg::Undefined),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Session;
    use axum::http::{HeaderValue, Method, Uri};
    use serde_json::json;

    fn run(kind: ParamKind, req: RouteRequest) -> Arg {
        extractor(&kind)(&Arc::new(req), &ResponseHandle::new())
    }

    fn request() -> RouteRequest {
        let mut req = RouteRequest::new(Method::POST, Uri::from_static("/users/42?limit=5"));
        req.params = json!({"id": "42"});
        req.body = json!({"n": "5", "name": "Ann"});
        req
    }

    #[test]
    fn whole_and_named_sections() {
        assert_eq!(run(ParamKind::body(None), request()).into_value(), json!({"n": "5", "name": "Ann"}));
        assert_eq!(run(ParamKind::body(Some("name")), request()).into_value(), json!("Ann"));
        assert_eq!(run(ParamKind::query(Some("limit")), request()).into_value(), json!("5"));
        assert_eq!(run(ParamKind::param(Some("id")), request()).into_value(), json!("42"));
        assert!(run(ParamKind::body(Some("missing")), request()).is_undefined());
    }

    #[test]
    fn explicit_zero_name_is_a_field_lookup() {
        let mut req = request();
        req.body = json!({"0": "zero", "other": 1});
        assert_eq!(run(ParamKind::body(Some("0")), req).into_value(), json!("zero"));
    }

    #[test]
    fn validated_data_takes_precedence() {
        let mut req = request();
        req.validated.set(Section::Body, json!({"n": 5}));
        assert_eq!(run(ParamKind::body(None), req).into_value(), json!({"n": 5}));

        let mut req = request();
        req.validated.set(Section::Params, json!({"id": 42}));
        assert_eq!(run(ParamKind::param(Some("id")), req).into_value(), json!(42));
    }

    #[test]
    fn headers_are_case_insensitive() {
        let with_key = || {
            let mut req = request();
            req.headers.insert("x-api-key", HeaderValue::from_static("secret"));
            req
        };
        assert_eq!(
            run(ParamKind::headers(Some("X-Api-Key")), with_key()).into_value(),
            json!("secret")
        );
        assert_eq!(run(ParamKind::headers(None), with_key()).into_value()["x-api-key"], "secret");
    }

    #[test]
    fn cookies_need_the_parser() {
        assert!(run(ParamKind::cookies(Some("sid")), request()).is_undefined());
        let mut req = request();
        let mut jar = serde_json::Map::new();
        jar.insert("sid".into(), json!("abc"));
        req.cookies = Some(jar);
        assert_eq!(run(ParamKind::cookies(Some("sid")), req).into_value(), json!("abc"));
    }

    #[test]
    fn session_and_custom() {
        assert!(run(ParamKind::Session, request()).is_undefined());
        let mut req = request();
        req.extensions.insert(Session(json!({"user": "ann"})));
        assert_eq!(run(ParamKind::Session, req).into_value(), json!({"user": "ann"}));

        let custom = ParamKind::custom(|req, _| json!(req.path()));
        assert_eq!(run(custom, request()).into_value(), json!("/users/42"));
    }

    #[test]
    fn request_and_response_objects() {
        assert!(matches!(run(ParamKind::Request, request()), Arg::Request(_)));
        assert!(matches!(run(ParamKind::Response, request()), Arg::Response(_)));
    }

    #[test]
    fn unknown_kinds_yield_undefined() {
        let kind = ParamKind::parse("telepathy", Some("x"));
        assert!(matches!(kind, ParamKind::Unrecognized(_)));
        assert!(run(kind, request()).is_undefined());
    }

    #[test]
    fn typed_binding() {
        let mut args = Args::new(vec![Arg::Value(json!("42")), Arg::Undefined, Arg::Value(json!("x"))]);
        let id: String = args.extract(0).unwrap();
        let missing: Option<u32> = args.extract(1).unwrap();
        let wrong: Result<u32, _> = args.extract(2);
        assert_eq!(id, "42");
        assert_eq!(missing, None);
        assert_eq!(wrong.unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert!(args.request(0).is_err());
        assert!(args.take(10).is_undefined());
    }

    #[test]
    fn string_scalars_bind_to_numbers_and_booleans() {
        let mut args = Args::new(vec![
            Arg::Value(json!("3")),
            Arg::Value(json!("2.5")),
            Arg::Value(json!("true")),
            Arg::Value(json!("-7")),
            Arg::Value(json!("3")),
        ]);
        let page: Option<u32> = args.extract(0).unwrap();
        let ratio: f64 = args.extract(1).unwrap();
        let flag: bool = args.extract(2).unwrap();
        let negative: Result<u32, _> = args.extract(3);
        let text: String = args.extract(4).unwrap();
        assert_eq!(page, Some(3));
        assert_eq!(ratio, 2.5);
        assert!(flag);
        assert_eq!(negative.unwrap_err().status(), StatusCode::BAD_REQUEST);
        assert_eq!(text, "3");
    }
}
