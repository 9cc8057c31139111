//! Application bootstrap.
//!
//! [`create_app`] assembles a listen-ready [`Router`]: the controller routes
//! plus the add-on layers switched on in [`AppConfig`]. Add-ons are compiled
//! in through cargo features; a toggle whose feature is missing only logs a
//! warning.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::http::{Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::{info, warn};

use crate::error::{HttpError, Result};
use crate::metadata::{ControllerClass, MetadataRegistry};
use crate::middleware::{shared, CookieParser, Middleware, MiddlewareRef};
use crate::request::DEFAULT_BODY_LIMIT;
use crate::router::{InstanceCache, RouterBuilder};

/// An add-on switch: `false`, `true` (default settings) or a settings object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toggle<T> {
    Off,
    On,
    Custom(T),
}

impl<T> Toggle<T> {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Toggle::Off)
    }

    /// The effective settings, or `None` when switched off.
    pub fn settings(&self) -> Option<T>
    where
        T: Default + Clone,
    {
        match self {
            Toggle::Off => None,
            Toggle::On => Some(T::default()),
            Toggle::Custom(settings) => Some(settings.clone()),
        }
    }
}

impl<T> From<bool> for Toggle<T> {
    fn from(enabled: bool) -> Self {
        if enabled {
            Toggle::On
        } else {
            Toggle::Off
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Toggle<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr<U> {
            Flag(bool),
            Settings(U),
        }

        Ok(match Repr::<T>::deserialize(deserializer)? {
            Repr::Flag(enabled) => enabled.into(),
            Repr::Settings(settings) => Toggle::Custom(settings),
        })
    }
}

impl<T: Serialize> Serialize for Toggle<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Toggle::Off => serializer.serialize_bool(false),
            Toggle::On => serializer.serialize_bool(true),
            Toggle::Custom(settings) => settings.serialize(serializer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyParserConfig {
    /// Largest accepted body, in bytes.
    pub limit: usize,
}

impl Default for BodyParserConfig {
    fn default() -> Self {
        Self {
            limit: DEFAULT_BODY_LIMIT,
        }
    }
}

/// Empty lists allow any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CorsConfig {
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub headers: Vec<String>,
    pub credentials: bool,
    pub max_age_secs: Option<u64>,
}

/// Overrides of the default security headers; a `null` value removes one.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityHeadersConfig {
    pub headers: BTreeMap<String, Option<String>>,
}

const DEFAULT_SECURITY_HEADERS: &[(&str, &str)] = &[
    ("content-security-policy", "default-src 'self'"),
    ("cross-origin-opener-policy", "same-origin"),
    ("cross-origin-resource-policy", "same-origin"),
    ("referrer-policy", "no-referrer"),
    ("strict-transport-security", "max-age=15552000; includeSubDomains"),
    ("x-content-type-options", "nosniff"),
    ("x-dns-prefetch-control", "off"),
    ("x-download-options", "noopen"),
    ("x-frame-options", "SAMEORIGIN"),
    ("x-permitted-cross-domain-policies", "none"),
    ("x-xss-protection", "0"),
];

impl SecurityHeadersConfig {
    /// Default headers with the overrides applied.
    pub fn resolved(&self) -> BTreeMap<String, String> {
        let mut headers: BTreeMap<String, String> = DEFAULT_SECURITY_HEADERS
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect();
        for (name, value) in &self.headers {
            let name = name.to_ascii_lowercase();
            match value {
                Some(value) => headers.insert(name, value.clone()),
                None => headers.remove(&name),
            };
        }
        headers
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Record request headers on the request span.
    pub include_headers: bool,
}

/// Settings of [`create_app`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub route_prefix: String,
    /// App-level body parser settings. Routes parse bodies either way; the
    /// settings only change the size limit.
    pub json: Toggle<BodyParserConfig>,
    pub cors: Toggle<CorsConfig>,
    pub security_headers: Toggle<SecurityHeadersConfig>,
    pub logging: Toggle<LoggingConfig>,
    /// Parse the `Cookie` header ahead of the global middleware.
    pub cookies: bool,
    /// Answer unmatched routes with a JSON 404.
    pub not_found: bool,
    pub handler_timeout_ms: Option<u64>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            route_prefix: String::new(),
            json: Toggle::On,
            cors: Toggle::Off,
            security_headers: Toggle::Off,
            logging: Toggle::Off,
            cookies: false,
            not_found: false,
            handler_timeout_ms: None,
        }
    }
}

/// Everything [`create_app`] needs.
#[derive(Clone, Default)]
pub struct AppOptions {
    pub controllers: Vec<ControllerClass>,
    pub middleware: Vec<MiddlewareRef>,
    /// Defaults to the process-wide registry.
    pub registry: Option<Arc<MetadataRegistry>>,
    pub instances: Option<InstanceCache>,
    pub config: AppConfig,
}

impl AppOptions {
    pub fn new(controllers: impl IntoIterator<Item = ControllerClass>) -> Self {
        Self {
            controllers: controllers.into_iter().collect(),
            ..Self::default()
        }
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(shared(middleware));
        self
    }

    pub fn registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn instances(mut self, instances: InstanceCache) -> Self {
        self.instances = Some(instances);
        self
    }

    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = config;
        self
    }
}

impl fmt::Debug for AppOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppOptions")
            .field("controllers", &self.controllers)
            .field("middleware", &self.middleware.len())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Builds the application router with its add-on layers.
pub fn create_app(options: AppOptions) -> Result<Router> {
    let AppOptions {
        controllers,
        middleware,
        registry,
        instances,
        config,
    } = options;

    let mut builder = RouterBuilder::new()
        .controllers(controllers)
        .prefix(config.route_prefix.clone());
    if let Some(registry) = registry {
        builder = builder.registry(registry);
    }
    if let Some(instances) = instances {
        builder = builder.instances(instances);
    }
    if let Some(json) = config.json.settings() {
        builder = builder.body_limit(json.limit);
    }
    if config.cookies {
        builder = builder.middleware(CookieParser);
    }
    builder = builder.middleware_shared(middleware);
    if let Some(ms) = config.handler_timeout_ms {
        builder = builder.handler_timeout(Duration::from_millis(ms));
    }

    let mut app = Router::new().merge(builder.build()?);
    if config.not_found {
        app = app.fallback(not_found);
    }
    app = security_headers(app, &config.security_headers);
    app = cors(app, &config.cors);
    app = request_log(app, &config.logging);

    info!(
        prefix = %config.route_prefix,
        cors = config.cors.is_enabled(),
        security_headers = config.security_headers.is_enabled(),
        logging = config.logging.is_enabled(),
        "application assembled"
    );
    Ok(app)
}

async fn not_found(method: Method, uri: Uri) -> Response {
    HttpError::with_status(
        format!("Cannot {} {}", method, uri.path()),
        StatusCode::NOT_FOUND,
    )
    .into_response()
}

#[cfg(feature = "cors")]
fn cors(app: Router, toggle: &Toggle<CorsConfig>) -> Router {
    match toggle.settings() {
        Some(settings) => app.layer(cors_layer(&settings)),
        None => app,
    }
}

#[cfg(feature = "cors")]
fn cors_layer(settings: &CorsConfig) -> tower_http::cors::CorsLayer {
    use axum::http::{HeaderName, HeaderValue};
    use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};

    let mut layer = CorsLayer::new().allow_credentials(settings.credentials);

    // Wildcards cannot be combined with credentials, so mirror the request instead.
    let any_origin = settings.origins.is_empty() || settings.origins.iter().any(|o| o == "*");
    layer = if !any_origin {
        layer.allow_origin(AllowOrigin::list(
            settings
                .origins
                .iter()
                .filter_map(|origin| valid(HeaderValue::from_str(origin).ok(), "origin", origin)),
        ))
    } else if settings.credentials {
        layer.allow_origin(AllowOrigin::mirror_request())
    } else {
        layer.allow_origin(Any)
    };

    layer = if !settings.methods.is_empty() {
        layer.allow_methods(AllowMethods::list(settings.methods.iter().filter_map(|method| {
            valid(
                Method::from_bytes(method.to_ascii_uppercase().as_bytes()).ok(),
                "method",
                method,
            )
        })))
    } else if settings.credentials {
        layer.allow_methods(AllowMethods::mirror_request())
    } else {
        layer.allow_methods(Any)
    };

    layer = if !settings.headers.is_empty() {
        layer.allow_headers(AllowHeaders::list(settings.headers.iter().filter_map(|header| {
            valid(HeaderName::from_bytes(header.as_bytes()).ok(), "header", header)
        })))
    } else if settings.credentials {
        layer.allow_headers(AllowHeaders::mirror_request())
    } else {
        layer.allow_headers(Any)
    };

    if let Some(secs) = settings.max_age_secs {
        layer = layer.max_age(Duration::from_secs(secs));
    }
    layer
}

#[cfg(not(feature = "cors"))]
fn cors(app: Router, toggle: &Toggle<CorsConfig>) -> Router {
    if toggle.is_enabled() {
        warn!("cors requested but route_kit was built without the `cors` feature");
    }
    app
}

#[cfg(feature = "security-headers")]
fn security_headers(app: Router, toggle: &Toggle<SecurityHeadersConfig>) -> Router {
    use axum::http::{HeaderName, HeaderValue};
    use tower_http::set_header::SetResponseHeaderLayer;

    let Some(settings) = toggle.settings() else {
        return app;
    };
    let mut app = app;
    for (name, value) in settings.resolved() {
        let parsed = HeaderName::from_bytes(name.as_bytes())
            .ok()
            .zip(HeaderValue::from_str(&value).ok());
        match parsed {
            Some((name, value)) => app = app.layer(SetResponseHeaderLayer::if_not_present(name, value)),
            None => warn!(header = %name, "invalid security header skipped"),
        }
    }
    app
}

#[cfg(not(feature = "security-headers"))]
fn security_headers(app: Router, toggle: &Toggle<SecurityHeadersConfig>) -> Router {
    if toggle.is_enabled() {
        warn!("security headers requested but route_kit was built without the `security-headers` feature");
    }
    app
}

#[cfg(feature = "request-log")]
fn request_log(app: Router, toggle: &Toggle<LoggingConfig>) -> Router {
    use tower_http::trace::{DefaultMakeSpan, TraceLayer};

    match toggle.settings() {
        Some(settings) => app.layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().include_headers(settings.include_headers)),
        ),
        None => app,
    }
}

#[cfg(not(feature = "request-log"))]
fn request_log(app: Router, toggle: &Toggle<LoggingConfig>) -> Router {
    if toggle.is_enabled() {
        warn!("request logging requested but route_kit was built without the `request-log` feature");
    }
    app
}

#[cfg(feature = "cors")]
fn valid<T>(parsed: Option<T>, what: &str, raw: &str) -> Option<T> {
    if parsed.is_none() {
        warn!(value = raw, "invalid cors {} skipped", what);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn toggles_accept_flags_and_settings() {
        let config: AppConfig = serde_json::from_value(json!({
            "route_prefix": "/api",
            "json": {"limit": 1024},
            "cors": true,
            "logging": false,
            "security_headers": {"headers": {"x-frame-options": "DENY", "x-xss-protection": null}}
        }))
        .unwrap();
        assert_eq!(config.json, Toggle::Custom(BodyParserConfig { limit: 1024 }));
        assert_eq!(config.cors, Toggle::On);
        assert_eq!(config.logging, Toggle::Off);
        assert!(!config.cookies);

        let headers = config.security_headers.settings().unwrap().resolved();
        assert_eq!(headers["x-frame-options"], "DENY");
        assert!(!headers.contains_key("x-xss-protection"));
        assert_eq!(headers["x-content-type-options"], "nosniff");
    }

    #[test]
    fn toggles_serialize_back() {
        let value = serde_json::to_value(AppConfig::default()).unwrap();
        assert_eq!(value["json"], true);
        assert_eq!(value["cors"], false);
    }

    #[test]
    fn defaults_parse_json_only() {
        let config = AppConfig::default();
        assert_eq!(config.json.settings(), Some(BodyParserConfig::default()));
        assert!(!config.cors.is_enabled());
    }
}
