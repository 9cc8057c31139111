use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use route_kit::bootstrap::{BodyParserConfig, CorsConfig, SecurityHeadersConfig};
use route_kit::{
    create_app, declare, AppConfig, AppOptions, Args, BoxError, Controller, ControllerClass,
    Declaration, Declare, HttpError, MetadataRegistry, ParamKind, Toggle,
};
use serde_json::{json, Value};
use tower::ServiceExt;

struct Profile;

impl Controller for Profile {
    fn create() -> Result<Self, BoxError> {
        Ok(Profile)
    }
}

impl Declare for Profile {
    fn declare(d: &mut Declaration<'_, Self>) -> route_kit::Result<()> {
        d.controller("/profile");
        d.method("show", |_this: Arc<Profile>, mut args: Args| async move {
            let token: Option<String> = args.extract(0)?;
            let all: Option<Value> = args.extract(1)?;
            Ok::<_, HttpError>(json!({ "token": token, "cookies": all }))
        })
        .get(())
        .param(0, ParamKind::cookies(Some("token")))
        .param(1, ParamKind::cookies(None));
        d.method("echo", |_this: Arc<Profile>, mut args: Args| async move {
            let body: Value = args.extract(0)?;
            Ok::<_, HttpError>(body)
        })
        .post("/echo")
        .param(0, ParamKind::body(None));
        Ok(())
    }
}

fn app(config: AppConfig) -> Router {
    let registry = Arc::new(MetadataRegistry::new());
    declare::<Profile>(&registry).unwrap();
    create_app(
        AppOptions::new([ControllerClass::of::<Profile>()])
            .registry(registry)
            .config(config),
    )
    .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn cookies_are_parsed_when_enabled() {
    let req = || {
        Request::builder()
            .uri("/profile")
            .header(header::COOKIE, "token=abc; theme=\"dark\"")
            .body(Body::empty())
            .unwrap()
    };

    let with_cookies = app(AppConfig {
        cookies: true,
        ..AppConfig::default()
    });
    let response = with_cookies.oneshot(req()).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_json(response).await,
        json!({"token": "abc", "cookies": {"token": "abc", "theme": "dark"}})
    );

    let response = app(AppConfig::default()).oneshot(req()).await.unwrap();
    assert_eq!(body_json(response).await, json!({"token": null, "cookies": null}));
}

#[tokio::test]
async fn unmatched_routes_get_a_json_404() {
    let app = app(AppConfig {
        not_found: true,
        route_prefix: "/api".into(),
        ..AppConfig::default()
    });
    let req = Request::builder()
        .method("PUT")
        .uri("/api/nowhere")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(
        body_json(response).await,
        json!({"message": "Cannot PUT /api/nowhere", "status": 404})
    );
}

#[tokio::test]
async fn security_headers_are_added_with_overrides() {
    let mut overrides = SecurityHeadersConfig::default();
    overrides
        .headers
        .insert("X-Frame-Options".into(), Some("DENY".into()));
    overrides.headers.insert("x-xss-protection".into(), None);
    let app = app(AppConfig {
        security_headers: Toggle::Custom(overrides),
        ..AppConfig::default()
    });
    let response = app
        .oneshot(Request::builder().uri("/profile").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "DENY");
    assert!(headers.get("x-xss-protection").is_none());
}

#[tokio::test]
async fn cors_answers_preflight_requests() {
    let app = app(AppConfig {
        cors: Toggle::Custom(CorsConfig {
            origins: vec!["https://app.example.com".into()],
            ..CorsConfig::default()
        }),
        ..AppConfig::default()
    });
    let req = Request::builder()
        .method("OPTIONS")
        .uri("/profile/echo")
        .header(header::ORIGIN, "https://app.example.com")
        .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(
        response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN],
        "https://app.example.com"
    );
}

#[tokio::test]
async fn routes_parse_bodies_whatever_the_json_toggle() {
    let req = || {
        Request::builder()
            .method("POST")
            .uri("/profile/echo")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(r#"{"a":1}"#))
            .unwrap()
    };

    let response = app(AppConfig::default()).oneshot(req()).await.unwrap();
    assert_eq!(body_json(response).await, json!({"a": 1}));

    let response = app(AppConfig {
        json: Toggle::Off,
        ..AppConfig::default()
    })
    .oneshot(req())
    .await
    .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await, json!({"a": 1}));
}

#[tokio::test]
async fn json_limit_caps_route_bodies() {
    let app = app(AppConfig {
        json: Toggle::Custom(BodyParserConfig { limit: 4 }),
        ..AppConfig::default()
    });
    let req = Request::builder()
        .method("POST")
        .uri("/profile/echo")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"a":1}"#))
        .unwrap();
    let response = app.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[test]
fn config_reads_flags_and_settings() {
    let config: AppConfig = serde_json::from_value(json!({
        "route_prefix": "/api",
        "cors": {"origins": ["*"], "credentials": true},
        "security_headers": true,
        "json": {"limit": 1024}
    }))
    .unwrap();
    assert_eq!(config.route_prefix, "/api");
    assert!(config.security_headers.is_enabled());
    assert!(!config.logging.is_enabled());
    assert_eq!(config.json.settings().map(|json| json.limit), Some(1024));
    assert!(config.cors.settings().is_some_and(|cors| cors.credentials));
}
