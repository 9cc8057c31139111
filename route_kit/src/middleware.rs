//! Request middleware run ahead of controller methods.
//!
//! A middleware either lets the request continue (`Ok(None)`), answers it
//! directly (`Ok(Some(response))`) or hands an error to the error channel
//! (`Err(error)`). Chains run strictly in order: global, controller, method.

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::header;
use axum::response::Response;
use serde_json::{Map, Value};

use crate::error::HttpError;
use crate::request::RouteRequest;

pub type MiddlewareResult = Result<Option<Response>, HttpError>;

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn handle(&self, request: &mut RouteRequest) -> MiddlewareResult;
}

pub type MiddlewareRef = Arc<dyn Middleware>;

/// Wraps a middleware for storage in the registry.
pub fn shared<M: Middleware>(middleware: M) -> MiddlewareRef {
    Arc::new(middleware)
}

#[async_trait]
impl<M: Middleware + ?Sized> Middleware for Arc<M> {
    async fn handle(&self, request: &mut RouteRequest) -> MiddlewareResult {
        (**self).handle(request).await
    }
}

/// A middleware built from a synchronous closure.
pub struct FnMiddleware<F> {
    f: F,
}

pub fn from_fn<F>(f: F) -> FnMiddleware<F>
where
    F: Fn(&mut RouteRequest) -> MiddlewareResult + Send + Sync + 'static,
{
    FnMiddleware { f }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&mut RouteRequest) -> MiddlewareResult + Send + Sync + 'static,
{
    async fn handle(&self, request: &mut RouteRequest) -> MiddlewareResult {
        (self.f)(request)
    }
}

/// Fills `RouteRequest::cookies` from the `Cookie` header(s).
#[derive(Debug, Clone, Copy, Default)]
pub struct CookieParser;

#[async_trait]
impl Middleware for CookieParser {
    async fn handle(&self, request: &mut RouteRequest) -> MiddlewareResult {
        let mut cookies = Map::new();
        for value in request.headers.get_all(header::COOKIE) {
            let Ok(value) = value.to_str() else {
                continue;
            };
            for pair in value.split(';') {
                let Some((name, raw)) = pair.split_once('=') else {
                    continue;
                };
                let name = name.trim();
                if name.is_empty() || cookies.contains_key(name) {
                    continue;
                }
                let raw = raw.trim();
                let raw = raw
                    .strip_prefix('"')
                    .and_then(|v| v.strip_suffix('"'))
                    .unwrap_or(raw);
                cookies.insert(name.to_string(), Value::String(raw.to_string()));
            }
        }
        request.cookies = Some(cookies);
        Ok(None)
    }
}
