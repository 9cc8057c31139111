//! # Route Kit - Declaration-Driven Controllers for axum
//!
//! `route_kit` lets you declare HTTP endpoints as methods of controller types
//! and compiles those declarations into an `axum::Router` at bootstrap. Route
//! metadata is captured once, in a registry, and read once when the router
//! is built; requests never go back to the registry.
//!
//! ## Core Features:
//!
//! - **`#[controller]`**: An attribute macro for `impl` blocks. Verb attributes
//!   (`#[get("/:id")]`, `#[post]`, ...) turn methods into routes, parameter
//!   attributes (`#[param("id")]`, `#[body]`, `#[query]`, ...) say where each
//!   argument comes from, and `#[validate_body(..)]` and friends check request
//!   sections against a schema before the method runs.
//!
//! - **`Declaration`**: The builder the macro expands to. It can be used directly
//!   to declare controllers without macros.
//!
//! - **`RouterBuilder`** / **`create_router`**: Compile the declared controllers
//!   into a router. Paths compose as global prefix, controller prefix, method
//!   path; middleware runs as global, controller, method.
//!
//! - **`create_app`**: A full application with optional CORS, security headers,
//!   request logging, cookie parsing and a JSON 404 fallback.
//!
//! Errors raised by middleware or controller methods become JSON responses of
//! the form `{"message": .., "status": .., ...data}` unless a controller error
//! handler (`#[catch]`) answers them first.

extern crate self as route_kit;

pub mod bootstrap;
pub mod declare;
pub mod error;
pub mod metadata;
pub mod middleware;
pub mod params;
pub mod path;
pub mod request;
pub mod router;
pub mod validation;

// Re-export key dependencies so that macros can use them
pub use axum;
pub use inventory;

#[cfg(feature = "macros")]
pub use route_kit_macros::controller;

pub use bootstrap::{create_app, AppConfig, AppOptions, Toggle};
pub use declare::{declare, ControllerOptions, Declaration, Declare, MethodDeclaration, RouteOptions};
pub use error::{error_handler, BoxError, Error, ErrorHandler, ErrorKind, ErrorOutcome, HttpError, Result};
pub use metadata::{
    registry, Controller, ControllerClass, ControllerDeclaration, ControllerId, HttpMethod,
    MetadataRegistry,
};
pub use middleware::{Middleware, MiddlewareResult};
pub use params::{Arg, Args, ParamKind};
pub use request::{IntoReply, Reply, ResponseHandle, RouteRequest, Section, Session};
pub use router::{create_router, InstanceCache, RouterBuilder, RouterOptions};
pub use validation::{JsonSchema, Schema, ValidationOptions};
