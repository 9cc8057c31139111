//! Controller declarations.
//!
//! A [`Declaration`] writes the metadata of one controller type into a
//! registry. The `#[controller]` attribute expands to calls on this builder;
//! it can also be used by hand:
//!
//! ```ignore
//! impl Declare for Users {
//!     fn declare(d: &mut Declaration<'_, Self>) -> route_kit::Result<()> {
//!         d.controller("/users");
//!         d.method("get", |this: Arc<Users>, mut args: Args| async move {
//!             let id: String = args.extract(0)?;
//!             Ok(this.find(&id))
//!         })
//!         .get("/:id")
//!         .param(0, ParamKind::param(Some("id")));
//!         Ok(())
//!     }
//! }
//! ```

use std::any::Any;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::{default_error_handler, Error, ErrorHandler, HttpError, Result};
use crate::metadata::{
    BoxFuture, Controller, ControllerId, ControllerRecord, ErrorHandlerRecord, HttpMethod, Invoker,
    MetadataRegistry, MethodDescriptor, MethodRecord, MiddlewareRecord, MiddlewareSource,
    ParameterRecord,
};
use crate::middleware::{shared, Middleware, MiddlewareRef};
use crate::params::{Args, ParamKind};
use crate::request::{IntoReply, Reply, Section};
use crate::validation::{validate, Schema, ValidationOptions};

/// A controller type that knows how to declare its routes.
pub trait Declare: Controller {
    fn declare(declaration: &mut Declaration<'_, Self>) -> Result<()>
    where
        Self: Sized;
}

/// Runs the declaration of `C` against `registry`.
pub fn declare<C: Declare>(registry: &MetadataRegistry) -> Result<()> {
    let mut declaration = Declaration::<C>::new(registry);
    C::declare(&mut declaration)
}

/// Options of the controller declaration.
#[derive(Clone, Default)]
pub struct ControllerOptions {
    pub prefix: String,
    pub middleware: Vec<MiddlewareRef>,
}

impl ControllerOptions {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            middleware: Vec::new(),
        }
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(shared(middleware));
        self
    }
}

impl From<&str> for ControllerOptions {
    fn from(prefix: &str) -> Self {
        Self::new(prefix)
    }
}

impl From<String> for ControllerOptions {
    fn from(prefix: String) -> Self {
        Self::new(prefix)
    }
}

impl From<()> for ControllerOptions {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

/// Options of a route declaration.
#[derive(Clone, Default)]
pub struct RouteOptions {
    pub path: String,
    pub middleware: Vec<MiddlewareRef>,
}

impl RouteOptions {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            middleware: Vec::new(),
        }
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(shared(middleware));
        self
    }
}

impl From<&str> for RouteOptions {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

impl From<String> for RouteOptions {
    fn from(path: String) -> Self {
        Self::new(path)
    }
}

impl From<()> for RouteOptions {
    fn from(_: ()) -> Self {
        Self::default()
    }
}

pub struct Declaration<'r, C> {
    registry: &'r MetadataRegistry,
    target: ControllerId,
    _controller: PhantomData<fn() -> C>,
}

impl<'r, C: Controller> Declaration<'r, C> {
    pub fn new(registry: &'r MetadataRegistry) -> Self {
        Self {
            registry,
            target: ControllerId::of::<C>(),
            _controller: PhantomData,
        }
    }

    pub fn target(&self) -> ControllerId {
        self.target
    }

    /// Marks `C` as a controller mounted under `options.prefix`.
    pub fn controller(&mut self, options: impl Into<ControllerOptions>) -> &mut Self {
        let options = options.into();
        for middleware in &options.middleware {
            self.registry.add_middleware(MiddlewareRecord {
                target: self.target,
                method: None,
                handler: Arc::clone(middleware),
                source: MiddlewareSource::Controller,
            });
        }
        self.registry.add_controller(ControllerRecord {
            target: self.target,
            prefix: options.prefix,
            middleware: options.middleware,
        });
        self
    }

    /// Adds controller-wide middleware, run after the controller's own list.
    pub fn use_middleware<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.use_shared(shared(middleware))
    }

    pub fn use_shared(&mut self, middleware: MiddlewareRef) -> &mut Self {
        self.registry.add_middleware(MiddlewareRecord {
            target: self.target,
            method: None,
            handler: middleware,
            source: MiddlewareSource::Applied,
        });
        self
    }

    /// Installs the error handler of this controller; `None` installs the default one.
    ///
    /// Must come after [`controller`](Self::controller).
    pub fn catch(&mut self, handler: Option<ErrorHandler>) -> Result<&mut Self> {
        if !self.registry.is_controller(self.target) {
            return Err(Error::NotAController(self.target.name()));
        }
        self.registry.add_error_handler(ErrorHandlerRecord {
            target: self.target,
            handler: handler.unwrap_or_else(default_error_handler),
        });
        Ok(self)
    }

    /// Declares a method of the controller.
    ///
    /// `f` receives the shared controller instance and the extracted
    /// arguments, in parameter order.
    pub fn method<F, Fut, R>(&mut self, name: &str, f: F) -> MethodDeclaration<'_, 'r, C>
    where
        F: Fn(Arc<C>, Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<R, HttpError>> + Send + 'static,
        R: IntoReply,
    {
        let f = Arc::new(f);
        let target = self.target;
        let invoker: Invoker = Arc::new(
            move |instance: Arc<dyn Any + Send + Sync>,
                  args: Args|
                  -> BoxFuture<'static, std::result::Result<Reply, HttpError>> {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let this = instance.downcast::<C>().map_err(|_| {
                        HttpError::internal(format!("instance is not a {}", target.name()))
                    })?;
                    f(this, args).await?.into_reply()
                })
            },
        );
        self.registry.add_method_descriptor(MethodDescriptor {
            target: self.target,
            name: name.to_string(),
            invoker,
        });
        MethodDeclaration {
            declaration: self,
            method: name.to_string(),
        }
    }
}

/// Route metadata of one declared method.
pub struct MethodDeclaration<'d, 'r, C> {
    declaration: &'d mut Declaration<'r, C>,
    method: String,
}

impl<C: Controller> MethodDeclaration<'_, '_, C> {
    /// Routes the method on `verb` at `options.path`; may be called more than once.
    pub fn route(&mut self, verb: HttpMethod, options: impl Into<RouteOptions>) -> &mut Self {
        let options = options.into();
        self.declaration.registry.add_method(MethodRecord {
            target: self.declaration.target,
            method: self.method.clone(),
            http_method: verb,
            path: options.path,
            middleware: options.middleware,
        });
        self
    }

    pub fn get(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::Get, options)
    }

    pub fn post(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::Post, options)
    }

    pub fn put(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::Put, options)
    }

    pub fn patch(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::Patch, options)
    }

    pub fn delete(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::Delete, options)
    }

    pub fn options(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::Options, options)
    }

    pub fn head(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::Head, options)
    }

    pub fn all(&mut self, options: impl Into<RouteOptions>) -> &mut Self {
        self.route(HttpMethod::All, options)
    }

    /// Declares how the argument at `index` is extracted.
    pub fn param(&mut self, index: usize, kind: ParamKind) -> &mut Self {
        self.declaration.registry.add_parameter(ParameterRecord {
            target: self.declaration.target,
            method: self.method.clone(),
            index,
            kind,
        });
        self
    }

    pub fn use_middleware<M: Middleware>(&mut self, middleware: M) -> &mut Self {
        self.use_shared(shared(middleware))
    }

    pub fn use_shared(&mut self, middleware: MiddlewareRef) -> &mut Self {
        self.declaration.registry.add_middleware(MiddlewareRecord {
            target: self.declaration.target,
            method: Some(self.method.clone()),
            handler: middleware,
            source: MiddlewareSource::Applied,
        });
        self
    }

    pub fn validate<S: Schema>(&mut self, section: Section, schema: S, options: ValidationOptions) -> &mut Self {
        self.use_middleware(validate(section, schema, options))
    }

    pub fn validate_body<S: Schema>(&mut self, schema: S) -> &mut Self {
        self.validate(Section::Body, schema, ValidationOptions::default())
    }

    pub fn validate_query<S: Schema>(&mut self, schema: S) -> &mut Self {
        self.validate(Section::Query, schema, ValidationOptions::default())
    }

    pub fn validate_params<S: Schema>(&mut self, schema: S) -> &mut Self {
        self.validate(Section::Params, schema, ValidationOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use crate::middleware::from_fn;
    use crate::request::RouteRequest;
    use serde_json::{json, Value};

    struct Users;

    impl Controller for Users {
        fn create() -> std::result::Result<Self, BoxError> {
            Ok(Users)
        }
    }

    fn noop() -> impl Middleware {
        from_fn(|_: &mut RouteRequest| Ok(None))
    }

    #[test]
    fn catch_requires_a_controller_record() {
        let registry = MetadataRegistry::new();
        let mut d = Declaration::<Users>::new(&registry);
        let err = d.catch(None).err().unwrap();
        assert!(err.to_string().contains("is not a controller"));

        d.controller("/users");
        assert!(d.catch(None).is_ok());
        assert!(registry.get_error_handler(ControllerId::of::<Users>()).is_some());
    }

    #[test]
    fn controller_middleware_is_mirrored() {
        let registry = MetadataRegistry::new();
        let mut d = Declaration::<Users>::new(&registry);
        d.controller(ControllerOptions::new("/users").middleware(noop()));
        d.use_middleware(noop());

        let records = registry.get_controller_middleware(d.target());
        let sources: Vec<MiddlewareSource> = records.iter().map(|r| r.source).collect();
        assert_eq!(sources, [MiddlewareSource::Controller, MiddlewareSource::Applied]);
        assert_eq!(registry.get_controllers()[0].middleware.len(), 1);
    }

    #[tokio::test]
    async fn methods_write_records_and_invoke() {
        let registry = MetadataRegistry::new();
        let mut d = Declaration::<Users>::new(&registry);
        d.controller(());
        d.method("get", |_this: Arc<Users>, mut args: Args| async move {
            let id: String = args.extract(0)?;
            Ok::<_, HttpError>(json!({ "id": id }))
        })
        .get("/:id")
        .head("/:id")
        .param(0, ParamKind::param(Some("id")))
        .use_middleware(noop());

        let target = d.target();
        let methods = registry.get_controller_methods(target);
        assert_eq!(methods.len(), 2);
        assert_eq!(methods[1].http_method, HttpMethod::Head);
        assert_eq!(registry.get_parameters(target, "get")[0].index, 0);
        assert_eq!(registry.get_method_middleware(target, "get").len(), 1);

        let descriptor = registry.get_method_descriptor(target, "get").unwrap();
        let args = Args::new(vec![crate::params::Arg::Value(Value::from("42"))]);
        let reply = (descriptor.invoker)(Arc::new(Users), args).await.unwrap();
        assert_eq!(reply, Reply::Json(json!({"id": "42"})));
    }
}
