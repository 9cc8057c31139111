//! Compiles registry metadata into an axum [`Router`].
//!
//! Every declared method becomes one axum handler that buffers the body, runs
//! the middleware chain (global, then controller, then method), extracts the
//! arguments, calls the controller method and renders its reply. Errors go
//! through the error handlers of the controllers mounted on the router before
//! falling back to the default JSON error response.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;

use axum::body::Body;
use axum::http::Request;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, on, MethodFilter, MethodRouter};
use axum::Router;
use tracing::{debug, info, warn};

use crate::error::{Error, ErrorHandler, ErrorOutcome, HttpError, Result};
use crate::metadata::{
    registry, ControllerClass, ControllerId, HttpMethod, Invoker, MetadataRegistry, MethodRecord,
    MiddlewareSource,
};
use crate::middleware::{shared, Middleware, MiddlewareRef};
use crate::params::{extractor, Arg, ArgFactory, Args};
use crate::path;
use crate::request::{ActiveController, Reply, ResponseHandle, RouteRequest, DEFAULT_BODY_LIMIT};

type Instance = Arc<dyn Any + Send + Sync>;

/// Controller instances shared across registrations, keyed by controller type.
///
/// Pass the same cache to several builds to construct each controller once.
#[derive(Clone, Default)]
pub struct InstanceCache {
    instances: Arc<Mutex<HashMap<ControllerId, Instance>>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, id: ControllerId) -> bool {
        self.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ControllerId, Instance>> {
        self.instances.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn get_or_create(&self, class: &ControllerClass) -> Result<Instance> {
        let mut instances = self.lock();
        if let Some(instance) = instances.get(&class.id()) {
            return Ok(Arc::clone(instance));
        }
        let instance = class.instantiate()?;
        instances.insert(class.id(), Arc::clone(&instance));
        Ok(instance)
    }
}

impl fmt::Debug for InstanceCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.lock().keys()).finish()
    }
}

struct ScopedErrorHandler {
    instance: Instance,
    handler: ErrorHandler,
}

/// The error handlers of a router, installed once every controller is registered.
#[derive(Clone, Default)]
struct ErrorChain {
    handlers: Arc<OnceLock<Vec<ScopedErrorHandler>>>,
}

impl ErrorChain {
    fn respond(&self, error: HttpError, request: &RouteRequest) -> Response {
        let mut error = error;
        for scoped in self.handlers.get().into_iter().flatten() {
            let claimed = request
                .controller
                .as_ref()
                .is_some_and(|active| active.is_instance(&scoped.instance));
            if !claimed {
                continue;
            }
            match (scoped.handler)(error, request) {
                ErrorOutcome::Respond(response) => return response,
                ErrorOutcome::Forward(forwarded) => error = forwarded,
            }
        }
        error.into_response()
    }
}

struct RouteState {
    controller: ControllerId,
    instance: Instance,
    invoker: Invoker,
    chain: Vec<MiddlewareRef>,
    factories: Vec<Option<ArgFactory>>,
    errors: ErrorChain,
    timeout: Option<Duration>,
    body_limit: usize,
}

async fn dispatch(state: Arc<RouteState>, req: Request<Body>) -> Response {
    let mut request = match RouteRequest::from_http(req, state.body_limit).await {
        Ok(request) => request,
        Err(e) => return e.into_response(),
    };

    for middleware in &state.chain {
        match middleware.handle(&mut request).await {
            Ok(None) => {}
            Ok(Some(response)) => return response,
            Err(e) => return state.errors.respond(e, &request),
        }
    }

    request.controller = Some(ActiveController {
        id: state.controller,
        instance: Arc::clone(&state.instance),
    });
    let request = Arc::new(request);
    let response = ResponseHandle::new();
    let args = Args::new(
        state
            .factories
            .iter()
            .map(|factory| match factory {
                Some(factory) => factory(&request, &response),
                None => Arg::Undefined,
            })
            .collect(),
    );

    let call = (state.invoker)(Arc::clone(&state.instance), args);
    let outcome = match state.timeout {
        Some(limit) => match tokio::time::timeout(limit, call).await {
            Ok(outcome) => outcome,
            Err(_) => Err(HttpError::cancelled(format!(
                "handler did not complete within {} ms",
                limit.as_millis()
            ))),
        },
        None => call.await,
    };

    match outcome {
        Ok(Reply::Json(value)) => match response.take_sent() {
            Some(sent) => {
                debug!(path = request.path(), "response already sent, returned value ignored");
                sent
            }
            None => response.finish_json(&value),
        },
        Ok(Reply::Empty) => response
            .take_sent()
            .unwrap_or_else(|| response.finish_empty()),
        Err(e) => state.errors.respond(e, &request),
    }
}

fn method_filter(verb: HttpMethod) -> Option<MethodFilter> {
    match verb {
        HttpMethod::Get => Some(MethodFilter::GET),
        HttpMethod::Post => Some(MethodFilter::POST),
        HttpMethod::Put => Some(MethodFilter::PUT),
        HttpMethod::Patch => Some(MethodFilter::PATCH),
        HttpMethod::Delete => Some(MethodFilter::DELETE),
        HttpMethod::Options => Some(MethodFilter::OPTIONS),
        HttpMethod::Head => Some(MethodFilter::HEAD),
        HttpMethod::All => None,
    }
}

fn method_router(verb: HttpMethod, state: Arc<RouteState>) -> MethodRouter {
    let route_handler = move |req: Request<Body>| async move { dispatch(state, req).await };
    match method_filter(verb) {
        Some(filter) => on(filter, route_handler),
        None => any(route_handler),
    }
}

/// Replaces every `{capture}` segment so that `/users/{id}` and `/users/{name}` collide.
fn route_shape(axum_path: &str) -> String {
    axum_path
        .split('/')
        .map(|segment| {
            if segment.starts_with("{*") {
                "{*}"
            } else if segment.starts_with('{') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// What every method route of one controller shares.
pub struct ControllerScope {
    id: ControllerId,
    instance: Instance,
    base_path: String,
    middleware: Vec<MiddlewareRef>,
}

impl ControllerScope {
    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub fn base_path(&self) -> &str {
        &self.base_path
    }
}

impl fmt::Debug for ControllerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControllerScope")
            .field("id", &self.id)
            .field("base_path", &self.base_path)
            .field("middleware", &self.middleware.len())
            .finish()
    }
}

/// Registers controllers, one route per declared method, on a router.
pub struct RouteRegistrar<'r> {
    registry: &'r MetadataRegistry,
    router: Router,
    global_prefix: String,
    global_middleware: Vec<MiddlewareRef>,
    instances: InstanceCache,
    errors: ErrorChain,
    scoped_handlers: Vec<ScopedErrorHandler>,
    routes: HashMap<String, (String, Vec<HttpMethod>)>,
    timeout: Option<Duration>,
    body_limit: usize,
}

impl<'r> RouteRegistrar<'r> {
    pub fn new(registry: &'r MetadataRegistry) -> Self {
        Self {
            registry,
            router: Router::new(),
            global_prefix: String::new(),
            global_middleware: Vec::new(),
            instances: InstanceCache::new(),
            errors: ErrorChain::default(),
            scoped_handlers: Vec::new(),
            routes: HashMap::new(),
            timeout: None,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }

    pub fn global_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.global_prefix = prefix.into();
        self
    }

    /// Middleware run first on every route, in list order.
    pub fn global_middleware(mut self, middleware: Vec<MiddlewareRef>) -> Self {
        self.global_middleware = middleware;
        self
    }

    pub fn instances(mut self, instances: InstanceCache) -> Self {
        self.instances = instances;
        self
    }

    pub fn handler_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    /// Resolves the instance, base path and middleware of a controller.
    pub fn controller_scope(&self, class: &ControllerClass) -> Result<ControllerScope> {
        let id = class.id();
        let record = self
            .registry
            .get_controller(id)
            .ok_or(Error::NotAController(id.name()))?;
        let instance = self.instances.get_or_create(class)?;
        let base_path = path::join(&self.global_prefix, &record.prefix);
        let mut middleware = record.middleware;
        middleware.extend(
            self.registry
                .get_controller_middleware(id)
                .into_iter()
                .filter(|m| m.source == MiddlewareSource::Applied)
                .map(|m| m.handler),
        );
        Ok(ControllerScope {
            id,
            instance,
            base_path,
            middleware,
        })
    }

    pub fn register_controller(&mut self, class: &ControllerClass) -> Result<()> {
        let scope = self.controller_scope(class)?;
        for record in self.registry.get_controller_methods(scope.id) {
            self.register_method_route(&scope, &record)?;
        }
        if let Some(record) = self.registry.get_error_handler(scope.id) {
            self.scoped_handlers.push(ScopedErrorHandler {
                instance: Arc::clone(&scope.instance),
                handler: record.handler,
            });
        }
        Ok(())
    }

    pub fn register_method_route(&mut self, scope: &ControllerScope, record: &MethodRecord) -> Result<()> {
        let full_path = path::join(&scope.base_path, &record.path);
        let axum_path = path::to_axum_path(&full_path);
        let descriptor = self
            .registry
            .get_method_descriptor(scope.id, &record.method)
            .ok_or_else(|| {
                Error::Config(format!("{} has no method named {}", scope.id, record.method))
            })?;

        let shape = route_shape(&axum_path);
        let (registered_path, verbs) = self
            .routes
            .entry(shape)
            .or_insert_with(|| (axum_path.clone(), Vec::new()));
        if *registered_path != axum_path {
            return Err(Error::Config(format!(
                "route {} conflicts with {}",
                full_path, registered_path
            )));
        }
        let overlaps = verbs
            .iter()
            .any(|v| *v == record.http_method || *v == HttpMethod::All || record.http_method == HttpMethod::All);
        if overlaps {
            warn!(
                method = %record.http_method,
                path = %full_path,
                controller = %scope.id,
                handler = %record.method,
                "duplicate route ignored"
            );
            return Ok(());
        }
        verbs.push(record.http_method);

        let mut chain = self.global_middleware.clone();
        chain.extend(scope.middleware.iter().cloned());
        chain.extend(record.middleware.iter().cloned());
        chain.extend(
            self.registry
                .get_method_middleware(scope.id, &record.method)
                .into_iter()
                .map(|m| m.handler),
        );

        let mut parameters = self.registry.get_parameters(scope.id, &record.method);
        parameters.sort_by_key(|p| p.index);
        let arity = parameters.last().map_or(0, |p| p.index + 1);
        let mut factories: Vec<Option<ArgFactory>> = vec![None; arity];
        for parameter in &parameters {
            factories[parameter.index] = Some(extractor(&parameter.kind));
        }

        let state = Arc::new(RouteState {
            controller: scope.id,
            instance: Arc::clone(&scope.instance),
            invoker: descriptor.invoker,
            chain,
            factories,
            errors: self.errors.clone(),
            timeout: self.timeout,
            body_limit: self.body_limit,
        });

        let router = std::mem::take(&mut self.router);
        self.router = router.route(&axum_path, method_router(record.http_method, state));
        debug!(
            method = %record.http_method,
            path = %full_path,
            controller = %scope.id,
            handler = %record.method,
            "route registered"
        );
        Ok(())
    }

    /// Installs the collected error handlers and returns the router.
    pub fn into_router(self) -> Router {
        let installed = self.scoped_handlers.len();
        if self.errors.handlers.set(self.scoped_handlers).is_err() {
            warn!("error handlers were already installed");
        }
        debug!(error_handlers = installed, "error handlers installed");
        self.router
    }

    pub fn route_count(&self) -> usize {
        self.routes.values().map(|(_, verbs)| verbs.len()).sum()
    }
}

/// Builds a router from the declared controllers.
#[derive(Clone)]
pub struct RouterBuilder {
    registry: Option<Arc<MetadataRegistry>>,
    controllers: Vec<ControllerClass>,
    prefix: String,
    middleware: Vec<MiddlewareRef>,
    instances: Option<InstanceCache>,
    timeout: Option<Duration>,
    body_limit: usize,
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self {
            registry: None,
            controllers: Vec::new(),
            prefix: String::new(),
            middleware: Vec::new(),
            instances: None,
            timeout: None,
            body_limit: DEFAULT_BODY_LIMIT,
        }
    }
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads metadata from `registry` instead of the process-wide one.
    pub fn registry(mut self, registry: Arc<MetadataRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn controller(mut self, class: ControllerClass) -> Self {
        self.controllers.push(class);
        self
    }

    pub fn controllers(mut self, classes: impl IntoIterator<Item = ControllerClass>) -> Self {
        self.controllers.extend(classes);
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn middleware<M: Middleware>(mut self, middleware: M) -> Self {
        self.middleware.push(shared(middleware));
        self
    }

    pub fn middleware_shared(mut self, middleware: impl IntoIterator<Item = MiddlewareRef>) -> Self {
        self.middleware.extend(middleware);
        self
    }

    pub fn instances(mut self, instances: InstanceCache) -> Self {
        self.instances = Some(instances);
        self
    }

    /// Cancels controller methods that run longer than `timeout` with a 408.
    pub fn handler_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Largest request body buffered before answering 413.
    pub fn body_limit(mut self, limit: usize) -> Self {
        self.body_limit = limit;
        self
    }

    pub fn build(self) -> Result<Router> {
        let registry = self.registry.unwrap_or_else(registry);
        if let Some(error) = registry.take_declaration_errors().into_iter().next() {
            return Err(error);
        }
        if self.controllers.is_empty() {
            return Err(Error::Config("at least one controller is required".to_string()));
        }

        let mut registrar = RouteRegistrar::new(&registry)
            .global_prefix(self.prefix)
            .global_middleware(self.middleware)
            .instances(self.instances.unwrap_or_default())
            .handler_timeout(self.timeout)
            .body_limit(self.body_limit);
        for class in &self.controllers {
            registrar.register_controller(class)?;
        }
        let routes = registrar.route_count();
        let router = registrar.into_router();
        info!(controllers = self.controllers.len(), routes, "router assembled");
        Ok(router)
    }
}

impl fmt::Debug for RouterBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouterBuilder")
            .field("controllers", &self.controllers)
            .field("prefix", &self.prefix)
            .field("middleware", &self.middleware.len())
            .field("timeout", &self.timeout)
            .field("body_limit", &self.body_limit)
            .finish()
    }
}

pub struct RouterOptions {
    pub controllers: Vec<ControllerClass>,
    pub route_prefix: String,
    pub middleware: Vec<MiddlewareRef>,
}

/// Builds a router from the process-wide registry.
pub fn create_router(options: RouterOptions) -> Result<Router> {
    RouterBuilder::new()
        .controllers(options.controllers)
        .prefix(options.route_prefix)
        .middleware_shared(options.middleware)
        .build()
}
