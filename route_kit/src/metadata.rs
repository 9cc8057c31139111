//! The metadata registry.
//!
//! Declarations write records here; the route registration engine reads them
//! once per bootstrap. One process-wide registry is reachable through
//! [`registry`], created lazily on first access and never recreated. Call
//! [`MetadataRegistry::clear`] between tests that declare into it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use once_cell::sync::Lazy;

use crate::error::{BoxError, Error, ErrorHandler, HttpError, Result};
use crate::middleware::MiddlewareRef;
use crate::params::{Args, ParamKind};
use crate::request::Reply;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Calls one controller method on a type-erased instance.
pub type Invoker = Arc<
    dyn Fn(Arc<dyn Any + Send + Sync>, Args) -> BoxFuture<'static, std::result::Result<Reply, HttpError>>
        + Send
        + Sync,
>;

/// Identity of a controller type.
///
/// Equality and hashing use the `TypeId` only; the name is kept for messages.
#[derive(Clone, Copy)]
pub struct ControllerId {
    type_id: TypeId,
    name: &'static str,
}

impl ControllerId {
    pub fn of<T: 'static>() -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ControllerId {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl Eq for ControllerId {}

impl Hash for ControllerId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.type_id.hash(state);
    }
}

impl fmt::Debug for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ControllerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// A type whose methods can be exposed as routes.
pub trait Controller: Send + Sync + 'static {
    /// Builds the instance shared by every route of this controller.
    fn create() -> std::result::Result<Self, BoxError>
    where
        Self: Sized;
}

/// A controller type passed to the router, with the means to instantiate it.
#[derive(Clone, Copy)]
pub struct ControllerClass {
    id: ControllerId,
    create: fn() -> std::result::Result<Arc<dyn Any + Send + Sync>, BoxError>,
}

impl ControllerClass {
    pub fn of<C: Controller>() -> Self {
        Self {
            id: ControllerId::of::<C>(),
            create: create_instance::<C>,
        }
    }

    pub fn id(&self) -> ControllerId {
        self.id
    }

    pub(crate) fn instantiate(&self) -> Result<Arc<dyn Any + Send + Sync>> {
        (self.create)().map_err(|source| Error::Instantiate {
            name: self.id.name(),
            source,
        })
    }
}

impl fmt::Debug for ControllerClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ControllerClass").field(&self.id).finish()
    }
}

fn create_instance<C: Controller>() -> std::result::Result<Arc<dyn Any + Send + Sync>, BoxError> {
    let instance: Arc<dyn Any + Send + Sync> = Arc::new(C::create()?);
    Ok(instance)
}

/// HTTP verbs a method can be routed on; `All` matches any verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Options,
    Head,
    All,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Options => "OPTIONS",
            HttpMethod::Head => "HEAD",
            HttpMethod::All => "ALL",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone)]
pub struct ControllerRecord {
    pub target: ControllerId,
    pub prefix: String,
    pub middleware: Vec<MiddlewareRef>,
}

#[derive(Clone)]
pub struct MethodRecord {
    pub target: ControllerId,
    pub method: String,
    pub http_method: HttpMethod,
    pub path: String,
    pub middleware: Vec<MiddlewareRef>,
}

/// A method of a controller as seen by the registry: owner, name and callable.
#[derive(Clone)]
pub struct MethodDescriptor {
    pub target: ControllerId,
    pub name: String,
    pub invoker: Invoker,
}

#[derive(Clone, Debug)]
pub struct ParameterRecord {
    pub target: ControllerId,
    pub method: String,
    pub index: usize,
    pub kind: ParamKind,
}

/// Which declaration produced a middleware record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MiddlewareSource {
    /// Mirrored from the middleware list of a controller declaration.
    Controller,
    /// Added with `use_middleware` or a validation declaration.
    Applied,
}

#[derive(Clone)]
pub struct MiddlewareRecord {
    pub target: ControllerId,
    /// `None` for controller-scoped middleware.
    pub method: Option<String>,
    pub handler: MiddlewareRef,
    pub source: MiddlewareSource,
}

#[derive(Clone)]
pub struct ErrorHandlerRecord {
    pub target: ControllerId,
    pub handler: ErrorHandler,
}

macro_rules! debug_without_handlers {
    ($ty:ident { $($field:ident),* }) => {
        impl fmt::Debug for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($ty))
                    $(.field(stringify!($field), &self.$field))*
                    .finish_non_exhaustive()
            }
        }
    };
}

debug_without_handlers!(ControllerRecord { target, prefix });
debug_without_handlers!(MethodRecord { target, method, http_method, path });
debug_without_handlers!(MethodDescriptor { target, name });
debug_without_handlers!(MiddlewareRecord { target, method, source });
debug_without_handlers!(ErrorHandlerRecord { target });

#[derive(Default)]
struct Records {
    controllers: Vec<ControllerRecord>,
    methods: HashMap<(ControllerId, String), Vec<MethodRecord>>,
    descriptors: HashMap<ControllerId, Vec<MethodDescriptor>>,
    parameters: HashMap<(ControllerId, String), Vec<ParameterRecord>>,
    middleware: HashMap<(ControllerId, Option<String>), Vec<MiddlewareRecord>>,
    error_handlers: HashMap<ControllerId, ErrorHandlerRecord>,
    declaration_errors: Vec<Error>,
}

/// Holds every record written by declarations.
#[derive(Default)]
pub struct MetadataRegistry {
    records: RwLock<Records>,
}

impl fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let records = self.read();
        f.debug_struct("MetadataRegistry")
            .field("controllers", &records.controllers)
            .finish_non_exhaustive()
    }
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Inserts or replaces the controller record of `record.target`.
    pub fn add_controller(&self, record: ControllerRecord) {
        let mut records = self.write();
        match records
            .controllers
            .iter_mut()
            .find(|existing| existing.target == record.target)
        {
            Some(existing) => *existing = record,
            None => records.controllers.push(record),
        }
    }

    pub fn add_method(&self, record: MethodRecord) {
        self.write()
            .methods
            .entry((record.target, record.method.clone()))
            .or_default()
            .push(record);
    }

    /// Registers a method of the target; re-registering a name replaces its callable.
    pub fn add_method_descriptor(&self, descriptor: MethodDescriptor) {
        let mut records = self.write();
        let own = records.descriptors.entry(descriptor.target).or_default();
        match own.iter_mut().find(|d| d.name == descriptor.name) {
            Some(existing) => *existing = descriptor,
            None => own.push(descriptor),
        }
    }

    pub fn add_parameter(&self, record: ParameterRecord) {
        self.write()
            .parameters
            .entry((record.target, record.method.clone()))
            .or_default()
            .push(record);
    }

    pub fn add_middleware(&self, record: MiddlewareRecord) {
        self.write()
            .middleware
            .entry((record.target, record.method.clone()))
            .or_default()
            .push(record);
    }

    /// Sets the error handler of `record.target`, replacing any previous one.
    pub fn add_error_handler(&self, record: ErrorHandlerRecord) {
        self.write().error_handlers.insert(record.target, record);
    }

    pub fn is_controller(&self, target: ControllerId) -> bool {
        self.read().controllers.iter().any(|c| c.target == target)
    }

    pub fn get_controller(&self, target: ControllerId) -> Option<ControllerRecord> {
        self.read()
            .controllers
            .iter()
            .find(|c| c.target == target)
            .cloned()
    }

    /// All controller records, in first-insertion order.
    pub fn get_controllers(&self) -> Vec<ControllerRecord> {
        self.read().controllers.clone()
    }

    /// Method records of the target's own methods, in method declaration order.
    ///
    /// Methods registered without route metadata contribute nothing.
    pub fn get_controller_methods(&self, target: ControllerId) -> Vec<MethodRecord> {
        let records = self.read();
        let Some(own) = records.descriptors.get(&target) else {
            return Vec::new();
        };
        own.iter()
            .filter_map(|d| records.methods.get(&(target, d.name.clone())))
            .flatten()
            .cloned()
            .collect()
    }

    pub fn get_method_descriptor(&self, target: ControllerId, method: &str) -> Option<MethodDescriptor> {
        self.read()
            .descriptors
            .get(&target)?
            .iter()
            .find(|d| d.name == method)
            .cloned()
    }

    /// Parameter records in registration order; callers sort by index.
    pub fn get_parameters(&self, target: ControllerId, method: &str) -> Vec<ParameterRecord> {
        self.read()
            .parameters
            .get(&(target, method.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_controller_middleware(&self, target: ControllerId) -> Vec<MiddlewareRecord> {
        self.read()
            .middleware
            .get(&(target, None))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_method_middleware(&self, target: ControllerId, method: &str) -> Vec<MiddlewareRecord> {
        self.read()
            .middleware
            .get(&(target, Some(method.to_string())))
            .cloned()
            .unwrap_or_default()
    }

    pub fn get_error_handler(&self, target: ControllerId) -> Option<ErrorHandlerRecord> {
        self.read().error_handlers.get(&target).cloned()
    }

    /// Empties every collection, pending declaration errors included.
    pub fn clear(&self) {
        *self.write() = Records::default();
    }

    /// Runs every declaration submitted with `inventory`.
    ///
    /// The global registry does this once on creation; call it again after
    /// [`clear`](Self::clear) to restore macro-declared controllers.
    pub fn load_declarations(&self) {
        for entry in inventory::iter::<ControllerDeclaration> {
            if let Err(e) = (entry.declare)(self) {
                self.write().declaration_errors.push(e);
            }
        }
    }

    /// Errors raised by declarations run outside of a caller's control.
    pub fn take_declaration_errors(&self) -> Vec<Error> {
        std::mem::take(&mut self.write().declaration_errors)
    }
}

/// A declaration function submitted by the `#[controller]` macro.
pub struct ControllerDeclaration {
    declare: fn(&MetadataRegistry) -> Result<()>,
}

impl ControllerDeclaration {
    pub const fn new(declare: fn(&MetadataRegistry) -> Result<()>) -> Self {
        Self { declare }
    }
}

inventory::collect!(ControllerDeclaration);

static REGISTRY: Lazy<Arc<MetadataRegistry>> = Lazy::new(|| {
    let registry = MetadataRegistry::new();
    registry.load_declarations();
    Arc::new(registry)
});

/// The process-wide registry.
pub fn registry() -> Arc<MetadataRegistry> {
    REGISTRY.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::middleware::{from_fn, shared};
    use crate::request::RouteRequest;

    struct Users;
    struct Orders;

    fn noop() -> MiddlewareRef {
        shared(from_fn(|_: &mut RouteRequest| Ok(None)))
    }

    fn descriptor(target: ControllerId, name: &str) -> MethodDescriptor {
        MethodDescriptor {
            target,
            name: name.to_string(),
            invoker: Arc::new(|_, _| Box::pin(async { Ok(Reply::Empty) })),
        }
    }

    fn method(target: ControllerId, name: &str, path: &str) -> MethodRecord {
        MethodRecord {
            target,
            method: name.to_string(),
            http_method: HttpMethod::Get,
            path: path.to_string(),
            middleware: Vec::new(),
        }
    }

    #[test]
    fn identity_ignores_the_name() {
        let a = ControllerId::of::<Users>();
        assert_eq!(a, ControllerId::of::<Users>());
        assert_ne!(a, ControllerId::of::<Orders>());
        assert!(a.name().ends_with("Users"));
    }

    #[test]
    fn controller_records_are_replaced() {
        let registry = MetadataRegistry::new();
        let users = ControllerId::of::<Users>();
        assert!(!registry.is_controller(users));
        for prefix in ["/a", "/b"] {
            registry.add_controller(ControllerRecord {
                target: users,
                prefix: prefix.into(),
                middleware: Vec::new(),
            });
        }
        assert!(registry.is_controller(users));
        let controllers = registry.get_controllers();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].prefix, "/b");
    }

    #[test]
    fn methods_follow_declaration_order() {
        let registry = MetadataRegistry::new();
        let users = ControllerId::of::<Users>();
        registry.add_method_descriptor(descriptor(users, "list"));
        registry.add_method_descriptor(descriptor(users, "helper"));
        registry.add_method_descriptor(descriptor(users, "get"));
        registry.add_method(method(users, "get", "/:id"));
        registry.add_method(method(users, "list", "/"));
        registry.add_method(method(users, "list", "/all"));

        let paths: Vec<String> = registry
            .get_controller_methods(users)
            .into_iter()
            .map(|m| m.path)
            .collect();
        assert_eq!(paths, ["/", "/all", "/:id"]);
        assert!(registry.get_method_descriptor(users, "helper").is_some());
        assert!(registry.get_controller_methods(ControllerId::of::<Orders>()).is_empty());
    }

    #[test]
    fn absent_lists_are_empty() {
        let registry = MetadataRegistry::new();
        let users = ControllerId::of::<Users>();
        assert!(registry.get_parameters(users, "get").is_empty());
        assert!(registry.get_controller_middleware(users).is_empty());
        assert!(registry.get_method_middleware(users, "get").is_empty());
        assert!(registry.get_error_handler(users).is_none());
    }

    #[test]
    fn middleware_is_scoped_by_method() {
        let registry = MetadataRegistry::new();
        let users = ControllerId::of::<Users>();
        for method in [None, Some("get".to_string()), Some("get".to_string())] {
            registry.add_middleware(MiddlewareRecord {
                target: users,
                method,
                handler: noop(),
                source: MiddlewareSource::Applied,
            });
        }
        assert_eq!(registry.get_controller_middleware(users).len(), 1);
        assert_eq!(registry.get_method_middleware(users, "get").len(), 2);
        assert!(registry.get_method_middleware(users, "list").is_empty());
    }

    #[test]
    fn clear_removes_everything() {
        let registry = MetadataRegistry::new();
        let users = ControllerId::of::<Users>();
        registry.add_controller(ControllerRecord {
            target: users,
            prefix: String::new(),
            middleware: vec![noop()],
        });
        registry.add_method_descriptor(descriptor(users, "get"));
        registry.add_method(method(users, "get", "/"));
        registry.add_parameter(ParameterRecord {
            target: users,
            method: "get".into(),
            index: 0,
            kind: ParamKind::Request,
        });
        registry.add_error_handler(ErrorHandlerRecord {
            target: users,
            handler: crate::error::default_error_handler(),
        });

        registry.clear();
        assert!(!registry.is_controller(users));
        assert!(registry.get_controllers().is_empty());
        assert!(registry.get_controller_methods(users).is_empty());
        assert!(registry.get_parameters(users, "get").is_empty());
        assert!(registry.get_error_handler(users).is_none());
    }
}
