//! Handler registration.
//!
//! A [`Handler`] bundles every hook a service exposes for one resource
//! pattern: access, get, call and auth methods, apply hooks for mutation
//! events, and scheduling options. Handlers are assembled with a by-value
//! builder and registered with [`Service::handle`](crate::Service::handle)
//! or [`Router::handle`](crate::Router::handle).
//!
//! Conflicting options are programmer errors and panic when the option is
//! applied, not at runtime.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::error::Error;
use crate::pattern;
use crate::request::{AccessRequest, AuthRequest, CallRequest, GetRequest, NewRequest};
use crate::resource::Resource;
use crate::service::Service;
use crate::types::ChangeValues;

/// The value handlers resolve to. `Err` produces an error response when no
/// response has been sent yet.
pub type HandlerResult = Result<(), Error>;

pub(crate) type AccessFn =
    Arc<dyn Fn(AccessRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub(crate) type GetFn = Arc<dyn Fn(GetRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub(crate) type CallFn =
    Arc<dyn Fn(CallRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub(crate) type AuthFn =
    Arc<dyn Fn(AuthRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;
pub(crate) type NewFn = Arc<dyn Fn(NewRequest) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

pub(crate) type ApplyChangeFn = Arc<
    dyn Fn(Resource, ChangeValues) -> BoxFuture<'static, Result<Option<ChangeValues>, Error>>
        + Send
        + Sync,
>;
pub(crate) type ApplyAddFn =
    Arc<dyn Fn(Resource, Value, usize) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;
pub(crate) type ApplyRemoveFn =
    Arc<dyn Fn(Resource, usize) -> BoxFuture<'static, Result<Value, Error>> + Send + Sync>;
pub(crate) type ApplyCreateFn =
    Arc<dyn Fn(Resource, Value) -> BoxFuture<'static, Result<(), Error>> + Send + Sync>;
pub(crate) type ApplyDeleteFn =
    Arc<dyn Fn(Resource) -> BoxFuture<'static, Result<Option<Value>, Error>> + Send + Sync>;

pub(crate) type OnRegisterFn = Arc<dyn Fn(Service, String, Arc<Handler>) + Send + Sync>;

/// The kind of resource a handler serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResourceType {
    /// Not declared. Get requests cannot be served, and no mutation events
    /// may be emitted.
    #[default]
    Unset,
    /// A model: a set of named properties. Emits `change` events.
    Model,
    /// A collection: an ordered list. Emits `add` and `remove` events.
    Collection,
}

/// The set of hooks registered for one resource pattern.
///
/// # Example
///
/// ```ignore
/// service.handle(
///     "book.$id",
///     Handler::new()
///         .access_granted()
///         .get_model(|r: GetRequest| async move {
///             let id = r.path_param("id").unwrap_or_default().to_string();
///             r.model(Book { title: id })
///         })
///         .call("set", |r: CallRequest| async move {
///             r.change_event(changed).await?;
///             r.ok(())
///         }),
/// );
/// ```
#[derive(Default)]
pub struct Handler {
    pub(crate) typ: ResourceType,
    pub(crate) access: Option<AccessFn>,
    pub(crate) get: Option<GetFn>,
    pub(crate) calls: HashMap<String, CallFn>,
    pub(crate) auths: HashMap<String, AuthFn>,
    pub(crate) new_call: Option<NewFn>,
    pub(crate) apply_change: Option<ApplyChangeFn>,
    pub(crate) apply_add: Option<ApplyAddFn>,
    pub(crate) apply_remove: Option<ApplyRemoveFn>,
    pub(crate) apply_create: Option<ApplyCreateFn>,
    pub(crate) apply_delete: Option<ApplyDeleteFn>,
    pub(crate) group: Option<String>,
    pub(crate) parallel: bool,
    pub(crate) on_register: Option<OnRegisterFn>,
}

impl Handler {
    /// Create an empty handler with no declared resource type.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a handler declared as a model resource.
    pub fn model() -> Self {
        Self {
            typ: ResourceType::Model,
            ..Self::default()
        }
    }

    /// Create a handler declared as a collection resource.
    pub fn collection() -> Self {
        Self {
            typ: ResourceType::Collection,
            ..Self::default()
        }
    }

    fn set_type(&mut self, typ: ResourceType) {
        if self.typ != ResourceType::Unset && self.typ != typ {
            panic!("handler declares both model and collection type");
        }
        self.typ = typ;
    }

    /// The declared resource type.
    pub fn resource_type(&self) -> ResourceType {
        self.typ
    }

    // ── Request hooks ───────────────────────────────────────────────────

    /// Set the access hook.
    ///
    /// # Panics
    ///
    /// Panics if an access hook is already set.
    pub fn access<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(AccessRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.access.is_some() {
            panic!("handler already has an access hook");
        }
        self.access = Some(Arc::new(move |r| Box::pin(f(r))));
        self
    }

    /// Set an access hook granting full access (`get: true, call: "*"`) to
    /// every client.
    pub fn access_granted(self) -> Self {
        self.access(|r: AccessRequest| async move {
            r.access(true, "*")?;
            Ok(())
        })
    }

    /// Set the get hook and declare the resource a model.
    ///
    /// # Panics
    ///
    /// Panics if a get hook is already set, or if the handler is declared a
    /// collection.
    pub fn get_model<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(GetRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.get.is_some() {
            panic!("handler already has a get hook");
        }
        self.set_type(ResourceType::Model);
        self.get = Some(Arc::new(move |r| Box::pin(f(r))));
        self
    }

    /// Set the get hook and declare the resource a collection.
    ///
    /// # Panics
    ///
    /// Panics if a get hook is already set, or if the handler is declared a
    /// model.
    pub fn get_collection<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(GetRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.get.is_some() {
            panic!("handler already has a get hook");
        }
        self.set_type(ResourceType::Collection);
        self.get = Some(Arc::new(move |r| Box::pin(f(r))));
        self
    }

    /// Register a call method.
    ///
    /// # Panics
    ///
    /// Panics on an invalid method name or a duplicate registration.
    pub fn call<F, Fut>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(CallRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if !pattern::valid_token(method) {
            panic!("invalid call method name {:?}", method);
        }
        if self
            .calls
            .insert(method.to_string(), Arc::new(move |r| Box::pin(f(r))))
            .is_some()
        {
            panic!("handler already has a call method {:?}", method);
        }
        self
    }

    /// Register an auth method.
    ///
    /// # Panics
    ///
    /// Panics on an invalid method name or a duplicate registration.
    pub fn auth<F, Fut>(mut self, method: &str, f: F) -> Self
    where
        F: Fn(AuthRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if !pattern::valid_token(method) {
            panic!("invalid auth method name {:?}", method);
        }
        if self
            .auths
            .insert(method.to_string(), Arc::new(move |r| Box::pin(f(r))))
            .is_some()
        {
            panic!("handler already has an auth method {:?}", method);
        }
        self
    }

    /// Register the legacy new-resource hook, dispatched when the `new` call
    /// method is invoked and no explicit `call("new", ..)` is registered.
    #[deprecated(note = "register a call method responding with a resource reference instead")]
    pub fn new_call<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(NewRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if self.new_call.is_some() {
            panic!("handler already has a legacy new hook");
        }
        self.new_call = Some(Arc::new(move |r| Box::pin(f(r))));
        self
    }

    // ── Apply hooks ─────────────────────────────────────────────────────

    /// Set the apply hook for `change` events. The hook applies the change
    /// to the underlying state and returns the reverse change (the old
    /// values), `None` when there was no prior state, or an error that
    /// aborts the emission.
    pub fn apply_change<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Resource, ChangeValues) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<ChangeValues>, Error>> + Send + 'static,
    {
        if self.apply_change.is_some() {
            panic!("handler already has an apply-change hook");
        }
        self.apply_change = Some(Arc::new(move |r, v| Box::pin(f(r, v))));
        self
    }

    /// Set the apply hook for `add` events.
    pub fn apply_add<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Resource, Value, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        if self.apply_add.is_some() {
            panic!("handler already has an apply-add hook");
        }
        self.apply_add = Some(Arc::new(move |r, v, i| Box::pin(f(r, v, i))));
        self
    }

    /// Set the apply hook for `remove` events. The hook returns the removed
    /// value for listener notification.
    pub fn apply_remove<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Resource, usize) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, Error>> + Send + 'static,
    {
        if self.apply_remove.is_some() {
            panic!("handler already has an apply-remove hook");
        }
        self.apply_remove = Some(Arc::new(move |r, i| Box::pin(f(r, i))));
        self
    }

    /// Set the apply hook for `create` events.
    pub fn apply_create<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Resource, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), Error>> + Send + 'static,
    {
        if self.apply_create.is_some() {
            panic!("handler already has an apply-create hook");
        }
        self.apply_create = Some(Arc::new(move |r, v| Box::pin(f(r, v))));
        self
    }

    /// Set the apply hook for `delete` events. The hook returns the deleted
    /// resource data, if any, for listener notification.
    pub fn apply_delete<F, Fut>(mut self, f: F) -> Self
    where
        F: Fn(Resource) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Value>, Error>> + Send + 'static,
    {
        if self.apply_delete.is_some() {
            panic!("handler already has an apply-delete hook");
        }
        self.apply_delete = Some(Arc::new(move |r| Box::pin(f(r))));
        self
    }

    // ── Options ─────────────────────────────────────────────────────────

    /// Set the serialization group template. Resources whose expanded group
    /// is equal execute one at a time; the default groups each distinct
    /// resource by itself.
    ///
    /// Template syntax: literal text plus `${name}` references to pattern
    /// placeholders. Validated at registration.
    pub fn group(mut self, template: &str) -> Self {
        if self.group.is_some() {
            panic!("handler already has a group template");
        }
        self.group = Some(template.to_string());
        self
    }

    /// Let requests to this handler run in parallel, bypassing group
    /// serialization.
    pub fn parallel(mut self) -> Self {
        self.parallel = true;
        self
    }

    /// Register a hook invoked once the handler's absolute pattern is known:
    /// immediately when registered on a served router, or at mount time when
    /// registered on a sub-router that is mounted later.
    pub fn on_register<F>(mut self, f: F) -> Self
    where
        F: Fn(Service, String, Arc<Handler>) + Send + Sync + 'static,
    {
        if self.on_register.is_some() {
            panic!("handler already has an on-register hook");
        }
        self.on_register = Some(Arc::new(f));
        self
    }

}

impl std::fmt::Debug for Handler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handler")
            .field("type", &self.typ)
            .field("access", &self.access.is_some())
            .field("get", &self.get.is_some())
            .field("calls", &self.calls.keys().collect::<Vec<_>>())
            .field("auths", &self.auths.keys().collect::<Vec<_>>())
            .field("parallel", &self.parallel)
            .field("group", &self.group)
            .finish()
    }
}
