//! Installed modules and their running instances.
//!
//! A [`Module`] pairs a manifest with the behavior behind it and a lifecycle
//! guard. `bootstrap` produces a [`ModuleRuntime`], the handle a running
//! module uses to reach the rest of the system and through which the registry
//! tracks the module's endpoints.

use super::manifest::ModuleManifest;
use super::{ConnectReason, MicroModule};
use crate::endpoint::{Endpoint, Request, RequestHandler, Response};
use crate::registry::{Registry, WeakRegistry};
use crate::router::{RouteContext, Router};
use crate::{DwebError, Result};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, error, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Lifecycle of a module instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ModuleState {
    NotRunning,
    Starting,
    Running,
    Stopping,
}

/// An installed module.
#[derive(Clone)]
pub struct Module {
    manifest: ModuleManifest,
    behavior: Arc<dyn MicroModule>,
    state: Arc<Mutex<ModuleState>>,
}

impl Module {
    pub fn new(behavior: Arc<dyn MicroModule>) -> Self {
        Self {
            manifest: behavior.manifest(),
            behavior,
            state: Arc::new(Mutex::new(ModuleState::NotRunning)),
        }
    }

    pub fn mmid(&self) -> &str {
        &self.manifest.mmid
    }

    pub fn manifest(&self) -> &ModuleManifest {
        &self.manifest
    }

    pub fn state(&self) -> ModuleState {
        *lock(&self.state)
    }

    /// Start the module.
    ///
    /// Fails `AlreadyRunning` unless the module is `NotRunning`. A failed or
    /// panicking `start` leaves it `NotRunning` again.
    pub async fn bootstrap(&self, registry: WeakRegistry) -> Result<ModuleRuntime> {
        {
            let mut state = lock(&self.state);
            if *state != ModuleState::NotRunning {
                return Err(DwebError::AlreadyRunning {
                    mmid: self.mmid().to_string(),
                });
            }
            *state = ModuleState::Starting;
        }
        info!("Starting module {}", self.mmid());

        let runtime = ModuleRuntime::new(self.clone(), registry);
        let started = AssertUnwindSafe(self.behavior.start(&runtime))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(DwebError::Other("module start panicked".into())));

        if let Err(e) = started {
            error!("Module {} failed to start: {}", self.mmid(), e);
            *lock(&self.state) = ModuleState::NotRunning;
            return Err(e);
        }

        *lock(&self.state) = ModuleState::Running;
        info!("Module {} running", self.mmid());
        Ok(runtime)
    }
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("mmid", &self.mmid())
            .field("state", &self.state())
            .finish()
    }
}

type ShutdownHook = Box<dyn FnOnce(&ModuleRuntime) + Send>;

struct RuntimeInner {
    module: Module,
    registry: WeakRegistry,
    router: Mutex<Arc<Router>>,
    endpoints: Mutex<HashMap<u32, Endpoint>>,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
}

/// Handle to a running module.
#[derive(Clone)]
pub struct ModuleRuntime {
    inner: Arc<RuntimeInner>,
}

impl ModuleRuntime {
    fn new(module: Module, registry: WeakRegistry) -> Self {
        let router = Arc::new(module.behavior.routes());
        Self {
            inner: Arc::new(RuntimeInner {
                module,
                registry,
                router: Mutex::new(router),
                endpoints: Mutex::new(HashMap::new()),
                shutdown_hooks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn mmid(&self) -> &str {
        self.inner.module.mmid()
    }

    pub fn manifest(&self) -> &ModuleManifest {
        self.inner.module.manifest()
    }

    pub fn state(&self) -> ModuleState {
        self.inner.module.state()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), ModuleState::Starting | ModuleState::Running)
    }

    /// True if both handles refer to the same running instance.
    pub fn same_instance(&self, other: &ModuleRuntime) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// The registry that started this module.
    pub fn registry(&self) -> Result<Registry> {
        self.inner
            .registry
            .upgrade()
            .ok_or_else(|| DwebError::Other("registry is gone".into()))
    }

    pub(crate) fn behavior(&self) -> &Arc<dyn MicroModule> {
        &self.inner.module.behavior
    }

    /// Routes served on this module's endpoints.
    pub fn router(&self) -> Arc<Router> {
        lock(&self.inner.router).clone()
    }

    /// Append routes, e.g. ones that depend on state built in `start`.
    pub fn add_routes(&self, routes: Router) {
        let mut router = lock(&self.inner.router);
        let merged = (**router).clone().merge(routes);
        *router = Arc::new(merged);
    }

    /// Request handler that serves this module's router.
    pub fn handler(&self) -> Arc<dyn RequestHandler> {
        Arc::new(RuntimeHandler {
            runtime: Arc::downgrade(&self.inner),
        })
    }

    /// Connect to another module (or to this one).
    pub async fn connect(&self, to: &str) -> Result<Endpoint> {
        self.connect_with(to, ConnectReason::Request).await
    }

    pub async fn connect_with(&self, to: &str, reason: ConnectReason) -> Result<Endpoint> {
        self.registry()?.connect(self, to, reason).await
    }

    /// Outbound fetch through the registry's fetch adapters.
    pub async fn native_fetch(&self, request: Request) -> Result<Response> {
        self.registry()?.native_fetch(self, request).await
    }

    /// Shorthand for a GET through [`native_fetch`](Self::native_fetch).
    pub async fn fetch(&self, url: &str) -> Result<Response> {
        self.native_fetch(Request::get(url)?).await
    }

    /// Endpoints currently owned by this module.
    pub fn endpoints(&self) -> Vec<Endpoint> {
        lock(&self.inner.endpoints).values().cloned().collect()
    }

    /// Take ownership of `endpoint`; it is closed when the module stops.
    pub fn attach(&self, endpoint: &Endpoint) {
        if !self.is_running() {
            endpoint.close(format!("{} is not running", self.mmid()));
            return;
        }
        lock(&self.inner.endpoints).insert(endpoint.id(), endpoint.clone());
        let runtime = Arc::downgrade(&self.inner);
        let id = endpoint.id();
        endpoint.on_close(move |_| {
            if let Some(inner) = runtime.upgrade() {
                lock(&inner.endpoints).remove(&id);
            }
        });
    }

    /// Run `hook` after this runtime shuts down.
    pub fn on_shutdown(&self, hook: impl FnOnce(&ModuleRuntime) + Send + 'static) {
        lock(&self.inner.shutdown_hooks).push(Box::new(hook));
    }

    /// Stop the module, close every endpoint it owns and run shutdown hooks.
    ///
    /// Fails `AlreadyShutdown` unless the module is `Running`. Cleanup runs
    /// even when the module's own `stop` fails; that failure is returned.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let mut state = lock(&self.inner.module.state);
            if *state != ModuleState::Running {
                return Err(DwebError::AlreadyShutdown {
                    mmid: self.mmid().to_string(),
                });
            }
            *state = ModuleState::Stopping;
        }
        info!("Stopping module {}", self.mmid());

        let stopped = self.behavior().stop(self).await;
        if let Err(e) = &stopped {
            error!("Module {} stop failed: {}", self.mmid(), e);
        }

        let endpoints: Vec<Endpoint> = lock(&self.inner.endpoints)
            .drain()
            .map(|(_, endpoint)| endpoint)
            .collect();
        debug!("Module {} closing {} endpoints", self.mmid(), endpoints.len());
        for endpoint in endpoints {
            endpoint.close(format!("{} shutdown", self.mmid()));
        }

        let hooks: Vec<ShutdownHook> = lock(&self.inner.shutdown_hooks).drain(..).collect();
        for hook in hooks {
            hook(self);
        }

        *lock(&self.inner.module.state) = ModuleState::NotRunning;
        info!("Module {} stopped", self.mmid());
        stopped
    }
}

impl std::fmt::Debug for ModuleRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleRuntime")
            .field("mmid", &self.mmid())
            .field("state", &self.state())
            .finish()
    }
}

/// Serves a runtime's router, with the runtime in the route context.
struct RuntimeHandler {
    runtime: Weak<RuntimeInner>,
}

#[async_trait::async_trait]
impl RequestHandler for RuntimeHandler {
    async fn handle(&self, request: Request, endpoint: &Endpoint) -> Result<Response> {
        let inner = self.runtime.upgrade().ok_or_else(|| DwebError::EndpointClosed {
            endpoint_id: endpoint.id(),
            reason: "module stopped".to_string(),
        })?;
        let runtime = ModuleRuntime { inner };
        let router = runtime.router();
        Ok(router
            .dispatch(RouteContext {
                request,
                endpoint: endpoint.clone(),
                runtime: Some(runtime),
            })
            .await)
    }
}
