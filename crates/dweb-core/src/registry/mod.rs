//! The module registry ("DNS").
//!
//! Installs modules, boots them on demand, brokers connections between them
//! and tears them down.
//!
//! # Concurrency
//!
//! `open` and `connect` deduplicate concurrent identical calls with pending
//! markers instead of a coarse lock: the first caller inserts a shared future
//! (driven by a spawned task) into the map before any work starts, and every
//! later caller awaits that same future. The spawned task replaces the marker
//! with the resolved value, or removes it on failure. Map locks are never
//! held across an await.
//!
//! `close` registers its shutdown as a stopping marker in the same critical
//! section that removes the running entry, so an `open` racing a `close`
//! waits for the stop and then boots a fresh instance.
//!
//! A module whose bootstrap never finishes blocks every `open` of its id;
//! callers that cannot tolerate that apply their own timeout.

pub mod adapter;
pub mod dns;
pub mod fetch;

pub use adapter::{ConnectAdapter, NativeConnectAdapter};
pub use dns::DnsModule;
pub use fetch::{DataUriFetch, FetchAdapter, LocalFileFetch, ModuleFileFetch, NetworkFetcher};

use crate::config::RegistryConfig;
use crate::endpoint::{Endpoint, EndpointPair, Request, Response};
use crate::module::{
    ConnectReason, MicroModule, Module, ModuleId, ModuleManifest, ModuleRuntime,
};
use crate::{DwebError, Result};
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use tracing::{debug, error, info, warn};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

type SharedResult<T> = Shared<BoxFuture<'static, Result<T>>>;

/// Map entry: resolved, or in progress with a future to await.
enum Slot<T: Clone> {
    Pending { generation: u64, future: SharedResult<T> },
    Ready(T),
}

/// Unordered module pair; `connect(a, b)` and `connect(b, a)` share one entry.
type ConnectionKey = (ModuleId, ModuleId);

fn connection_key(a: &str, b: &str) -> ConnectionKey {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

/// The end of `pair` owned by `mmid`.
fn end_for(pair: &EndpointPair, mmid: &str) -> Endpoint {
    if pair.near.local_id() == mmid {
        pair.near.clone()
    } else {
        pair.far.clone()
    }
}

enum OpenStep {
    Boot(SharedResult<ModuleRuntime>),
    AwaitStop(SharedResult<bool>),
}

struct RegistryInner {
    installed: RwLock<HashMap<ModuleId, Module>>,
    running: Mutex<HashMap<ModuleId, Slot<ModuleRuntime>>>,
    /// Shutdowns in flight, keyed by id. Locked after `running`, never before.
    stopping: Mutex<HashMap<ModuleId, (u64, SharedResult<bool>)>>,
    connections: Mutex<HashMap<ConnectionKey, Slot<EndpointPair>>>,
    connect_adapters: RwLock<Vec<Arc<dyn ConnectAdapter>>>,
    fetch_adapters: RwLock<Vec<Arc<dyn FetchAdapter>>>,
    network: NetworkFetcher,
    generation: AtomicU64,
}

/// Registry handle. Cheap to clone; each `Registry::new` is isolated.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

/// Non-owning registry handle held by module runtimes.
#[derive(Clone)]
pub struct WeakRegistry {
    inner: Weak<RegistryInner>,
}

impl WeakRegistry {
    pub fn upgrade(&self) -> Option<Registry> {
        self.inner.upgrade().map(|inner| Registry { inner })
    }
}

impl Registry {
    /// Create a registry with `dns.sys.dweb` installed and the built-in
    /// connect and fetch adapters registered.
    pub fn new() -> Result<Self> {
        let registry = Self {
            inner: Arc::new(RegistryInner {
                installed: RwLock::new(HashMap::new()),
                running: Mutex::new(HashMap::new()),
                stopping: Mutex::new(HashMap::new()),
                connections: Mutex::new(HashMap::new()),
                connect_adapters: RwLock::new(vec![Arc::new(NativeConnectAdapter)]),
                fetch_adapters: RwLock::new(vec![
                    Arc::new(DataUriFetch),
                    Arc::new(ModuleFileFetch),
                    Arc::new(LocalFileFetch),
                ]),
                network: NetworkFetcher::new()?,
                generation: AtomicU64::new(1),
            }),
        };
        registry.install(Arc::new(DnsModule));
        Ok(registry)
    }

    pub fn downgrade(&self) -> WeakRegistry {
        WeakRegistry {
            inner: Arc::downgrade(&self.inner),
        }
    }

    // ========================================================================
    // Installation
    // ========================================================================

    /// Install a module. Installing an id twice keeps the first module.
    pub fn install(&self, behavior: Arc<dyn MicroModule>) -> ModuleManifest {
        let module = Module::new(behavior);
        let mut installed = write(&self.inner.installed);
        let entry = installed
            .entry(module.mmid().to_string())
            .or_insert_with(|| {
                debug!("Installed {}", module.mmid());
                module
            });
        entry.manifest().clone()
    }

    /// Remove a module from the installed set.
    ///
    /// A running instance keeps running until closed explicitly.
    pub fn uninstall(&self, mmid: &str) -> bool {
        let removed = write(&self.inner.installed).remove(mmid).is_some();
        if removed {
            debug!("Uninstalled {}", mmid);
        }
        removed
    }

    pub fn is_installed(&self, mmid: &str) -> bool {
        read(&self.inner.installed).contains_key(mmid)
    }

    /// Manifest of an installed module.
    pub fn query(&self, mmid: &str) -> Option<ModuleManifest> {
        read(&self.inner.installed)
            .get(mmid)
            .map(|m| m.manifest().clone())
    }

    /// Manifests of installed modules carrying `capability`, sorted by id.
    pub fn search(&self, capability: &str) -> Vec<ModuleManifest> {
        let mut found: Vec<ModuleManifest> = read(&self.inner.installed)
            .values()
            .filter(|m| m.manifest().has_capability(capability))
            .map(|m| m.manifest().clone())
            .collect();
        found.sort_by(|a, b| a.mmid.cmp(&b.mmid));
        found
    }

    pub fn installed_ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = read(&self.inner.installed).keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Ids of modules that finished booting, sorted.
    pub fn running_ids(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = lock(&self.inner.running)
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Ready(_)))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn is_running(&self, mmid: &str) -> bool {
        matches!(lock(&self.inner.running).get(mmid), Some(Slot::Ready(_)))
    }

    // ========================================================================
    // Adapter chains
    // ========================================================================

    /// Put a connect adapter ahead of every existing one.
    pub fn prepend_connect_adapter(&self, adapter: Arc<dyn ConnectAdapter>) {
        write(&self.inner.connect_adapters).insert(0, adapter);
    }

    pub fn add_connect_adapter(&self, adapter: Arc<dyn ConnectAdapter>) {
        write(&self.inner.connect_adapters).push(adapter);
    }

    /// Remove every connect adapter, the built-in one included.
    ///
    /// Until one is added again every new connection fails `ConnectionRefused`.
    pub fn clear_connect_adapters(&self) -> Vec<Arc<dyn ConnectAdapter>> {
        std::mem::take(&mut *write(&self.inner.connect_adapters))
    }

    /// Names of the connect adapters, in the order they are tried.
    pub fn connect_adapter_names(&self) -> Vec<String> {
        read(&self.inner.connect_adapters)
            .iter()
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Put a fetch adapter ahead of the built-in ones.
    pub fn add_fetch_adapter(&self, adapter: Arc<dyn FetchAdapter>) {
        write(&self.inner.fetch_adapters).insert(0, adapter);
    }

    // ========================================================================
    // open / close
    // ========================================================================

    /// Return the running instance of `mmid`, booting it if needed.
    ///
    /// Concurrent calls for the same id share one bootstrap. A call that
    /// arrives while the module is being closed waits for the stop, then
    /// boots a new instance.
    pub async fn open(&self, mmid: &str) -> Result<ModuleRuntime> {
        loop {
            let step = {
                let mut running = lock(&self.inner.running);
                match running.get(mmid) {
                    Some(Slot::Ready(runtime)) => return Ok(runtime.clone()),
                    Some(Slot::Pending { future, .. }) => OpenStep::Boot(future.clone()),
                    None => {
                        let stopping = lock(&self.inner.stopping)
                            .get(mmid)
                            .map(|(_, future)| future.clone());
                        match stopping {
                            Some(future) => OpenStep::AwaitStop(future),
                            None => {
                                let module = read(&self.inner.installed)
                                    .get(mmid)
                                    .cloned()
                                    .ok_or_else(|| DwebError::not_found(mmid))?;
                                let generation =
                                    self.inner.generation.fetch_add(1, Ordering::Relaxed);
                                let future = self.spawn_bootstrap(module, generation);
                                running.insert(
                                    mmid.to_string(),
                                    Slot::Pending {
                                        generation,
                                        future: future.clone(),
                                    },
                                );
                                OpenStep::Boot(future)
                            }
                        }
                    }
                }
            };
            match step {
                OpenStep::Boot(future) => return future.await,
                OpenStep::AwaitStop(future) => {
                    debug!("Open {} waiting for close to finish", mmid);
                    let _ = future.await;
                }
            }
        }
    }

    fn spawn_bootstrap(&self, module: Module, generation: u64) -> SharedResult<ModuleRuntime> {
        let weak = self.downgrade();
        let task = tokio::spawn(async move {
            let mmid = module.mmid().to_string();
            let result = module.bootstrap(weak.clone()).await;
            if let Some(registry) = weak.upgrade() {
                registry.settle_open(&mmid, generation, &result);
            }
            result
        });
        task.map(|joined| {
            joined.unwrap_or_else(|e| Err(DwebError::Other(format!("bootstrap task failed: {}", e))))
        })
        .boxed()
        .shared()
    }

    /// Replace this bootstrap's pending marker, unless `close` already took it.
    fn settle_open(&self, mmid: &str, generation: u64, result: &Result<ModuleRuntime>) {
        let mut running = lock(&self.inner.running);
        let ours = matches!(
            running.get(mmid),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );
        if !ours {
            return;
        }
        match result {
            Ok(runtime) => {
                running.insert(mmid.to_string(), Slot::Ready(runtime.clone()));
                drop(running);
                let weak = self.downgrade();
                // Evict the entry when the module shuts itself down.
                runtime.on_shutdown(move |stopped| {
                    if let Some(registry) = weak.upgrade() {
                        registry.evict_running(stopped);
                    }
                });
            }
            Err(e) => {
                running.remove(mmid);
                warn!("Open {} failed: {}", mmid, e);
            }
        }
    }

    fn evict_running(&self, stopped: &ModuleRuntime) {
        let mut running = lock(&self.inner.running);
        let same = matches!(
            running.get(stopped.mmid()),
            Some(Slot::Ready(current)) if current.same_instance(stopped)
        );
        if same {
            running.remove(stopped.mmid());
            debug!("Evicted stopped module {}", stopped.mmid());
        }
    }

    /// Stop a running module.
    ///
    /// Returns `Ok(false)` if it was not running. The entry is removed before
    /// shutdown starts, so concurrent closes see it as already closed and a
    /// failed shutdown is not retried. A close during a pending `open` waits
    /// for the bootstrap and stops the fresh instance.
    pub async fn close(&self, mmid: &str) -> Result<bool> {
        let stopping = {
            let mut running = lock(&self.inner.running);
            let target = match running.remove(mmid) {
                None => return Ok(false),
                Some(Slot::Ready(runtime)) => futures::future::ready(Ok(runtime)).boxed(),
                Some(Slot::Pending { future, .. }) => future.boxed(),
            };
            self.spawn_stop(mmid, target)
        };
        stopping.await
    }

    /// Run a shutdown in its own task, visible to `open` until it finishes.
    ///
    /// Called with the `running` lock held.
    fn spawn_stop(
        &self,
        mmid: &str,
        target: BoxFuture<'static, Result<ModuleRuntime>>,
    ) -> SharedResult<bool> {
        let mut stopping = lock(&self.inner.stopping);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        let weak = self.downgrade();
        let key = mmid.to_string();
        let task = tokio::spawn(async move {
            let result = match target.await {
                Ok(runtime) => stop_runtime(&runtime).await,
                Err(_) => Ok(false),
            };
            if let Some(registry) = weak.upgrade() {
                registry.settle_stop(&key, generation);
            }
            result
        });
        let future = task
            .map(|joined| {
                joined.unwrap_or_else(|e| Err(DwebError::Other(format!("close task failed: {}", e))))
            })
            .boxed()
            .shared();
        stopping.insert(mmid.to_string(), (generation, future.clone()));
        future
    }

    fn settle_stop(&self, mmid: &str, generation: u64) {
        let mut stopping = lock(&self.inner.stopping);
        if matches!(stopping.get(mmid), Some((g, _)) if *g == generation) {
            stopping.remove(mmid);
        }
    }

    /// Close every running module.
    pub async fn close_all(&self) {
        let ids: Vec<ModuleId> = lock(&self.inner.running).keys().cloned().collect();
        for mmid in ids {
            if let Err(e) = self.close(&mmid).await {
                warn!("Failed to close {}: {}", mmid, e);
            }
        }
    }

    // ========================================================================
    // connect
    // ========================================================================

    /// Connect `from` to `to`, returning `from`'s end.
    ///
    /// Boots `to` if needed. Concurrent calls for the same pair, in either
    /// direction, share one adapter invocation; the pair stays cached until
    /// either end closes.
    pub async fn connect(
        &self,
        from: &ModuleRuntime,
        to: &str,
        reason: ConnectReason,
    ) -> Result<Endpoint> {
        let target = if from.mmid() == to {
            from.clone()
        } else {
            self.open(to).await?
        };

        let key = connection_key(from.mmid(), to);
        let future = {
            let mut connections = lock(&self.inner.connections);
            match connections.get(&key) {
                Some(Slot::Ready(pair)) if !pair.near.is_closed() => {
                    return Ok(end_for(pair, from.mmid()));
                }
                Some(Slot::Pending { future, .. }) => future.clone(),
                _ => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
                    let future =
                        self.spawn_connect(from.clone(), target, reason, key.clone(), generation);
                    connections.insert(
                        key,
                        Slot::Pending {
                            generation,
                            future: future.clone(),
                        },
                    );
                    future
                }
            }
        };
        future.await.map(|pair| end_for(&pair, from.mmid()))
    }

    fn spawn_connect(
        &self,
        from: ModuleRuntime,
        to: ModuleRuntime,
        reason: ConnectReason,
        key: ConnectionKey,
        generation: u64,
    ) -> SharedResult<EndpointPair> {
        let registry = self.clone();
        let task = tokio::spawn(async move {
            let result = registry.establish(&from, &to, &reason).await;
            registry.settle_connect(&key, generation, &result);
            result
        });
        task.map(|joined| {
            joined.unwrap_or_else(|e| Err(DwebError::Other(format!("connect task failed: {}", e))))
        })
        .boxed()
        .shared()
    }

    /// Run the adapter chain and hand the far end to the target module.
    async fn establish(
        &self,
        from: &ModuleRuntime,
        to: &ModuleRuntime,
        reason: &ConnectReason,
    ) -> Result<EndpointPair> {
        let adapters: Vec<Arc<dyn ConnectAdapter>> = read(&self.inner.connect_adapters).clone();
        let mut made = None;
        for adapter in adapters {
            if let Some(pair) = adapter.connect(from, to, reason).await? {
                debug!(
                    "Adapter {} connected {} -> {}",
                    adapter.name(),
                    from.mmid(),
                    to.mmid()
                );
                made = Some(pair);
                break;
            }
        }
        let pair = made.ok_or_else(|| DwebError::ConnectionRefused {
            from: from.mmid().to_string(),
            to: to.mmid().to_string(),
        })?;

        from.attach(&pair.near);
        to.attach(&pair.far);

        if let Err(e) = to.behavior().connected(to, &pair.far, reason).await {
            pair.near.close(format!("{} rejected connection: {}", to.mmid(), e));
            return Err(e);
        }
        if !pair.far.is_serving() {
            pair.far.serve(to.handler());
        }
        if !pair.near.is_serving() {
            pair.near.serve(from.handler());
        }

        info!("Connected {} -> {} ({:?})", from.mmid(), to.mmid(), reason);
        Ok(pair)
    }

    fn settle_connect(&self, key: &ConnectionKey, generation: u64, result: &Result<EndpointPair>) {
        let mut connections = lock(&self.inner.connections);
        let ours = matches!(
            connections.get(key),
            Some(Slot::Pending { generation: g, .. }) if *g == generation
        );
        if !ours {
            return;
        }
        let pair = match result {
            Ok(pair) => pair.clone(),
            Err(e) => {
                connections.remove(key);
                warn!("Connect {} <-> {} failed: {}", key.0, key.1, e);
                return;
            }
        };
        connections.insert(key.clone(), Slot::Ready(pair.clone()));
        drop(connections);

        for endpoint in [&pair.near, &pair.far] {
            let weak = self.downgrade();
            let key = key.clone();
            let near_id = pair.near.id();
            endpoint.on_close(move |_| {
                if let Some(registry) = weak.upgrade() {
                    registry.evict_connection(&key, near_id);
                }
            });
        }
    }

    /// Drop the cache entry if it still points at the closed pair.
    fn evict_connection(&self, key: &ConnectionKey, near_id: u32) {
        let mut connections = lock(&self.inner.connections);
        let stale = matches!(
            connections.get(key),
            Some(Slot::Ready(pair)) if pair.near.id() == near_id
        );
        if stale {
            connections.remove(key);
        }
    }

    // ========================================================================
    // nativeFetch and deep links
    // ========================================================================

    /// Resolve an outbound request through the fetch adapters, then the network.
    pub async fn native_fetch(&self, from: &ModuleRuntime, request: Request) -> Result<Response> {
        let adapter = read(&self.inner.fetch_adapters)
            .iter()
            .find(|a| a.matches(&request))
            .cloned();
        match adapter {
            Some(adapter) => {
                debug!("{} fetch via {}: {}", from.mmid(), adapter.name(), request.url);
                adapter.fetch(self, from, request).await
            }
            None => self.inner.network.fetch(request).await,
        }
    }

    /// Deliver a deep link to every installed module declaring a matching
    /// prefix. Returns how many modules answered with success.
    pub async fn dispatch_deeplink(&self, url: &str) -> Result<usize> {
        let targets: Vec<ModuleId> = read(&self.inner.installed)
            .values()
            .filter(|m| m.manifest().matches_deeplink(url))
            .map(|m| m.mmid().to_string())
            .collect();
        if targets.is_empty() {
            debug!("No module accepts deep link {}", url);
            return Ok(0);
        }

        let dns = self.open(RegistryConfig::DNS_MMID).await?;
        let mut accepted = 0;
        for mmid in targets {
            let outcome = async {
                let endpoint = self.connect(&dns, &mmid, ConnectReason::Deeplink).await?;
                endpoint.request(Request::get(url)?).await
            }
            .await;
            match outcome {
                Ok(response) if response.is_success() => accepted += 1,
                Ok(response) => warn!("{} answered deep link with {}", mmid, response.status),
                Err(e) => warn!("Deep link to {} failed: {}", mmid, e),
            }
        }
        info!("Deep link {} accepted by {} module(s)", url, accepted);
        Ok(accepted)
    }
}

async fn stop_runtime(runtime: &ModuleRuntime) -> Result<bool> {
    match runtime.shutdown().await {
        Ok(()) => Ok(true),
        Err(DwebError::AlreadyShutdown { .. }) => Ok(false),
        Err(e) => {
            error!("Close {} failed: {}", runtime.mmid(), e);
            Err(e)
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("installed", &self.installed_ids())
            .field("running", &self.running_ids())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::{RouteMatcher, Router};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct Counted {
        mmid: &'static str,
        starts: Arc<AtomicUsize>,
    }

    #[async_trait::async_trait]
    impl MicroModule for Counted {
        fn manifest(&self) -> ModuleManifest {
            ModuleManifest::new(self.mmid).with_capability("test")
        }

        fn routes(&self) -> Router {
            Router::new().text(RouteMatcher::get("/ping"), |_| async { Ok("pong".to_string()) })
        }

        async fn start(&self, _runtime: &ModuleRuntime) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        }
    }

    fn counted(registry: &Registry, mmid: &'static str) -> Arc<AtomicUsize> {
        let starts = Arc::new(AtomicUsize::new(0));
        registry.install(Arc::new(Counted {
            mmid,
            starts: starts.clone(),
        }));
        starts
    }

    #[tokio::test]
    async fn test_new_installs_dns() {
        let registry = Registry::new().unwrap();
        assert!(registry.is_installed(RegistryConfig::DNS_MMID));
        assert_eq!(registry.search("registry").len(), 1);
    }

    #[tokio::test]
    async fn test_open_unknown_is_not_found() {
        let registry = Registry::new().unwrap();
        let err = registry.open("ghost.dweb").await.unwrap_err();
        assert!(matches!(err, DwebError::NotFound { .. }));
        assert!(registry.running_ids().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_open_boots_once() {
        let registry = Registry::new().unwrap();
        let starts = counted(&registry, "a.test.dweb");

        let opens = (0..8).map(|_| {
            let registry = registry.clone();
            async move { registry.open("a.test.dweb").await.unwrap() }
        });
        let runtimes = futures::future::join_all(opens).await;

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(runtimes.windows(2).all(|w| w[0].same_instance(&w[1])));
        assert_eq!(registry.running_ids(), vec!["a.test.dweb".to_string()]);
    }

    #[tokio::test]
    async fn test_close_then_reopen_boots_again() {
        let registry = Registry::new().unwrap();
        let starts = counted(&registry, "a.test.dweb");

        registry.open("a.test.dweb").await.unwrap();
        assert!(registry.close("a.test.dweb").await.unwrap());
        assert!(!registry.close("a.test.dweb").await.unwrap());
        registry.open("a.test.dweb").await.unwrap();
        assert_eq!(starts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_uninstall_keeps_running_instance() {
        let registry = Registry::new().unwrap();
        counted(&registry, "a.test.dweb");
        registry.open("a.test.dweb").await.unwrap();

        assert!(registry.uninstall("a.test.dweb"));
        assert!(registry.is_running("a.test.dweb"));
        assert!(registry.open("a.test.dweb").await.is_ok());

        assert!(registry.close("a.test.dweb").await.unwrap());
        assert!(matches!(
            registry.open("a.test.dweb").await,
            Err(DwebError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_self_shutdown_evicts_running_entry() {
        let registry = Registry::new().unwrap();
        counted(&registry, "a.test.dweb");
        let runtime = registry.open("a.test.dweb").await.unwrap();
        runtime.shutdown().await.unwrap();
        assert!(!registry.is_running("a.test.dweb"));
    }

    #[tokio::test]
    async fn test_self_connect() {
        let registry = Registry::new().unwrap();
        counted(&registry, "a.test.dweb");
        let runtime = registry.open("a.test.dweb").await.unwrap();
        let endpoint = runtime.connect("a.test.dweb").await.unwrap();
        let res = endpoint.fetch("/ping").await.unwrap();
        assert_eq!(res.body.into_text().await.unwrap(), "pong");
    }

    #[tokio::test]
    async fn test_connect_is_cached_both_ways() {
        let registry = Registry::new().unwrap();
        counted(&registry, "a.test.dweb");
        counted(&registry, "b.test.dweb");
        let a = registry.open("a.test.dweb").await.unwrap();
        let b = registry.open("b.test.dweb").await.unwrap();

        let a_to_b = a.connect("b.test.dweb").await.unwrap();
        let again = a.connect("b.test.dweb").await.unwrap();
        assert_eq!(a_to_b.id(), again.id());

        let b_to_a = b.connect("a.test.dweb").await.unwrap();
        assert_eq!(b_to_a.remote_id(), "a.test.dweb");
        assert_ne!(b_to_a.id(), a_to_b.id());
        let res = b_to_a.fetch("/ping").await.unwrap();
        assert_eq!(res.status, 200);
    }

    #[tokio::test]
    async fn test_native_fetch_data_and_module_urls() {
        let registry = Registry::new().unwrap();
        counted(&registry, "a.test.dweb");
        counted(&registry, "b.test.dweb");
        let a = registry.open("a.test.dweb").await.unwrap();

        let data = a.fetch("data:text/plain,hi%21").await.unwrap();
        assert_eq!(data.body.into_text().await.unwrap(), "hi!");

        let module = a.fetch("file://b.test.dweb/ping").await.unwrap();
        assert_eq!(module.body.into_text().await.unwrap(), "pong");
        assert!(registry.is_running("b.test.dweb"));
    }

    #[tokio::test]
    async fn test_native_fetch_local_file() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let dir = temp_dir.path();
        let file = dir.join("note.txt");
        std::fs::write(&file, "on disk").unwrap();

        let registry = Registry::new().unwrap();
        counted(&registry, "a.test.dweb");
        let a = registry.open("a.test.dweb").await.unwrap();
        let url = url::Url::from_file_path(&file).unwrap();
        let res = a.fetch(url.as_str()).await.unwrap();
        assert_eq!(res.headers.get("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(res.body.into_text().await.unwrap(), "on disk");

        let missing = url::Url::from_file_path(dir.join("absent.txt")).unwrap();
        assert_eq!(a.fetch(missing.as_str()).await.unwrap().status, 404);
    }

    #[tokio::test]
    async fn test_dns_routes() {
        let registry = Registry::new().unwrap();
        counted(&registry, "a.test.dweb");
        counted(&registry, "b.test.dweb");
        let a = registry.open("a.test.dweb").await.unwrap();
        let dns = a.connect(RegistryConfig::DNS_MMID).await.unwrap();

        let opened: serde_json::Value = dns
            .fetch("/open?app_id=b.test.dweb")
            .await
            .unwrap()
            .body
            .into_json()
            .await
            .unwrap();
        assert_eq!(opened["mmid"], "b.test.dweb");
        assert_eq!(opened["state"], "running");

        let found: Vec<ModuleManifest> = dns
            .fetch("/search?category=test")
            .await
            .unwrap()
            .body
            .into_json()
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        assert_eq!(dns.fetch("/query?app_id=nope.dweb").await.unwrap().status, 404);
        assert_eq!(dns.fetch("/open").await.unwrap().status, 400);

        let closed: bool = dns
            .fetch("/close?app_id=b.test.dweb")
            .await
            .unwrap()
            .body
            .into_json()
            .await
            .unwrap();
        assert!(closed);
        assert!(!registry.is_running("b.test.dweb"));
    }
}
