//! Gateway records and the host/token tables.
//!
//! A [`Gateway`] is created by a module's `start` call and lives as long as
//! the connection that created it (its owner). Routers attach to it through
//! `listen`; each router is a stream-backed endpoint plus the matchers it
//! claims. Closing a router endpoint detaches it; closing the owner removes
//! the gateway from both tables and closes every attached router.

use dweb_core::{DwebError, Endpoint, Request, Result, RouteMatcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tracing::{debug, info};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// What `start` returns to the module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayInfo {
    pub host: String,
    pub token: String,
    /// `http://<host>`
    pub origin: String,
}

/// A router attached to a gateway.
#[derive(Debug, Clone)]
pub struct GatewayRouter {
    pub endpoint: Endpoint,
    pub matchers: Vec<RouteMatcher>,
}

impl GatewayRouter {
    pub fn accepts(&self, request: &Request) -> bool {
        !self.endpoint.is_closed() && self.matchers.iter().any(|m| m.matches(request))
    }
}

#[derive(Debug)]
pub struct Gateway {
    host: String,
    token: String,
    owner_id: u32,
    owner_mmid: String,
    routers: Mutex<Vec<GatewayRouter>>,
}

impl Gateway {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Module that started the gateway.
    pub fn owner_mmid(&self) -> &str {
        &self.owner_mmid
    }

    pub fn info(&self) -> GatewayInfo {
        GatewayInfo {
            host: self.host.clone(),
            token: self.token.clone(),
            origin: format!("http://{}", self.host),
        }
    }

    /// Attach a router; it is detached again when its endpoint closes.
    pub fn attach(self: &Arc<Self>, router: GatewayRouter) {
        let endpoint_id = router.endpoint.id();
        let weak = Arc::downgrade(self);
        router.endpoint.on_close(move |_| {
            if let Some(gateway) = weak.upgrade() {
                gateway.detach(endpoint_id);
            }
        });
        if router.endpoint.is_closed() {
            return;
        }
        info!(
            "Router {} listening on {} ({} matchers)",
            endpoint_id,
            self.host,
            router.matchers.len()
        );
        lock(&self.routers).push(router);
    }

    fn detach(&self, endpoint_id: u32) {
        let mut routers = lock(&self.routers);
        let before = routers.len();
        routers.retain(|r| r.endpoint.id() != endpoint_id);
        if routers.len() != before {
            debug!("Router {} left {}", endpoint_id, self.host);
        }
    }

    pub fn routers(&self) -> Vec<GatewayRouter> {
        lock(&self.routers).clone()
    }

    /// First router, in attach order, whose matchers accept `request`.
    pub fn find(&self, request: &Request) -> Option<GatewayRouter> {
        lock(&self.routers)
            .iter()
            .find(|r| r.accepts(request))
            .cloned()
    }

    fn close(&self, reason: &str) {
        let routers: Vec<GatewayRouter> = lock(&self.routers).drain(..).collect();
        for router in routers {
            router.endpoint.close(reason.to_string());
        }
    }
}

#[derive(Default)]
struct Tables {
    by_host: HashMap<String, Arc<Gateway>>,
    by_token: HashMap<String, Arc<Gateway>>,
}

/// `gatewayByHost` and `gatewayByToken`, kept in step.
#[derive(Default)]
pub struct GatewayTable {
    tables: Mutex<Tables>,
}

impl GatewayTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a gateway for `host`, owned by `owner`.
    ///
    /// Starting an existing host again from the same connection returns the
    /// existing gateway; from any other connection it fails `Forbidden`.
    pub fn create(
        self: &Arc<Self>,
        host: String,
        token: String,
        owner: &Endpoint,
    ) -> Result<Arc<Gateway>> {
        let gateway = {
            let mut tables = lock(&self.tables);
            if let Some(existing) = tables.by_host.get(&host) {
                if existing.owner_id == owner.id() {
                    return Ok(existing.clone());
                }
                return Err(DwebError::Forbidden {
                    message: format!("{} is already served by {}", host, existing.owner_mmid),
                });
            }
            let gateway = Arc::new(Gateway {
                host: host.clone(),
                token: token.clone(),
                owner_id: owner.id(),
                owner_mmid: owner.remote_id().to_string(),
                routers: Mutex::new(Vec::new()),
            });
            tables.by_host.insert(host.clone(), gateway.clone());
            tables.by_token.insert(token, gateway.clone());
            gateway
        };

        let table: Weak<GatewayTable> = Arc::downgrade(self);
        let owner_id = owner.id();
        owner.on_close(move |reason| {
            if let Some(table) = table.upgrade() {
                table.remove_owned(&host, owner_id, reason);
            }
        });
        info!("Gateway {} started by {}", gateway.host, gateway.owner_mmid);
        Ok(gateway)
    }

    pub fn by_host(&self, host: &str) -> Option<Arc<Gateway>> {
        lock(&self.tables).by_host.get(host).cloned()
    }

    pub fn by_token(&self, token: &str) -> Option<Arc<Gateway>> {
        lock(&self.tables).by_token.get(token).cloned()
    }

    /// Gateway for an inbound host key.
    ///
    /// A key with no dot (`api:80`) names only a subdomain; it resolves when
    /// exactly one gateway on that port carries that subdomain.
    pub fn resolve(&self, key: &str) -> Option<Arc<Gateway>> {
        let tables = lock(&self.tables);
        if let Some(gateway) = tables.by_host.get(key) {
            return Some(gateway.clone());
        }
        let (name, port) = key.rsplit_once(':')?;
        if name.contains('.') {
            return None;
        }
        let prefix = format!("{}.", name);
        let suffix = format!(":{}", port);
        let mut matches = tables
            .by_host
            .iter()
            .filter(|(host, _)| host.starts_with(&prefix) && host.ends_with(&suffix));
        match (matches.next(), matches.next()) {
            (Some((_, gateway)), None) => Some(gateway.clone()),
            _ => None,
        }
    }

    /// Remove the gateway for `host` and close its routers.
    pub fn remove(&self, host: &str, reason: &str) -> Option<Arc<Gateway>> {
        let gateway = {
            let mut tables = lock(&self.tables);
            let gateway = tables.by_host.remove(host)?;
            tables.by_token.remove(&gateway.token);
            gateway
        };
        info!("Gateway {} closed: {}", host, reason);
        gateway.close(reason);
        Some(gateway)
    }

    fn remove_owned(&self, host: &str, owner_id: u32, reason: &str) {
        let owned = self
            .by_host(host)
            .is_some_and(|gateway| gateway.owner_id == owner_id);
        if owned {
            self.remove(host, reason);
        }
    }

    /// Remove every gateway.
    pub fn clear(&self, reason: &str) {
        for host in self.hosts() {
            self.remove(&host, reason);
        }
    }

    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = lock(&self.tables).by_host.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn len(&self) -> usize {
        lock(&self.tables).by_host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for GatewayTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayTable")
            .field("hosts", &self.hosts())
            .finish()
    }
}
