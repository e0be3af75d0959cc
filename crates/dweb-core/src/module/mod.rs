//! The module contract.
//!
//! A module is anything implementing [`MicroModule`]: a manifest, an optional
//! route table, and lifecycle hooks. The registry installs modules, starts
//! them on demand and hands each new inbound endpoint to `connected`.

mod manifest;
mod runtime;

pub use manifest::{ModuleId, ModuleManifest};
pub use runtime::{Module, ModuleRuntime, ModuleState};

use crate::endpoint::Endpoint;
use crate::router::Router;
use crate::Result;
use serde::{Deserialize, Serialize};

/// Why a connection was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectReason {
    /// Ordinary module-to-module traffic.
    #[default]
    Request,
    /// Delivering a deep link.
    Deeplink,
    /// Opened by the HTTP gateway.
    Gateway,
}

/// Behavior of a module.
///
/// Every hook has a default, so a module that only serves routes implements
/// `manifest` and `routes`.
#[async_trait::async_trait]
pub trait MicroModule: Send + Sync + 'static {
    fn manifest(&self) -> ModuleManifest;

    /// Routes served on every endpoint connected to this module.
    fn routes(&self) -> Router {
        Router::new()
    }

    /// Called once per bootstrap, before the module counts as running.
    async fn start(&self, _runtime: &ModuleRuntime) -> Result<()> {
        Ok(())
    }

    /// Called once for every new inbound endpoint.
    ///
    /// If this hook does not `serve` the endpoint itself, the registry serves
    /// it with the module's router afterwards.
    async fn connected(
        &self,
        _runtime: &ModuleRuntime,
        _endpoint: &Endpoint,
        _reason: &ConnectReason,
    ) -> Result<()> {
        Ok(())
    }

    /// Called on shutdown, before the module's endpoints are closed.
    async fn stop(&self, _runtime: &ModuleRuntime) -> Result<()> {
        Ok(())
    }
}
