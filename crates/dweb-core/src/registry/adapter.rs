//! Connect adapters: how an endpoint pair between two modules is made.
//!
//! The registry keeps an ordered adapter list and asks each in turn; the
//! first one returning a pair wins. Adapters for platform message ports or
//! out-of-process hosts plug in ahead of the built-in in-memory adapter.

use crate::endpoint::{memory_pair, Endpoint, EndpointPair, Role};
use crate::module::{ConnectReason, ModuleRuntime};
use crate::Result;

#[async_trait::async_trait]
pub trait ConnectAdapter: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Build a pair from `from` to `to`, or `None` to let the next adapter try.
    async fn connect(
        &self,
        from: &ModuleRuntime,
        to: &ModuleRuntime,
        reason: &ConnectReason,
    ) -> Result<Option<EndpointPair>>;
}

/// In-process channel between two native modules.
///
/// The caller's end is the client, the target's end is the server.
#[derive(Debug, Default)]
pub struct NativeConnectAdapter;

#[async_trait::async_trait]
impl ConnectAdapter for NativeConnectAdapter {
    fn name(&self) -> &str {
        "native"
    }

    async fn connect(
        &self,
        from: &ModuleRuntime,
        to: &ModuleRuntime,
        _reason: &ConnectReason,
    ) -> Result<Option<EndpointPair>> {
        let (near, far) = memory_pair();
        let near = Endpoint::new(
            near,
            Role::Client,
            from.mmid(),
            to.mmid(),
            &from.manifest().protocols,
        );
        let far = Endpoint::new(
            far,
            Role::Server,
            to.mmid(),
            from.mmid(),
            &to.manifest().protocols,
        );
        Ok(Some(EndpointPair { near, far }))
    }
}
