//! The `dns.sys.dweb` system module.
//!
//! Exposes the registry to connected modules:
//!
//! | Route                     | Result                                  |
//! |---------------------------|-----------------------------------------|
//! | `GET /open?app_id=`       | `{"mmid", "state"}` once running        |
//! | `GET /close?app_id=`      | `true` if the module was running        |
//! | `GET /query?app_id=`      | the installed manifest, 404 if unknown  |
//! | `GET /search?category=`   | manifests carrying that capability      |
//! | `GET /running`            | ids of running modules                  |

use crate::config::RegistryConfig;
use crate::module::{MicroModule, ModuleManifest};
use crate::router::{RouteContext, RouteMatcher, Router};
use crate::{DwebError, Result};
use serde_json::json;

/// Registry front-end module; pre-installed by every registry.
#[derive(Debug, Default)]
pub struct DnsModule;

fn app_id(ctx: &RouteContext) -> Result<String> {
    ctx.request.require_query("app_id")
}

#[async_trait::async_trait]
impl MicroModule for DnsModule {
    fn manifest(&self) -> ModuleManifest {
        ModuleManifest::new(RegistryConfig::DNS_MMID).with_capability("registry")
    }

    fn routes(&self) -> Router {
        Router::new()
            .json(RouteMatcher::get("/open"), |ctx| async move {
                let mmid = app_id(&ctx)?;
                let runtime = ctx.runtime()?.registry()?.open(&mmid).await?;
                Ok(json!({ "mmid": runtime.mmid(), "state": runtime.state() }))
            })
            .json(RouteMatcher::get("/close"), |ctx| async move {
                let mmid = app_id(&ctx)?;
                ctx.runtime()?.registry()?.close(&mmid).await
            })
            .json(RouteMatcher::get("/query"), |ctx| async move {
                let mmid = app_id(&ctx)?;
                ctx.runtime()?
                    .registry()?
                    .query(&mmid)
                    .ok_or_else(|| DwebError::not_found(mmid))
            })
            .json(RouteMatcher::get("/search"), |ctx| async move {
                let category = ctx.request.require_query("category")?;
                Ok(ctx.runtime()?.registry()?.search(&category))
            })
            .json(RouteMatcher::get("/running"), |ctx| async move {
                Ok(ctx.runtime()?.registry()?.running_ids())
            })
    }
}
