//! Per-module route tables.
//!
//! A [`Router`] is an ordered list of matchers and handlers. The first entry
//! whose matcher accepts the request runs; no match yields `404`, a failing
//! handler yields the error's status (500 for generic failures). Exactly one
//! response is produced per request.

use crate::endpoint::{Endpoint, Request, RequestHandler, Response};
use crate::module::ModuleRuntime;
use crate::Result;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error};

/// How a matcher compares the request path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchMode {
    #[default]
    Full,
    Prefix,
}

/// Structural request matcher. Serializable so it can cross the gateway
/// `listen` handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMatcher {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub pathname: String,
    #[serde(default)]
    pub match_mode: MatchMode,
    /// URL scheme, e.g. `http` or `file`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

impl RouteMatcher {
    /// Match `pathname` exactly, any method.
    pub fn new(pathname: impl Into<String>) -> Self {
        Self {
            method: None,
            pathname: pathname.into(),
            match_mode: MatchMode::Full,
            protocol: None,
        }
    }

    pub fn get(pathname: impl Into<String>) -> Self {
        Self::new(pathname).with_method("GET")
    }

    pub fn post(pathname: impl Into<String>) -> Self {
        Self::new(pathname).with_method("POST")
    }

    /// Match every path starting with `pathname`.
    pub fn prefix(pathname: impl Into<String>) -> Self {
        Self {
            match_mode: MatchMode::Prefix,
            ..Self::new(pathname)
        }
    }

    pub fn with_method(mut self, method: impl AsRef<str>) -> Self {
        self.method = Some(method.as_ref().to_ascii_uppercase());
        self
    }

    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    pub fn matches(&self, request: &Request) -> bool {
        if let Some(method) = &self.method {
            if !method.eq_ignore_ascii_case(&request.method) {
                return false;
            }
        }
        if let Some(protocol) = &self.protocol {
            if !protocol.trim_end_matches(':').eq_ignore_ascii_case(request.url.scheme()) {
                return false;
            }
        }
        match self.match_mode {
            MatchMode::Full => request.path() == self.pathname,
            MatchMode::Prefix => request.path().starts_with(&self.pathname),
        }
    }
}

/// What a handler sees.
pub struct RouteContext {
    pub request: Request,
    /// Endpoint the request arrived on.
    pub endpoint: Endpoint,
    /// Runtime of the serving module, when served by one.
    pub runtime: Option<ModuleRuntime>,
}

impl RouteContext {
    /// The serving module's runtime, or an error for bare routers.
    pub fn runtime(&self) -> Result<&ModuleRuntime> {
        self.runtime
            .as_ref()
            .ok_or_else(|| crate::DwebError::Other("route is not served by a module".into()))
    }
}

type HandlerFn<T> = Arc<dyn Fn(RouteContext) -> BoxFuture<'static, Result<T>> + Send + Sync>;

/// Handler variants, one per output codec.
#[derive(Clone)]
pub enum RouteHandler {
    /// Serialized as `application/json`.
    Json(HandlerFn<serde_json::Value>),
    /// Sent as `text/plain`.
    Text(HandlerFn<String>),
    /// Sent as `application/octet-stream`.
    Bytes(HandlerFn<Bytes>),
    /// Builds the response itself.
    Raw(HandlerFn<Response>),
}

impl RouteHandler {
    async fn call(&self, ctx: RouteContext) -> Result<Response> {
        match self {
            RouteHandler::Json(f) => f(ctx).await.map(Response::json),
            RouteHandler::Text(f) => f(ctx).await.map(Response::text),
            RouteHandler::Bytes(f) => f(ctx).await.map(Response::bytes),
            RouteHandler::Raw(f) => f(ctx).await,
        }
    }
}

#[derive(Clone)]
struct Route {
    matcher: RouteMatcher,
    handler: RouteHandler,
}

/// Ordered route table.
#[derive(Clone, Default)]
pub struct Router {
    routes: Vec<Route>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(mut self, matcher: RouteMatcher, handler: RouteHandler) -> Self {
        self.routes.push(Route { matcher, handler });
        self
    }

    /// Route whose handler returns a serializable value.
    pub fn json<F, Fut, T>(self, matcher: RouteMatcher, f: F) -> Self
    where
        F: Fn(RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Serialize + Send + 'static,
    {
        let f = Arc::new(f);
        self.route(
            matcher,
            RouteHandler::Json(Arc::new(move |ctx: RouteContext| {
                let fut = f(ctx);
                async move {
                    let value = fut.await?;
                    Ok(serde_json::to_value(value)?)
                }
                .boxed()
            })),
        )
    }

    pub fn text<F, Fut>(self, matcher: RouteMatcher, f: F) -> Self
    where
        F: Fn(RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String>> + Send + 'static,
    {
        self.route(matcher, RouteHandler::Text(Arc::new(move |ctx: RouteContext| f(ctx).boxed())))
    }

    pub fn bytes<F, Fut>(self, matcher: RouteMatcher, f: F) -> Self
    where
        F: Fn(RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Bytes>> + Send + 'static,
    {
        self.route(matcher, RouteHandler::Bytes(Arc::new(move |ctx: RouteContext| f(ctx).boxed())))
    }

    /// Route whose handler builds the `Response` directly.
    pub fn raw<F, Fut>(self, matcher: RouteMatcher, f: F) -> Self
    where
        F: Fn(RouteContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Response>> + Send + 'static,
    {
        self.route(matcher, RouteHandler::Raw(Arc::new(move |ctx: RouteContext| f(ctx).boxed())))
    }

    /// Append every route of `other` after this router's own.
    pub fn merge(mut self, other: Router) -> Self {
        self.routes.extend(other.routes);
        self
    }

    pub fn matchers(&self) -> Vec<RouteMatcher> {
        self.routes.iter().map(|r| r.matcher.clone()).collect()
    }

    /// True if some route would accept `request`.
    pub fn accepts(&self, request: &Request) -> bool {
        self.routes.iter().any(|r| r.matcher.matches(request))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Run the first matching route. Never fails.
    pub async fn dispatch(&self, ctx: RouteContext) -> Response {
        let Some(route) = self.routes.iter().find(|r| r.matcher.matches(&ctx.request)) else {
            debug!("No route for {} {}", ctx.request.method, ctx.request.path());
            return Response::not_found(ctx.request.path());
        };
        let path = ctx.request.path().to_string();
        match route.handler.call(ctx).await {
            Ok(response) => response,
            Err(e) => {
                error!("Route {} failed: {}", path, e);
                Response::from_error(&e)
            }
        }
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.routes.iter().map(|r| &r.matcher))
            .finish()
    }
}

/// A bare router serves without a module runtime.
#[async_trait::async_trait]
impl RequestHandler for Router {
    async fn handle(&self, request: Request, endpoint: &Endpoint) -> Result<Response> {
        Ok(self
            .dispatch(RouteContext {
                request,
                endpoint: endpoint.clone(),
                runtime: None,
            })
            .await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::{memory_pair, Role};
    use crate::DwebError;

    fn endpoint() -> Endpoint {
        let (a, _b) = memory_pair();
        Endpoint::new(a, Role::Server, "router.test.dweb", "peer.test.dweb", &[])
    }

    fn ctx(method: &str, url: &str) -> RouteContext {
        RouteContext {
            request: Request::new(method, url).unwrap(),
            endpoint: endpoint(),
            runtime: None,
        }
    }

    fn sample() -> Router {
        Router::new()
            .text(RouteMatcher::get("/ping"), |_| async { Ok("pong".to_string()) })
            .json(RouteMatcher::prefix("/api/"), |ctx| async move {
                Ok(serde_json::json!({ "path": ctx.request.path() }))
            })
            .raw(RouteMatcher::new("/teapot"), |_| async { Ok(Response::error(418, "short and stout")) })
            .text(RouteMatcher::new("/boom"), |_| async {
                Err(DwebError::Other("kaboom".into()))
            })
            .text(RouteMatcher::new("/missing"), |_| async {
                Err(DwebError::not_found("ghost.dweb"))
            })
    }

    #[test]
    fn test_matcher_modes() {
        let req = Request::get("/api/v1/items").unwrap();
        assert!(RouteMatcher::prefix("/api").matches(&req));
        assert!(!RouteMatcher::new("/api").matches(&req));
        assert!(!RouteMatcher::post("/api/v1/items").matches(&req));
        assert!(RouteMatcher::new("/api/v1/items").with_protocol("file:").matches(&req));
        assert!(!RouteMatcher::new("/api/v1/items").with_protocol("http").matches(&req));
    }

    #[test]
    fn test_matcher_serde_shape() {
        let json = serde_json::to_value(RouteMatcher::prefix("/").with_method("get")).unwrap();
        assert_eq!(json, serde_json::json!({"method": "GET", "pathname": "/", "matchMode": "prefix"}));
        let back: RouteMatcher = serde_json::from_value(serde_json::json!({"pathname": "/x"})).unwrap();
        assert_eq!(back, RouteMatcher::new("/x"));
    }

    #[tokio::test]
    async fn test_dispatch_codecs() {
        let router = sample();

        let pong = router.dispatch(ctx("GET", "/ping")).await;
        assert_eq!(pong.headers.get("content-type"), Some("text/plain; charset=utf-8"));
        assert_eq!(pong.body.into_text().await.unwrap(), "pong");

        let api = router.dispatch(ctx("GET", "/api/users")).await;
        let value: serde_json::Value = api.body.into_json().await.unwrap();
        assert_eq!(value["path"], "/api/users");

        let teapot = router.dispatch(ctx("PUT", "/teapot")).await;
        assert_eq!(teapot.status, 418);
    }

    #[tokio::test]
    async fn test_dispatch_failures_still_respond() {
        let router = sample();
        assert_eq!(router.dispatch(ctx("GET", "/boom")).await.status, 500);
        assert_eq!(router.dispatch(ctx("GET", "/missing")).await.status, 404);
        assert_eq!(router.dispatch(ctx("GET", "/nowhere")).await.status, 404);
        assert_eq!(router.dispatch(ctx("POST", "/ping")).await.status, 404);
    }

    #[tokio::test]
    async fn test_first_match_wins() {
        let router = Router::new()
            .text(RouteMatcher::prefix("/"), |_| async { Ok("first".to_string()) })
            .text(RouteMatcher::new("/ping"), |_| async { Ok("second".to_string()) });
        let res = router.dispatch(ctx("GET", "/ping")).await;
        assert_eq!(res.body.into_text().await.unwrap(), "first");
        assert_eq!(router.len(), 2);
    }
}
