//! Integration tests for the module registry.
//!
//! These drive whole scenarios through the public API: booting modules,
//! connecting them, closing them and dispatching deep links.

use dweb_core::registry::NativeConnectAdapter;
use dweb_core::{
    normalize_args, ConnectAdapter, ConnectReason, DwebError, EndpointPair, MicroModule,
    ModuleManifest, ModuleRuntime, Registry, Request, RouteMatcher, Router,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Module serving `/ping` that counts its bootstraps.
struct Echo {
    mmid: &'static str,
    starts: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl MicroModule for Echo {
    fn manifest(&self) -> ModuleManifest {
        ModuleManifest::new(self.mmid)
    }

    fn routes(&self) -> Router {
        Router::new()
            .text(RouteMatcher::get("/ping"), |_| async { Ok("pong".to_string()) })
            .text(RouteMatcher::get("/fail"), |_| async {
                Err(DwebError::Other("handler failed".into()))
            })
    }

    async fn start(&self, _runtime: &ModuleRuntime) -> dweb_core::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        Ok(())
    }
}

/// Native adapter that counts its invocations.
struct CountingAdapter {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ConnectAdapter for CountingAdapter {
    fn name(&self) -> &str {
        "counting"
    }

    async fn connect(
        &self,
        from: &ModuleRuntime,
        to: &ModuleRuntime,
        reason: &ConnectReason,
    ) -> dweb_core::Result<Option<EndpointPair>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(25)).await;
        NativeConnectAdapter.connect(from, to, reason).await
    }
}

/// Module whose `stop` takes a while.
struct SlowStop {
    starts: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl MicroModule for SlowStop {
    fn manifest(&self) -> ModuleManifest {
        ModuleManifest::new("slow.test.dweb")
    }

    async fn start(&self, _runtime: &ModuleRuntime) -> dweb_core::Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self, _runtime: &ModuleRuntime) -> dweb_core::Result<()> {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(())
    }
}

/// Adapter that never makes a pair, so the chain moves on.
struct Decline {
    calls: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl ConnectAdapter for Decline {
    fn name(&self) -> &str {
        "decline"
    }

    async fn connect(
        &self,
        _from: &ModuleRuntime,
        _to: &ModuleRuntime,
        _reason: &ConnectReason,
    ) -> dweb_core::Result<Option<EndpointPair>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(None)
    }
}

/// Module accepting `dweb:` deep links and recording them.
struct LinkSink {
    seen: Arc<Mutex<Vec<String>>>,
}

#[async_trait::async_trait]
impl MicroModule for LinkSink {
    fn manifest(&self) -> ModuleManifest {
        ModuleManifest::new("links.test.dweb").with_deeplink("dweb://install")
    }

    fn routes(&self) -> Router {
        let seen = self.seen.clone();
        Router::new().text(
            RouteMatcher::prefix("").with_protocol("dweb"),
            move |ctx| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(ctx.request.url.to_string());
                    Ok("ok".to_string())
                }
            },
        )
    }
}

fn install_echo(registry: &Registry, mmid: &'static str) -> Arc<AtomicUsize> {
    let starts = Arc::new(AtomicUsize::new(0));
    registry.install(Arc::new(Echo {
        mmid,
        starts: starts.clone(),
    }));
    starts
}

fn counting_adapter(registry: &Registry) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    registry.prepend_connect_adapter(Arc::new(CountingAdapter {
        calls: calls.clone(),
    }));
    calls
}

#[tokio::test]
async fn test_concurrent_open_bootstraps_once() {
    let registry = Registry::new().unwrap();
    let starts = install_echo(&registry, "echo.test.dweb");

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let registry = registry.clone();
        tasks.push(tokio::spawn(
            async move { registry.open("echo.test.dweb").await },
        ));
    }
    let mut runtimes = Vec::new();
    for task in tasks {
        runtimes.push(task.await.unwrap().unwrap());
    }

    assert_eq!(starts.load(Ordering::SeqCst), 1);
    for runtime in &runtimes[1..] {
        assert!(runtime.same_instance(&runtimes[0]));
    }
}

#[tokio::test]
async fn test_concurrent_connect_invokes_adapter_once() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "a.test.dweb");
    install_echo(&registry, "b.test.dweb");
    let calls = counting_adapter(&registry);
    let a = registry.open("a.test.dweb").await.unwrap();

    let (first, second) = tokio::join!(a.connect("b.test.dweb"), a.connect("b.test.dweb"));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(first.id(), second.id());
}

#[tokio::test]
async fn test_crossed_connects_share_one_pair() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "a.test.dweb");
    install_echo(&registry, "b.test.dweb");
    let calls = counting_adapter(&registry);
    let a = registry.open("a.test.dweb").await.unwrap();
    let b = registry.open("b.test.dweb").await.unwrap();

    let (a_end, b_end) = tokio::join!(a.connect("b.test.dweb"), b.connect("a.test.dweb"));
    let (a_end, b_end) = (a_end.unwrap(), b_end.unwrap());

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(a_end.local_id(), "a.test.dweb");
    assert_eq!(a_end.remote_id(), "b.test.dweb");
    assert_eq!(b_end.local_id(), "b.test.dweb");
    assert_eq!(b_end.remote_id(), "a.test.dweb");
    assert_eq!(a_end.fetch("/ping").await.unwrap().status, 200);
    assert_eq!(b_end.fetch("/ping").await.unwrap().status, 200);

    // Both directions now hit the cache.
    a.connect("b.test.dweb").await.unwrap();
    b.connect("a.test.dweb").await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_ping_pong_scenario() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "echo.test.dweb");
    install_echo(&registry, "client.test.dweb");

    registry.open("echo.test.dweb").await.unwrap();
    let client = registry.open("client.test.dweb").await.unwrap();
    let endpoint = client.connect("echo.test.dweb").await.unwrap();

    let response = endpoint.request(Request::get("/ping").unwrap()).await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body.into_text().await.unwrap(), "pong");
}

#[tokio::test]
async fn test_handler_error_and_unknown_route() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "echo.test.dweb");
    let dns = registry.open("dns.sys.dweb").await.unwrap();
    let endpoint = dns.connect("echo.test.dweb").await.unwrap();

    let failed = endpoint.fetch("/fail").await.unwrap();
    assert_eq!(failed.status, 500);
    assert!(failed.body.into_text().await.unwrap().contains("handler failed"));

    let missing = endpoint.fetch("/missing").await.unwrap();
    assert_eq!(missing.status, 404);
}

#[tokio::test]
async fn test_closed_target_fails_cached_endpoint_and_reconnects() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "a.test.dweb");
    let b_starts = install_echo(&registry, "b.test.dweb");
    let calls = counting_adapter(&registry);

    let a = registry.open("a.test.dweb").await.unwrap();
    let endpoint = a.connect("b.test.dweb").await.unwrap();
    assert_eq!(endpoint.fetch("/ping").await.unwrap().status, 200);

    assert!(registry.close("b.test.dweb").await.unwrap());
    endpoint.closed().await;

    let err = endpoint.fetch("/ping").await.unwrap_err();
    assert!(matches!(err, DwebError::EndpointClosed { .. }), "{err:?}");

    let fresh = a.connect("b.test.dweb").await.unwrap();
    assert_ne!(fresh.id(), endpoint.id());
    assert_eq!(b_starts.load(Ordering::SeqCst), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(fresh.fetch("/ping").await.unwrap().status, 200);
}

#[tokio::test]
async fn test_close_during_pending_open() {
    let registry = Registry::new().unwrap();
    let starts = install_echo(&registry, "echo.test.dweb");

    let opening = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.open("echo.test.dweb").await })
    };
    tokio::time::sleep(Duration::from_millis(5)).await;

    assert!(registry.close("echo.test.dweb").await.unwrap());
    let runtime = opening.await.unwrap().unwrap();
    assert!(!runtime.is_running());
    assert!(!registry.is_running("echo.test.dweb"));
    assert!(registry.running_ids().is_empty());

    let reopened = registry.open("echo.test.dweb").await.unwrap();
    assert!(reopened.is_running());
    assert!(!reopened.same_instance(&runtime));
    assert_eq!(starts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_open_during_close_waits_and_reboots() {
    let registry = Registry::new().unwrap();
    let starts = Arc::new(AtomicUsize::new(0));
    registry.install(Arc::new(SlowStop {
        starts: starts.clone(),
    }));
    let first = registry.open("slow.test.dweb").await.unwrap();

    let closing = {
        let registry = registry.clone();
        tokio::spawn(async move { registry.close("slow.test.dweb").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let second = registry.open("slow.test.dweb").await.unwrap();
    assert!(closing.await.unwrap().unwrap());
    assert!(second.is_running());
    assert!(!first.is_running());
    assert!(!second.same_instance(&first));
    assert_eq!(starts.load(Ordering::SeqCst), 2);
    assert_eq!(registry.running_ids(), vec!["slow.test.dweb".to_string()]);
}

#[tokio::test]
async fn test_declining_adapter_falls_through() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "a.test.dweb");
    install_echo(&registry, "b.test.dweb");
    let declined = Arc::new(AtomicUsize::new(0));
    registry.prepend_connect_adapter(Arc::new(Decline {
        calls: declined.clone(),
    }));
    assert_eq!(registry.connect_adapter_names(), vec!["decline", "native"]);

    let a = registry.open("a.test.dweb").await.unwrap();
    let endpoint = a.connect("b.test.dweb").await.unwrap();
    assert_eq!(endpoint.fetch("/ping").await.unwrap().status, 200);
    assert_eq!(declined.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_unknown_module_is_not_found() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "a.test.dweb");
    let a = registry.open("a.test.dweb").await.unwrap();
    let err = a.connect("ghost.test.dweb").await.unwrap_err();
    assert!(matches!(err, DwebError::NotFound { .. }));
}

#[tokio::test]
async fn test_no_adapter_refuses_connection() {
    let registry = Registry::new().unwrap();
    install_echo(&registry, "a.test.dweb");
    install_echo(&registry, "b.test.dweb");
    let a = registry.open("a.test.dweb").await.unwrap();

    registry.clear_connect_adapters();
    assert!(registry.connect_adapter_names().is_empty());
    let err = a.connect("b.test.dweb").await.unwrap_err();
    assert!(matches!(err, DwebError::ConnectionRefused { .. }), "{err:?}");
    assert_eq!(err.to_status_code(), 502);

    // Adapters that all decline refuse the same way.
    let declined = Arc::new(AtomicUsize::new(0));
    registry.add_connect_adapter(Arc::new(Decline {
        calls: declined.clone(),
    }));
    let err = a.connect("b.test.dweb").await.unwrap_err();
    assert!(matches!(err, DwebError::ConnectionRefused { .. }), "{err:?}");
    assert_eq!(declined.load(Ordering::SeqCst), 1);

    registry.add_connect_adapter(Arc::new(NativeConnectAdapter));
    let endpoint = a.connect("b.test.dweb").await.unwrap();
    assert_eq!(endpoint.fetch("/ping").await.unwrap().status, 200);
}

#[tokio::test]
async fn test_deeplink_dispatch() {
    let registry = Registry::new().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    registry.install(Arc::new(LinkSink { seen: seen.clone() }));
    install_echo(&registry, "echo.test.dweb");

    let url = normalize_args(&["dweb", "install", "-url=https://x.test/app.json"]).unwrap();
    let accepted = registry.dispatch_deeplink(url.as_str()).await.unwrap();

    assert_eq!(accepted, 1);
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].starts_with("dweb://install?url="));

    let none = registry.dispatch_deeplink("dweb://unknown").await.unwrap();
    assert_eq!(none, 0);
    let lookalike = registry.dispatch_deeplink("dweb://installer?x=1").await.unwrap();
    assert_eq!(lookalike, 0);
}

#[tokio::test]
async fn test_local_file_fetch() {
    let dir = tempfile::TempDir::new().unwrap();
    let file = dir.path().join("index.html");
    std::fs::write(&file, "<h1>hi</h1>").unwrap();

    let registry = Registry::new().unwrap();
    let dns = registry.open("dns.sys.dweb").await.unwrap();
    let url = url::Url::from_file_path(&file).unwrap();
    let response = dns.fetch(url.as_str()).await.unwrap();

    assert_eq!(
        response.headers.get("content-type"),
        Some("text/html; charset=utf-8")
    );
    assert_eq!(response.body.into_text().await.unwrap(), "<h1>hi</h1>");
}
