//! End-to-end renderer pipeline tests
//!
//! These drive the chain exactly the way the dispatcher does: a request
//! context walks the configured renderers, the index renderer executes a
//! real bundle in a real isolate, and the response is asserted byte for
//! byte.

use actix_web::body::to_bytes;
use actix_web::http::StatusCode;
use actix_web::test::TestRequest;
use bytes::Bytes;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vitrine::buffer::BufferPool;
use vitrine::cache::Cache;
use vitrine::fetcher::{Fetcher, FetcherConfig, Resource};
use vitrine::renderer::index::{IndexConfig, IndexRuleConfig, StateEntryConfig};
use vitrine::renderer::{
    build_chain, prepare_renderers, RendererConfig, RendererRef, RequestContext, Services,
};
use vitrine::vm::{ServerInfo, VmPool, VmPoolConfig};

const SHELL: &str =
    "<!doctype html><head><meta charset=utf-8></head><body><div id=\"root\"></div></body>";

struct Fixture {
    _dir: tempfile::TempDir,
    shell: PathBuf,
    bundle: PathBuf,
    payloads: Arc<Cache<Bytes>>,
    services: Services,
}

impl Fixture {
    fn new(bundle_source: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let shell = dir.path().join("index.html");
        fs::write(&shell, SHELL).unwrap();
        let bundle = dir.path().join("bundle.js");
        fs::write(&bundle, bundle_source).unwrap();

        let payloads = Arc::new(Cache::new());
        let fetcher =
            Arc::new(Fetcher::new(&FetcherConfig::default(), Arc::clone(&payloads)).unwrap());
        let services = Services {
            fetcher,
            pages: Arc::new(Cache::new()),
            buffers: Arc::new(BufferPool::default()),
            vm_pool: VmPool::new(&VmPoolConfig {
                max_vms: 2,
                max_spare_vms: 1,
            }),
            env: "test".to_string(),
        };
        Self {
            _dir: dir,
            shell,
            bundle,
            payloads,
            services,
        }
    }

    fn index_config(&self, with_bundle: bool) -> IndexConfig {
        IndexConfig {
            html: self.shell.clone(),
            bundle: with_bundle.then(|| self.bundle.clone()),
            container: "root".to_string(),
            state: "state".to_string(),
            timeout: 5,
            cache: false,
            cache_ttl: 0,
            rules: vec![],
        }
    }

    fn chain(&self, configs: Vec<RendererConfig>) -> RendererRef {
        let prepared = Arc::new(prepare_renderers(&configs).unwrap());
        build_chain(&prepared, &self.services)
    }
}

fn info() -> ServerInfo {
    ServerInfo {
        addr: "127.0.0.1".to_string(),
        port: 8080,
        version: "0.4.1".to_string(),
    }
}

fn ctx(uri: &str) -> RequestContext {
    RequestContext::new(TestRequest::get().uri(uri).to_http_request())
}

async fn body_string(response: actix_web::HttpResponse) -> String {
    let bytes = to_bytes(response.into_body()).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

#[actix_web::test]
async fn html_only_serves_the_shell_verbatim() {
    let fixture = Fixture::new("");
    let chain = fixture.chain(vec![RendererConfig::Index(fixture.index_config(false))]);

    let response = chain.handle(&mut ctx("/"), &info()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, SHELL);
}

#[actix_web::test]
async fn bundle_render_splices_the_container() {
    let fixture = Fixture::new(r#"(() => { serverResponse.render("<p>test</p>", 200); })();"#);
    let chain = fixture.chain(vec![RendererConfig::Index(fixture.index_config(true))]);

    let response = chain.handle(&mut ctx("/test"), &info()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        body_string(response).await,
        "<!doctype html><head><meta charset=utf-8></head><body><div id=\"root\"><p>test</p></div></body>"
    );
}

#[actix_web::test]
async fn bundle_redirect_sets_location_and_empty_body() {
    let fixture =
        Fixture::new(r#"(() => { serverResponse.redirect("http://external", 302); })();"#);
    let chain = fixture.chain(vec![RendererConfig::Index(fixture.index_config(true))]);

    let response = chain.handle(&mut ctx("/anywhere"), &info()).await;
    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(
        response.headers().get("location").unwrap(),
        "http://external"
    );
    assert!(body_string(response).await.is_empty());
}

#[actix_web::test]
async fn state_with_named_capture_is_serialized_exactly() {
    let fixture = Fixture::new(r#"(() => { serverResponse.render("<p>test</p>", 200); })();"#);
    fixture.services.fetcher.register(Resource {
        name: "resource-test1-value".to_string(),
        url: "http://upstream/test1/value".to_string(),
        ..Resource::default()
    });
    fixture.payloads.set(
        "resource-test1-value",
        Bytes::from_static(br#"{"data":{"id":1}}"#),
        0,
    );

    let mut config = fixture.index_config(true);
    config.rules = vec![IndexRuleConfig {
        path: "^/test1/(?P<slug>.+)/?".to_string(),
        state: vec![StateEntryConfig {
            key: "test1-$slug".to_string(),
            resource: "resource-test1-$slug".to_string(),
            export: true,
        }],
        last: false,
    }];
    let chain = fixture.chain(vec![RendererConfig::Index(config)]);

    let response = chain.handle(&mut ctx("/test1/value"), &info()).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = body_string(response).await;
    assert!(
        body.ends_with(
            "<script id=\"state\" type=\"application/json\">{\"test1-value\":{\"loading\":false,\"error\":\"\",\"response\":\"{\\\"data\\\":{\\\"id\\\":1}}\"}}</script></body>"
        ),
        "unexpected body: {body}"
    );
}

#[actix_web::test]
async fn unknown_resource_is_reported_in_state() {
    let fixture = Fixture::new(r#"(() => { serverResponse.render("<p>test</p>", 200); })();"#);

    let mut config = fixture.index_config(true);
    config.rules = vec![IndexRuleConfig {
        path: "^/test1/(?P<slug>.+)/?".to_string(),
        state: vec![StateEntryConfig {
            key: "test1-$slug".to_string(),
            resource: "resource-test1-$slug".to_string(),
            export: true,
        }],
        last: false,
    }];
    let chain = fixture.chain(vec![RendererConfig::Index(config)]);

    let response = chain.handle(&mut ctx("/test1/value"), &info()).await;
    let body = body_string(response).await;
    assert!(
        body.contains(
            r#"{"test1-value":{"loading":false,"error":"unknown resource","response":""}}"#
        ),
        "unexpected body: {body}"
    );
}

#[actix_web::test]
async fn bundle_timeout_responds_within_twice_the_deadline() {
    let fixture = Fixture::new("(() => { while (true) {} })();");
    let mut config = fixture.index_config(true);
    config.timeout = 1;
    let chain = fixture.chain(vec![RendererConfig::Index(config)]);

    let started = Instant::now();
    let response = chain.handle(&mut ctx("/hang"), &info()).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    // The index renderer delegates on timeout; the terminal renderer
    // answers 500.
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    // The VM slot must be back in the pool.
    assert_eq!(fixture.services.vm_pool.available(), 2);
}

#[actix_web::test]
async fn script_exception_falls_through_to_error_renderer() {
    let fixture = Fixture::new(r#"throw new Error("boom");"#);
    let chain = fixture.chain(vec![RendererConfig::Index(fixture.index_config(true))]);

    let response = chain.handle(&mut ctx("/"), &info()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(fixture.services.vm_pool.available(), 2);
}

#[actix_web::test]
async fn missing_shell_falls_through_to_error_renderer() {
    let fixture = Fixture::new("");
    let config = fixture.index_config(false);
    let chain = fixture.chain(vec![RendererConfig::Index(config)]);
    fs::remove_file(&fixture.shell).unwrap();

    let response = chain.handle(&mut ctx("/"), &info()).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
}

#[actix_web::test]
async fn head_elements_and_title_are_spliced() {
    let fixture = Fixture::new(
        r#"(() => {
            serverResponse.setTitle("Landing");
            serverResponse.setMeta("description", new Map([
                ["name", "description"],
                ["content", "hello"],
            ]));
            serverResponse.setLink("styles", new Map([
                ["rel", "stylesheet"],
                ["href", "/app.css"],
            ]));
            serverResponse.setScript("boot", new Map([["children", "start();"]]));
            serverResponse.render("<main>ok</main>");
        })();"#,
    );
    let chain = fixture.chain(vec![RendererConfig::Index(fixture.index_config(true))]);

    let response = chain.handle(&mut ctx("/"), &info()).await;
    let body = body_string(response).await;
    let head_injection = concat!(
        "<title>Landing</title>",
        "<meta id=\"description\" name=\"description\" content=\"hello\">",
        "<link id=\"styles\" rel=\"stylesheet\" href=\"/app.css\">",
        "<script id=\"boot\">start();</script>",
        "</head>"
    );
    assert!(body.contains(head_injection), "unexpected body: {body}");
    assert!(body.contains("<div id=\"root\"><main>ok</main></div>"));
}

#[actix_web::test]
async fn cached_response_bypasses_rendering() {
    let fixture = Fixture::new(r#"(() => { serverResponse.render("<p>v1</p>"); })();"#);
    let mut config = fixture.index_config(true);
    config.cache = true;
    config.cache_ttl = 0;
    let chain = fixture.chain(vec![RendererConfig::Index(config)]);

    let first = body_string(chain.handle(&mut ctx("/page"), &info()).await).await;
    assert!(first.contains("<p>v1</p>"));

    // A changed bundle must not be visible while the page cache holds the
    // response.
    fs::write(&fixture.bundle, r#"(() => { serverResponse.render("<p>v2</p>"); })();"#).unwrap();
    let second = body_string(chain.handle(&mut ctx("/page"), &info()).await).await;
    assert!(second.contains("<p>v1</p>"));
}

#[actix_web::test]
async fn rewrite_feeds_the_index_renderer() {
    let fixture = Fixture::new(
        r#"(() => { serverResponse.render("<p>" + serverRequest.path() + "</p>"); })();"#,
    );
    let rewrite = RendererConfig::Rewrite(vitrine::renderer::basic::RewriteConfig {
        rules: vec![vitrine::renderer::basic::RewriteRule {
            path: "^/legacy/(?P<rest>.*)$".to_string(),
            replacement: "/pages/$rest".to_string(),
        }],
    });
    let chain = fixture.chain(vec![
        rewrite,
        RendererConfig::Index(fixture.index_config(true)),
    ]);

    let body = body_string(chain.handle(&mut ctx("/legacy/home"), &info()).await).await;
    assert!(body.contains("<p>/pages/home</p>"), "unexpected body: {body}");
}

#[actix_web::test]
async fn static_renderer_short_circuits_the_index() {
    let fixture = Fixture::new(r#"(() => { serverResponse.render("<p>ssr</p>"); })();"#);
    let assets = tempfile::tempdir().unwrap();
    fs::write(assets.path().join("app.css"), "body{}").unwrap();

    let chain = fixture.chain(vec![
        RendererConfig::Static(vitrine::renderer::statics::StaticConfig {
            dir: assets.path().to_path_buf(),
        }),
        RendererConfig::Index(fixture.index_config(true)),
    ]);

    let response = chain.handle(&mut ctx("/app.css"), &info()).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "body{}");

    let response = chain.handle(&mut ctx("/page"), &info()).await;
    assert!(body_string(response).await.contains("<p>ssr</p>"));
}
