//! Static file renderer
//!
//! Serves files under a root directory when the effective path maps to an
//! existing file; everything else delegates. Paths containing parent
//! components never leave the root.

use crate::renderer::{Renderer, RendererRef, RequestContext};
use crate::vm::ServerInfo;
use actix_web::HttpResponse;
use async_trait::async_trait;
use serde::Deserialize;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Static renderer configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    /// Root directory files are served from.
    pub dir: PathBuf,
}

/// Serves files below the configured root.
pub struct StaticRenderer {
    config: StaticConfig,
    next: RendererRef,
}

impl StaticRenderer {
    /// Builds the renderer.
    pub fn new(config: StaticConfig, next: RendererRef) -> Self {
        Self { config, next }
    }

    fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = request_path.trim_start_matches('/');
        if relative.is_empty() {
            return None;
        }
        let relative = Path::new(relative);
        // Reject any traversal component; only plain names descend.
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return None;
        }
        let candidate = self.config.dir.join(relative);
        candidate.is_file().then_some(candidate)
    }
}

#[async_trait(?Send)]
impl Renderer for StaticRenderer {
    async fn handle(&self, ctx: &mut RequestContext, info: &ServerInfo) -> HttpResponse {
        if let Some(path) = self.resolve(ctx.path()) {
            match fs::read(&path) {
                Ok(body) => {
                    let mime = mime_guess::from_path(&path).first_or_octet_stream();
                    return HttpResponse::Ok().content_type(mime.as_ref()).body(body);
                }
                Err(err) => {
                    tracing::warn!(
                        target: "vitrine::renderer",
                        file = %path.display(),
                        error = %err,
                        "static renderer failed to read file"
                    );
                }
            }
        }
        self.next.handle(ctx, info).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::renderer::basic::ErrorRenderer;
    use actix_web::http::StatusCode;
    use actix_web::test::TestRequest;
    use std::rc::Rc;

    fn renderer(dir: &tempfile::TempDir) -> StaticRenderer {
        StaticRenderer::new(
            StaticConfig {
                dir: dir.path().to_path_buf(),
            },
            Rc::new(ErrorRenderer::new()),
        )
    }

    fn ctx(uri: &str) -> RequestContext {
        RequestContext::new(TestRequest::get().uri(uri).to_http_request())
    }

    #[actix_web::test]
    async fn serves_existing_file_with_content_type() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("app.js"), b"boot();").unwrap();
        let renderer = renderer(&dir);

        let response = renderer.handle(&mut ctx("/app.js"), &ServerInfo::default()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("javascript"));
    }

    #[actix_web::test]
    async fn missing_file_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let renderer = renderer(&dir);
        let response = renderer.handle(&mut ctx("/nope.css"), &ServerInfo::default()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn traversal_components_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("inside.txt"), b"x").unwrap();
        let renderer = renderer(&dir);
        assert!(renderer.resolve("/../etc/passwd").is_none());
        assert!(renderer.resolve("/a/../../b").is_none());
        assert!(renderer.resolve("/inside.txt").is_some());
    }
}
