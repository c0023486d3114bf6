//! Static file loading for the web front end.

use crate::config::DEFAULT_PAGE;
use crate::error::ServiceError;
use crate::sandbox;
use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};
use std::path::Path;
use tracing::{error, warn};

/// Content type for a file, decided by its extension.
pub fn content_type(path: &Path) -> &'static str {
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html; charset=utf-8",
        "css" => "text/css; charset=utf-8",
        "js" => "application/javascript; charset=utf-8",
        "json" => "application/json; charset=utf-8",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "svg" => "image/svg+xml",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "txt" => "text/plain; charset=utf-8",
        "xml" => "application/xml; charset=utf-8",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        _ => "application/octet-stream",
    }
}

/// Serve `requested` (relative to `root`); an empty path serves the home page.
pub async fn load_file(root: &Path, requested: &str) -> Response {
    let requested = requested.trim_start_matches('/');
    let requested = if requested.is_empty() { DEFAULT_PAGE } else { requested };

    let full_path = match sandbox::resolve(root, requested) {
        Ok(path) if path.is_file() => path,
        Ok(_) | Err(ServiceError::SandboxEscape(_)) => return not_found(requested),
        Err(e) => return problem(&e.to_string()),
    };

    match tokio::fs::read(&full_path).await {
        Ok(bytes) => (
            [(header::CONTENT_TYPE, content_type(&full_path))],
            bytes,
        )
            .into_response(),
        Err(e) => {
            error!(path = %full_path.display(), "Error loading file: {}", e);
            problem(&format!("Error loading file: {e}"))
        }
    }
}

fn not_found(requested: &str) -> Response {
    warn!(path = requested, "Static file not found");
    (StatusCode::NOT_FOUND, format!("File not found: {requested}")).into_response()
}

/// RFC 7807 style problem body.
fn problem(detail: &str) -> Response {
    let body = serde_json::json!({
        "type": "about:blank",
        "title": "An error occurred while processing your request.",
        "status": 500,
        "detail": detail,
    });
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        [(header::CONTENT_TYPE, "application/problem+json")],
        body.to_string(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::fs;

    #[test]
    fn content_types_by_extension() {
        assert_eq!(content_type(Path::new("a.HTML")), "text/html; charset=utf-8");
        assert_eq!(content_type(Path::new("img/logo.jpeg")), "image/jpeg");
        assert_eq!(content_type(Path::new("font.woff2")), "font/woff2");
        assert_eq!(content_type(Path::new("archive.zip")), "application/zip");
        assert_eq!(content_type(Path::new("tool.exe")), "application/octet-stream");
        assert_eq!(content_type(Path::new("README")), "application/octet-stream");
    }

    #[tokio::test]
    async fn serves_home_page_and_files() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("home.html"), "<h1>home</h1>").unwrap();
        fs::create_dir(dir.path().join("css")).unwrap();
        fs::write(dir.path().join("css/site.css"), "body{}").unwrap();

        let response = load_file(dir.path(), "").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/html; charset=utf-8");
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"<h1>home</h1>");

        let response = load_file(dir.path(), "/css/site.css").await;
        assert_eq!(response.headers()[header::CONTENT_TYPE], "text/css; charset=utf-8");
    }

    #[tokio::test]
    async fn missing_and_escaping_paths_are_404() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load_file(dir.path(), "nope.js").await.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            load_file(dir.path(), "../../etc/passwd").await.status(),
            StatusCode::NOT_FOUND
        );
    }
}
