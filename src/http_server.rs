//! HTTP server implementation using Axum.
//!
//! Every API endpoint answers with a [`ResponseEnvelope`]; the action to
//! perform is chosen by the `action` query parameter, mirroring the web
//! front end's request shapes.

use crate::admission::admission_gate;
use crate::codes::spawn_sweeper;
use crate::config::CODE_SWEEP_INTERVAL_SECS;
use crate::envelope::ResponseEnvelope;
use crate::error::{Result, ServiceError};
use crate::state::AppState;
use crate::static_files;
use crate::terminal::StartOutcome;
use axum::{
    extract::{
        rejection::{FormRejection, QueryRejection, StringRejection},
        Query, State,
    },
    http::{Method, StatusCode, Uri},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
    Form, Router,
};
use serde::Deserialize;
use std::any::Any;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

#[derive(Debug, Default, Deserialize)]
struct ActionQuery {
    #[serde(default)]
    action: String,
    project: Option<String>,
    path: Option<String>,
    cmd: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConfirmForm {
    #[serde(default)]
    action: String,
    #[serde(default)]
    code: String,
}

/// Run the HTTP server on `addr` until it fails.
pub async fn run_server(addr: SocketAddr, state: AppState) -> std::io::Result<()> {
    // Spawn cleanup task
    spawn_sweeper(
        Arc::clone(state.privileged.codes()),
        Duration::from_secs(CODE_SWEEP_INTERVAL_SECS),
    );

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Starting HTTP server on {}", listener.local_addr()?);
    axum::serve(listener, app).await
}

/// The complete application: routes, admission, panic boundary and tracing.
pub fn router(state: AppState) -> Router {
    with_layers(routes(), state)
}

fn routes() -> Router<AppState> {
    Router::new()
        // Privileged actions
        .route("/system", get(issue_code).post(confirm_code))
        // Project files
        .route("/project", get(project_read).post(project_write))
        // Terminal
        .route("/terminal", get(terminal))
        // Health check
        .route("/heartbeat", get(heartbeat))
        .fallback(static_file)
}

fn with_layers(routes: Router<AppState>, state: AppState) -> Router {
    routes
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(middleware::from_fn_with_state(state.clone(), admission_gate))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn heartbeat() -> &'static str {
    "OK"
}

async fn issue_code(
    State(state): State<AppState>,
    query: std::result::Result<Query<ActionQuery>, QueryRejection>,
) -> ResponseEnvelope {
    let query = match parse_query(query) {
        Ok(query) => query,
        Err(e) => return e.into(),
    };
    match state.privileged.issue(&query.action) {
        Ok(code) => {
            ResponseEnvelope::success(format!("Verify {}", query.action)).with("code", code)
        }
        Err(e) => e.into(),
    }
}

async fn confirm_code(
    State(state): State<AppState>,
    form: std::result::Result<Form<ConfirmForm>, FormRejection>,
) -> ResponseEnvelope {
    let Ok(Form(form)) = form else {
        return ServiceError::validation("missing parameters").into();
    };
    match state.privileged.confirm(&form.action, &form.code) {
        // Fire and forget: the script's fate is only visible in the log.
        Ok(_scheduled) => ResponseEnvelope::success("Command scheduled"),
        Err(e) => e.into(),
    }
}

async fn project_read(
    State(state): State<AppState>,
    query: std::result::Result<Query<ActionQuery>, QueryRejection>,
) -> ResponseEnvelope {
    let query = match parse_query(query) {
        Ok(query) => query,
        Err(e) => return e.into(),
    };
    let projects = Arc::clone(&state.projects);
    match query.action.as_str() {
        "projects" => ResponseEnvelope::success("Sub projects").with_payload(
            projects
                .projects()
                .iter()
                .map(|(name, root)| (name.clone(), root.display().to_string())),
        ),
        "list" => {
            let project = query.project.unwrap_or_default();
            blocking(move || projects.list_files(&project))
                .await
                .map(|files| {
                    ResponseEnvelope::success("List file success")
                        .with_payload(files.into_iter().map(|(path, kind)| (path, kind.as_str())))
                })
                .into()
        }
        "read_file" => {
            let project = query.project.unwrap_or_default();
            let path = query.path.unwrap_or_default();
            blocking(move || {
                let content = projects.read_file(&project, &path)?;
                Ok(ResponseEnvelope::success("Read file success")
                    .with("file", path)
                    .with("content", content))
            })
            .await
            .into()
        }
        other => ResponseEnvelope::error(format!("Unknown GET action: {other}")),
    }
}

async fn project_write(
    State(state): State<AppState>,
    query: std::result::Result<Query<ActionQuery>, QueryRejection>,
    body: std::result::Result<String, StringRejection>,
) -> ResponseEnvelope {
    let query = match parse_query(query) {
        Ok(query) => query,
        Err(e) => return e.into(),
    };
    let body = match body {
        Ok(body) => body,
        Err(rejection) => return ServiceError::validation(rejection.body_text()).into(),
    };
    match query.action.as_str() {
        "write_file" => {
            let projects = Arc::clone(&state.projects);
            let project = query.project.unwrap_or_default();
            let path = query.path.unwrap_or_default();
            blocking(move || {
                projects.write_file(&project, &path, &body)?;
                Ok(ResponseEnvelope::success(format!("Write file success: {path}")))
            })
            .await
            .into()
        }
        other => ResponseEnvelope::error(format!("Unknown POST action: {other}")),
    }
}

async fn terminal(
    State(state): State<AppState>,
    query: std::result::Result<Query<ActionQuery>, QueryRejection>,
) -> ResponseEnvelope {
    let query = match parse_query(query) {
        Ok(query) => query,
        Err(e) => return e.into(),
    };
    match query.action.as_str() {
        "start" => {
            let cmd = query.cmd.unwrap_or_default();
            match state.terminal.start(&cmd) {
                Ok(StartOutcome::Started) => {
                    ResponseEnvelope::success("Command started").with("running", "1")
                }
                Ok(StartOutcome::DirectoryChanged(path)) => {
                    ResponseEnvelope::success("Directory changed").with("path", path)
                }
                Err(e) => e.into(),
            }
        }
        "poll" => {
            let snapshot = state.terminal.poll();
            ResponseEnvelope::success("Get output")
                .with("out", snapshot.out)
                .with("err", snapshot.err)
                .with("running", if snapshot.running { "1" } else { "0" })
                .with("path", snapshot.path)
        }
        other => ResponseEnvelope::error(format!("Unknown action: {other}")),
    }
}

async fn static_file(State(state): State<AppState>, method: Method, uri: Uri) -> Response {
    if method != Method::GET && method != Method::HEAD {
        return StatusCode::METHOD_NOT_ALLOWED.into_response();
    }
    static_files::load_file(&state.config.static_dir, uri.path()).await
}

/// Malformed query strings are validation errors, answered with an envelope.
fn parse_query(
    query: std::result::Result<Query<ActionQuery>, QueryRejection>,
) -> Result<ActionQuery> {
    query
        .map(|Query(query)| query)
        .map_err(|rejection| ServiceError::validation(rejection.body_text()))
}

fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("[Error] handler panicked: {}", detail);
    (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Run blocking filesystem work off the async workers.
async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ServiceError::Internal(e.to_string()))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::SESSION_COOKIE;
    use crate::config::Config;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use serde_json::Value;
    use std::fs;
    use std::path::Path;
    use tower::ServiceExt;

    fn test_state(dir: &Path) -> AppState {
        fs::create_dir_all(dir.join("Module.Hello/src")).unwrap();
        fs::write(dir.join("Module.Hello/src/Hello.cs"), "class Hello {}").unwrap();
        fs::create_dir_all(dir.join("static")).unwrap();
        fs::write(dir.join("static/home.html"), "<h1>devgate</h1>").unwrap();
        fs::create_dir_all(dir.join("scripts")).unwrap();

        let mut config = Config::new(dir);
        config.static_dir = dir.join("static");
        config.scripts_dir = dir.join("scripts");
        config.script_delay = Duration::from_secs(3600);
        AppState::new(config).unwrap()
    }

    fn get_request(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn heartbeat_and_static_bypass_a_full_pool() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let _held = state.admission.try_enter("someone-else", false).unwrap();
        let app = router(state);

        let busy = app.clone().oneshot(get_request("/terminal?action=poll")).await.unwrap();
        assert_eq!(busy.status(), StatusCode::SERVICE_UNAVAILABLE);

        let beat = app.clone().oneshot(get_request("/heartbeat")).await.unwrap();
        assert_eq!(beat.status(), StatusCode::OK);
        let body = to_bytes(beat.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], b"OK");

        let page = app.oneshot(get_request("/home.html")).await.unwrap();
        assert_eq!(page.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn new_clients_receive_a_session_cookie() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app.clone().oneshot(get_request("/terminal?action=poll")).await.unwrap();
        let cookie = response.headers()[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with(&format!("{SESSION_COOKIE}=")));

        let pair = cookie.split(';').next().unwrap().to_string();
        let again = app
            .oneshot(
                Request::builder()
                    .uri("/terminal?action=poll")
                    .header(header::COOKIE, pair)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert!(again.headers().get(header::SET_COOKIE).is_none());
    }

    #[tokio::test]
    async fn poll_envelope_shape() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app.oneshot(get_request("/terminal?action=poll")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["status"], 200);
        assert_eq!(json["message"], "Get output");
        assert_eq!(json["out"], "");
        assert_eq!(json["err"], "");
        assert_eq!(json["running"], "0");
        assert_eq!(json["path"], ".");
    }

    #[tokio::test]
    async fn unknown_actions_are_errors() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app.oneshot(get_request("/terminal?action=dance")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["status"], 500);
        assert_eq!(json["message"], "Unknown action: dance");
    }

    #[tokio::test]
    async fn malformed_requests_get_an_envelope() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app
            .clone()
            .oneshot(get_request("/terminal?action=start&cmd=ls&cmd=pwd"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let json = json_body(response).await;
        assert_eq!(json["status"], 500);
        assert!(json["message"].as_str().unwrap().contains("duplicate field"));

        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/project?action=write_file&project=Module.Hello&path=src/Bad.cs")
                    .body(Body::from(vec![0xff, 0xfe, 0xfd]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(json_body(response).await["status"], 500);
        assert!(!dir.path().join("Module.Hello/src/Bad.cs").exists());
    }

    #[tokio::test]
    async fn code_issue_requires_script() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = router(state.clone());

        let missing = json_body(app.clone().oneshot(get_request("/system")).await.unwrap()).await;
        assert_eq!(missing["message"], "missing action");

        let response = app.oneshot(get_request("/system?action=restart")).await.unwrap();
        let json = json_body(response).await;
        assert_eq!(json["status"], 500);
        assert_eq!(json["message"], "script not found for action: restart");
        assert!(json.get("code").is_none());
        assert!(state.privileged.codes().is_empty());
    }

    #[tokio::test]
    async fn code_round_trip_schedules_script() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        fs::write(
            dir.path().join("scripts").join(crate::scripts::PrivilegedAction::Close.script_name()),
            "exit 0\n",
        )
        .unwrap();
        let app = router(state);

        let response = app.clone().oneshot(get_request("/system?action=close")).await.unwrap();
        let issued = json_body(response).await;
        assert_eq!(issued["message"], "Verify close");
        let code = issued["code"].as_str().unwrap().to_string();

        let confirm = |body: String| {
            Request::builder()
                .method("POST")
                .uri("/system")
                .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(Body::from(body))
                .unwrap()
        };

        let ok = json_body(
            app.clone()
                .oneshot(confirm(format!("action=close&code={code}")))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(ok["status"], 200);
        assert_eq!(ok["message"], "Command scheduled");

        let bad = json_body(
            app.clone()
                .oneshot(confirm("action=close&code=forged".to_string()))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(bad["message"], "invalid or expired code");

        let response = app.oneshot(confirm("action=close".to_string())).await.unwrap();
        let missing = json_body(response).await;
        assert_eq!(missing["message"], "missing parameters");
    }

    #[tokio::test]
    async fn project_endpoints() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let response = app.clone().oneshot(get_request("/project?action=projects")).await.unwrap();
        let projects = json_body(response).await;
        assert!(projects["Module.Hello"].as_str().unwrap().ends_with("Module.Hello"));

        let listing = json_body(
            app.clone()
                .oneshot(get_request("/project?action=list&project=Module.Hello"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(listing["src"], "Dir");
        assert_eq!(listing["src/Hello.cs"], "File");

        let write = app
            .clone()
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/project?action=write_file&project=Module.Hello&path=src/New.cs")
                    .body(Body::from("class New {}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(json_body(write).await["message"], "Write file success: src/New.cs");

        let read = json_body(
            app.clone()
                .oneshot(get_request(
                    "/project?action=read_file&project=Module.Hello&path=src/New.cs",
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(read["file"], "src/New.cs");
        assert_eq!(read["content"], "class New {}");

        let escape = json_body(
            app.clone()
                .oneshot(get_request(
                    "/project?action=read_file&project=Module.Hello&path=../../etc/passwd",
                ))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(escape["status"], 500);
        assert!(escape.get("content").is_none());

        let unknown = json_body(
            app.oneshot(get_request("/project?action=list&project=Module.Nope"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(unknown["message"], "Project not found: Module.Nope");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminal_start_then_poll() {
        let dir = tempfile::tempdir().unwrap();
        let app = router(test_state(dir.path()));

        let started = json_body(
            app.clone()
                .oneshot(get_request("/terminal?action=start&cmd=echo%20hi"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(started["message"], "Command started");
        assert_eq!(started["running"], "1");

        let mut out = String::new();
        for _ in 0..500 {
            let response = app.clone().oneshot(get_request("/terminal?action=poll")).await.unwrap();
            let json = json_body(response).await;
            out.push_str(json["out"].as_str().unwrap());
            if json["running"] == "0" {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(out, "hi\n");

        let cd = json_body(
            app.oneshot(get_request("/terminal?action=start&cmd=cd%20Module.Hello"))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(cd["message"], "Directory changed");
        assert_eq!(cd["path"], "Module.Hello");
    }

    async fn boom() -> &'static str {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_handler_releases_slot() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());
        let app = with_layers(routes().route("/boom", get(boom)), state.clone());

        let response = app.oneshot(get_request("/boom")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(state.admission.active_count(), 0);
    }
}
