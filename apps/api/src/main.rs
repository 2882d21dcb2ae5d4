use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use sandbox::{
    detect_binary, Outcome, SecurityViolation, ToolCommand, Toolbox, ToolboxConfig, Verdict,
    DEFAULT_ANALYSIS_TIMEOUT, DEFAULT_MAX_FILE_SIZE, DEFAULT_TEST_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{dispatcher, error, info, info_span, warn, Instrument};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

const SECURITY_VIOLATION_CODE: i64 = -32010;

#[derive(Clone)]
struct AppState {
    toolbox: Arc<Toolbox>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;
    let bind_addr = resolve_bind_address()?;
    let config = toolbox_config()?;
    for command in [&config.pylint, &config.pytest] {
        if detect_binary(command.program()).is_none() {
            warn!(program = command.program(), "tool not found, calls using it will fail");
        }
    }
    let toolbox = Toolbox::new(config).context("failed to prepare sandbox root")?;
    info!(root = %toolbox.root().display(), "sandbox ready");

    let state = AppState {
        toolbox: Arc::new(toolbox),
    };
    let app = router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind {bind_addr}"))?;
    info!(%bind_addr, "server starting");
    axum::serve(listener, app).await?;
    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/rpc", post(handle_rpc))
        .with_state(state)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
}

fn init_tracing() -> anyhow::Result<()> {
    if dispatcher::has_been_set() {
        return Ok(());
    }

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=info".into());
    let fmt_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()?;
    Ok(())
}

fn resolve_bind_address() -> anyhow::Result<SocketAddr> {
    let raw = std::env::var("API_BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:6813".to_string());
    raw.parse()
        .with_context(|| format!("invalid API_BIND_ADDR '{raw}'"))
}

fn toolbox_config() -> anyhow::Result<ToolboxConfig> {
    let analysis_timeout = env_millis("SANDBOX_ANALYSIS_TIMEOUT_MS", DEFAULT_ANALYSIS_TIMEOUT)?;
    let test_timeout = env_millis("SANDBOX_TEST_TIMEOUT_MS", DEFAULT_TEST_TIMEOUT)?;
    let pylint = tool_command("SANDBOX_PYLINT", "pylint", analysis_timeout)?;
    let pytest = tool_command("SANDBOX_PYTEST", "pytest", test_timeout)?;
    let max_file_size = match std::env::var("SANDBOX_MAX_FILE_SIZE") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid SANDBOX_MAX_FILE_SIZE '{raw}'"))?,
        Err(_) => DEFAULT_MAX_FILE_SIZE,
    };
    Ok(ToolboxConfig::new(sandbox_root()?)
        .with_max_file_size(max_file_size)
        .with_pylint(pylint)
        .with_pytest(pytest))
}

fn sandbox_root() -> anyhow::Result<PathBuf> {
    let raw = std::env::var("SANDBOX_ROOT").unwrap_or_else(|_| "./sandbox".to_string());
    let path = PathBuf::from(&raw);
    if path.is_absolute() {
        Ok(path)
    } else {
        let cwd = std::env::current_dir()?;
        Ok(cwd.join(path))
    }
}

fn env_millis(name: &str, default: Duration) -> anyhow::Result<Duration> {
    match std::env::var(name) {
        Ok(raw) => {
            let millis: u64 = raw
                .trim()
                .parse()
                .with_context(|| format!("invalid {name} '{raw}'"))?;
            Ok(Duration::from_millis(millis))
        }
        Err(_) => Ok(default),
    }
}

fn tool_command(name: &str, default: &str, timeout: Duration) -> anyhow::Result<ToolCommand> {
    let line = std::env::var(name).unwrap_or_else(|_| default.to_string());
    ToolCommand::parse(&line, timeout).with_context(|| format!("invalid {name} '{line}'"))
}

async fn health() -> impl IntoResponse {
    (StatusCode::OK, Json(json!({ "status": "ok" })))
}

async fn handle_rpc(State(state): State<AppState>, Json(req): Json<RpcRequest>) -> impl IntoResponse {
    if req.jsonrpc != "2.0" {
        return Json(RpcResponse::error(
            req.id,
            -32600,
            "invalid jsonrpc version",
            None,
        ));
    }

    let request_id = Uuid::new_v4();
    let span = info_span!("rpc", %request_id, method = %req.method);
    let response = match process_request(&state, &req.method, req.params)
        .instrument(span.clone())
        .await
    {
        Ok(result) => RpcResponse::success(req.id, result),
        Err(err) => {
            span.in_scope(|| error!(code = err.code, message = %err.message, "rpc error"));
            RpcResponse::error(req.id, err.code, &err.message, err.data)
        }
    };
    Json(response)
}

async fn process_request(
    state: &AppState,
    method: &str,
    params: Option<Value>,
) -> std::result::Result<Value, RpcMethodError> {
    let toolbox = &state.toolbox;
    match method {
        "read_file" => {
            let params: PathParams = parse_params(params)?;
            respond(toolbox.read_file(Path::new(&params.path)))
        }
        "write_file" => {
            let params: WriteParams = parse_params(params)?;
            respond(toolbox.write_file(
                Path::new(&params.path),
                &params.content,
                params.create_backup,
            ))
        }
        "create_backup" => {
            let params: PathParams = parse_params(params)?;
            respond(toolbox.create_backup(Path::new(&params.path)))
        }
        "restore_backup" => {
            let params: RestoreParams = parse_params(params)?;
            respond(toolbox.restore_backup(
                Path::new(&params.backup_path),
                Path::new(&params.target_path),
            ))
        }
        "list_backups" => {
            let params: OptionalPathParams = parse_params(params)?;
            respond(toolbox.list_backups(params.path.as_deref().map(Path::new)))
        }
        "list_files" => {
            let params: ListFilesParams = parse_params(params)?;
            respond(toolbox.list_files(&params.pattern))
        }
        "file_info" => {
            let params: PathParams = parse_params(params)?;
            respond(toolbox.file_info(Path::new(&params.path)))
        }
        "run_pylint" => {
            let params: PathParams = parse_params(params)?;
            respond(toolbox.run_pylint(Path::new(&params.path)).await)
        }
        "run_pytest" => {
            let params: PytestParams = parse_params(params)?;
            let target = params.target.as_deref().map(Path::new);
            respond(toolbox.run_pytest(target, params.verbose).await)
        }
        "validate_target_dir" => {
            let params: PathParams = parse_params(params)?;
            let validation = toolbox
                .validate_target_dir(Path::new(&params.path))
                .map_err(RpcMethodError::security)?;
            to_value(&validation)
        }
        "sandbox_info" => to_value(&toolbox.sandbox_info()),
        other => Err(RpcMethodError::new(
            -32601,
            "method not found",
            Some(json!({ "method": other })),
        )),
    }
}

fn respond<T: Serialize + Verdict>(outcome: Outcome<T>) -> std::result::Result<Value, RpcMethodError> {
    let result = outcome.map_err(RpcMethodError::security)?;
    to_value(&result)
}

fn to_value<T: Serialize>(value: &T) -> std::result::Result<Value, RpcMethodError> {
    serde_json::to_value(value).map_err(|err| RpcMethodError::internal(&err.to_string()))
}

fn parse_params<T: for<'a> Deserialize<'a>>(
    params: Option<Value>,
) -> std::result::Result<T, RpcMethodError> {
    let value = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(value).map_err(|err| {
        RpcMethodError::new(
            -32602,
            "invalid params",
            Some(json!({ "detail": err.to_string() })),
        )
    })
}

#[derive(Debug, Deserialize)]
struct RpcRequest {
    jsonrpc: String,
    method: String,
    params: Option<Value>,
    id: Value,
}

#[derive(Debug, Serialize)]
struct RpcResponse {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<RpcError>,
    id: Value,
}

impl RpcResponse {
    fn success(id: Value, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    fn error(id: Value, code: i64, message: &str, data: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(RpcError {
                code,
                message: message.to_string(),
                data,
            }),
            id,
        }
    }
}

#[derive(Debug, Serialize)]
struct RpcError {
    code: i64,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

#[derive(Debug)]
struct RpcMethodError {
    code: i64,
    message: String,
    data: Option<Value>,
}

impl RpcMethodError {
    fn new(code: i64, message: &str, data: Option<Value>) -> Self {
        Self {
            code,
            message: message.to_string(),
            data,
        }
    }

    fn security(violation: SecurityViolation) -> Self {
        Self::new(
            SECURITY_VIOLATION_CODE,
            &violation.to_string(),
            Some(json!({
                "error_kind": "security_violation",
                "requested": violation.requested,
            })),
        )
    }

    fn internal(detail: &str) -> Self {
        Self::new(-32603, "internal error", Some(json!({ "detail": detail })))
    }
}

#[derive(Debug, Deserialize)]
struct PathParams {
    path: String,
}

#[derive(Debug, Deserialize)]
struct OptionalPathParams {
    #[serde(default)]
    path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WriteParams {
    path: String,
    content: String,
    #[serde(default = "default_true")]
    create_backup: bool,
}

#[derive(Debug, Deserialize)]
struct RestoreParams {
    backup_path: String,
    target_path: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ListFilesParams {
    #[serde(default = "default_pattern")]
    pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PytestParams {
    #[serde(default, alias = "test_path")]
    target: Option<String>,
    #[serde(default = "default_true")]
    verbose: bool,
}

fn default_true() -> bool {
    true
}

fn default_pattern() -> String {
    "*".to_string()
}
