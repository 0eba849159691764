use std::path::PathBuf;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cdo_core::services::deployer::Deployer;
use cdo_core::services::dispatcher::Dispatcher;
use cdo_core::OrchestratorError;
use serde::Deserialize;

use crate::build_log;
use crate::webhook::{self, HookEvent, WebhookError};

const EVENT_HEADER: &str = "X-GitHub-Event";
const SIGNATURE_HEADER: &str = "X-Hub-Signature-256";
const ADMIN_TOKEN_HEADER: &str = "X-Admin-Token";
const DEFAULT_TAIL_LINES: usize = 200;

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub deployer: Deployer,
    pub dispatcher: Dispatcher,
    pub webhook_secret: Option<String>,
    pub admin_token: Option<String>,
    pub log_dir: PathBuf,
    /// Additional health-check path answering `pong`.
    pub pong_path: Option<String>,
}

impl AppState {
    pub fn new(deployer: Deployer, dispatcher: Dispatcher, log_dir: PathBuf) -> Self {
        let app = deployer.app();
        Self {
            webhook_secret: app.webhook_secret.clone(),
            admin_token: app.admin_token.clone(),
            deployer,
            dispatcher,
            log_dir,
            pong_path: None,
        }
    }
}

pub fn router(state: AppState) -> Router {
    let mut router = Router::new();
    if let Some(path) = state.pong_path.as_deref().filter(|p| p.starts_with('/') && *p != "/ping") {
        router = router.route(path, get(pong));
    }
    router
        .route("/ping", get(pong))
        .route("/hook", post(hook))
        .route("/hook/", post(hook))
        .route("/deployments", get(deployments))
        .route("/builds/:build/log", get(build_log_tail))
        .route("/branches/:label/terminate", post(terminate))
        .route("/branches/:label/deploy", post(deploy_again))
        .route("/branches/:label/promote", post(promote))
        .with_state(state)
}

/// Maps library errors onto status codes.
pub struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::InvalidLabel(_) | OrchestratorError::InvalidRef(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::NotDeployed(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("{}", self.0);
        }
        (status, self.0.to_string()).into_response()
    }
}

async fn pong() -> &'static str {
    "pong"
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn check_admin(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    match &state.admin_token {
        Some(token) if header(headers, ADMIN_TOKEN_HEADER) != Some(token.as_str()) => {
            Err((StatusCode::FORBIDDEN, "forbidden").into_response())
        }
        _ => Ok(()),
    }
}

async fn hook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    if let Some(secret) = &state.webhook_secret {
        let signature = header(&headers, SIGNATURE_HEADER);
        if let Err(e) = webhook::verify_signature(secret, &body, signature) {
            tracing::warn!("rejected hook delivery: {e}");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    }
    let event = header(&headers, EVENT_HEADER).unwrap_or_default();
    let parsed = match webhook::parse_event(&state.deployer.app().name, event, &body) {
        Ok(parsed) => parsed,
        Err(e @ WebhookError::Malformed(_)) => {
            tracing::warn!(event, "{e}");
            return (StatusCode::BAD_REQUEST, e.to_string()).into_response();
        }
        Err(e) => return (StatusCode::UNAUTHORIZED, e.to_string()).into_response(),
    };
    tracing::info!(event, "hook: {parsed:?}");

    match parsed {
        HookEvent::Ping => "pong".into_response(),
        HookEvent::Ignored(reason) => {
            tracing::info!("ignored: {reason}");
            "ignored".into_response()
        }
        HookEvent::Deploy { branch, reference } => {
            let deployer = state.deployer.clone();
            let name = format!("deploy {} {reference}", branch.label());
            state.dispatcher.dispatch(name, async move {
                deployer.deploy(branch, &reference, false).await.map(drop)
            });
            "okay".into_response()
        }
        HookEvent::Cleanup { branch } => {
            let deployer = state.deployer.clone();
            let name = format!("cleanup {}", branch.label());
            state
                .dispatcher
                .dispatch(name, async move { deployer.cleanup(branch, None).await.map(drop) });
            "okay".into_response()
        }
    }
}

async fn deployments(State(state): State<AppState>) -> Result<Response, ApiError> {
    Ok(Json(state.deployer.deployments().await?).into_response())
}

#[derive(Deserialize)]
struct TailQuery {
    lines: Option<usize>,
}

async fn build_log_tail(
    State(state): State<AppState>,
    Path(build): Path<String>,
    Query(query): Query<TailQuery>,
) -> Response {
    let Some(path) = build_log::log_path(&state.log_dir, &build) else {
        return (StatusCode::BAD_REQUEST, "bad build id").into_response();
    };
    match build_log::read_tail(&path, query.lines.unwrap_or(DEFAULT_TAIL_LINES)).await {
        Ok(tail) => tail.into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            (StatusCode::NOT_FOUND, format!("no log for {build}")).into_response()
        }
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response(),
    }
}

async fn terminate(
    State(state): State<AppState>,
    Path(label): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Err(denied) = check_admin(&state, &headers) {
        return Ok(denied);
    }
    let branch = state.deployer.branch(&label)?;
    if !state.deployer.deployments().await?.iter().any(|d| d.branch == label) {
        return Err(OrchestratorError::NotDeployed(label).into());
    }
    let deployer = state.deployer.clone();
    state.dispatcher.dispatch(format!("terminate {label}"), async move {
        deployer.cleanup(branch, None).await.map(drop)
    });
    Ok((StatusCode::ACCEPTED, format!("terminating {label}")).into_response())
}

async fn deploy_again(
    State(state): State<AppState>,
    Path(label): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Err(denied) = check_admin(&state, &headers) {
        return Ok(denied);
    }
    let reference = state.deployer.current_commit(&label, false).await?;
    let deployer = state.deployer.clone();
    let name = format!("deploy again {label}");
    state.dispatcher.dispatch(name, {
        let label = label.clone();
        async move { deployer.deploy_again(&label).await.map(drop) }
    });
    Ok((StatusCode::ACCEPTED, format!("deploying {label} {reference} again")).into_response())
}

async fn promote(
    State(state): State<AppState>,
    Path(label): Path<String>,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    if let Err(denied) = check_admin(&state, &headers) {
        return Ok(denied);
    }
    let reference = state.deployer.current_commit(&label, false).await?;
    let deployer = state.deployer.clone();
    let name = format!("promote {label}");
    state.dispatcher.dispatch(name, {
        let label = label.clone();
        async move { deployer.promote(&label).await.map(drop) }
    });
    Ok((StatusCode::ACCEPTED, format!("promoting {label} {reference}")).into_response())
}
