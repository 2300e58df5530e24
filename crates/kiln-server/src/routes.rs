use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::rejection::FormRejection;
use axum::extract::{ConnectInfo, Form, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header::CONTENT_TYPE};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use kiln::config::ServerConfig;
use kiln::orchestrator::render::{INVALID_ACTION, MISSING_PARAMETERS};
use kiln::{Action, Orchestrator, Rendered, ResponseKind, Submission};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::debug;

use crate::telemetry::metrics_endpoint;

/// Typed job status, for clients that do not want to scan the body
pub const STATUS_HEADER: HeaderName = HeaderName::from_static("x-kiln-status");

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub prometheus: Option<PrometheusHandle>,
}

/// Fields of the compile/run form
#[derive(Debug, Deserialize)]
pub struct CompileForm {
    action: Option<String>,
    code: Option<String>,
    input: Option<String>,
}

pub fn router(state: AppState, server: &ServerConfig) -> Router {
    Router::new()
        .route(&server.path, post(compile_endpoint))
        .route("/healthz", get(|| async { "ok" }))
        .route("/metrics", get(metrics_endpoint))
        .layer(RequestBodyLimitLayer::new(server.max_body_bytes))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(tracing::Level::INFO))
                .on_response(DefaultOnResponse::new().level(tracing::Level::INFO)),
        )
        .with_state(state)
}

async fn compile_endpoint(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    form: Result<Form<CompileForm>, FormRejection>,
) -> Response {
    let form = match form {
        Ok(Form(form)) => form,
        Err(rejection) => {
            debug!(%rejection, "unreadable form");
            return respond(Rendered::bad_request(MISSING_PARAMETERS));
        }
    };

    let (Some(action), Some(code)) = (form.action, form.code) else {
        return respond(Rendered::bad_request(MISSING_PARAMETERS));
    };
    let Ok(action) = action.parse::<Action>() else {
        return respond(Rendered::bad_request(INVALID_ACTION));
    };
    let submission = Submission::new(action, code).with_stdin(form.input.unwrap_or_default());

    // Dropping this handler (client went away) cancels the job
    let cancel = CancellationToken::new();
    let _cancel_on_drop = cancel.clone().drop_guard();

    let result = state
        .orchestrator
        .submit(addr.ip().to_string(), submission, cancel)
        .await;
    respond(state.orchestrator.renderer().result(&result))
}

fn respond(rendered: Rendered) -> Response {
    let status = match rendered.kind {
        ResponseKind::Ok => StatusCode::OK,
        ResponseKind::BadRequest => StatusCode::BAD_REQUEST,
        ResponseKind::Busy => StatusCode::SERVICE_UNAVAILABLE,
        ResponseKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        [
            (CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8")),
            (STATUS_HEADER, HeaderValue::from_static(rendered.status)),
        ],
        rendered.body,
    )
        .into_response()
}
