use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use agent_console_error::{ConsoleError, ErrorType, ProblemDetails};
use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::Span;
use utoipa::{OpenApi, ToSchema};

use crate::channel::EventStream;
use crate::events::NormalizedEvent;
use crate::permissions::{PermissionPolicy, PermissionReply, PolicyMode, RespondOutcome};
use crate::registry::PendingInfo;
use crate::service::{PendingStatus, SendMessage, SessionService, StartChat};
use crate::store::{ChatMetadata, ChatRecord};

mod support;
mod types;

use self::support::*;
pub use self::types::*;

/// Response header carrying the temporary key of a chat started with
/// `POST /v1/chats`.
pub const SESSION_KEY_HEADER: &str = "x-session-key";
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct AppState {
    service: Arc<SessionService>,
}

impl AppState {
    pub fn new(service: SessionService) -> Self {
        Self {
            service: Arc::new(service),
        }
    }

    pub fn service(&self) -> Arc<SessionService> {
        self.service.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    build_router_with_state(Arc::new(state)).0
}

pub fn build_router_with_state(shared: Arc<AppState>) -> (Router, Arc<AppState>) {
    let v1_router = Router::new()
        .route("/health", get(get_health))
        .route("/openapi.json", get(get_openapi))
        .route("/chats", get(list_chats).post(create_chat))
        .route("/chats/:key", get(get_chat))
        .route("/chats/:key/messages", post(post_message))
        .route("/chats/:key/stream", get(stream_chat))
        .route("/chats/:key/pending", get(get_pending))
        .route("/chats/:key/respond", post(respond_permission))
        .route("/chats/:key/stop", post(stop_chat))
        .route("/chats/:key/permissions", axum::routing::put(put_permissions))
        .with_state(shared.clone());

    let mut router = Router::new().nest("/v1", v1_router).fallback(not_found);

    let http_logging = match std::env::var("AGENT_CONSOLE_LOG_HTTP") {
        Ok(value) if value == "0" || value.eq_ignore_ascii_case("false") => false,
        _ => true,
    };
    if http_logging {
        let trace_layer = TraceLayer::new_for_http()
            .make_span_with(|req: &Request<_>| {
                tracing::info_span!("http.request", method = %req.method(), uri = %req.uri())
            })
            .on_request(|_req: &Request<_>, span: &Span| {
                tracing::info!(parent: span, "request");
            })
            .on_response(|res: &Response<_>, latency: Duration, span: &Span| {
                tracing::info!(
                    parent: span,
                    status = %res.status(),
                    latency_ms = latency.as_millis()
                );
            });
        router = router.layer(trace_layer);
    }

    (router, shared)
}

pub async fn shutdown_sessions(state: &Arc<AppState>) {
    state.service.shutdown().await;
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        list_chats,
        get_chat,
        create_chat,
        post_message,
        stream_chat,
        get_pending,
        respond_permission,
        stop_chat,
        put_permissions
    ),
    components(
        schemas(
            HealthResponse,
            ChatListResponse,
            ChatResponse,
            ChatRecord,
            ChatMetadata,
            CreateChatRequest,
            MessageRequest,
            ImageInput,
            PendingStatus,
            PendingInfo,
            PermissionReply,
            RespondOutcome,
            StopResponse,
            PermissionPolicy,
            PolicyMode,
            ProblemDetails,
            ErrorType
        )
    ),
    tags(
        (name = "meta", description = "Service metadata"),
        (name = "chats", description = "Chat sessions and event streams")
    )
)]
pub struct ApiDoc;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Console(#[from] ConsoleError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Console(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (
            status,
            [(header::CONTENT_TYPE, "application/problem+json")],
            Json(problem),
        )
            .into_response()
    }
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "meta"
)]
async fn get_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        agent: state.service.backend_name().to_string(),
    })
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[utoipa::path(
    get,
    path = "/v1/chats",
    responses(
        (status = 200, body = ChatListResponse),
        (status = 500, body = ProblemDetails)
    ),
    tag = "chats"
)]
async fn list_chats(State(state): State<Arc<AppState>>) -> Result<Json<ChatListResponse>, ApiError> {
    let chats = state.service.list_chats().await?;
    Ok(Json(ChatListResponse { chats }))
}

#[utoipa::path(
    get,
    path = "/v1/chats/{key}",
    params(("key" = String, Path, description = "Chat key")),
    responses(
        (status = 200, body = ChatResponse),
        (status = 404, body = ProblemDetails)
    ),
    tag = "chats"
)]
async fn get_chat(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Json<ChatResponse>, ApiError> {
    let (chat, active) = state.service.get_chat(&key).await?;
    Ok(Json(ChatResponse { chat, active }))
}

#[utoipa::path(
    post,
    path = "/v1/chats",
    request_body = CreateChatRequest,
    responses(
        (status = 200, description = "SSE stream of chat events; the x-session-key header carries the temporary key"),
        (status = 400, body = ProblemDetails)
    ),
    tag = "chats"
)]
async fn create_chat(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateChatRequest>,
) -> Result<Response, ApiError> {
    let images = decode_images(request.images)?;
    let started = state
        .service
        .start_chat(StartChat {
            folder: request.folder,
            message: request.message,
            images,
            permissions: request.permissions,
            plugins: request.plugins,
        })
        .await?;
    let mut response = sse_response(started.events).into_response();
    if let Ok(value) = HeaderValue::from_str(&started.key) {
        response.headers_mut().insert(SESSION_KEY_HEADER, value);
    }
    Ok(response)
}

#[utoipa::path(
    post,
    path = "/v1/chats/{key}/messages",
    request_body = MessageRequest,
    params(("key" = String, Path, description = "Chat key")),
    responses(
        (status = 200, description = "SSE stream of chat events"),
        (status = 400, body = ProblemDetails),
        (status = 404, body = ProblemDetails)
    ),
    tag = "chats"
)]
async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(request): Json<MessageRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let images = decode_images(request.images)?;
    let started = state
        .service
        .send_message(
            &key,
            SendMessage {
                message: request.message,
                images,
                plugins: request.plugins,
            },
        )
        .await?;
    Ok(sse_response(started.events))
}

#[utoipa::path(
    get,
    path = "/v1/chats/{key}/stream",
    params(("key" = String, Path, description = "Chat key")),
    responses(
        (status = 200, description = "SSE stream from the live session or the CLI session log"),
        (status = 404, body = ProblemDetails)
    ),
    tag = "chats"
)]
async fn stream_chat(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let source = state.service.reconnect(&key).await?;
    Ok(sse_response(source.into_events()))
}

#[utoipa::path(
    get,
    path = "/v1/chats/{key}/pending",
    params(("key" = String, Path, description = "Chat key")),
    responses((status = 200, body = PendingStatus)),
    tag = "chats"
)]
async fn get_pending(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<PendingStatus> {
    Json(state.service.pending(&key).await)
}

#[utoipa::path(
    post,
    path = "/v1/chats/{key}/respond",
    request_body = PermissionReply,
    params(("key" = String, Path, description = "Chat key")),
    responses((status = 200, body = RespondOutcome)),
    tag = "chats"
)]
async fn respond_permission(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(reply): Json<PermissionReply>,
) -> Json<RespondOutcome> {
    Json(state.service.respond(&key, reply).await)
}

#[utoipa::path(
    post,
    path = "/v1/chats/{key}/stop",
    params(("key" = String, Path, description = "Chat key")),
    responses((status = 200, body = StopResponse)),
    tag = "chats"
)]
async fn stop_chat(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
) -> Json<StopResponse> {
    let stopped = state.service.stop(&key).await;
    Json(StopResponse { stopped })
}

#[utoipa::path(
    put,
    path = "/v1/chats/{key}/permissions",
    request_body = PermissionPolicy,
    params(("key" = String, Path, description = "Chat key")),
    responses(
        (status = 200, body = ChatRecord),
        (status = 404, body = ProblemDetails)
    ),
    tag = "chats"
)]
async fn put_permissions(
    State(state): State<Arc<AppState>>,
    Path(key): Path<String>,
    Json(policy): Json<PermissionPolicy>,
) -> Result<Json<ChatRecord>, ApiError> {
    let record = state.service.set_permissions(&key, policy).await?;
    Ok(Json(record))
}

fn sse_response(events: EventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let stream = events.map(|event| Ok::<Event, Infallible>(to_sse_event(&event)));
    Sse::new(stream).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}

fn to_sse_event(event: &NormalizedEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data("{}"))
}
