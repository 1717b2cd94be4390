//! HTTP server built on axum
//!
//! All routes live under `/api/v1` and answer with the same JSON envelope:
//! `{"status", "message", "data"?, "error"?: {"type", "message"}}`.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::messages::{ChatQuery, MessageCountQuery};
use crate::observer::NewMessageEvent;
use crate::service::{AttachmentSend, ReactionSend, SendService, TextSend};
use crate::socket;
use crate::uploads::ChunkAssembler;
use axum::{
    body::{Body, Bytes},
    extract::{DefaultBodyLimit, Multipart, Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self as axum_middleware, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Largest JSON body the auth middleware will buffer
const MAX_JSON_BODY: usize = 1024 * 1024;
/// Largest multipart attachment upload
const MAX_UPLOAD_BYTES: usize = 100 * 1024 * 1024;

/// Shared secret check. `None` rejects everything.
#[derive(Clone)]
pub struct AuthConfig {
    pub password: Option<String>,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("password", &self.password.as_ref().map(|_| "[redacted]"))
            .finish()
    }
}

impl AuthConfig {
    pub fn check(&self, supplied: Option<&str>) -> bool {
        match (&self.password, supplied) {
            (Some(expected), Some(given)) => expected == given,
            _ => false,
        }
    }
}

/// Shared state for request handlers
#[derive(Clone)]
pub struct AppState {
    pub service: Arc<SendService>,
    pub events: broadcast::Sender<NewMessageEvent>,
    pub auth: AuthConfig,
    pub uploads: Arc<ChunkAssembler>,
}

impl AppState {
    pub fn new(
        config: &Config,
        service: Arc<SendService>,
        events: broadcast::Sender<NewMessageEvent>,
    ) -> Self {
        Self {
            service,
            events,
            auth: AuthConfig {
                password: config.password.clone(),
            },
            uploads: Arc::new(ChunkAssembler::new(&config.attachments_dir)),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub message: String,
}

impl From<&Error> for ErrorBody {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct Envelope<T: Serialize> {
    status: u16,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<ErrorBody>,
}

fn ok<T: Serialize>(data: T) -> Response {
    Json(Envelope {
        status: 200,
        message: "Success",
        data: Some(data),
        error: None,
    })
    .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let code = self.status_code();
        if code >= 500 {
            error!(status = code, error = %self, "request failed");
        } else {
            warn!(status = code, error = %self, "request rejected");
        }
        let message = match code {
            400 => "Bad Request",
            401 => "Unauthorized",
            404 => "Not Found",
            504 => "Send outcome unknown",
            _ => "Server Error",
        };
        let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Envelope::<()> {
            status: code,
            message,
            data: None,
            error: Some(ErrorBody::from(&self)),
        };
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AuthQuery {
    #[serde(default)]
    pub password: Option<String>,
}

/// Accepts the password from the query string, or from a JSON body's `password` field
pub async fn auth_middleware(
    State(auth): State<AuthConfig>,
    request: Request,
    next: Next,
) -> Response {
    if auth.password.is_none() {
        error!("no password configured -- rejecting request");
        return Error::Unauthorized.into_response();
    }

    let query_password = Query::<AuthQuery>::try_from_uri(request.uri())
        .ok()
        .and_then(|Query(q)| q.password);
    if auth.check(query_password.as_deref()) {
        return next.run(request).await;
    }

    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return Error::Unauthorized.into_response();
    }

    let (parts, body) = request.into_parts();
    let bytes = match axum::body::to_bytes(body, MAX_JSON_BODY).await {
        Ok(b) => b,
        Err(_) => return Error::Validation("request body too large".to_string()).into_response(),
    };
    let body_password = serde_json::from_slice::<AuthQuery>(&bytes)
        .ok()
        .and_then(|q| q.password);
    if !auth.check(body_password.as_deref()) {
        return Error::Unauthorized.into_response();
    }
    next.run(Request::from_parts(parts, Body::from(bytes))).await
}

/// Build the `/api/v1` router
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/ping", get(ping))
        .route("/message/text", post(send_text))
        .route(
            "/message/attachment",
            post(send_attachment).layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route("/message/react", post(send_reaction))
        .route("/message/count", get(message_count))
        .route("/message/{guid}", get(get_message))
        .route("/attachment/{guid}", get(get_attachment))
        .route("/attachment/{guid}/download", get(download_attachment))
        .route("/chat", get(list_chats))
        .route("/chat/{guid}", get(get_chat))
        .route("/chat/{guid}/typing", post(start_typing).delete(stop_typing))
        .route_layer(axum_middleware::from_fn_with_state(
            state.auth.clone(),
            auth_middleware,
        ))
        .with_state(state.clone());

    // Socket auth happens during the handshake
    let socket_routes = Router::new()
        .route("/socket", get(socket::ws_handler))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api.merge(socket_routes))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub async fn start_server(config: &Config, state: AppState) -> Result<()> {
    let app = router(state);
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "HTTP server listening");
    axum::serve(listener, app).await?;
    Ok(())
}

fn parse_json<T: DeserializeOwned>(body: &Bytes) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| Error::Validation(format!("invalid JSON body: {}", e)))
}

async fn ping() -> Response {
    ok("pong")
}

async fn send_text(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let req: TextSend = parse_json(&body)?;
    let message = state.service.send_text(req).await?;
    Ok(ok(message))
}

async fn send_reaction(State(state): State<AppState>, body: Bytes) -> Result<Response> {
    let req: ReactionSend = parse_json(&body)?;
    let message = state.service.send_reaction(req).await?;
    Ok(ok(message))
}

async fn send_attachment(State(state): State<AppState>, mut multipart: Multipart) -> Result<Response> {
    let mut req = AttachmentSend::default();
    let mut file: Option<(String, Bytes)> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| Error::Validation(format!("invalid multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        if name == "attachment" {
            let file_name = field.file_name().unwrap_or_default().to_string();
            let bytes = field
                .bytes()
                .await
                .map_err(|e| Error::Validation(format!("attachment read failed: {}", e)))?;
            file = Some((file_name, bytes));
            continue;
        }
        let value = field
            .text()
            .await
            .map_err(|e| Error::Validation(format!("field {} unreadable: {}", name, e)))?;
        match name.as_str() {
            "chatGuid" => req.chat_guid = value,
            "tempGuid" => req.temp_guid = value,
            "name" => req.name = value,
            "method" => req.method = Some(value),
            _ => {}
        }
    }

    let (file_name, bytes) = file.ok_or_else(|| Error::Validation("attachment is required".to_string()))?;
    if req.name.is_empty() {
        req.name = file_name;
    }
    let path = state.uploads.path_for(&Uuid::new_v4().to_string(), &req.name)?;
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&path, &bytes).await?;
    req.path = path.clone();

    match state.service.send_attachment(req).await {
        Ok(message) => Ok(ok(message)),
        Err(e) => {
            if e.is_rejection() {
                state.uploads.discard(&path).await;
            }
            Err(e)
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct CountParams {
    chat_guid: Option<String>,
    /// Milliseconds since the Unix epoch
    after: Option<i64>,
    is_from_me: Option<bool>,
}

async fn message_count(State(state): State<AppState>, Query(params): Query<CountParams>) -> Result<Response> {
    let query = MessageCountQuery {
        chat_guid: params.chat_guid.filter(|g| !g.is_empty()),
        after: params.after.and_then(DateTime::<Utc>::from_timestamp_millis),
        is_from_me: params.is_from_me,
    };
    let total = state.service.get_message_count(query).await?;
    Ok(ok(serde_json::json!({ "total": total })))
}

async fn get_message(State(state): State<AppState>, Path(guid): Path<String>) -> Result<Response> {
    Ok(ok(state.service.get_message(&guid).await?))
}

async fn get_attachment(State(state): State<AppState>, Path(guid): Path<String>) -> Result<Response> {
    Ok(ok(state.service.get_attachment(&guid).await?))
}

async fn download_attachment(State(state): State<AppState>, Path(guid): Path<String>) -> Result<Response> {
    let attachment = state.service.get_attachment(&guid).await?;
    let bytes = match tokio::fs::read(&attachment.path).await {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(Error::AttachmentNotFound(guid));
        }
        Err(e) => return Err(e.into()),
    };
    let disposition = format!(
        "attachment; filename=\"{}\"",
        attachment.transfer_name.replace('"', "")
    );
    Ok((
        [
            (header::CONTENT_TYPE, attachment.mime_type),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatParams {
    query: Option<String>,
    limit: Option<u32>,
}

async fn list_chats(State(state): State<AppState>, Query(params): Query<ChatParams>) -> Result<Response> {
    let chats = state
        .service
        .get_chats(ChatQuery {
            query: params.query,
            limit: params.limit,
        })
        .await?;
    Ok(ok(chats))
}

async fn get_chat(State(state): State<AppState>, Path(guid): Path<String>) -> Result<Response> {
    Ok(ok(state.service.get_chat(&guid).await?))
}

async fn start_typing(State(state): State<AppState>, Path(guid): Path<String>) -> Result<Response> {
    state.service.start_typing(&guid).await?;
    Ok(ok(serde_json::Value::Null))
}

async fn stop_typing(State(state): State<AppState>, Path(guid): Path<String>) -> Result<Response> {
    state.service.stop_typing(&guid).await?;
    Ok(ok(serde_json::Value::Null))
}
