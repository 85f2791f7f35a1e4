//! HTTP adapter
//!
//! Turns requests into commands and pushes diffs to clients as Server-Sent Events:
//!
//! - `POST /api/:entity/:method` dispatches a command
//! - `GET /api/:entity/state` returns the full snapshot
//! - `DELETE /api/:entity` deletes the resolved instance
//! - `GET /events?keys=..` opens an event stream
//! - `POST|DELETE /events/:connection/subscriptions` and `POST /events/:connection/ack`
//!
//! Scope context comes from the `x-session-id` and `x-user-id` headers and the
//! `record_id` and `component_id` query parameters.

use crate::connection::{Connection, ConnectionId, OutboundFrame, SseEvent};
use crate::core::{FieldMap, StateError, StateKey};
use crate::dispatch::{Actor, CommandRequest, Fragment};
use crate::engine::LiveState;
use crate::scope::ScopeContext;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

pub const SESSION_HEADER: &str = "x-session-id";
pub const USER_HEADER: &str = "x-user-id";

const RECORD_PARAM: &str = "record_id";
const COMPONENT_PARAM: &str = "component_id";

pub type Result<T> = std::result::Result<T, WebError>;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

#[derive(Debug)]
pub enum WebError {
    State(StateError),
    Input(String),
}

impl From<StateError> for WebError {
    fn from(err: StateError) -> Self {
        WebError::State(err)
    }
}

impl WebError {
    fn parts(&self) -> (StatusCode, String) {
        let code = |code: &str| code.to_string();
        match self {
            WebError::Input(_) => (StatusCode::UNPROCESSABLE_ENTITY, code("input_error")),
            WebError::State(err) => match err {
                StateError::MissingContext { .. } => (StatusCode::BAD_REQUEST, code("missing_context")),
                StateError::KeyMismatch(_) => (StatusCode::BAD_REQUEST, code("key_mismatch")),
                StateError::ArgumentBinding { .. } => {
                    (StatusCode::UNPROCESSABLE_ENTITY, code("argument_binding"))
                }
                StateError::UnknownEntity(_) | StateError::UnknownMethod { .. } => {
                    (StatusCode::NOT_FOUND, code("not_found"))
                }
                StateError::CommandExecution(rejection) if rejection.is_validation() => {
                    (StatusCode::UNPROCESSABLE_ENTITY, rejection.code.clone())
                }
                StateError::CommandExecution(rejection) => (StatusCode::CONFLICT, rejection.code.clone()),
                StateError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, code("timeout")),
                StateError::Persistence(_) => (StatusCode::SERVICE_UNAVAILABLE, code("persistence_error")),
                StateError::SubscriptionLimit(_) => {
                    (StatusCode::TOO_MANY_REQUESTS, code("subscription_limit"))
                }
                StateError::ConnectionClosed(_) => (StatusCode::GONE, code("connection_closed")),
                StateError::InvalidConfig(_) => (StatusCode::INTERNAL_SERVER_ERROR, code("internal_error")),
            },
        }
    }
}

impl IntoResponse for WebError {
    fn into_response(self) -> Response {
        let (status, code) = self.parts();
        let message = match self {
            WebError::State(StateError::CommandExecution(rejection)) => rejection.message,
            WebError::State(err) => err.to_string(),
            WebError::Input(message) => message,
        };

        let body = Json(ErrorResponse {
            error: message,
            code,
        });
        (status, body).into_response()
    }
}

/// Router over a shared engine.
pub fn router(engine: Arc<LiveState>) -> Router {
    Router::new()
        .route("/api/:entity/state", get(entity_state))
        .route("/api/:entity/:method", post(entity_command))
        .route("/api/:entity", delete(entity_delete))
        .route("/events", get(event_stream))
        .route(
            "/events/:connection/subscriptions",
            post(subscribe).delete(unsubscribe),
        )
        .route("/events/:connection/ack", post(acknowledge))
        .route("/stats", get(stats))
        .layer(TraceLayer::new_for_http())
        .with_state(engine)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}

fn scope_context(headers: &HeaderMap, query: &HashMap<String, String>) -> ScopeContext {
    ScopeContext {
        session_id: header_value(headers, SESSION_HEADER),
        user_id: header_value(headers, USER_HEADER),
        component_id: query.get(COMPONENT_PARAM).cloned(),
        record_id: query.get(RECORD_PARAM).cloned(),
    }
}

/// Query parameters merged with a JSON object body; body values win.
fn command_arguments(query: HashMap<String, String>, body: &Bytes) -> Result<FieldMap> {
    let mut arguments: FieldMap = query
        .into_iter()
        .filter(|(name, _)| name != RECORD_PARAM && name != COMPONENT_PARAM)
        .map(|(name, value)| (name, Value::String(value)))
        .collect();

    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(arguments);
    }
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(object)) => arguments.extend(object),
        Ok(Value::Null) => {}
        Ok(_) => return Err(WebError::Input("request body must be a JSON object".to_string())),
        Err(err) => return Err(WebError::Input(format!("invalid JSON body: {err}"))),
    }
    Ok(arguments)
}

fn wants_event_stream(headers: &HeaderMap) -> bool {
    headers
        .get(header::ACCEPT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|accept| accept.contains("text/event-stream"))
}

#[derive(Debug, Serialize)]
pub struct CommandResponse {
    pub key: String,
    pub version: u64,
    pub changed_fields: FieldMap,
    pub fragments: Vec<Fragment>,
    pub result: Option<Value>,
}

async fn entity_command(
    State(engine): State<Arc<LiveState>>,
    Path((entity, method)): Path<(String, String)>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let context = scope_context(&headers, &query);
    let key = engine.resolve_key(&entity, &context)?;
    let mut request = CommandRequest::new(key, method).arguments(command_arguments(query, &body)?);
    if let Some(user) = context.user_id.as_deref() {
        request = request.actor(Actor::new(user));
    }

    let (diff, result) = engine.dispatch(request).await?.into_result()?;

    if wants_event_stream(&headers) {
        let body = OutboundFrame::Diff(Arc::new(diff)).encode_sse();
        return Ok(([(header::CONTENT_TYPE, "text/event-stream")], body).into_response());
    }

    Ok(Json(CommandResponse {
        key: diff.key.to_string(),
        version: diff.version,
        changed_fields: diff.changed_fields,
        fragments: diff.fragments,
        result,
    })
    .into_response())
}

async fn entity_state(
    State(engine): State<Arc<LiveState>>,
    Path(entity): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let key = engine.resolve_key(&entity, &scope_context(&headers, &query))?;
    let instance = engine.state(&key).await?;
    Ok(Json(json!({
        "key": key.to_string(),
        "version": instance.version,
        "fields": instance.fields,
    })))
}

async fn entity_delete(
    State(engine): State<Arc<LiveState>>,
    Path(entity): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
) -> Result<Json<Value>> {
    let key = engine.resolve_key(&entity, &scope_context(&headers, &query))?;
    let deleted = engine.delete(&key).await?;
    Ok(Json(json!({ "deleted": deleted })))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(default)]
    keys: Option<String>,
}

fn parse_keys(raw: Option<&str>) -> Result<Vec<StateKey>> {
    raw.unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(|key| key.parse::<StateKey>().map_err(WebError::from))
        .collect()
}

fn to_axum_event(event: SseEvent) -> Event {
    let mut out = Event::default().event(event.event);
    if let Some(id) = event.id {
        out = out.id(id);
    }
    if !event.data.is_empty() {
        out = out.data(event.data.join("\n"));
    }
    out
}

/// Frames of one connection as SSE events, ending when the connection closes.
fn connection_events(
    engine: Arc<LiveState>,
    connection: Connection,
) -> impl Stream<Item = std::result::Result<Event, Infallible>> {
    stream::unfold((engine, connection), |(engine, mut connection)| async move {
        let frame = connection.recv().await?;
        if matches!(frame, OutboundFrame::Heartbeat { .. }) {
            // The transport pulled the keep-alive off the queue, so the client is draining.
            let _ = engine.acknowledge(connection.id());
        }
        let events: Vec<std::result::Result<Event, Infallible>> = frame
            .to_sse_events()
            .into_iter()
            .map(|event| Ok(to_axum_event(event)))
            .collect();
        Some((stream::iter(events), (engine, connection)))
    })
    .flatten()
}

async fn event_stream(
    State(engine): State<Arc<LiveState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = std::result::Result<Event, Infallible>>>> {
    let keys = parse_keys(query.keys.as_deref())?;
    let connection = engine.open_connection(keys)?;
    Ok(Sse::new(connection_events(engine, connection)))
}

#[derive(Debug, Deserialize)]
struct SubscriptionBody {
    key: String,
}

async fn subscribe(
    State(engine): State<Arc<LiveState>>,
    Path(connection): Path<ConnectionId>,
    Json(body): Json<SubscriptionBody>,
) -> Result<Json<Value>> {
    let key: StateKey = body.key.parse()?;
    let added = engine.subscribe(connection, key)?;
    Ok(Json(json!({ "subscribed": added })))
}

async fn unsubscribe(
    State(engine): State<Arc<LiveState>>,
    Path(connection): Path<ConnectionId>,
    Json(body): Json<SubscriptionBody>,
) -> Result<Json<Value>> {
    let key: StateKey = body.key.parse()?;
    let removed = engine.unsubscribe(connection, &key)?;
    Ok(Json(json!({ "unsubscribed": removed })))
}

async fn acknowledge(
    State(engine): State<Arc<LiveState>>,
    Path(connection): Path<ConnectionId>,
) -> Result<StatusCode> {
    engine.acknowledge(connection)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn stats(State(engine): State<Arc<LiveState>>) -> Json<crate::engine::EngineStats> {
    Json(engine.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{CommandError, ScopeKind};
    use std::time::Duration;

    #[test]
    fn state_errors_map_to_statuses() {
        let cases = vec![
            (
                StateError::MissingContext {
                    entity_type: "Cart".to_string(),
                    scope: ScopeKind::Session,
                    missing: "session id",
                },
                StatusCode::BAD_REQUEST,
            ),
            (StateError::binding("add", "missing"), StatusCode::UNPROCESSABLE_ENTITY),
            (StateError::UnknownEntity("Ghost".to_string()), StatusCode::NOT_FOUND),
            (
                StateError::CommandExecution(CommandError::validation("empty")),
                StatusCode::UNPROCESSABLE_ENTITY,
            ),
            (
                StateError::CommandExecution(CommandError::new("sold_out", "none left")),
                StatusCode::CONFLICT,
            ),
            (StateError::Timeout(Duration::from_secs(3)), StatusCode::GATEWAY_TIMEOUT),
            (StateError::Persistence("down".to_string()), StatusCode::SERVICE_UNAVAILABLE),
            (StateError::InvalidConfig("bad".to_string()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (err, expected) in cases {
            assert_eq!(WebError::from(err).into_response().status(), expected);
        }
    }

    #[test]
    fn body_overrides_query_arguments() {
        let query = HashMap::from([
            ("amount".to_string(), "1".to_string()),
            ("label".to_string(), "q".to_string()),
            ("record_id".to_string(), "7".to_string()),
        ]);
        let args = command_arguments(query, &Bytes::from_static(br#"{"amount": 5}"#)).unwrap();

        assert_eq!(args.get("amount"), Some(&json!(5)));
        assert_eq!(args.get("label"), Some(&json!("q")));
        assert!(!args.contains_key("record_id"));

        assert!(command_arguments(HashMap::new(), &Bytes::from_static(b"[1]")).is_err());
        assert!(command_arguments(HashMap::new(), &Bytes::new()).unwrap().is_empty());
    }

    #[test]
    fn keys_parse_from_comma_list() {
        let keys = parse_keys(Some("global:Counter, session:Cart:s-1")).unwrap();
        assert_eq!(keys.len(), 2);
        assert!(parse_keys(None).unwrap().is_empty());
        assert!(parse_keys(Some("nowhere:Counter")).is_err());
    }
}
