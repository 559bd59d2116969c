//! The generic `POST /<method>` entry point.
//!
//! Grounded on `controller/web/interface.py`'s `FunctionResource.render`:
//! a session is looked up (or created, unauthenticated, with a fresh TTL)
//! from a cookie on every request; a method that requires authentication
//! and finds none is rejected with `401`; an unregistered method is `404`;
//! a handler that returns an error becomes a `500` with the failure
//! message in the body; everything else is `200` with the handler's JSON
//! result.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use uuid::Uuid;

use crate::handlers;
use crate::state::AppState;

const SESSION_COOKIE: &str = "pydra_session";

/// Request body for a method call: a positional `args` array and a
/// keyword `kwargs` object, either of which may be omitted.
#[derive(Debug, Default, Deserialize)]
pub struct CallRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map<String, Value>,
}

pub async fn handle_call(
    State(state): State<Arc<AppState>>,
    Path(method): Path<String>,
    headers: HeaderMap,
    body: Option<Json<CallRequest>>,
) -> Response {
    let Json(CallRequest { args, kwargs }) = body.unwrap_or_default();

    let Some(requires_auth) = handlers::requires_auth(&method) else {
        return (StatusCode::NOT_FOUND, "method does not exist").into_response();
    };

    let session_id = session_id_from(&headers);
    state.sessions.touch(&session_id);

    if requires_auth && !state.sessions.is_authenticated(&session_id) {
        return with_session_cookie(
            &session_id,
            (StatusCode::UNAUTHORIZED, "authentication required for this method").into_response(),
        );
    }

    let response = match handlers::dispatch(&state, &session_id, &method, &args, &kwargs).await {
        Ok(value) => (StatusCode::OK, Json(value)).into_response(),
        Err(reason) => {
            tracing::warn!(%method, %reason, "controller method failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"exception": reason, "traceback": Value::Null})),
            )
                .into_response()
        }
    };
    with_session_cookie(&session_id, response)
}

fn session_id_from(headers: &HeaderMap) -> String {
    headers
        .get(header::COOKIE)
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| {
            raw.split(';').find_map(|pair| pair.trim().strip_prefix(&format!("{SESSION_COOKIE}=")))
        })
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::now_v7().to_string())
}

fn with_session_cookie(session_id: &str, mut response: Response) -> Response {
    if let Ok(value) = HeaderValue::from_str(&format!("{SESSION_COOKIE}={session_id}; Path=/; HttpOnly; Max-Age=120")) {
        response.headers_mut().append(header::SET_COOKIE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_round_trips_through_cookie_header() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("pydra_session=abc-123; other=1"));
        assert_eq!(session_id_from(&headers), "abc-123");
    }

    #[test]
    fn missing_cookie_mints_a_fresh_session_id() {
        let headers = HeaderMap::new();
        let id = session_id_from(&headers);
        assert!(!id.is_empty());
    }
}
