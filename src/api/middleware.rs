//! Middleware chain for the HTTP surface.
//!
//! Composed outermost-first: recovery, logging, request-id, CORS, version
//! header, gzip, authentication, handler. Recovery is the single point
//! where a panicking request is converted into a 500 without taking the
//! process down.

use crate::api::ApiState;
use crate::auth::{parse_credentials, verify_password};
use crate::meta::User;
use crate::query::Results;
use axum::body::Body;
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, OnceLock};
use std::time::Instant;
use tracing::{error, info};
use uuid::Uuid;

/// The authenticated principal for a request. `None` means an anonymous
/// principal admitted with full rights (authentication disabled, the
/// zero-user bootstrap window, or an internal cluster route).
#[derive(Debug, Clone, Default)]
pub struct Principal(pub Option<User>);

/// Slot shared between the request-id layer and the recovery layer so a
/// panic can still be correlated to its request.
#[derive(Clone, Default)]
pub(crate) struct RequestIdSlot(pub Arc<OnceLock<String>>);

const REQUEST_ID_HEADER: &str = "Request-Id";

/// Outermost layer: convert panics into a 500 response and keep the
/// process alive.
pub async fn recovery(mut req: Request<Body>, next: Next) -> Response {
    let slot = RequestIdSlot::default();
    req.extensions_mut().insert(slot.clone());
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    match AssertUnwindSafe(next.run(req)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let request_id = slot.0.get().cloned().unwrap_or_default();
            error!(
                %method,
                path = path.as_str(),
                request_id = request_id.as_str(),
                panic = message.as_str(),
                "request panicked"
            );
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error".to_string(),
                false,
            )
        }
    }
}

/// Structured request logging with latency.
pub async fn logging(req: Request<Body>, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let elapsed = start.elapsed();
    let request_id = response
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    info!(
        %method,
        path = path.as_str(),
        status,
        duration_ms = elapsed.as_millis() as u64,
        request_id,
        "request"
    );
    crate::telemetry::record_http_request(method.as_str(), &path, status, elapsed.as_secs_f64());
    response
}

/// Tag every request and response with a UUIDv4 `Request-Id`.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let id = Uuid::new_v4().to_string();
    if let Some(slot) = req.extensions().get::<RequestIdSlot>() {
        let _ = slot.0.set(id.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&id) {
        req.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
        let mut response = next.run(req).await;
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
        response
    } else {
        next.run(req).await
    }
}

/// Advertise the server version on every response.
pub async fn version_header(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    response.headers_mut().insert(
        "X-Influxdb-Version",
        HeaderValue::from_static(crate::server::VERSION),
    );
    response
}

/// Internal cluster routes ride on transport trust between peers rather
/// than per-request user credentials.
fn is_internal_route(path: &str) -> bool {
    path.starts_with("/shards/") || path.starts_with("/broker/")
}

fn is_public_route(path: &str) -> bool {
    path == "/ping" || path == "/status"
}

/// Authenticate the request and attach its [`Principal`].
///
/// Bootstrap exception: while the cluster has no users, requests are
/// admitted anonymously so the first admin can be created.
pub async fn authenticate(
    axum::extract::State(state): axum::extract::State<ApiState>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let path = req.uri().path().to_string();
    if !state.server.auth_required()
        || is_public_route(&path)
        || is_internal_route(&path)
        || state.server.meta.user_count() == 0
    {
        req.extensions_mut().insert(Principal::default());
        return next.run(req).await;
    }

    let query = req.uri().query().unwrap_or("");
    let mut username_param = None;
    let mut password_param = None;
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "u" => username_param = Some(value.into_owned()),
            "p" => password_param = Some(value.into_owned()),
            _ => {}
        }
    }
    let authorization = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());

    let credentials = match parse_credentials(
        username_param.as_deref(),
        password_param.as_deref(),
        authorization.as_deref(),
    ) {
        Ok(creds) => creds,
        Err(e) => return error_response(StatusCode::UNAUTHORIZED, e.to_string(), false),
    };
    if credentials.username.is_empty() {
        return error_response(StatusCode::UNAUTHORIZED, "username required".into(), false);
    }

    let Some(user) = state.server.meta.user(&credentials.username) else {
        return error_response(
            StatusCode::UNAUTHORIZED,
            crate::Error::UserNotFound.to_string(),
            false,
        );
    };
    if !verify_password(&user.hash, &credentials.password) {
        return error_response(
            StatusCode::UNAUTHORIZED,
            crate::Error::InvalidPassword.to_string(),
            false,
        );
    }

    req.extensions_mut().insert(Principal(Some(user)));
    next.run(req).await
}

/// Serialize a [`Results`]-wrapped error body.
pub fn error_response(status: StatusCode, message: String, pretty: bool) -> Response {
    let results = Results::from_error(message);
    let body = if pretty {
        serde_json::to_string_pretty(&results)
    } else {
        serde_json::to_string(&results)
    }
    .unwrap_or_else(|_| r#"{"error":"internal error"}"#.to_string());
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body,
    )
        .into_response()
}
