use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde_json::json;
use tracing::debug;

use crate::firewall::pipeline::{Evaluation, FirewallPipeline};
use crate::models::decision::{format_go_duration, Action};

/// Evaluate every request through the firewall pipeline and enforce the
/// decision before it reaches the protected application.
pub async fn firewall_middleware(
    State(pipeline): State<Arc<FirewallPipeline>>,
    req: Request,
    next: Next,
) -> Response {
    let remote_addr = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.to_string())
        .unwrap_or_else(|| "0.0.0.0:0".to_string());

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let headers = req.headers().clone();

    let evaluation = pipeline
        .evaluate(&method, &path, &headers, &remote_addr)
        .await;

    match evaluation.decision.action.clone() {
        Action::Allow => {
            let mut response = next.run(req).await;
            apply_headers(&mut response, &evaluation);
            response
        }
        Action::Delay(delay) => {
            // The sleep is the enforcement; afterwards the request
            // proceeds normally.
            debug!(
                fingerprint = %evaluation.fingerprint,
                delay_ms = delay.as_millis() as u64,
                "Delaying request"
            );
            tokio::time::sleep(delay).await;
            let mut response = next.run(req).await;
            apply_headers(&mut response, &evaluation);
            response
        }
        Action::Challenge { url } => {
            let body = json!({
                "error": "challenge_required",
                "message": evaluation.decision.message,
                "reason": evaluation.decision.reason,
                "challenge": {
                    "type": "captcha",
                    "url": url,
                },
            });
            blocked_response(&evaluation, body)
        }
        Action::Ban { reason, duration } => {
            let body = json!({
                "error": "banned",
                "message": evaluation.decision.message,
                "reason": reason,
                "ban_duration": format_go_duration(duration),
                "retry_after": duration.as_secs(),
            });
            blocked_response(&evaluation, body)
        }
    }
}

fn blocked_response(evaluation: &Evaluation, body: serde_json::Value) -> Response {
    let status =
        StatusCode::from_u16(evaluation.decision.status).unwrap_or(StatusCode::FORBIDDEN);
    let mut response = (
        status,
        [(header::CONTENT_TYPE, "application/json; charset=utf-8")],
        body.to_string(),
    )
        .into_response();
    apply_headers(&mut response, evaluation);
    response
}

/// Evaluation headers emitted on every request, plus the decision's own.
fn apply_headers(response: &mut Response, evaluation: &Evaluation) {
    let headers = response.headers_mut();

    set_header(headers, "X-User-Fingerprint", &evaluation.fingerprint);
    set_header(headers, "X-User-Score", &evaluation.score.to_string());
    set_header(headers, "X-Risk-Level", &evaluation.risk_level.to_string());

    for (name, value) in &evaluation.decision.headers {
        set_header(headers, name, value);
    }
}

fn set_header(headers: &mut axum::http::HeaderMap, name: &str, value: &str) {
    if let (Ok(name), Ok(value)) = (
        name.parse::<HeaderName>(),
        HeaderValue::from_str(value),
    ) {
        headers.insert(name, value);
    }
}

/// Assemble the full router: the admin API mounted outside the firewall,
/// everything else evaluated per request. The root handler stands in for
/// the fronted application.
pub fn build_router(pipeline: Arc<FirewallPipeline>, admin: Router) -> Router {
    let protected = Router::new()
        .route("/", get(application_placeholder))
        .fallback(application_placeholder)
        .layer(axum::middleware::from_fn_with_state(
            pipeline,
            firewall_middleware,
        ));

    Router::new().nest("/api/v1", admin).merge(protected)
}

async fn application_placeholder() -> &'static str {
    "OK"
}
