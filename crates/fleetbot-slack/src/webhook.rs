use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Router,
};
use fleetbot_ipc::{EventBus, InboundEvent};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Requests whose timestamp is further than this from now are replays.
const MAX_REQUEST_AGE_SECS: i64 = 60 * 5;

#[derive(Clone)]
pub struct WebhookState {
    signing_secret: Option<String>,
    bus: EventBus,
}

impl WebhookState {
    pub fn new(signing_secret: Option<String>, bus: EventBus) -> Self {
        Self {
            signing_secret: signing_secret.filter(|s| !s.is_empty()),
            bus,
        }
    }
}

pub fn router(events_path: &str, state: WebhookState) -> Router {
    Router::new()
        .route(events_path, post(handle_events))
        .with_state(state)
}

/// Bind and serve the Events API endpoint until the listener fails.
pub async fn serve(bind: &str, events_path: &str, state: WebhookState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind)
        .await
        .map_err(|e| anyhow::anyhow!("failed to bind webhook server on {}: {}", bind, e))?;
    info!("Slack Events webhook listening on {}{}", bind, events_path);
    axum::serve(listener, router(events_path, state))
        .await
        .map_err(|e| anyhow::anyhow!("webhook server exited: {}", e))
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Check `X-Slack-Signature` (`v0=<hex hmac>`) over `v0:<timestamp>:<body>`.
pub fn verify_signature(
    secret: &str,
    timestamp: &str,
    body: &[u8],
    signature: &str,
    now: i64,
) -> bool {
    let Ok(ts) = timestamp.parse::<i64>() else {
        return false;
    };
    if (now - ts).abs() > MAX_REQUEST_AGE_SECS {
        return false;
    }
    let Some(expected) = signature
        .strip_prefix("v0=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
    else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(b"v0:");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Turn an `event_callback` payload into an inbound event, or `None` when it
/// is not a plain user message (bot posts, edits, joins, other event types).
pub fn extract_message(payload: &serde_json::Value) -> Option<InboundEvent> {
    if payload["type"] != "event_callback" {
        return None;
    }
    let event = &payload["event"];
    if event["type"] != "message" {
        return None;
    }
    if event.get("bot_id").is_some_and(|v| !v.is_null()) {
        return None;
    }
    if event.get("subtype").is_some_and(|v| !v.is_null()) {
        return None;
    }

    let event_id = payload["event_id"].as_str()?;
    let caller_id = event["user"].as_str()?;
    let conversation_id = event["channel"].as_str()?;
    let text = event["text"].as_str()?.trim();
    if text.is_empty() {
        return None;
    }
    Some(InboundEvent::new(event_id, caller_id, conversation_id, text))
}

async fn handle_events(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> impl IntoResponse {
    if let Some(ref secret) = state.signing_secret {
        let timestamp = headers
            .get("X-Slack-Request-Timestamp")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let signature = headers
            .get("X-Slack-Signature")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !verify_signature(secret, timestamp, &body, signature, now_unix()) {
            warn!("Rejected webhook request: invalid Slack signature");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    }

    let payload: serde_json::Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to parse webhook body as JSON: {}", e);
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    if payload["type"] == "url_verification" {
        let challenge = payload["challenge"].as_str().unwrap_or("").to_string();
        return axum::Json(serde_json::json!({ "challenge": challenge })).into_response();
    }

    // Slack redelivers when we are slow to ack; the first delivery is already
    // being handled.
    if let Some(retry) = headers.get("X-Slack-Retry-Num") {
        debug!("Dropping Slack retry #{:?}", retry);
        return StatusCode::OK.into_response();
    }

    if let Some(event) = extract_message(&payload) {
        let event_id = event.event_id.clone();
        match state.bus.publish(event) {
            Ok(()) => debug!("Published inbound event {}", event_id),
            Err(e) => error!("Failed to publish inbound event {}: {}", event_id, e),
        }
    }

    StatusCode::OK.into_response()
}
