//! GENA eventing stub: `SUBSCRIBE`/`UNSUBSCRIBE` handshake plus a single
//! one-shot initial `NOTIFY`. Deliberately incomplete — no periodic
//! resend, no state-change eventing beyond the initial property set, per
//! the Non-goals this facility is scoped by.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::RwLock;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::state::AppState;

struct Subscription {
    callback_urls: Vec<String>,
    timeout: Duration,
}

/// Registry of active event subscriptions. Subscriptions never expire on
/// their own in this stub (no periodic NOTIFY renews them, no timer
/// evicts them) — `TIMEOUT` is accepted and echoed but not enforced.
#[derive(Default)]
pub struct Subscriptions {
    subs: RwLock<HashMap<String, Subscription>>,
}

impl Subscriptions {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&self, callback_urls: Vec<String>, timeout: Duration) -> String {
        let sid = format!("uuid:{}", Uuid::new_v4());
        self.subs.write().unwrap().insert(
            sid.clone(),
            Subscription { callback_urls, timeout },
        );
        sid
    }

    fn remove(&self, sid: &str) -> bool {
        self.subs.write().unwrap().remove(sid).is_some()
    }
}

fn parse_callbacks(value: &str) -> Vec<String> {
    value
        .split('>')
        .filter_map(|part| part.trim().strip_prefix('<'))
        .map(str::to_string)
        .collect()
}

fn parse_timeout(value: &str) -> Duration {
    value
        .strip_prefix("Second-")
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(1800))
}

fn initial_event_body(system_update_id: u32) -> String {
    format!(
        r#"<?xml version="1.0" encoding="UTF-8"?><e:propertyset xmlns:e="urn:schemas-upnp-org:event-1-0"><e:property><SystemUpdateID>{system_update_id}</SystemUpdateID></e:property></e:propertyset>"#
    )
}

async fn send_initial_notify(callback_url: String, sid: String, system_update_id: u32) {
    tokio::time::sleep(Duration::from_millis(100)).await;
    let body = initial_event_body(system_update_id);
    let client = reqwest::Client::new();
    let result = client
        .request(reqwest::Method::from_bytes(b"NOTIFY").unwrap(), &callback_url)
        .header("CONTENT-TYPE", r#"text/xml; charset="utf-8""#)
        .header("NT", "upnp:event")
        .header("NTS", "upnp:propchange")
        .header("SID", sid)
        .header("SEQ", "0")
        .body(body)
        .send()
        .await;

    match result {
        Ok(resp) => debug!(url = %callback_url, status = %resp.status(), "sent initial event NOTIFY"),
        Err(e) => warn!(url = %callback_url, error = %e, "failed to send initial event NOTIFY"),
    }
}

/// Handles `SUBSCRIBE`/`UNSUBSCRIBE` on `/evt/ContentDirectory`.
pub async fn handle_subscribe(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(sid) = headers.get("SID").and_then(|v| v.to_str().ok()) {
        // SUBSCRIBE with an existing SID is a renewal; this stub never
        // accepted renewals as distinct from fresh subscriptions, so per
        // SPEC_FULL.md 4.8 it fails with 412.
        if headers.get("CALLBACK").is_none() {
            return (StatusCode::PRECONDITION_FAILED, "").into_response();
        }
        let removed = state.subscriptions.remove(sid);
        debug!(sid, removed, "treating re-SUBSCRIBE as UNSUBSCRIBE+SUBSCRIBE");
    }

    let Some(callback_header) = headers.get("CALLBACK").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing CALLBACK").into_response();
    };
    let callback_urls = parse_callbacks(callback_header);
    if callback_urls.is_empty() {
        return (StatusCode::BAD_REQUEST, "no callback URLs").into_response();
    }

    let timeout = headers
        .get("TIMEOUT")
        .and_then(|v| v.to_str().ok())
        .map(parse_timeout)
        .unwrap_or(Duration::from_secs(1800));

    let sid = state.subscriptions.add(callback_urls.clone(), timeout);
    info!(sid, urls = ?callback_urls, "new event subscription");

    let system_update_id = state.content_update_id.load(Ordering::Relaxed);
    for url in callback_urls {
        tokio::spawn(send_initial_notify(url, sid.clone(), system_update_id));
    }

    if state.config.stall_event_subscribe {
        debug!(sid, "stalling SUBSCRIBE response per StallEventSubscribe");
        std::future::pending::<()>().await;
    }

    Response::builder()
        .status(StatusCode::OK)
        .header("SID", sid)
        .header("TIMEOUT", format!("Second-{}", timeout.as_secs()))
        .header("CONTENT-LENGTH", "0")
        .body(axum::body::Body::empty())
        .unwrap()
}

/// Handles `UNSUBSCRIBE` on `/evt/ContentDirectory`.
pub async fn handle_unsubscribe(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let Some(sid) = headers.get("SID").and_then(|v| v.to_str().ok()) else {
        return (StatusCode::BAD_REQUEST, "missing SID").into_response();
    };
    let removed = state.subscriptions.remove(sid);
    info!(sid, removed, "UNSUBSCRIBE");
    (StatusCode::OK, "").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_angle_bracketed_callbacks() {
        let urls = parse_callbacks("<http://10.0.0.5:123/cb1><http://10.0.0.5:123/cb2>");
        assert_eq!(urls, vec!["http://10.0.0.5:123/cb1", "http://10.0.0.5:123/cb2"]);
    }

    #[test]
    fn parses_timeout_header() {
        assert_eq!(parse_timeout("Second-1800"), Duration::from_secs(1800));
        assert_eq!(parse_timeout("garbage"), Duration::from_secs(1800));
    }

    #[test]
    fn subscriptions_add_and_remove() {
        let subs = Subscriptions::new();
        let sid = subs.add(vec!["http://x".to_string()], Duration::from_secs(60));
        assert!(subs.remove(&sid));
        assert!(!subs.remove(&sid));
    }
}
