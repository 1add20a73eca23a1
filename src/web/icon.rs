//! `/icon` (per-item thumbnail, delegated to an external thumbnail
//! generator) and `/deviceIcon/<N>` (static icons advertised in
//! `rootDesc.xml`).

use std::collections::HashMap;
use std::process::Stdio;

use axum::extract::{Path as AxumPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use rand::Rng;
use tracing::debug;

use crate::directory::safe_join;
use crate::state::AppState;

/// Serves the first configured device icon as a fallback — `/icon` must
/// never 500, per `SPEC_FULL.md` 4.6.
fn fallback_icon(state: &AppState) -> Response {
    match state.config.icons.first() {
        Some(icon) => (StatusCode::OK, [(header::CONTENT_TYPE, icon.mime_type)], icon.bytes.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "no icon available").into_response(),
    }
}

pub async fn item_icon(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> Response {
    let Some(path) = query.get("path") else {
        return fallback_icon(&state);
    };
    let Some(abs_path) = safe_join(&state.config.root_object_path, path) else {
        return fallback_icon(&state);
    };

    let format = query.get("c").map(String::as_str).unwrap_or("png");
    let mut cmd = tokio::process::Command::new("dms-thumbnail");
    cmd.arg("-i").arg(&abs_path).arg("-o").arg("/dev/stdout").arg("-c").arg(format);
    if std::env::var_os("DMS_THUMBNAIL_FULLQUALITY").is_none() {
        cmd.arg("-s").arg("0").arg("-q").arg("10");
    }
    if std::env::var_os("DMS_THUMBNAIL_RANDOM").is_some() {
        let rand: u32 = rand::rng().random();
        cmd.arg("-t").arg(rand.to_string());
    }
    cmd.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::null());

    let output = match cmd.output().await {
        Ok(o) if o.status.success() => o,
        Ok(o) => {
            debug!(status = ?o.status, "thumbnail generator exited non-zero");
            return fallback_icon(&state);
        }
        Err(e) => {
            debug!(error = %e, "failed to spawn thumbnail generator");
            return fallback_icon(&state);
        }
    };

    let mime = if format == "jpg" { "image/jpeg" } else { "image/png" };
    (StatusCode::OK, [(header::CONTENT_TYPE, mime)], output.stdout).into_response()
}

pub async fn device_icon(State(state): State<AppState>, AxumPath(index): AxumPath<usize>) -> Response {
    let icons = &state.config.icons;
    if icons.is_empty() {
        return (StatusCode::NOT_FOUND, "no icons configured").into_response();
    }
    let index = index.min(icons.len() - 1);
    let icon = &icons[index];
    (StatusCode::OK, [(header::CONTENT_TYPE, icon.mime_type)], icon.bytes.clone()).into_response()
}
