//! `/res` streaming path: raw byte-range delivery and on-demand
//! transcoding, DLNA `TimeSeekRange` handling, and the HEAD short-circuit
//! Samsung Frame TVs require.

use std::collections::HashMap;
use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};

use crate::directory::safe_join;
use crate::dynamic_stream;
use crate::error::{AppError, AppResult};
use crate::npt;
use crate::state::AppState;

fn mime_for(path: &std::path::Path) -> String {
    mime_guess::from_path(path).first_or_octet_stream().essence_str().to_string()
}

struct ByteRange {
    start: u64,
    end: u64,
}

fn parse_byte_range(value: &str, file_size: u64) -> AppResult<ByteRange> {
    let range = http_range_header::parse_range_header(value).map_err(|_| AppError::InvalidRange)?;
    let ranges = range.validate(file_size).map_err(|_| AppError::InvalidRange)?;
    let first = ranges.first().ok_or(AppError::InvalidRange)?;
    Ok(ByteRange {
        start: *first.start(),
        end: *first.end(),
    })
}

/// Serves raw file bytes with `Range` support. Used for non-transcoded
/// playback and for plain static media (e.g. images).
async fn serve_raw_file(abs_path: PathBuf, headers: &HeaderMap, method: &Method) -> AppResult<Response> {
    let metadata = tokio::fs::metadata(&abs_path).await?;
    let file_size = metadata.len();
    let mime = mime_for(&abs_path);

    let (start, end, status) = match headers.get(header::RANGE).and_then(|v| v.to_str().ok()) {
        Some(range_str) => {
            let r = parse_byte_range(range_str, file_size)?;
            (r.start, r.end, StatusCode::PARTIAL_CONTENT)
        }
        None => (0, file_size.saturating_sub(1), StatusCode::OK),
    };
    let len = end.saturating_sub(start) + 1;

    let basename = abs_path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, mime)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CONTENT_LENGTH, len)
        .header(header::CONTENT_DISPOSITION, format!(r#"attachment; filename="{basename}""#));
    if status == StatusCode::PARTIAL_CONTENT {
        builder = builder.header(header::CONTENT_RANGE, format!("bytes {start}-{end}/{file_size}"));
    }

    if *method == Method::HEAD {
        return Ok(builder.body(Body::empty())?);
    }

    let mut file = File::open(&abs_path).await?;
    file.seek(std::io::SeekFrom::Start(start)).await?;
    let stream = ReaderStream::with_capacity(file, 64 * 1024).take(len as usize);
    Ok(builder.body(Body::from_stream(stream))?)
}

/// Serves a transcoded stream: spawns the transcoder, optionally seeking
/// to a `TimeSeekRange`, and pipes its stdout to the response body.
async fn serve_transcode(
    state: &AppState,
    abs_path: PathBuf,
    item_name: &str,
    transcode_key: &str,
    headers: &HeaderMap,
    method: &Method,
) -> AppResult<Response> {
    let spec = state
        .config
        .transcodes
        .get(transcode_key)
        .ok_or_else(|| AppError::UnknownTranscode(transcode_key.to_string()))?;

    let time_seek = headers
        .get("TimeSeekRange.dlna.org")
        .and_then(|v| v.to_str().ok())
        .map(npt::parse_time_seek_range)
        .transpose()
        .map_err(AppError::BadRequest)?;

    let start = time_seek.as_ref().map(|r| r.start).unwrap_or_default();
    let duration = time_seek.as_ref().and_then(|r| r.end).map(|end| end.saturating_sub(start));

    let profile_part = spec
        .dlna_profile_name
        .map(|p| format!("DLNA.ORG_PN={p};"))
        .unwrap_or_default();
    let content_features = format!("{profile_part}DLNA.ORG_OP=01;DLNA.ORG_CI=1;DLNA.ORG_FLAGS={}", spec.dlna_flags);

    let status = if time_seek.is_some() { StatusCode::PARTIAL_CONTENT } else { StatusCode::OK };
    let mut builder = Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, spec.mime_type)
        .header("TransferMode.DLNA.ORG", "Streaming")
        .header("ContentFeatures.DLNA.ORG", content_features);

    if let Some(range) = &time_seek {
        builder = builder.header("TimeSeekRange.dlna.org", npt::echo_time_seek_range(range));
    }

    let probe = state.probe_cache.get(&abs_path).await.ok().flatten();
    if let Some(d) = probe.and_then(|p| p.duration_secs) {
        builder = builder
            .header("content-duration", format!("{d:.3}"))
            .header("x-content-duration", format!("{d:.3}"));
    }

    if *method == Method::HEAD {
        return Ok(builder.body(Body::empty())?);
    }

    let log_file = crate::transcode::open_transcode_log(&state.config.transcode_log_pattern, item_name);
    info!(path = %abs_path.display(), key = transcode_key, "spawning transcoder");
    let transcode_stream = spec.launcher.launch(&abs_path, start, duration, log_file).await?;

    let body = Body::from_stream(ReaderStream::new(transcode_stream).map(|chunk| {
        if let Err(ref e) = chunk {
            debug!("transcoder stream error: {}", e);
        }
        chunk
    }));

    Ok(builder.body(body)?)
}

/// Serves a dynamic-stream resource: the command's stdout, with no seek
/// support and no `Content-Length` (unknown-length streaming).
async fn serve_dynamic(
    state: &AppState,
    abs_path: PathBuf,
    index: usize,
    method: &Method,
) -> AppResult<Response> {
    if !state.config.dynamic_streams_enabled {
        return Err(AppError::Forbidden);
    }
    let descriptors = dynamic_stream::load_descriptors(&abs_path)?
        .ok_or(AppError::NotFound)?;
    let resource = dynamic_stream::resolve(&descriptors, index).ok_or(AppError::NotFound)?;

    let profile_part = resource
        .dlna_profile_name
        .as_ref()
        .map(|p| format!("DLNA.ORG_PN={p};"))
        .unwrap_or_default();
    let content_features = format!("{profile_part}DLNA.ORG_OP=00;DLNA.ORG_CI=1;DLNA.ORG_FLAGS={}", resource.dlna_flags);

    let builder = Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, resource.mime_type.clone())
        .header("TransferMode.DLNA.ORG", "Streaming")
        .header("ContentFeatures.DLNA.ORG", content_features);

    if *method == Method::HEAD {
        return Ok(builder.body(Body::empty())?);
    }

    let Some((program, args)) = resource.command.split_first() else {
        return Err(AppError::BadRequest("empty dynamic stream command".to_string()));
    };
    debug!(command = ?resource.command, "spawning dynamic stream command");
    let mut child = tokio::process::Command::new(program)
        .args(args)
        .stdin(std::process::Stdio::null())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()?;
    let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("dynamic stream spawned without stdout"))?;

    tokio::spawn(async move {
        let _ = child.wait().await;
    });

    let body = Body::from_stream(ReaderStream::new(stdout).map(|chunk| {
        if let Err(ref e) = chunk {
            warn!("dynamic stream error: {}", e);
        }
        chunk
    }));
    Ok(builder.body(body)?)
}

#[derive(serde::Deserialize)]
pub struct ResQuery {
    path: String,
    transcode: Option<String>,
}

pub async fn serve_res(
    State(state): State<AppState>,
    Query(query): Query<ResQuery>,
    method: Method,
    headers: HeaderMap,
) -> AppResult<Response> {
    let abs_path = safe_join(&state.config.root_object_path, &query.path).ok_or(AppError::NotFound)?;
    if crate::directory::is_ignored(&state.config, &abs_path) {
        return Err(AppError::NotFound);
    }

    let item_name = abs_path.file_stem().map(|s| s.to_string_lossy().to_string()).unwrap_or_default();

    let response = match query.transcode.as_deref() {
        None => serve_raw_file(abs_path, &headers, &method).await?,
        Some(key) if key.starts_with("dyn:") => {
            let index = dynamic_stream::parse_dyn_key(key).ok_or_else(|| AppError::UnknownTranscode(key.to_string()))?;
            serve_dynamic(&state, abs_path, index, &method).await?
        }
        Some(key) if state.config.no_transcode => {
            return Err(AppError::UnknownTranscode(key.to_string()));
        }
        Some(key) => serve_transcode(&state, abs_path, &item_name, key, &headers, &method).await?,
    };

    Ok(response)
}

/// `GET /subtitle?path=...` — serves the sibling `.srt` file.
pub async fn serve_subtitle(State(state): State<AppState>, Query(query): Query<HashMap<String, String>>) -> AppResult<Response> {
    let path = query.get("path").ok_or_else(|| AppError::BadRequest("missing path".to_string()))?;
    let abs_path = safe_join(&state.config.root_object_path, path).ok_or(AppError::NotFound)?;
    let srt_path = abs_path.with_extension("srt");
    let bytes = tokio::fs::read(&srt_path).await.map_err(|_| AppError::NotFound)?;
    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/x-subrip")],
        bytes,
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_byte_range() {
        let r = parse_byte_range("bytes=0-99", 1000).unwrap();
        assert_eq!(r.start, 0);
        assert_eq!(r.end, 99);
    }

    #[test]
    fn parses_open_ended_range() {
        let r = parse_byte_range("bytes=500-", 1000).unwrap();
        assert_eq!(r.start, 500);
        assert_eq!(r.end, 999);
    }

    #[test]
    fn rejects_malformed_range() {
        assert!(parse_byte_range("not a range", 1000).is_err());
    }
}
