//! Black-box end-to-end tests against a real bound HTTP server: SOAP
//! `Browse`, byte-range and transcoded streaming, the `/ctl` IP allow-list,
//! and the GENA `SUBSCRIBE`/`NOTIFY` handshake. Mirrors the literal
//! end-to-end scenarios this server is built against.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use tokio::net::TcpListener;

use upnp_dms::config::{Config, IpNet};
use upnp_dms::probe::{NullProbe, ProbeCache};
use upnp_dms::state::AppState;
use upnp_dms::{transcode, web};

const CDS_SOAPACTION: &str = "\"urn:schemas-upnp-org:service:ContentDirectory:1#Browse\"";

fn test_config(root: PathBuf) -> Config {
    Config {
        root_object_path: root,
        friendly_name: "test-dms".to_string(),
        udn: uuid::Uuid::new_v4(),
        http_port: 0,
        notify_interval: Duration::from_secs(30),
        allowed_ip_nets: Vec::new(),
        ignore_hidden: true,
        ignore_unreadable: true,
        ignore_paths: Vec::new(),
        no_transcode: false,
        force_transcode_to: None,
        transcodes: transcode::default_transcodes("dms-transcode-not-installed"),
        transcode_log_pattern: Config::default_transcode_log_pattern(),
        dynamic_streams_enabled: false,
        icons: Vec::new(),
        stall_event_subscribe: false,
    }
}

/// Binds a real listener and runs the full router on it, the same way
/// `main.rs` does, so these tests exercise the actual HTTP stack rather
/// than a mocked handler surface.
async fn spawn_server(config: Config) -> (String, tokio::task::JoinHandle<()>) {
    let probe_cache = Arc::new(ProbeCache::new(Arc::new(NullProbe)));
    let state = AppState::new(Arc::new(config), probe_cache);
    let app = web::create_router(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await;
    });
    (format!("http://{addr}"), handle)
}

fn browse_envelope(object_id: &str, flag: &str, filter: &str, start: usize, count: usize) -> String {
    format!(
        r#"<?xml version="1.0"?><s:Envelope xmlns:s="http://schemas.xmlsoap.org/soap/envelope/"><s:Body><u:Browse xmlns:u="urn:schemas-upnp-org:service:ContentDirectory:1"><ObjectID>{object_id}</ObjectID><BrowseFlag>{flag}</BrowseFlag><Filter>{filter}</Filter><StartingIndex>{start}</StartingIndex><RequestedCount>{count}</RequestedCount></u:Browse></s:Body></s:Envelope>"#
    )
}

/// The DIDL-Lite fragment travels inside `<Result>` escaped for SOAP
/// transport; unescape it back to plain XML for assertions.
fn extract_and_unescape_result(soap_body: &str) -> String {
    let start = soap_body.find("<Result>").expect("missing <Result>") + "<Result>".len();
    let end = soap_body.find("</Result>").expect("missing </Result>");
    soap_body[start..end]
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

async fn browse(base: &str, object_id: &str, flag: &str, start: usize, count: usize) -> String {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{base}/ctl"))
        .header("SOAPACTION", CDS_SOAPACTION)
        .header("Content-Type", "text/xml")
        .body(browse_envelope(object_id, flag, "*", start, count))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
    resp.text().await.unwrap()
}

mod browse_tests {
    use super::*;

    #[tokio::test]
    async fn browse_root_lists_file_with_raw_and_transcode_resources() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), vec![0u8; 1000]).unwrap();

        let (base, _handle) = spawn_server(test_config(dir.path().to_path_buf())).await;
        let text = browse(&base, "0", "BrowseDirectChildren", 0, 0).await;

        assert!(text.contains("<NumberReturned>1</NumberReturned>"));
        assert!(text.contains("<TotalMatches>1</TotalMatches>"));
        assert!(!text.contains("&#34;"), "DIDL-Lite must never contain an &#34; escape");

        let didl = extract_and_unescape_result(&text);
        assert!(didl.contains(r#"id="/a.mp4""#));
        assert!(didl.contains(r#"parentID="0""#));
        assert!(didl.contains("upnp:class>object.item.videoItem<"));
        assert!(didl.contains("/res?path=%2Fa.mp4"));

        // one raw-file resource plus one per standard transcode key (t, vp8, chromecast, web)
        assert_eq!(didl.matches("<res ").count(), 5);
        assert!(didl.contains(r#"protocolInfo="http-get:*:video/mp4:"#));
    }

    #[tokio::test]
    async fn requested_count_zero_returns_all_matches() {
        let dir = TempDir::new().unwrap();
        for name in ["a.mp4", "b.mp4", "c.mp4"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let (base, _handle) = spawn_server(test_config(dir.path().to_path_buf())).await;
        let text = browse(&base, "0", "BrowseDirectChildren", 0, 0).await;
        assert!(text.contains("<NumberReturned>3</NumberReturned>"));
        assert!(text.contains("<TotalMatches>3</TotalMatches>"));
    }

    #[tokio::test]
    async fn starting_index_beyond_match_count_returns_zero_returned() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), b"x").unwrap();
        let (base, _handle) = spawn_server(test_config(dir.path().to_path_buf())).await;
        let text = browse(&base, "0", "BrowseDirectChildren", 5, 0).await;
        assert!(text.contains("<NumberReturned>0</NumberReturned>"));
        assert!(text.contains("<TotalMatches>1</TotalMatches>"));
    }

    #[tokio::test]
    async fn browse_metadata_parent_matches_direct_children_listing() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("Movies")).unwrap();
        std::fs::write(dir.path().join("Movies").join("foo.mkv"), b"x").unwrap();

        let (base, _handle) = spawn_server(test_config(dir.path().to_path_buf())).await;

        let children = extract_and_unescape_result(&browse(&base, "/Movies", "BrowseDirectChildren", 0, 0).await);
        assert!(children.contains(r#"id="/Movies/foo.mkv""#));
        assert!(children.contains(r#"parentID="/Movies""#));

        let metadata = extract_and_unescape_result(&browse(&base, "/Movies/foo.mkv", "BrowseMetadata", 0, 0).await);
        assert!(metadata.contains(r#"id="/Movies/foo.mkv""#));
        assert!(metadata.contains(r#"parentID="/Movies""#));
    }
}

mod access_control_tests {
    use super::*;

    #[tokio::test]
    async fn soap_control_rejects_disallowed_remote() {
        let dir = TempDir::new().unwrap();
        let mut cfg = test_config(dir.path().to_path_buf());
        cfg.allowed_ip_nets = vec![IpNet::parse("10.0.0.0/8").unwrap()];
        let (base, _handle) = spawn_server(cfg).await;

        let client = reqwest::Client::new();
        let resp = client
            .post(format!("{base}/ctl"))
            .header("SOAPACTION", CDS_SOAPACTION)
            .body(browse_envelope("0", "BrowseDirectChildren", "*", 0, 0))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::FORBIDDEN);
    }
}

#[cfg(unix)]
mod streaming_tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    /// A stand-in transcoder: records the `(path, start, duration)` argv it
    /// was launched with and writes a fixed byte stream to stdout, so tests
    /// never depend on a real media encoder being installed.
    fn install_fake_transcoder(dir: &Path, log_name: &str) -> (PathBuf, PathBuf) {
        let script_path = dir.join(format!("{log_name}.sh"));
        let log_path = dir.join(log_name);
        let script = format!("#!/bin/sh\necho \"$1|$2|$3\" > '{}'\nprintf 'transcoded-bytes'\n", log_path.display());
        std::fs::write(&script_path, script).unwrap();
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        (script_path, log_path)
    }

    fn config_with_fake_transcoder(root: PathBuf, key: &'static str, mime: &'static str, script: &std::path::Path) -> Config {
        let mut transcodes = transcode::TranscodeMap::new();
        transcodes.insert(
            key,
            transcode::TranscodeSpec {
                key,
                mime_type: mime,
                dlna_profile_name: None,
                dlna_flags: "01700000000000000000000000000000",
                launcher: Arc::new(transcode::ProcessLauncher::new(script.to_string_lossy().to_string(), vec![])),
            },
        );
        let mut cfg = test_config(root);
        cfg.transcodes = transcodes;
        cfg
    }

    #[tokio::test]
    async fn transcoded_stream_honors_time_seek_range_and_launches_expected_args() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), vec![0u8; 1000]).unwrap();
        let (script, log_path) = install_fake_transcoder(dir.path(), "vp8-args.log");

        let (base, _handle) =
            spawn_server(config_with_fake_transcoder(dir.path().to_path_buf(), "vp8", "video/webm", &script)).await;

        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{base}/res?path=%2Fa.mp4&transcode=vp8"))
            .header("TimeSeekRange.dlna.org", "npt=10.0-20.0")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers().get("content-type").unwrap(), "video/webm");
        assert_eq!(resp.headers().get("transfermode.dlna.org").unwrap(), "Streaming");
        assert_eq!(resp.headers().get("timeseekrange.dlna.org").unwrap(), "npt=10.0-20.0/*");
        let _ = resp.bytes().await.unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        let logged = std::fs::read_to_string(&log_path).unwrap();
        let parts: Vec<&str> = logged.trim().split('|').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].ends_with("a.mp4"));
        assert_eq!(parts[1], "10.000");
        assert_eq!(parts[2], "10.000");
    }

    #[tokio::test]
    async fn head_request_never_spawns_the_transcoder() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("a.mp4"), vec![0u8; 1000]).unwrap();
        let (script, log_path) = install_fake_transcoder(dir.path(), "t-args.log");

        let (base, _handle) =
            spawn_server(config_with_fake_transcoder(dir.path().to_path_buf(), "t", "video/mpeg", &script)).await;

        let client = reqwest::Client::new();
        let resp = client.head(format!("{base}/res?path=%2Fa.mp4&transcode=t")).send().await.unwrap();
        assert!(resp.status() == reqwest::StatusCode::OK || resp.status() == reqwest::StatusCode::PARTIAL_CONTENT);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!log_path.exists(), "HEAD must never launch the transcoder process");
    }

    #[tokio::test]
    async fn raw_file_byte_range_is_honored() {
        let dir = TempDir::new().unwrap();
        let content: Vec<u8> = (0u8..=255).cycle().take(2000).collect();
        std::fs::write(dir.path().join("a.mp4"), &content).unwrap();

        let (base, _handle) = spawn_server(test_config(dir.path().to_path_buf())).await;
        let client = reqwest::Client::new();
        let resp = client
            .get(format!("{base}/res?path=%2Fa.mp4"))
            .header("Range", "bytes=100-199")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers().get("content-range").unwrap(), "bytes 100-199/2000");
        let body = resp.bytes().await.unwrap();
        assert_eq!(body.len(), 100);
        assert_eq!(&body[..], &content[100..200]);
    }
}

mod eventing_tests {
    use super::*;
    use axum::routing::any;
    use axum::Router;
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    async fn spawn_callback_server() -> (String, oneshot::Receiver<(String, String)>) {
        let (tx, rx) = oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let app = Router::new().route(
            "/cb",
            any(move |headers: axum::http::HeaderMap, body: String| {
                let tx = tx.clone();
                async move {
                    if let Some(tx) = tx.lock().unwrap().take() {
                        let sid = headers.get("SID").and_then(|v| v.to_str().ok()).unwrap_or_default().to_string();
                        let _ = tx.send((sid, body));
                    }
                    axum::http::StatusCode::OK
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/cb"), rx)
    }

    #[tokio::test]
    async fn subscribe_triggers_initial_notify_with_system_update_id() {
        let dir = TempDir::new().unwrap();
        let (base, _handle) = spawn_server(test_config(dir.path().to_path_buf())).await;
        let (callback_url, rx) = spawn_callback_server().await;

        let client = reqwest::Client::new();
        let resp = client
            .request(reqwest::Method::from_bytes(b"SUBSCRIBE").unwrap(), format!("{base}/evt/ContentDirectory"))
            .header("CALLBACK", format!("<{callback_url}>"))
            .header("NT", "upnp:event")
            .header("TIMEOUT", "Second-1800")
            .send()
            .await
            .unwrap();

        assert_eq!(resp.status(), reqwest::StatusCode::OK);
        let sid = resp.headers().get("SID").unwrap().to_str().unwrap().to_string();
        assert!(sid.starts_with("uuid:"));
        assert_eq!(resp.headers().get("TIMEOUT").unwrap(), "Second-1800");

        let (notify_sid, notify_body) = tokio::time::timeout(Duration::from_millis(500), rx)
            .await
            .expect("NOTIFY did not arrive within 500ms")
            .unwrap();
        assert_eq!(notify_sid, sid);
        assert!(notify_body.contains("<SystemUpdateID>0</SystemUpdateID>"));
    }

    #[tokio::test]
    async fn unsubscribe_without_sid_is_rejected() {
        let dir = TempDir::new().unwrap();
        let (base, _handle) = spawn_server(test_config(dir.path().to_path_buf())).await;
        let client = reqwest::Client::new();
        let resp = client
            .request(reqwest::Method::from_bytes(b"UNSUBSCRIBE").unwrap(), format!("{base}/evt/ContentDirectory"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
    }
}

mod ssdp_tests {
    use super::*;
    use tokio_util::sync::CancellationToken;
    use upnp_dms::ssdp::{SsdpEngine, SsdpOptions};

    /// Exercises the real multicast bind / interface enumeration / shutdown
    /// path; assertions stay coarse since the surrounding network (which
    /// interfaces exist, whether multicast routes work) is outside this
    /// process's control in a test sandbox.
    #[tokio::test]
    async fn engine_shuts_down_cleanly_on_cancellation() {
        let shutdown = CancellationToken::new();
        let engine = SsdpEngine::new(SsdpOptions {
            udn: uuid::Uuid::new_v4(),
            http_port: 1338,
            server_field: "test/1",
            notify_interval: Duration::from_secs(30),
            shutdown: shutdown.clone(),
        });

        let handle = tokio::spawn(async move { engine.run().await });
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("SSDP engine did not shut down within 5s")
            .expect("SSDP engine task panicked");
    }
}
