use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use upnp_dms::config::Config;
use upnp_dms::probe::{NullProbe, ProbeCache};
use upnp_dms::state::AppState;
use upnp_dms::{logging, ssdp, transcode, web};

/// Builds the `Config` this process runs with. Command-line argument
/// parsing and on-disk config-file loading are the named out-of-scope
/// collaborators (`SPEC_FULL.md` 1); in their absence this reads the one
/// documented environment variable and otherwise uses sensible defaults,
/// matching the construction surface those collaborators would call into.
fn build_config() -> anyhow::Result<Config> {
    let root_object_path = std::env::var("DMS_ROOT")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("."));

    let transcoder_program = std::env::var("DMS_TRANSCODER").unwrap_or_else(|_| "dms-transcode".to_string());

    Ok(Config {
        root_object_path,
        friendly_name: std::env::var("DMS_FRIENDLY_NAME").unwrap_or_else(|_| "dms".to_string()),
        udn: Uuid::new_v4(),
        http_port: std::env::var("DMS_PORT").ok().and_then(|p| p.parse().ok()).unwrap_or(1338),
        notify_interval: std::time::Duration::from_secs(30),
        allowed_ip_nets: Vec::new(),
        ignore_hidden: true,
        ignore_unreadable: true,
        ignore_paths: Vec::new(),
        no_transcode: std::env::var_os("DMS_NO_TRANSCODE").is_some(),
        force_transcode_to: None,
        transcodes: transcode::default_transcodes(&transcoder_program),
        transcode_log_pattern: Config::default_transcode_log_pattern(),
        dynamic_streams_enabled: std::env::var_os("DMS_DYNAMIC_STREAMS").is_some(),
        icons: Vec::new(),
        stall_event_subscribe: false,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init_logging(std::env::var_os("DMS_VERBOSE").is_some());

    let config = Arc::new(build_config().context("failed to build configuration")?);
    info!(root = %config.root_object_path.display(), udn = %config.udn, "starting dms");

    let probe_cache = Arc::new(ProbeCache::new(Arc::new(NullProbe)));
    let app_state = AppState::new(config.clone(), probe_cache);

    let shutdown = CancellationToken::new();

    let ssdp_engine = ssdp::SsdpEngine::new(ssdp::SsdpOptions {
        udn: config.udn,
        http_port: config.http_port,
        server_field: config.server_field(),
        notify_interval: config.notify_interval,
        shutdown: shutdown.clone(),
    });
    let ssdp_handle = tokio::spawn(async move { ssdp_engine.run().await });

    let app = web::create_router(app_state);
    let addr = SocketAddr::new(std::net::IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), config.http_port);
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.context("failed to bind HTTP listener")?;

    let server = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>());
    tokio::select! {
        result = server => result.context("HTTP server failed")?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            shutdown.cancel();
        }
    }

    let _ = ssdp_handle.await;
    Ok(())
}
