//! Process-wide transcode registry and the sub-process launcher abstraction.
//!
//! A [`Launcher`] is the seam between the streaming path (`web::stream`) and
//! the external transcoder binary documented in the argv contract: it is
//! invoked with `(path, start, duration)` and writes the target container to
//! stdout. This crate never assumes a specific binary; callers configure the
//! program name and argument template via [`ProcessLauncher`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

/// A running transcode: the child process and its stdout pipe, read as a
/// single `AsyncRead` so the two stay bound to the same lifetime.
///
/// A background transcoder MUST NOT outlive its request (`SPEC_FULL.md` 5):
/// dropping a `TranscodeStream` — whether the body finished, the client
/// disconnected, or an error cut the response short — kills the child
/// rather than leaving it to exit on its own `SIGPIPE`.
pub struct TranscodeStream {
    stdout: ChildStdout,
    child: Child,
}

impl AsyncRead for TranscodeStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stdout).poll_read(cx, buf)
    }
}

impl Drop for TranscodeStream {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!("failed to kill transcoder process: {}", e);
        }
    }
}

/// Spawns a sub-process that streams transcoded media to stdout.
#[async_trait]
pub trait Launcher: Send + Sync {
    async fn launch(
        &self,
        abs_path: &Path,
        start: Duration,
        duration: Option<Duration>,
        stderr_sink: Option<std::fs::File>,
    ) -> anyhow::Result<TranscodeStream>;
}

/// A [`Launcher`] backed by an external program invoked as
/// `program args... <path> <start-secs> <duration-secs-or-empty>`.
pub struct ProcessLauncher {
    pub program: String,
    pub args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl Launcher for ProcessLauncher {
    async fn launch(
        &self,
        abs_path: &Path,
        start: Duration,
        duration: Option<Duration>,
        stderr_sink: Option<std::fs::File>,
    ) -> anyhow::Result<TranscodeStream> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .arg(abs_path)
            .arg(format!("{:.3}", start.as_secs_f64()))
            .arg(
                duration
                    .map(|d| format!("{:.3}", d.as_secs_f64()))
                    .unwrap_or_default(),
            )
            .stdin(Stdio::null())
            .stdout(Stdio::piped());

        cmd.stderr(match stderr_sink {
            Some(f) => Stdio::from(f),
            None => Stdio::null(),
        });

        debug!(program = %self.program, path = %abs_path.display(), "spawning transcoder");
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow::anyhow!("transcoder spawned without a stdout pipe"))?;
        Ok(TranscodeStream { stdout, child })
    }
}

/// A named transcode target: its MIME type, DLNA profile metadata, and the
/// launcher that produces the byte stream.
#[derive(Clone)]
pub struct TranscodeSpec {
    pub key: &'static str,
    pub mime_type: &'static str,
    pub dlna_profile_name: Option<&'static str>,
    pub dlna_flags: &'static str,
    pub launcher: Arc<dyn Launcher>,
}

impl std::fmt::Debug for TranscodeSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranscodeSpec")
            .field("key", &self.key)
            .field("mime_type", &self.mime_type)
            .field("dlna_profile_name", &self.dlna_profile_name)
            .finish()
    }
}

pub type TranscodeMap = HashMap<&'static str, TranscodeSpec>;

/// The fixed set of standard transcodes: `t` (MPEG-PS), `vp8` (WebM),
/// `chromecast` (MP4), `web` (MP4). Each is backed by a [`ProcessLauncher`]
/// pointed at a documented, externally-supplied transcoder binary.
pub fn default_transcodes(transcoder_program: &str) -> TranscodeMap {
    const DLNA_FLAGS_TRANSCODE: &str = "01700000000000000000000000000000";

    let mut m = TranscodeMap::new();
    for (key, mime, profile, args) in [
        ("t", "video/mpeg", None, vec!["--format".to_string(), "mpegps".to_string()]),
        (
            "vp8",
            "video/webm",
            None,
            vec!["--format".to_string(), "webm".to_string()],
        ),
        (
            "chromecast",
            "video/mp4",
            Some("AVC_MP4_HP_HD_AAC"),
            vec!["--format".to_string(), "mp4".to_string(), "--profile".to_string(), "chromecast".to_string()],
        ),
        (
            "web",
            "video/mp4",
            Some("AVC_MP4_BL_L31_HD_AAC"),
            vec!["--format".to_string(), "mp4".to_string()],
        ),
    ] {
        m.insert(
            key,
            TranscodeSpec {
                key,
                mime_type: mime,
                dlna_profile_name: profile,
                dlna_flags: DLNA_FLAGS_TRANSCODE,
                launcher: Arc::new(ProcessLauncher::new(transcoder_program.to_string(), args)),
            },
        );
    }
    m
}

/// Opens the transcode log file for `item_name` under `pattern`
/// (`[tsname]` is substituted with the item name). Directory creation is
/// best-effort; a failure to open the log is non-fatal — the caller should
/// proceed without a stderr sink.
pub fn open_transcode_log(pattern: &str, item_name: &str) -> Option<std::fs::File> {
    let path = PathBuf::from(pattern.replace("[tsname]", item_name));
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            debug!("could not create transcode log directory {:?}: {}", parent, e);
        }
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => Some(f),
        Err(e) => {
            warn!("could not open transcode log {:?}: {}", path, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_transcodes_has_the_standard_four_keys() {
        let m = default_transcodes("dms-transcode");
        for key in ["t", "vp8", "chromecast", "web"] {
            assert!(m.contains_key(key), "missing transcode key {key}");
        }
        assert_eq!(m.len(), 4);
    }

    #[test]
    fn open_transcode_log_substitutes_tsname() {
        let dir = tempfile::tempdir().unwrap();
        let pattern = format!("{}/logs/[tsname].log", dir.path().display());
        let f = open_transcode_log(&pattern, "my movie");
        assert!(f.is_some());
        assert!(dir.path().join("logs/my movie.log").exists());
    }
}
