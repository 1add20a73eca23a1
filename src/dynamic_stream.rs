//! Dynamic stream resources: `<name>.dms.json` descriptor files that are
//! themselves browsable, streamable objects exposing an arbitrary command's
//! stdout as media.
//!
//! This facility is opt-in (`Config::dynamic_streams_enabled`) because a
//! descriptor names a command to execute; enabling it without trusting the
//! content tree is a deliberate choice by the deployer, not a default.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

/// The reserved descriptor suffix. A regular file ending in this suffix
/// *is* the dynamic-stream item, not a sibling of one.
pub const DMS_JSON_SUFFIX: &str = ".dms.json";

/// Whether `path`'s file name carries the reserved descriptor suffix.
pub fn is_descriptor(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(DMS_JSON_SUFFIX))
}

/// The item title for a descriptor: its basename with the suffix stripped.
pub fn title_for(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    name.strip_suffix(DMS_JSON_SUFFIX).map(str::to_string)
}

/// The `.dms.json` descriptor shape.
#[derive(Debug, Clone, Deserialize)]
pub struct DynamicStreamDescriptor {
    /// Argv of the command to run; element 0 is the program.
    pub command: Vec<String>,
    pub mime_type: String,
    #[serde(default)]
    pub dlna_profile_name: Option<String>,
    #[serde(default = "default_dlna_flags")]
    pub dlna_flags: String,
}

fn default_dlna_flags() -> String {
    "00000000000000000000000000000000".to_string()
}

/// A dynamic stream resolved against its descriptor index.
#[derive(Debug, Clone)]
pub struct DynamicStreamResource {
    pub index: usize,
    pub command: Vec<String>,
    pub mime_type: String,
    pub dlna_profile_name: Option<String>,
    pub dlna_flags: String,
}

/// Reads and parses the descriptor at `descriptor_path` (a `.dms.json`
/// file). Returns `Ok(None)` when the file does not exist — absence is
/// normal, not an error.
pub fn load_descriptors(descriptor_path: &Path) -> anyhow::Result<Option<Vec<DynamicStreamDescriptor>>> {
    match std::fs::read(descriptor_path) {
        Ok(bytes) => {
            let descriptors: Vec<DynamicStreamDescriptor> = serde_json::from_slice(&bytes)?;
            Ok(Some(descriptors))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Resolves the `dyn:<index>` transcode key used in `/res` query strings
/// into a concrete [`DynamicStreamResource`].
pub fn resolve(
    descriptors: &[DynamicStreamDescriptor],
    index: usize,
) -> Option<DynamicStreamResource> {
    descriptors.get(index).map(|d| DynamicStreamResource {
        index,
        command: d.command.clone(),
        mime_type: d.mime_type.clone(),
        dlna_profile_name: d.dlna_profile_name.clone(),
        dlna_flags: d.dlna_flags.clone(),
    })
}

/// Parses a `dyn:<index>` transcode-key suffix, as used in `/res?transcode=`.
pub fn parse_dyn_key(key: &str) -> Option<usize> {
    let idx = key.strip_prefix("dyn:")?;
    let parsed = idx.parse().ok();
    if parsed.is_none() {
        debug!("malformed dynamic stream key: {}", key);
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loads_descriptor_file() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor_path = dir.path().join("movie.dms.json");
        std::fs::write(
            &descriptor_path,
            r#"[{"command": ["cat", "movie.mkv"], "mime_type": "video/x-matroska"}]"#,
        )
        .unwrap();

        let descriptors = load_descriptors(&descriptor_path).unwrap().unwrap();
        assert_eq!(descriptors.len(), 1);
        assert_eq!(descriptors[0].command, vec!["cat", "movie.mkv"]);
        assert_eq!(descriptors[0].dlna_flags, default_dlna_flags());
    }

    #[test]
    fn missing_descriptor_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor_path = dir.path().join("movie.dms.json");
        assert!(load_descriptors(&descriptor_path).unwrap().is_none());
    }

    #[test]
    fn parses_dyn_key() {
        assert_eq!(parse_dyn_key("dyn:2"), Some(2));
        assert_eq!(parse_dyn_key("t"), None);
    }

    #[test]
    fn is_descriptor_matches_reserved_suffix() {
        assert!(is_descriptor(Path::new("/srv/media/cam.dms.json")));
        assert!(!is_descriptor(Path::new("/srv/media/movie.mkv")));
    }

    #[test]
    fn title_for_strips_suffix() {
        assert_eq!(title_for(Path::new("/srv/media/cam.dms.json")).unwrap(), "cam");
    }
}
