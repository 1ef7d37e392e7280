//! Segment file naming and discovery.

use crate::error::{CoreError, CoreResult};
use std::fs;
use std::path::{Path, PathBuf};

const PREFIX: &str = "segment-";
const SUFFIX: &str = ".log";

/// Path of segment `number` inside `dir`.
#[must_use]
pub fn segment_path(dir: &Path, number: u64) -> PathBuf {
    dir.join(format!("{PREFIX}{number}{SUFFIX}"))
}

/// Parses a segment number out of a file name.
#[must_use]
pub fn parse_segment_name(name: &str) -> Option<u64> {
    name.strip_prefix(PREFIX)?.strip_suffix(SUFFIX)?.parse().ok()
}

/// Lists the segment numbers present in `dir`, ascending.
///
/// A missing directory has no segments.
///
/// # Errors
///
/// Returns [`CoreError::WalReplay`] if the directory cannot be read.
pub fn list_segments(dir: &Path) -> CoreResult<Vec<u64>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(CoreError::wal_replay(format!(
                "cannot read WAL directory {}: {e}",
                dir.display()
            )))
        }
    };

    let mut segments = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            CoreError::wal_replay(format!("cannot read WAL directory {}: {e}", dir.display()))
        })?;
        if let Some(number) = entry.file_name().to_str().and_then(parse_segment_name) {
            segments.push(number);
        }
    }
    segments.sort_unstable();
    Ok(segments)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        let path = segment_path(Path::new("/db/_wal"), 12);
        assert_eq!(path, Path::new("/db/_wal/segment-12.log"));
        assert_eq!(parse_segment_name("segment-12.log"), Some(12));
        assert_eq!(parse_segment_name("segment-x.log"), None);
        assert_eq!(parse_segment_name("other.log"), None);
    }

    #[test]
    fn lists_numerically() {
        let dir = tempfile::tempdir().unwrap();
        for n in [10, 2, 1] {
            fs::write(segment_path(dir.path(), n), b"").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), b"").unwrap();
        assert_eq!(list_segments(dir.path()).unwrap(), vec![1, 2, 10]);
        assert!(list_segments(&dir.path().join("missing")).unwrap().is_empty());
    }
}
