//! Lazy replay of WAL segments.

use super::record::{WalPosition, WalRecord};
use super::segment::{list_segments, segment_path};
use crate::error::{CoreError, CoreResult};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A record read back from the WAL.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplayedRecord {
    /// Where the record was found.
    pub position: WalPosition,
    /// The record.
    pub record: WalRecord,
}

/// Iterates over every valid record in ascending segment order.
///
/// Segments are opened one at a time and read line by line. Corrupt lines
/// (bad checksum, bad JSON, or a torn final line) are logged and skipped; the
/// count is available from [`WalReplay::skipped`]. Failing to open or read a
/// segment is an error.
pub struct WalReplay {
    dir: PathBuf,
    pending: VecDeque<u64>,
    segments: Vec<u64>,
    current: Option<(u64, BufReader<File>, u64)>,
    skipped: usize,
    line: Vec<u8>,
}

impl WalReplay {
    /// Starts a replay of the segments currently in `dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalReplay`] if the directory cannot be listed.
    pub fn open(dir: &Path) -> CoreResult<Self> {
        let segments = list_segments(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
            pending: segments.iter().copied().collect(),
            segments,
            current: None,
            skipped: 0,
            line: Vec::new(),
        })
    }

    /// Segment numbers covered by this replay.
    #[must_use]
    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    /// Number of corrupt lines skipped so far.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.skipped
    }

    fn open_next(&mut self) -> Option<CoreResult<()>> {
        loop {
            let number = self.pending.pop_front()?;
            let path = segment_path(&self.dir, number);
            match File::open(&path) {
                Ok(file) => {
                    self.current = Some((number, BufReader::new(file), 0));
                    return Some(Ok(()));
                }
                // Checkpointed away after the listing was taken.
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => {
                    return Some(Err(CoreError::wal_replay(format!(
                        "cannot open {}: {e}",
                        path.display()
                    ))))
                }
            }
        }
    }
}

impl Iterator for WalReplay {
    type Item = CoreResult<ReplayedRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.current.is_none() {
                if let Err(e) = self.open_next()? {
                    return Some(Err(e));
                }
            }
            let Some((segment, reader, offset)) = self.current.as_mut() else {
                continue;
            };

            self.line.clear();
            let read = match reader.read_until(b'\n', &mut self.line) {
                Ok(read) => read,
                Err(e) => {
                    let message = format!("cannot read segment {segment}: {e}");
                    self.current = None;
                    return Some(Err(CoreError::wal_replay(message)));
                }
            };
            if read == 0 {
                self.current = None;
                continue;
            }

            let position = WalPosition {
                segment: *segment,
                offset: *offset,
            };
            *offset += read as u64;

            if self.line.last() != Some(&b'\n') {
                warn!(%position, "skipping torn WAL line");
                self.skipped += 1;
                continue;
            }
            match WalRecord::decode_line(&self.line) {
                Ok(record) => return Some(Ok(ReplayedRecord { position, record })),
                Err(e) => {
                    warn!(%position, error = %e, "skipping corrupt WAL line");
                    self.skipped += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;

    fn delete(id: &str) -> WalRecord {
        WalRecord::Delete {
            collection: "c".into(),
            id: id.into(),
        }
    }

    fn write_segment(dir: &Path, number: u64, lines: &[Vec<u8>]) {
        let mut file = File::create(segment_path(dir, number)).unwrap();
        for line in lines {
            file.write_all(line).unwrap();
        }
    }

    #[test]
    fn reads_segments_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_segment(dir.path(), 2, &[delete("c").encode_line().unwrap()]);
        write_segment(
            dir.path(),
            1,
            &[delete("a").encode_line().unwrap(), delete("b").encode_line().unwrap()],
        );

        let records: Vec<ReplayedRecord> =
            WalReplay::open(dir.path()).unwrap().map(Result::unwrap).collect();
        let ids: Vec<&str> = records.iter().filter_map(|r| r.record.document_id()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(records[0].position, WalPosition { segment: 1, offset: 0 });
        assert_eq!(records[2].position.segment, 2);
    }

    #[test]
    fn skips_corrupt_and_torn_lines() {
        let dir = tempfile::tempdir().unwrap();
        let good = delete("ok").encode_line().unwrap();
        let mut torn = delete("torn").encode_line().unwrap();
        torn.truncate(torn.len() - 4);
        write_segment(
            dir.path(),
            1,
            &[b"deadbeef\t{\"op\":\"delete\"}\n".to_vec(), good.clone(), torn],
        );

        let mut replay = WalReplay::open(dir.path()).unwrap();
        let records: Vec<ReplayedRecord> = replay.by_ref().map(Result::unwrap).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record.document_id(), Some("ok"));
        assert_eq!(records[0].position.offset, 25);
        assert_eq!(replay.skipped(), 2);
    }

    #[test]
    fn torn_tail_stays_in_its_segment() {
        let dir = tempfile::tempdir().unwrap();
        let mut torn = delete("lost").encode_line().unwrap();
        torn.truncate(7);
        write_segment(dir.path(), 1, &[delete("a").encode_line().unwrap(), torn]);
        write_segment(dir.path(), 2, &[delete("b").encode_line().unwrap()]);

        let mut replay = WalReplay::open(dir.path()).unwrap();
        let ids: Vec<String> = replay
            .by_ref()
            .map(|r| r.unwrap().record.document_id().unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(replay.skipped(), 1);
    }

    #[test]
    fn empty_directory_replays_nothing() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("_wal")).unwrap();
        let mut replay = WalReplay::open(&dir.path().join("_wal")).unwrap();
        assert!(replay.next().is_none());
        assert!(replay.segments().is_empty());
    }
}
