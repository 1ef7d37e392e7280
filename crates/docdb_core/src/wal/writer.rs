//! WAL manager and its background writer thread.
//!
//! Callers hand records to the manager, which queues them for a single
//! writer thread. The writer drains the queue in batches: it waits up to the
//! batch window for more work after the first record, then writes the whole
//! batch with one `write` and one flush (plus fsync when enabled) before
//! acknowledging every record in it. Rotation happens between batches once
//! the active segment reaches the size limit.

use super::record::{WalPosition, WalRecord};
use super::replay::WalReplay;
use super::segment::{list_segments, segment_path};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::stats::DatabaseStats;
use docdb_storage::AppendFile;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// WAL tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalOptions {
    /// Rotate once the active segment reaches this many bytes.
    pub max_segment_size: u64,
    /// How long the writer waits for more records after the first.
    pub batch_window: Duration,
    /// Maximum records per batch.
    pub max_batch: usize,
    /// Fsync each batch.
    pub sync_on_write: bool,
    /// How long a caller waits for its acknowledgement.
    pub timeout: Duration,
}

impl WalOptions {
    /// Takes the WAL settings from a database config.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_segment_size: config.max_segment_size,
            batch_window: config.wal_batch_window,
            max_batch: config.wal_max_batch,
            sync_on_write: config.sync_on_write,
            timeout: config.operation_timeout,
        }
    }
}

impl Default for WalOptions {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

type Reply<T> = SyncSender<CoreResult<T>>;

enum Command {
    Append(WalRecord, Reply<WalPosition>),
    Rotate(Reply<u64>),
    Checkpoint(u64, Reply<usize>),
}

/// Append-only, segmented write-ahead log.
///
/// Segments live in one directory as `segment-{n}.log`. Opening a manager
/// always starts a fresh segment numbered after the highest existing one,
/// so records written before a restart are never appended to.
pub struct WalManager {
    dir: PathBuf,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    active: Arc<AtomicU64>,
    timeout: Duration,
    stats: Option<Arc<DatabaseStats>>,
}

impl WalManager {
    /// Opens the WAL in `dir` and starts the writer thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or the new segment cannot be
    /// created, or the thread cannot be spawned.
    pub fn open(dir: &Path, options: WalOptions) -> CoreResult<Self> {
        fs::create_dir_all(dir)?;
        let number = list_segments(dir)?.last().map_or(1, |n| n + 1);
        let file = AppendFile::open(&segment_path(dir, number))?;
        let active = Arc::new(AtomicU64::new(number));

        let writer = SegmentWriter {
            dir: dir.to_path_buf(),
            number,
            file,
            options,
            active: Arc::clone(&active),
        };
        let (sender, receiver) = mpsc::channel();
        let worker = thread::Builder::new()
            .name("docdb-wal-writer".into())
            .spawn(move || writer.run(receiver))?;

        info!(dir = %dir.display(), segment = number, "opened WAL");
        Ok(Self {
            dir: dir.to_path_buf(),
            sender: Some(sender),
            worker: Some(worker),
            active,
            timeout: options.timeout,
            stats: None,
        })
    }

    /// Counts appends in `stats`.
    #[must_use]
    pub fn with_stats(mut self, stats: Arc<DatabaseStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Directory holding the segments.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of the segment currently being written.
    #[must_use]
    pub fn active_segment(&self) -> u64 {
        self.active.load(Ordering::Acquire)
    }

    /// Segment numbers on disk, ascending.
    pub fn segments(&self) -> CoreResult<Vec<u64>> {
        list_segments(&self.dir)
    }

    /// Appends a record and waits until it is durable.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalWrite`] if the write failed and
    /// [`CoreError::Timeout`] if no acknowledgement arrived in time. In
    /// either case the caller must not apply the operation.
    pub fn log(&self, record: WalRecord) -> CoreResult<WalPosition> {
        let position = self.request("wal append", |reply| Command::Append(record, reply))?;
        if let Some(stats) = &self.stats {
            stats.record_wal_append();
        }
        Ok(position)
    }

    /// Closes the active segment and starts the next. Returns the new
    /// segment number.
    pub fn rotate(&self) -> CoreResult<u64> {
        self.request("wal rotate", Command::Rotate)
    }

    /// Deletes every segment numbered `<= up_to` except the active one.
    /// Returns how many were deleted.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::WalCheckpoint`] if a segment cannot be deleted.
    pub fn checkpoint(&self, up_to: u64) -> CoreResult<usize> {
        self.request("wal checkpoint", |reply| Command::Checkpoint(up_to, reply))
    }

    /// Starts a replay of the segments currently on disk.
    pub fn replay(&self) -> CoreResult<WalReplay> {
        WalReplay::open(&self.dir)
    }

    fn request<T>(
        &self,
        operation: &'static str,
        command: impl FnOnce(Reply<T>) -> Command,
    ) -> CoreResult<T> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| CoreError::wal_write("WAL is closed"))?;
        let (reply, response) = mpsc::sync_channel(1);
        sender
            .send(command(reply))
            .map_err(|_| CoreError::wal_write("WAL writer has stopped"))?;
        match response.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(CoreError::Timeout { operation }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(CoreError::wal_write("WAL writer stopped before replying"))
            }
        }
    }
}

impl Drop for WalManager {
    fn drop(&mut self) {
        // Closing the queue lets the writer finish its last batch and exit.
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("WAL writer thread panicked");
            }
        }
    }
}

impl std::fmt::Debug for WalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalManager")
            .field("dir", &self.dir)
            .field("active_segment", &self.active_segment())
            .finish_non_exhaustive()
    }
}

/// State owned by the writer thread.
struct SegmentWriter {
    dir: PathBuf,
    number: u64,
    file: AppendFile,
    options: WalOptions,
    active: Arc<AtomicU64>,
}

impl SegmentWriter {
    fn run(mut self, receiver: Receiver<Command>) {
        while let Ok(first) = receiver.recv() {
            let mut batch = vec![first];
            let deadline = Instant::now() + self.options.batch_window;
            while batch.len() < self.options.max_batch {
                let now = Instant::now();
                if now >= deadline {
                    break;
                }
                match receiver.recv_timeout(deadline - now) {
                    Ok(command) => batch.push(command),
                    Err(_) => break,
                }
            }
            self.process(batch);
        }
        debug!(segment = self.number, "WAL writer stopped");
    }

    fn process(&mut self, batch: Vec<Command>) {
        let mut buffer = Vec::new();
        let mut waiting = Vec::new();

        for command in batch {
            match command {
                Command::Append(record, reply) => match record.encode_line() {
                    Ok(line) => {
                        let position = WalPosition {
                            segment: self.number,
                            offset: self.file.size() + buffer.len() as u64,
                        };
                        buffer.extend_from_slice(&line);
                        waiting.push((position, reply));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(CoreError::wal_write(e.to_string())));
                    }
                },
                Command::Rotate(reply) => {
                    self.commit(&mut buffer, &mut waiting);
                    let _ = reply.send(self.rotate());
                }
                Command::Checkpoint(up_to, reply) => {
                    self.commit(&mut buffer, &mut waiting);
                    let _ = reply.send(self.checkpoint(up_to));
                }
            }
        }
        self.commit(&mut buffer, &mut waiting);
    }

    /// Writes the buffered lines and acknowledges their callers.
    fn commit(
        &mut self,
        buffer: &mut Vec<u8>,
        waiting: &mut Vec<(WalPosition, Reply<WalPosition>)>,
    ) {
        if waiting.is_empty() {
            return;
        }
        let count = waiting.len();
        let result = self
            .file
            .append(buffer.as_slice())
            .and_then(|_| self.file.flush())
            .and_then(|()| {
                if self.options.sync_on_write {
                    self.file.sync()
                } else {
                    Ok(())
                }
            });
        buffer.clear();

        match result {
            Ok(()) => {
                for (position, reply) in waiting.drain(..) {
                    // A caller that timed out has dropped its receiver.
                    let _ = reply.send(Ok(position));
                }
                debug!(segment = self.number, records = count, "committed WAL batch");
            }
            Err(e) => {
                let message = e.to_string();
                warn!(segment = self.number, error = %message, "WAL batch write failed");
                for (_, reply) in waiting.drain(..) {
                    let _ = reply.send(Err(CoreError::wal_write(message.clone())));
                }
                // The segment tail may be torn if the rollback failed too.
                if let Err(e) = self.open_next() {
                    warn!(segment = self.number, error = %e, "cannot leave failed WAL segment");
                }
                return;
            }
        }

        if self.file.size() >= self.options.max_segment_size {
            if let Err(e) = self.rotate() {
                warn!(segment = self.number, error = %e, "WAL rotation failed");
            }
        }
    }

    fn rotate(&mut self) -> CoreResult<u64> {
        self.file.sync()?;
        self.open_next()
    }

    fn open_next(&mut self) -> CoreResult<u64> {
        let next = self.number + 1;
        self.file = AppendFile::open(&segment_path(&self.dir, next))?;
        self.number = next;
        self.active.store(next, Ordering::Release);
        debug!(segment = next, "rotated WAL segment");
        Ok(next)
    }

    fn checkpoint(&mut self, up_to: u64) -> CoreResult<usize> {
        let segments = list_segments(&self.dir)
            .map_err(|e| CoreError::wal_checkpoint(e.to_string()))?;
        let mut deleted = 0;
        for number in segments
            .into_iter()
            .filter(|&n| n <= up_to && n != self.number)
        {
            let path = segment_path(&self.dir, number);
            match fs::remove_file(&path) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(CoreError::wal_checkpoint(format!(
                        "cannot delete {}: {e}",
                        path.display()
                    )))
                }
            }
        }
        if deleted > 0 {
            debug!(up_to, deleted, "checkpointed WAL segments");
        }
        Ok(deleted)
    }
}
