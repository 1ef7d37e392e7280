//! Background purge of expired cache entries.

use super::cache::Cache;
use crate::error::CoreResult;
use parking_lot::Mutex;
use std::hash::Hash;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace};

/// Owns a thread that periodically calls [`Cache::purge_expired`].
///
/// The thread holds only a weak reference to the cache and exits when the
/// cache is dropped or when the sweeper itself is dropped. Dropping the
/// sweeper joins the thread.
#[derive(Debug)]
pub struct CacheSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl CacheSweeper {
    /// Starts sweeping `cache` every `interval`.
    ///
    /// # Errors
    ///
    /// Returns an error if the thread cannot be spawned.
    pub fn spawn<K, V>(
        cache: Weak<Mutex<Cache<K, V>>>,
        interval: Duration,
        label: &str,
    ) -> CoreResult<Self>
    where
        K: Eq + Hash + Clone + Send + 'static,
        V: Clone + Send + 'static,
    {
        let (stop, stopped) = mpsc::channel::<()>();
        let label = label.to_string();
        let handle = thread::Builder::new()
            .name(format!("docdb-sweep-{label}"))
            .spawn(move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let Some(cache) = cache.upgrade() else {
                            break;
                        };
                        let purged = cache.lock().purge_expired();
                        if purged > 0 {
                            trace!(cache = %label, purged, "swept expired entries");
                        }
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            })?;
        debug!(?interval, "started cache sweeper");
        Ok(Self {
            stop: Some(stop),
            handle: Some(handle),
        })
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        // Disconnecting the channel wakes the thread immediately.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
