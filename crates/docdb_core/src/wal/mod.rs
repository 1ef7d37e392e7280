//! Write-ahead log.
//!
//! Every mutation is appended here and acknowledged before it touches
//! document storage or indexes. On startup the log is replayed to finish
//! any mutation that was logged but not applied.
//!
//! - [`WalRecord`]: the logged operations and their line encoding
//! - [`WalManager`]: segmented, batching writer
//! - [`WalReplay`]: lazy reader used by recovery and tooling

mod record;
mod replay;
mod segment;
mod writer;

pub use record::{compute_crc32, WalPosition, WalRecord, WalRecordType};
pub use replay::{ReplayedRecord, WalReplay};
pub use segment::{list_segments, parse_segment_name, segment_path};
pub use writer::{WalManager, WalOptions};
