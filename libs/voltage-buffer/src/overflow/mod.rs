//! Rotating on-disk overflow store
//!
//! Layout of a persistence directory:
//!
//! ```text
//! <dir>/segment-00000000000000000001.log   oldest
//! <dir>/segment-00000000000000000002.log
//! <dir>/segment-00000000000000000003.log   active (appended to)
//! <dir>/cursor                             "<segment> <offset> <consumed>"
//! ```
//!
//! Segment record format (little endian):
//!
//! ```text
//! | key_len (4) | payload_len (4) | routing_key (N) | payload (M) | crc32 (4) |
//! ```
//!
//! The checksum covers the header, routing key and payload. A record that fails
//! the checksum or is cut short marks the end of the valid part of a segment.

mod record;
mod segment;
mod store;

pub use segment::SegmentId;
pub use store::{OverflowStore, SegmentDrain};
