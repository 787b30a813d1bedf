//! Segment file naming and validation

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;

use super::record::{decode_next, Decoded};

const FILE_PREFIX: &str = "segment-";
const FILE_SUFFIX: &str = ".log";

/// Monotonic segment number. Lower ids are older.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub fn file_name(&self) -> String {
        format!("{}{:020}{}", FILE_PREFIX, self.0, FILE_SUFFIX)
    }

    pub fn parse_file_name(name: &str) -> Option<Self> {
        name.strip_prefix(FILE_PREFIX)?
            .strip_suffix(FILE_SUFFIX)?
            .parse()
            .ok()
            .map(SegmentId)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Valid prefix of a segment file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SegmentScan {
    pub file_len: u64,
    pub valid_len: u64,
    pub records: u64,
    pub torn: Option<&'static str>,
}

/// Walk every record and find where the valid data ends.
pub(crate) fn scan(path: &Path) -> io::Result<SegmentScan> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut valid_len = 0u64;
    let mut records = 0u64;
    loop {
        match decode_next(&mut reader, file_len - valid_len)? {
            Decoded::Record(_, len) => {
                valid_len += len;
                records += 1;
            },
            Decoded::End => {
                return Ok(SegmentScan {
                    file_len,
                    valid_len,
                    records,
                    torn: None,
                })
            },
            Decoded::Torn(reason) => {
                return Ok(SegmentScan {
                    file_len,
                    valid_len,
                    records,
                    torn: Some(reason),
                })
            },
        }
    }
}
