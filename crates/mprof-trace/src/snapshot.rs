//! Binary snapshot format.
//!
//! A snapshot is one thread's counters followed by its call-site records.
//! All fields are little-endian.
//!
//! ```text
//! header (56 bytes)
//!   u64 magic          "MPROFILE"
//!   u32 version
//!   u32 reserved       0
//!   u64 stride_bytes
//!   u64 alloc_count
//!   u64 sample_count
//!   u64 overflow_count
//!   u64 site_count
//! site_count records (24 bytes each)
//!   u64 address
//!   u64 sample_count
//!   u64 total_bytes
//! ```
//!
//! The file length must be exactly `HEADER_SIZE + site_count * RECORD_SIZE`.

use std::io::{self, Write};
use std::path::Path;
use thiserror::Error;

use crate::sites::SiteRecord;

/// Magic number for validation
pub const MAGIC: u64 = 0x4D50_524F_4649_4C45; // "MPROFILE"

/// Format version
pub const VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 56;
pub const RECORD_SIZE: usize = 24;

#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("snapshot too short: {len} bytes, header needs 56")]
    TooShort { len: usize },

    #[error("bad magic 0x{found:016x}, not an mprof snapshot")]
    BadMagic { found: u64 },

    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u32),

    #[error("snapshot length {actual} does not match {site_count} sites (expected {expected} bytes)")]
    LengthMismatch {
        site_count: u64,
        expected: u64,
        actual: u64,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Fixed-size snapshot header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SnapshotHeader {
    pub version: u32,
    pub stride_bytes: u64,
    pub alloc_count: u64,
    pub sample_count: u64,
    pub overflow_count: u64,
    pub site_count: u64,
}

impl SnapshotHeader {
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..8].copy_from_slice(&MAGIC.to_le_bytes());
        buf[8..12].copy_from_slice(&self.version.to_le_bytes());
        // 12..16 reserved
        buf[16..24].copy_from_slice(&self.stride_bytes.to_le_bytes());
        buf[24..32].copy_from_slice(&self.alloc_count.to_le_bytes());
        buf[32..40].copy_from_slice(&self.sample_count.to_le_bytes());
        buf[40..48].copy_from_slice(&self.overflow_count.to_le_bytes());
        buf[48..56].copy_from_slice(&self.site_count.to_le_bytes());
        buf
    }

    /// Decode and validate the header alone, without checking the length of
    /// the record section.
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        if bytes.len() < HEADER_SIZE {
            return Err(SnapshotError::TooShort { len: bytes.len() });
        }

        let magic = read_u64(bytes, 0);
        if magic != MAGIC {
            return Err(SnapshotError::BadMagic { found: magic });
        }

        let version = read_u32(bytes, 8);
        if version != VERSION {
            return Err(SnapshotError::UnsupportedVersion(version));
        }

        Ok(SnapshotHeader {
            version,
            stride_bytes: read_u64(bytes, 16),
            alloc_count: read_u64(bytes, 24),
            sample_count: read_u64(bytes, 32),
            overflow_count: read_u64(bytes, 40),
            site_count: read_u64(bytes, 48),
        })
    }

    /// Total file length this header describes
    pub fn expected_len(&self) -> Option<u64> {
        self.site_count
            .checked_mul(RECORD_SIZE as u64)?
            .checked_add(HEADER_SIZE as u64)
    }

    /// Estimated bytes allocated by the thread (`sample_count * stride`)
    pub fn estimated_bytes(&self) -> u64 {
        self.sample_count.saturating_mul(self.stride_bytes)
    }
}

/// Encode one call-site record.
pub fn encode_record(record: &SiteRecord) -> [u8; RECORD_SIZE] {
    let mut buf = [0u8; RECORD_SIZE];
    buf[0..8].copy_from_slice(&(record.address as u64).to_le_bytes());
    buf[8..16].copy_from_slice(&record.sample_count.to_le_bytes());
    buf[16..24].copy_from_slice(&record.total_bytes.to_le_bytes());
    buf
}

/// Call-site record as stored on disk (addresses are always 64-bit)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSite {
    pub address: u64,
    pub sample_count: u64,
    pub total_bytes: u64,
}

impl SnapshotSite {
    /// Estimated bytes allocated at this site (`sample_count * stride`)
    pub fn estimated_bytes(&self, stride: u64) -> u64 {
        self.sample_count.saturating_mul(stride)
    }
}

/// Write a header followed by `sites`, streaming each record.
///
/// `header.site_count` must equal the number of records yielded.
pub fn write_snapshot<'a, W, I>(out: &mut W, header: &SnapshotHeader, sites: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = &'a SiteRecord>,
{
    out.write_all(&header.encode())?;
    for site in sites {
        out.write_all(&encode_record(site))?;
    }
    out.flush()
}

/// A fully decoded snapshot file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub header: SnapshotHeader,
    pub sites: Vec<SnapshotSite>,
}

impl Snapshot {
    /// Decode a snapshot, rejecting any length that disagrees with the
    /// header's site count.
    pub fn parse(bytes: &[u8]) -> Result<Self, SnapshotError> {
        let header = SnapshotHeader::decode(bytes)?;

        let actual = bytes.len() as u64;
        match header.expected_len() {
            Some(expected) if expected == actual => {}
            expected => {
                return Err(SnapshotError::LengthMismatch {
                    site_count: header.site_count,
                    expected: expected.unwrap_or(u64::MAX),
                    actual,
                });
            }
        }

        let sites = bytes[HEADER_SIZE..]
            .chunks_exact(RECORD_SIZE)
            .map(|rec| SnapshotSite {
                address: read_u64(rec, 0),
                sample_count: read_u64(rec, 8),
                total_bytes: read_u64(rec, 16),
            })
            .collect();

        Ok(Snapshot { header, sites })
    }

    /// Read and decode a snapshot file.
    pub fn read(path: &Path) -> Result<Self, SnapshotError> {
        let bytes = std::fs::read(path)?;
        Self::parse(&bytes)
    }

    /// Sites ordered by total sampled bytes, largest first.
    pub fn sites_by_bytes(&self) -> Vec<SnapshotSite> {
        let mut sites = self.sites.clone();
        sites.sort_by(|a, b| {
            b.total_bytes
                .cmp(&a.total_bytes)
                .then(b.sample_count.cmp(&a.sample_count))
                .then(a.address.cmp(&b.address))
        });
        sites
    }

    /// Samples that were attributed to a recorded site
    pub fn attributed_samples(&self) -> u64 {
        self.sites.iter().map(|s| s.sample_count).sum()
    }
}

fn read_u64(bytes: &[u8], offset: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(word)
}

fn read_u32(bytes: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(word)
}
