//! The daily log record format. This layout is durable: files written by
//! any version must stay parseable forever, so nothing here may change
//! meaning. All integers are little-endian with no padding between fields:
//!
//! ```text
//! Record   := Header IpEntry{ip_count}
//! Header   := ts:u32 total_rx_delta:u64 total_tx_delta:u64 ip_count:u16
//! IpEntry  := ipv:u8 pad:u8 addr:u32(network byte order) rx_delta:u64 tx_delta:u64
//! ```
//!
//! A daily file is a plain concatenation of records in append order. A
//! file may also exist as a gzip-compressed sibling with a `.gz` suffix;
//! [`open_log`] handles the fallback.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::read::GzDecoder;
use std::fs::File;
use std::io::{Read, Write};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// The only address version currently written. The tag exists so a future
/// format revision can carry IPv6 entries without breaking old readers.
pub const IP_ENTRY_VERSION_V4: u8 = 4;

/// Encoded header size: ts + rx + tx + ip_count.
pub const HEADER_BYTES: usize = 4 + 8 + 8 + 2;

/// Encoded per-IP entry size: ipv + pad + addr + rx + tx.
pub const IP_ENTRY_BYTES: usize = 1 + 1 + 4 + 8 + 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Flush timestamp, seconds since the UNIX epoch.
    pub ts: u32,
    /// Interface-wide kernel rx delta for this flush interval.
    pub total_rx_delta: u64,
    /// Interface-wide kernel tx delta for this flush interval.
    pub total_tx_delta: u64,
    /// Number of per-IP entries following the header.
    pub ip_count: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IpEntry {
    pub ip: Ipv4Addr,
    pub rx_delta: u64,
    pub tx_delta: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub header: RecordHeader,
    pub entries: Vec<IpEntry>,
}

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("I/O error reading log")]
    Io(#[from] std::io::Error),
    #[error("Log ends mid-record")]
    Truncated,
    #[error("Log file not found (plain or .gz): {0}")]
    NotFound(String),
}

/// Serialize one record. The caller supplies entries in the order they
/// should appear on disk; `ip_count` in the header is taken from the
/// entries slice, not from the header argument.
pub fn write_record<W: Write>(
    w: &mut W,
    ts: u32,
    total_rx_delta: u64,
    total_tx_delta: u64,
    entries: &[IpEntry],
) -> std::io::Result<()> {
    w.write_u32::<LittleEndian>(ts)?;
    w.write_u64::<LittleEndian>(total_rx_delta)?;
    w.write_u64::<LittleEndian>(total_tx_delta)?;
    w.write_u16::<LittleEndian>(entries.len() as u16)?;
    for entry in entries {
        w.write_u8(IP_ENTRY_VERSION_V4)?;
        w.write_u8(0)?;
        // Network byte order: the four address octets, in order.
        w.write_all(&entry.ip.octets())?;
        w.write_u64::<LittleEndian>(entry.rx_delta)?;
        w.write_u64::<LittleEndian>(entry.tx_delta)?;
    }
    Ok(())
}

/// Streaming reader over a concatenation of records.
///
/// Clean EOF on a record boundary ends the stream; EOF inside a record is
/// reported as [`RecordError::Truncated`] so the caller can keep whatever
/// whole records preceded it.
pub struct RecordReader<R: Read> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    /// Read the next record, or `None` at a clean end of file.
    pub fn next_record(&mut self) -> Result<Option<LogRecord>, RecordError> {
        let mut header_buf = [0u8; HEADER_BYTES];
        let mut filled = 0;
        while filled < header_buf.len() {
            let n = self.inner.read(&mut header_buf[filled..])?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(RecordError::Truncated);
            }
            filled += n;
        }
        let mut cursor = &header_buf[..];
        let header = RecordHeader {
            ts: cursor.read_u32::<LittleEndian>()?,
            total_rx_delta: cursor.read_u64::<LittleEndian>()?,
            total_tx_delta: cursor.read_u64::<LittleEndian>()?,
            ip_count: cursor.read_u16::<LittleEndian>()?,
        };

        let mut entries = Vec::with_capacity(header.ip_count as usize);
        for _ in 0..header.ip_count {
            let mut entry_buf = [0u8; IP_ENTRY_BYTES];
            self.inner
                .read_exact(&mut entry_buf)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::UnexpectedEof => RecordError::Truncated,
                    _ => RecordError::Io(e),
                })?;
            let ipv = entry_buf[0];
            if ipv != IP_ENTRY_VERSION_V4 {
                // Reserved for future address versions; consume and skip.
                continue;
            }
            let mut cursor = &entry_buf[2..];
            let mut octets = [0u8; 4];
            cursor.read_exact(&mut octets)?;
            entries.push(IpEntry {
                ip: Ipv4Addr::from(octets),
                rx_delta: cursor.read_u64::<LittleEndian>()?,
                tx_delta: cursor.read_u64::<LittleEndian>()?,
            });
        }

        Ok(Some(LogRecord { header, entries }))
    }
}

/// Open a daily log for reading by its plain path, falling back to a
/// gzip-compressed sibling (`<path>.gz`) when the plain file is absent.
pub fn open_log(path: &Path) -> Result<Box<dyn Read>, RecordError> {
    if path.exists() {
        return Ok(Box::new(File::open(path)?));
    }
    let gz: PathBuf = PathBuf::from(format!("{}.gz", path.display()));
    if gz.exists() {
        return Ok(Box::new(GzDecoder::new(File::open(gz)?)));
    }
    Err(RecordError::NotFound(path.display().to_string()))
}
