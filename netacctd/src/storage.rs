//! Crash-safe append of flush snapshots to the daily log. Each snapshot
//! is serialized into a private journal file, durably synced, then
//! appended to `<root>/<iface>/daily/<YYYY-MM-DD>.bin` (UTC day) and
//! synced again before the journal is removed. A crash mid-write leaves
//! the daily file with only whole, previously-completed records; an
//! orphaned journal is harmless and simply ignored.

use crate::counter_store::Snapshot;
use chrono::{TimeZone, Utc};
use netacct_proto::{write_record, IpEntry};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O failure persisting snapshot")]
    Io(#[from] std::io::Error),
    #[error("Timestamp {0} is not representable as a calendar date")]
    BadTimestamp(u32),
}

/// Append one snapshot to the daily log for its UTC day. Returns the path
/// of the daily file written. On any failure the attempt is abandoned and
/// the journal removed; the caller decides what to do about the lost
/// snapshot.
pub fn append_snapshot(
    root_dir: &Path,
    iface: &str,
    ts: u32,
    snapshot: &Snapshot,
) -> Result<PathBuf, StorageError> {
    let daily_dir = root_dir.join(iface).join("daily");
    fs::create_dir_all(&daily_dir)?;

    let date = Utc
        .timestamp_opt(ts as i64, 0)
        .single()
        .ok_or(StorageError::BadTimestamp(ts))?
        .format("%Y-%m-%d");
    let target = daily_dir.join(format!("{date}.bin"));
    let journal = daily_dir.join(format!(".journal.{iface}.{ts}.tmp"));

    let result = write_and_append(&journal, &target, ts, snapshot);
    // Success or failure, the journal must not linger.
    let _ = fs::remove_file(&journal);
    result?;
    Ok(target)
}

fn write_and_append(
    journal: &Path,
    target: &Path,
    ts: u32,
    snapshot: &Snapshot,
) -> Result<(), StorageError> {
    let entries: Vec<IpEntry> = snapshot
        .hosts
        .iter()
        .map(|host| IpEntry {
            ip: host.ip,
            rx_delta: host.rx_bytes,
            tx_delta: host.tx_bytes,
        })
        .collect();

    let mut journal_file = fs::File::create(journal)?;
    write_record(
        &mut journal_file,
        ts,
        snapshot.kernel_rx_delta,
        snapshot.kernel_tx_delta,
        &entries,
    )?;
    journal_file.sync_all()?;
    drop(journal_file);

    // Re-read the synced journal and append it whole, so the bytes that
    // land in the daily file are exactly the bytes that survived the
    // durability barrier.
    let record = fs::read(journal)?;
    let mut daily = fs::OpenOptions::new().create(true).append(true).open(target)?;
    daily.write_all(&record)?;
    daily.sync_all()?;
    Ok(())
}
