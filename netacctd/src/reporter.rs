//! Offline report generation over the daily logs. Reads completed files
//! only; shares nothing with the live daemon. Daily mode prints one
//! breakdown per file; monthly mode aggregates every file in the
//! directory into a single breakdown.

use anyhow::{Context, Result};
use clap::ValueEnum;
use fxhash::FxHashMap;
use netacct_proto::{open_log, LogRecord, RecordError, RecordReader};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use tracing::warn;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReportMode {
    /// One breakdown per daily file.
    Daily,
    /// One aggregate breakdown across every file in the directory.
    Monthly,
}

/// Running totals across one or more files. Per-IP rows keep first-seen
/// order so output is stable across runs.
#[derive(Default)]
pub(crate) struct ReportTotals {
    pub kernel_rx: u64,
    pub kernel_tx: u64,
    pub per_ip: Vec<(Ipv4Addr, u64, u64)>,
    index: FxHashMap<Ipv4Addr, usize>,
}

impl ReportTotals {
    fn add_record(&mut self, record: &LogRecord) {
        self.kernel_rx = self.kernel_rx.saturating_add(record.header.total_rx_delta);
        self.kernel_tx = self.kernel_tx.saturating_add(record.header.total_tx_delta);
        for entry in &record.entries {
            match self.index.get(&entry.ip) {
                Some(&slot) => {
                    let row = &mut self.per_ip[slot];
                    row.1 = row.1.saturating_add(entry.rx_delta);
                    row.2 = row.2.saturating_add(entry.tx_delta);
                }
                None => {
                    self.index.insert(entry.ip, self.per_ip.len());
                    self.per_ip.push((entry.ip, entry.rx_delta, entry.tx_delta));
                }
            }
        }
    }

    /// Stream one daily file into the totals. A truncated trailing record
    /// keeps everything parsed before the cut.
    pub(crate) fn accumulate_file(&mut self, path: &Path) -> Result<(), RecordError> {
        let mut reader = RecordReader::new(open_log(path)?);
        loop {
            match reader.next_record() {
                Ok(Some(record)) => self.add_record(&record),
                Ok(None) => return Ok(()),
                Err(RecordError::Truncated) => {
                    warn!(
                        "{} ends mid-record; reporting the records before the cut",
                        path.display()
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn sum_per_ip(&self) -> (u64, u64) {
        let rx = self.per_ip.iter().map(|row| row.1).sum();
        let tx = self.per_ip.iter().map(|row| row.2).sum();
        (rx, tx)
    }
}

/// Find the daily logs in a directory: `<date>.bin` files plus
/// compressed-only days that exist solely as `<date>.bin.gz`. Returned as
/// plain `.bin` paths (the reader handles the gzip fallback), sorted so
/// lexical order is chronological order.
pub(crate) fn daily_files(directory: &Path) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(directory)
        .with_context(|| format!("Unable to read directory {}", directory.display()))?;
    let mut stems = BTreeSet::new();
    for entry in entries {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if let Some(stem) = name.strip_suffix(".bin").or_else(|| name.strip_suffix(".bin.gz")) {
            if !stem.starts_with('.') {
                stems.insert(stem.to_string());
            }
        }
    }
    Ok(stems
        .into_iter()
        .map(|stem| directory.join(format!("{stem}.bin")))
        .collect())
}

pub fn run(directory: &Path, mode: ReportMode) -> Result<()> {
    let files = daily_files(directory)?;
    if files.is_empty() {
        println!("No daily logs found in {}", directory.display());
        return Ok(());
    }

    match mode {
        ReportMode::Daily => {
            for file in &files {
                let mut totals = ReportTotals::default();
                if let Err(e) = totals.accumulate_file(file) {
                    warn!("Skipping {}: {e}", file.display());
                    continue;
                }
                let label = file
                    .file_stem()
                    .map(|stem| stem.to_string_lossy().to_string())
                    .unwrap_or_default();
                print_totals(&label, &totals);
            }
        }
        ReportMode::Monthly => {
            let mut totals = ReportTotals::default();
            for file in &files {
                if let Err(e) = totals.accumulate_file(file) {
                    warn!("Skipping {}: {e}", file.display());
                }
            }
            print_totals(&format!("monthly ({} days)", files.len()), &totals);
        }
    }
    Ok(())
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 * 100.0 / whole as f64
    }
}

fn print_totals(label: &str, totals: &ReportTotals) {
    let kernel_total = totals.kernel_rx.saturating_add(totals.kernel_tx);
    let (sum_rx, sum_tx) = totals.sum_per_ip();

    println!("=== {label} ===");
    println!(
        "{:<15} {:>15} {:>15} {:>15} {:>9}",
        "IP Address", "RX Bytes", "TX Bytes", "Total", "% Kernel"
    );
    for (ip, rx, tx) in &totals.per_ip {
        let total = rx.saturating_add(*tx);
        println!(
            "{:<15} {:>15} {:>15} {:>15} {:>8.2}%",
            ip.to_string(),
            rx,
            tx,
            total,
            percentage(total, kernel_total)
        );
    }
    println!(
        "{:<15} {:>15} {:>15} {:>15} {:>8.2}%",
        "ALL (per-IP)",
        sum_rx,
        sum_tx,
        sum_rx.saturating_add(sum_tx),
        percentage(sum_rx.saturating_add(sum_tx), kernel_total)
    );
    println!(
        "{:<15} {:>15} {:>15} {:>15} {:>8.2}%",
        "KERNEL",
        totals.kernel_rx,
        totals.kernel_tx,
        kernel_total,
        percentage(kernel_total, kernel_total)
    );
    if totals.kernel_rx > 0 {
        let unattributed = totals.kernel_rx.saturating_sub(sum_rx);
        println!(
            "Unattributed RX = {unattributed} ({:.2}% of kernel RX)",
            percentage(unattributed, totals.kernel_rx)
        );
    }
    if totals.kernel_tx > 0 {
        let unattributed = totals.kernel_tx.saturating_sub(sum_tx);
        println!(
            "Unattributed TX = {unattributed} ({:.2}% of kernel TX)",
            percentage(unattributed, totals.kernel_tx)
        );
    }
    println!();
}
