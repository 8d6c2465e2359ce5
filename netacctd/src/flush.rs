//! The flush worker. Every `flush_interval` seconds, and once more on
//! shutdown, it drains the counter store and hands the snapshot to the
//! storage engine. A failed write drops that interval's counters rather
//! than re-merging them into the live store: re-merging would have to
//! reconcile with membership changes that happened after the drain, and
//! the usual cause (a sick disk) rarely heals within one interval anyway.

use crate::counter_store::CounterStore;
use crate::poller::{MachineIdentity, PollerFiles};
use crate::shutdown::Shutdown;
use crate::storage;
use netacct_config::Config;
use netacct_utils::unix_time::unix_now;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub fn spawn_flush(
    config: &Config,
    store: Arc<CounterStore>,
    shutdown: Shutdown,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let iface = config.interface.clone();
    let root_dir = config.root_dir.clone();
    let interval = Duration::from_secs(config.flush_interval);
    let handle = std::thread::Builder::new()
        .name("Flush Scheduler".to_string())
        .spawn(move || {
            loop {
                if shutdown.sleep(interval) {
                    break;
                }
                flush_cycle(Path::new(&root_dir), &iface, &store);
            }
            // Final best-effort flush so a clean shutdown loses nothing.
            flush_cycle(Path::new(&root_dir), &iface, &store);
            info!("Flush scheduler stopped");
        })?;
    Ok(handle)
}

/// Drain the store and persist the snapshot. Public to the crate so the
/// end-to-end tests can drive a flush without the worker thread.
pub(crate) fn flush_cycle(root_dir: &Path, iface: &str, store: &CounterStore) {
    let ts = match unix_now() {
        Ok(ts) => ts as u32,
        Err(e) => {
            error!("Skipping flush, no usable clock: {:?}", e);
            return;
        }
    };

    let snapshot = store.snapshot_and_clear();
    if snapshot.is_empty() {
        debug!("Nothing to flush this interval");
        return;
    }

    match storage::append_snapshot(root_dir, iface, ts, &snapshot) {
        Ok(path) => {
            info!(
                "Flushed {}: kernel_rx={} kernel_tx={} ips={} -> {}",
                ts,
                snapshot.kernel_rx_delta,
                snapshot.kernel_tx_delta,
                snapshot.hosts.len(),
                path.display()
            );
            refresh_identity(root_dir, iface);
        }
        Err(e) => {
            // Deliberately lossy: the drained snapshot is gone. See the
            // module comment.
            error!(
                "Flush failed, dropping this interval's counters: {:?}",
                e
            );
        }
    }
}

/// The machine-identity record only needs to say "this run is still the
/// same boot and interface", so it is refreshed per flush, not per poll.
fn refresh_identity(root_dir: &Path, iface: &str) {
    match MachineIdentity::current(iface) {
        Ok(identity) => {
            if let Err(e) = PollerFiles::new(root_dir, iface).save_meta(&identity) {
                warn!("Unable to refresh machine identity: {:?}", e);
            }
        }
        Err(e) => warn!("Unable to capture machine identity: {:?}", e),
    }
}
