//! The kernel counter poller. Samples the interface's sysfs byte
//! counters on a fixed cadence, turns raw readings into deltas (handling
//! device resets and 64-bit wraparound), and feeds the deltas into the
//! counter store. The last raw reading and a machine-identity record are
//! persisted so a daemon restart does not double-count, and a reboot or
//! interface replacement discards the stale baseline instead of diffing
//! against it.

use crate::counter_store::CounterStore;
use crate::shutdown::Shutdown;
use byteorder::{ByteOrder, LittleEndian};
use netacct_config::Config;
use netacct_utils::{interface_index, unix_time::time_since_boot};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Counters that went backwards by less than this are treated as a device
/// reset rather than a 64-bit wraparound. Deliberately a heuristic: both
/// events look the same from a single pair of readings, and this tunable
/// picks the likelier explanation.
pub const SMALL_RESET_THRESHOLD: u64 = 1024 * 1024;

const LAST_COUNTS_FILE: &str = ".last_counts";
const META_FILE: &str = ".meta";

/// Delta between two raw counter readings.
///
/// Monotonic readings subtract directly. When the counter went backwards,
/// either the device reset (counting restarts at zero, so only `cur` is
/// attributable) or the 64-bit counter genuinely wrapped. A wrapped delta
/// landing within the reset threshold means `last` sat close enough to
/// `u64::MAX` that a wrap is the only sane reading; otherwise a small
/// `cur` indicates a reset, and anything else is treated as a wrap.
pub fn compute_delta(cur: u64, last: u64) -> u64 {
    if cur >= last {
        return cur - last;
    }
    let wrapped = cur + (u64::MAX - last) + 1;
    if wrapped <= SMALL_RESET_THRESHOLD {
        wrapped
    } else if cur <= SMALL_RESET_THRESHOLD {
        cur
    } else {
        wrapped
    }
}

/// Identity of "this boot of this interface". Persisted alongside the raw
/// counters; a mismatch at startup means the kernel's counters restarted
/// and the persisted baseline must be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineIdentity {
    /// Seconds since boot at the time the identity was captured.
    pub boot_uptime: u64,
    /// OS interface index; changes when the device is replaced.
    pub ifindex: u32,
}

impl MachineIdentity {
    pub fn current(iface: &str) -> anyhow::Result<Self> {
        let uptime = time_since_boot()?;
        let ifindex = interface_index(iface)?;
        Ok(Self {
            boot_uptime: uptime.tv_sec().max(0) as u64,
            ifindex,
        })
    }
}

/// The poller's two durable files, living in the per-interface state
/// directory. Both are rewritten via temp-file-then-rename so a crash
/// never leaves a half-written state file.
pub struct PollerFiles {
    state_dir: PathBuf,
}

impl PollerFiles {
    pub fn new(root_dir: &Path, iface: &str) -> Self {
        Self {
            state_dir: root_dir.join(iface),
        }
    }

    pub fn load_last_counts(&self) -> Option<(u64, u64)> {
        let raw = fs::read(self.state_dir.join(LAST_COUNTS_FILE)).ok()?;
        if raw.len() != 16 {
            warn!("Persisted counter state has the wrong size; ignoring it");
            return None;
        }
        Some((
            LittleEndian::read_u64(&raw[0..8]),
            LittleEndian::read_u64(&raw[8..16]),
        ))
    }

    pub fn save_last_counts(&self, last_rx: u64, last_tx: u64) -> std::io::Result<()> {
        let mut raw = [0u8; 16];
        LittleEndian::write_u64(&mut raw[0..8], last_rx);
        LittleEndian::write_u64(&mut raw[8..16], last_tx);
        self.atomic_write(LAST_COUNTS_FILE, &raw)
    }

    pub fn load_meta(&self) -> Option<MachineIdentity> {
        let raw = fs::read(self.state_dir.join(META_FILE)).ok()?;
        if raw.len() != 16 {
            warn!("Persisted identity record has the wrong size; ignoring it");
            return None;
        }
        Some(MachineIdentity {
            boot_uptime: LittleEndian::read_u64(&raw[0..8]),
            ifindex: LittleEndian::read_u32(&raw[8..12]),
            // bytes 12..16 are reserved
        })
    }

    pub fn save_meta(&self, identity: &MachineIdentity) -> std::io::Result<()> {
        let mut raw = [0u8; 16];
        LittleEndian::write_u64(&mut raw[0..8], identity.boot_uptime);
        LittleEndian::write_u32(&mut raw[8..12], identity.ifindex);
        self.atomic_write(META_FILE, &raw)
    }

    /// Decide whether the persisted raw counters are still a valid
    /// baseline for the live machine. A persisted boot uptime in the
    /// future means the machine rebooted; a different interface index
    /// means the device was replaced. Either way the kernel's counters
    /// restarted from near zero and must not be diffed against old,
    /// large values.
    pub fn load_baseline(&self, live: &MachineIdentity) -> Option<(u64, u64)> {
        let meta = self.load_meta()?;
        if meta.boot_uptime > live.boot_uptime || meta.ifindex != live.ifindex {
            warn!(
                "Machine identity changed (boot or interface index); discarding counter baseline"
            );
            return None;
        }
        self.load_last_counts()
    }

    fn atomic_write(&self, name: &str, raw: &[u8]) -> std::io::Result<()> {
        fs::create_dir_all(&self.state_dir)?;
        let tmp = self
            .state_dir
            .join(format!("{name}.tmp.{}", std::process::id()));
        let result = (|| {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(raw)?;
            file.sync_all()?;
            fs::rename(&tmp, self.state_dir.join(name))
        })();
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

fn read_counter(path: &Path) -> Option<u64> {
    let raw = fs::read_to_string(path).ok()?;
    raw.trim().parse().ok()
}

pub fn spawn_poller(
    config: &Config,
    store: Arc<CounterStore>,
    shutdown: Shutdown,
) -> anyhow::Result<std::thread::JoinHandle<()>> {
    let iface = config.interface.clone();
    let files = PollerFiles::new(Path::new(&config.root_dir), &iface);
    let interval = Duration::from_secs(config.poll_interval);
    let handle = std::thread::Builder::new()
        .name("Kernel Poller".to_string())
        .spawn(move || poller_loop(&iface, files, interval, store, shutdown))?;
    Ok(handle)
}

fn poller_loop(
    iface: &str,
    files: PollerFiles,
    interval: Duration,
    store: Arc<CounterStore>,
    shutdown: Shutdown,
) {
    let rx_path = PathBuf::from(format!("/sys/class/net/{iface}/statistics/rx_bytes"));
    let tx_path = PathBuf::from(format!("/sys/class/net/{iface}/statistics/tx_bytes"));

    // Startup validation: only keep the persisted baseline if this is
    // still the same boot and the same interface.
    let mut last = match MachineIdentity::current(iface) {
        Ok(live) => {
            let baseline = files.load_baseline(&live);
            if let Err(e) = files.save_meta(&live) {
                warn!("Unable to persist machine identity: {:?}", e);
            }
            baseline
        }
        Err(e) => {
            warn!("Unable to determine machine identity: {:?}", e);
            None
        }
    };
    if last.is_some() {
        info!("Resuming from persisted counter baseline");
    }

    loop {
        match (read_counter(&rx_path), read_counter(&tx_path)) {
            (Some(cur_rx), Some(cur_tx)) => {
                if let Some((last_rx, last_tx)) = last {
                    let d_rx = compute_delta(cur_rx, last_rx);
                    let d_tx = compute_delta(cur_tx, last_tx);
                    if d_rx != 0 || d_tx != 0 {
                        store.accumulate_kernel_delta(d_rx, d_tx);
                    }
                }
                // First-ever reading just records the baseline; there is
                // nothing to diff against yet.
                last = Some((cur_rx, cur_tx));
                if let Err(e) = files.save_last_counts(cur_rx, cur_tx) {
                    warn!("Unable to persist counter state: {:?}", e);
                }
            }
            _ => {
                // Transient read failure: no delta, no state update,
                // retry next interval.
                debug!("Kernel counters unreadable this cycle; skipping");
            }
        }
        if shutdown.sleep(interval) {
            break;
        }
    }
    info!("Kernel poller stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_delta() {
        assert_eq!(compute_delta(150, 100), 50);
        assert_eq!(compute_delta(100, 100), 0);
    }

    #[test]
    fn small_current_value_is_a_reset() {
        assert_eq!(compute_delta(100, 150), 100);
        assert_eq!(compute_delta(SMALL_RESET_THRESHOLD, u64::MAX / 2), SMALL_RESET_THRESHOLD);
    }

    #[test]
    fn wraparound_near_u64_max() {
        assert_eq!(compute_delta(5, u64::MAX), 6);
        assert_eq!(compute_delta(0, u64::MAX), 1);
    }

    #[test]
    fn large_backwards_jump_is_a_wrap() {
        // cur too large for the reset heuristic: assume genuine overflow.
        let cur = SMALL_RESET_THRESHOLD + 1;
        let last = u64::MAX - 10;
        assert_eq!(compute_delta(cur, last), cur + 11);
    }

    #[test]
    fn last_counts_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = PollerFiles::new(dir.path(), "eth0");
        assert!(files.load_last_counts().is_none());

        files.save_last_counts(123, u64::MAX).unwrap();
        assert_eq!(files.load_last_counts(), Some((123, u64::MAX)));

        // The on-disk layout is two little-endian u64s, nothing else.
        let raw = fs::read(dir.path().join("eth0").join(LAST_COUNTS_FILE)).unwrap();
        assert_eq!(raw.len(), 16);
        assert_eq!(&raw[0..8], &[123, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn meta_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let files = PollerFiles::new(dir.path(), "eth0");
        let identity = MachineIdentity {
            boot_uptime: 7777,
            ifindex: 3,
        };
        files.save_meta(&identity).unwrap();
        assert_eq!(files.load_meta(), Some(identity));

        let raw = fs::read(dir.path().join("eth0").join(META_FILE)).unwrap();
        assert_eq!(raw.len(), 16);
    }

    #[test]
    fn baseline_survives_matching_identity() {
        let dir = tempfile::tempdir().unwrap();
        let files = PollerFiles::new(dir.path(), "eth0");
        let identity = MachineIdentity {
            boot_uptime: 100,
            ifindex: 2,
        };
        files.save_meta(&identity).unwrap();
        files.save_last_counts(10, 20).unwrap();

        let live = MachineIdentity {
            boot_uptime: 500, // later in the same boot
            ifindex: 2,
        };
        assert_eq!(files.load_baseline(&live), Some((10, 20)));
    }

    #[test]
    fn interface_replacement_discards_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let files = PollerFiles::new(dir.path(), "eth0");
        files
            .save_meta(&MachineIdentity {
                boot_uptime: 100,
                ifindex: 2,
            })
            .unwrap();
        files.save_last_counts(10, 20).unwrap();

        let live = MachineIdentity {
            boot_uptime: 500,
            ifindex: 7,
        };
        assert!(files.load_baseline(&live).is_none());
    }

    #[test]
    fn reboot_discards_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let files = PollerFiles::new(dir.path(), "eth0");
        files
            .save_meta(&MachineIdentity {
                boot_uptime: 100_000,
                ifindex: 2,
            })
            .unwrap();
        files.save_last_counts(10, 20).unwrap();

        let live = MachineIdentity {
            boot_uptime: 60, // freshly booted
            ifindex: 2,
        };
        assert!(files.load_baseline(&live).is_none());
    }

    #[test]
    fn missing_meta_means_no_baseline() {
        let dir = tempfile::tempdir().unwrap();
        let files = PollerFiles::new(dir.path(), "eth0");
        files.save_last_counts(10, 20).unwrap();
        let live = MachineIdentity {
            boot_uptime: 500,
            ifindex: 2,
        };
        assert!(files.load_baseline(&live).is_none());
    }
}
