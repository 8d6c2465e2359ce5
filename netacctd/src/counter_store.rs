//! The in-memory per-IP counter table. One instance exists per daemon,
//! owned by `main` and shared with every worker through an `Arc`. All
//! state lives behind a single mutex: each operation is one short
//! critical section, and nothing holds the lock across I/O.

use fxhash::FxHashMap;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Hard bound on tracked addresses. Exceeding it fails the add; nothing
/// is evicted. The bound also caps the cost of a snapshot, which is the
/// only O(n) operation under the lock.
pub const MAX_IP_ENTRIES: usize = 64;

/// Counters for one tracked address, accumulated since the last flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCounter {
    pub ip: Ipv4Addr,
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One drained flush interval: the kernel-wide deltas plus a copy of
/// every tracked address's counters, in registration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub kernel_rx_delta: u64,
    pub kernel_tx_delta: u64,
    pub hosts: Vec<HostCounter>,
}

impl Snapshot {
    /// True when there is nothing worth persisting: no kernel delta and
    /// no tracked addresses at all. Tracked-but-idle addresses still
    /// produce a record, matching the on-disk history of membership.
    pub fn is_empty(&self) -> bool {
        self.kernel_rx_delta == 0 && self.kernel_tx_delta == 0 && self.hosts.is_empty()
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CounterStoreError {
    #[error("Tracked IP table is full ({max} entries)")]
    TableFull { max: usize },
}

#[derive(Default)]
struct StoreInner {
    /// O(1) lookup for the packet feed's per-packet updates.
    hosts: FxHashMap<Ipv4Addr, HostCounter>,
    /// Registration order, so snapshots enumerate deterministically.
    /// Invariant: every key in `hosts` appears here exactly once.
    order: Vec<Ipv4Addr>,
    kernel_rx_delta: u64,
    kernel_tx_delta: u64,
}

#[derive(Default)]
pub struct CounterStore {
    inner: Mutex<StoreInner>,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking `ip` with zeroed counters. A second registration of
    /// the same address is a no-op and does not touch its counters.
    pub fn register(&self, ip: Ipv4Addr) -> Result<(), CounterStoreError> {
        let mut inner = self.inner.lock();
        if inner.hosts.contains_key(&ip) {
            return Ok(());
        }
        if inner.hosts.len() >= MAX_IP_ENTRIES {
            return Err(CounterStoreError::TableFull {
                max: MAX_IP_ENTRIES,
            });
        }
        inner.hosts.insert(
            ip,
            HostCounter {
                ip,
                rx_bytes: 0,
                tx_bytes: 0,
            },
        );
        inner.order.push(ip);
        Ok(())
    }

    /// Stop tracking `ip`, returning its final counters so the caller can
    /// log them. `None` if the address was not tracked.
    pub fn deregister(&self, ip: Ipv4Addr) -> Option<HostCounter> {
        let mut inner = self.inner.lock();
        let removed = inner.hosts.remove(&ip);
        if removed.is_some() {
            inner.order.retain(|entry| *entry != ip);
        }
        removed
    }

    /// Add received bytes to a tracked address. Untracked addresses are
    /// silently dropped: the packet feed reports every packet it sees and
    /// membership is decided here, not in the feed.
    pub fn accumulate_rx(&self, ip: Ipv4Addr, bytes: u64) {
        let mut inner = self.inner.lock();
        if let Some(host) = inner.hosts.get_mut(&ip) {
            host.rx_bytes = host.rx_bytes.saturating_add(bytes);
        }
    }

    /// Add transmitted bytes to a tracked address; untracked drops.
    pub fn accumulate_tx(&self, ip: Ipv4Addr, bytes: u64) {
        let mut inner = self.inner.lock();
        if let Some(host) = inner.hosts.get_mut(&ip) {
            host.tx_bytes = host.tx_bytes.saturating_add(bytes);
        }
    }

    /// Add an interface-wide delta from the kernel poller, independent of
    /// per-IP membership.
    pub fn accumulate_kernel_delta(&self, rx: u64, tx: u64) {
        let mut inner = self.inner.lock();
        inner.kernel_rx_delta = inner.kernel_rx_delta.saturating_add(rx);
        inner.kernel_tx_delta = inner.kernel_tx_delta.saturating_add(tx);
    }

    /// Atomically copy out every counter and zero it in place. Membership
    /// survives a snapshot: a registered address stays registered with
    /// fresh zero counters. This is the only operation that observes a
    /// consistent cross-entry view.
    pub fn snapshot_and_clear(&self) -> Snapshot {
        let mut inner = self.inner.lock();
        let mut hosts = Vec::with_capacity(inner.order.len());
        let order = std::mem::take(&mut inner.order);
        for ip in &order {
            if let Some(host) = inner.hosts.get_mut(ip) {
                hosts.push(*host);
                host.rx_bytes = 0;
                host.tx_bytes = 0;
            }
        }
        inner.order = order;
        let snapshot = Snapshot {
            kernel_rx_delta: inner.kernel_rx_delta,
            kernel_tx_delta: inner.kernel_tx_delta,
            hosts,
        };
        inner.kernel_rx_delta = 0;
        inner.kernel_tx_delta = 0;
        snapshot
    }

    pub fn tracked_count(&self) -> usize {
        self.inner.lock().hosts.len()
    }

    /// Check the map/order invariant: same length, every ordered address
    /// present in the map, no duplicates in the order.
    #[cfg(test)]
    fn is_consistent(&self) -> bool {
        let inner = self.inner.lock();
        if inner.order.len() != inner.hosts.len() {
            return false;
        }
        let unique: std::collections::HashSet<_> = inner.order.iter().collect();
        unique.len() == inner.order.len()
            && inner.order.iter().all(|ip| inner.hosts.contains_key(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, last)
    }

    #[test]
    fn accumulation_is_conserved_across_snapshots() {
        let store = CounterStore::new();
        store.register(ip(1)).unwrap();
        store.accumulate_rx(ip(1), 100);
        store.accumulate_tx(ip(1), 7);
        let first = store.snapshot_and_clear();
        store.accumulate_rx(ip(1), 23);
        let second = store.snapshot_and_clear();

        let total_rx: u64 = first.hosts[0].rx_bytes + second.hosts[0].rx_bytes;
        let total_tx: u64 = first.hosts[0].tx_bytes + second.hosts[0].tx_bytes;
        assert_eq!(total_rx, 123);
        assert_eq!(total_tx, 7);
    }

    #[test]
    fn second_snapshot_is_zero_with_same_membership() {
        let store = CounterStore::new();
        store.register(ip(1)).unwrap();
        store.register(ip(2)).unwrap();
        store.accumulate_rx(ip(1), 50);
        store.accumulate_kernel_delta(500, 600);

        let first = store.snapshot_and_clear();
        let second = store.snapshot_and_clear();

        let first_ips: Vec<_> = first.hosts.iter().map(|h| h.ip).collect();
        let second_ips: Vec<_> = second.hosts.iter().map(|h| h.ip).collect();
        assert_eq!(first_ips, second_ips);
        assert!(second.hosts.iter().all(|h| h.rx_bytes == 0 && h.tx_bytes == 0));
        assert_eq!(second.kernel_rx_delta, 0);
        assert_eq!(second.kernel_tx_delta, 0);
    }

    #[test]
    fn double_register_is_a_noop() {
        let store = CounterStore::new();
        store.register(ip(1)).unwrap();
        store.accumulate_rx(ip(1), 10);
        store.register(ip(1)).unwrap();
        assert_eq!(store.tracked_count(), 1);

        let snapshot = store.snapshot_and_clear();
        assert_eq!(snapshot.hosts.len(), 1);
        assert_eq!(snapshot.hosts[0].rx_bytes, 10);
    }

    #[test]
    fn capacity_bound_rejects_without_disturbing_entries() {
        let store = CounterStore::new();
        for i in 0..MAX_IP_ENTRIES {
            store
                .register(Ipv4Addr::new(10, 0, (i / 256) as u8, (i % 256) as u8))
                .unwrap();
        }
        store.accumulate_rx(ip(0), 42);

        let result = store.register(Ipv4Addr::new(192, 168, 0, 1));
        assert_eq!(
            result,
            Err(CounterStoreError::TableFull {
                max: MAX_IP_ENTRIES
            })
        );
        assert_eq!(store.tracked_count(), MAX_IP_ENTRIES);

        let snapshot = store.snapshot_and_clear();
        assert_eq!(snapshot.hosts[0].rx_bytes, 42);
        assert!(store.is_consistent());
    }

    #[test]
    fn untracked_updates_are_dropped() {
        let store = CounterStore::new();
        store.register(ip(1)).unwrap();
        store.accumulate_rx(ip(99), 1000);
        store.accumulate_tx(ip(99), 1000);

        let snapshot = store.snapshot_and_clear();
        assert_eq!(snapshot.hosts.len(), 1);
        assert_eq!(snapshot.hosts[0].rx_bytes, 0);
        assert_eq!(snapshot.hosts[0].tx_bytes, 0);
    }

    #[test]
    fn kernel_deltas_accumulate_independently() {
        let store = CounterStore::new();
        store.accumulate_kernel_delta(100, 200);
        store.accumulate_kernel_delta(1, 2);

        let snapshot = store.snapshot_and_clear();
        assert_eq!(snapshot.kernel_rx_delta, 101);
        assert_eq!(snapshot.kernel_tx_delta, 202);
        assert!(snapshot.hosts.is_empty());
    }

    #[test]
    fn snapshots_enumerate_in_registration_order() {
        let store = CounterStore::new();
        store.register(ip(3)).unwrap();
        store.register(ip(1)).unwrap();
        store.register(ip(2)).unwrap();

        let snapshot = store.snapshot_and_clear();
        let ips: Vec<_> = snapshot.hosts.iter().map(|h| h.ip).collect();
        assert_eq!(ips, vec![ip(3), ip(1), ip(2)]);
    }

    #[test]
    fn deregister_returns_final_counters() {
        let store = CounterStore::new();
        store.register(ip(1)).unwrap();
        store.accumulate_tx(ip(1), 77);

        let finals = store.deregister(ip(1)).unwrap();
        assert_eq!(finals.tx_bytes, 77);
        assert!(store.deregister(ip(1)).is_none());
        assert_eq!(store.tracked_count(), 0);
    }

    #[test]
    fn map_and_order_stay_consistent() {
        let store = CounterStore::new();
        for i in 1..=20u8 {
            store.register(ip(i)).unwrap();
        }
        for i in (2..=20u8).step_by(2) {
            store.deregister(ip(i));
        }
        store.register(ip(2)).unwrap();
        store.snapshot_and_clear();
        assert!(store.is_consistent());
        assert_eq!(store.tracked_count(), 11);
    }

    #[test]
    fn empty_snapshot_detection() {
        let store = CounterStore::new();
        assert!(store.snapshot_and_clear().is_empty());

        // A registered-but-idle address still produces a record.
        store.register(ip(1)).unwrap();
        assert!(!store.snapshot_and_clear().is_empty());
    }
}
