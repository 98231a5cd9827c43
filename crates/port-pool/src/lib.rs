//! Leasable pool of transport ports.
//!
//! A [`PortPool`] owns a fixed range of ports, stepped by a gap so that the
//! port right after each leased one stays free for a companion channel
//! (RTP/RTCP pairs). Sessions lease a port with [`PortPool::take_port`] and
//! hand it back with [`PortPool::restore_port`], or drop it for good with
//! [`PortPool::remove_port`] when the port turns out to be unusable.
//!
//! # Concurrency
//!
//! The pool order lives in a lock-free MPMC queue and port membership in a
//! sharded set. A port is leased only by the caller that removes it from the
//! membership set, so the same port can never be handed out twice without an
//! intervening restore. Queue entries whose port is no longer a member are
//! stale and get skipped on the next take.

mod error;

use crossbeam_channel::{Receiver, Sender};
use dashmap::DashSet;
use tracing::{debug, info, warn};

pub use error::PortPoolError;

/// Default step between two leasable ports (leaves room for the RTCP port).
pub const DEFAULT_PORT_GAP: u16 = 2;

/// Pool of ports available to streaming sessions.
pub struct PortPool {
    target_port_min: u16,
    target_port_max: u16,
    port_gap: u16,
    /// Pool order. May contain stale entries, see module docs.
    queue_tx: Sender<u16>,
    queue_rx: Receiver<u16>,
    /// Ports currently available for leasing.
    available: DashSet<u16>,
}

impl PortPool {
    /// Create an empty pool for `[min, max]` stepping by `gap`.
    ///
    /// The pool holds no ports until [`PortPool::init_resource`] is called.
    pub fn new(target_port_min: u16, target_port_max: u16, port_gap: u16) -> Result<Self, PortPoolError> {
        if port_gap == 0 {
            return Err(PortPoolError::ZeroGap);
        }
        if target_port_min > target_port_max {
            return Err(PortPoolError::InvalidRange {
                min: target_port_min,
                max: target_port_max,
            });
        }

        let (queue_tx, queue_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            target_port_min,
            target_port_max,
            port_gap,
            queue_tx,
            queue_rx,
            available: DashSet::new(),
        })
    }

    /// Create an empty pool using [`DEFAULT_PORT_GAP`].
    pub fn with_default_gap(target_port_min: u16, target_port_max: u16) -> Result<Self, PortPoolError> {
        Self::new(target_port_min, target_port_max, DEFAULT_PORT_GAP)
    }

    /// Populate the pool with every port of the configured range.
    ///
    /// Calling this again resets the pool to the full range: the available
    /// set is cleared first, so repeated calls never duplicate entries.
    /// Ports leased before the reset are considered available again.
    pub fn init_resource(&self) {
        self.clear();

        for port in self.range_ports() {
            self.offer(port);
        }

        info!(
            "Port resource pool ready (port range: {} - {}, gap={}, ports={})",
            self.target_port_min,
            self.target_port_max,
            self.port_gap,
            self.available.len()
        );
    }

    /// Empty the pool. Used at shutdown.
    pub fn release_resource(&self) {
        self.clear();
        info!(
            "Port resource pool released (port range: {} - {}, gap={})",
            self.target_port_min, self.target_port_max, self.port_gap
        );
    }

    /// Lease one port in pool order.
    ///
    /// Returns `None` when no port is available. Never blocks.
    pub fn take_port(&self) -> Option<u16> {
        while let Ok(port) = self.queue_rx.try_recv() {
            if self.available.remove(&port).is_some() {
                debug!("Leased port {} ({} left)", port, self.available.len());
                return Some(port);
            }
        }

        warn!("Port resource pool is empty");
        None
    }

    /// Return a leased port to the pool.
    ///
    /// Returns `true` if the port was added back, `false` if it was already
    /// available or lies outside the configured range.
    pub fn restore_port(&self, port: u16) -> bool {
        if !self.in_range(port) {
            warn!(
                "Refusing to restore port {} outside of range {} - {}",
                port, self.target_port_min, self.target_port_max
            );
            return false;
        }

        let restored = self.offer(port);
        if restored {
            debug!("Restored port {}", port);
        }
        restored
    }

    /// Permanently discard a port, whether or not it is currently available.
    ///
    /// Returns `true` if the port was available and got removed.
    pub fn remove_port(&self, port: u16) -> bool {
        let removed = self.available.remove(&port).is_some();
        if removed {
            debug!("Removed port {} from the pool", port);
        } else {
            debug!("Port {} discarded while leased", port);
        }
        removed
    }

    /// Number of ports currently available.
    pub fn available_count(&self) -> usize {
        self.available.len()
    }

    /// Whether no port is currently available.
    pub fn is_empty(&self) -> bool {
        self.available.is_empty()
    }

    /// Whether `port` is currently available.
    pub fn contains(&self, port: u16) -> bool {
        self.available.contains(&port)
    }

    /// Number of ports a freshly initialised pool holds.
    pub fn capacity(&self) -> usize {
        let span = u32::from(self.target_port_max - self.target_port_min);
        (span / u32::from(self.port_gap)) as usize + 1
    }

    pub fn port_range(&self) -> (u16, u16) {
        (self.target_port_min, self.target_port_max)
    }

    pub fn port_gap(&self) -> u16 {
        self.port_gap
    }

    fn range_ports(&self) -> impl Iterator<Item = u16> {
        (u32::from(self.target_port_min)..=u32::from(self.target_port_max))
            .step_by(usize::from(self.port_gap))
            .map(|port| port as u16)
    }

    fn in_range(&self, port: u16) -> bool {
        port >= self.target_port_min && port <= self.target_port_max
    }

    /// Insert into the membership set and enqueue only when newly inserted.
    fn offer(&self, port: u16) -> bool {
        if self.available.insert(port) {
            // Unbounded and we hold the receiver, so send cannot fail.
            let _ = self.queue_tx.send(port);
            true
        } else {
            false
        }
    }

    /// Drain the queue before clearing the set. A port restored in between
    /// then leaves at worst a stale queue entry, never a member with no
    /// queue entry.
    fn clear(&self) {
        self.drain_queue();
        self.available.clear();
    }

    fn drain_queue(&self) {
        while self.queue_rx.try_recv().is_ok() {}
    }
}

impl std::fmt::Debug for PortPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortPool")
            .field("target_port_min", &self.target_port_min)
            .field("target_port_max", &self.target_port_max)
            .field("port_gap", &self.port_gap)
            .field("available", &self.available.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use proptest::prelude::*;
    use rstest::rstest;

    use super::*;

    fn ready_pool(min: u16, max: u16, gap: u16) -> PortPool {
        let pool = PortPool::new(min, max, gap).unwrap();
        pool.init_resource();
        pool
    }

    #[rstest]
    #[case(5000, 5000, 2, 1)]
    #[case(5000, 5001, 2, 1)]
    #[case(5000, 5002, 2, 2)]
    #[case(5000, 5010, 2, 6)]
    #[case(5000, 5009, 3, 4)]
    #[case(65530, 65535, 1, 6)]
    fn test_init_resource_count(
        #[case] min: u16,
        #[case] max: u16,
        #[case] gap: u16,
        #[case] expected: usize,
    ) {
        let pool = ready_pool(min, max, gap);
        assert_eq!(pool.available_count(), expected);
        assert_eq!(pool.capacity(), expected);
    }

    fn drain(pool: &PortPool) -> Vec<u16> {
        std::iter::from_fn(|| pool.take_port()).collect()
    }

    #[test]
    fn test_restore_during_clear_stays_leasable() {
        let pool = ready_pool(5000, 5010, 2);
        let leased = pool.take_port().unwrap();

        // Restore lands between the two steps of a clear
        pool.drain_queue();
        assert!(pool.restore_port(leased));
        pool.available.clear();

        pool.init_resource();
        assert!(pool.contains(leased));

        let mut ports = drain(&pool);
        ports.sort_unstable();
        assert_eq!(ports, vec![5000, 5002, 5004, 5006, 5008, 5010]);
        assert!(pool.is_empty());
    }

    #[test]
    fn test_every_member_is_leasable_after_reinit() {
        let pool = ready_pool(5000, 5010, 2);
        let a = pool.take_port().unwrap();
        let b = pool.take_port().unwrap();
        pool.restore_port(a);
        pool.init_resource();
        pool.restore_port(b);

        assert_eq!(drain(&pool).len(), pool.capacity());
        assert_eq!(pool.available_count(), 0);
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        assert!(matches!(PortPool::new(5000, 6000, 0), Err(PortPoolError::ZeroGap)));
        assert!(matches!(
            PortPool::new(6000, 5000, 2),
            Err(PortPoolError::InvalidRange { min: 6000, max: 5000 })
        ));
    }

    #[test]
    fn test_empty_until_initialised() {
        let pool = PortPool::with_default_gap(5000, 5010).unwrap();
        assert!(pool.is_empty());
        assert_eq!(pool.take_port(), None);
    }

    #[test]
    fn test_take_port_is_fifo() {
        let pool = ready_pool(5000, 5006, 2);
        assert_eq!(pool.take_port(), Some(5000));
        assert_eq!(pool.take_port(), Some(5002));
        assert_eq!(pool.take_port(), Some(5004));
        assert_eq!(pool.take_port(), Some(5006));
        assert_eq!(pool.take_port(), None);
    }

    #[test]
    fn test_restore_is_idempotent() {
        let pool = ready_pool(5000, 5010, 2);
        let before = pool.available_count();

        let port = pool.take_port().unwrap();
        assert_eq!(pool.available_count(), before - 1);
        assert!(!pool.contains(port));

        assert!(pool.restore_port(port));
        assert_eq!(pool.available_count(), before);

        // Second restore must not grow the pool.
        assert!(!pool.restore_port(port));
        assert_eq!(pool.available_count(), before);

        // Draining hands every port out exactly once.
        let mut seen = HashSet::new();
        while let Some(p) = pool.take_port() {
            assert!(seen.insert(p), "port {} leased twice", p);
        }
        assert_eq!(seen.len(), before);
    }

    #[test]
    fn test_restore_rejects_out_of_range() {
        let pool = ready_pool(5000, 5010, 2);
        assert!(!pool.restore_port(4000));
        assert!(!pool.restore_port(6000));
        assert_eq!(pool.available_count(), 6);
    }

    #[test]
    fn test_remove_port_available_and_leased() {
        let pool = ready_pool(5000, 5006, 2);

        // Removing an available port
        assert!(pool.remove_port(5002));
        assert!(!pool.contains(5002));
        assert_eq!(pool.available_count(), 3);

        // Removing a leased port is a no-op on the available set
        let leased = pool.take_port().unwrap();
        assert_eq!(leased, 5000);
        assert!(!pool.remove_port(leased));
        assert_eq!(pool.available_count(), 2);

        // The stale queue entry for 5002 is skipped
        assert_eq!(pool.take_port(), Some(5004));
        assert_eq!(pool.take_port(), Some(5006));
        assert_eq!(pool.take_port(), None);
    }

    #[test]
    fn test_removed_port_can_be_restored_once() {
        let pool = ready_pool(5000, 5002, 2);
        assert!(pool.remove_port(5000));
        assert!(pool.restore_port(5000));
        assert!(!pool.restore_port(5000));

        let mut leased = Vec::new();
        while let Some(p) = pool.take_port() {
            leased.push(p);
        }
        leased.sort_unstable();
        assert_eq!(leased, vec![5000, 5002]);
    }

    #[test]
    fn test_init_resource_twice_does_not_duplicate() {
        let pool = ready_pool(5000, 5010, 2);
        pool.take_port();
        pool.init_resource();
        assert_eq!(pool.available_count(), 6);

        let mut count = 0;
        while pool.take_port().is_some() {
            count += 1;
        }
        assert_eq!(count, 6);
    }

    #[test]
    fn test_release_resource_empties_pool() {
        let pool = ready_pool(5000, 5010, 2);
        pool.release_resource();
        assert!(pool.is_empty());
        assert_eq!(pool.take_port(), None);
    }

    #[test]
    fn test_concurrent_take_restore_never_double_leases() {
        let pool = Arc::new(ready_pool(20000, 20062, 2));
        let total = pool.available_count();
        let leased: Arc<DashSet<u16>> = Arc::new(DashSet::new());
        let takes = Arc::new(AtomicUsize::new(0));

        std::thread::scope(|scope| {
            for _ in 0..8 {
                let pool = Arc::clone(&pool);
                let leased = Arc::clone(&leased);
                let takes = Arc::clone(&takes);
                scope.spawn(move || {
                    for _ in 0..2_000 {
                        if let Some(port) = pool.take_port() {
                            assert!(leased.insert(port), "port {} leased twice", port);
                            takes.fetch_add(1, Ordering::Relaxed);
                            std::thread::yield_now();
                            assert!(leased.remove(&port).is_some());
                            pool.restore_port(port);
                        }
                    }
                });
            }
        });

        assert!(takes.load(Ordering::Relaxed) > 0);
        assert_eq!(pool.available_count(), total);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(100))]

        #[test]
        fn prop_range_yields_expected_count(
            min in 1024u16..60000,
            span in 0u16..512,
            gap in 1u16..8,
        ) {
            let max = min.saturating_add(span);
            let pool = ready_pool(min, max, gap);
            let expected = usize::from((max - min) / gap) + 1;
            prop_assert_eq!(pool.available_count(), expected);

            for n in 1..=expected {
                prop_assert!(pool.take_port().is_some(), "take #{} returned none", n);
            }
            prop_assert_eq!(pool.take_port(), None);
        }
    }
}
