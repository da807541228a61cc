use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{first_at_or_after, ranges_of, RangeListeners, RingProvider, RingRange, RingRangeListener, SingleRange};
use crate::oracle_data::SiloStatusListener;
use crate::{Result, SiloAddress, SiloStatus};

#[derive(Debug, Clone)]
struct Snapshot {
    /// `(consistent_hash, silo)`, sorted.
    points: Vec<(u32, SiloAddress)>,
    running: bool,
    my_range: RingRange,
}

/// A ring with one point per silo at its consistent hash.
///
/// When this silo starts terminating it stays on the ring (peers may still
/// route to it until they observe the change) but no longer owns a range
/// and is never returned as a target locally.
pub struct ConsistentRingProvider {
    me: SiloAddress,
    /// Serializes membership changes and their notifications.
    write: Mutex<()>,
    snapshot: ArcSwap<Snapshot>,
    listeners: RangeListeners,
}

impl ConsistentRingProvider {
    pub fn new(me: SiloAddress) -> Self {
        let snapshot = Snapshot {
            points: vec![(me.consistent_hash(), me)],
            running: true,
            my_range: RingRange::full(),
        };
        info!("consistent ring provider for {me}, hash 0x{:08x}", me.consistent_hash());
        Self {
            me,
            write: Mutex::new(()),
            snapshot: ArcSwap::from_pointee(snapshot),
            listeners: RangeListeners::default(),
        }
    }

    /// Every silo's range in the local view.
    pub fn get_ranges(&self) -> Vec<(SiloAddress, RingRange)> {
        ranges_of(&self.snapshot.load().points)
    }

    pub fn range_percentage(&self) -> f64 {
        self.snapshot.load().my_range.percentage()
    }

    pub fn add_server(&self, silo: SiloAddress) {
        self.apply(|snap| {
            if snap.points.iter().any(|(_, s)| *s == silo) {
                return false;
            }
            snap.points.push((silo.consistent_hash(), silo));
            snap.points.sort();
            true
        });
    }

    pub fn remove_server(&self, silo: &SiloAddress) {
        self.apply(|snap| {
            let before = snap.points.len();
            snap.points.retain(|(_, s)| s != silo);
            snap.points.len() != before
        });
    }

    fn stop_running(&self) {
        self.apply(|snap| std::mem::replace(&mut snap.running, false));
    }

    /// Mutates a copy of the snapshot; if `change` reports a change, the
    /// range is recomputed, the copy published and listeners notified.
    fn apply(&self, change: impl FnOnce(&mut Snapshot) -> bool) {
        let _write = self.write.lock();
        let current = self.snapshot.load_full();
        let mut next = Snapshot::clone(&current);
        if !change(&mut next) {
            return;
        }
        next.my_range = self.calculate_range(&next);
        let old = current.my_range.clone();
        let new = next.my_range.clone();
        debug!(
            "ring now has {} silos, my range {} -> {}",
            next.points.len(),
            old,
            new
        );
        self.snapshot.store(Arc::new(next));
        self.listeners.notify(&old, &new, new.size() > old.size());
    }

    fn calculate_range(&self, snap: &Snapshot) -> RingRange {
        if !snap.running {
            return RingRange::Empty;
        }
        let Some(index) = snap.points.iter().position(|(_, s)| *s == self.me) else {
            return RingRange::Empty;
        };
        let my_hash = snap.points[index].0;
        let prev = if index == 0 {
            snap.points[snap.points.len() - 1].0
        } else {
            snap.points[index - 1].0
        };
        if prev == my_hash && snap.points.len() > 1 {
            return RingRange::Empty;
        }
        RingRange::Single(SingleRange::new(prev, my_hash))
    }
}

impl RingProvider for ConsistentRingProvider {
    fn my_range(&self) -> RingRange {
        self.snapshot.load().my_range.clone()
    }

    fn primary_target_silo(&self, key: u32) -> Option<SiloAddress> {
        let snap = self.snapshot.load();
        first_at_or_after(&snap.points, key, |silo| snap.running || *silo != self.me)
    }

    fn subscribe(&self, listener: Arc<dyn RingRangeListener>) -> bool {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, listener: &Arc<dyn RingRangeListener>) -> bool {
        self.listeners.unsubscribe(listener)
    }

    fn ring_size(&self) -> usize {
        self.snapshot.load().points.len()
    }
}

impl SiloStatusListener for ConsistentRingProvider {
    fn silo_status_change_notification(&self, silo: &SiloAddress, status: SiloStatus) -> Result<()> {
        if *silo == self.me {
            if status.is_terminating() {
                self.stop_running();
            }
        } else if status.is_terminating() {
            self.remove_server(silo);
        } else if status == SiloStatus::Active {
            self.add_server(*silo);
        }
        Ok(())
    }
}
