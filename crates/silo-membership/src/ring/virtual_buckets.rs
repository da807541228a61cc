use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, info};

use super::{first_at_or_after, ranges_of, RangeListeners, RingProvider, RingRange, RingRangeListener, SingleRange};
use crate::oracle_data::SiloStatusListener;
use crate::{MembershipError, Result, SiloAddress, SiloStatus};

struct State {
    members: BTreeSet<SiloAddress>,
    my_range: RingRange,
}

/// A ring with `num_buckets_per_silo` points per silo.
///
/// Bucket positions come from [`SiloAddress::uniform_hash_codes`]. When two
/// silos land on the same position the lesser address keeps it, so every
/// silo derives the same ring from the same member set. The ring is rebuilt
/// from the member set on each change, which also hands a removed silo's
/// contested positions back to the other claimant.
pub struct VirtualBucketsRingProvider {
    me: SiloAddress,
    num_buckets_per_silo: usize,
    state: Mutex<State>,
    /// Sorted `(bucket hash, owner)` points.
    points: ArcSwap<Vec<(u32, SiloAddress)>>,
    listeners: RangeListeners,
}

impl VirtualBucketsRingProvider {
    pub fn new(me: SiloAddress, num_buckets_per_silo: usize) -> Result<Self> {
        if num_buckets_per_silo == 0 {
            return Err(MembershipError::Configuration(
                "num_buckets_per_silo must be > 0".into(),
            ));
        }
        let members = BTreeSet::from([me]);
        let points = build_points(&members, num_buckets_per_silo);
        let my_range = calculate_range(&points, &me);
        info!("virtual bucket ring provider for {me}, {num_buckets_per_silo} buckets per silo");
        Ok(Self {
            me,
            num_buckets_per_silo,
            state: Mutex::new(State { members, my_range }),
            points: ArcSwap::from_pointee(points),
            listeners: RangeListeners::default(),
        })
    }

    /// Every silo's range in the local view.
    pub fn get_ranges(&self) -> Vec<(SiloAddress, RingRange)> {
        ranges_of(&self.points.load())
    }

    pub fn range_percentage(&self) -> f64 {
        self.state.lock().my_range.percentage()
    }

    pub fn add_server(&self, silo: SiloAddress) {
        self.apply(|members| members.insert(silo));
    }

    pub fn remove_server(&self, silo: &SiloAddress) {
        self.apply(|members| members.remove(silo));
    }

    fn apply(&self, change: impl FnOnce(&mut BTreeSet<SiloAddress>) -> bool) {
        let mut state = self.state.lock();
        if !change(&mut state.members) {
            return;
        }
        let points = build_points(&state.members, self.num_buckets_per_silo);
        let new = calculate_range(&points, &self.me);
        let old = std::mem::replace(&mut state.my_range, new.clone());
        debug!(
            "ring now has {} silos, {} buckets, my range {} -> {}",
            state.members.len(),
            points.len(),
            old,
            new
        );
        self.points.store(Arc::new(points));
        // this provider does not track growth
        self.listeners.notify(&old, &new, true);
    }
}

/// Flattens the member set into sorted ring points.
fn build_points(members: &BTreeSet<SiloAddress>, buckets: usize) -> Vec<(u32, SiloAddress)> {
    place_buckets(members.iter().map(|silo| (*silo, silo.uniform_hash_codes(buckets))))
}

/// Places each silo's bucket hashes on the ring. A position claimed by
/// several silos goes to the least of them.
fn place_buckets(claims: impl IntoIterator<Item = (SiloAddress, Vec<u32>)>) -> Vec<(u32, SiloAddress)> {
    let mut ring: BTreeMap<u32, SiloAddress> = BTreeMap::new();
    for (silo, hashes) in claims {
        for hash in hashes {
            ring.entry(hash)
                .and_modify(|owner| {
                    if silo < *owner {
                        *owner = silo;
                    }
                })
                .or_insert(silo);
        }
    }
    ring.into_iter().collect()
}

/// This silo's arcs: every `(previous point, my point]`.
fn calculate_range(points: &[(u32, SiloAddress)], me: &SiloAddress) -> RingRange {
    let mut segments = Vec::new();
    for (i, (hash, owner)) in points.iter().enumerate() {
        if owner != me {
            continue;
        }
        let prev = if i == 0 { points[points.len() - 1].0 } else { points[i - 1].0 };
        segments.push(SingleRange::new(prev, *hash));
    }
    RingRange::from_segments(segments)
}

impl RingProvider for VirtualBucketsRingProvider {
    fn my_range(&self) -> RingRange {
        self.state.lock().my_range.clone()
    }

    fn primary_target_silo(&self, key: u32) -> Option<SiloAddress> {
        first_at_or_after(&self.points.load(), key, |_| true)
    }

    fn subscribe(&self, listener: Arc<dyn RingRangeListener>) -> bool {
        self.listeners.subscribe(listener)
    }

    fn unsubscribe(&self, listener: &Arc<dyn RingRangeListener>) -> bool {
        self.listeners.unsubscribe(listener)
    }

    fn ring_size(&self) -> usize {
        self.state.lock().members.len()
    }
}

impl SiloStatusListener for VirtualBucketsRingProvider {
    fn silo_status_change_notification(&self, silo: &SiloAddress, status: SiloStatus) -> Result<()> {
        // a terminating silo, this one included, leaves the ring
        if status.is_terminating() {
            self.remove_server(silo);
        } else if status == SiloStatus::Active && *silo != self.me {
            self.add_server(*silo);
        }
        Ok(())
    }
}
