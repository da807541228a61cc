//! The local view of silo statuses and the listeners that watch it.
//!
//! Writers (the oracle) serialize through one mutex and notify listeners
//! while still holding it, so listeners observe changes in the order they
//! were applied. Readers never take the mutex: they load an immutable
//! snapshot that is republished after every change.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::{MembershipEntry, Result, SiloAddress, SiloStatus};

/// Receives silo status changes.
///
/// Called synchronously while the status table is locked: implementations
/// must not call back into the oracle's write path.
pub trait SiloStatusListener: Send + Sync {
    fn silo_status_change_notification(&self, silo: &SiloAddress, status: SiloStatus) -> Result<()>;
}

/// Immutable snapshot served to readers.
#[derive(Debug, Default)]
struct StatusSnapshot {
    /// Every known silo including this one.
    all: HashMap<SiloAddress, SiloStatus>,
    /// Active silos including this one (if Active).
    active: HashMap<SiloAddress, SiloStatus>,
    names: HashMap<SiloAddress, String>,
}

#[derive(Debug)]
struct Inner {
    /// Entries of other silos. This silo is tracked by `my_status` only.
    local_table: HashMap<SiloAddress, MembershipEntry>,
    my_status: SiloStatus,
}

/// This silo's view of the cluster.
pub struct MembershipOracleData {
    my_address: SiloAddress,
    my_name: String,
    inner: Mutex<Inner>,
    snapshot: ArcSwap<StatusSnapshot>,
    listeners: ArcSwap<Vec<Arc<dyn SiloStatusListener>>>,
}

impl MembershipOracleData {
    pub fn new(my_address: SiloAddress, my_name: impl Into<String>) -> Self {
        let data = Self {
            my_address,
            my_name: my_name.into(),
            inner: Mutex::new(Inner {
                local_table: HashMap::new(),
                my_status: SiloStatus::Created,
            }),
            snapshot: ArcSwap::from_pointee(StatusSnapshot::default()),
            listeners: ArcSwap::from_pointee(Vec::new()),
        };
        data.publish(&data.inner.lock());
        data
    }

    pub fn my_address(&self) -> SiloAddress {
        self.my_address
    }

    pub fn my_status(&self) -> SiloStatus {
        self.inner.lock().my_status
    }

    /// Registers a listener. Returns false if it was already registered.
    pub fn subscribe(&self, listener: Arc<dyn SiloStatusListener>) -> bool {
        let mut added = false;
        self.listeners.rcu(|current| {
            if current.iter().any(|l| Arc::ptr_eq(l, &listener)) {
                added = false;
                return Arc::clone(current);
            }
            added = true;
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&listener));
            Arc::new(next)
        });
        added
    }

    /// Removes a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, listener: &Arc<dyn SiloStatusListener>) -> bool {
        let mut removed = false;
        self.listeners.rcu(|current| {
            let next: Vec<_> = current
                .iter()
                .filter(|l| !Arc::ptr_eq(l, listener))
                .cloned()
                .collect();
            removed = next.len() != current.len();
            Arc::new(next)
        });
        removed
    }

    /// Applies a status change for another silo. Returns true if the local
    /// view changed (and listeners must be told).
    ///
    /// A Dead status for a silo never seen before is ignored: a silo that
    /// died before we learned about it matters to nobody.
    pub fn try_update_status(&self, entry: &MembershipEntry) -> bool {
        let mut inner = self.inner.lock();
        self.apply_locked(&mut inner, entry)
    }

    /// Like [`try_update_status`](Self::try_update_status), and notifies
    /// listeners if the view changed.
    pub fn try_update_status_and_notify(&self, entry: &MembershipEntry) -> bool {
        let mut inner = self.inner.lock();
        if !self.apply_locked(&mut inner, entry) {
            return false;
        }
        self.notify(&entry.silo_address, entry.status);
        true
    }

    fn apply_locked(&self, inner: &mut Inner, entry: &MembershipEntry) -> bool {
        let silo = entry.silo_address;
        if silo == self.my_address {
            return false;
        }
        match inner.local_table.get_mut(&silo) {
            None => {
                if entry.status == SiloStatus::Dead {
                    return false;
                }
                inner.local_table.insert(silo, entry.clone());
            }
            Some(current) => {
                if current.status == entry.status {
                    // keep the freshest vote list for the probe-list computation
                    current.suspect_times = entry.suspect_times.clone();
                    return false;
                }
                *current = entry.clone();
            }
        }
        info!("silo {} is now {}", silo, entry.status);
        self.publish(inner);
        true
    }

    /// Changes this silo's own status and notifies listeners. No-op if the
    /// status is unchanged.
    pub fn update_my_status_local(&self, status: SiloStatus) {
        let mut inner = self.inner.lock();
        if inner.my_status == status {
            return;
        }
        debug!("my status {} -> {}", inner.my_status, status);
        inner.my_status = status;
        self.publish(&inner);
        self.notify(&self.my_address, status);
    }

    /// Latest known status of a silo, or `None` if it has never been seen.
    pub fn approximate_status(&self, silo: &SiloAddress) -> Option<SiloStatus> {
        self.snapshot.load().all.get(silo).copied()
    }

    /// Statuses of all known silos, or only the Active ones. Includes this
    /// silo.
    pub fn approximate_statuses(&self, only_active: bool) -> HashMap<SiloAddress, SiloStatus> {
        let snapshot = self.snapshot.load();
        if only_active {
            snapshot.active.clone()
        } else {
            snapshot.all.clone()
        }
    }

    pub fn approximate_silo_name(&self, silo: &SiloAddress) -> Option<String> {
        self.snapshot.load().names.get(silo).cloned()
    }

    /// Number of Active silos in the local view, this silo included.
    pub fn active_silo_count(&self) -> usize {
        self.snapshot.load().active.len()
    }

    /// The locally cached table entry of another silo.
    pub fn local_entry(&self, silo: &SiloAddress) -> Option<MembershipEntry> {
        self.inner.lock().local_table.get(silo).cloned()
    }

    /// Rebuilds the reader snapshot. Called with the write lock held.
    fn publish(&self, inner: &Inner) {
        let mut snapshot = StatusSnapshot::default();
        for (silo, entry) in &inner.local_table {
            snapshot.all.insert(*silo, entry.status);
            if entry.status == SiloStatus::Active {
                snapshot.active.insert(*silo, entry.status);
            }
            snapshot.names.insert(*silo, entry.silo_name.clone());
        }
        snapshot.all.insert(self.my_address, inner.my_status);
        if inner.my_status == SiloStatus::Active {
            snapshot.active.insert(self.my_address, inner.my_status);
        }
        snapshot.names.insert(self.my_address, self.my_name.clone());
        self.snapshot.store(Arc::new(snapshot));
    }

    /// Delivers a change to every listener. A failing or panicking listener
    /// is logged and does not affect the others.
    fn notify(&self, silo: &SiloAddress, status: SiloStatus) {
        let listeners = self.listeners.load();
        for listener in listeners.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                listener.silo_status_change_notification(silo, status)
            }));
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("status listener failed on {silo} -> {status}: {e}"),
                Err(_) => error!("status listener panicked on {silo} -> {status}"),
            }
        }
    }
}
