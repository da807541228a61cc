//! In-process membership table.
//!
//! All rows and the version live behind one mutex, so every conditional
//! write checks and applies the row change and the version bump in a single
//! critical section. Share one instance through an `Arc` to run several
//! oracles against the same table in one process.

use std::collections::BTreeMap;
use std::time::SystemTime;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{new_etag, MembershipTable};
use crate::{
    MembershipEntry, MembershipError, MembershipTableData, Result, SiloAddress, SiloStatus,
    TableVersion,
};

#[derive(Debug, Default)]
struct TableState {
    rows: BTreeMap<SiloAddress, (MembershipEntry, String)>,
    /// `None` until initialized, and again after the deployment is deleted.
    version: Option<TableVersion>,
}

impl TableState {
    fn version(&self) -> Result<&TableVersion> {
        self.version
            .as_ref()
            .ok_or_else(|| MembershipError::table("membership table is not initialized"))
    }

    /// True if `proposed` is the direct successor of the stored version.
    fn accepts(&self, proposed: &TableVersion) -> Result<bool> {
        let stored = self.version()?;
        Ok(proposed.version == stored.version + 1 && proposed.etag == stored.etag)
    }

    fn install(&mut self, proposed: &TableVersion) {
        self.version = Some(TableVersion::new(proposed.version, new_etag()));
    }

    fn snapshot(&self, filter: impl Fn(&SiloAddress) -> bool) -> Result<MembershipTableData> {
        let members = self
            .rows
            .iter()
            .filter(|(silo, _)| filter(silo))
            .map(|(_, row)| row.clone())
            .collect();
        Ok(MembershipTableData::new(members, self.version()?.clone()))
    }
}

/// Reference table backend held entirely in memory.
#[derive(Debug)]
pub struct InMemoryMembershipTable {
    deployment_id: String,
    state: Mutex<TableState>,
}

impl InMemoryMembershipTable {
    /// Creates an initialized, empty table at version 0.
    pub fn new(deployment_id: impl Into<String>) -> Self {
        let state = TableState {
            rows: BTreeMap::new(),
            version: Some(TableVersion::new(0, new_etag())),
        };
        Self {
            deployment_id: deployment_id.into(),
            state: Mutex::new(state),
        }
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }
}

#[async_trait]
impl MembershipTable for InMemoryMembershipTable {
    async fn initialize(&self, try_init_table_version: bool) -> Result<()> {
        let mut state = self.state.lock();
        if state.version.is_none() && try_init_table_version {
            state.version = Some(TableVersion::new(0, new_etag()));
        }
        Ok(())
    }

    async fn delete_membership_table_entries(&self, deployment_id: &str) -> Result<()> {
        if deployment_id != self.deployment_id {
            return Ok(());
        }
        let mut state = self.state.lock();
        state.rows.clear();
        state.version = None;
        Ok(())
    }

    async fn read_row(&self, silo: &SiloAddress) -> Result<MembershipTableData> {
        self.state.lock().snapshot(|s| s == silo)
    }

    async fn read_all(&self) -> Result<MembershipTableData> {
        self.state.lock().snapshot(|_| true)
    }

    async fn insert_row(&self, entry: &MembershipEntry, table_version: &TableVersion) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.accepts(table_version)? || state.rows.contains_key(&entry.silo_address) {
            debug!(
                "insert of {} rejected at version {}",
                entry.silo_address, table_version
            );
            return Ok(false);
        }
        state
            .rows
            .insert(entry.silo_address, (entry.clone(), new_etag()));
        state.install(table_version);
        Ok(true)
    }

    async fn update_row(
        &self,
        entry: &MembershipEntry,
        etag: &str,
        table_version: &TableVersion,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.accepts(table_version)? {
            return Ok(false);
        }
        match state.rows.get_mut(&entry.silo_address) {
            Some(row) if row.1 == etag => {
                *row = (entry.clone(), new_etag());
            }
            _ => {
                debug!("update of {} rejected: etag mismatch", entry.silo_address);
                return Ok(false);
            }
        }
        state.install(table_version);
        Ok(true)
    }

    async fn update_i_am_alive(&self, entry: &MembershipEntry) -> Result<()> {
        let mut state = self.state.lock();
        if let Some((stored, _)) = state.rows.get_mut(&entry.silo_address) {
            stored.i_am_alive_time = entry.i_am_alive_time;
        }
        Ok(())
    }

    async fn cleanup_defunct_silo_entries(&self, before: SystemTime) -> Result<()> {
        let mut state = self.state.lock();
        state
            .rows
            .retain(|_, (entry, _)| entry.status != SiloStatus::Dead || entry.last_alive() >= before);
        Ok(())
    }
}
