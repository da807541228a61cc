//! The membership table contract and its backends.
//!
//! A table is a durable, versioned store of [`MembershipEntry`] rows.
//! Inserts and updates are conditional: they carry the table version the
//! writer expects to install (`read.version.next()`) and, for updates, the
//! row etag the writer read. A mismatch on either returns `Ok(false)`; only
//! storage and transport failures are errors. Every successful write also
//! installs the new table version, atomically with the row change.
//!
//! Backends:
//!
//! - [`InMemoryMembershipTable`]: reference implementation, one process.
//! - [`RowMembershipTable`]: stores the flat row form with a version row,
//!   optionally persisted to a JSON file.
//! - [`RemoteMembershipTable`]: client for a table hosted by another silo
//!   through [`TableService`].

mod memory;
mod remote;
mod rows;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::{MembershipEntry, MembershipTableData, Result, SiloAddress, SiloStatus, TableVersion};

pub use memory::InMemoryMembershipTable;
pub use remote::{RemoteMembershipTable, TableService};
pub use rows::RowMembershipTable;

/// Async interface implemented by membership table backends.
#[async_trait]
pub trait MembershipTable: Send + Sync {
    /// Prepares the store. When `try_init_table_version` is set and the
    /// deployment has no version yet, writes the initial version (0).
    async fn initialize(&self, try_init_table_version: bool) -> Result<()>;

    /// Removes every row of the deployment, version row included.
    async fn delete_membership_table_entries(&self, deployment_id: &str) -> Result<()>;

    /// Reads one silo's row (if present) together with the table version.
    async fn read_row(&self, silo: &SiloAddress) -> Result<MembershipTableData>;

    /// Reads every row together with the table version.
    async fn read_all(&self) -> Result<MembershipTableData>;

    /// Inserts a new row if no row exists for the silo and `table_version`
    /// is the successor of the stored version.
    async fn insert_row(&self, entry: &MembershipEntry, table_version: &TableVersion) -> Result<bool>;

    /// Replaces a row if its etag is still `etag` and `table_version` is the
    /// successor of the stored version.
    async fn update_row(
        &self,
        entry: &MembershipEntry,
        etag: &str,
        table_version: &TableVersion,
    ) -> Result<bool>;

    /// Merges `entry.i_am_alive_time` into the silo's row. Unconditional:
    /// no etag check and no table version change.
    async fn update_i_am_alive(&self, entry: &MembershipEntry) -> Result<()>;

    /// Deletes rows of Dead silos whose last sign of life is older than
    /// `before`. Rows in any other status are kept.
    async fn cleanup_defunct_silo_entries(&self, before: SystemTime) -> Result<()>;

    /// Client gateway endpoints: Active silos with a non-zero proxy port.
    async fn gateways(&self) -> Result<Vec<SocketAddr>> {
        let data = self.read_all().await?;
        Ok(data
            .entries()
            .filter(|e| e.status == SiloStatus::Active && e.proxy_port != 0)
            .map(|e| SocketAddr::new(e.silo_address.endpoint().ip(), e.proxy_port))
            .collect())
    }
}

/// Shared trait-object handle to a table backend.
pub type DynMembershipTable = Arc<dyn MembershipTable>;

/// Fresh opaque etag for a row or version.
pub(crate) fn new_etag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Test suite every backend must pass. Each backend's test module calls
/// these against a freshly initialized, empty table.
#[cfg(test)]
pub(crate) mod contract {
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::{Duration, UNIX_EPOCH};

    use super::*;

    pub fn silo(port: u16, generation: i32) -> SiloAddress {
        SiloAddress::new(SocketAddr::from(([127, 0, 0, 1], port)), generation)
    }

    pub fn entry(port: u16, status: SiloStatus) -> MembershipEntry {
        let mut e = MembershipEntry::new(
            silo(port, 1),
            format!("silo-{port}"),
            "host",
            status,
            UNIX_EPOCH + Duration::from_secs(1_700_000_000),
        );
        e.proxy_port = port + 1000;
        e
    }

    pub async fn empty_table_has_version_zero(table: &dyn MembershipTable) {
        let data = table.read_all().await.unwrap();
        assert!(data.members.is_empty());
        assert_eq!(data.version.version, 0);
        assert!(!data.version.etag.is_empty());
    }

    /// A write succeeds iff the etag and the version both match, and each
    /// success advances the version by exactly one.
    pub async fn conditional_writes(table: &dyn MembershipTable) {
        let data = table.read_all().await.unwrap();
        let first = entry(100, SiloStatus::Joining);

        // stale version: not the successor
        assert!(!table.insert_row(&first, &data.version).await.unwrap());
        let skipped = data.version.next().next();
        assert!(!table.insert_row(&first, &skipped).await.unwrap());
        // wrong version etag
        let wrong_etag = TableVersion::new(data.version.version + 1, "bogus");
        assert!(!table.insert_row(&first, &wrong_etag).await.unwrap());

        assert!(table.insert_row(&first, &data.version.next()).await.unwrap());
        let after_insert = table.read_all().await.unwrap();
        assert_eq!(after_insert.version.version, data.version.version + 1);
        assert_ne!(after_insert.version.etag, data.version.etag);

        // same version again loses
        assert!(!table.insert_row(&entry(101, SiloStatus::Joining), &data.version.next()).await.unwrap());
        // duplicate row loses even with the right version
        assert!(!table.insert_row(&first, &after_insert.version.next()).await.unwrap());

        let (_, etag) = after_insert.get(&first.silo_address).cloned().unwrap();
        let mut updated = first.clone();
        updated.status = SiloStatus::Active;

        // right etag, stale version
        assert!(!table.update_row(&updated, &etag, &after_insert.version).await.unwrap());
        // wrong etag, right version
        assert!(!table.update_row(&updated, "bogus", &after_insert.version.next()).await.unwrap());

        assert!(table.update_row(&updated, &etag, &after_insert.version.next()).await.unwrap());
        let after_update = table.read_all().await.unwrap();
        assert_eq!(after_update.version.version, after_insert.version.version + 1);
        let (stored, new_etag) = after_update.get(&first.silo_address).cloned().unwrap();
        assert_eq!(stored.status, SiloStatus::Active);
        assert_ne!(new_etag, etag);

        // the old etag is spent
        assert!(!table.update_row(&updated, &etag, &after_update.version.next()).await.unwrap());
        // unknown row cannot be updated
        let ghost = entry(999, SiloStatus::Active);
        assert!(!table.update_row(&ghost, &new_etag, &after_update.version.next()).await.unwrap());

        let unchanged = table.read_all().await.unwrap();
        assert_eq!(unchanged.version, after_update.version);
    }

    /// Concurrent inserts with the same expected version: exactly one wins.
    pub async fn racing_inserts_single_winner(table: Arc<dyn MembershipTable>) {
        let data = table.read_all().await.unwrap();
        let next = data.version.next();
        let mut handles = Vec::new();
        for port in 0..10u16 {
            let table = Arc::clone(&table);
            let next = next.clone();
            handles.push(tokio::spawn(async move {
                table
                    .insert_row(&entry(200 + port, SiloStatus::Joining), &next)
                    .await
                    .unwrap_or(false)
            }));
        }
        let mut wins = 0;
        for handle in handles {
            if handle.await.unwrap() {
                wins += 1;
            }
        }
        assert_eq!(wins, 1);
        let after = table.read_all().await.unwrap();
        assert_eq!(after.members.len(), 1);
        assert_eq!(after.version.version, next.version);
    }

    pub async fn read_row_returns_only_that_silo(table: &dyn MembershipTable) {
        let data = table.read_all().await.unwrap();
        let a = entry(300, SiloStatus::Active);
        let b = entry(301, SiloStatus::Active);
        assert!(table.insert_row(&a, &data.version.next()).await.unwrap());
        let v = table.read_all().await.unwrap().version;
        assert!(table.insert_row(&b, &v.next()).await.unwrap());

        let row = table.read_row(&a.silo_address).await.unwrap();
        assert_eq!(row.members.len(), 1);
        assert_eq!(row.members[0].0.silo_address, a.silo_address);
        assert_eq!(row.version.version, v.version + 1);

        let missing = table.read_row(&silo(300, 2)).await.unwrap();
        assert!(missing.members.is_empty());
    }

    pub async fn i_am_alive_is_unconditional(table: &dyn MembershipTable) {
        let data = table.read_all().await.unwrap();
        let e = entry(400, SiloStatus::Active);
        assert!(table.insert_row(&e, &data.version.next()).await.unwrap());
        let before = table.read_all().await.unwrap();
        let (_, etag_before) = before.get(&e.silo_address).cloned().unwrap();

        let heartbeat_time = UNIX_EPOCH + Duration::from_secs(1_700_000_500);
        let mut heartbeat = MembershipEntry::new(
            e.silo_address,
            "",
            "",
            SiloStatus::Created,
            UNIX_EPOCH,
        );
        heartbeat.i_am_alive_time = Some(heartbeat_time);
        table.update_i_am_alive(&heartbeat).await.unwrap();

        let after = table.read_all().await.unwrap();
        assert_eq!(after.version, before.version);
        let (stored, etag_after) = after.get(&e.silo_address).cloned().unwrap();
        assert_eq!(stored.i_am_alive_time, Some(heartbeat_time));
        // only the timestamp is merged
        assert_eq!(stored.status, SiloStatus::Active);
        assert_eq!(stored.silo_name, e.silo_name);
        assert_eq!(etag_after, etag_before);

        // heartbeats for unknown silos are dropped
        let mut ghost = heartbeat.clone();
        ghost.silo_address = silo(401, 1);
        table.update_i_am_alive(&ghost).await.unwrap();
        assert!(!table.read_all().await.unwrap().contains(&silo(401, 1)));
    }

    pub async fn cleanup_and_gateways(table: &dyn MembershipTable) {
        let base = UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        let mut old_dead = entry(500, SiloStatus::Dead);
        old_dead.start_time = base - Duration::from_secs(10 * 86_400);
        let mut old_active = entry(501, SiloStatus::Active);
        old_active.start_time = base - Duration::from_secs(10 * 86_400);
        let recent_dead = entry(502, SiloStatus::Dead);
        let mut no_gateway = entry(503, SiloStatus::Active);
        no_gateway.proxy_port = 0;
        let mut old_joining = entry(504, SiloStatus::Joining);
        old_joining.start_time = base - Duration::from_secs(10 * 86_400);

        for e in [&old_dead, &old_active, &recent_dead, &no_gateway, &old_joining] {
            let v = table.read_all().await.unwrap().version;
            assert!(table.insert_row(e, &v.next()).await.unwrap());
        }

        let mut gateways = table.gateways().await.unwrap();
        gateways.sort();
        assert_eq!(gateways, vec![SocketAddr::from(([127, 0, 0, 1], 1501))]);

        table
            .cleanup_defunct_silo_entries(base - Duration::from_secs(86_400))
            .await
            .unwrap();
        let data = table.read_all().await.unwrap();
        assert_eq!(data.members.len(), 4);
        assert!(!data.contains(&old_dead.silo_address));
        assert!(data.contains(&old_active.silo_address));
        // only Dead rows are defunct, however long a joiner has been silent
        assert!(data.contains(&old_joining.silo_address));
    }

    pub async fn delete_entries_resets_table(table: &dyn MembershipTable, deployment_id: &str) {
        let v = table.read_all().await.unwrap().version;
        assert!(table.insert_row(&entry(600, SiloStatus::Active), &v.next()).await.unwrap());
        table.delete_membership_table_entries(deployment_id).await.unwrap();
        table.initialize(true).await.unwrap();
        let data = table.read_all().await.unwrap();
        assert!(data.members.is_empty());
        assert_eq!(data.version.version, 0);
    }
}
