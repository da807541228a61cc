//! Table backend over the flat row form.
//!
//! Mirrors how an external key-value or table store holds membership: one
//! [`SiloInstanceRow`] per silo plus the deployment's version row, each with
//! its own etag. A conditional write checks the version row's etag and the
//! target row's etag, then replaces both rows together.
//!
//! With a path, the full row set is written as JSON after every mutation.
//! Writes go to a `.tmp` file first and are renamed over the target, so a
//! crash mid-write leaves the previous file intact. A mutation becomes
//! visible only once its file write has succeeded.
//!
//! One file may hold several deployments. Rows are keyed by deployment,
//! and each table instance reads and writes only its own deployment's rows
//! while carrying the others through unchanged. The file has a single
//! writer: the process that opened it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{new_etag, MembershipTable};
use crate::row::{row_key, SiloInstanceRow, TABLE_VERSION_ROW};
use crate::{
    MembershipEntry, MembershipError, MembershipTableData, Result, SiloAddress, SiloStatus,
    TableVersion,
};

/// Rows keyed by `(deployment id, row key)`.
type Rows = BTreeMap<(String, String), SiloInstanceRow>;

/// Membership table stored as rows, optionally persisted to a JSON file.
#[derive(Debug)]
pub struct RowMembershipTable {
    deployment_id: String,
    path: Option<PathBuf>,
    rows: Mutex<Rows>,
}

impl RowMembershipTable {
    /// Creates an empty, uninitialized table kept only in memory.
    pub fn new(deployment_id: impl Into<String>) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            path: None,
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    /// Opens a table persisted at `path`, loading the existing rows of every
    /// deployment if the file exists.
    pub async fn open(deployment_id: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let deployment_id = deployment_id.into();
        let path = path.as_ref().to_path_buf();
        let mut rows = BTreeMap::new();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let stored: Vec<SiloInstanceRow> = serde_json::from_slice(&bytes)
                    .map_err(|e| MembershipError::parse(format!("{}: {e}", path.display())))?;
                for row in stored {
                    rows.insert((row.deployment_id.clone(), row.row_key.clone()), row);
                }
                info!("loaded {} membership rows from {}", rows.len(), path.display());
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        Ok(Self {
            deployment_id,
            path: Some(path),
            rows: Mutex::new(rows),
        })
    }

    fn key(&self, row_key: &str) -> (String, String) {
        (self.deployment_id.clone(), row_key.to_string())
    }

    /// This deployment's rows, the version row included.
    fn own<'a>(&'a self, rows: &'a Rows) -> impl Iterator<Item = &'a SiloInstanceRow> + 'a {
        rows.values().filter(move |row| row.deployment_id == self.deployment_id)
    }

    async fn persist(&self, rows: &Rows) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let all: Vec<&SiloInstanceRow> = rows.values().collect();
        let data = serde_json::to_vec_pretty(&all).map_err(MembershipError::table)?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Persists `next` and only then makes it the current row set. On error
    /// the current rows stay untouched.
    async fn replace(&self, rows: &mut Rows, next: Rows) -> Result<()> {
        self.persist(&next).await?;
        *rows = next;
        Ok(())
    }

    fn version_of(&self, rows: &Rows) -> Result<TableVersion> {
        rows.get(&self.key(TABLE_VERSION_ROW))
            .map(SiloInstanceRow::to_table_version)
            .ok_or_else(|| MembershipError::table("membership table is not initialized"))
    }

    fn accepts(&self, rows: &Rows, proposed: &TableVersion) -> Result<bool> {
        let stored = self.version_of(rows)?;
        Ok(proposed.version == stored.version + 1 && proposed.etag == stored.etag)
    }

    /// The row set after writing the silo row and the new version row.
    fn committed(&self, rows: &Rows, entry: &MembershipEntry, proposed: &TableVersion) -> Rows {
        let mut next = rows.clone();
        let row = SiloInstanceRow::from_entry(&self.deployment_id, entry, &new_etag());
        next.insert(self.key(&row.row_key), row);
        let version = TableVersion::new(proposed.version, new_etag());
        next.insert(
            self.key(TABLE_VERSION_ROW),
            SiloInstanceRow::version_row(&self.deployment_id, &version),
        );
        next
    }

    fn snapshot<'a>(
        rows: impl Iterator<Item = &'a SiloInstanceRow>,
        version: TableVersion,
    ) -> Result<MembershipTableData> {
        let members = rows
            .filter(|row| !row.is_version_row())
            .map(|row| Ok((row.to_entry()?, row.etag.clone())))
            .collect::<Result<Vec<_>>>()?;
        Ok(MembershipTableData::new(members, version))
    }
}

#[async_trait]
impl MembershipTable for RowMembershipTable {
    async fn initialize(&self, try_init_table_version: bool) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let key = self.key(TABLE_VERSION_ROW);
        if try_init_table_version && !rows.contains_key(&key) {
            let version = TableVersion::new(0, new_etag());
            let mut next = rows.clone();
            next.insert(key, SiloInstanceRow::version_row(&self.deployment_id, &version));
            self.replace(&mut rows, next).await?;
            debug!("initialized membership version row for {}", self.deployment_id);
        }
        Ok(())
    }

    async fn delete_membership_table_entries(&self, deployment_id: &str) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let mut next = rows.clone();
        next.retain(|(deployment, _), _| deployment != deployment_id);
        self.replace(&mut rows, next).await
    }

    async fn read_row(&self, silo: &SiloAddress) -> Result<MembershipTableData> {
        let rows = self.rows.lock().await;
        let version = self.version_of(&rows)?;
        Self::snapshot(rows.get(&self.key(&row_key(silo))).into_iter(), version)
    }

    async fn read_all(&self) -> Result<MembershipTableData> {
        let rows = self.rows.lock().await;
        let version = self.version_of(&rows)?;
        Self::snapshot(self.own(&rows), version)
    }

    async fn insert_row(&self, entry: &MembershipEntry, table_version: &TableVersion) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        if !self.accepts(&rows, table_version)?
            || rows.contains_key(&self.key(&row_key(&entry.silo_address)))
        {
            return Ok(false);
        }
        let next = self.committed(&rows, entry, table_version);
        self.replace(&mut rows, next).await?;
        Ok(true)
    }

    async fn update_row(
        &self,
        entry: &MembershipEntry,
        etag: &str,
        table_version: &TableVersion,
    ) -> Result<bool> {
        let mut rows = self.rows.lock().await;
        if !self.accepts(&rows, table_version)? {
            return Ok(false);
        }
        match rows.get(&self.key(&row_key(&entry.silo_address))) {
            Some(row) if row.etag == etag => {}
            _ => return Ok(false),
        }
        let next = self.committed(&rows, entry, table_version);
        self.replace(&mut rows, next).await?;
        Ok(true)
    }

    async fn update_i_am_alive(&self, entry: &MembershipEntry) -> Result<()> {
        let Some(alive) = entry.i_am_alive_time else {
            return Ok(());
        };
        let mut rows = self.rows.lock().await;
        let key = self.key(&row_key(&entry.silo_address));
        let Some(row) = rows.get(&key) else {
            return Ok(());
        };
        // round-trip through the entry so the timestamp uses the row format
        let mut stored = row.to_entry()?;
        stored.i_am_alive_time = Some(alive);
        let updated = SiloInstanceRow::from_entry(&self.deployment_id, &stored, &row.etag);
        let mut next = rows.clone();
        next.insert(key, updated);
        self.replace(&mut rows, next).await
    }

    async fn cleanup_defunct_silo_entries(&self, before: SystemTime) -> Result<()> {
        let mut rows = self.rows.lock().await;
        let mut defunct = Vec::new();
        for row in self.own(&rows).filter(|row| !row.is_version_row()) {
            let entry = row.to_entry()?;
            if entry.status == SiloStatus::Dead && entry.last_alive() < before {
                defunct.push(self.key(&row.row_key));
            }
        }
        if defunct.is_empty() {
            return Ok(());
        }
        let mut next = rows.clone();
        for key in &defunct {
            next.remove(key);
        }
        self.replace(&mut rows, next).await?;
        debug!("removed {} defunct membership rows", defunct.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::table::contract;

    async fn fresh() -> RowMembershipTable {
        let table = RowMembershipTable::new("d");
        table.initialize(true).await.unwrap();
        table
    }

    #[tokio::test]
    async fn empty_table() {
        contract::empty_table_has_version_zero(&fresh().await).await;
    }

    #[tokio::test]
    async fn conditional_writes() {
        contract::conditional_writes(&fresh().await).await;
    }

    #[tokio::test]
    async fn racing_inserts() {
        contract::racing_inserts_single_winner(Arc::new(fresh().await)).await;
    }

    #[tokio::test]
    async fn read_row() {
        contract::read_row_returns_only_that_silo(&fresh().await).await;
    }

    #[tokio::test]
    async fn i_am_alive() {
        contract::i_am_alive_is_unconditional(&fresh().await).await;
    }

    #[tokio::test]
    async fn cleanup_and_gateways() {
        contract::cleanup_and_gateways(&fresh().await).await;
    }

    #[tokio::test]
    async fn delete_entries() {
        contract::delete_entries_resets_table(&fresh().await, "d").await;
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let table = fresh().await;
        let before = table.read_all().await.unwrap().version;
        table.initialize(true).await.unwrap();
        assert_eq!(table.read_all().await.unwrap().version, before);
    }

    #[tokio::test]
    async fn rows_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("membership.json");

        let table = RowMembershipTable::open("d", &path).await.unwrap();
        table.initialize(true).await.unwrap();
        let v = table.read_all().await.unwrap().version;
        let mut e = contract::entry(700, SiloStatus::Active);
        e.add_suspector(contract::silo(701, 3), std::time::UNIX_EPOCH);
        assert!(table.insert_row(&e, &v.next()).await.unwrap());
        let written = table.read_all().await.unwrap();
        drop(table);

        let reopened = RowMembershipTable::open("d", &path).await.unwrap();
        let read = reopened.read_all().await.unwrap();
        assert_eq!(read, written);

        // rows of other deployments are not visible
        let other = RowMembershipTable::open("other", &path).await.unwrap();
        assert!(other.read_all().await.is_err());
    }

    #[tokio::test]
    async fn failed_persist_leaves_table_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("membership.json");
        let table = RowMembershipTable::open("d", &path).await.unwrap();
        table.initialize(true).await.unwrap();
        let before = table.read_all().await.unwrap();

        // a directory in place of the file makes the rename fail
        std::fs::remove_file(&path).unwrap();
        std::fs::create_dir(&path).unwrap();

        let e = contract::entry(710, SiloStatus::Joining);
        assert!(table.insert_row(&e, &before.version.next()).await.is_err());
        assert_eq!(table.read_all().await.unwrap(), before);
        assert!(table.initialize(true).await.is_ok());

        std::fs::remove_dir(&path).unwrap();
        assert!(table.insert_row(&e, &before.version.next()).await.unwrap());
        let after = table.read_all().await.unwrap();
        assert_eq!(after.version.version, before.version.version + 1);
        assert_eq!(after.members.len(), 1);

        let reopened = RowMembershipTable::open("d", &path).await.unwrap();
        assert_eq!(reopened.read_all().await.unwrap(), after);
    }

    #[tokio::test]
    async fn deployments_share_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("membership.json");

        let a = RowMembershipTable::open("a", &path).await.unwrap();
        a.initialize(true).await.unwrap();
        let v = a.read_all().await.unwrap().version;
        assert!(a.insert_row(&contract::entry(720, SiloStatus::Active), &v.next()).await.unwrap());
        let written = a.read_all().await.unwrap();
        drop(a);

        let b = RowMembershipTable::open("b", &path).await.unwrap();
        b.initialize(true).await.unwrap();
        let v = b.read_all().await.unwrap().version;
        assert_eq!(v.version, 0);
        assert!(b.insert_row(&contract::entry(721, SiloStatus::Active), &v.next()).await.unwrap());
        assert_eq!(b.read_all().await.unwrap().members.len(), 1);

        let a = RowMembershipTable::open("a", &path).await.unwrap();
        assert_eq!(a.read_all().await.unwrap(), written);

        b.delete_membership_table_entries("b").await.unwrap();
        let a = RowMembershipTable::open("a", &path).await.unwrap();
        assert_eq!(a.read_all().await.unwrap(), written);
        let b = RowMembershipTable::open("b", &path).await.unwrap();
        assert!(b.read_all().await.is_err());
    }
}
