//! Builds the configured membership table once per process.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::info;

use crate::table::{
    DynMembershipTable, InMemoryMembershipTable, MembershipTable, RemoteMembershipTable,
    RowMembershipTable,
};
use crate::Result;

/// Where the membership table lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TableBackend {
    /// Process-local table. Only useful for a single silo or tests.
    #[default]
    Memory,
    /// Rows persisted to a JSON file.
    File { path: PathBuf },
    /// A table hosted by another silo's table service.
    Remote { addr: SocketAddr },
}

/// Creates the table backend on first use and hands out the same instance
/// afterwards. Concurrent first calls build it only once.
pub struct MembershipTableFactory {
    deployment_id: String,
    backend: TableBackend,
    call_timeout: Duration,
    table: OnceCell<DynMembershipTable>,
}

impl MembershipTableFactory {
    pub fn new(deployment_id: impl Into<String>, backend: TableBackend, call_timeout: Duration) -> Self {
        Self {
            deployment_id: deployment_id.into(),
            backend,
            call_timeout,
            table: OnceCell::new(),
        }
    }

    pub fn backend(&self) -> &TableBackend {
        &self.backend
    }

    pub async fn get_membership_table(&self) -> Result<DynMembershipTable> {
        let table = self.table.get_or_try_init(|| self.create()).await?;
        Ok(Arc::clone(table))
    }

    async fn create(&self) -> Result<DynMembershipTable> {
        let table: DynMembershipTable = match &self.backend {
            TableBackend::Memory => Arc::new(InMemoryMembershipTable::new(self.deployment_id.clone())),
            TableBackend::File { path } => {
                Arc::new(RowMembershipTable::open(self.deployment_id.clone(), path).await?)
            }
            TableBackend::Remote { addr } => Arc::new(RemoteMembershipTable::new(*addr, self.call_timeout)),
        };
        table.initialize(true).await?;
        info!(
            "membership table for deployment {} ready ({:?})",
            self.deployment_id, self.backend
        );
        Ok(table)
    }
}
