//! silo-membership: cluster membership and key ownership for silos.
//!
//! Every silo runs a [`MembershipOracle`] that decides, together with its
//! peers, which silos are alive. The decision is recorded in a shared,
//! versioned membership table; all writes to it are compare-and-swap, so
//! concurrent writers never both succeed against the same version.
//!
//! # Architecture
//!
//! - **Table** ([`table`]): the durable source of truth. Backends keep it
//!   in memory, in a JSON file, or behind another silo's [`TableService`].
//! - **Oracle**: joins the cluster, publishes heartbeats, probes peers over
//!   the [`SiloTransport`], votes on suspected silos and declares them dead
//!   once a quorum agrees.
//! - **Local view** ([`MembershipOracleData`]): the last status seen for
//!   every silo, served lock-free to readers and pushed to
//!   [`SiloStatusListener`]s on change.
//! - **Rings** ([`ring`]): map 32-bit keys to the responsible silo and
//!   report this silo's range as membership changes.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use silo_membership::{
//!     InMemoryMembershipTable, MembershipConfig, MembershipOracle, SiloIdentity, UdpSiloTransport,
//! };
//!
//! let (transport, _events) =
//!     UdpSiloTransport::bind("127.0.0.1:11111".parse()?, 1, Duration::from_secs(5)).await?;
//! let identity = SiloIdentity::new(transport.local_silo(), "silo-1", "localhost");
//! let table = Arc::new(InMemoryMembershipTable::new("dev"));
//! let oracle = MembershipOracle::new(identity, MembershipConfig::default(), table, transport)?;
//! oracle.start().await?;
//! oracle.become_active().await?;
//! ```

mod config;
mod entry;
mod error;
mod factory;
pub mod message;
mod oracle;
mod oracle_data;
mod retry;
pub mod ring;
mod row;
mod silo;
pub mod table;
mod timer;
mod transport;

pub use config::{MembershipConfig, RingConfig};
pub use entry::{MembershipEntry, MembershipTableData, SuspectVote, TableVersion};
pub use error::{MembershipError, Result};
pub use factory::{MembershipTableFactory, TableBackend};
pub use oracle::{should_declare_dead, MembershipOracle, SiloIdentity};
pub use oracle_data::{MembershipOracleData, SiloStatusListener};
pub use retry::{execute_with_retries, ExponentialBackoff};
pub use ring::{ConsistentRingProvider, RingProvider, RingRange, RingRangeListener, VirtualBucketsRingProvider};
pub use row::{row_key, SiloInstanceRow, TABLE_VERSION_ROW};
pub use silo::{SiloAddress, SiloStatus};
pub use table::{
    DynMembershipTable, InMemoryMembershipTable, MembershipTable, RemoteMembershipTable,
    RowMembershipTable, TableService,
};
pub use timer::PeriodicTask;
pub use transport::{DynSiloTransport, SiloTransport, TransportEvent, UdpSiloTransport};
