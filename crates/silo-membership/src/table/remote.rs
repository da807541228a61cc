//! A membership table hosted by one silo and used by the others over TCP.
//!
//! [`TableService`] serves any local backend; [`RemoteMembershipTable`] is
//! the client side and implements the same trait, so the oracle cannot
//! tell it from a local table. Conditional-write semantics are those of the
//! hosted backend: the service only relays calls.
//!
//! Framing: a 4-byte big-endian length followed by a bincode payload.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{DynMembershipTable, MembershipTable};
use crate::{
    MembershipEntry, MembershipError, MembershipTableData, Result, SiloAddress, TableVersion,
};

/// Upper bound on a single frame. A full table read for thousands of silos
/// stays well below this.
const MAX_FRAME_SIZE: usize = 8 * 1024 * 1024;

/// A table call sent to the hosting silo.
#[derive(Debug, Serialize, Deserialize)]
enum TableRequest {
    Initialize { try_init_table_version: bool },
    DeleteEntries { deployment_id: String },
    ReadRow { silo: SiloAddress },
    ReadAll,
    InsertRow { entry: MembershipEntry, version: TableVersion },
    UpdateRow { entry: MembershipEntry, etag: String, version: TableVersion },
    UpdateIAmAlive { entry: MembershipEntry },
    CleanupDefunct { before: SystemTime },
}

#[derive(Debug, Serialize, Deserialize)]
enum TableResponse {
    Data(MembershipTableData),
    Written(bool),
    Done,
    Failed(String),
}

/// Writes a length-prefixed bincode frame to `w`.
async fn write_frame<W, T>(w: &mut W, msg: &T) -> io::Result<()>
where
    W: AsyncWriteExt + Unpin,
    T: Serialize,
{
    let data =
        bincode::serialize(msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = data.len() as u32;
    w.write_all(&len.to_be_bytes()).await?;
    w.write_all(&data).await?;
    w.flush().await
}

/// Reads a length-prefixed bincode frame from `r`, rejecting oversized frames.
async fn read_frame<R, T>(r: &mut R) -> io::Result<T>
where
    R: AsyncReadExt + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    r.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("table frame size {len} exceeds limit {MAX_FRAME_SIZE}"),
        ));
    }
    let mut data = vec![0u8; len];
    r.read_exact(&mut data).await?;
    bincode::deserialize(&data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Serves a local table backend to remote silos.
pub struct TableService {
    table: DynMembershipTable,
}

impl TableService {
    /// Binds the listener and spawns the accept loop.
    ///
    /// Returns the bound address (useful with port 0) and the accept task.
    pub async fn start(
        table: DynMembershipTable,
        bind_addr: SocketAddr,
    ) -> io::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(bind_addr).await?;
        let local_addr = listener.local_addr()?;
        info!("membership table service listening on {local_addr}");

        let service = Arc::new(Self { table });
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!(%peer, "table client connected");
                        let service = Arc::clone(&service);
                        tokio::spawn(async move {
                            if let Err(e) = service.handle_client(stream).await {
                                debug!(%peer, "table connection closed: {e}");
                            }
                        });
                    }
                    Err(e) => {
                        error!("table service accept error: {e}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                }
            }
        });
        Ok((local_addr, handle))
    }

    async fn handle_client(&self, mut stream: TcpStream) -> io::Result<()> {
        loop {
            let request: TableRequest = match read_frame(&mut stream).await {
                Ok(req) => req,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
                Err(e) => return Err(e),
            };
            let response = self.dispatch(request).await;
            write_frame(&mut stream, &response).await?;
        }
    }

    async fn dispatch(&self, request: TableRequest) -> TableResponse {
        let table = &self.table;
        let result = match request {
            TableRequest::Initialize {
                try_init_table_version,
            } => table.initialize(try_init_table_version).await.map(|_| TableResponse::Done),
            TableRequest::DeleteEntries { deployment_id } => table
                .delete_membership_table_entries(&deployment_id)
                .await
                .map(|_| TableResponse::Done),
            TableRequest::ReadRow { silo } => table.read_row(&silo).await.map(TableResponse::Data),
            TableRequest::ReadAll => table.read_all().await.map(TableResponse::Data),
            TableRequest::InsertRow { entry, version } => table
                .insert_row(&entry, &version)
                .await
                .map(TableResponse::Written),
            TableRequest::UpdateRow {
                entry,
                etag,
                version,
            } => table
                .update_row(&entry, &etag, &version)
                .await
                .map(TableResponse::Written),
            TableRequest::UpdateIAmAlive { entry } => table
                .update_i_am_alive(&entry)
                .await
                .map(|_| TableResponse::Done),
            TableRequest::CleanupDefunct { before } => table
                .cleanup_defunct_silo_entries(before)
                .await
                .map(|_| TableResponse::Done),
        };
        result.unwrap_or_else(|e| TableResponse::Failed(e.to_string()))
    }
}

/// Client for a table hosted by [`TableService`].
///
/// Keeps one connection, reopened on the next call after any failure.
/// Calls are serialized over that connection.
pub struct RemoteMembershipTable {
    addr: SocketAddr,
    timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl RemoteMembershipTable {
    pub fn new(addr: SocketAddr, timeout: Duration) -> Self {
        Self {
            addr,
            timeout,
            conn: Mutex::new(None),
        }
    }

    async fn call(&self, request: TableRequest) -> Result<TableResponse> {
        let mut conn = self.conn.lock().await;
        let result = tokio::time::timeout(self.timeout, async {
            if conn.is_none() {
                *conn = Some(TcpStream::connect(self.addr).await?);
            }
            let stream = conn
                .as_mut()
                .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no table connection"))?;
            write_frame(stream, &request).await?;
            read_frame::<_, TableResponse>(stream).await
        })
        .await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                *conn = None;
                warn!("membership table call to {} failed: {e}", self.addr);
                return Err(MembershipError::table(format!("{}: {e}", self.addr)));
            }
            Err(_) => {
                *conn = None;
                return Err(MembershipError::table(format!(
                    "{}: call timed out after {:?}",
                    self.addr, self.timeout
                )));
            }
        };
        match response {
            TableResponse::Failed(reason) => Err(MembershipError::Table(reason)),
            other => Ok(other),
        }
    }

    async fn call_data(&self, request: TableRequest) -> Result<MembershipTableData> {
        match self.call(request).await? {
            TableResponse::Data(data) => Ok(data),
            other => Err(unexpected(other)),
        }
    }

    async fn call_written(&self, request: TableRequest) -> Result<bool> {
        match self.call(request).await? {
            TableResponse::Written(ok) => Ok(ok),
            other => Err(unexpected(other)),
        }
    }

    async fn call_done(&self, request: TableRequest) -> Result<()> {
        match self.call(request).await? {
            TableResponse::Done => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: TableResponse) -> MembershipError {
    MembershipError::table(format!("unexpected table response: {response:?}"))
}

#[async_trait]
impl MembershipTable for RemoteMembershipTable {
    async fn initialize(&self, try_init_table_version: bool) -> Result<()> {
        self.call_done(TableRequest::Initialize {
            try_init_table_version,
        })
        .await
    }

    async fn delete_membership_table_entries(&self, deployment_id: &str) -> Result<()> {
        self.call_done(TableRequest::DeleteEntries {
            deployment_id: deployment_id.to_string(),
        })
        .await
    }

    async fn read_row(&self, silo: &SiloAddress) -> Result<MembershipTableData> {
        self.call_data(TableRequest::ReadRow { silo: *silo }).await
    }

    async fn read_all(&self) -> Result<MembershipTableData> {
        self.call_data(TableRequest::ReadAll).await
    }

    async fn insert_row(&self, entry: &MembershipEntry, table_version: &TableVersion) -> Result<bool> {
        self.call_written(TableRequest::InsertRow {
            entry: entry.clone(),
            version: table_version.clone(),
        })
        .await
    }

    async fn update_row(
        &self,
        entry: &MembershipEntry,
        etag: &str,
        table_version: &TableVersion,
    ) -> Result<bool> {
        self.call_written(TableRequest::UpdateRow {
            entry: entry.clone(),
            etag: etag.to_string(),
            version: table_version.clone(),
        })
        .await
    }

    async fn update_i_am_alive(&self, entry: &MembershipEntry) -> Result<()> {
        self.call_done(TableRequest::UpdateIAmAlive {
            entry: entry.clone(),
        })
        .await
    }

    async fn cleanup_defunct_silo_entries(&self, before: SystemTime) -> Result<()> {
        self.call_done(TableRequest::CleanupDefunct { before }).await
    }
}
