//! Silo-to-silo liveness transport.
//!
//! The oracle only needs two calls from the network: a ping that succeeds
//! iff the exact target silo answers in time, and a fire-and-forget status
//! notification. [`UdpSiloTransport`] provides both over one UDP socket
//! using the [`SiloMessage`] codec; incoming notifications are surfaced as
//! [`TransportEvent`]s on a channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::message::SiloMessage;
use crate::{MembershipError, Result, SiloAddress, SiloStatus};

/// Network calls the oracle makes to other silos.
#[async_trait]
pub trait SiloTransport: Send + Sync {
    /// Pings `target`. Fails if no answer arrives within the transport's
    /// timeout, including when a different generation owns the endpoint.
    async fn ping(&self, target: &SiloAddress, probe_number: u64) -> Result<()>;

    /// Tells `target` that `silo` changed to `status`.
    async fn send_status_notification(
        &self,
        target: &SiloAddress,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<()>;
}

pub type DynSiloTransport = Arc<dyn SiloTransport>;

/// Messages surfaced by the transport for the oracle to act on.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A peer gossiped a status change.
    StatusNotification {
        from: SiloAddress,
        silo: SiloAddress,
        status: SiloStatus,
    },
}

/// A ping waiting for its ack. Only the pinged silo may complete it.
struct PendingPing {
    target: SiloAddress,
    done: oneshot::Sender<()>,
}

/// State shared between the transport handle and its receive loop.
struct Shared {
    local: SiloAddress,
    pending: Mutex<HashMap<u64, PendingPing>>,
}

impl Shared {
    /// Completes the ping `seq` if `sender` is the silo it was sent to.
    fn complete(&self, seq: u64, sender: SiloAddress) {
        let mut pending = self.pending.lock();
        match pending.get(&seq).map(|ping| ping.target) {
            Some(target) if target == sender => {
                if let Some(ping) = pending.remove(&seq) {
                    let _ = ping.done.send(());
                }
            }
            Some(target) => debug!("ignoring ack #{seq} from {sender}, expected {target}"),
            None => trace!("late ack #{seq} from {sender}"),
        }
    }
}

/// UDP implementation of [`SiloTransport`].
pub struct UdpSiloTransport {
    shared: Arc<Shared>,
    socket: Arc<UdpSocket>,
    next_seq: AtomicU64,
    ping_timeout: Duration,
    recv_task: JoinHandle<()>,
}

impl std::fmt::Debug for UdpSiloTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpSiloTransport")
            .field("local", &self.shared.local)
            .finish_non_exhaustive()
    }
}

impl UdpSiloTransport {
    /// Binds the socket and starts the receive loop.
    ///
    /// The silo's address is the bound endpoint (so port 0 resolves to the
    /// actual port) with the given generation.
    pub async fn bind(
        endpoint: SocketAddr,
        generation: i32,
        ping_timeout: Duration,
    ) -> Result<(Arc<Self>, mpsc::Receiver<TransportEvent>)> {
        let socket = Arc::new(UdpSocket::bind(endpoint).await?);
        let local = SiloAddress::new(socket.local_addr()?, generation);
        info!("liveness transport listening on {}", local.endpoint());

        let (event_tx, event_rx) = mpsc::channel(256);
        let shared = Arc::new(Shared {
            local,
            pending: Mutex::new(HashMap::new()),
        });
        let recv_task = tokio::spawn(recv_loop(
            Arc::clone(&socket),
            Arc::clone(&shared),
            event_tx,
        ));

        let transport = Arc::new(Self {
            shared,
            socket,
            next_seq: AtomicU64::new(1),
            ping_timeout,
            recv_task,
        });
        Ok((transport, event_rx))
    }

    /// This silo's address as seen by peers.
    pub fn local_silo(&self) -> SiloAddress {
        self.shared.local
    }

    async fn send(&self, to: SocketAddr, msg: &SiloMessage) -> Result<()> {
        self.socket.send_to(&msg.encode(), to).await?;
        Ok(())
    }
}

impl Drop for UdpSiloTransport {
    fn drop(&mut self) {
        self.recv_task.abort();
    }
}

#[async_trait]
impl SiloTransport for UdpSiloTransport {
    async fn ping(&self, target: &SiloAddress, probe_number: u64) -> Result<()> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let (done, rx) = oneshot::channel();
        self.shared.pending.lock().insert(
            seq,
            PendingPing {
                target: *target,
                done,
            },
        );
        trace!("probe #{probe_number} to {target} (seq {seq})");

        let msg = SiloMessage::Ping {
            seq,
            sender: self.shared.local,
            target: *target,
        };
        let outcome = match self.send(target.endpoint(), &msg).await {
            Ok(()) => match tokio::time::timeout(self.ping_timeout, rx).await {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err("ping cancelled".to_string()),
                Err(_) => Err(format!("no answer within {:?}", self.ping_timeout)),
            },
            Err(e) => Err(e.to_string()),
        };
        self.shared.pending.lock().remove(&seq);
        outcome.map_err(|reason| MembershipError::PingFailed {
            target: *target,
            reason,
        })
    }

    async fn send_status_notification(
        &self,
        target: &SiloAddress,
        silo: &SiloAddress,
        status: SiloStatus,
    ) -> Result<()> {
        let msg = SiloMessage::StatusNotification {
            sender: self.shared.local,
            silo: *silo,
            status,
        };
        self.send(target.endpoint(), &msg).await
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    shared: Arc<Shared>,
    event_tx: mpsc::Sender<TransportEvent>,
) {
    let mut recv_buf = vec![0u8; 2048];
    loop {
        let (len, from) = match socket.recv_from(&mut recv_buf).await {
            Ok(received) => received,
            Err(e) => {
                warn!("liveness recv error: {e}");
                continue;
            }
        };
        let msg = match SiloMessage::decode(&recv_buf[..len]) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("liveness decode error from {from}: {e}");
                continue;
            }
        };
        match msg {
            SiloMessage::Ping { seq, sender, target } => {
                if target != shared.local {
                    debug!("ignoring ping from {sender} addressed to {target}");
                    continue;
                }
                let ack = SiloMessage::Ack {
                    seq,
                    sender: shared.local,
                };
                if let Err(e) = socket.send_to(&ack.encode(), from).await {
                    debug!("ack send error to {from}: {e}");
                }
            }
            SiloMessage::Ack { seq, sender } => shared.complete(seq, sender),
            SiloMessage::StatusNotification {
                sender,
                silo,
                status,
            } => {
                let event = TransportEvent::StatusNotification {
                    from: sender,
                    silo,
                    status,
                };
                match event_tx.try_send(event) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!("dropping status notification from {sender}: consumer busy");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        warn!("transport event channel closed");
                    }
                }
            }
        }
    }
}
