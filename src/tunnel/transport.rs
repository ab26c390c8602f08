//! Controller-side tunnel transport
//!
//! Owns the single socket to the forwarder, reassembles the incoming byte
//! stream into frames, and maintains the [`EndpointTable`] of virtual
//! connections. All outbound frames funnel through one writer task so their
//! boundaries can never interleave on the wire.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::frame::{Frame, FrameKind};
use super::socket::VirtualSocket;
use super::table::{EndpointTable, VirtualEntry};
use super::{TunnelError, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIME};
use crate::socket::apply_keepalive;
use crate::wire::{self, Endpoint};
use crate::MAX_PAYLOAD_SIZE;

/// Capacity of the per-connection PSH delivery queue
const DELIVERY_QUEUE_SIZE: usize = 256;

/// Capacity of the outbound frame queue feeding the writer task
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Notifications delivered to the embedding consumer, in control-socket
/// arrival order.
#[derive(Debug)]
pub enum TunnelEvent {
    /// A remote client connected; the handle consumes its traffic
    Accepted(VirtualSocket),
    /// A remote client disconnected (FIN received)
    Disconnected(Endpoint),
    /// The control connection failed or closed; no automatic reconnect
    Failed(String),
}

/// Controller-side demultiplexer over one control connection.
///
/// Multiple instances can coexist; each owns its socket, table, and queues.
pub struct TunnelTransport {
    table: Arc<Mutex<EndpointTable>>,
    outbound: mpsc::Sender<Frame>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl TunnelTransport {
    /// Open the control socket to a forwarder and begin receiving.
    ///
    /// On failure no connection is established; retry policy belongs to the
    /// caller.
    pub async fn connect(addr: &str) -> Result<(Self, mpsc::Receiver<TunnelEvent>), TunnelError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| TunnelError::TunnelFailed(e.to_string()))?;
        Ok(Self::attach(stream))
    }

    /// Drive an already-connected control socket (e.g. after an external
    /// authentication exchange).
    pub fn attach(stream: TcpStream) -> (Self, mpsc::Receiver<TunnelEvent>) {
        stream.set_nodelay(true).ok();
        if let Err(e) = apply_keepalive(&stream, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIME) {
            warn!("failed to set keep-alive on control socket: {}", e);
        }

        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::channel(64);
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let table = Arc::new(Mutex::new(EndpointTable::new()));

        let writer = tokio::spawn(write_loop(write_half, outbound_rx));
        let reader = tokio::spawn(read_loop(
            read_half,
            Arc::clone(&table),
            outbound_tx.clone(),
            event_tx,
        ));

        let transport = Self {
            table,
            outbound: outbound_tx,
            reader,
            writer,
        };
        (transport, event_rx)
    }

    /// Send payload bytes to the given remote endpoint as PSH frames,
    /// chunked at the 16-bit payload bound. Returns the bytes accepted.
    pub async fn send(&self, endpoint: Endpoint, data: &[u8]) -> Result<usize, TunnelError> {
        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let frame = Frame::psh(endpoint, Bytes::copy_from_slice(chunk));
            self.outbound
                .send(frame)
                .await
                .map_err(|_| TunnelError::SocketClosed)?;
        }
        Ok(data.len())
    }

    /// Close a virtual connection: FIN on the wire, entry removed locally
    /// without waiting for acknowledgment.
    pub async fn close(&self, endpoint: Endpoint) -> Result<(), TunnelError> {
        if self.table.lock().await.remove(&endpoint).is_none() {
            debug!(%endpoint, "closing untracked endpoint");
        }
        self.outbound
            .send(Frame::fin(endpoint))
            .await
            .map_err(|_| TunnelError::SocketClosed)
    }

    /// Close the control socket. Open virtual connections are not torn
    /// down; their reads simply see no further deliveries.
    pub fn disconnect(&self) {
        self.reader.abort();
        self.writer.abort();
    }

    /// Number of currently tracked virtual connections
    pub async fn active_connections(&self) -> usize {
        self.table.lock().await.len()
    }
}

/// Drain the outbound queue onto the control socket. Exactly one writer
/// exists per tunnel, which keeps frame boundaries intact on the wire.
async fn write_loop(mut write_half: OwnedWriteHalf, mut outbound_rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = outbound_rx.recv().await {
        let encoded = match frame.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!("dropping unencodable frame: {}", e);
                continue;
            }
        };
        trace!(bytes = %wire::hex_dump(&encoded), "control socket write");
        if let Err(e) = write_half.write_all(&encoded).await {
            warn!("control socket write failed: {}", e);
            break;
        }
    }
}

/// Accumulate-then-drain read loop: append each read to the carryover
/// buffer, then decode as many complete frames as it holds.
async fn read_loop(
    mut read_half: OwnedReadHalf,
    table: Arc<Mutex<EndpointTable>>,
    outbound: mpsc::Sender<Frame>,
    event_tx: mpsc::Sender<TunnelEvent>,
) {
    let mut readbuf = vec![0u8; 8192];
    let mut acc = BytesMut::with_capacity(8192);

    'receive: loop {
        let n = match read_half.read(&mut readbuf).await {
            Ok(0) => {
                debug!("control connection closed by peer");
                let _ = event_tx
                    .send(TunnelEvent::Failed("control connection closed".to_string()))
                    .await;
                break;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = event_tx.send(TunnelEvent::Failed(e.to_string())).await;
                break;
            }
        };
        acc.extend_from_slice(&readbuf[..n]);

        loop {
            match Frame::decode(&mut acc) {
                Ok(Some(frame)) => {
                    if !dispatch(frame, &table, &outbound, &event_tx).await {
                        break 'receive;
                    }
                }
                Ok(None) => break,
                Err(TunnelError::UnknownFrameKind(kind)) => {
                    warn!(kind, "dropping frame of unknown kind");
                }
                Err(e) => {
                    warn!("frame decode error: {}", e);
                }
            }
        }
    }
}

/// Handle one reassembled frame. Returns false once the consumer is gone
/// and receiving should stop.
async fn dispatch(
    frame: Frame,
    table: &Arc<Mutex<EndpointTable>>,
    outbound: &mpsc::Sender<Frame>,
    event_tx: &mpsc::Sender<TunnelEvent>,
) -> bool {
    let endpoint = frame.endpoint;
    match frame.kind {
        FrameKind::Syn => {
            let (data_tx, data_rx) = mpsc::channel(DELIVERY_QUEUE_SIZE);
            let socket = VirtualSocket::new(
                endpoint,
                data_rx,
                outbound.clone(),
                Arc::clone(table),
            );

            // the incoming SYN is authoritative for this endpoint
            let displaced = table.lock().await.insert(endpoint, VirtualEntry { data_tx });
            if displaced.is_some() {
                warn!(%endpoint, "replacing stale connection on SYN");
            }

            debug!(%endpoint, "remote client connected");
            event_tx.send(TunnelEvent::Accepted(socket)).await.is_ok()
        }
        FrameKind::Psh => {
            let data_tx = table
                .lock()
                .await
                .get(&endpoint)
                .map(|entry| entry.data_tx.clone());

            match data_tx {
                Some(data_tx) => {
                    if data_tx.send(frame.payload).await.is_err() {
                        trace!(%endpoint, "consumer gone, dropping payload");
                    }
                }
                // stale frame after local close, or desynchronized stream
                None => trace!(%endpoint, "dropping PSH for untracked endpoint"),
            }
            true
        }
        FrameKind::Fin => {
            if table.lock().await.remove(&endpoint).is_some() {
                debug!(%endpoint, "remote client disconnected");
                event_tx
                    .send(TunnelEvent::Disconnected(endpoint))
                    .await
                    .is_ok()
            } else {
                trace!(%endpoint, "FIN for untracked endpoint");
                true
            }
        }
    }
}
