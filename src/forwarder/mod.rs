//! Server-side multiplexer
//!
//! The [`Forwarder`] owns the listening socket for real clients and the
//! single control socket to the controller. Real-client lifecycle and data
//! events become frames on the control socket; frames received from the
//! controller become writes and closes on the matching real client.

mod auth;

pub use auth::{Authenticator, TokenAuthenticator, AUTH_TIMEOUT};

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, trace, warn};

use crate::socket::apply_keepalive;
use crate::tunnel::{
    Frame, FrameKind, TunnelError, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIME,
};
use crate::wire::{self, Endpoint};

/// Forwarder errors
#[derive(Debug, Error)]
pub enum ForwarderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

/// Capacity of the per-client write queue
const CLIENT_QUEUE_SIZE: usize = 256;

/// Capacity of the outbound frame queue feeding the control socket
const OUTBOUND_QUEUE_SIZE: usize = 256;

/// Operations delivered to a client's writer task
enum ClientOp {
    /// Payload from the controller to write to the client
    Data(Bytes),
    /// Close the client socket
    Shutdown,
}

/// Handle to one registered real client
struct ClientHandle {
    ops: mpsc::Sender<ClientOp>,
}

type ClientMap = Arc<Mutex<HashMap<Endpoint, ClientHandle>>>;

/// State of one attached controller session
struct ActiveTunnel {
    clients: ClientMap,
    forward_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
    /// Cleared by whichever side tears the session down, so the accessors
    /// stop reporting a dead tunnel after a self-initiated teardown
    attached: Arc<AtomicBool>,
}

/// Server-side multiplexer: at most one controller, any number of clients.
///
/// A fresh instance holds no controller and accepts no clients; clients are
/// only accepted while a controller is attached.
pub struct Forwarder {
    forward_listen: String,
    active: Option<ActiveTunnel>,
}

impl Forwarder {
    /// `forward_listen` is the address clients will connect to, e.g.
    /// `"0.0.0.0:4782"`. Binding happens on controller attachment.
    pub fn new(forward_listen: impl Into<String>) -> Self {
        Self {
            forward_listen: forward_listen.into(),
            active: None,
        }
    }

    /// Address the client listener is currently bound to
    pub fn forward_addr(&self) -> Option<SocketAddr> {
        self.active
            .as_ref()
            .filter(|active| active.attached.load(Ordering::SeqCst))
            .map(|active| active.forward_addr)
    }

    pub fn has_controller(&self) -> bool {
        self.active
            .as_ref()
            .map_or(false, |active| active.attached.load(Ordering::SeqCst))
    }

    /// Number of currently registered real clients
    pub async fn client_count(&self) -> usize {
        match &self.active {
            Some(active) => active.clients.lock().await.len(),
            None => 0,
        }
    }

    /// Attach an authorized control connection, replacing any previous one:
    /// the old control socket, its listener, and all of its clients are torn
    /// down first. Only then does the forwarder start accepting clients.
    pub async fn attach_controller(&mut self, stream: TcpStream) -> Result<(), ForwarderError> {
        self.detach_controller().await;

        stream.set_nodelay(true).ok();
        if let Err(e) = apply_keepalive(&stream, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIME) {
            warn!("failed to set keep-alive on control socket: {}", e);
        }

        let listener = TcpListener::bind(&self.forward_listen).await?;
        let forward_addr = listener.local_addr()?;
        info!(%forward_addr, "controller attached, waiting for clients");

        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_SIZE);
        let clients: ClientMap = Arc::new(Mutex::new(HashMap::new()));

        let attached = Arc::new(AtomicBool::new(true));

        let writer = tokio::spawn(control_write_loop(write_half, outbound_rx));
        let accept = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&clients),
            outbound_tx,
        ));
        let control = tokio::spawn(control_read_loop(
            read_half,
            Arc::clone(&clients),
            accept.abort_handle(),
            Arc::clone(&attached),
        ));

        self.active = Some(ActiveTunnel {
            clients,
            forward_addr,
            tasks: vec![writer, accept, control],
            attached,
        });
        Ok(())
    }

    /// Tear down the current controller session, if any: stop the listener,
    /// close the control socket, and close every registered client.
    ///
    /// Awaits the aborted tasks so the old client listener is released
    /// before this returns; a replacement on the same port can bind
    /// immediately afterwards.
    pub async fn detach_controller(&mut self) {
        if let Some(old) = self.active.take() {
            info!("detaching controller");
            old.attached.store(false, Ordering::SeqCst);
            for task in old.tasks {
                task.abort();
                let _ = task.await;
            }
            shutdown_clients(&old.clients).await;
        }
    }

    /// Control accept loop: authenticate each new control connection and
    /// attach it on success. A rejected connection is closed and nothing is
    /// attached; an accepted one replaces the current controller.
    pub async fn serve<A: Authenticator>(
        &mut self,
        listener: TcpListener,
        auth: &A,
    ) -> Result<(), ForwarderError> {
        loop {
            let (mut stream, peer) = listener.accept().await?;
            match auth.authenticate(&mut stream).await {
                Ok(true) => {
                    info!(%peer, "controller authorized");
                    self.attach_controller(stream).await?;
                }
                Ok(false) => {
                    warn!(%peer, "controller rejected");
                    let _ = stream.shutdown().await;
                }
                Err(e) => {
                    warn!(%peer, "authentication failed: {}", e);
                }
            }
        }
    }
}

async fn shutdown_clients(clients: &ClientMap) {
    let drained: Vec<_> = clients.lock().await.drain().collect();
    for (endpoint, handle) in drained {
        debug!(%endpoint, "closing client");
        let _ = handle.ops.send(ClientOp::Shutdown).await;
    }
}

/// Single writer for the control socket; frame boundaries stay intact
/// because every producer goes through the one queue.
async fn control_write_loop(
    mut write_half: OwnedWriteHalf,
    mut outbound_rx: mpsc::Receiver<Frame>,
) {
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

/// Accept real clients while the controller is attached. Each accept emits
/// SYN and registers the client exactly once.
async fn accept_loop(listener: TcpListener, clients: ClientMap, outbound: mpsc::Sender<Frame>) {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("client accept failed: {}", e);
                continue;
            }
        };

        let endpoint = match Endpoint::try_from(peer) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(%peer, "rejecting client: {}", e);
                continue;
            }
        };

        stream.set_nodelay(true).ok();
        apply_keepalive(&stream, KEEP_ALIVE_INTERVAL, KEEP_ALIVE_TIME).ok();

        if outbound.send(Frame::syn(endpoint)).await.is_err() {
            // control socket gone; teardown is in progress
            return;
        }
        info!(%endpoint, "client connected");

        let (ops_tx, ops_rx) = mpsc::channel(CLIENT_QUEUE_SIZE);
        clients
            .lock()
            .await
            .insert(endpoint, ClientHandle { ops: ops_tx });

        let (read_half, write_half) = stream.into_split();
        tokio::spawn(client_write_loop(write_half, ops_rx));
        tokio::spawn(client_read_loop(
            read_half,
            endpoint,
            Arc::clone(&clients),
            outbound.clone(),
        ));
    }
}

async fn client_write_loop(mut write_half: OwnedWriteHalf, mut ops_rx: mpsc::Receiver<ClientOp>) {
    while let Some(op) = ops_rx.recv().await {
        match op {
            ClientOp::Data(data) => {
                if write_half.write_all(&data).await.is_err() {
                    break;
                }
            }
            ClientOp::Shutdown => {
                let _ = write_half.shutdown().await;
                break;
            }
        }
    }
}

/// Forward everything the client sends as PSH frames; on disconnect emit
/// FIN and deregister.
async fn client_read_loop(
    mut read_half: OwnedReadHalf,
    endpoint: Endpoint,
    clients: ClientMap,
    outbound: mpsc::Sender<Frame>,
) {
    let mut buf = vec![0u8; 8192];
    loop {
        match read_half.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                let frame = Frame::psh(endpoint, Bytes::copy_from_slice(&buf[..n]));
                if outbound.send(frame).await.is_err() {
                    // control socket gone; teardown closes this client
                    return;
                }
            }
        }
    }

    if clients.lock().await.remove(&endpoint).is_some() {
        info!(%endpoint, "client disconnected");
        let _ = outbound.send(Frame::fin(endpoint)).await;
    }
}

/// Reassemble frames from the controller and apply them to the matching
/// client. On control-socket close the whole tunnel is destroyed: listener
/// stopped, every client closed.
async fn control_read_loop(
    mut read_half: OwnedReadHalf,
    clients: ClientMap,
    accept_abort: AbortHandle,
    attached: Arc<AtomicBool>,
) {
    let mut readbuf = vec![0u8; 8192];
    let mut acc = BytesMut::with_capacity(8192);

    'receive: loop {
        let n = match read_half.read(&mut readbuf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                warn!("control read failed: {}", e);
                break;
            }
        };
        acc.extend_from_slice(&readbuf[..n]);

        loop {
            match Frame::decode(&mut acc) {
                Ok(Some(frame)) => apply_control_frame(frame, &clients).await,
                Ok(None) => break,
                Err(TunnelError::UnknownFrameKind(kind)) => {
                    warn!(kind, "dropping frame of unknown kind");
                }
                Err(e) => {
                    warn!("frame decode error: {}", e);
                    break 'receive;
                }
            }
        }
    }

    warn!("control connection closed, tunnel destroyed");
    attached.store(false, Ordering::SeqCst);
    accept_abort.abort();
    shutdown_clients(&clients).await;
}

async fn apply_control_frame(frame: Frame, clients: &ClientMap) {
    let endpoint = frame.endpoint;
    match frame.kind {
        FrameKind::Psh => {
            let ops = clients
                .lock()
                .await
                .get(&endpoint)
                .map(|handle| handle.ops.clone());

            match ops {
                Some(ops) => {
                    if ops.send(ClientOp::Data(frame.payload)).await.is_err() {
                        trace!(%endpoint, "client writer gone, dropping payload");
                    }
                }
                // stale or desynchronized frame; recoverable no-op
                None => trace!(%endpoint, "PSH for unregistered client"),
            }
        }
        FrameKind::Fin => {
            if let Some(handle) = clients.lock().await.remove(&endpoint) {
                info!(%endpoint, "controller closed client");
                let _ = handle.ops.send(ClientOp::Shutdown).await;
            } else {
                trace!(%endpoint, "FIN for unregistered client");
            }
        }
        // the forwarder, not the controller, originates connections
        FrameKind::Syn => debug!(%endpoint, "ignoring SYN from controller"),
    }
}
