//! Virtual connection: a tunneled stand-in for a real client socket

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use super::frame::Frame;
use super::table::EndpointTable;
use super::TunnelError;
use crate::socket::SocketHandle;
use crate::wire::Endpoint;
use crate::MAX_PAYLOAD_SIZE;

/// A logical connection carried through the tunnel.
///
/// Created by [`TunnelTransport`](super::TunnelTransport) when a SYN frame
/// arrives, handed to the consumer via
/// [`TunnelEvent::Accepted`](super::TunnelEvent). Receives are satisfied by
/// PSH deliveries, never by host I/O; sends and closes travel back through
/// the control socket.
#[derive(Debug)]
pub struct VirtualSocket {
    endpoint: Endpoint,
    data_rx: mpsc::Receiver<Bytes>,
    /// Unconsumed tail of the last PSH delivery
    leftover: Bytes,
    outbound: mpsc::Sender<Frame>,
    table: Arc<Mutex<EndpointTable>>,
    closed: bool,
}

impl VirtualSocket {
    pub(crate) fn new(
        endpoint: Endpoint,
        data_rx: mpsc::Receiver<Bytes>,
        outbound: mpsc::Sender<Frame>,
        table: Arc<Mutex<EndpointTable>>,
    ) -> Self {
        Self {
            endpoint,
            data_rx,
            leftover: Bytes::new(),
            outbound,
            table,
            closed: false,
        }
    }

    fn copy_leftover(&mut self, buf: &mut [u8]) -> usize {
        let n = self.leftover.len().min(buf.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover = self.leftover.slice(n..);
        n
    }
}

#[async_trait]
impl SocketHandle for VirtualSocket {
    fn remote_endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Await the next PSH delivery. Returns 0 once the connection was
    /// removed from the table (remote FIN, replacement, or tunnel teardown)
    /// and all buffered data has been consumed.
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        if buf.is_empty() {
            return Ok(0);
        }
        if !self.leftover.is_empty() {
            return Ok(self.copy_leftover(buf));
        }

        match self.data_rx.recv().await {
            Some(data) => {
                self.leftover = data;
                Ok(self.copy_leftover(buf))
            }
            None => Ok(0),
        }
    }

    /// Wrap `data` in PSH frames and queue them on the control socket,
    /// chunking at the 16-bit payload bound.
    async fn send(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        if self.closed {
            return Err(TunnelError::SocketClosed);
        }

        for chunk in data.chunks(MAX_PAYLOAD_SIZE) {
            let frame = Frame::psh(self.endpoint, Bytes::copy_from_slice(chunk));
            self.outbound
                .send(frame)
                .await
                .map_err(|_| TunnelError::SocketClosed)?;
        }
        Ok(data.len())
    }

    /// Optimistic local close: emit FIN and drop the table entry without
    /// waiting for acknowledgment (the protocol has none).
    async fn close(&mut self) -> Result<(), TunnelError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        self.table.lock().await.remove(&self.endpoint);
        // the tunnel may already be gone; closing is best-effort then
        let _ = self.outbound.send(Frame::fin(self.endpoint)).await;
        Ok(())
    }

    /// Accepted but has no effect; there is no keep-alive frame in the
    /// protocol and liveness follows the control connection.
    fn set_keepalive(&self, _interval: Duration, _time: Duration) -> Result<(), TunnelError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::FrameKind;

    fn virtual_socket() -> (VirtualSocket, mpsc::Sender<Bytes>, mpsc::Receiver<Frame>) {
        let endpoint = Endpoint::new(0x0a000001, 1000);
        let (data_tx, data_rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(8);
        let table = Arc::new(Mutex::new(EndpointTable::new()));
        let socket = VirtualSocket::new(endpoint, data_rx, outbound_tx, table);
        (socket, data_tx, outbound_rx)
    }

    #[tokio::test]
    async fn test_recv_buffers_partial_reads() {
        let (mut socket, data_tx, _outbound) = virtual_socket();
        data_tx.send(Bytes::from_static(b"ABCDEF")).await.unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(socket.recv(&mut buf).await.unwrap(), 4);
        assert_eq!(&buf, b"ABCD");
        assert_eq!(socket.recv(&mut buf).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"EF");
    }

    #[tokio::test]
    async fn test_recv_after_sender_dropped_is_eof() {
        let (mut socket, data_tx, _outbound) = virtual_socket();
        data_tx.send(Bytes::from_static(b"xy")).await.unwrap();
        drop(data_tx);

        let mut buf = [0u8; 8];
        assert_eq!(socket.recv(&mut buf).await.unwrap(), 2);
        assert_eq!(socket.recv(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_send_emits_psh() {
        let (mut socket, _data_tx, mut outbound) = virtual_socket();
        assert_eq!(socket.send(b"hello").await.unwrap(), 5);

        let frame = outbound.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Psh);
        assert_eq!(&frame.payload[..], b"hello");
    }

    #[tokio::test]
    async fn test_send_chunks_large_payloads() {
        let (mut socket, _data_tx, mut outbound) = virtual_socket();
        let data = vec![0xaa; MAX_PAYLOAD_SIZE + 10];
        assert_eq!(socket.send(&data).await.unwrap(), data.len());

        let first = outbound.recv().await.unwrap();
        let second = outbound.recv().await.unwrap();
        assert_eq!(first.payload.len(), MAX_PAYLOAD_SIZE);
        assert_eq!(second.payload.len(), 10);
    }

    #[tokio::test]
    async fn test_close_emits_fin_and_rejects_send() {
        let (mut socket, _data_tx, mut outbound) = virtual_socket();
        socket.close().await.unwrap();

        let frame = outbound.recv().await.unwrap();
        assert_eq!(frame.kind, FrameKind::Fin);

        assert!(matches!(
            socket.send(b"late").await,
            Err(TunnelError::SocketClosed)
        ));
        // closing twice is a no-op
        socket.close().await.unwrap();
        assert!(outbound.try_recv().is_err());
    }
}
