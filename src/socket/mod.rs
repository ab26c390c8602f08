//! Socket capability interface
//!
//! [`SocketHandle`] is the contract shared by a real TCP socket wrapper and
//! a tunneled [`VirtualSocket`](crate::tunnel::VirtualSocket). Higher layers
//! depend only on this trait, so a virtual connection is a drop-in
//! replacement for a real one in any protocol handler.

use std::time::Duration;

use async_trait::async_trait;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::tunnel::TunnelError;
use crate::wire::Endpoint;

/// Capability interface over a connection, real or tunneled
#[async_trait]
pub trait SocketHandle: Send {
    /// Remote endpoint identifying this connection
    fn remote_endpoint(&self) -> Endpoint;

    /// Receive bytes into `buf`; returns 0 on orderly close
    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError>;

    /// Send bytes, returning how many were accepted
    async fn send(&mut self, data: &[u8]) -> Result<usize, TunnelError>;

    /// Close the connection
    async fn close(&mut self) -> Result<(), TunnelError>;

    /// Configure TCP keep-alive. Virtual connections accept this as a no-op:
    /// the tunnel carries no keep-alive frame, their liveness follows the
    /// control connection's.
    fn set_keepalive(&self, interval: Duration, time: Duration) -> Result<(), TunnelError>;
}

/// Apply TCP keep-alive options to a stream
pub(crate) fn apply_keepalive(
    stream: &TcpStream,
    interval: Duration,
    time: Duration,
) -> std::io::Result<()> {
    let keepalive = TcpKeepalive::new().with_time(time).with_interval(interval);
    SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

/// Real-socket variant: thin delegation to a [`TcpStream`]
pub struct TcpSocketHandle {
    stream: TcpStream,
    endpoint: Endpoint,
}

impl TcpSocketHandle {
    /// Wrap a connected stream. Fails for IPv6 peers, which the tunnel's
    /// wire format cannot address.
    pub fn new(stream: TcpStream) -> Result<Self, TunnelError> {
        let endpoint = Endpoint::try_from(stream.peer_addr()?)?;
        Ok(Self { stream, endpoint })
    }
}

#[async_trait]
impl SocketHandle for TcpSocketHandle {
    fn remote_endpoint(&self) -> Endpoint {
        self.endpoint
    }

    async fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TunnelError> {
        Ok(self.stream.read(buf).await?)
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize, TunnelError> {
        self.stream.write_all(data).await?;
        Ok(data.len())
    }

    async fn close(&mut self) -> Result<(), TunnelError> {
        self.stream.shutdown().await?;
        Ok(())
    }

    fn set_keepalive(&self, interval: Duration, time: Duration) -> Result<(), TunnelError> {
        apply_keepalive(&self.stream, interval, time)?;
        Ok(())
    }
}

/// Relay traffic between two connections until either side closes.
///
/// Works on any pair of [`SocketHandle`] implementations, which is what lets
/// a tunneled connection be bridged to a real upstream socket.
pub async fn bridge<A, B>(a: &mut A, b: &mut B)
where
    A: SocketHandle,
    B: SocketHandle,
{
    let mut buf_a = vec![0u8; 8192];
    let mut buf_b = vec![0u8; 8192];

    loop {
        tokio::select! {
            res = a.recv(&mut buf_a) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if b.send(&buf_a[..n]).await.is_err() {
                        break;
                    }
                }
            },
            res = b.recv(&mut buf_b) => match res {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if a.send(&buf_b[..n]).await.is_err() {
                        break;
                    }
                }
            },
        }
    }

    debug!(endpoint = %a.remote_endpoint(), "bridge finished");
    let _ = a.close().await;
    let _ = b.close().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_socket_handle_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 32];
            let n = socket.read(&mut buf).await.unwrap();
            socket.write_all(&buf[..n]).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let mut handle = TcpSocketHandle::new(stream).unwrap();
        assert_eq!(handle.remote_endpoint().port, addr.port());

        handle
            .set_keepalive(Duration::from_secs(25), Duration::from_secs(25))
            .unwrap();

        let sent = handle.send(b"ping").await.unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 32];
        let n = handle.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");

        handle.close().await.unwrap();
        server.await.unwrap();
    }
}
