//! Controller authentication on the control connection
//!
//! The tunnel core treats authentication as pluggable: a rejected control
//! connection is closed and nothing is attached.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// How long a connecting controller gets to answer the challenge
pub const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Challenge line sent to a connecting controller
const CHALLENGE: &[u8] = b"tunnelmux-auth\n";

/// Upper bound on a token reply line
const MAX_TOKEN_LEN: usize = 256;

/// Decides whether a new control connection may attach a tunnel
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// Run the authentication exchange on a fresh control connection.
    /// `Ok(false)` means reject: the caller closes the socket and attaches
    /// nothing.
    async fn authenticate(&self, stream: &mut TcpStream) -> io::Result<bool>;
}

/// Shared-token challenge/response authenticator
pub struct TokenAuthenticator {
    token: String,
}

impl TokenAuthenticator {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    /// Controller-side counterpart: answer the forwarder's challenge with
    /// the shared token. Run this before handing the stream to
    /// [`TunnelTransport::attach`](crate::tunnel::TunnelTransport::attach).
    pub async fn respond(stream: &mut TcpStream, token: &str) -> io::Result<()> {
        read_line(stream).await?;
        stream.write_all(token.as_bytes()).await?;
        stream.write_all(b"\n").await?;
        Ok(())
    }
}

#[async_trait]
impl Authenticator for TokenAuthenticator {
    async fn authenticate(&self, stream: &mut TcpStream) -> io::Result<bool> {
        stream.write_all(CHALLENGE).await?;
        let reply = timeout(AUTH_TIMEOUT, read_line(stream))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "authentication timed out"))??;
        Ok(reply == self.token)
    }
}

/// Read a '\n'-terminated line one byte at a time. Byte-at-a-time keeps the
/// read from swallowing frame bytes that may follow the token on the same
/// socket.
async fn read_line(stream: &mut TcpStream) -> io::Result<String> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if line.len() > MAX_TOKEN_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "authentication line too long",
            ));
        }
        if stream.read(&mut byte).await? == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
    }

    String::from_utf8(line)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "non-utf8 authentication line"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn socket_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (server, client)
    }

    #[tokio::test]
    async fn test_matching_token_is_accepted() {
        let (mut server, mut client) = socket_pair().await;
        let auth = TokenAuthenticator::new("keep-the-secret");

        let responder = tokio::spawn(async move {
            TokenAuthenticator::respond(&mut client, "keep-the-secret")
                .await
                .unwrap();
        });

        assert!(auth.authenticate(&mut server).await.unwrap());
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn test_wrong_token_is_rejected() {
        let (mut server, mut client) = socket_pair().await;
        let auth = TokenAuthenticator::new("keep-the-secret");

        let responder = tokio::spawn(async move {
            TokenAuthenticator::respond(&mut client, "guessed-wrong")
                .await
                .unwrap();
        });

        assert!(!auth.authenticate(&mut server).await.unwrap());
        responder.await.unwrap();
    }
}
