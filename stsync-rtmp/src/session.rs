use std::net::SocketAddr;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::net::TcpStream;

use crate::rtmp::handshake::Handshake;
use crate::rtmp::state::ConnectionId;

/// A connection that completed the handshake.
///
/// The stream is positioned directly after C2. Everything read from it belongs to the chunk
/// stream.
#[derive(Debug)]
pub struct Upgraded {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub handshake: Handshake,
    pub stream: TcpStream,
}

/// Takes over connections after a successful handshake.
///
/// The returned future owns the connection. It is dropped, closing the connection, when the
/// server shuts down.
pub trait SessionManager: Send + Sync + 'static {
    fn start(&self, conn: Upgraded) -> BoxFuture<'static, ()>;
}

/// A [`SessionManager`] reading and discarding everything until the peer closes the
/// connection.
#[derive(Copy, Clone, Debug, Default)]
pub struct DiscardSession;

impl SessionManager for DiscardSession {
    fn start(&self, mut conn: Upgraded) -> BoxFuture<'static, ()> {
        async move {
            tracing::debug!(
                "[{}] Session started with {} (version {}, C2 echo {})",
                conn.id,
                conn.peer,
                conn.handshake.version,
                if conn.handshake.echo_matches {
                    "matches"
                } else {
                    "differs"
                }
            );

            match tokio::io::copy(&mut conn.stream, &mut tokio::io::sink()).await {
                Ok(n) => {
                    tracing::debug!("[{}] Discarded {} bytes from {}", conn.id, n, conn.peer)
                }
                Err(err) => {
                    tracing::debug!("[{}] Failed to read from {}: {}", conn.id, conn.peer, err)
                }
            }
        }
        .boxed()
    }
}
