use std::net::SocketAddr;

use tokio::net::TcpStream;
use tokio::sync::OwnedSemaphorePermit;

use super::handshake::handshake;
use super::state::{ConnectionId, State};
use super::Error;
use crate::session::Upgraded;
use crate::signal::ShutdownListener;

/// A single accepted TCP connection.
///
/// The connection is closed when the `Connection` is dropped, unless it was handed over to the
/// [`SessionManager`](crate::session::SessionManager).
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    stream: TcpStream,
    /// Held until the connection is closed.
    _permit: Option<OwnedSemaphorePermit>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        peer: SocketAddr,
        stream: TcpStream,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            id,
            peer,
            stream,
            _permit: permit,
        }
    }

    /// Serves the connection until it is closed or `shutdown` resolves.
    ///
    /// Errors never leave this function, they only end this connection.
    pub async fn serve(mut self, state: State, shutdown: ShutdownListener) {
        tokio::pin!(shutdown);

        state.metrics.connections_active.inc();
        tracing::debug!("[{}] Accepted connection from {}", self.id, self.peer);

        let opts = state.handshake_options();
        let res = tokio::select! {
            res = handshake(&mut self.stream, &*state.rng, opts) => res,
            _ = &mut shutdown => Err(Error::Cancelled),
        };

        match res {
            Ok(hs) => {
                state.metrics.handshakes_completed.inc();
                tracing::debug!(
                    "[{}] Handshake with {} complete (version {}, C2 echo {})",
                    self.id,
                    self.peer,
                    hs.version,
                    if hs.echo_matches { "ok" } else { "mismatch" },
                );

                let id = self.id;
                let upgraded = Upgraded {
                    id: self.id,
                    peer: self.peer,
                    handshake: hs,
                    stream: self.stream,
                };

                tokio::select! {
                    _ = state.session_manager.start(upgraded) => (),
                    _ = &mut shutdown => {
                        tracing::debug!("[{}] Closing session on shutdown", id);
                    }
                }

                tracing::debug!("[{}] Connection closed", id);
            }
            Err(err) => {
                state.metrics.handshakes_failed.inc();
                tracing::debug!("[{}] Handshake with {} failed: {}", self.id, self.peer, err);
            }
        }

        state.metrics.connections_active.dec();
    }
}
