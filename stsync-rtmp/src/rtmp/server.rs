use std::io;
use std::net::SocketAddr;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::poll_fn;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, TcpStream};

use super::conn::Connection;
use super::state::State;
use crate::signal::Shutdown;

/// Pause after a failed accept. Errors like `EMFILE` persist until other connections are
/// closed and would otherwise be retried in a busy loop.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("listener failed: {0}")]
    Listener(io::Error),
}

/// A source of incoming TCP connections.
pub trait Accept: Send + Sync + 'static {
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Accept for TcpListener {
    #[inline]
    fn poll_accept(&self, cx: &mut Context<'_>) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
        TcpListener::poll_accept(self, cx)
    }

    #[inline]
    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

pub struct Server<L = TcpListener> {
    pub state: State,
    listener: L,
}

impl Server {
    /// Binds the listener configured in `state`. Must be called from within a tokio runtime.
    pub fn new(state: State) -> Result<Self, Error> {
        let addr = state.config.rtmp.bind;
        let backlog = state.config.rtmp.backlog;

        let listener = bind(addr, backlog).map_err(|source| Error::Bind { addr, source })?;
        let server = Self::from_listener(state, listener);

        tracing::info!(
            "Rtmp socket listening on {} (backlog {})",
            server.local_addr().map_err(Error::Listener)?,
            backlog
        );

        Ok(server)
    }
}

impl<L> Server<L>
where
    L: Accept,
{
    pub fn from_listener(state: State, listener: L) -> Self {
        match &state.slots {
            Some(slots) => {
                tracing::info!("Accepting at most {} connections", slots.available_permits())
            }
            None => tracing::warn!("No connection limit configured, accepting without bound"),
        }

        Self { state, listener }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections until `shutdown` is triggered, then waits for all connections to
    /// close.
    ///
    /// Only a failure of the listening socket itself ends the accept loop early. In that case
    /// connections that are already open are left running.
    pub async fn serve(self, shutdown: &'static Shutdown) -> Result<(), Error> {
        self.accept_loop(shutdown).await?;

        shutdown.wait().await;
        tracing::info!("Rtmp server stopped: {}", self.state.metrics);
        Ok(())
    }

    async fn accept_loop(&self, shutdown: &'static Shutdown) -> Result<(), Error> {
        let listener = shutdown.listen();
        tokio::pin!(listener);

        loop {
            let permit = match &self.state.slots {
                Some(slots) => tokio::select! {
                    permit = slots.clone().acquire_owned() => match permit {
                        Ok(permit) => Some(permit),
                        // The semaphore is never closed.
                        Err(_) => return Ok(()),
                    },
                    _ = &mut listener => return Ok(()),
                },
                None => None,
            };

            let (stream, peer) = tokio::select! {
                res = poll_fn(|cx| self.listener.poll_accept(cx)) => match res {
                    Ok(conn) => conn,
                    Err(err) if is_fatal(&err) => {
                        tracing::error!("Failed to accept connection: {}", err);
                        return Err(Error::Listener(err));
                    }
                    Err(err) => {
                        self.state.metrics.accept_errors.inc();
                        tracing::warn!(
                            "Failed to accept connection: {}, retrying in {:?}",
                            err,
                            ACCEPT_BACKOFF
                        );

                        tokio::select! {
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => continue,
                            _ = &mut listener => return Ok(()),
                        }
                    }
                },
                _ = &mut listener => return Ok(()),
            };

            let id = self.state.next_id();
            self.state.metrics.connections_accepted.inc();

            if let Err(err) = stream.set_nodelay(true) {
                tracing::debug!("[{}] Failed to set TCP_NODELAY: {}", id, err);
            }

            let conn = Connection::new(id, peer, stream, permit);
            tokio::task::spawn(conn.serve(self.state.clone(), shutdown.listen()));
        }
    }
}

fn bind(addr: SocketAddr, backlog: u32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.try_into().unwrap_or(i32::MAX))?;

    TcpListener::from_std(socket.into())
}

/// Returns `true` if the error is caused by the listening socket itself rather than by the
/// connection that was being accepted.
#[cfg(unix)]
fn is_fatal(err: &io::Error) -> bool {
    use nix::errno::Errno;

    match err.raw_os_error() {
        Some(code) => matches!(
            Errno::from_i32(code),
            Errno::EBADF | Errno::ENOTSOCK | Errno::EINVAL | Errno::EOPNOTSUPP
        ),
        None => false,
    }
}

#[cfg(not(unix))]
fn is_fatal(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::InvalidInput
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::{Duration, Instant};

    use rand::RngCore;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use futures::future::BoxFuture;
    use futures::FutureExt;
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use super::{is_fatal, Accept, Error, Server, ACCEPT_BACKOFF};
    use crate::config::Config;
    use crate::metrics::Counter;
    use crate::rtmp::handshake::Handshake;
    use crate::rtmp::random::OsRandom;
    use crate::rtmp::state::State;
    use crate::rtmp::{HANDSHAKE_SIZE, RTMP_VERSION};
    use crate::session::{DiscardSession, SessionManager, Upgraded};
    use crate::signal::Shutdown;

    fn start(
        config: Config,
        shutdown: &'static Shutdown,
    ) -> (SocketAddr, State, JoinHandle<Result<(), Error>>) {
        let server = Server::new(State::new(config, OsRandom, DiscardSession)).unwrap();
        let addr = server.local_addr().unwrap();
        let state = server.state.clone();
        (addr, state, tokio::task::spawn(server.serve(shutdown)))
    }

    fn local_config() -> Config {
        let mut config = Config::default();
        config.rtmp.bind = SocketAddr::from(([127, 0, 0, 1], 0));
        config
    }

    /// Runs the client side of the handshake and returns the open stream.
    async fn client_handshake(addr: SocketAddr) -> io::Result<TcpStream> {
        let mut stream = TcpStream::connect(addr).await?;

        let mut c0c1 = vec![0; 1 + HANDSHAKE_SIZE];
        c0c1[0] = RTMP_VERSION;
        rand::thread_rng().fill_bytes(&mut c0c1[1..]);
        stream.write_all(&c0c1).await?;

        let mut resp = vec![0; 1 + HANDSHAKE_SIZE * 2];
        stream.read_exact(&mut resp).await?;
        assert_eq!(resp[0], RTMP_VERSION);
        assert_eq!(&resp[1 + HANDSHAKE_SIZE..], &c0c1[1..]);

        stream.write_all(&resp[1..1 + HANDSHAKE_SIZE]).await?;
        Ok(stream)
    }

    async fn wait_for(counter: &Counter, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while counter.get() < n {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_handshakes() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let (addr, state, handle) = start(local_config(), &SHUTDOWN);

        let clients: Vec<_> = (0..100)
            .map(|_| tokio::task::spawn(client_handshake(addr)))
            .collect();

        let mut streams = Vec::new();
        for client in clients {
            streams.push(client.await.unwrap().unwrap());
        }

        wait_for(&state.metrics.handshakes_completed, 100).await;
        assert_eq!(state.metrics.connections_accepted.get(), 100);
        assert_eq!(state.metrics.handshakes_failed.get(), 0);
        assert_eq!(state.metrics.connections_active.get(), 100);

        SHUTDOWN.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(state.metrics.connections_active.get(), 0);

        // Sessions are closed on shutdown.
        for mut stream in streams {
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).await.unwrap();
            assert!(buf.is_empty());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_failure_is_isolated() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let (addr, state, handle) = start(local_config(), &SHUTDOWN);

        // Stalls in the middle of the handshake.
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(&[RTMP_VERSION; 100]).await.unwrap();

        let mut bad = TcpStream::connect(addr).await.unwrap();
        let mut c0c1 = vec![0; 1 + HANDSHAKE_SIZE];
        c0c1[0] = 6;
        bad.write_all(&c0c1).await.unwrap();

        let mut resp = Vec::new();
        bad.read_to_end(&mut resp).await.unwrap();
        assert!(resp.is_empty());

        // The acceptor keeps going.
        let _a = client_handshake(addr).await.unwrap();
        let _b = client_handshake(addr).await.unwrap();

        wait_for(&state.metrics.handshakes_completed, 2).await;
        assert_eq!(state.metrics.handshakes_failed.get(), 1);
        assert_eq!(state.metrics.connections_accepted.get(), 4);

        // Shutdown cancels the pending handshake.
        SHUTDOWN.trigger();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(state.metrics.handshakes_failed.get(), 2);

        let mut resp = Vec::new();
        stalled.read_to_end(&mut resp).await.unwrap();
        assert!(resp.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handshake_timeout() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let mut config = local_config();
        config.rtmp.handshake_timeout = Some(1);
        let (addr, state, handle) = start(config, &SHUTDOWN);

        let mut stalled = TcpStream::connect(addr).await.unwrap();

        let mut resp = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), stalled.read_to_end(&mut resp))
            .await
            .unwrap()
            .unwrap();
        assert!(resp.is_empty());
        assert_eq!(state.metrics.handshakes_failed.get(), 1);

        SHUTDOWN.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connection_limit() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let mut config = local_config();
        config.rtmp.max_connections = Some(1);
        let (addr, state, handle) = start(config, &SHUTDOWN);

        // Occupies the only slot.
        let first = TcpStream::connect(addr).await.unwrap();
        wait_for(&state.metrics.connections_accepted, 1).await;

        let second = tokio::task::spawn(client_handshake(addr));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());
        assert_eq!(state.metrics.connections_accepted.get(), 1);

        drop(first);
        let _second = tokio::time::timeout(Duration::from_secs(5), second)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(state.metrics.connections_accepted.get(), 2);

        SHUTDOWN.trigger();
        handle.await.unwrap().unwrap();
    }

    /// Reports the handshake of every upgraded connection and keeps it open.
    struct RecordingSession(mpsc::UnboundedSender<(SocketAddr, Handshake)>);

    impl SessionManager for RecordingSession {
        fn start(&self, mut conn: Upgraded) -> BoxFuture<'static, ()> {
            let _ = self.0.send((conn.peer, conn.handshake));

            async move {
                let mut buf = Vec::new();
                let _ = conn.stream.read_to_end(&mut buf).await;
            }
            .boxed()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_session_receives_handshake() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let state = State::new(local_config(), OsRandom, RecordingSession(tx));
        let server = Server::new(state).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = tokio::task::spawn(server.serve(&SHUTDOWN));

        let stream = client_handshake(addr).await.unwrap();
        let (peer, handshake) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(peer, stream.local_addr().unwrap());
        assert_eq!(
            handshake,
            Handshake {
                version: RTMP_VERSION,
                echo_matches: true,
            }
        );

        // C2 that does not echo S1 is accepted with validation disabled.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut c0c1 = vec![0; 1 + HANDSHAKE_SIZE];
        c0c1[0] = RTMP_VERSION;
        stream.write_all(&c0c1).await.unwrap();

        let mut resp = vec![0; 1 + HANDSHAKE_SIZE * 2];
        stream.read_exact(&mut resp).await.unwrap();
        stream.write_all(&[0xff; HANDSHAKE_SIZE]).await.unwrap();

        let (_, handshake) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(!handshake.echo_matches);

        SHUTDOWN.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_in_use() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let (addr, _, handle) = start(local_config(), &SHUTDOWN);

        let mut config = local_config();
        config.rtmp.bind = addr;
        let res = Server::new(State::new(config, OsRandom, DiscardSession));
        assert!(matches!(res, Err(Error::Bind { .. })));

        SHUTDOWN.trigger();
        handle.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_is_fatal() {
        assert!(!is_fatal(&io::ErrorKind::ConnectionAborted.into()));
        assert!(!is_fatal(&io::Error::from_raw_os_error(nix::libc::EMFILE)));
        assert!(is_fatal(&io::Error::from_raw_os_error(nix::libc::EBADF)));
    }

    /// Fails the first `errors` accepts with `EMFILE`, then accepts from `inner`.
    #[cfg(unix)]
    struct ExhaustedListener {
        inner: TcpListener,
        errors: Arc<AtomicUsize>,
    }

    #[cfg(unix)]
    impl Accept for ExhaustedListener {
        fn poll_accept(
            &self,
            cx: &mut Context<'_>,
        ) -> Poll<io::Result<(TcpStream, SocketAddr)>> {
            let prev = self
                .errors
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));

            match prev {
                Ok(_) => Poll::Ready(Err(io::Error::from_raw_os_error(nix::libc::EMFILE))),
                Err(_) => self.inner.poll_accept(cx),
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            self.inner.local_addr()
        }
    }

    #[cfg(unix)]
    async fn start_exhausted(
        errors: usize,
        shutdown: &'static Shutdown,
    ) -> (SocketAddr, State, JoinHandle<Result<(), Error>>) {
        let listener = ExhaustedListener {
            inner: TcpListener::bind("127.0.0.1:0").await.unwrap(),
            errors: Arc::new(AtomicUsize::new(errors)),
        };

        let server = Server::from_listener(
            State::new(local_config(), OsRandom, DiscardSession),
            listener,
        );
        let addr = server.local_addr().unwrap();
        let state = server.state.clone();
        (addr, state, tokio::task::spawn(server.serve(shutdown)))
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_error_backoff() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let (addr, state, handle) = start_exhausted(3, &SHUTDOWN).await;

        let start = Instant::now();
        let _stream = tokio::time::timeout(Duration::from_secs(5), client_handshake(addr))
            .await
            .unwrap()
            .unwrap();

        // Every failed accept is followed by a pause before the next attempt.
        assert!(start.elapsed() >= ACCEPT_BACKOFF * 2);
        assert_eq!(state.metrics.accept_errors.get(), 3);
        assert_eq!(state.metrics.connections_accepted.get(), 1);

        SHUTDOWN.trigger();
        handle.await.unwrap().unwrap();
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_accept_error_no_busy_loop() {
        static SHUTDOWN: Shutdown = Shutdown::new();
        let (_, state, handle) = start_exhausted(usize::MAX, &SHUTDOWN).await;

        tokio::time::sleep(Duration::from_millis(350)).await;
        let errors = state.metrics.accept_errors.get();
        assert!(errors >= 1 && errors <= 5, "{} accept attempts", errors);

        // Shutdown interrupts the pause.
        SHUTDOWN.trigger();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
