//! Server side of the RTMP handshake.
//!
//! ```text
//! Client                               Server
//!   |  C0 (version) + C1 (1536 bytes)    |
//!   |----------------------------------->|  validate version
//!   |  S0 (version) + S1 (1536 bytes)    |
//!   |<-----------------------------------|
//!   |  S2 (echo of C1)                   |
//!   |<-----------------------------------|
//!   |  C2 (echo of S1)                   |
//!   |----------------------------------->|  done
//! ```
//!
//! The server waits for C0 and C1 before sending anything, so a client with an unsupported
//! version never receives a single byte.

use std::future::Future;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::random::RandomSource;
use super::{Error, Nonce, Phase, HANDSHAKE_SIZE, RTMP_VERSION};

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Upper bound for every single read or write. `None` waits forever.
    pub timeout: Option<Duration>,
    /// Fail the handshake if C2 is not an exact copy of S1.
    pub validate_c2: bool,
}

/// A completed handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Handshake {
    pub version: u8,
    /// Whether the C2 sent by the client matched our S1.
    pub echo_matches: bool,
}

/// State of a single handshake. Dropped once the handshake is done.
struct HandshakeState {
    /// C0 followed by C1.
    c0c1: Box<[u8; 1 + HANDSHAKE_SIZE]>,
    /// S0 followed by S1.
    s0s1: Box<[u8; 1 + HANDSHAKE_SIZE]>,
}

impl HandshakeState {
    fn new() -> Self {
        Self {
            c0c1: Box::new([0; 1 + HANDSHAKE_SIZE]),
            s0s1: Box::new([0; 1 + HANDSHAKE_SIZE]),
        }
    }

    fn version(&self) -> u8 {
        self.c0c1[0]
    }

    fn client_nonce(&self) -> &[u8] {
        &self.c0c1[1..]
    }

    fn server_nonce(&self) -> &[u8] {
        &self.s0s1[1..]
    }
}

/// Performs the server side of the handshake on `stream`.
///
/// The handshake fails on the first error and never retries. On failure the stream should be
/// closed, the remote peer is not informed about the reason.
pub async fn handshake<S, R>(stream: &mut S, rng: &R, opts: Options) -> Result<Handshake, Error>
where
    S: AsyncRead + AsyncWrite + Unpin,
    R: RandomSource + ?Sized,
{
    let mut state = HandshakeState::new();

    tracing::trace!("Waiting for C0/C1");
    deadline(opts.timeout, Phase::ReadC0C1, async {
        stream
            .read_exact(&mut state.c0c1[..])
            .await
            .map_err(|err| Error::read(Phase::ReadC0C1, err))
    })
    .await?;

    if state.version() != RTMP_VERSION {
        return Err(Error::VersionMismatch {
            got: state.version(),
        });
    }

    state.s0s1[0] = RTMP_VERSION;
    rng.fill(&mut state.s0s1[1..])?;

    tracing::trace!("Sending S0/S1");
    deadline(opts.timeout, Phase::WriteS0S1, async {
        stream
            .write_all(&state.s0s1[..])
            .await
            .map_err(|err| Error::write(Phase::WriteS0S1, err))
    })
    .await?;

    tracing::trace!("Sending S2");
    deadline(opts.timeout, Phase::WriteS2, async {
        stream
            .write_all(state.client_nonce())
            .await
            .map_err(|err| Error::write(Phase::WriteS2, err))?;

        stream
            .flush()
            .await
            .map_err(|err| Error::write(Phase::WriteS2, err))
    })
    .await?;

    tracing::trace!("Waiting for C2");
    let mut c2: Box<Nonce> = Box::new([0; HANDSHAKE_SIZE]);
    deadline(opts.timeout, Phase::ReadC2, async {
        stream
            .read_exact(&mut c2[..])
            .await
            .map_err(|err| Error::read(Phase::ReadC2, err))
    })
    .await?;

    let echo_matches = c2[..] == *state.server_nonce();
    if !echo_matches {
        if opts.validate_c2 {
            return Err(Error::EchoMismatch);
        }

        tracing::debug!("C2 does not echo S1, ignoring");
    }

    Ok(Handshake {
        version: state.version(),
        echo_matches,
    })
}

/// Runs `fut`, failing with [`Error::Timeout`] if it does not complete within `timeout`.
async fn deadline<F, T>(timeout: Option<Duration>, phase: Phase, fut: F) -> Result<T, Error>
where
    F: Future<Output = Result<T, Error>>,
{
    match timeout {
        Some(timeout) => match tokio::time::timeout(timeout, fut).await {
            Ok(res) => res,
            Err(_) => Err(Error::Timeout(phase)),
        },
        None => fut.await,
    }
}
