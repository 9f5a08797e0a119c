//! Real-Time Messaging Protocol (RTMP) handshake server.
//!
//! Only the connection handshake is implemented. The byte stream following the handshake is
//! passed on to a [`SessionManager`](crate::session::SessionManager) without any framing.
//!
//! See section 5.2 of the Adobe RTMP specification.

pub mod conn;
pub mod handshake;
pub mod random;
pub mod server;
pub mod state;

use std::fmt::{self, Display, Formatter};
use std::io;

/// The only supported protocol version, sent in C0 and S0.
///
/// Values 0-2 are deprecated, 4-31 are reserved and 32-255 are not allowed (to distinguish RTMP
/// from text-based protocols).
pub const RTMP_VERSION: u8 = 3;

/// Size of the C1, S1, C2 and S2 packets.
pub const HANDSHAKE_SIZE: usize = 1536;

/// An opaque handshake payload. C1 and S1 carry a time and a zero field in the first 8 bytes,
/// those are not interpreted and handled as part of the random data.
pub type Nonce = [u8; HANDSHAKE_SIZE];

/// An I/O step of the handshake.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    ReadC0C1,
    WriteS0S1,
    WriteS2,
    ReadC2,
}

impl Display for Phase {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::ReadC0C1 => "C0/C1",
            Self::WriteS0S1 => "S0/S1",
            Self::WriteS2 => "S2",
            Self::ReadC2 => "C2",
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("connection closed while reading {0}")]
    ConnectionClosed(Phase),
    #[error("failed to read {phase}: {source}")]
    Read {
        phase: Phase,
        #[source]
        source: io::Error,
    },
    #[error("unsupported version {got}, expected {}", RTMP_VERSION)]
    VersionMismatch { got: u8 },
    #[error("failed to generate S1: {0}")]
    RandomGeneration(#[from] rand::Error),
    #[error("failed to write {phase}: {source}")]
    Write {
        phase: Phase,
        #[source]
        source: io::Error,
    },
    #[error("C2 does not echo S1")]
    EchoMismatch,
    #[error("timed out on {0}")]
    Timeout(Phase),
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub(crate) fn read(phase: Phase, err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::UnexpectedEof => Self::ConnectionClosed(phase),
            _ => Self::Read { phase, source: err },
        }
    }

    pub(crate) fn write(phase: Phase, err: io::Error) -> Self {
        Self::Write { phase, source: err }
    }
}
