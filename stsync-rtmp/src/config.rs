use std::fs::File;
use std::io::{self, Read};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;

use crate::rtmp::handshake::Options;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read config: {0}")]
    Io(#[from] io::Error),
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {reason}")]
    Invalid {
        key: &'static str,
        reason: &'static str,
    },
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub rtmp: Rtmp,
}

impl Config {
    pub fn from_file<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<Path>,
    {
        let mut file = File::open(path)?;

        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let config: Self = toml::from_slice(&buf)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), Error> {
        match self.rtmp.max_connections {
            Some(0) => {
                return Err(Error::Invalid {
                    key: "max-connections",
                    reason: "must be at least 1",
                })
            }
            Some(n) if n > Semaphore::MAX_PERMITS => {
                return Err(Error::Invalid {
                    key: "max-connections",
                    reason: "too large",
                })
            }
            _ => (),
        }

        if self.rtmp.handshake_timeout == Some(0) {
            return Err(Error::Invalid {
                key: "handshake-timeout",
                reason: "must be at least 1 second",
            });
        }

        if self.rtmp.backlog == 0 {
            return Err(Error::Invalid {
                key: "backlog",
                reason: "must be at least 1",
            });
        }

        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Rtmp {
    pub bind: SocketAddr,
    pub backlog: u32,
    /// Maximum number of concurrent connections. Unbounded if `None`.
    pub max_connections: Option<usize>,
    /// Timeout in seconds for each handshake read or write.
    pub handshake_timeout: Option<u64>,
    /// Reject clients whose C2 is not a copy of S1.
    pub validate_c2: bool,
}

impl Default for Rtmp {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], 1935)),
            backlog: 1024,
            max_connections: None,
            handshake_timeout: None,
            validate_c2: false,
        }
    }
}

impl From<&Rtmp> for Options {
    fn from(src: &Rtmp) -> Self {
        Self {
            timeout: src.handshake_timeout.map(Duration::from_secs),
            validate_c2: src.validate_c2,
        }
    }
}
