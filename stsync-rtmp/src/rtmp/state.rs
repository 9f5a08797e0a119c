use std::fmt::{self, Display, Formatter};
use std::sync::Arc;

use snowflaked::sync::Generator;
use tokio::sync::Semaphore;

use super::handshake::Options;
use super::random::RandomSource;
use crate::config::Config;
use crate::metrics::ServerMetrics;
use crate::session::SessionManager;

/// State shared between the acceptor and all connections.
///
/// Besides the random source and the metrics nothing in here is mutated after startup.
#[derive(Clone)]
pub struct State {
    pub config: Arc<Config>,
    pub rng: Arc<dyn RandomSource>,
    pub session_manager: Arc<dyn SessionManager>,
    pub metrics: Arc<ServerMetrics>,
    /// Connection slots if `max-connections` is set.
    pub slots: Option<Arc<Semaphore>>,
    ids: Arc<Generator>,
}

impl State {
    pub fn new<R, M>(config: Config, rng: R, session_manager: M) -> Self
    where
        R: RandomSource + 'static,
        M: SessionManager,
    {
        let slots = config
            .rtmp
            .max_connections
            .map(|n| Arc::new(Semaphore::new(n)));

        Self {
            config: Arc::new(config),
            rng: Arc::new(rng),
            session_manager: Arc::new(session_manager),
            metrics: Arc::new(ServerMetrics::new()),
            slots,
            ids: Arc::new(Generator::new(0)),
        }
    }

    pub fn handshake_options(&self) -> Options {
        Options::from(&self.config.rtmp)
    }

    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.ids.generate())
    }
}

/// A unique id assigned to every accepted connection. Included in all log messages of that
/// connection.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnectionId(pub u64);

impl Display for ConnectionId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}
