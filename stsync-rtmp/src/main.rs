use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use config::Config;
use rtmp::random::OsRandom;
use rtmp::server::Server;
use rtmp::state::State;
use session::DiscardSession;
use signal::SHUTDOWN;

mod config;
mod metrics;
mod rtmp;
mod session;
mod signal;

#[derive(Clone, Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to the configuration file. Defaults are used if omitted.
    #[arg(long, short = 'c')]
    pub config: Option<PathBuf>,
    /// The address to listen on.
    #[arg(long, short = 'b')]
    pub bind: Option<SocketAddr>,
    /// The maximum number of concurrent connections.
    #[arg(long)]
    pub max_connections: Option<usize>,
    /// Timeout in seconds for each handshake read or write.
    #[arg(long)]
    pub handshake_timeout: Option<u64>,
    /// Reject clients whose C2 does not echo S1.
    #[arg(long)]
    pub validate_c2: bool,
}

impl Args {
    /// Overrides values in `config` with the ones given on the command line.
    pub fn apply(&self, config: &mut Config) {
        if let Some(bind) = self.bind {
            config.rtmp.bind = bind;
        }

        if let Some(n) = self.max_connections {
            config.rtmp.max_connections = Some(n);
        }

        if let Some(secs) = self.handshake_timeout {
            config.rtmp.handshake_timeout = Some(secs);
        }

        if self.validate_c2 {
            config.rtmp.validate_c2 = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    pretty_env_logger::init();
    signal::init();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    args.apply(&mut config);
    config.validate()?;

    let state = State::new(config, OsRandom, DiscardSession);
    Server::new(state)?.serve(&SHUTDOWN).await?;

    Ok(())
}
