use std::{
    future::Future,
    net::{Ipv4Addr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use anyhow::{Context, Result};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    DEFAULT_FILE_PORT, DEFAULT_MESSAGE_PORT,
    broadcast::BroadcastEngine,
    frame::DEFAULT_MAX_FRAME_LEN,
    relay::{RelayEngine, RelayRegistry},
    roster::Roster,
};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub message_addr: SocketAddr,
    pub file_addr: SocketAddr,
    pub max_frame_len: usize,
    /// How long shutdown waits for file connections before closing them.
    /// `None` waits for as long as they stay open.
    pub drain_timeout: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            message_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_MESSAGE_PORT)),
            file_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_FILE_PORT)),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            drain_timeout: None,
        }
    }
}

pub struct Server {
    broadcast: BroadcastEngine,
    relay: RelayEngine,
    roster: Arc<Roster>,
    relays: Arc<RelayRegistry>,
    drain_timeout: Option<Duration>,
}

impl Server {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        let socket = UdpSocket::bind(config.message_addr)
            .await
            .with_context(|| format!("failed to bind message channel on {}", config.message_addr))?;
        let listener = TcpListener::bind(config.file_addr)
            .await
            .with_context(|| format!("failed to bind file channel on {}", config.file_addr))?;

        let roster = Arc::new(Roster::new());
        let relays = Arc::new(RelayRegistry::new());

        Ok(Self {
            broadcast: BroadcastEngine::new(socket, Arc::clone(&roster), Arc::clone(&relays)),
            relay: RelayEngine::new(listener, Arc::clone(&relays), config.max_frame_len),
            roster,
            relays,
            drain_timeout: config.drain_timeout,
        })
    }

    pub fn message_addr(&self) -> std::io::Result<SocketAddr> {
        self.broadcast.local_addr()
    }

    pub fn file_addr(&self) -> std::io::Result<SocketAddr> {
        self.relay.local_addr()
    }

    pub fn roster(&self) -> Arc<Roster> {
        Arc::clone(&self.roster)
    }

    pub fn relays(&self) -> Arc<RelayRegistry> {
        Arc::clone(&self.relays)
    }

    /// Serves both channels until `shutdown` resolves, then stops accepting
    /// and waits for open file connections to drain before returning.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            broadcast,
            relay,
            relays,
            drain_timeout,
            ..
        } = self;

        let stop = CancellationToken::new();
        let messages = tokio::spawn(broadcast.run(stop.child_token()));
        let files = tokio::spawn(relay.run(stop.child_token()));

        shutdown.await;
        info!("server shutting down");
        stop.cancel();

        messages.await.context("message channel task failed")?;
        files.await.context("file channel task failed")?;
        drain(&relays, drain_timeout).await;

        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

async fn drain(relays: &RelayRegistry, timeout: Option<Duration>) {
    let open = relays.len().await;
    if open == 0 {
        return;
    }

    info!(open, "waiting for file connections to close");
    match timeout {
        None => relays.wait_drained().await,
        Some(limit) => {
            if tokio::time::timeout(limit, relays.wait_drained()).await.is_err() {
                let open = relays.len().await;
                warn!(open, "drain timeout elapsed, closing file connections");
                relays.close_all().await;
                relays.wait_drained().await;
            }
        }
    }
    info!("all file connections closed");
}
