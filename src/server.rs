use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::frontend::{BuiltinCommands, FrontendConnection};
use crate::gateway::{Gateway, GatewayStats};
use crate::store::MemoryConnector;

// -----------------------------------------------------------------------------
// ----- Constants -------------------------------------------------------------

pub const DEFAULT_MAX_CONNECTIONS: usize = 20;

const LISTEN_BACKLOG: u32 = 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

// -----------------------------------------------------------------------------
// ----- ServerSettings --------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerSettings {
    /// Connections served at once; later ones wait in the listen backlog.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

// -----------------------------------------------------------------------------
// ----- Server ----------------------------------------------------------------

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    gateway: Arc<Gateway<MemoryConnector>>,
    commands: Arc<BuiltinCommands>,
    settings: ServerSettings,
}

// -----------------------------------------------------------------------------
// ----- Server: Static --------------------------------------------------------

impl Server {
    pub async fn bind(
        addr: SocketAddr,
        gateway: Arc<Gateway<MemoryConnector>>,
        commands: Arc<BuiltinCommands>,
        settings: ServerSettings,
    ) -> std::io::Result<Self> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };

        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;

        let listener = socket.listen(LISTEN_BACKLOG)?;

        Ok(Self {
            listener,
            gateway,
            commands,
            settings,
        })
    }
}

// -----------------------------------------------------------------------------
// ----- Server: Public --------------------------------------------------------

impl Server {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn gateway(&self) -> &Arc<Gateway<MemoryConnector>> {
        &self.gateway
    }

    /// Serves until `shutdown` resolves, then stops accepting, tells every
    /// connection to hang up, stops the janitor and shuts the gateway down.
    /// Returns the counters as they stood just before the pool closed.
    pub async fn run_until<F>(self, shutdown: F) -> std::io::Result<GatewayStats>
    where
        F: Future<Output = ()>,
    {
        let janitor = self.gateway.spawn_janitor();
        let slots = Arc::new(Semaphore::new(self.settings.max_connections.max(1)));
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        tokio::pin!(shutdown);

        info!(
            addr = %self.listener.local_addr()?,
            max_connections = self.settings.max_connections,
            "listening"
        );

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => {
                    info!("shutting down");
                    break;
                }

                accepted = accept_with_slot(&self.listener, &slots) => {
                    let (stream, peer, slot) = match accepted {
                        Ok(v) => v,
                        Err(e) => { error!("accept error: {e}"); continue; }
                    };

                    let _ = stream.set_nodelay(true);

                    let conn = FrontendConnection::new(
                        stream,
                        peer.to_string(),
                        self.gateway.clone(),
                        self.commands.clone(),
                        stop_rx.clone(),
                    );

                    connections.spawn(async move {
                        let _slot = slot;
                        if let Err(e) = conn.serve().await {
                            debug!("client {peer} error: {e}");
                        }
                    });
                }

                // Reap finished connections so the set does not grow unbounded.
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        drop(self.listener);
        let _ = stop_tx.send(true);

        if timeout(DRAIN_TIMEOUT, async { while connections.join_next().await.is_some() {} })
            .await
            .is_err()
        {
            warn!(
                remaining = connections.len(),
                "connections did not close in time; aborting them"
            );
            connections.shutdown().await;
        }

        janitor.stop().await;

        let stats = self.gateway.stats();
        self.gateway.shutdown();

        Ok(stats)
    }
}

// -----------------------------------------------------------------------------
// ----- Internal: Helpers -----------------------------------------------------

async fn accept_with_slot(
    listener: &TcpListener,
    slots: &Arc<Semaphore>,
) -> std::io::Result<(TcpStream, SocketAddr, OwnedSemaphorePermit)> {
    let slot = slots
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| std::io::Error::other("connection slots closed"))?;

    let (stream, peer) = listener.accept().await?;
    Ok((stream, peer, slot))
}
