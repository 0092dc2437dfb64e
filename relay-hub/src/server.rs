use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    net::{TcpListener, TcpStream},
    select,
};
use tracing::{debug, info, warn};

use crate::{
    message::{DEFAULT_MAX_FRAME_LEN, ServerFrame},
    registry::Registry,
    relay::{DEFAULT_BODY_TIMEOUT, DEFAULT_CHUNK_SIZE},
    router::Router,
    session::handle_connection,
};

pub const DEFAULT_OUTBOUND_QUEUE: usize = 1024;
pub const SHUTTING_DOWN: &str = "server shutting down";

/// Tunables shared by every session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Largest chunk copied in one step of a file relay.
    pub chunk_size: usize,
    /// Frames that may wait for one slow reader; later ones are dropped
    /// for that reader until it catches up.
    pub outbound_queue: usize,
    /// Longest accepted control line, excluding the terminator.
    pub max_frame_len: usize,
    /// How long a file body may go without new bytes before the transfer
    /// is abandoned and its sender disconnected.
    pub body_timeout: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            outbound_queue: DEFAULT_OUTBOUND_QUEUE,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            body_timeout: DEFAULT_BODY_TIMEOUT,
        }
    }
}

pub struct Server {
    listener: TcpListener,
    router: Router,
    config: Arc<RelayConfig>,
}

impl Server {
    pub fn new(listener: TcpListener, config: RelayConfig) -> Self {
        Self {
            listener,
            router: Router::new(Arc::new(Registry::new())),
            config: Arc::new(config),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            router,
            config,
        } = self;
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&router).await;
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &router, &config);
                }
            }
        }

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

async fn handle_shutdown(router: &Router) {
    info!("relay shutting down");
    router.broadcast(ServerFrame::error(SHUTTING_DOWN)).await;
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    router: &Router,
    config: &Arc<RelayConfig>,
) {
    match result {
        Ok((stream, peer)) => spawn_session(stream, peer, router, config),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_session(stream: TcpStream, peer: SocketAddr, router: &Router, config: &Arc<RelayConfig>) {
    let router = router.clone();
    let config = Arc::clone(config);
    tokio::spawn(async move {
        debug!(peer = %peer, "connection accepted");
        if let Err(err) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = ?err, "failed to disable nagle");
        }
        let (reader, writer) = stream.into_split();
        if let Err(err) = handle_connection(reader, writer, router, config).await {
            warn!(peer = %peer, error = ?err, "client connection closed with error");
        }
    });
}
