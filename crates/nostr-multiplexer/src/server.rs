//! WebSocket accept loop.
//!
//! Each client connection gets its own [`Multiplexer`] and upstream pool,
//! driven from a single task. Sessions share nothing but the connection
//! counter used for logging.

use crate::config::GatewayConfig;
use crate::error::{Result, is_benign};
use crate::pool::{PoolExecutor, RelayPool};
use crate::session::{BINARY_FRAME, Multiplexer};
use futures::{SinkExt, StreamExt};
use rand::Rng;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Multiplexing gateway server
pub struct GatewayServer {
    config: GatewayConfig,
    pid: String,
    connections: Arc<AtomicUsize>,
}

impl GatewayServer {
    pub fn new(config: GatewayConfig) -> Self {
        // Distinguishes log lines from several gateway processes.
        let pid = rand::rng().random_range(100_000..1_000_000).to_string();
        Self {
            config,
            pid,
            connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        info!(
            pid = %self.pid,
            "Multiplexer listening on {}",
            listener.local_addr()?
        );

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let count = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
                    info!(pid = %self.pid, conn_count = count, "Received connection from {}", addr);

                    let config = self.config.clone();
                    let connections = Arc::clone(&self.connections);
                    let pid = self.pid.clone();
                    tokio::spawn(async move {
                        let result = handle_connection(stream, addr, &config).await;

                        let count = connections.fetch_sub(1, Ordering::SeqCst) - 1;
                        info!(pid = %pid, conn_count = count, "Closing connection from {}", addr);

                        if let Err(e) = result {
                            let message = e.to_string();
                            if is_benign(&message) {
                                debug!("Connection from {} ended: {}", addr, message);
                            } else {
                                error!("Error handling connection from {}: {}", addr, message);
                            }
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

/// Drive one client connection until it closes or is ejected.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    config: &GatewayConfig,
) -> Result<()> {
    let ws_stream = accept_async(stream).await?;
    let (mut write, mut read) = ws_stream.split();

    let executor = PoolExecutor::new(RelayPool::new(config.connect_timeout));
    let (mut session, mut outbound_rx) = Multiplexer::new(executor, config.session());

    loop {
        tokio::select! {
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        debug!("Received message from {}: {}", addr, text.as_str());
                        session.handle_text(text.as_str());
                    }
                    Some(Ok(Message::Binary(_))) => session.reject_frame(BINARY_FRAME),
                    Some(Ok(Message::Ping(data))) => {
                        let _ = write.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("Client {} closed the connection", addr);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        let message = e.to_string();
                        if is_benign(&message) {
                            debug!("Received error on client socket {}: {}", addr, message);
                        } else {
                            warn!("Received error on client socket {}: {}", addr, message);
                        }
                        break;
                    }
                }
            }
            Some(event) = session.next_event() => session.handle_event(event),
            Some(frame) = outbound_rx.recv() => {
                if let Err(e) = write.send(Message::text(frame)).await {
                    debug!("Failed to write to {}: {}", addr, e);
                    break;
                }
            }
        }

        if session.is_closed() {
            break;
        }
    }

    debug!(
        "Releasing {} upstream connections for {}",
        session.executor().pool().len(),
        addr
    );
    session.cleanup();

    // Deliver whatever was queued before teardown, e.g. the final notice.
    while let Ok(frame) = outbound_rx.try_recv() {
        if write.send(Message::text(frame)).await.is_err() {
            return Ok(());
        }
    }
    let _ = write.send(Message::Close(None)).await;

    Ok(())
}
