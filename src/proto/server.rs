use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::connection::{AuthPolicy, Connection, RequestHandler};
use crate::error::Result;

/// TCP accept loop binding each peer to the daemon's request handler.
pub struct Server {
    listener: TcpListener,
    auth: AuthPolicy,
}

impl Server {
    pub async fn bind(addr: &str, auth: AuthPolicy) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, auth })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn serve(
        self,
        handler: Arc<dyn RequestHandler>,
        shutdown: CancellationToken,
    ) -> Result<()> {
        tracing::info!(addr = %self.listener.local_addr()?, "listening");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("accept loop stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(%peer, "peer connected");
                        Connection::accept(stream, peer, self.auth.clone(), handler.clone());
                    }
                    Err(e) => tracing::warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}
