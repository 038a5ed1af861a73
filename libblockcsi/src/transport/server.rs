//! Socket server that hands every request frame to a [`Driver`].

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::codec::{read_frame, write_frame};
use super::Endpoint;
use crate::driver::Driver;
use crate::error::CsiError;
use crate::message::CsiRequest;

enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

pub struct CsiServer {
    listener: Listener,
    endpoint: Endpoint,
    driver: Arc<Driver>,
}

impl CsiServer {
    /// Bind `endpoint`.  A stale unix socket left by a previous run is
    /// removed first.
    pub async fn bind(endpoint: Endpoint, driver: Arc<Driver>) -> Result<Self, CsiError> {
        let listener = match &endpoint {
            Endpoint::Unix(path) => {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => debug!(path = %path.display(), "removed stale socket"),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(CsiError::transport(e)),
                }
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(CsiError::transport)?;
                }
                Listener::Unix(UnixListener::bind(path).map_err(CsiError::transport)?)
            }
            Endpoint::Tcp(addr) => {
                Listener::Tcp(TcpListener::bind(addr).await.map_err(CsiError::transport)?)
            }
        };
        info!(%endpoint, "CSI server listening");
        Ok(Self {
            listener,
            endpoint,
            driver,
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Local TCP address, when listening on TCP.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Listener::Tcp(l) => l.local_addr().ok(),
            Listener::Unix(_) => None,
        }
    }

    /// Accept connections until `cancel` fires.  Each connection runs on
    /// its own task and is dropped at shutdown.
    pub async fn serve(self, cancel: CancellationToken) -> Result<(), CsiError> {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.accept(&cancel) => {
                    if let Err(e) = accepted {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
        }
        if let Endpoint::Unix(path) = &self.endpoint {
            let _ = tokio::fs::remove_file(path).await;
        }
        info!(endpoint = %self.endpoint, "CSI server stopped");
        Ok(())
    }

    async fn accept(&self, cancel: &CancellationToken) -> Result<(), CsiError> {
        let driver = Arc::clone(&self.driver);
        let cancel = cancel.child_token();
        match &self.listener {
            Listener::Unix(l) => {
                let (stream, _) = l.accept().await.map_err(CsiError::transport)?;
                tokio::spawn(serve_connection(stream, driver, cancel));
            }
            Listener::Tcp(l) => {
                let (stream, remote) = l.accept().await.map_err(CsiError::transport)?;
                debug!(%remote, "connection accepted");
                tokio::spawn(serve_connection(stream, driver, cancel));
            }
        }
        Ok(())
    }
}

/// Answer request frames on one connection until it closes.
#[instrument(skip_all)]
async fn serve_connection<S>(mut stream: S, driver: Arc<Driver>, cancel: CancellationToken)
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    loop {
        let request: CsiRequest = tokio::select! {
            _ = cancel.cancelled() => return,
            frame = read_frame(&mut stream) => match frame {
                Ok(Some(req)) => req,
                Ok(None) => {
                    debug!("connection closed");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "dropping connection");
                    return;
                }
            },
        };

        debug!(request = %request.message, "CSI request received");
        let response = driver.handle(request).await;
        if let Err(e) = write_frame(&mut stream, &response).await {
            warn!(error = %e, "failed to write response");
            return;
        }
    }
}
