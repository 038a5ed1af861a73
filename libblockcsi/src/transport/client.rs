//! Client used by tooling and tests to issue CSI requests over the plugin
//! socket.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

use super::codec::{read_frame, write_frame};
use super::Endpoint;
use crate::error::CsiError;
use crate::message::{CsiMessage, CsiRequest};

trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// One connection; requests on it are answered in order.
pub struct CsiClient {
    stream: Mutex<Box<dyn Stream>>,
}

impl CsiClient {
    pub async fn connect(endpoint: &Endpoint) -> Result<Self, CsiError> {
        let stream: Box<dyn Stream> = match endpoint {
            Endpoint::Unix(path) => {
                Box::new(UnixStream::connect(path).await.map_err(CsiError::transport)?)
            }
            Endpoint::Tcp(addr) => {
                Box::new(TcpStream::connect(addr).await.map_err(CsiError::transport)?)
            }
        };
        debug!(%endpoint, "CSI connection established");
        Ok(Self {
            stream: Mutex::new(stream),
        })
    }

    /// Send a request and wait for its response.  Error responses come
    /// back as `Ok(CsiMessage::Error(_))`; use
    /// [`CsiMessage::into_result`] to lift them.
    #[instrument(skip(self), fields(msg = %msg))]
    pub async fn request(&self, msg: CsiMessage) -> Result<CsiMessage, CsiError> {
        self.send(CsiRequest::new(msg)).await
    }

    /// Like [`request`](Self::request), asking the server to give up after
    /// `timeout`.
    pub async fn request_with_timeout(
        &self,
        msg: CsiMessage,
        timeout: Duration,
    ) -> Result<CsiMessage, CsiError> {
        self.send(CsiRequest::with_timeout(msg, timeout)).await
    }

    async fn send(&self, request: CsiRequest) -> Result<CsiMessage, CsiError> {
        let mut stream = self.stream.lock().await;
        write_frame(&mut *stream, &request).await?;
        let response: CsiMessage = read_frame(&mut *stream)
            .await?
            .ok_or_else(|| CsiError::TransportError("server closed the connection".into()))?;
        debug!(%response, "CSI response received");
        Ok(response)
    }
}
