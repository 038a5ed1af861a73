//! Socket transport for CSI messages.
//!
//! The plugin listens on a unix socket (the usual CSI deployment) or a TCP
//! address.  Each connection carries a sequence of request/response pairs,
//! each one a length-prefixed JSON frame (see [`codec`]).

pub mod client;
pub mod codec;
pub mod server;

use std::fmt;
use std::path::PathBuf;

use crate::error::CsiError;

pub use client::CsiClient;
pub use server::CsiServer;

/// Where the plugin listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix://{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
        }
    }
}

/// Parse `unix:///path`, `unix:/path`, `tcp://host:port` or a bare
/// absolute path.
pub fn parse_endpoint(raw: &str) -> Result<Endpoint, CsiError> {
    let raw = raw.trim();
    if let Some(rest) = raw.strip_prefix("unix://").or_else(|| raw.strip_prefix("unix:")) {
        if rest.is_empty() {
            return Err(CsiError::InvalidArgument(format!("empty socket path in {raw:?}")));
        }
        return Ok(Endpoint::Unix(PathBuf::from(rest)));
    }
    if let Some(rest) = raw.strip_prefix("tcp://") {
        if rest.is_empty() {
            return Err(CsiError::InvalidArgument(format!("empty address in {raw:?}")));
        }
        return Ok(Endpoint::Tcp(rest.to_owned()));
    }
    if raw.starts_with('/') {
        return Ok(Endpoint::Unix(PathBuf::from(raw)));
    }
    Err(CsiError::InvalidArgument(format!(
        "unsupported endpoint {raw:?}, expected unix:// or tcp://"
    )))
}
