use std::io;
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("invalid bind address '{0}'")]
    InvalidAddr(String),
    #[error("refusing to bind non-loopback address {0}")]
    NonLoopback(IpAddr),
    #[error(transparent)]
    Io(#[from] io::Error),
}
