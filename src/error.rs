//! Error type shared by the hub, the connection handlers and the binaries.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

pub mod prelude {
    pub use super::*;
}

#[derive(Debug)]
pub enum ServerError {
    ConnectionFailed(io::Error),
    /// The session registry was asked to do something that breaks its invariants,
    /// e.g. registering an already active session. Always a bug, never a runtime condition.
    StateError(String),
    ChannelSendError(String),
    Config(String),
}

impl Display for ServerError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::ConnectionFailed(e) => write!(f, "connection failed: {e}"),
            ServerError::StateError(s) => write!(f, "state error: {s}"),
            ServerError::ChannelSendError(s) => write!(f, "channel send error: {s}"),
            ServerError::Config(s) => write!(f, "configuration error: {s}"),
        }
    }
}

impl Error for ServerError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ServerError::ConnectionFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        ServerError::ConnectionFailed(e)
    }
}
