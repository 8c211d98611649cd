//! A broadcast chat hub.
//!
//! Every connected peer picks a display name, after which each line it sends is relayed to
//! every other connected peer. Joins and departures are announced together with a fresh
//! roster of the connected peers, and peers that stay silent for too long are disconnected.
//!
//! The session registry lives inside a single broker task (see [`broker`]); connection
//! handlers only ever talk to it through channels.

pub use async_std::channel::{Receiver as AsyncStdReceiver, Sender as AsyncStdSender};

pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod idle;
pub mod reader;
pub mod session;
pub mod writer;

pub mod prelude {
    pub use super::{AsyncStdReceiver, AsyncStdSender};
    pub use crate::broker::{broker, format_roster, Broadcaster, Event, Message};
    pub use crate::config::HubConfig;
    pub use crate::connection::{accept_loop, handle_connection};
    pub use crate::error::ServerError;
    pub use crate::idle::IdleMonitor;
    pub use crate::reader::{InputReader, ReaderEvent};
    pub use crate::session::{Session, SessionHandle, SessionState};
    pub use crate::writer::delivery_worker;
}
