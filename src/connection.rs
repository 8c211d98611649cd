//! Accept loop and the per-connection lifecycle.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::task;
use tokio::time;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::Broadcaster;
use crate::config::HubConfig;
use crate::error::ServerError;
use crate::reader::{InputReader, ReaderEvent};
use crate::session::Session;
use crate::writer::delivery_worker;

/// Sent to every peer right after it connects.
pub const NAME_PROMPT: &str = "Type your name:";

/// Text of the notice sent to a peer that is disconnected for being idle.
pub fn timeout_notice(config: &HubConfig) -> String {
    format!("closing connection after timeout {:?}", config.idle_timeout)
}

/// Accepts connections forever, spawning a handler for each one.
///
/// Failing to accept a single connection is logged and does not stop the loop.
pub async fn accept_loop(listener: TcpListener, hub: Broadcaster, config: HubConfig) -> Result<(), ServerError> {
    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "Listening for clients");

    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = ?e, "Unable to accept client connection");
                continue;
            }
        };
        info!(address = %peer_addr, "Accepting client connection");

        let hub = hub.clone();
        task::spawn(async move {
            if let Err(e) = handle_connection(stream, peer_addr.to_string(), hub, config).await {
                error!(address = %peer_addr, error = %e, "Error from client connection");
            }
        });
    }
}

/// Drives one peer from connect to disconnect.
///
/// The peer is asked for a name, registered with the hub, and then every line it sends is
/// relayed as `<name>: <line>` until it closes the stream or stays idle for too long.
#[instrument(skip(stream, hub, config))]
pub async fn handle_connection<S>(stream: S, address: String, hub: Broadcaster, config: HubConfig) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let (mut session, outgoing) = Session::new(address, config.queue_capacity);
    let peer_id = session.peer_id();

    let mut writer = task::spawn(delivery_worker(outgoing, write_half, peer_id));
    let mut reader = InputReader::spawn(read_half, config.idle_timeout, config.max_line_length);

    let relayed = relay(&mut session, &mut reader, &hub, &config).await;

    drop(reader);
    let left = session.leave(&hub).await;

    // a peer that stopped reading can keep the worker stuck in a write forever
    match time::timeout(config.close_grace, &mut writer).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => error!(peer_id = ?peer_id, error = ?e, "Delivery worker for client {} failed", peer_id),
        Err(_) => {
            warn!(peer_id = ?peer_id, "Client {} is not reading, dropping its connection", peer_id);
            writer.abort();
        }
    }
    session.close();
    debug!(peer_id = ?peer_id, "Connection to client {} closed", peer_id);

    relayed?;
    left.map(|_| ())
}

async fn relay(session: &mut Session, reader: &mut InputReader, hub: &Broadcaster, config: &HubConfig) -> Result<(), ServerError> {
    session.begin_naming();
    session.send(NAME_PROMPT).await;

    let name = match reader.next().await {
        ReaderEvent::Line(name) => name,
        ReaderEvent::IdleTimeout => {
            info!(peer_id = ?session.peer_id(), "Client {} never picked a name", session.peer_id());
            session.try_send(timeout_notice(config));
            return Ok(());
        }
        ReaderEvent::Closed => return Ok(()),
    };
    session.set_name(name);
    session.send(format!("You are {}", session.address())).await;
    session.register(hub).await?;

    loop {
        match reader.next().await {
            ReaderEvent::Line(text) => {
                hub.broadcast(session.peer_id(), format!("{}: {}", session.display_name(), text)).await?;
            }
            ReaderEvent::IdleTimeout => {
                info!(peer_id = ?session.peer_id(), "Client {} timed out", session.peer_id());
                // best effort, the queue of a peer that stopped reading is full
                session.try_send(timeout_notice(config));
                return Ok(());
            }
            ReaderEvent::Closed => return Ok(()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_timeout_notice() {
        let config = HubConfig::default();
        assert_eq!(timeout_notice(&config), "closing connection after timeout 300s");
    }
}
