//! Delivery worker: drains a session's outgoing queue onto its connection.

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::AsyncStdReceiver;

/// Writes every queued line to `writer` in queue order, newline terminated, until the queue is
/// closed and empty. Then shuts the writer down, which closes the peer's connection.
///
/// Write failures are logged and otherwise ignored, delivery is best effort.
/// Returns the number of lines that were written successfully.
#[instrument(skip(outgoing, writer))]
pub async fn delivery_worker<W>(outgoing: AsyncStdReceiver<String>, mut writer: W, peer_id: Uuid) -> usize
where
    W: AsyncWrite + Unpin,
{
    let mut delivered = 0;
    while let Ok(line) = outgoing.recv().await {
        match write_line(&mut writer, &line).await {
            Ok(()) => delivered += 1,
            Err(e) => warn!(peer_id = ?peer_id, error = ?e, "Unable to write to client {}", peer_id),
        }
    }

    if let Err(e) = writer.shutdown().await {
        debug!(peer_id = ?peer_id, error = ?e, "Unable to shut down connection to client {}", peer_id);
    }
    debug!(peer_id = ?peer_id, delivered, "Delivery worker for client {} finished", peer_id);
    delivered
}

async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

#[cfg(test)]
mod test {
    use std::pin::Pin;
    use std::task::{Context, Poll};

    use async_std::channel::{self, TrySendError};
    use tokio::io::AsyncReadExt;

    use super::*;

    struct BrokenPipe;

    impl AsyncWrite for BrokenPipe {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Err(io::Error::from(io::ErrorKind::BrokenPipe)))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_writes_lines_in_order_then_closes() {
        let (outgoing, outgoing_receiver) = channel::bounded::<String>(5);
        let (mut client, server) = tokio::io::duplex(256);

        outgoing.send(String::from("Type your name:")).await.unwrap();
        outgoing.send(String::from("address\n----\nalice")).await.unwrap();
        outgoing.send(String::from("bob: hi")).await.unwrap();
        outgoing.close();

        let delivered = delivery_worker(outgoing_receiver, server, Uuid::new_v4()).await;
        assert_eq!(delivered, 3);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "Type your name:\naddress\n----\nalice\nbob: hi\n");
    }

    #[tokio::test]
    async fn test_write_failures_are_swallowed() {
        let (outgoing, outgoing_receiver) = channel::bounded::<String>(5);
        outgoing.send(String::from("lost")).await.unwrap();
        outgoing.send(String::from("also lost")).await.unwrap();
        outgoing.close();

        let delivered = delivery_worker(outgoing_receiver, BrokenPipe, Uuid::new_v4()).await;
        assert_eq!(delivered, 0);
    }

    #[tokio::test]
    async fn test_full_queue_applies_backpressure() {
        let (outgoing, outgoing_receiver) = channel::bounded::<String>(2);
        outgoing.try_send(String::from("1")).unwrap();
        outgoing.try_send(String::from("2")).unwrap();
        assert!(matches!(outgoing.try_send(String::from("3")), Err(TrySendError::Full(_))));

        let (mut client, server) = tokio::io::duplex(256);
        let worker = tokio::spawn(delivery_worker(outgoing_receiver, server, Uuid::new_v4()));

        // the blocked producer gets through once the worker drains the queue
        outgoing.send(String::from("3")).await.unwrap();
        outgoing.close();
        assert_eq!(worker.await.unwrap(), 3);

        let mut received = String::new();
        client.read_to_string(&mut received).await.unwrap();
        assert_eq!(received, "1\n2\n3\n");
    }
}
