//! Turns a peer's byte stream into a sequence of lines for its connection handler.
//!
//! A scanner task reads lines off the stream and publishes each one into a single slot,
//! replacing whatever unconsumed line was there before. The handler therefore only ever sees
//! the most recent line when it falls behind. Consuming a line resets the session's
//! [`IdleMonitor`]; when the monitor expires first, the reader reports an idle timeout instead.

use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::codec::{FramedRead, LinesCodec};
use tracing::debug;

use crate::idle::IdleMonitor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderEvent {
    Line(String),
    /// Nothing was consumed for the configured idle duration.
    IdleTimeout,
    /// The peer closed the stream, or the stream could not be read or decoded, or a line
    /// grew past the maximum length.
    Closed,
}

#[derive(Debug)]
pub struct InputReader {
    latest: watch::Receiver<Option<String>>,
    monitor: IdleMonitor,
    scanner: JoinHandle<()>,
    finished: bool,
}

impl InputReader {
    /// Starts scanning `reader` for lines of at most `max_line_length` bytes. The idle
    /// countdown starts right away.
    pub fn spawn<R>(reader: R, idle_timeout: Duration, max_line_length: usize) -> InputReader
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (latest_sender, latest) = watch::channel(None);
        let lines = FramedRead::new(reader, LinesCodec::new_with_max_length(max_line_length));
        let scanner = tokio::spawn(scan_lines(lines, latest_sender));
        InputReader {
            latest,
            monitor: IdleMonitor::new(idle_timeout),
            scanner,
            finished: false,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.monitor.timeout()
    }

    /// Waits for the next line. An expired countdown wins over a line that is already waiting.
    /// After `IdleTimeout` or `Closed` every further call returns `Closed`.
    pub async fn next(&mut self) -> ReaderEvent {
        if self.finished {
            return ReaderEvent::Closed;
        }

        loop {
            tokio::select! {
                biased;
                _ = self.monitor.expired() => {
                    self.finish();
                    return ReaderEvent::IdleTimeout;
                }
                changed = self.latest.changed() => {
                    if changed.is_err() {
                        self.finish();
                        return ReaderEvent::Closed;
                    }
                    let line = self.latest.borrow_and_update().clone();
                    if let Some(line) = line {
                        self.monitor.reset();
                        return ReaderEvent::Line(line);
                    }
                }
            }
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.monitor.stop();
        self.scanner.abort();
    }
}

impl Drop for InputReader {
    fn drop(&mut self) {
        self.scanner.abort();
    }
}

async fn scan_lines<R>(mut lines: FramedRead<R, LinesCodec>, latest: watch::Sender<Option<String>>)
where
    R: AsyncRead + Unpin,
{
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => {
                if latest.send(Some(line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = ?e, "Unable to read line from client");
                break;
            }
        }
    }
}
