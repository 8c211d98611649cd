//! Per-session inactivity timer.
//!
//! The countdown runs in its own task and reports expiry over a channel, tagged with the
//! generation it was armed with. [`IdleMonitor::reset`] stops the running countdown and
//! drains any expiry it already reported before arming a new one, and [`IdleMonitor::expired`]
//! ignores expiries from earlier generations, so a countdown that fires while it is being
//! reset can never end the session.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};

#[derive(Debug)]
pub struct IdleMonitor {
    timeout: Duration,
    generation: u64,
    countdown: Option<JoinHandle<()>>,
    expiry_sender: mpsc::Sender<u64>,
    expiry_receiver: mpsc::Receiver<u64>,
}

impl IdleMonitor {
    /// Creates a monitor whose countdown starts immediately. Must be called within a tokio runtime.
    pub fn new(timeout: Duration) -> IdleMonitor {
        let (expiry_sender, expiry_receiver) = mpsc::channel(1);
        let mut monitor = IdleMonitor {
            timeout,
            generation: 0,
            countdown: None,
            expiry_sender,
            expiry_receiver,
        };
        monitor.arm();
        monitor
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Restarts the countdown from now.
    pub fn reset(&mut self) {
        self.stop();
        self.arm();
    }

    /// Stops the countdown and discards an expiry that was reported but not yet observed.
    pub fn stop(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.abort();
        }
        while self.expiry_receiver.try_recv().is_ok() {}
    }

    fn arm(&mut self) {
        self.generation += 1;
        let generation = self.generation;
        let deadline = Instant::now() + self.timeout;
        let expiry_sender = self.expiry_sender.clone();
        self.countdown = Some(tokio::spawn(async move {
            time::sleep_until(deadline).await;
            let _ = expiry_sender.try_send(generation);
        }));
    }

    /// Completes once the current countdown runs out. Cancel safe.
    ///
    /// Never completes after [`IdleMonitor::stop`] until the monitor is reset.
    pub async fn expired(&mut self) {
        loop {
            match self.expiry_receiver.recv().await {
                Some(generation) if generation == self.generation => return,
                Some(_) => continue,
                // the monitor holds a sender itself, so the channel never closes
                None => std::future::pending::<()>().await,
            }
        }
    }
}

impl Drop for IdleMonitor {
    fn drop(&mut self) {
        if let Some(countdown) = self.countdown.take() {
            countdown.abort();
        }
    }
}
