//! The hub: a single task that owns the session registry and routes every message.
//!
//! Connection handlers reach the broker only through a [`Broadcaster`]. Events are handled
//! one at a time in arrival order, so the registry is never observed or mutated
//! concurrently and needs no lock.
//!
//! The broker never waits on a recipient's queue. Each (message, recipient) pair is handed
//! to its own short lived delivery task, and the delivery tasks for one recipient are chained
//! so that the recipient sees messages in the order the broker handled them. A recipient that
//! stops reading accumulates one parked task per message until its session is unregistered.
//! That is fine for a handful of peers; a larger deployment would want a bounded worker per
//! session instead.

use std::collections::HashMap;

use async_std::channel;
use tokio::sync::oneshot;
use tokio::task::{self, JoinHandle};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::error::ServerError;
use crate::session::SessionHandle;
use crate::{AsyncStdReceiver, AsyncStdSender};

/// Header line of every roster snapshot.
pub const ROSTER_HEADER: &str = "address";

/// Separator line between the roster header and the names.
pub const ROSTER_SEPARATOR: &str = "----";

#[derive(Debug)]
pub enum Event {
    Register { session: SessionHandle },
    Unregister { peer_id: Uuid },
    Broadcast { message: Message },
    Roster { reply: oneshot::Sender<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// A line from a session, delivered to everyone except that session.
    Chat { from: Uuid, text: String },
    /// A membership change, delivered to every active session.
    Roster { text: String },
}

/// Cheap, cloneable handle for sending events to the broker.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    events: AsyncStdSender<Event>,
}

impl Broadcaster {
    /// Creates a handle together with the receiving half the broker has to be run on.
    pub fn new(capacity: usize) -> (Broadcaster, AsyncStdReceiver<Event>) {
        let (events, event_receiver) = channel::bounded::<Event>(capacity);
        (Broadcaster { events }, event_receiver)
    }

    /// Creates a handle and spawns the broker onto the current tokio runtime.
    pub fn spawn(capacity: usize) -> (Broadcaster, JoinHandle<Result<(), ServerError>>) {
        let (hub, event_receiver) = Broadcaster::new(capacity);
        let handle = task::spawn(broker(event_receiver));
        (hub, handle)
    }

    async fn send(&self, event: Event) -> Result<(), ServerError> {
        self.events
            .send(event)
            .await
            .map_err(|e| ServerError::ChannelSendError(format!("unable to send {:?} to the broker", e.into_inner())))
    }

    pub async fn register(&self, session: SessionHandle) -> Result<(), ServerError> {
        self.send(Event::Register { session }).await
    }

    pub async fn unregister(&self, peer_id: Uuid) -> Result<(), ServerError> {
        self.send(Event::Unregister { peer_id }).await
    }

    /// Relays `text` to every active session other than `from`.
    pub async fn broadcast(&self, from: Uuid, text: String) -> Result<(), ServerError> {
        self.send(Event::Broadcast { message: Message::Chat { from, text } }).await
    }

    /// Asks the broker for a roster of the currently active sessions.
    pub async fn roster(&self) -> Result<String, ServerError> {
        let (reply, roster) = oneshot::channel();
        self.send(Event::Roster { reply }).await?;
        roster
            .await
            .map_err(|_| ServerError::ChannelSendError(String::from("broker dropped roster request")))
    }
}

/// Formats a roster snapshot, one name per line below the header.
pub fn format_roster<'a>(names: impl IntoIterator<Item = &'a str>) -> String {
    let mut roster = format!("{ROSTER_HEADER}\n{ROSTER_SEPARATOR}");
    for name in names {
        roster.push('\n');
        roster.push_str(name);
    }
    roster
}

struct Member {
    session: SessionHandle,
    // completes once the most recent delivery task for this member is done
    tail: Option<oneshot::Receiver<()>>,
}

impl Member {
    fn deliver(&mut self, line: String) {
        let (done, next_tail) = oneshot::channel::<()>();
        let previous = self.tail.replace(next_tail);
        let outgoing = self.session.outgoing();
        let peer_id = self.session.peer_id();

        task::spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if outgoing.send(line).await.is_err() {
                debug!(peer_id = ?peer_id, "Outgoing queue of client {} closed before delivery", peer_id);
            }
            drop(done);
        });
    }
}

fn roster_of(registry: &HashMap<Uuid, Member>) -> String {
    format_roster(registry.values().map(|member| member.session.name()))
}

fn route(registry: &mut HashMap<Uuid, Member>, message: Message) {
    match message {
        Message::Chat { from, text } => {
            for (peer_id, member) in registry.iter_mut() {
                if *peer_id == from {
                    continue;
                }
                member.deliver(text.clone());
            }
        }
        Message::Roster { text } => {
            for member in registry.values_mut() {
                member.deliver(text.clone());
            }
        }
    }
}

/// Runs the hub until every [`Broadcaster`] has been dropped.
///
/// Returns `ServerError::StateError` if a session is registered twice or an unknown session
/// is unregistered. Either means a connection handler is broken, so the broker stops.
#[instrument(skip_all)]
pub async fn broker(events: AsyncStdReceiver<Event>) -> Result<(), ServerError> {
    info!("Broker started");
    let mut registry: HashMap<Uuid, Member> = HashMap::new();

    while let Ok(event) = events.recv().await {
        match event {
            Event::Register { session } => {
                let peer_id = session.peer_id();
                if registry.contains_key(&peer_id) {
                    error!(peer_id = ?peer_id, "Client {} registered twice", peer_id);
                    return Err(ServerError::StateError(format!("client {} is already registered", peer_id)));
                }
                info!(peer_id = ?peer_id, address = session.address(), name = session.name(), "Registering client {}", peer_id);
                registry.insert(peer_id, Member { session, tail: None });
                let text = roster_of(&registry);
                route(&mut registry, Message::Roster { text });
            }
            Event::Unregister { peer_id } => {
                let member = registry.remove(&peer_id).ok_or_else(|| {
                    error!(peer_id = ?peer_id, "Unregister for unknown client {}", peer_id);
                    ServerError::StateError(format!("no client with id {} contained in registry", peer_id))
                })?;
                info!(peer_id = ?peer_id, address = member.session.address(), "Unregistering client {}", peer_id);
                if !member.session.close_outgoing() {
                    debug!(peer_id = ?peer_id, "Outgoing queue of client {} was already closed", peer_id);
                }
                let text = roster_of(&registry);
                route(&mut registry, Message::Roster { text });
            }
            Event::Broadcast { message } => {
                debug!(message = ?message, recipients = registry.len(), "Routing message");
                route(&mut registry, message);
            }
            Event::Roster { reply } => {
                let _ = reply.send(roster_of(&registry));
            }
        }
    }

    info!(active = registry.len(), "Broker shutting down");
    Ok(())
}

#[cfg(test)]
mod test {
    use std::collections::BTreeSet;
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;

    fn member(address: &str, name: &str, capacity: usize) -> (SessionHandle, AsyncStdReceiver<String>) {
        let (outgoing, outgoing_receiver) = channel::bounded(capacity);
        (SessionHandle::new(Uuid::new_v4(), address, name, outgoing), outgoing_receiver)
    }

    async fn next_line(queue: &AsyncStdReceiver<String>) -> String {
        timeout(Duration::from_secs(1), queue.recv())
            .await
            .expect("timed out waiting for a line")
            .expect("queue closed")
    }

    async fn assert_quiet(queue: &AsyncStdReceiver<String>) {
        let res = timeout(Duration::from_millis(50), queue.recv()).await;
        assert!(res.is_err(), "unexpected line: {:?}", res);
    }

    fn roster_names(roster: &str) -> BTreeSet<String> {
        let mut lines = roster.lines();
        assert_eq!(lines.next(), Some(ROSTER_HEADER));
        assert_eq!(lines.next(), Some(ROSTER_SEPARATOR));
        lines.map(String::from).collect()
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn test_format_roster() {
        assert_eq!(format_roster(Vec::<&str>::new()), "address\n----");
        assert_eq!(format_roster(["alice", "bob"]), "address\n----\nalice\nbob");
    }

    #[tokio::test]
    async fn test_chat_skips_sender() {
        let (hub, broker_handle) = Broadcaster::spawn(16);
        let (alice, alice_queue) = member("10.0.0.1:4000", "alice", 16);
        let (bob, bob_queue) = member("10.0.0.2:4000", "bob", 16);
        let alice_id = alice.peer_id();

        hub.register(alice).await.unwrap();
        assert_eq!(roster_names(&next_line(&alice_queue).await), names(&["alice"]));

        hub.register(bob).await.unwrap();
        assert_eq!(roster_names(&next_line(&alice_queue).await), names(&["alice", "bob"]));
        assert_eq!(roster_names(&next_line(&bob_queue).await), names(&["alice", "bob"]));

        hub.broadcast(alice_id, String::from("alice: hello")).await.unwrap();
        assert_eq!(next_line(&bob_queue).await, "alice: hello");
        assert_quiet(&alice_queue).await;

        drop(hub);
        assert!(broker_handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_register_then_unregister_emits_two_rosters() {
        let (hub, broker_handle) = Broadcaster::spawn(16);
        let (observer, observer_queue) = member("10.0.0.1:4000", "observer", 16);
        let (session, session_queue) = member("10.0.0.2:4000", "s", 16);
        let session_id = session.peer_id();

        hub.register(observer).await.unwrap();
        assert_eq!(roster_names(&next_line(&observer_queue).await), names(&["observer"]));

        hub.register(session).await.unwrap();
        hub.unregister(session_id).await.unwrap();

        assert_eq!(roster_names(&next_line(&observer_queue).await), names(&["observer", "s"]));
        assert_eq!(roster_names(&next_line(&observer_queue).await), names(&["observer"]));
        assert_quiet(&observer_queue).await;

        // deliveries racing the unregister may be dropped, but the queue always ends up closed
        while let Ok(line) = timeout(Duration::from_secs(1), session_queue.recv()).await.unwrap() {
            assert_eq!(roster_names(&line), names(&["observer", "s"]));
        }

        assert_eq!(hub.roster().await.unwrap(), format_roster(["observer"]));

        drop(hub);
        assert!(broker_handle.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_departure_updates_remaining_rosters_once() {
        let (hub, _broker_handle) = Broadcaster::spawn(16);
        let (a, a_queue) = member("10.0.0.1:4000", "a", 16);
        let (b, b_queue) = member("10.0.0.2:4000", "b", 16);
        let (c, _c_queue) = member("10.0.0.3:4000", "c", 16);
        let c_id = c.peer_id();

        hub.register(a).await.unwrap();
        hub.register(b).await.unwrap();
        hub.register(c).await.unwrap();

        // a saw three rosters, b saw two
        for _ in 0..3 {
            next_line(&a_queue).await;
        }
        for _ in 0..2 {
            next_line(&b_queue).await;
        }

        hub.unregister(c_id).await.unwrap();

        assert_eq!(roster_names(&next_line(&a_queue).await), names(&["a", "b"]));
        assert_eq!(roster_names(&next_line(&b_queue).await), names(&["a", "b"]));
        assert_quiet(&a_queue).await;
        assert_quiet(&b_queue).await;
    }

    #[tokio::test]
    async fn test_duplicate_names_are_allowed() {
        let (hub, _broker_handle) = Broadcaster::spawn(16);
        let (first, _first_queue) = member("10.0.0.1:4000", "sam", 16);
        let (second, _second_queue) = member("10.0.0.2:4000", "sam", 16);

        hub.register(first).await.unwrap();
        hub.register(second).await.unwrap();

        assert_eq!(hub.roster().await.unwrap(), format_roster(["sam", "sam"]));
    }

    #[tokio::test]
    async fn test_slow_recipient_keeps_order_and_hub_keeps_going() {
        let (hub, _broker_handle) = Broadcaster::spawn(16);
        let (sender, _sender_queue) = member("10.0.0.1:4000", "fast", 16);
        let (slow, slow_queue) = member("10.0.0.2:4000", "slow", 1);
        let sender_id = sender.peer_id();

        hub.register(slow).await.unwrap();
        hub.register(sender).await.unwrap();

        for i in 0..10 {
            hub.broadcast(sender_id, format!("line {i}")).await.unwrap();
        }

        // the broker still answers while the slow queue is full
        let roster = timeout(Duration::from_secs(1), hub.roster()).await.unwrap().unwrap();
        assert_eq!(roster_names(&roster), names(&["fast", "slow"]));

        assert_eq!(roster_names(&next_line(&slow_queue).await), names(&["slow"]));
        assert_eq!(roster_names(&next_line(&slow_queue).await), names(&["fast", "slow"]));
        for i in 0..10 {
            assert_eq!(next_line(&slow_queue).await, format!("line {i}"));
        }
    }

    #[tokio::test]
    async fn test_double_register_is_fatal() {
        let (hub, broker_handle) = Broadcaster::spawn(16);
        let (session, _queue) = member("10.0.0.1:4000", "alice", 16);

        hub.register(session.clone()).await.unwrap();
        hub.register(session).await.unwrap();

        let res = broker_handle.await.unwrap();
        assert!(matches!(res, Err(ServerError::StateError(_))));
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_fatal() {
        let (hub, broker_handle) = Broadcaster::spawn(16);
        hub.unregister(Uuid::new_v4()).await.unwrap();

        let res = broker_handle.await.unwrap();
        assert!(matches!(res, Err(ServerError::StateError(_))));
        assert!(matches!(hub.roster().await, Err(ServerError::ChannelSendError(_))));
    }
}
