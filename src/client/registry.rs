use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::client::ClientCore;
use crate::proto::{ClientFrame, Message};
use crate::session::Session;

/// Capacity of each subscription's inbox.
const INBOX_CAPACITY: usize = 64;

/// Registry-side state of a live subscription.
struct SubEntry {
    subject: String,
    queue: Option<String>,
    maximum: u64,
    received: u64,
    inbox: mpsc::Sender<Message>,
    /// Session the subscription was last subscribed on.
    session: Session,
}

impl SubEntry {
    fn subscribe_frames(&self, sid: u64, maximum: u64) -> Vec<ClientFrame> {
        let mut frames = vec![ClientFrame::Sub {
            sid,
            subject: self.subject.clone(),
            queue: self.queue.clone(),
        }];
        if maximum > 0 {
            frames.push(ClientFrame::Unsub {
                sid,
                maximum: Some(maximum),
            });
        }
        frames
    }
}

#[derive(Default)]
struct RegistryState {
    sid: u64,
    subs: HashMap<u64, SubEntry>,
}

/// All live subscriptions, keyed by sid.
///
/// The mutex guards map-level operations only and is never held across an
/// await point.
pub(crate) struct SubscriptionRegistry {
    state: Mutex<RegistryState>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Create an unfrozen subscription handle with the next sid.
    ///
    /// Sids are strictly increasing and never reused, reconnects included.
    pub fn create(&self, core: Arc<ClientCore>, subject: String) -> Subscription {
        let sid = {
            let mut state = self.state.lock().unwrap();
            state.sid += 1;
            state.sid
        };
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_CAPACITY);

        Subscription {
            core,
            sid,
            subject,
            queue: None,
            maximum: 0,
            frozen: false,
            inbox: inbox_rx,
            inbox_tx: Some(inbox_tx),
        }
    }

    /// Route one inbound message to its subscription's inbox.
    ///
    /// A subscription that reaches its maximum is unsubscribed right after
    /// the delivery.
    pub async fn deliver(&self, message: Message) {
        let sid = message.sid;
        let (inbox, unsubscribe) = {
            let mut state = self.state.lock().unwrap();
            let entry = match state.subs.get_mut(&sid) {
                Some(entry) => entry,
                None => {
                    log::debug!("Dropping MSG for unknown sid {}", sid);
                    return;
                }
            };
            entry.received += 1;
            let unsubscribe = entry.maximum > 0 && entry.received >= entry.maximum;
            (entry.inbox.clone(), unsubscribe)
        };

        if inbox.send(message).await.is_err() {
            log::debug!("Inbox for sid {} is gone", sid);
        }

        if unsubscribe {
            self.unsubscribe(sid).await;
        }
    }

    /// Remove `sid`, close its inbox and tell the server. A missing sid is
    /// a no-op.
    pub async fn unsubscribe(&self, sid: u64) {
        let entry = { self.state.lock().unwrap().subs.remove(&sid) };

        if let Some(entry) = entry {
            let session = entry.session.clone();
            // Dropping the entry drops the inbox sender, closing the queue.
            drop(entry);
            session
                .write(ClientFrame::Unsub { sid, maximum: None })
                .await;
        }
    }

    /// Re-issue every live subscription on a fresh session.
    ///
    /// A bounded subscription is re-issued with `maximum - received`; one
    /// that has already received its maximum is unsubscribed instead.
    pub async fn resubscribe_all(&self, session: &Session) {
        let mut batches = Vec::new();
        let mut spent = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            for (&sid, entry) in state.subs.iter_mut() {
                let remaining = entry.maximum.saturating_sub(entry.received);
                if entry.maximum > 0 && remaining == 0 {
                    spent.push(sid);
                    continue;
                }
                entry.session = session.clone();
                batches.push((sid, entry.subscribe_frames(sid, remaining)));
            }
        }

        for sid in spent {
            self.unsubscribe(sid).await;
        }
        for (sid, frames) in batches {
            if !session.write_batch(frames).await {
                log::warn!("Resubscribe for sid {} failed; session already gone", sid);
            }
        }
    }

    /// Close every live subscription's inbox and empty the map.
    /// Irreversible; the sid counter is kept.
    pub fn teardown(&self) {
        let mut state = self.state.lock().unwrap();
        state.subs.clear();
    }

    fn insert(&self, sid: u64, entry: SubEntry) {
        let mut state = self.state.lock().unwrap();
        state.subs.insert(sid, entry);
    }
}

/// A caller-held subscription handle.
///
/// Subject, queue and maximum can be changed freely until [`subscribe`] is
/// called; from then on the subscription is frozen and the setters panic.
/// Messages arrive on the handle's inbox via [`recv`].
///
/// [`subscribe`]: Subscription::subscribe
/// [`recv`]: Subscription::recv
pub struct Subscription {
    core: Arc<ClientCore>,
    sid: u64,
    subject: String,
    queue: Option<String>,
    maximum: u64,
    frozen: bool,
    inbox: mpsc::Receiver<Message>,
    inbox_tx: Option<mpsc::Sender<Message>>,
}

impl Subscription {
    pub fn sid(&self) -> u64 {
        self.sid
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn queue(&self) -> Option<&str> {
        self.queue.as_deref()
    }

    pub fn maximum(&self) -> u64 {
        self.maximum
    }

    fn assert_unfrozen(&self) {
        if self.frozen {
            panic!("subscription is frozen");
        }
    }

    /// # Panics
    ///
    /// Panics if the subscription has been subscribed.
    pub fn set_subject(&mut self, subject: impl Into<String>) -> &mut Self {
        self.assert_unfrozen();
        self.subject = subject.into();
        self
    }

    /// # Panics
    ///
    /// Panics if the subscription has been subscribed.
    pub fn set_queue(&mut self, queue: impl Into<String>) -> &mut Self {
        self.assert_unfrozen();
        self.queue = Some(queue.into());
        self
    }

    /// Bound the number of messages delivered before the subscription
    /// unsubscribes itself. Zero means unlimited.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has been subscribed.
    pub fn set_maximum(&mut self, maximum: u64) -> &mut Self {
        self.assert_unfrozen();
        self.maximum = maximum;
        self
    }

    /// Register on the current session and freeze the handle.
    ///
    /// Waits for a session when the client is between connections. If the
    /// client has been stopped the inbox is closed and nothing is sent.
    ///
    /// # Panics
    ///
    /// Panics if the subscription has already been subscribed.
    pub async fn subscribe(&mut self) {
        self.assert_unfrozen();
        self.frozen = true;

        // Taking the sender here means a stopped client leaves the inbox
        // closed rather than forever empty.
        let inbox_tx = match self.inbox_tx.take() {
            Some(inbox_tx) => inbox_tx,
            None => return,
        };
        let session = match self.core.acquire_session().await {
            Some(session) => session,
            None => return,
        };

        let entry = SubEntry {
            subject: self.subject.clone(),
            queue: self.queue.clone(),
            maximum: self.maximum,
            received: 0,
            inbox: inbox_tx,
            session: session.clone(),
        };
        let frames = entry.subscribe_frames(self.sid, self.maximum);
        self.core.registry.insert(self.sid, entry);

        session.write_batch(frames).await;
    }

    /// Remove the subscription; its inbox yields any already-delivered
    /// messages and then closes.
    pub async fn unsubscribe(&mut self) {
        self.core.registry.unsubscribe(self.sid).await;
    }

    /// Receive the next message. Returns `None` once the subscription is
    /// closed and the inbox is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        self.inbox.recv().await
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use crate::proto::Message;

    use super::SubscriptionRegistry;

    #[tokio::test]
    async fn deliver_to_unknown_sid_is_dropped() {
        let registry = SubscriptionRegistry::new();
        registry
            .deliver(Message {
                subject: "subject".to_string(),
                sid: 42,
                reply_to: None,
                payload: Bytes::from_static(b"hi"),
            })
            .await;
    }

    #[tokio::test]
    async fn teardown_empties_the_map() {
        let registry = SubscriptionRegistry::new();
        registry.teardown();
        assert!(registry.state.lock().unwrap().subs.is_empty());
    }
}
