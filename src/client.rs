//! The supervising client: owns the subscription registry, keeps exactly one
//! session alive at a time and rebuilds subscription state after a redial.
//!
//! Callers that need a connection ([`publish`], [`ping`],
//! [`Subscription::subscribe`]) take the current session from a single slot
//! that is empty while the client is between connections; they simply wait
//! there until the next session is handed over, and observe a permanently
//! closed slot once the client is stopped.
//!
//! [`publish`]: Client::publish
//! [`ping`]: Client::ping

mod registry;

pub use registry::Subscription;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::dial::{Dialer, RetryingDialer, TcpDialer};
use crate::handshake::{Handshake, Handshaker};
use crate::proto::ClientFrame;
use crate::session::{Session, SessionEvent, SessionTask};
use crate::Error;

use registry::SubscriptionRegistry;

/// The session hand-off slot. `Closed` is terminal.
enum Slot {
    Empty,
    Ready(Session),
    Closed,
}

pub(crate) struct ClientCore {
    pub(crate) registry: SubscriptionRegistry,
    slot: watch::Sender<Slot>,
    stop: watch::Sender<bool>,
    done: watch::Sender<bool>,
    started: AtomicBool,
}

impl ClientCore {
    /// Take the current session, waiting while the client is between
    /// connections. `None` once the client has been stopped.
    pub(crate) async fn acquire_session(&self) -> Option<Session> {
        let mut slot = self.slot.subscribe();
        let value = slot
            .wait_for(|slot| !matches!(slot, Slot::Empty))
            .await
            .ok()?;
        match &*value {
            Slot::Ready(session) => Some(session.clone()),
            _ => None,
        }
    }
}

/// A broker client.
///
/// Cloning is cheap; all clones share the same connection and subscription
/// state. Create subscriptions with [`new_subscription`](Client::new_subscription)
/// and drive the connection with [`run`](Client::run) on a separate task.
#[derive(Clone)]
pub struct Client {
    core: Arc<ClientCore>,
}

impl Client {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(Slot::Empty);
        let (stop, _) = watch::channel(false);
        let (done, _) = watch::channel(false);

        Client {
            core: Arc::new(ClientCore {
                registry: SubscriptionRegistry::new(),
                slot,
                stop,
                done,
                started: AtomicBool::new(false),
            }),
        }
    }

    /// Create a subscription handle for `subject`.
    ///
    /// The handle is inert until [`Subscription::subscribe`] is called;
    /// subject, queue and maximum can be adjusted up to that point.
    pub fn new_subscription(&self, subject: impl Into<String>) -> Subscription {
        self.core
            .registry
            .create(Arc::clone(&self.core), subject.into())
    }

    /// Publish `payload` under `subject`.
    ///
    /// Returns `true` once the frame is queued on a live session; `false`
    /// when the client is stopped or the session dies first.
    pub async fn publish(&self, subject: &str, payload: impl Into<Bytes>) -> bool {
        self.publish_inner(subject, None, payload.into(), false).await
    }

    /// Publish, then round-trip a ping on the same session to confirm the
    /// server received the publish.
    pub async fn publish_and_confirm(&self, subject: &str, payload: impl Into<Bytes>) -> bool {
        self.publish_inner(subject, None, payload.into(), true).await
    }

    /// Publish `payload` under `subject` with a reply subject attached.
    pub async fn publish_with_reply(
        &self,
        subject: &str,
        reply_to: &str,
        payload: impl Into<Bytes>,
    ) -> bool {
        self.publish_inner(subject, Some(reply_to), payload.into(), false)
            .await
    }

    async fn publish_inner(
        &self,
        subject: &str,
        reply_to: Option<&str>,
        payload: Bytes,
        confirm: bool,
    ) -> bool {
        let session = match self.core.acquire_session().await {
            Some(session) => session,
            None => return false,
        };

        let frame = ClientFrame::Pub {
            subject: subject.to_string(),
            reply_to: reply_to.map(str::to_string),
            payload,
        };
        if !session.write(frame).await {
            return false;
        }

        // Pong order is per-session, so the confirming ping must ride the
        // session the publish was written on.
        if confirm {
            return session.ping().await;
        }

        true
    }

    /// Round-trip a ping on the current session.
    pub async fn ping(&self) -> bool {
        match self.core.acquire_session().await {
            Some(session) => session.ping().await,
            None => false,
        }
    }

    /// Publish `payload` under `subject` with a freshly generated inbox
    /// subject as the reply target, and return the subscription on that
    /// inbox so the caller can await replies.
    ///
    /// `None` when the publish could not be queued.
    pub async fn request(&self, subject: &str, payload: impl Into<Bytes>) -> Option<Subscription> {
        let inbox = inbox_subject();
        let mut sub = self.new_subscription(inbox.clone());
        sub.subscribe().await;

        if self.publish_with_reply(subject, &inbox, payload).await {
            Some(sub)
        } else {
            None
        }
    }

    /// Run the client: dial, handshake, run the session, and redial whenever
    /// the transport fails. Returns when [`stop`](Client::stop) is called
    /// (`Ok`) or when dialing or the handshake fails (their error).
    pub async fn run<D, H>(&self, mut dialer: D, mut handshaker: H) -> Result<(), Error>
    where
        D: Dialer,
        H: Handshaker,
    {
        self.core.started.store(true, Ordering::SeqCst);
        let result = self.run_inner(&mut dialer, &mut handshaker).await;

        // There will not be more sessions or messages after run returns.
        self.core.slot.send_replace(Slot::Closed);
        self.core.registry.teardown();
        self.core.done.send_replace(true);

        result
    }

    /// Dial a TCP connection to `addr` with retry and backoff, and
    /// authenticate with `user` and `pass`.
    pub async fn run_with_defaults(&self, addr: &str, user: &str, pass: &str) -> Result<(), Error> {
        let dialer = RetryingDialer::new(TcpDialer::new(addr));

        let mut handshake = Handshake::new();
        handshake.set_username(user).set_password(pass);
        if let Some((host, _)) = addr.rsplit_once(':') {
            handshake.set_tls_server_name(host);
        }

        self.run(dialer, handshake).await
    }

    async fn run_inner<D, H>(&self, dialer: &mut D, handshaker: &mut H) -> Result<(), Error>
    where
        D: Dialer,
        H: Handshaker,
    {
        let mut stop = self.core.stop.subscribe();

        loop {
            if *stop.borrow_and_update() {
                return Ok(());
            }

            let stream = dialer.dial().await?;
            let stream = handshaker.handshake(stream).await?;

            let (task, session, mut events) = SessionTask::new(stream);

            // Re-issue subscription state while the engine spins up.
            let core = Arc::clone(&self.core);
            let resub_session = session.clone();
            let resubscribe =
                tokio::spawn(async move { core.registry.resubscribe_all(&resub_session).await });

            // Route inbound messages into the registry.
            let core = Arc::clone(&self.core);
            let delivery = tokio::spawn(async move {
                while let Some(event) = events.recv().await {
                    match event {
                        SessionEvent::Message(message) => core.registry.deliver(message).await,
                        SessionEvent::Control(frame) => {
                            log::debug!("Control frame mid-session: {:?}", frame)
                        }
                    }
                }
            });

            self.core.slot.send_replace(Slot::Ready(session.clone()));

            let run = task.run();
            tokio::pin!(run);
            let result = tokio::select! {
                result = &mut run => result,
                _ = stop.changed() => {
                    session.stop().await;
                    run.await
                }
            };

            self.core.slot.send_replace(Slot::Empty);

            // Settle in-flight deliveries before the next resubscribe reads
            // the received counts.
            let _ = resubscribe.await;
            let _ = delivery.await;

            match result {
                // No error: the session was explicitly stopped.
                Ok(()) => return Ok(()),
                Err(error) => {
                    if *stop.borrow() {
                        return Ok(());
                    }
                    log::warn!("Session failed: {}; redialing", error);
                }
            }
        }
    }

    /// Stop the client: the current session is shut down, `run` returns and
    /// every subscription inbox is closed. Idempotent.
    pub async fn stop(&self) {
        if self.core.stop.send_replace(true) {
            return;
        }

        if self.core.started.load(Ordering::SeqCst) {
            let mut done = self.core.done.subscribe();
            let _ = done.wait_for(|&done| done).await;
        }
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// A fresh, effectively unique reply subject.
fn inbox_subject() -> String {
    use std::fmt::Write;

    let bytes: [u8; 13] = rand::random();
    let mut subject = String::with_capacity(7 + 2 * bytes.len());
    subject.push_str("_INBOX.");
    for byte in bytes {
        let _ = write!(subject, "{:02x}", byte);
    }
    subject
}
