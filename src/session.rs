//! An async communication session with a broker.
//!
//! A session is bound to a single already-handshaked connection. Any stream
//! that implements [`AsyncRead`] and [`AsyncWrite`] can carry one. The
//! stream is used to create a [`SessionTask`] that owns the transport and
//! runs the protocol engine; callers talk to the engine through the cheap,
//! cloneable [`Session`] handle.
//!
//! [`AsyncRead`]: https://docs.rs/tokio/latest/tokio/io/trait.AsyncRead.html
//! [`AsyncWrite`]: https://docs.rs/tokio/latest/tokio/io/trait.AsyncWrite.html
//!
//! ## Engine layout
//!
//! [`SessionTask::run`] spawns a reader task and a writer task over the two
//! halves of the transport and then loops classifying traffic:
//!
//!   * every outbound frame funnels through one queue into the writer task,
//!     which writes and flushes whole frames, so concurrent producers can
//!     never interleave bytes;
//!   * a server `PING` is answered with a queued `PONG`;
//!   * a server `PONG` releases the longest-waiting [`Session::ping`]
//!     caller, matching the order the `PING` frames were queued;
//!   * `MSG` and control frames are surfaced on an event channel consumed
//!     by the owning client.
//!
//! The engine is single-use: once `run` returns the session is dead. An
//! explicit [`Session::stop`] ends it without an error; otherwise the first
//! read or write error is sticky and becomes `run`'s return value.

mod pong;
mod task;

pub(crate) use task::SessionEvent;
pub use task::SessionTask;

use tokio::sync::{mpsc, oneshot};

use crate::proto::ClientFrame;

#[derive(Debug)]
pub(crate) enum TaskCommand {
    /// Queue one frame for the writer.
    Write(ClientFrame, oneshot::Sender<bool>),
    /// Queue several frames back to back.
    WriteBatch(Vec<ClientFrame>, oneshot::Sender<bool>),
    /// Queue a `PING` and reserve the next slot in the pong line.
    Ping(oneshot::Sender<bool>),
    /// Shut the session down without an error.
    Stop,
}

/// Handle to a running [`SessionTask`]. All clones drive the same session.
#[derive(Clone, Debug)]
pub struct Session {
    commands: mpsc::Sender<TaskCommand>,
}

impl Session {
    pub(crate) fn new(commands: mpsc::Sender<TaskCommand>) -> Self {
        Session { commands }
    }

    /// Queue `frame` on the session's writer.
    ///
    /// Returns `false` when the session has terminated.
    pub async fn write(&self, frame: ClientFrame) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(TaskCommand::Write(frame, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Queue `frames` so that no other producer's frame lands between them.
    pub async fn write_batch(&self, frames: Vec<ClientFrame>) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .commands
            .send(TaskCommand::WriteBatch(frames, tx))
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Send a `PING` and wait in line for the matching `PONG`.
    ///
    /// Returns `false` if the session terminates before the `PONG` arrives.
    pub async fn ping(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(TaskCommand::Ping(tx)).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Ask the session to shut down. Idempotent.
    pub async fn stop(&self) {
        let _ = self.commands.send(TaskCommand::Stop).await;
    }
}
