//! A small, opinionated NATS client library. It strives to expose a small set
//! of features but still be easy to use.
//!
//! It is backed by tokio to allow clients to communicate with a NATS broker
//! over any transport implementing [`AsyncRead`] and [`AsyncWrite`].
//!
//! The entry point is [`Client`]: it dials the broker, performs the
//! handshake, and keeps the connection alive across transport failures,
//! re-establishing every live subscription on the new connection.
//!
//! [`AsyncRead`]: https://docs.rs/tokio/latest/tokio/io/trait.AsyncRead.html
//! [`AsyncWrite`]: https://docs.rs/tokio/latest/tokio/io/trait.AsyncWrite.html
//!
//! ## Examples
//!
//! ```no_run
//! # use slimnats::Client;
//! # tokio_test::block_on(async move {
//! let client = Client::new();
//!
//! let runner = client.clone();
//! tokio::spawn(async move {
//!     // Runs until the client is stopped, redialing on transport failure.
//!     runner.run_with_defaults("127.0.0.1:4222", "", "").await
//! });
//!
//! let mut sub = client.new_subscription("updates");
//! sub.subscribe().await;
//!
//! client.publish("updates", "hello").await;
//! while let Some(message) = sub.recv().await {
//!     println!("{:?}", message.payload);
//! }
//! # });
//! ```

pub mod client;
pub mod dial;
pub mod handshake;
pub mod session;

mod codec;
mod proto;

#[cfg(test)]
mod testutil;

pub use client::{Client, Subscription};
pub use dial::{BoxedTransport, Dialer, RetryingDialer, StaticDialer, TcpDialer, Transport};
pub use handshake::{Handshake, Handshaker, NoHandshake};
pub use proto::{ClientFrame, ConnectOptions, Message, ServerFrame, ServerInfo};
pub use session::Session;

use crate::codec::CodecError;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("reader: line too long")]
    LineTooLong,
    #[error("reader: unknown object")]
    UnknownObject,
    #[error("reader: invalid object")]
    InvalidObject,
    #[error("authentication failed")]
    AuthenticationFailure,
    #[error("handshake timed out")]
    HandshakeTimeout,
    #[error("connection closed for unknown reason")]
    ConnectionClosed,
}

impl From<CodecError> for Error {
    fn from(v: CodecError) -> Self {
        match v {
            CodecError::Io(io) => io.into(),
            CodecError::LineTooLong => Self::LineTooLong,
            CodecError::UnknownObject => Self::UnknownObject,
            CodecError::InvalidObject => Self::InvalidObject,
        }
    }
}
