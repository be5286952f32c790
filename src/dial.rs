//! Dialers produce connected transports for the client supervisor.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::Error;

/// Any full-duplex byte stream that can carry a session.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Transport handed between dialer, handshaker and session.
pub type BoxedTransport = Box<dyn Transport>;

#[async_trait]
pub trait Dialer: Send {
    /// Establish a connection. Called again after every session failure.
    async fn dial(&mut self) -> Result<BoxedTransport, Error>;
}

/// Dials a TCP address.
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&mut self) -> Result<BoxedTransport, Error> {
        let stream = TcpStream::connect(&self.addr).await?;
        Ok(Box::new(stream))
    }
}

/// Wraps another dialer with exponential backoff between attempts.
pub struct RetryingDialer<D> {
    inner: D,
    /// Maximum number of attempts; zero retries forever.
    pub max_attempts: u32,
}

impl<D: Dialer> RetryingDialer<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            max_attempts: 0,
        }
    }

    pub fn with_max_attempts(inner: D, max_attempts: u32) -> Self {
        Self {
            inner,
            max_attempts,
        }
    }
}

#[async_trait]
impl<D: Dialer> Dialer for RetryingDialer<D> {
    async fn dial(&mut self) -> Result<BoxedTransport, Error> {
        let mut last_error = None;
        let mut attempt: u32 = 0;

        loop {
            if self.max_attempts > 0 && attempt >= self.max_attempts {
                break;
            }

            match self.inner.dial().await {
                Ok(stream) => return Ok(stream),
                Err(error) => {
                    log::debug!("Dial attempt {} failed: {}", attempt, error);
                    last_error = Some(error);
                }
            }

            tokio::time::sleep(backoff(attempt)).await;
            attempt += 1;
        }

        Err(last_error.expect("expected an error"))
    }
}

/// Sleep before the next attempt: 8ms after the first failure, doubling up
/// to 4096ms.
fn backoff(attempt: u32) -> Duration {
    let exponent = (attempt + 3).min(12);
    Duration::from_millis(1 << exponent)
}

/// Hands out a single prepared transport, then fails.
pub struct StaticDialer(Option<BoxedTransport>);

impl StaticDialer {
    pub fn new(stream: impl Transport + 'static) -> Self {
        Self(Some(Box::new(stream)))
    }
}

#[async_trait]
impl Dialer for StaticDialer {
    async fn dial(&mut self) -> Result<BoxedTransport, Error> {
        self.0.take().ok_or(Error::ConnectionClosed)
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use crate::Error;

    use super::{backoff, BoxedTransport, Dialer, RetryingDialer, StaticDialer};

    #[derive(Default)]
    struct FailingDialer {
        attempts: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Dialer for FailingDialer {
        async fn dial(&mut self) -> Result<BoxedTransport, Error> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "refused",
            )))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_dialer_honors_max_attempts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let inner = FailingDialer {
            attempts: Arc::clone(&attempts),
        };
        let mut dialer = RetryingDialer::with_max_attempts(inner, 2);

        let result = dialer.dial().await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_dialer_backs_off_exponentially() {
        let start = tokio::time::Instant::now();
        let mut dialer = RetryingDialer::with_max_attempts(FailingDialer::default(), 3);

        assert!(dialer.dial().await.is_err());

        // 8 + 16 + 32 ms of backoff across the three attempts.
        assert_eq!(start.elapsed(), Duration::from_millis(56));
    }

    #[tokio::test]
    async fn retrying_dialer_passes_a_success_through() {
        let (client_end, _server_end) = tokio::io::duplex(64);
        let inner = StaticDialer::new(client_end);
        let mut dialer = RetryingDialer::new(inner);

        assert!(dialer.dial().await.is_ok());
    }

    #[tokio::test]
    async fn static_dialer_hands_out_its_transport_once() {
        let (client_end, _server_end) = tokio::io::duplex(64);
        let mut dialer = StaticDialer::new(client_end);

        assert!(dialer.dial().await.is_ok());
        assert!(matches!(dialer.dial().await, Err(Error::ConnectionClosed)));
    }

    #[test]
    fn backoff_is_clamped() {
        assert_eq!(backoff(0), Duration::from_millis(8));
        assert_eq!(backoff(1), Duration::from_millis(16));
        assert_eq!(backoff(9), Duration::from_millis(4096));
        assert_eq!(backoff(100), Duration::from_millis(4096));
    }
}
