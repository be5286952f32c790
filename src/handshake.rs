//! The protocol handshake performed on a freshly dialed transport, before a
//! session runs on it.
//!
//! The default [`Handshake`] reads the server's `INFO` greeting, upgrades
//! the transport to TLS when the server requires it, sends `CONNECT` with
//! the configured credentials and expects `+OK`. The whole exchange can be
//! bounded by a timeout.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::codec::Framed;
use crate::dial::BoxedTransport;
use crate::proto::{ClientFrame, ConnectOptions, ServerFrame};
use crate::Error;

#[async_trait]
pub trait Handshaker: Send {
    /// Prepare `stream` for a session, possibly replacing it.
    async fn handshake(&mut self, stream: BoxedTransport) -> Result<BoxedTransport, Error>;
}

/// Passes the transport through untouched.
pub struct NoHandshake;

#[async_trait]
impl Handshaker for NoHandshake {
    async fn handshake(&mut self, stream: BoxedTransport) -> Result<BoxedTransport, Error> {
        Ok(stream)
    }
}

/// `INFO` → optional TLS upgrade → `CONNECT` → `+OK` / `-ERR`.
pub struct Handshake {
    username: String,
    password: String,
    timeout: Duration,
    tls_server_name: String,
}

impl Handshake {
    /// A handshake with empty credentials, no timeout and `localhost` as
    /// the TLS server name.
    pub fn new() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            timeout: Duration::ZERO,
            tls_server_name: "localhost".to_string(),
        }
    }

    pub fn set_username(&mut self, username: impl Into<String>) -> &mut Self {
        self.username = username.into();
        self
    }

    pub fn set_password(&mut self, password: impl Into<String>) -> &mut Self {
        self.password = password.into();
        self
    }

    /// Bound the whole exchange. Zero (the default) means unlimited.
    pub fn set_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.timeout = timeout;
        self
    }

    /// Name presented during a TLS upgrade. The server certificate itself
    /// is not verified.
    pub fn set_tls_server_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.tls_server_name = name.into();
        self
    }

    async fn exchange(&self, stream: BoxedTransport) -> Result<BoxedTransport, Error> {
        let mut framed = Framed::new(stream);

        let info = match framed.next().await {
            Some(Ok(ServerFrame::Info(info))) => info,
            Some(Ok(frame)) => panic!("expected INFO, got {:?}", frame),
            Some(Err(error)) => return Err(error.into()),
            None => return Err(Error::ConnectionClosed),
        };

        let mut framed = if info.ssl_required {
            log::debug!("Server requires TLS; upgrading");
            let connector = TlsConnector::from(Arc::new(insecure_client_config()));
            let name = ServerName::try_from(self.tls_server_name.clone()).map_err(|_| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "invalid TLS server name",
                ))
            })?;
            let stream = connector.connect(name, framed.into_inner()).await?;
            Framed::new(Box::new(stream) as BoxedTransport)
        } else {
            framed
        };

        framed
            .send(ClientFrame::Connect(ConnectOptions {
                verbose: true,
                pedantic: true,
                user: self.username.clone(),
                pass: self.password.clone(),
            }))
            .await?;

        match framed.next().await {
            Some(Ok(ServerFrame::Ok)) => Ok(framed.into_inner()),
            Some(Ok(ServerFrame::Err(_))) => Err(Error::AuthenticationFailure),
            Some(Ok(frame)) => panic!("expected +OK or -ERR, got {:?}", frame),
            Some(Err(error)) => Err(error.into()),
            None => Err(Error::ConnectionClosed),
        }
    }
}

#[async_trait]
impl Handshaker for Handshake {
    async fn handshake(&mut self, stream: BoxedTransport) -> Result<BoxedTransport, Error> {
        if self.timeout.is_zero() {
            return self.exchange(stream).await;
        }

        // On timeout the in-flight exchange is dropped, closing the stream.
        match tokio::time::timeout(self.timeout, self.exchange(stream)).await {
            Ok(result) => result,
            Err(_) => Err(Error::HandshakeTimeout),
        }
    }
}

impl Default for Handshake {
    fn default() -> Self {
        Self::new()
    }
}

fn insecure_client_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(danger::NoCertificateVerification(
            rustls::crypto::aws_lc_rs::default_provider(),
        )))
        .with_no_client_auth()
}

mod danger {
    use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
    use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
    use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use rustls::DigitallySignedStruct;

    /// Accepts any server certificate. Signatures are still checked against
    /// the presented certificate.
    #[derive(Debug)]
    pub(super) struct NoCertificateVerification(pub CryptoProvider);

    impl ServerCertVerifier for NoCertificateVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, rustls::Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, rustls::Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::testutil::TestServer;
    use crate::Error;

    use super::{Handshake, Handshaker, NoHandshake};

    fn pair() -> (crate::dial::BoxedTransport, TestServer) {
        let (client_end, server_end) = tokio::io::duplex(1024);
        (Box::new(client_end), TestServer::new(server_end))
    }

    #[tokio::test]
    async fn handshake_succeeds() {
        let (stream, mut server) = pair();

        server.write("INFO {\"ssl_required\":false}\r\n").await;
        server.write("+OK\r\n").await;

        let mut handshake = Handshake::new();
        handshake.set_username("joe").set_password("s3cr3t");
        handshake.handshake(stream).await.unwrap();

        server
            .assert_read(
                "CONNECT {\"verbose\":true,\"pedantic\":true,\"user\":\"joe\",\"pass\":\"s3cr3t\"}\r\n",
            )
            .await;
    }

    #[tokio::test]
    async fn handshake_with_empty_credentials() {
        let (stream, mut server) = pair();

        server.write("INFO {}\r\n").await;
        server.write("+OK\r\n").await;

        Handshake::new().handshake(stream).await.unwrap();

        server
            .assert_read(
                "CONNECT {\"verbose\":true,\"pedantic\":true,\"user\":\"\",\"pass\":\"\"}\r\n",
            )
            .await;
    }

    #[tokio::test]
    async fn handshake_authentication_failure() {
        let (stream, mut server) = pair();

        server.write("INFO {}\r\n").await;
        server.write("-ERR 'Authorization Violation'\r\n").await;

        let result = Handshake::new().handshake(stream).await;
        assert!(matches!(result, Err(Error::AuthenticationFailure)));
    }

    #[tokio::test]
    #[should_panic(expected = "expected INFO")]
    async fn handshake_panics_on_unexpected_greeting() {
        let (stream, mut server) = pair();

        server.write("PING\r\n").await;

        let _ = Handshake::new().handshake(stream).await;
    }

    #[tokio::test]
    #[should_panic(expected = "expected +OK or -ERR")]
    async fn handshake_panics_on_unexpected_confirmation() {
        let (stream, mut server) = pair();

        server.write("INFO {}\r\n").await;
        server.write("PING\r\n").await;

        let _ = Handshake::new().handshake(stream).await;
    }

    #[tokio::test(start_paused = true)]
    async fn handshake_times_out() {
        let (stream, server) = pair();

        let mut handshake = Handshake::new();
        handshake.set_timeout(Duration::from_secs(1));

        let result = handshake.handshake(stream).await;
        assert!(matches!(result, Err(Error::HandshakeTimeout)));

        drop(server);
    }

    #[tokio::test]
    async fn handshake_fails_on_eof() {
        let (stream, server) = pair();
        drop(server);

        let result = Handshake::new().handshake(stream).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn no_handshake_passes_the_stream_through() {
        let (stream, _server) = pair();
        assert!(NoHandshake.handshake(stream).await.is_ok());
    }
}
