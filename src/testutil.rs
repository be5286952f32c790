//! Byte-exact scripted peer for exercising the client side of a connection.

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

pub(crate) struct TestServer {
    stream: DuplexStream,
}

impl TestServer {
    pub fn new(stream: DuplexStream) -> Self {
        Self { stream }
    }

    /// Read exactly `expected.len()` bytes and compare them.
    pub async fn assert_read(&mut self, expected: &str) {
        let mut buf = vec![0u8; expected.len()];
        self.stream
            .read_exact(&mut buf)
            .await
            .expect("read from client");
        assert_eq!(String::from_utf8_lossy(&buf), expected);
    }

    /// Read one line, terminator included.
    pub async fn read_line(&mut self) -> String {
        let mut line = Vec::new();
        let mut byte = [0u8; 1];
        loop {
            self.stream
                .read_exact(&mut byte)
                .await
                .expect("read from client");
            line.push(byte[0]);
            if byte[0] == b'\n' {
                break;
            }
        }
        String::from_utf8(line).expect("client sent non-utf8 line")
    }

    pub async fn write(&mut self, bytes: &str) {
        self.stream
            .write_all(bytes.as_bytes())
            .await
            .expect("write to client");
    }
}
