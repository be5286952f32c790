//! Frame types for the text-line wire protocol.
//!
//! Lines are CRLF-terminated; the head token is matched case-insensitively
//! on read and written upper-case. `MSG` and `PUB` carry a byte-counted
//! payload followed by a trailing CRLF.

use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::codec::CodecError;

/// Server greeting carried as the JSON body of an `INFO` line.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
pub struct ServerInfo {
    #[serde(default)]
    pub server_id: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub auth_required: bool,
    #[serde(default)]
    pub ssl_required: bool,
    #[serde(default)]
    pub max_payload: i64,
}

/// JSON body of the `CONNECT` line. Fields are serialized in declaration
/// order.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ConnectOptions {
    pub verbose: bool,
    pub pedantic: bool,
    pub user: String,
    pub pass: String,
}

/// A message delivered by the server for one subscription.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    pub subject: String,
    /// Subscription id the server routed this message to.
    pub sid: u64,
    pub reply_to: Option<String>,
    pub payload: Bytes,
}

/// One frame read from the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ServerFrame {
    Info(ServerInfo),
    Ok,
    Err(Bytes),
    Ping,
    Pong,
    Msg(Message),
}

/// One frame written to the server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientFrame {
    Connect(ConnectOptions),
    Ping,
    Pong,
    Sub {
        sid: u64,
        subject: String,
        queue: Option<String>,
    },
    Unsub {
        sid: u64,
        maximum: Option<u64>,
    },
    Pub {
        subject: String,
        reply_to: Option<String>,
        payload: Bytes,
    },
}

/// Parsed `MSG` header, waiting for its payload bytes.
#[derive(Debug)]
pub(crate) struct MsgHeader {
    pub subject: String,
    pub sid: u64,
    pub reply_to: Option<String>,
    pub nbytes: usize,
}

impl MsgHeader {
    pub fn into_message(self, payload: Bytes) -> Message {
        Message {
            subject: self.subject,
            sid: self.sid,
            reply_to: self.reply_to,
            payload,
        }
    }
}

/// Outcome of parsing one header line.
pub(crate) enum HeadLine {
    Done(ServerFrame),
    NeedsPayload(MsgHeader),
}

fn tokens(line: &[u8]) -> Vec<&[u8]> {
    line.split(|b| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Byte range from the start of the second token to the end of the line.
fn body(line: &[u8]) -> Option<&[u8]> {
    let mut i = 0;
    while i < line.len() && line[i].is_ascii_whitespace() {
        i += 1;
    }
    while i < line.len() && !line[i].is_ascii_whitespace() {
        i += 1;
    }
    while i < line.len() && line[i].is_ascii_whitespace() {
        i += 1;
    }
    if i < line.len() {
        Some(&line[i..])
    } else {
        None
    }
}

fn parse_number(token: &[u8]) -> Result<u64, CodecError> {
    std::str::from_utf8(token)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(CodecError::InvalidObject)
}

fn parse_string(token: &[u8]) -> Result<String, CodecError> {
    String::from_utf8(token.to_vec()).map_err(|_| CodecError::InvalidObject)
}

fn parse_msg(line: &[u8]) -> Result<MsgHeader, CodecError> {
    let chunks = tokens(line);
    if chunks.len() < 4 {
        return Err(CodecError::InvalidObject);
    }

    let subject = parse_string(chunks[1])?;
    let sid = parse_number(chunks[2])?;

    // The reply subject is present iff the header has exactly five tokens.
    let (reply_to, nbytes_token) = if chunks.len() == 5 {
        (Some(parse_string(chunks[3])?), chunks[4])
    } else {
        (None, chunks[3])
    };
    let nbytes = parse_number(nbytes_token)? as usize;

    Ok(MsgHeader {
        subject,
        sid,
        reply_to,
        nbytes,
    })
}

/// Parse one header line (terminator already stripped).
pub(crate) fn parse_head(line: &[u8]) -> Result<HeadLine, CodecError> {
    let head = tokens(line).first().copied().unwrap_or(b"");

    match head.to_ascii_lowercase().as_slice() {
        b"msg" => Ok(HeadLine::NeedsPayload(parse_msg(line)?)),
        b"+ok" => Ok(HeadLine::Done(ServerFrame::Ok)),
        b"-err" => {
            let payload = body(line)
                .map(|b| Bytes::copy_from_slice(b))
                .unwrap_or_default();
            Ok(HeadLine::Done(ServerFrame::Err(payload)))
        }
        b"ping" => Ok(HeadLine::Done(ServerFrame::Ping)),
        b"pong" => Ok(HeadLine::Done(ServerFrame::Pong)),
        b"info" => {
            let info = match body(line) {
                Some(json) => {
                    serde_json::from_slice(json).map_err(|_| CodecError::InvalidObject)?
                }
                None => ServerInfo::default(),
            };
            Ok(HeadLine::Done(ServerFrame::Info(info)))
        }
        _ => Err(CodecError::UnknownObject),
    }
}

impl ClientFrame {
    /// Append the frame's wire bytes, trailing CRLF included.
    pub(crate) fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        match self {
            ClientFrame::Connect(options) => {
                let payload = serde_json::to_vec(options).map_err(|e| {
                    CodecError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))
                })?;
                dst.extend_from_slice(b"CONNECT ");
                dst.extend_from_slice(&payload);
                dst.extend_from_slice(b"\r\n");
            }
            ClientFrame::Ping => dst.extend_from_slice(b"PING\r\n"),
            ClientFrame::Pong => dst.extend_from_slice(b"PONG\r\n"),
            ClientFrame::Sub {
                sid,
                subject,
                queue,
            } => {
                let line = match queue {
                    Some(queue) => format!("SUB {} {} {}\r\n", subject, queue, sid),
                    None => format!("SUB {} {}\r\n", subject, sid),
                };
                dst.extend_from_slice(line.as_bytes());
            }
            ClientFrame::Unsub { sid, maximum } => {
                let line = match maximum {
                    Some(maximum) => format!("UNSUB {} {}\r\n", sid, maximum),
                    None => format!("UNSUB {}\r\n", sid),
                };
                dst.extend_from_slice(line.as_bytes());
            }
            ClientFrame::Pub {
                subject,
                reply_to,
                payload,
            } => {
                let header = match reply_to {
                    Some(reply_to) => {
                        format!("PUB {} {} {}\r\n", subject, reply_to, payload.len())
                    }
                    None => format!("PUB {} {}\r\n", subject, payload.len()),
                };
                dst.extend_from_slice(header.as_bytes());
                dst.extend_from_slice(payload);
                dst.extend_from_slice(b"\r\n");
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};

    use super::{ClientFrame, ConnectOptions};

    fn encoded(frame: ClientFrame) -> Vec<u8> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf.to_vec()
    }

    fn assert_encodes(frame: ClientFrame, expected: &str) {
        assert_eq!(encoded(frame), expected.as_bytes());
    }

    #[test]
    fn write_connect() {
        assert_encodes(
            ClientFrame::Connect(ConnectOptions {
                verbose: true,
                pedantic: true,
                user: "joe".to_string(),
                pass: "s3cr3t".to_string(),
            }),
            "CONNECT {\"verbose\":true,\"pedantic\":true,\"user\":\"joe\",\"pass\":\"s3cr3t\"}\r\n",
        );
    }

    #[test]
    fn write_ping() {
        assert_encodes(ClientFrame::Ping, "PING\r\n");
    }

    #[test]
    fn write_pong() {
        assert_encodes(ClientFrame::Pong, "PONG\r\n");
    }

    #[test]
    fn write_subscribe() {
        assert_encodes(
            ClientFrame::Sub {
                sid: 1,
                subject: "subject".to_string(),
                queue: Some("queue".to_string()),
            },
            "SUB subject queue 1\r\n",
        );
    }

    #[test]
    fn write_subscribe_without_queue() {
        assert_encodes(
            ClientFrame::Sub {
                sid: 1,
                subject: "subject".to_string(),
                queue: None,
            },
            "SUB subject 1\r\n",
        );
    }

    #[test]
    fn write_unsubscribe() {
        assert_encodes(
            ClientFrame::Unsub {
                sid: 1,
                maximum: Some(5),
            },
            "UNSUB 1 5\r\n",
        );
    }

    #[test]
    fn write_unsubscribe_without_maximum() {
        assert_encodes(
            ClientFrame::Unsub {
                sid: 1,
                maximum: None,
            },
            "UNSUB 1\r\n",
        );
    }

    #[test]
    fn write_publish() {
        assert_encodes(
            ClientFrame::Pub {
                subject: "subject".to_string(),
                reply_to: None,
                payload: Bytes::from_static(b"message"),
            },
            "PUB subject 7\r\nmessage\r\n",
        );
    }

    #[test]
    fn write_publish_with_reply() {
        assert_encodes(
            ClientFrame::Pub {
                subject: "subject".to_string(),
                reply_to: Some("reply".to_string()),
                payload: Bytes::from_static(b"message"),
            },
            "PUB subject reply 7\r\nmessage\r\n",
        );
    }

    #[test]
    fn write_publish_empty_payload() {
        assert_encodes(
            ClientFrame::Pub {
                subject: "subject".to_string(),
                reply_to: None,
                payload: Bytes::new(),
            },
            "PUB subject 0\r\n\r\n",
        );
    }
}
