use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::BytesMut;
use futures::{Sink, Stream};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder};

use crate::proto::{self, ClientFrame, HeadLine, MsgHeader, ServerFrame};

/// Longest accepted header line, terminator included.
pub const MAX_LINE_LENGTH: usize = 4096;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("reader: line too long")]
    LineTooLong,
    #[error("reader: unknown object")]
    UnknownObject,
    #[error("reader: invalid object")]
    InvalidObject,
}

/// Decodes server frames and encodes client frames.
///
/// A `MSG` frame is decoded in two steps: the header line, then exactly
/// `nbytes + 2` payload bytes. The trailing two bytes are discarded
/// unchecked and the payload is returned verbatim.
#[derive(Debug, Default)]
pub struct Codec {
    pending: Option<MsgHeader>,
}

impl Codec {
    pub fn new() -> Self {
        Codec { pending: None }
    }
}

impl Decoder for Codec {
    type Item = ServerFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            if let Some(header) = self.pending.take() {
                let need = header.nbytes + 2;
                if src.len() < need {
                    src.reserve(need - src.len());
                    self.pending = Some(header);
                    return Ok(None);
                }

                let mut payload = src.split_to(need);
                payload.truncate(header.nbytes);
                return Ok(Some(ServerFrame::Msg(header.into_message(payload.freeze()))));
            }

            let newline = match src.iter().position(|&b| b == b'\n') {
                Some(index) => index,
                None => {
                    if src.len() >= MAX_LINE_LENGTH {
                        return Err(CodecError::LineTooLong);
                    }
                    return Ok(None);
                }
            };
            if newline + 1 > MAX_LINE_LENGTH {
                return Err(CodecError::LineTooLong);
            }

            let mut line = src.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                let stripped = line.len() - 1;
                line.truncate(stripped);
            }

            match proto::parse_head(&line)? {
                HeadLine::Done(frame) => return Ok(Some(frame)),
                HeadLine::NeedsPayload(header) => self.pending = Some(header),
            }
        }
    }
}

impl Encoder<&ClientFrame> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: &ClientFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

impl Encoder<ClientFrame> for Codec {
    type Error = CodecError;

    fn encode(&mut self, item: ClientFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        item.encode(dst)
    }
}

use pin_project_lite::pin_project;

pin_project! {
pub(crate) struct Framed<T> {
    #[pin]
    inner: tokio_util::codec::Framed<T, Codec>
}
}

impl<T: Unpin + AsyncRead + AsyncWrite> Framed<T> {
    pub fn new(stream: T) -> Self {
        Self {
            inner: tokio_util::codec::Framed::new(stream, Codec::new()),
        }
    }

    /// Recover the underlying stream, dropping any buffered data.
    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Stream for Framed<T>
where
    tokio_util::codec::Framed<T, Codec>: Stream,
{
    type Item = <tokio_util::codec::Framed<T, Codec> as Stream>::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        this.inner.poll_next(cx)
    }
}

impl<T: AsyncWrite, I> Sink<I> for Framed<T>
where
    Codec: Encoder<I>,
    tokio_util::codec::Framed<T, Codec>: Sink<I>,
{
    type Error = <tokio_util::codec::Framed<T, Codec> as Sink<I>>::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.inner.poll_ready(cx)
    }

    fn start_send(self: Pin<&mut Self>, item: I) -> Result<(), Self::Error> {
        let this = self.project();
        this.inner.start_send(item)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.inner.poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        let this = self.project();
        this.inner.poll_close(cx)
    }
}
