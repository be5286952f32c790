use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};

use crate::codec::Codec;
use crate::proto::{ClientFrame, Message, ServerFrame};
use crate::session::pong::PongQueue;
use crate::session::{Session, TaskCommand};
use crate::Error;

use tokio_util::codec::{FramedRead, FramedWrite};

const COMMAND_BUFFER: usize = 100;
const WRITE_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Inbound traffic surfaced to the owning client.
#[derive(Debug)]
pub(crate) enum SessionEvent {
    /// An application message to route to the subscription registry.
    Message(Message),
    /// A control frame (`INFO`, `+OK`, `-ERR`) observed mid-session.
    Control(ServerFrame),
}

/// The protocol engine for one connection.
///
/// Single-use: [`run`](SessionTask::run) consumes the task and returns when
/// the session is stopped or the transport fails.
pub struct SessionTask<T> {
    stream: T,
    commands: mpsc::Receiver<TaskCommand>,
    events: mpsc::Sender<SessionEvent>,
}

impl<T> SessionTask<T>
where
    T: AsyncRead + AsyncWrite + Send + 'static,
{
    pub(crate) fn new(stream: T) -> (Self, Session, mpsc::Receiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        (
            Self {
                stream,
                commands: command_rx,
                events: event_tx,
            },
            Session::new(command_tx),
            event_rx,
        )
    }

    /// Run the session until it is stopped or the transport fails.
    ///
    /// An explicit stop reports no error; otherwise the first read or write
    /// error recorded by either half is returned.
    pub async fn run(self) -> Result<(), Error> {
        let SessionTask {
            stream,
            mut commands,
            events,
        } = self;

        let (read_half, write_half) = tokio::io::split(stream);

        let (write_tx, write_rx) = mpsc::channel::<ClientFrame>(WRITE_BUFFER);
        let (write_err_tx, mut write_err_rx) = oneshot::channel::<Error>();
        let writer = tokio::spawn(write_loop(write_half, write_rx, write_err_tx));

        let (read_tx, mut read_rx) = mpsc::channel::<Result<ServerFrame, Error>>(COMMAND_BUFFER);
        let (read_stop_tx, read_stop_rx) = oneshot::channel::<()>();
        let reader = tokio::spawn(read_loop(read_half, read_tx, read_stop_rx));

        // Responds to server PINGs by queueing a PONG for the writer.
        let (ping_tx, mut ping_rx) = mpsc::channel::<()>(COMMAND_BUFFER);
        let ponger_write_tx = write_tx.clone();
        let ponger = tokio::spawn(async move {
            while ping_rx.recv().await.is_some() {
                log::debug!("Responding to PING");
                if ponger_write_tx.send(ClientFrame::Pong).await.is_err() {
                    break;
                }
            }
        });

        let mut pongs = PongQueue::new();
        let mut result = Ok(());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    None | Some(TaskCommand::Stop) => break,
                    Some(TaskCommand::Write(frame, done)) => {
                        let ok = write_tx.send(frame).await.is_ok();
                        let _ = done.send(ok);
                    }
                    Some(TaskCommand::WriteBatch(frames, done)) => {
                        let mut ok = true;
                        for frame in frames {
                            if write_tx.send(frame).await.is_err() {
                                ok = false;
                                break;
                            }
                        }
                        let _ = done.send(ok);
                    }
                    Some(TaskCommand::Ping(waiter)) => {
                        // The reservation and the write must look atomic so
                        // that pong order matches wire order; both happen
                        // here, on the one task that also classifies PONGs.
                        if write_tx.send(ClientFrame::Ping).await.is_ok() {
                            pongs.push(waiter);
                        } else {
                            let _ = waiter.send(false);
                        }
                    }
                },
                inbound = read_rx.recv() => match inbound {
                    None => break,
                    Some(Ok(ServerFrame::Ping)) => {
                        let _ = ping_tx.send(()).await;
                    }
                    Some(Ok(ServerFrame::Pong)) => pongs.release_head(),
                    Some(Ok(ServerFrame::Msg(message))) => {
                        if events.send(SessionEvent::Message(message)).await.is_err() {
                            log::debug!("Dropping MSG; nobody is listening");
                        }
                    }
                    Some(Ok(frame)) => {
                        let _ = events.send(SessionEvent::Control(frame)).await;
                    }
                    Some(Err(error)) => {
                        result = Err(error);
                        break;
                    }
                },
                error = &mut write_err_rx => {
                    if let Ok(error) = error {
                        result = Err(error);
                    }
                    break;
                }
            }
        }

        // Shutdown: nobody gets a pong anymore, the reader is told to let go
        // of its half, and closing the write queue lets the writer drain and
        // exit. Both halves are dropped by their tasks, closing the socket.
        pongs.release_all();
        drop(ping_tx);
        drop(write_tx);
        let _ = read_stop_tx.send(());

        let _ = ponger.await;
        let _ = reader.await;
        let _ = writer.await;

        result
    }
}

async fn read_loop<T>(
    read_half: ReadHalf<T>,
    frames: mpsc::Sender<Result<ServerFrame, Error>>,
    mut stop: oneshot::Receiver<()>,
) where
    T: AsyncRead,
{
    let mut framed = FramedRead::new(read_half, Codec::new());

    loop {
        tokio::select! {
            _ = &mut stop => break,
            frame = framed.next() => match frame {
                Some(Ok(frame)) => {
                    if frames.send(Ok(frame)).await.is_err() {
                        break;
                    }
                }
                Some(Err(error)) => {
                    let _ = frames.send(Err(error.into())).await;
                    break;
                }
                None => {
                    let _ = frames.send(Err(Error::ConnectionClosed)).await;
                    break;
                }
            },
        }
    }
}

async fn write_loop<T>(
    write_half: WriteHalf<T>,
    mut frames: mpsc::Receiver<ClientFrame>,
    error_slot: oneshot::Sender<Error>,
) where
    T: AsyncWrite,
{
    let mut framed = FramedWrite::new(write_half, Codec::new());
    let mut error_slot = Some(error_slot);

    // After the first error, keep draining the queue so producers are not
    // blocked on a dead writer.
    while let Some(frame) = frames.recv().await {
        if error_slot.is_none() {
            continue;
        }
        if let Err(error) = framed.send(frame).await {
            log::warn!("Write failed: {}", error);
            if let Some(slot) = error_slot.take() {
                let _ = slot.send(error.into());
            }
        }
    }

    let _ = framed.into_inner().shutdown().await;
}

#[cfg(test)]
mod tests {
    use tokio::io::DuplexStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    use crate::proto::ClientFrame;
    use crate::session::{Session, SessionEvent};
    use crate::testutil::TestServer;
    use crate::Error;

    use super::SessionTask;

    fn make_session() -> (
        TestServer,
        Session,
        mpsc::Receiver<SessionEvent>,
        JoinHandle<Result<(), Error>>,
    ) {
        let (client_end, server_end) = tokio::io::duplex(1024);
        let (task, session, events) = SessionTask::<DuplexStream>::new(client_end);
        let join = tokio::spawn(task.run());
        (TestServer::new(server_end), session, events, join)
    }

    #[tokio::test]
    async fn pong_on_ping() {
        let (mut server, session, _events, join) = make_session();

        server.write("ping\r\n").await;
        server.assert_read("PONG\r\n").await;

        session.stop().await;
        join.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ping_waits_for_pong() {
        let (mut server, session, _events, _join) = make_session();

        let ping = tokio::spawn({
            let session = session.clone();
            async move { session.ping().await }
        });

        server.assert_read("PING\r\n").await;
        server.write("PONG\r\n").await;

        assert!(ping.await.unwrap());
    }

    #[tokio::test]
    async fn pongs_release_waiters_in_wire_order() {
        let (mut server, session, _events, _join) = make_session();
        let (results_tx, mut results) = mpsc::channel(3);

        for id in 1..=3u32 {
            let session = session.clone();
            let results_tx = results_tx.clone();
            tokio::spawn(async move {
                session.ping().await;
                let _ = results_tx.send(id).await;
            });
            // The PING reaching the wire means the slot is reserved.
            server.assert_read("PING\r\n").await;
        }

        for id in 1..=3u32 {
            server.write("PONG\r\n").await;
            assert_eq!(results.recv().await.unwrap(), id);
        }
    }

    #[tokio::test]
    async fn write_queues_whole_frames() {
        let (mut server, session, _events, _join) = make_session();

        assert!(
            session
                .write(ClientFrame::Pub {
                    subject: "subject".to_string(),
                    reply_to: None,
                    payload: bytes::Bytes::from_static(b"message"),
                })
                .await
        );
        server.assert_read("PUB subject 7\r\nmessage\r\n").await;
    }

    #[tokio::test]
    async fn write_batch_is_not_interleaved() {
        let (mut server, session, _events, _join) = make_session();

        assert!(
            session
                .write_batch(vec![
                    ClientFrame::Sub {
                        sid: 1,
                        subject: "subject".to_string(),
                        queue: None,
                    },
                    ClientFrame::Unsub {
                        sid: 1,
                        maximum: Some(5),
                    },
                ])
                .await
        );
        server.assert_read("SUB subject 1\r\nUNSUB 1 5\r\n").await;
    }

    #[tokio::test]
    async fn messages_surface_on_the_event_channel() {
        let (mut server, _session, mut events, _join) = make_session();

        server.write("MSG subject 1 7\r\npayload\r\n").await;

        match events.recv().await.unwrap() {
            SessionEvent::Message(message) => {
                assert_eq!(message.subject, "subject");
                assert_eq!(message.sid, 1);
                assert_eq!(message.reply_to, None);
                assert_eq!(&message.payload[..], b"payload");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn control_frames_surface_on_the_event_channel() {
        let (mut server, _session, mut events, _join) = make_session();

        server.write("+OK\r\n").await;

        match events.recv().await.unwrap() {
            SessionEvent::Control(crate::proto::ServerFrame::Ok) => {}
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn stop_reports_no_error() {
        let (_server, session, _events, join) = make_session();

        session.stop().await;
        join.await.unwrap().unwrap();

        // Operations on a stopped session fail without hanging.
        assert!(!session.ping().await);
        assert!(!session.write(ClientFrame::Ping).await);
    }

    #[tokio::test]
    async fn transport_eof_is_an_error() {
        let (server, _session, _events, join) = make_session();

        drop(server);
        let result = join.await.unwrap();
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn shutdown_releases_pending_pings() {
        let (mut server, session, _events, join) = make_session();

        let ping = tokio::spawn({
            let session = session.clone();
            async move { session.ping().await }
        });
        server.assert_read("PING\r\n").await;

        session.stop().await;
        join.await.unwrap().unwrap();
        assert!(!ping.await.unwrap());
    }

    #[tokio::test]
    async fn protocol_error_terminates_the_session() {
        let (mut server, _session, _events, join) = make_session();

        server.write("bogus\r\n").await;
        let result = join.await.unwrap();
        assert!(matches!(result, Err(Error::UnknownObject)));
    }
}
