use super::registry::DeviceSession;
use super::{BoxedWriter, DeviceHub, SessionWriter};
use crate::model::ReportedState;
use crate::protocol::{
    echo_reply, DeviceMessage, MAX_LINE_LEN, REPLY_STATUS_RECEIVED, REPLY_WELCOME,
};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// A registered connection, handed to [`handle_session`] to run its loop.
pub struct SessionHandle {
    id: Uuid,
    addr: SocketAddr,
    writer: SessionWriter,
    closed: watch::Receiver<bool>,
}

impl DeviceHub {
    /// Registers a freshly accepted connection.
    pub fn open_session(&self, addr: SocketAddr, writer: BoxedWriter) -> SessionHandle {
        let writer: SessionWriter = Arc::new(tokio::sync::Mutex::new(writer));
        let (closer, closed) = watch::channel(false);
        let session = DeviceSession::new(addr, writer.clone(), closer);
        let id = session.id;
        let sessions = {
            let mut shared = self.lock();
            if shared.registry.register(session).is_some() {
                tracing::warn!(addr = %addr, "replaced existing session from same address");
            }
            if shared.state.reported_state == ReportedState::Disconnected {
                shared.state.reported_state = ReportedState::Unknown;
            }
            shared.registry.len()
        };
        tracing::info!(addr = %addr, session_id = %id, sessions, "device connected");
        SessionHandle {
            id,
            addr,
            writer,
            closed,
        }
    }

    fn close_session(&self, handle: &SessionHandle) {
        let mut shared = self.lock();
        shared.registry.unregister_session(handle.id);
        if shared
            .reply_waiter
            .as_ref()
            .is_some_and(|w| w.session_id == handle.id)
        {
            shared.reply_waiter = None;
        }
    }

    /// Hands `text` to a dispatcher waiting for this session's reply.
    fn deliver_reply(&self, session_id: Uuid, text: &str) -> bool {
        let waiter = {
            let mut shared = self.lock();
            let ours = shared
                .reply_waiter
                .as_ref()
                .is_some_and(|w| w.session_id == session_id);
            if ours {
                shared.reply_waiter.take()
            } else {
                None
            }
        };
        waiter.is_some_and(|w| w.tx.send(text.to_string()).is_ok())
    }

    /// Applies one device message and returns the inline reply, if any.
    fn handle_message(&self, session_id: Uuid, addr: SocketAddr, message: DeviceMessage) -> Option<String> {
        if let DeviceMessage::Ack(text) | DeviceMessage::Error(text) | DeviceMessage::Other(text) =
            &message
        {
            if self.deliver_reply(session_id, text) {
                tracing::debug!(addr = %addr, reply = %text, "routed device reply to dispatcher");
                return None;
            }
        }

        match message {
            DeviceMessage::Hello => {
                tracing::info!(addr = %addr, "device hello, sending welcome");
                Some(REPLY_WELCOME.to_string())
            }
            DeviceMessage::StatusInfo(text) => {
                let finished = self.lock().apply_status_info(&text);
                self.after_state_change(finished);
                tracing::info!(addr = %addr, status = %text, "device status info");
                Some(REPLY_STATUS_RECEIVED.to_string())
            }
            DeviceMessage::Ack(text) => {
                tracing::info!(addr = %addr, ack = %text, "device acknowledgment");
                None
            }
            DeviceMessage::Error(text) => {
                tracing::info!(addr = %addr, error = %text, "device reported error");
                None
            }
            DeviceMessage::Other(text) => Some(echo_reply(&text)),
        }
    }
}

/// Writes one line, giving up after `limit`. A peer that stops reading
/// would otherwise hold the session's writer forever.
pub(super) async fn write_line(writer: &SessionWriter, line: &str, limit: Duration) -> io::Result<()> {
    let write = async {
        let mut writer = writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    };
    tokio::time::timeout(limit, write)
        .await
        .unwrap_or_else(|_| Err(io::Error::new(io::ErrorKind::TimedOut, "device write timed out")))
}

/// One framed read from the device.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Line(String),
    /// A line longer than [`MAX_LINE_LEN`]; its bytes were dropped.
    Oversized,
}

/// Newline framing with a hard cap on buffered bytes. Once a line exceeds
/// the cap, input is dropped up to the next newline. Cancel safe: the only
/// await point is `fill_buf`, and progress is kept in `self`.
struct LineReader<R> {
    reader: R,
    buf: Vec<u8>,
    discarding: bool,
}

impl<R: AsyncBufRead + Unpin> LineReader<R> {
    fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(256),
            discarding: false,
        }
    }

    /// `Ok(None)` at end of stream. A trailing unterminated line is still
    /// returned before that.
    async fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        loop {
            let (used, done) = {
                let available = self.reader.fill_buf().await?;
                if available.is_empty() {
                    if self.discarding || self.buf.is_empty() {
                        self.discarding = false;
                        self.buf.clear();
                        return Ok(None);
                    }
                    return Ok(Some(Frame::Line(self.take_line())));
                }
                let (used, done) = match available.iter().position(|&b| b == b'\n') {
                    Some(idx) => (idx + 1, true),
                    None => (available.len(), false),
                };
                if !self.discarding {
                    let content = &available[..used - usize::from(done)];
                    if self.buf.len() + content.len() > MAX_LINE_LEN {
                        self.discarding = true;
                        self.buf.clear();
                    } else {
                        self.buf.extend_from_slice(content);
                    }
                }
                (used, done)
            };
            self.reader.consume(used);
            if done {
                if std::mem::take(&mut self.discarding) {
                    return Ok(Some(Frame::Oversized));
                }
                return Ok(Some(Frame::Line(self.take_line())));
            }
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.buf).into_owned();
        self.buf.clear();
        line
    }
}

/// Runs the read loop of one device connection until the peer closes, an
/// I/O error occurs, or the hub closes the session. The registry entry is
/// removed and the socket shut down on every exit path.
pub async fn handle_session<R>(reader: R, handle: SessionHandle, hub: DeviceHub) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let result = read_loop(reader, &handle, &hub).await;
    hub.close_session(&handle);
    let shutdown = async { handle.writer.lock().await.shutdown().await };
    let _ = tokio::time::timeout(hub.timing().reply_timeout, shutdown).await;
    match &result {
        Ok(()) => tracing::info!(addr = %handle.addr, "device disconnected"),
        Err(err)
            if matches!(
                err.kind(),
                io::ErrorKind::ConnectionReset | io::ErrorKind::UnexpectedEof
            ) =>
        {
            tracing::warn!(addr = %handle.addr, "device connection reset")
        }
        Err(err) => tracing::warn!(addr = %handle.addr, error = %err, "device session error"),
    }
    result
}

async fn read_loop<R>(reader: R, handle: &SessionHandle, hub: &DeviceHub) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send,
{
    let mut closed = handle.closed.clone();
    let mut lines = LineReader::new(BufReader::new(reader));
    let write_limit = hub.timing().reply_timeout;
    loop {
        let frame = tokio::select! {
            res = lines.next_frame() => res?,
            _ = closed.changed() => {
                tracing::info!(addr = %handle.addr, "device session closed by server");
                return Ok(());
            }
        };
        let line = match frame {
            None => return Ok(()),
            Some(Frame::Oversized) => {
                tracing::warn!(addr = %handle.addr, max = MAX_LINE_LEN, "discarding oversized device line");
                continue;
            }
            Some(Frame::Line(line)) => line,
        };

        let Some(message) = DeviceMessage::parse(&line) else {
            tracing::debug!(addr = %handle.addr, "ignoring blank device line");
            continue;
        };
        if let Some(reply) = hub.handle_message(handle.id, handle.addr, message) {
            write_line(&handle.writer, &reply, write_limit).await?;
        }
    }
}

/// Accepts device connections until `shutdown` fires, one task per connection.
pub async fn serve(
    listener: TcpListener,
    hub: DeviceHub,
    mut shutdown: watch::Receiver<bool>,
) -> io::Result<()> {
    tracing::info!(addr = ?listener.local_addr().ok(), "device listener ready");
    loop {
        let (stream, addr) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "device accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
            _ = shutdown.changed() => return Ok(()),
        };
        if let Err(err) = stream.set_nodelay(true) {
            tracing::debug!(addr = %addr, error = %err, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let handle = hub.open_session(addr, Box::new(write_half));
        let session_hub = hub.clone();
        tokio::spawn(async move {
            let _ = handle_session(read_half, handle, session_hub).await;
        });
    }
}
