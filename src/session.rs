//! The SFTP session: a single connection loop owning the transport, channel
//! state, and request table, plus the typed per-operation API driven through
//! it.
//!
//! Every public method sends a [`Command`] over an `mpsc` channel into
//! [`Session::run`] and awaits a `oneshot` reply. That loop is the only
//! caller of [`ChannelManager`] and [`RequestMultiplexer`]'s mutating
//! methods, so the channel's write side and the request table are each an
//! exclusive critical section without any lock: cooperative single-threaded
//! concurrency is sufficient because there is exactly one task touching
//! shared state.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, instrument, warn};

use crate::channel::{ChannelManager, ChannelOutcome};
use crate::multiplexer::{ExpectedKind, RequestMultiplexer};
use crate::protocol::{self, DirEntry, FileAttrs, MessageType, OpenFlags, Reply};
use crate::transport::{Transport, TransportEvent};
use crate::{Error, Result};

/// Default receive window this client grants the peer for the session
/// channel, sized generously so pipelined transfers are not window-starved.
pub const DEFAULT_RECV_WINDOW: u32 = 4 * 1024 * 1024;

/// Default ceiling this client advertises for inbound CHANNEL_DATA.
pub const DEFAULT_MAX_PACKET: u32 = 256 * 1024;

/// A server-side file or directory handle, opaque to this client beyond
/// being handed back verbatim on subsequent requests.
#[derive(Debug, Clone)]
pub struct Handle(pub(crate) Bytes);

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// INIT has been sent; waiting for VERSION.
    InitSent,
    /// VERSION negotiated; the session accepts operations.
    Ready,
    /// The session failed to establish or encountered a fatal protocol
    /// error.
    Failed,
    /// The session was closed, deliberately or by the peer.
    Closed,
}

/// One SFTP operation, sent from a `SessionHandle` to the connection loop.
enum Command {
    Request {
        message_type: MessageType,
        body: BytesMut,
        expected: ExpectedKind,
        timeout: Duration,
        responder: oneshot::Sender<Result<Reply>>,
    },
    Ping {
        responder: oneshot::Sender<Result<()>>,
    },
    ChannelHint {
        responder: oneshot::Sender<ChannelHint>,
    },
    Shutdown {
        responder: oneshot::Sender<Result<()>>,
    },
}

/// A snapshot of channel state the transfer engine's adaptive policy needs
/// but does not own, since the channel itself is only ever mutated from
/// inside the connection loop.
#[derive(Debug, Clone, Copy)]
pub struct ChannelHint {
    /// Current outbound window credit.
    pub send_window: i64,
    /// Largest chunk size safe to send in one SFTP WRITE payload.
    pub max_safe_chunk_size: u32,
}

/// A cheaply cloneable handle to a running [`Session`]'s connection loop.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::Sender<Command>,
}

impl SessionHandle {
    async fn call(&self, message_type: MessageType, body: BytesMut, expected: ExpectedKind, timeout: Duration) -> Result<Reply> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::Request {
                message_type,
                body,
                expected,
                timeout,
                responder,
            })
            .await
            .map_err(|_| Error::ConnectionLost("session loop has shut down".into()))?;
        rx.await.map_err(|_| Error::ConnectionLost("session loop dropped the request".into()))?
    }

    /// OPEN: request a file handle.
    #[instrument(skip(self))]
    pub async fn open(&self, path: &str, flags: OpenFlags, attrs: &FileAttrs, timeout: Duration) -> Result<Handle> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        body.put_u32(flags.0);
        body.extend_from_slice(&attrs.encode());
        match self.call(MessageType::Open, body, ExpectedKind::Handle, timeout).await? {
            Reply::Handle { handle, .. } => Ok(Handle(handle)),
            other => Err(Error::Protocol(format!("OPEN produced non-handle reply: {other:?}"))),
        }
    }

    /// OPENDIR: request a directory handle.
    #[instrument(skip(self))]
    pub async fn opendir(&self, path: &str, timeout: Duration) -> Result<Handle> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        match self.call(MessageType::Opendir, body, ExpectedKind::Handle, timeout).await? {
            Reply::Handle { handle, .. } => Ok(Handle(handle)),
            other => Err(Error::Protocol(format!("OPENDIR produced non-handle reply: {other:?}"))),
        }
    }

    /// CLOSE: release a file or directory handle.
    #[instrument(skip(self, handle))]
    pub async fn close(&self, handle: &Handle, timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_bytes(&mut body, &handle.0);
        self.call(MessageType::Close, body, ExpectedKind::StatusOnly, timeout).await?;
        Ok(())
    }

    /// READ: fetch up to `len` bytes at `offset`. Returns `None` at EOF.
    #[instrument(skip(self, handle))]
    pub async fn read(&self, handle: &Handle, offset: u64, len: u32, timeout: Duration) -> Result<Option<Bytes>> {
        let mut body = BytesMut::new();
        protocol::codec::put_bytes(&mut body, &handle.0);
        body.put_u64(offset);
        body.put_u32(len);
        match self.call(MessageType::Read, body, ExpectedKind::DataOrEof, timeout).await? {
            Reply::Data { data, .. } => Ok(Some(data)),
            Reply::Status { .. } => Ok(None),
            other => Err(Error::Protocol(format!("READ produced unexpected reply: {other:?}"))),
        }
    }

    /// WRITE: write `data` at `offset`.
    #[instrument(skip(self, handle, data))]
    pub async fn write(&self, handle: &Handle, offset: u64, data: &[u8], timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_bytes(&mut body, &handle.0);
        body.put_u64(offset);
        protocol::codec::put_bytes(&mut body, data);
        self.call(MessageType::Write, body, ExpectedKind::StatusOnly, timeout).await?;
        Ok(())
    }

    /// STAT: attributes by path, following symlinks.
    #[instrument(skip(self))]
    pub async fn stat(&self, path: &str, timeout: Duration) -> Result<FileAttrs> {
        self.stat_like(MessageType::Stat, path, timeout).await
    }

    /// LSTAT: attributes by path, not following symlinks.
    #[instrument(skip(self))]
    pub async fn lstat(&self, path: &str, timeout: Duration) -> Result<FileAttrs> {
        self.stat_like(MessageType::Lstat, path, timeout).await
    }

    async fn stat_like(&self, message_type: MessageType, path: &str, timeout: Duration) -> Result<FileAttrs> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        match self.call(message_type, body, ExpectedKind::Attrs, timeout).await? {
            Reply::Attrs { attrs, .. } => Ok(attrs),
            other => Err(Error::Protocol(format!("STAT produced non-attrs reply: {other:?}"))),
        }
    }

    /// FSTAT: attributes by open handle.
    #[instrument(skip(self, handle))]
    pub async fn fstat(&self, handle: &Handle, timeout: Duration) -> Result<FileAttrs> {
        let mut body = BytesMut::new();
        protocol::codec::put_bytes(&mut body, &handle.0);
        match self.call(MessageType::Fstat, body, ExpectedKind::Attrs, timeout).await? {
            Reply::Attrs { attrs, .. } => Ok(attrs),
            other => Err(Error::Protocol(format!("FSTAT produced non-attrs reply: {other:?}"))),
        }
    }

    /// SETSTAT: set attributes by path.
    #[instrument(skip(self, attrs))]
    pub async fn setstat(&self, path: &str, attrs: &FileAttrs, timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        body.extend_from_slice(&attrs.encode());
        self.call(MessageType::Setstat, body, ExpectedKind::StatusOnly, timeout).await?;
        Ok(())
    }

    /// READDIR: read the next batch of directory entries. Returns `None` at
    /// EOF (the caller must keep calling until this happens, per protocol —
    /// a single READDIR is not guaranteed to return the whole directory).
    #[instrument(skip(self, handle))]
    pub async fn readdir(&self, handle: &Handle, timeout: Duration) -> Result<Option<Vec<DirEntry>>> {
        let mut body = BytesMut::new();
        protocol::codec::put_bytes(&mut body, &handle.0);
        match self.call(MessageType::Readdir, body, ExpectedKind::NameOrEof, timeout).await? {
            Reply::Name { entries, .. } => Ok(Some(entries)),
            Reply::Status { .. } => Ok(None),
            other => Err(Error::Protocol(format!("READDIR produced unexpected reply: {other:?}"))),
        }
    }

    /// REMOVE: delete a file.
    #[instrument(skip(self))]
    pub async fn remove(&self, path: &str, timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        self.call(MessageType::Remove, body, ExpectedKind::StatusOnly, timeout).await?;
        Ok(())
    }

    /// RENAME: move or rename a file or directory.
    #[instrument(skip(self))]
    pub async fn rename(&self, from: &str, to: &str, timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, from);
        protocol::codec::put_string(&mut body, to);
        self.call(MessageType::Rename, body, ExpectedKind::StatusOnly, timeout).await?;
        Ok(())
    }

    /// MKDIR: create a directory.
    #[instrument(skip(self, attrs))]
    pub async fn mkdir(&self, path: &str, attrs: &FileAttrs, timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        body.extend_from_slice(&attrs.encode());
        self.call(MessageType::Mkdir, body, ExpectedKind::StatusOnly, timeout).await?;
        Ok(())
    }

    /// RMDIR: remove an empty directory.
    #[instrument(skip(self))]
    pub async fn rmdir(&self, path: &str, timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        self.call(MessageType::Rmdir, body, ExpectedKind::StatusOnly, timeout).await?;
        Ok(())
    }

    /// REALPATH: canonicalize a path.
    #[instrument(skip(self))]
    pub async fn realpath(&self, path: &str, timeout: Duration) -> Result<String> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, path);
        match self.call(MessageType::Realpath, body, ExpectedKind::RealpathName, timeout).await? {
            Reply::Name { entries, .. } => entries
                .into_iter()
                .next()
                .map(|e| e.filename)
                .ok_or_else(|| Error::Protocol("REALPATH returned no entries".into())),
            other => Err(Error::Protocol(format!("REALPATH produced unexpected reply: {other:?}"))),
        }
    }

    /// `fsync@openssh.com`: flush a handle's writes to stable storage. Falls
    /// back to treating `OP_UNSUPPORTED` as success — not every server
    /// implements this extension, and its absence is not itself an error
    /// condition for a caller that calls it defensively after every upload.
    #[instrument(skip(self, handle))]
    pub async fn fsync(&self, handle: &Handle, timeout: Duration) -> Result<()> {
        let mut body = BytesMut::new();
        protocol::codec::put_string(&mut body, "fsync@openssh.com");
        protocol::codec::put_bytes(&mut body, &handle.0);
        match self.call(MessageType::Extended, body, ExpectedKind::ExtendedOrStatus, timeout).await {
            Ok(_) => Ok(()),
            Err(Error::SftpStatus { code, .. }) if code == crate::protocol::StatusCode::OpUnsupported as u32 => {
                debug!("server does not support fsync@openssh.com; treating as a no-op");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Validate the connection is still responsive.
    pub async fn ping(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::Ping { responder })
            .await
            .map_err(|_| Error::ConnectionLost("session loop has shut down".into()))?;
        rx.await.map_err(|_| Error::ConnectionLost("session loop dropped the request".into()))?
    }

    /// Current channel window credit and safe chunk size, consulted by the
    /// transfer engine's adaptive policy. Best-effort: if the loop has
    /// already shut down, returns a conservative zero/minimal snapshot
    /// rather than erroring, since this is advisory input to a heuristic,
    /// not a correctness-critical read.
    pub async fn channel_hint(&self) -> ChannelHint {
        let (responder, rx) = oneshot::channel();
        if self.commands.send(Command::ChannelHint { responder }).await.is_err() {
            return ChannelHint { send_window: 0, max_safe_chunk_size: 8 * 1024 };
        }
        rx.await.unwrap_or(ChannelHint { send_window: 0, max_safe_chunk_size: 8 * 1024 })
    }

    /// Request a graceful shutdown of the connection loop.
    pub async fn shutdown(&self) -> Result<()> {
        let (responder, rx) = oneshot::channel();
        self.commands
            .send(Command::Shutdown { responder })
            .await
            .map_err(|_| Error::ConnectionLost("session loop has shut down".into()))?;
        rx.await.map_err(|_| Error::ConnectionLost("session loop dropped the request".into()))?
    }
}

/// Owns the transport, channel state, and request table for one SFTP
/// session, and drives them from a single task via [`Session::run`].
pub struct Session {
    transport: Box<dyn Transport>,
    channel: ChannelManager,
    multiplexer: RequestMultiplexer,
    commands: mpsc::Receiver<Command>,
    state: SessionState,
    /// Outbound requests waiting for send-window credit, drained in order.
    send_backlog: VecDeque<(u32, MessageType, BytesMut)>,
}

/// How a session starts: the handle to drive it and the background future
/// to spawn as its connection loop.
pub struct SessionStart {
    /// Handle for issuing operations against the running session.
    pub handle: SessionHandle,
    /// The connection loop; the caller is responsible for spawning this
    /// (typically via `tokio::spawn`).
    pub session: Session,
}

impl Session {
    /// Perform the SSH connect, open the session channel, request the
    /// `sftp` subsystem, and exchange INIT/VERSION, returning a handle plus
    /// the loop to spawn.
    #[instrument(skip(transport))]
    pub async fn establish(mut transport: Box<dyn Transport>, handshake_timeout: Duration) -> Result<SessionStart> {
        transport.connect().await?;
        transport
            .open_session_channel(DEFAULT_RECV_WINDOW, DEFAULT_MAX_PACKET)
            .await?;

        let (initial_window, max_packet_size) = await_channel_open(&mut *transport, handshake_timeout).await?;
        let mut channel = ChannelManager::new(initial_window, max_packet_size, DEFAULT_RECV_WINDOW);

        await_subsystem_ready(&mut *transport, handshake_timeout).await?;

        send_init(&mut *transport, &mut channel).await?;
        await_version(&mut *transport, &mut channel, handshake_timeout).await?;

        let (tx, rx) = mpsc::channel(64);
        let handle = SessionHandle { commands: tx };
        let session = Session {
            transport,
            channel,
            multiplexer: RequestMultiplexer::new(),
            commands: rx,
            state: SessionState::Ready,
            send_backlog: VecDeque::new(),
        };
        Ok(SessionStart { handle, session })
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Run the connection loop until shutdown, a fatal protocol error, or
    /// the transport closes. This is the single point of mutation for
    /// `channel` and `multiplexer`.
    pub async fn run(mut self) {
        const TIMEOUT_SWEEP_INTERVAL: Duration = Duration::from_millis(500);
        let mut sweep = tokio::time::interval(TIMEOUT_SWEEP_INTERVAL);

        loop {
            tokio::select! {
                biased;

                command = self.commands.recv() => {
                    match command {
                        Some(command) => {
                            if !self.handle_command(command).await {
                                break;
                            }
                        }
                        None => {
                            // All handles dropped; nothing left to serve.
                            self.state = SessionState::Closed;
                            break;
                        }
                    }
                }
                event = self.transport.next_event() => {
                    match event {
                        Some(event) => {
                            if let Err(err) = self.handle_transport_event(event).await {
                                error!(error = %err, "fatal transport event handling failure");
                                self.fail(&err.to_string());
                                break;
                            }
                        }
                        None => {
                            self.fail("transport event stream closed");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.multiplexer.sweep_timeouts(Instant::now());
                }
            }
            if self.state == SessionState::Closed || self.state == SessionState::Failed {
                break;
            }
        }
        self.multiplexer.fail_all_connection_lost("session loop exited");
    }

    fn fail(&mut self, reason: &str) {
        self.state = SessionState::Failed;
        self.multiplexer.fail_all_connection_lost(reason);
    }

    async fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Request {
                message_type,
                mut body,
                expected,
                timeout,
                responder,
            } => {
                if self.state != SessionState::Ready {
                    let _ = responder.send(Err(Error::ConnectionLost("session is not ready".into())));
                    return true;
                }
                let deadline = Instant::now() + timeout;
                let (id, rx) = self.multiplexer.begin(expected, deadline);
                body_prepend_id(&mut body, id);
                if let Err(err) = self.send_packet(message_type, &body).await {
                    self.multiplexer.cancel(id);
                    let _ = responder.send(Err(err));
                    return true;
                }
                tokio::spawn(forward_reply(rx, responder));
                true
            }
            Command::Ping { responder } => {
                let result = self.transport.ping().await;
                let _ = responder.send(result);
                true
            }
            Command::ChannelHint { responder } => {
                let _ = responder.send(ChannelHint {
                    send_window: self.channel.send_window(),
                    max_safe_chunk_size: self.channel.max_safe_chunk_size(),
                });
                true
            }
            Command::Shutdown { responder } => {
                let result = self.transport.disconnect().await;
                self.state = SessionState::Closed;
                let _ = responder.send(result);
                false
            }
        }
    }

    async fn send_packet(&mut self, message_type: MessageType, body: &BytesMut) -> Result<()> {
        let framed = protocol::codec::encode_packet(message_type as u8, body).freeze();
        for segment in self.channel.fragment(&framed)?.into_iter().map(Bytes::copy_from_slice) {
            while self.channel.reserve_send(segment.len() as u32).is_err() {
                // Wait for a WindowAdjust before sending further segments.
                match self.transport.next_event().await {
                    Some(event) => {
                        self.handle_transport_event(event).await?;
                    }
                    None => return Err(Error::ConnectionLost("transport closed while awaiting window credit".into())),
                }
            }
            self.transport.write_channel_data(segment).await?;
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match self.channel.ingest_event(event)? {
            ChannelOutcome::Packet(packet) => {
                self.route_packet(packet)?;
                while let Some(more) = self.channel.drain_buffered()? {
                    self.route_packet(more)?;
                }
                if self.channel.should_replenish_recv_window() {
                    let delta = self.channel.replenish_recv_window();
                    self.transport.adjust_window(delta).await?;
                }
            }
            ChannelOutcome::WindowAdjusted | ChannelOutcome::SubsystemReady | ChannelOutcome::Nothing => {}
            ChannelOutcome::SubsystemRejected => {
                return Err(Error::Protocol("server rejected the sftp subsystem request".into()));
            }
            ChannelOutcome::Closed => {
                self.state = SessionState::Closed;
            }
        }
        Ok(())
    }

    fn route_packet(&mut self, packet: Bytes) -> Result<()> {
        let reply = Reply::decode(packet)?;
        let Some(id) = reply.request_id() else {
            warn!("received an unsolicited VERSION after handshake; ignoring");
            return Ok(());
        };
        self.multiplexer.resolve(id, reply)
    }
}

async fn forward_reply(rx: oneshot::Receiver<Result<Reply>>, responder: oneshot::Sender<Result<Reply>>) {
    let outcome = rx.await.unwrap_or(Err(Error::ConnectionLost("request table dropped the waiter".into())));
    let _ = responder.send(outcome);
}

fn body_prepend_id(body: &mut BytesMut, id: u32) {
    let mut with_id = BytesMut::with_capacity(4 + body.len());
    with_id.put_u32(id);
    with_id.extend_from_slice(body);
    *body = with_id;
}

async fn await_channel_open(transport: &mut dyn Transport, timeout: Duration) -> Result<(u32, u32)> {
    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        match transport.next_event().await {
            Some(TransportEvent::ChannelOpenConfirmation { initial_window, max_packet_size }) => {
                return Ok((initial_window, max_packet_size));
            }
            Some(TransportEvent::Error(msg)) => return Err(Error::Transport(msg)),
            Some(_) => continue,
            None => return Err(Error::ConnectionLost("transport closed before channel open confirmation".into())),
        }
    }
}

async fn await_subsystem_ready(transport: &mut dyn Transport, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        match transport.next_event().await {
            Some(TransportEvent::ChannelSuccess) => return Ok(()),
            Some(TransportEvent::ChannelFailure) => {
                return Err(Error::Protocol("server rejected the sftp subsystem request".into()))
            }
            Some(TransportEvent::Error(msg)) => return Err(Error::Transport(msg)),
            Some(_) => continue,
            None => return Err(Error::ConnectionLost("transport closed before subsystem confirmation".into())),
        }
    }
}

async fn send_init(transport: &mut dyn Transport, channel: &mut ChannelManager) -> Result<()> {
    let mut body = BytesMut::new();
    body.put_u32(protocol::SFTP_VERSION);
    let framed = protocol::codec::encode_packet(MessageType::Init as u8, &body).freeze();
    for segment in channel.fragment(&framed)?.into_iter().map(Bytes::copy_from_slice) {
        channel.reserve_send(segment.len() as u32)?;
        transport.write_channel_data(segment).await?;
    }
    Ok(())
}

async fn await_version(transport: &mut dyn Transport, channel: &mut ChannelManager, timeout: Duration) -> Result<()> {
    let deadline = Instant::now() + timeout;
    loop {
        if Instant::now() >= deadline {
            return Err(Error::Timeout);
        }
        match transport.next_event().await {
            Some(event) => match channel.ingest_event(event)? {
                ChannelOutcome::Packet(packet) => {
                    return match Reply::decode(packet)? {
                        Reply::Version(version) if version == protocol::SFTP_VERSION => Ok(()),
                        Reply::Version(version) => Err(Error::Protocol(format!(
                            "server negotiated unsupported SFTP version {version}"
                        ))),
                        other => Err(Error::Protocol(format!("expected VERSION, got {other:?}"))),
                    };
                }
                ChannelOutcome::Closed => {
                    return Err(Error::ConnectionLost("channel closed before VERSION".into()))
                }
                _ => continue,
            },
            None => return Err(Error::ConnectionLost("transport closed before VERSION".into())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FileAttrs;
    use crate::test_support::{spawn, FakeFilesystem, FakeTransport};

    #[test]
    fn body_prepend_id_places_id_before_payload() {
        let mut body = BytesMut::new();
        body.put_u8(0xAB);
        body_prepend_id(&mut body, 7);
        let mut frozen = body.freeze();
        assert_eq!(frozen.get_u32(), 7);
        assert_eq!(frozen.get_u8(), 0xAB);
    }

    #[tokio::test]
    async fn readdir_lists_entries_including_dot_and_dotdot() {
        let fs = FakeFilesystem::new().with_directory(
            "/home",
            vec![
                (".", FileAttrs::with_permissions(0o040_755)),
                ("..", FileAttrs::with_permissions(0o040_755)),
                ("report.txt", FileAttrs::with_size(128)),
            ],
        );
        let handle = spawn(FakeTransport::new(fs), Duration::from_secs(5)).await.unwrap();

        let dir = handle.opendir("/home", Duration::from_secs(5)).await.unwrap();
        let entries = handle.readdir(&dir, Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries.iter().any(|e| e.filename == "."));
        assert!(entries.iter().any(|e| e.filename == ".."));

        let visible: Vec<_> = entries.iter().filter(|e| e.filename != "." && e.filename != "..").collect();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].filename, "report.txt");

        assert!(handle.readdir(&dir, Duration::from_secs(5)).await.unwrap().is_none());
    }
}
