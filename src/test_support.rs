//! In-memory fake [`Transport`] driving a minimal SFTP server, used only by
//! this crate's own tests to exercise the session/channel/multiplexer and
//! transfer-engine stack without a real SSH connection.
//!
//! Scenario tests get two knobs beyond a plain virtual filesystem: dropping a
//! specific occurrence of a message type (the caller's own timeout fires, as
//! it would against a server that stopped answering), and a ceiling on total
//! requests served (every request past it is silently dropped, simulating an
//! undocumented per-connection operation cap).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::protocol::{self, FileAttrs, MessageType, StatusCode};
use crate::session::{Session, SessionHandle, SessionStart};
use crate::transport::{Transport, TransportEvent};
use crate::Result;

/// Shared backing store for a [`FakeTransport`]. Kept separate from the
/// transport so a test retains a handle to file contents and directory
/// listings after the transport itself has been moved into a [`Session`].
#[derive(Clone, Default)]
pub struct FakeFilesystem(Arc<Mutex<FsState>>);

#[derive(Default)]
struct FsState {
    files: HashMap<String, Vec<u8>>,
    dirs: HashMap<String, Vec<(String, FileAttrs)>>,
    calls: Vec<String>,
}

impl FakeFilesystem {
    /// An empty filesystem.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Preseed a file's contents.
    #[must_use]
    pub fn with_file(self, path: impl Into<String>, content: Vec<u8>) -> Self {
        self.lock().files.insert(path.into(), content);
        self
    }

    /// Preseed a directory's listing.
    #[must_use]
    pub fn with_directory(self, path: impl Into<String>, entries: Vec<(&str, FileAttrs)>) -> Self {
        let entries = entries.into_iter().map(|(name, attrs)| (name.to_string(), attrs)).collect();
        self.lock().dirs.insert(path.into(), entries);
        self
    }

    /// Current contents of `path`, if the fake server has it.
    #[must_use]
    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    /// MKDIR/RMDIR/REMOVE calls served so far, in the order they arrived, as
    /// `"MKDIR /path"`-style entries, for asserting ordering invariants a
    /// recursive directory operation must honor.
    #[must_use]
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn record(&self, op: &str, path: &str) {
        self.lock().calls.push(format!("{op} {path}"));
    }

    fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains_key(path)
    }

    fn mark_dir(&self, path: &str) {
        self.lock().dirs.entry(path.to_string()).or_default();
    }

    fn remove_dir(&self, path: &str) {
        self.lock().dirs.remove(path);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FsState> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn ensure_file(&self, path: &str) {
        self.lock().files.entry(path.to_string()).or_default();
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) {
        let mut state = self.lock();
        let buf = state.files.entry(path.to_string()).or_default();
        let offset = offset as usize;
        let end = offset + data.len();
        if buf.len() < end {
            buf.resize(end, 0);
        }
        buf[offset..end].copy_from_slice(data);
    }

    fn read_at(&self, path: &str, offset: u64, len: u32) -> Vec<u8> {
        let state = self.lock();
        let Some(buf) = state.files.get(path) else {
            return Vec::new();
        };
        let offset = offset as usize;
        if offset >= buf.len() {
            return Vec::new();
        }
        let end = (offset + len as usize).min(buf.len());
        buf[offset..end].to_vec()
    }

    fn size_of(&self, path: &str) -> Option<u64> {
        self.lock().files.get(path).map(|b| b.len() as u64)
    }

    fn dir_entries(&self, path: &str) -> Vec<(String, FileAttrs)> {
        self.lock().dirs.get(path).cloned().unwrap_or_default()
    }
}

/// A minimal in-memory SFTP server driving enough of the protocol to
/// exercise the session/channel/multiplexer/transfer stack end to end, plus
/// fault injection for timeout and server-limit scenarios.
pub struct FakeTransport {
    fs: FakeFilesystem,
    recv_buf: BytesMut,
    outbox: VecDeque<TransportEvent>,
    open_files: HashMap<u32, String>,
    open_dirs: HashMap<u32, VecDeque<(String, FileAttrs)>>,
    next_handle: u32,
    seen: HashMap<MessageType, u32>,
    dropped: HashSet<(MessageType, u32)>,
    op_limit: Option<u32>,
    ops_served: u32,
}

impl FakeTransport {
    /// A fake server backed by `fs`, with no faults and no operation limit.
    #[must_use]
    pub fn new(fs: FakeFilesystem) -> Self {
        Self {
            fs,
            recv_buf: BytesMut::new(),
            outbox: VecDeque::new(),
            open_files: HashMap::new(),
            open_dirs: HashMap::new(),
            next_handle: 0,
            seen: HashMap::new(),
            dropped: HashSet::new(),
            op_limit: None,
            ops_served: 0,
        }
    }

    /// Drop the `occurrence`-th (0-based) request of `message_type` instead
    /// of answering it, so the caller's own timeout fires.
    #[must_use]
    pub fn drop_nth(mut self, message_type: MessageType, occurrence: u32) -> Self {
        self.dropped.insert((message_type, occurrence));
        self
    }

    /// Simulate a server that silently stops answering once more than `ops`
    /// requests have been served.
    #[must_use]
    pub fn limit_after(mut self, ops: u32) -> Self {
        self.op_limit = Some(ops);
        self
    }

    fn alloc_handle(&mut self) -> Bytes {
        let id = self.next_handle;
        self.next_handle += 1;
        Bytes::copy_from_slice(&id.to_be_bytes())
    }

    fn dispatch(&mut self, mut frame: Bytes) {
        if frame.is_empty() {
            return;
        }
        let type_byte = frame.get_u8();
        let Ok(msg_type) = MessageType::try_from(type_byte) else {
            return;
        };

        if matches!(msg_type, MessageType::Init) {
            let mut body = BytesMut::new();
            body.put_u32(protocol::SFTP_VERSION);
            let reply = protocol::codec::encode_packet(MessageType::Version as u8, &body);
            self.outbox.push_back(TransportEvent::ChannelData(reply.freeze()));
            return;
        }

        if frame.remaining() < 4 {
            return;
        }
        let id = frame.get_u32();

        let occurrence = *self.seen.get(&msg_type).unwrap_or(&0);
        self.seen.insert(msg_type, occurrence + 1);
        self.ops_served += 1;

        let over_limit = self.op_limit.is_some_and(|limit| self.ops_served > limit);
        let faulted = self.dropped.contains(&(msg_type, occurrence));
        if over_limit || faulted {
            return;
        }

        if let Some(reply) = self.handle_request(msg_type, id, frame) {
            self.outbox.push_back(TransportEvent::ChannelData(reply.freeze()));
        }
    }

    #[allow(clippy::too_many_lines)]
    fn handle_request(&mut self, msg_type: MessageType, id: u32, mut body: Bytes) -> Option<BytesMut> {
        let reply = match msg_type {
            MessageType::Open => {
                let path = protocol::codec::get_string(&mut body).ok()?;
                self.fs.ensure_file(&path);
                let handle = self.alloc_handle();
                self.open_files.insert(handle_id(&handle), path);
                handle_packet(id, &handle)
            }
            MessageType::Opendir => {
                let path = protocol::codec::get_string(&mut body).ok()?;
                let handle = self.alloc_handle();
                self.open_dirs.insert(handle_id(&handle), self.fs.dir_entries(&path).into());
                handle_packet(id, &handle)
            }
            MessageType::Close => {
                if let Ok(handle) = protocol::codec::get_bytes(&mut body) {
                    let hid = handle_id(&handle);
                    self.open_files.remove(&hid);
                    self.open_dirs.remove(&hid);
                }
                status_packet(id, StatusCode::Ok as u32, "")
            }
            MessageType::Write => {
                let handle = protocol::codec::get_bytes(&mut body).ok()?;
                if body.remaining() < 8 {
                    return Some(status_packet(id, StatusCode::BadMessage as u32, "truncated write"));
                }
                let offset = body.get_u64();
                let Ok(data) = protocol::codec::get_bytes(&mut body) else {
                    return Some(status_packet(id, StatusCode::BadMessage as u32, "truncated write data"));
                };
                match self.open_files.get(&handle_id(&handle)) {
                    Some(path) => {
                        self.fs.write_at(path, offset, &data);
                        status_packet(id, StatusCode::Ok as u32, "")
                    }
                    None => status_packet(id, StatusCode::Failure as u32, "no such handle"),
                }
            }
            MessageType::Read => {
                let handle = protocol::codec::get_bytes(&mut body).ok()?;
                if body.remaining() < 12 {
                    return Some(status_packet(id, StatusCode::BadMessage as u32, "truncated read"));
                }
                let offset = body.get_u64();
                let len = body.get_u32();
                match self.open_files.get(&handle_id(&handle)) {
                    Some(path) => {
                        let data = self.fs.read_at(path, offset, len);
                        if data.is_empty() && offset >= self.fs.size_of(path).unwrap_or(0) {
                            status_packet(id, StatusCode::Eof as u32, "")
                        } else {
                            data_packet(id, &data)
                        }
                    }
                    None => status_packet(id, StatusCode::Failure as u32, "no such handle"),
                }
            }
            MessageType::Readdir => {
                let handle = protocol::codec::get_bytes(&mut body).ok()?;
                match self.open_dirs.get_mut(&handle_id(&handle)) {
                    Some(remaining) if !remaining.is_empty() => {
                        let batch: Vec<_> = remaining.drain(..).map(|(name, attrs)| (name.clone(), name, attrs)).collect();
                        name_packet(id, &batch)
                    }
                    Some(_) => status_packet(id, StatusCode::Eof as u32, ""),
                    None => status_packet(id, StatusCode::Failure as u32, "no such handle"),
                }
            }
            MessageType::Stat | MessageType::Lstat => {
                let path = protocol::codec::get_string(&mut body).ok()?;
                if self.fs.is_dir(&path) {
                    attrs_packet(id, &FileAttrs::with_permissions(0o040_755))
                } else {
                    match self.fs.size_of(&path) {
                        Some(size) => attrs_packet(id, &FileAttrs::with_size(size)),
                        None => status_packet(id, StatusCode::NoSuchFile as u32, "not found"),
                    }
                }
            }
            MessageType::Fstat => {
                let handle = protocol::codec::get_bytes(&mut body).ok()?;
                match self.open_files.get(&handle_id(&handle)).and_then(|p| self.fs.size_of(p)) {
                    Some(size) => attrs_packet(id, &FileAttrs::with_size(size)),
                    None => status_packet(id, StatusCode::Failure as u32, "no such handle"),
                }
            }
            MessageType::Mkdir => {
                let path = protocol::codec::get_string(&mut body).ok()?;
                self.fs.mark_dir(&path);
                self.fs.record("MKDIR", &path);
                status_packet(id, StatusCode::Ok as u32, "")
            }
            MessageType::Rmdir => {
                let path = protocol::codec::get_string(&mut body).ok()?;
                self.fs.remove_dir(&path);
                self.fs.record("RMDIR", &path);
                status_packet(id, StatusCode::Ok as u32, "")
            }
            MessageType::Remove => {
                let path = protocol::codec::get_string(&mut body).ok()?;
                self.fs.record("REMOVE", &path);
                status_packet(id, StatusCode::Ok as u32, "")
            }
            MessageType::Setstat | MessageType::Rename => status_packet(id, StatusCode::Ok as u32, ""),
            MessageType::Realpath => {
                let path = protocol::codec::get_string(&mut body).ok()?;
                name_packet(id, &[(path.clone(), path, FileAttrs::default())])
            }
            other => status_packet(id, StatusCode::OpUnsupported as u32, &format!("unsupported in fake server: {other:?}")),
        };
        Some(reply)
    }
}

fn handle_id(handle: &Bytes) -> u32 {
    let mut arr = [0u8; 4];
    let len = handle.len().min(4);
    arr[4 - len..].copy_from_slice(&handle[handle.len() - len..]);
    u32::from_be_bytes(arr)
}

fn status_packet(id: u32, code: u32, message: &str) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(id);
    body.put_u32(code);
    protocol::codec::put_string(&mut body, message);
    protocol::codec::encode_packet(MessageType::Status as u8, &body)
}

fn handle_packet(id: u32, handle: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(id);
    protocol::codec::put_bytes(&mut body, handle);
    protocol::codec::encode_packet(MessageType::Handle as u8, &body)
}

fn data_packet(id: u32, data: &[u8]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(id);
    protocol::codec::put_bytes(&mut body, data);
    protocol::codec::encode_packet(MessageType::Data as u8, &body)
}

fn attrs_packet(id: u32, attrs: &FileAttrs) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(id);
    body.extend_from_slice(&attrs.encode());
    protocol::codec::encode_packet(MessageType::Attrs as u8, &body)
}

fn name_packet(id: u32, entries: &[(String, String, FileAttrs)]) -> BytesMut {
    let mut body = BytesMut::new();
    body.put_u32(id);
    body.put_u32(entries.len() as u32);
    for (filename, long_name, attrs) in entries {
        protocol::codec::put_string(&mut body, filename);
        protocol::codec::put_string(&mut body, long_name);
        body.extend_from_slice(&attrs.encode());
    }
    protocol::codec::encode_packet(MessageType::Name as u8, &body)
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&mut self) -> Result<()> {
        Ok(())
    }

    async fn open_session_channel(&mut self, initial_window: u32, max_packet: u32) -> Result<()> {
        self.outbox.push_back(TransportEvent::ChannelOpenConfirmation { initial_window, max_packet_size: max_packet });
        self.outbox.push_back(TransportEvent::ChannelSuccess);
        Ok(())
    }

    async fn write_channel_data(&mut self, data: Bytes) -> Result<()> {
        self.recv_buf.extend_from_slice(&data);
        while let Some(frame) = protocol::codec::try_decode(&mut self.recv_buf)? {
            self.dispatch(frame);
        }
        Ok(())
    }

    async fn adjust_window(&mut self, _delta: u32) -> Result<()> {
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        match self.outbox.pop_front() {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }

    async fn ping(&mut self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Handshake against `transport` and spawn its connection loop, returning a
/// handle ready for operations.
pub async fn spawn(transport: FakeTransport, handshake_timeout: Duration) -> Result<SessionHandle> {
    let SessionStart { handle, session } = Session::establish(Box::new(transport), handshake_timeout).await?;
    tokio::spawn(session.run());
    Ok(handle)
}
