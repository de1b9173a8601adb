//! SFTPv3 wire protocol: message types, status codes, flag bitsets, and the
//! packet codec (draft-ietf-secsh-filexfer-02).
//!
//! The SFTP protocol runs over the SSH connection protocol (RFC 4254), using
//! the "sftp" subsystem. A packet is framed as
//! `length:u32 | type:u8 | [request_id:u32] | payload`; INIT and VERSION omit
//! the request id.

pub mod attrs;
pub mod codec;

pub use attrs::FileAttrs;

use bytes::{Buf, Bytes};

/// SFTP protocol version this client speaks. Versions other than 3 are out
/// of scope; a VERSION reply carrying anything else fails the session.
pub const SFTP_VERSION: u32 = 3;

/// SFTP message types as defined by the protocol.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    /// Initialize SFTP session.
    Init = 1,
    /// Version response.
    Version = 2,
    /// Open file.
    Open = 3,
    /// Close file or directory handle.
    Close = 4,
    /// Read from file.
    Read = 5,
    /// Write to file.
    Write = 6,
    /// Get file attributes by path, following symlinks.
    Lstat = 7,
    /// Get file attributes by handle.
    Fstat = 8,
    /// Set file attributes by path.
    Setstat = 9,
    /// Set file attributes by handle.
    Fsetstat = 10,
    /// Open directory.
    Opendir = 11,
    /// Read directory entries.
    Readdir = 12,
    /// Remove file.
    Remove = 13,
    /// Create directory.
    Mkdir = 14,
    /// Remove directory.
    Rmdir = 15,
    /// Canonicalize a path.
    Realpath = 16,
    /// Get file attributes by path, not following symlinks.
    Stat = 17,
    /// Rename file or directory.
    Rename = 18,
    /// Read the target of a symbolic link.
    Readlink = 19,
    /// Create a symbolic link. Unused by this client (symlink creation is
    /// out of scope) but kept so an unsolicited server reply still decodes.
    Symlink = 20,
    /// Status response.
    Status = 101,
    /// Handle response.
    Handle = 102,
    /// Data response.
    Data = 103,
    /// Name response (directory listings, REALPATH).
    Name = 104,
    /// Attributes response.
    Attrs = 105,
    /// Vendor extension request.
    Extended = 200,
    /// Vendor extension reply.
    ExtendedReply = 201,
}

impl TryFrom<u8> for MessageType {
    type Error = crate::Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => MessageType::Init,
            2 => MessageType::Version,
            3 => MessageType::Open,
            4 => MessageType::Close,
            5 => MessageType::Read,
            6 => MessageType::Write,
            7 => MessageType::Lstat,
            8 => MessageType::Fstat,
            9 => MessageType::Setstat,
            10 => MessageType::Fsetstat,
            11 => MessageType::Opendir,
            12 => MessageType::Readdir,
            13 => MessageType::Remove,
            14 => MessageType::Mkdir,
            15 => MessageType::Rmdir,
            16 => MessageType::Realpath,
            17 => MessageType::Stat,
            18 => MessageType::Rename,
            19 => MessageType::Readlink,
            20 => MessageType::Symlink,
            101 => MessageType::Status,
            102 => MessageType::Handle,
            103 => MessageType::Data,
            104 => MessageType::Name,
            105 => MessageType::Attrs,
            200 => MessageType::Extended,
            201 => MessageType::ExtendedReply,
            other => {
                return Err(crate::Error::Protocol(format!(
                    "unknown SFTP message type: {other}"
                )))
            }
        })
    }
}

/// SFTP status codes.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Success.
    Ok = 0,
    /// End of file reached.
    Eof = 1,
    /// No such file or directory.
    NoSuchFile = 2,
    /// Permission denied.
    PermissionDenied = 3,
    /// General failure.
    Failure = 4,
    /// Garbled or otherwise invalid packet.
    BadMessage = 5,
    /// No connection to the server.
    NoConnection = 6,
    /// The connection was lost.
    ConnectionLost = 7,
    /// The requested operation is not supported.
    OpUnsupported = 8,
}

impl From<StatusCode> for u32 {
    fn from(code: StatusCode) -> u32 {
        code as u32
    }
}

/// Bitset of OPEN flags as defined by the protocol.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags(pub u32);

impl OpenFlags {
    /// Open for reading.
    pub const READ: u32 = 0x0000_0001;
    /// Open for writing.
    pub const WRITE: u32 = 0x0000_0002;
    /// Writes append rather than overwrite.
    pub const APPEND: u32 = 0x0000_0004;
    /// Create the file if it does not exist.
    pub const CREAT: u32 = 0x0000_0008;
    /// Truncate an existing file to zero length.
    pub const TRUNC: u32 = 0x0000_0010;
    /// Fail if the file already exists (requires CREAT).
    pub const EXCL: u32 = 0x0000_0020;

    /// True if the READ bit is set.
    #[must_use]
    pub fn has_read(&self) -> bool {
        self.0 & Self::READ != 0
    }

    /// True if the WRITE bit is set.
    #[must_use]
    pub fn has_write(&self) -> bool {
        self.0 & Self::WRITE != 0
    }

    /// True if the APPEND bit is set.
    #[must_use]
    pub fn has_append(&self) -> bool {
        self.0 & Self::APPEND != 0
    }

    /// True if the CREAT bit is set.
    #[must_use]
    pub fn has_creat(&self) -> bool {
        self.0 & Self::CREAT != 0
    }

    /// True if the TRUNC bit is set.
    #[must_use]
    pub fn has_trunc(&self) -> bool {
        self.0 & Self::TRUNC != 0
    }

    /// True if the EXCL bit is set.
    #[must_use]
    pub fn has_excl(&self) -> bool {
        self.0 & Self::EXCL != 0
    }
}

/// A directory entry as returned by READDIR or REALPATH: filename, the
/// server-formatted "long name" (`ls -l`-style), and parsed attributes.
#[derive(Debug, Clone)]
pub struct DirEntry {
    /// Bare filename, as it would be passed back to OPEN/STAT.
    pub filename: String,
    /// Server-formatted listing line; display-only, not parsed further.
    pub long_name: String,
    /// Parsed attributes for this entry.
    pub attrs: FileAttrs,
}

/// A fully decoded SFTP reply, tagged by the request id it answers (absent
/// for VERSION, which is unsolicited in response to INIT but still carries
/// no id on the wire).
#[derive(Debug, Clone)]
pub enum Reply {
    /// VERSION; carries the server's negotiated protocol version.
    Version(u32),
    /// STATUS; `code == 0` is success, anything else is an error.
    Status {
        /// Request id this reply answers.
        id: u32,
        /// Raw status code.
        code: u32,
        /// Human-readable message, empty if the server sent none.
        message: String,
    },
    /// HANDLE; an opaque byte string naming a server-side file or directory.
    Handle {
        /// Request id this reply answers.
        id: u32,
        /// Opaque handle bytes.
        handle: Bytes,
    },
    /// DATA; payload bytes from a READ.
    Data {
        /// Request id this reply answers.
        id: u32,
        /// Data bytes, possibly fewer than requested.
        data: Bytes,
    },
    /// NAME; a list of directory entries (READDIR) or exactly one entry
    /// (REALPATH).
    Name {
        /// Request id this reply answers.
        id: u32,
        /// Decoded entries.
        entries: Vec<DirEntry>,
    },
    /// ATTRS; parsed file attributes (STAT/LSTAT/FSTAT).
    Attrs {
        /// Request id this reply answers.
        id: u32,
        /// Parsed attributes.
        attrs: FileAttrs,
    },
    /// EXTENDED_REPLY; vendor-extension-specific payload, returned as-is.
    ExtendedReply {
        /// Request id this reply answers.
        id: u32,
        /// Raw reply payload.
        payload: Bytes,
    },
}

impl Reply {
    /// The request id this reply answers, if any (VERSION has none).
    #[must_use]
    pub fn request_id(&self) -> Option<u32> {
        match self {
            Reply::Version(_) => None,
            Reply::Status { id, .. }
            | Reply::Handle { id, .. }
            | Reply::Data { id, .. }
            | Reply::Name { id, .. }
            | Reply::Attrs { id, .. }
            | Reply::ExtendedReply { id, .. } => Some(*id),
        }
    }

    /// Parse one fully-framed SFTP reply payload (everything after the
    /// length prefix) into a typed [`Reply`].
    pub fn decode(mut payload: Bytes) -> crate::Result<Self> {
        if payload.is_empty() {
            return Err(crate::Error::Protocol("empty SFTP packet".into()));
        }
        let msg_type = MessageType::try_from(payload.get_u8())?;

        if matches!(msg_type, MessageType::Version) {
            if payload.remaining() < 4 {
                return Err(crate::Error::Protocol("truncated VERSION".into()));
            }
            return Ok(Reply::Version(payload.get_u32()));
        }

        if payload.remaining() < 4 {
            return Err(crate::Error::Protocol("truncated reply: missing request id".into()));
        }
        let id = payload.get_u32();

        Ok(match msg_type {
            MessageType::Status => {
                if payload.remaining() < 4 {
                    return Err(crate::Error::Protocol("truncated STATUS".into()));
                }
                let code = payload.get_u32();
                let message = codec::get_string(&mut payload).unwrap_or_default();
                Reply::Status { id, code, message }
            }
            MessageType::Handle => {
                let handle = codec::get_bytes(&mut payload)?;
                Reply::Handle { id, handle }
            }
            MessageType::Data => {
                let data = codec::get_bytes(&mut payload)?;
                Reply::Data { id, data }
            }
            MessageType::Name => {
                if payload.remaining() < 4 {
                    return Err(crate::Error::Protocol("truncated NAME count".into()));
                }
                let count = payload.get_u32() as usize;
                let mut entries = Vec::with_capacity(count.min(4096));
                for _ in 0..count {
                    let filename = codec::get_string(&mut payload)?;
                    let long_name = codec::get_string(&mut payload)?;
                    let attrs = FileAttrs::decode(&mut payload)?;
                    entries.push(DirEntry {
                        filename,
                        long_name,
                        attrs,
                    });
                }
                Reply::Name { id, entries }
            }
            MessageType::Attrs => {
                let attrs = FileAttrs::decode(&mut payload)?;
                Reply::Attrs { id, attrs }
            }
            MessageType::ExtendedReply => Reply::ExtendedReply {
                id,
                payload: payload.clone(),
            },
            other => {
                return Err(crate::Error::Protocol(format!(
                    "unexpected reply message type: {other:?}"
                )))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{BufMut, BytesMut};

    #[test]
    fn all_request_message_types_round_trip() {
        for (byte, expected) in [
            (1u8, MessageType::Init),
            (3, MessageType::Open),
            (4, MessageType::Close),
            (5, MessageType::Read),
            (6, MessageType::Write),
            (11, MessageType::Opendir),
            (12, MessageType::Readdir),
            (16, MessageType::Realpath),
            (18, MessageType::Rename),
        ] {
            assert_eq!(MessageType::try_from(byte).unwrap(), expected);
        }
    }

    #[test]
    fn unknown_message_type_is_protocol_error() {
        assert!(MessageType::try_from(99).is_err());
        assert!(MessageType::try_from(0).is_err());
    }

    #[test]
    fn status_reply_decodes_id_code_and_message() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Status as u8);
        buf.put_u32(42);
        buf.put_u32(StatusCode::NoSuchFile as u32);
        codec::put_string(&mut buf, "not found");

        let reply = Reply::decode(buf.freeze()).unwrap();
        match reply {
            Reply::Status { id, code, message } => {
                assert_eq!(id, 42);
                assert_eq!(code, StatusCode::NoSuchFile as u32);
                assert_eq!(message, "not found");
            }
            _ => panic!("expected Status"),
        }
    }

    #[test]
    fn realpath_style_name_reply_with_one_entry_decodes() {
        let mut buf = BytesMut::new();
        buf.put_u8(MessageType::Name as u8);
        buf.put_u32(7);
        buf.put_u32(1);
        codec::put_string(&mut buf, "/home/user");
        codec::put_string(&mut buf, "drwx------ /home/user");
        buf.extend_from_slice(&FileAttrs::default().encode());

        let reply = Reply::decode(buf.freeze()).unwrap();
        match reply {
            Reply::Name { id, entries } => {
                assert_eq!(id, 7);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].filename, "/home/user");
            }
            _ => panic!("expected Name"),
        }
    }

    #[test]
    fn open_flags_bits() {
        let flags = OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC);
        assert!(flags.has_write());
        assert!(flags.has_creat());
        assert!(flags.has_trunc());
        assert!(!flags.has_read());
        assert!(!flags.has_excl());
    }
}
