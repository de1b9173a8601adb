//! SFTP file attribute records (`ATTRS`): a flags bitset plus the optional
//! fields it gates, encoded/decoded in protocol-fixed order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// POSIX file type, derived from the high nibble of `permissions` (`st_mode`
/// `S_IFMT` bits). `Unknown` covers a zero or unrecognized high nibble — the
/// server did not report permissions, or reported a type this client does
/// not interpret specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    /// Regular file (`S_IFREG`).
    File,
    /// Directory (`S_IFDIR`).
    Directory,
    /// Symbolic link (`S_IFLNK`).
    Symlink,
    /// Named pipe (`S_IFIFO`).
    Fifo,
    /// Unix domain socket (`S_IFSOCK`).
    Socket,
    /// Block device (`S_IFBLK`).
    BlockDevice,
    /// Character device (`S_IFCHR`).
    CharDevice,
    /// No permissions field, or an unrecognized type bit pattern.
    Unknown,
}

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;
const S_IFIFO: u32 = 0o010_000;
const S_IFSOCK: u32 = 0o140_000;
const S_IFBLK: u32 = 0o060_000;
const S_IFCHR: u32 = 0o020_000;

fn file_type_of(mode: u32) -> FileType {
    match mode & S_IFMT {
        S_IFREG => FileType::File,
        S_IFDIR => FileType::Directory,
        S_IFLNK => FileType::Symlink,
        S_IFIFO => FileType::Fifo,
        S_IFSOCK => FileType::Socket,
        S_IFBLK => FileType::BlockDevice,
        S_IFCHR => FileType::CharDevice,
        _ => FileType::Unknown,
    }
}

/// SFTPv3 file attributes: every field is optional, gated by a bit in the
/// flags word written ahead of them.
///
/// Encoding order is fixed by the protocol: size, uid/gid, permissions,
/// atime/mtime, then any extended pairs. Decoding only reads a field when
/// its flag bit is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// File size in bytes.
    pub size: Option<u64>,
    /// Owning user id.
    pub uid: Option<u32>,
    /// Owning group id.
    pub gid: Option<u32>,
    /// POSIX permission bits, including the type nibble.
    pub permissions: Option<u32>,
    /// Last access time, POSIX seconds.
    pub atime: Option<u32>,
    /// Last modification time, POSIX seconds.
    pub mtime: Option<u32>,
    /// Vendor-defined (name, value) pairs carried under the EXTENDED bit.
    pub extended: Vec<(String, Vec<u8>)>,
}

impl FileAttrs {
    const FLAG_SIZE: u32 = 0x0000_0001;
    const FLAG_UIDGID: u32 = 0x0000_0002;
    const FLAG_PERMISSIONS: u32 = 0x0000_0004;
    const FLAG_ACMODTIME: u32 = 0x0000_0008;
    const FLAG_EXTENDED: u32 = 0x8000_0000;

    /// Build attributes carrying only a size, as used by truncating a
    /// remote file via SETSTAT.
    #[must_use]
    pub fn with_size(size: u64) -> Self {
        Self {
            size: Some(size),
            ..Self::default()
        }
    }

    /// Build attributes carrying only permission bits, as used by `chmod`.
    #[must_use]
    pub fn with_permissions(mode: u32) -> Self {
        Self {
            permissions: Some(mode),
            ..Self::default()
        }
    }

    /// Derived POSIX file type from the permissions' high nibble, if known.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        self.permissions.map_or(FileType::Unknown, file_type_of)
    }

    /// True if this entry is a regular file.
    #[must_use]
    pub fn is_file(&self) -> bool {
        self.file_type() == FileType::File
    }

    /// True if this entry is a directory.
    #[must_use]
    pub fn is_directory(&self) -> bool {
        self.file_type() == FileType::Directory
    }

    /// True if this entry is a symbolic link.
    #[must_use]
    pub fn is_symlink(&self) -> bool {
        self.file_type() == FileType::Symlink
    }

    /// True if this entry is a named pipe.
    #[must_use]
    pub fn is_fifo(&self) -> bool {
        self.file_type() == FileType::Fifo
    }

    /// True if this entry is a Unix domain socket.
    #[must_use]
    pub fn is_socket(&self) -> bool {
        self.file_type() == FileType::Socket
    }

    /// True if this entry is a block device.
    #[must_use]
    pub fn is_block(&self) -> bool {
        self.file_type() == FileType::BlockDevice
    }

    /// True if this entry is a character device.
    #[must_use]
    pub fn is_char(&self) -> bool {
        self.file_type() == FileType::CharDevice
    }

    /// Encode to the wire format: flags word, then each present field in
    /// protocol order.
    #[must_use]
    pub fn encode(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        let mut flags = 0u32;

        if self.size.is_some() {
            flags |= Self::FLAG_SIZE;
        }
        if self.uid.is_some() && self.gid.is_some() {
            flags |= Self::FLAG_UIDGID;
        }
        if self.permissions.is_some() {
            flags |= Self::FLAG_PERMISSIONS;
        }
        if self.atime.is_some() && self.mtime.is_some() {
            flags |= Self::FLAG_ACMODTIME;
        }
        if !self.extended.is_empty() {
            flags |= Self::FLAG_EXTENDED;
        }

        buf.put_u32(flags);

        if let Some(size) = self.size {
            buf.put_u64(size);
        }
        if let (Some(uid), Some(gid)) = (self.uid, self.gid) {
            buf.put_u32(uid);
            buf.put_u32(gid);
        }
        if let Some(permissions) = self.permissions {
            buf.put_u32(permissions);
        }
        if let (Some(atime), Some(mtime)) = (self.atime, self.mtime) {
            buf.put_u32(atime);
            buf.put_u32(mtime);
        }
        if !self.extended.is_empty() {
            buf.put_u32(self.extended.len() as u32);
            for (name, value) in &self.extended {
                buf.put_u32(name.len() as u32);
                buf.put_slice(name.as_bytes());
                buf.put_u32(value.len() as u32);
                buf.put_slice(value);
            }
        }

        buf
    }

    /// Decode from the wire format, advancing `buf` past the consumed
    /// bytes. Fields are read only when the corresponding flag bit is set;
    /// any extended pairs present under the EXTENDED bit are always
    /// consumed, even though this client does not interpret their content.
    pub fn decode(buf: &mut Bytes) -> crate::Result<Self> {
        if buf.remaining() < 4 {
            return Err(crate::Error::Protocol("insufficient data for attrs flags".into()));
        }
        let flags = buf.get_u32();
        let mut attrs = FileAttrs::default();

        if flags & Self::FLAG_SIZE != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::Protocol("insufficient data for attrs size".into()));
            }
            attrs.size = Some(buf.get_u64());
        }

        if flags & Self::FLAG_UIDGID != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::Protocol("insufficient data for attrs uid/gid".into()));
            }
            attrs.uid = Some(buf.get_u32());
            attrs.gid = Some(buf.get_u32());
        }

        if flags & Self::FLAG_PERMISSIONS != 0 {
            if buf.remaining() < 4 {
                return Err(crate::Error::Protocol(
                    "insufficient data for attrs permissions".into(),
                ));
            }
            attrs.permissions = Some(buf.get_u32());
        }

        if flags & Self::FLAG_ACMODTIME != 0 {
            if buf.remaining() < 8 {
                return Err(crate::Error::Protocol(
                    "insufficient data for attrs atime/mtime".into(),
                ));
            }
            attrs.atime = Some(buf.get_u32());
            attrs.mtime = Some(buf.get_u32());
        }

        if flags & Self::FLAG_EXTENDED != 0 {
            if buf.remaining() < 4 {
                return Err(crate::Error::Protocol(
                    "insufficient data for attrs extended count".into(),
                ));
            }
            let count = buf.get_u32() as usize;
            for _ in 0..count {
                let name = super::codec::get_string(buf)?;
                let value = super::codec::get_bytes(buf)?;
                attrs.extended.push((name, value.to_vec()));
            }
        }

        Ok(attrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_encode_decode() {
        let attrs = FileAttrs {
            size: Some(4096),
            uid: Some(1000),
            gid: Some(1000),
            permissions: Some(0o100_644),
            atime: Some(1_700_000_000),
            mtime: Some(1_700_000_100),
            extended: vec![],
        };

        let mut encoded = attrs.encode().freeze();
        let decoded = FileAttrs::decode(&mut encoded).unwrap();
        assert_eq!(attrs, decoded);
    }

    #[test]
    fn only_flagged_fields_are_populated() {
        let attrs = FileAttrs::with_size(42);
        let mut encoded = attrs.encode().freeze();
        let decoded = FileAttrs::decode(&mut encoded).unwrap();
        assert_eq!(decoded.size, Some(42));
        assert!(decoded.uid.is_none());
        assert!(decoded.permissions.is_none());
    }

    #[test]
    fn file_type_predicates_read_the_high_nibble() {
        let dir = FileAttrs::with_permissions(0o040_755);
        assert!(dir.is_directory());
        assert!(!dir.is_file());

        let link = FileAttrs::with_permissions(0o120_777);
        assert!(link.is_symlink());

        let regular = FileAttrs::with_permissions(0o100_644);
        assert!(regular.is_file());

        let unknown = FileAttrs::default();
        assert!(!unknown.is_file() && !unknown.is_directory());
    }

    #[test]
    fn extended_pairs_round_trip() {
        let attrs = FileAttrs {
            extended: vec![("acl@openssh.com".to_string(), vec![1, 2, 3])],
            ..Default::default()
        };
        let mut encoded = attrs.encode().freeze();
        let decoded = FileAttrs::decode(&mut encoded).unwrap();
        assert_eq!(decoded.extended, attrs.extended);
    }
}
