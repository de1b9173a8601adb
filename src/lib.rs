//! # Snow Owl SFTP Client
//!
//! An adaptive SFTPv3 client over an SSH-2 transport: a flow-controlled
//! channel layer, a request/reply multiplexer keyed by SFTP request id, and
//! a transfer engine that tunes its own chunk size and pipelining depth to
//! observed latency and throughput rather than fixed constants.
//!
//! The transport and signing backends are abstracted behind the
//! [`transport::Transport`] and [`transport::Signer`] traits; [`backend`]
//! provides a ready-to-use implementation of both over `russh`.
//!
//! [`Client`] is the facade most callers use; the lower-level modules
//! (`session`, `channel`, `multiplexer`, `adaptive`, `transfer`) are public
//! for callers who need to drive a session directly.

pub mod adaptive;
pub mod backend;
pub mod channel;
pub mod client;
pub mod cnsa;
pub mod config;
pub mod error;
pub mod events;
pub mod multiplexer;
pub mod protocol;
pub mod reconnect;
pub mod session;
#[cfg(test)]
mod test_support;
pub mod transfer;
pub mod transport;

pub use client::{Client, DirFilter};
pub use config::{
    AlgorithmPreferences, AuthMethod, AutoReconnectConfig, ClientConfig, HealthCheckConfig, HealthCheckMethod,
    KeepaliveConfig, LogFormat, LoggingConfig, SaturationPolicy, Timeouts,
};
pub use error::{Category, Classification, Error, Result, SuggestedAction};
pub use events::{Direction, Event, LimitKind, OperationKind, OperationRecord, Tracker};
pub use protocol::{DirEntry, FileAttrs, OpenFlags};
pub use session::{Handle, SessionHandle};
pub use transport::{HostKeyVerifier, Signer, Transport, TransportEvent, TrustOnFirstUse};
