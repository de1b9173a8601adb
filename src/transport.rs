//! Abstract collaborators the core consumes: the SSH transport below the
//! channel layer, and the signer behind private-key authentication.
//!
//! Neither trait's concrete implementation is this crate's concern — key
//! exchange, cipher negotiation, and signature generation are delegated.
//! `backend::russh_transport`/`backend::russh_signer` provide one concrete,
//! usable implementation of each so the crate works out of the box; callers
//! needing a different SSH stack implement these traits directly.

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

/// Events the transport reports about the single session channel this
/// client opens for the SFTP subsystem.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The peer confirmed the channel open, reporting its initial receive
    /// window and the maximum size of a single CHANNEL_DATA payload.
    ChannelOpenConfirmation {
        /// Window credit the peer initially grants us.
        initial_window: u32,
        /// Ceiling on one outbound CHANNEL_DATA payload.
        max_packet_size: u32,
    },
    /// The peer acknowledged a `want-reply` request (subsystem request).
    ChannelSuccess,
    /// The peer rejected a `want-reply` request.
    ChannelFailure,
    /// Inbound channel payload bytes.
    ChannelData(Bytes),
    /// The peer granted additional send-window credit.
    ChannelWindowAdjust(u32),
    /// The channel was closed (by either side).
    ChannelClose,
    /// A transport-level error occurred; the connection may still be alive.
    Error(String),
    /// The underlying connection closed.
    Close,
}

/// The SSH channel and connection operations the core needs. One
/// implementor instance owns exactly one session channel, used for the SFTP
/// subsystem.
///
/// Suspension points (`connect`, `next_event`, the write path) are where an
/// implementation may yield to I/O; the core does not assume any particular
/// scheduling model beyond the ordering guarantees documented on each
/// method.
#[async_trait]
pub trait Transport: Send {
    /// Establish the underlying SSH connection and authenticate.
    async fn connect(&mut self) -> Result<()>;

    /// Open the session channel and request the `sftp` subsystem on it,
    /// advertising `initial_window` and `max_packet` as this side's receive
    /// parameters. Returns once the request has been sent; the
    /// confirmation/success arrive as events from `next_event`.
    async fn open_session_channel(&mut self, initial_window: u32, max_packet: u32) -> Result<()>;

    /// Write one CHANNEL_DATA payload. Callers are responsible for ensuring
    /// `data.len()` does not exceed the peer's declared `max_packet_size`.
    async fn write_channel_data(&mut self, data: Bytes) -> Result<()>;

    /// Request `delta` additional bytes of receive-window credit from the
    /// peer (a WINDOW_ADJUST on our receive side).
    async fn adjust_window(&mut self, delta: u32) -> Result<()>;

    /// Await the next transport/channel event. Returns `None` once the
    /// event stream is permanently exhausted (equivalent to `Close`).
    async fn next_event(&mut self) -> Option<TransportEvent>;

    /// Validate that the connection is still alive, however the
    /// implementation sees fit (a no-op round trip at minimum).
    async fn ping(&mut self) -> Result<()>;

    /// Gracefully close the connection.
    async fn disconnect(&mut self) -> Result<()>;
}

/// A source of SSH public-key authentication material: a public key blob to
/// offer the server, and a signature over server-issued challenge bytes
/// under a server-negotiated algorithm name.
#[async_trait]
pub trait Signer: Send + Sync {
    /// The SSH-wire public key blob to present during authentication.
    fn public_key_blob(&self) -> Vec<u8>;

    /// Sign `data` using `algorithm_name` (one of `ssh-rsa`, `rsa-sha2-256`,
    /// `rsa-sha2-512`, `ssh-ed25519`, `ecdsa-sha2-nistp256`,
    /// `ecdsa-sha2-nistp384`, `ecdsa-sha2-nistp521`). RSA signers must honor
    /// whichever SHA-2 variant the server negotiated rather than defaulting
    /// to SHA-1.
    async fn sign(&self, data: &[u8], algorithm_name: &str) -> Result<Vec<u8>>;

    /// Narrows back to the concrete type. Lets a `Transport` implementation
    /// that is paired with a specific `Signer` (as `backend::russh_transport`
    /// is with `backend::russh_signer`) recover its native key material
    /// instead of re-deriving an authentication flow purely from `sign`.
    /// Implementations with no such pairing can return an opaque type.
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Host-key trust policy, delegated by this crate (§1 Non-goals: host-key
/// trust policy). There is deliberately no blanket "accept everything"
/// implementation shipped — a caller that wants that behavior must say so
/// explicitly by implementing it themselves.
pub trait HostKeyVerifier: Send + Sync {
    /// Decide whether `server_public_key_blob` (the server's SSH-wire
    /// public key) should be trusted for this connection.
    fn verify(&self, server_public_key_blob: &[u8]) -> bool;
}

/// A verifier that trusts any host key offered, recording it for later
/// comparison. Exists for local testing and first-run bootstrapping only;
/// production callers should pin against a known-hosts store instead.
pub struct TrustOnFirstUse;

impl HostKeyVerifier for TrustOnFirstUse {
    fn verify(&self, _server_public_key_blob: &[u8]) -> bool {
        true
    }
}
