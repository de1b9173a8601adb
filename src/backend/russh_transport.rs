//! `Transport` implementation over a real SSH-2 connection via `russh`.

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use russh::client::{self, Msg};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, ChannelMsg};
use tracing::{debug, warn};

use crate::backend::russh_signer::RusshSigner;
use crate::config::{AlgorithmPreferences, AuthMethod, ClientConfig};
use crate::transport::{HostKeyVerifier, Signer, Transport, TransportEvent};
use crate::{Error, Result};

/// One SSH connection plus the single session channel opened on it for the
/// `sftp` subsystem. `connect` performs the handshake and authentication;
/// `open_session_channel` opens the channel and requests the subsystem;
/// every event after that (including the channel-open confirmation itself)
/// surfaces through `next_event`.
pub struct RusshTransport {
    host: String,
    port: u16,
    username: String,
    auth: AuthMethod,
    algorithms: AlgorithmPreferences,
    host_key_verifier: Arc<dyn HostKeyVerifier>,
    handle: Option<client::Handle<Handler>>,
    channel: Option<Channel<Msg>>,
    pending: Vec<TransportEvent>,
}

impl RusshTransport {
    /// Build a transport from a client configuration. `host_key_verifier`
    /// is separate from `config` since it is a trust decision, not a wire
    /// setting, and most callers supply one object for many connections.
    ///
    /// # Errors
    /// Returns `Error::Config` if `config.auth` is unset.
    pub fn new(config: &ClientConfig, host_key_verifier: Arc<dyn HostKeyVerifier>) -> Result<Self> {
        let auth = config
            .auth
            .clone()
            .ok_or_else(|| Error::Config("ClientConfig::auth must be set before connecting".into()))?;
        Ok(Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            auth,
            algorithms: config.algorithms.clone(),
            host_key_verifier,
            handle: None,
            channel: None,
            pending: Vec::new(),
        })
    }
}

#[async_trait]
impl Transport for RusshTransport {
    async fn connect(&mut self) -> Result<()> {
        let mut russh_config = client::Config::default();
        russh_config.preferred = build_preferred(&self.algorithms);

        let handler = Handler { verifier: self.host_key_verifier.clone() };
        let mut handle = client::connect(Arc::new(russh_config), format!("{}:{}", self.host, self.port), handler)
            .await
            .map_err(|e| Error::Transport(format!("SSH connection to {}:{} failed: {e}", self.host, self.port)))?;

        let authenticated = match &self.auth {
            AuthMethod::Password(password) => handle
                .authenticate_password(&self.username, password)
                .await
                .map_err(|e| Error::Authentication(format!("password authentication failed: {e}")))?,
            AuthMethod::PrivateKey(signer) => {
                let russh_signer = signer
                    .as_any()
                    .downcast_ref::<RusshSigner>()
                    .ok_or_else(|| Error::Config("RusshTransport requires a RusshSigner for private-key auth".into()))?;
                let key_with_alg = PrivateKeyWithHashAlg::new(Arc::new(russh_signer.private_key().clone()), None);
                handle
                    .authenticate_publickey(&self.username, key_with_alg)
                    .await
                    .map_err(|e| Error::Authentication(format!("public key authentication failed: {e}")))?
            }
        };

        if !authenticated.success() {
            return Err(Error::Authentication("server rejected the offered credentials".into()));
        }

        self.handle = Some(handle);
        Ok(())
    }

    async fn open_session_channel(&mut self, initial_window: u32, max_packet: u32) -> Result<()> {
        let handle = self.handle.as_mut().ok_or_else(|| Error::Transport("connect() must run before opening a channel".into()))?;

        let channel = handle
            .channel_open_session()
            .await
            .map_err(|e| Error::Transport(format!("channel open failed: {e}")))?;
        channel
            .request_subsystem(true, "sftp")
            .await
            .map_err(|e| Error::Transport(format!("sftp subsystem request failed: {e}")))?;

        // russh manages receive-window bookkeeping for us and does not
        // surface the peer's advertised numbers through its public Channel
        // API; we report back what we asked for, which is what the core's
        // ChannelManager will use as its own accounting baseline.
        self.pending.push(TransportEvent::ChannelOpenConfirmation { initial_window, max_packet_size: max_packet });
        self.channel = Some(channel);
        Ok(())
    }

    async fn write_channel_data(&mut self, data: Bytes) -> Result<()> {
        let channel = self.channel.as_ref().ok_or_else(|| Error::Transport("channel not open".into()))?;
        channel
            .data(&data[..])
            .await
            .map_err(|e| Error::Transport(format!("channel write failed: {e}")))?;
        Ok(())
    }

    async fn adjust_window(&mut self, _delta: u32) -> Result<()> {
        // russh replenishes its own receive window as data is consumed;
        // there is no public hook to request a manual WINDOW_ADJUST.
        Ok(())
    }

    async fn next_event(&mut self) -> Option<TransportEvent> {
        if let Some(event) = self.pending.pop() {
            return Some(event);
        }

        let channel = self.channel.as_mut()?;
        loop {
            return match channel.wait().await {
                Some(ChannelMsg::Data { data }) => Some(TransportEvent::ChannelData(Bytes::copy_from_slice(&data))),
                Some(ChannelMsg::ExtendedData { data, ext }) => {
                    debug!(ext, len = data.len(), "ignoring extended channel data");
                    continue;
                }
                Some(ChannelMsg::Success) => Some(TransportEvent::ChannelSuccess),
                Some(ChannelMsg::Failure) => Some(TransportEvent::ChannelFailure),
                Some(ChannelMsg::WindowAdjusted { new_size }) => Some(TransportEvent::ChannelWindowAdjust(new_size as u32)),
                Some(ChannelMsg::Eof | ChannelMsg::Close) => Some(TransportEvent::ChannelClose),
                Some(_) => continue,
                None => Some(TransportEvent::Close),
            };
        }
    }

    async fn ping(&mut self) -> Result<()> {
        // The real liveness probe is an SFTP round trip issued at the
        // session layer (SessionHandle::ping); this only confirms the
        // handle and channel haven't already been torn down locally.
        if self.handle.is_some() && self.channel.is_some() {
            Ok(())
        } else {
            Err(Error::Transport("not connected".into()))
        }
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            let _ = channel.close().await;
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.disconnect(russh::Disconnect::ByApplication, "", "en").await;
        }
        Ok(())
    }
}

fn build_preferred(algorithms: &AlgorithmPreferences) -> russh::Preferred {
    let mut preferred = russh::Preferred::default();
    if let Some(kex) = resolve_kex(&algorithms.kex) {
        preferred.kex = Cow::Owned(kex);
    }
    if let Some(key) = resolve_key(&algorithms.host_key) {
        preferred.key = Cow::Owned(key);
    }
    if let Some(cipher) = resolve_cipher(&algorithms.cipher) {
        preferred.cipher = Cow::Owned(cipher);
    }
    if let Some(mac) = resolve_mac(&algorithms.mac) {
        preferred.mac = Cow::Owned(mac);
    }
    preferred
}

type KexName = russh::kex::Name;
type CipherName = russh::cipher::Name;
type MacName = russh::mac::Name;
type KeyName = russh::key::Name;

fn resolve_kex(names: &[String]) -> Option<Vec<KexName>> {
    let resolved: Vec<_> = names
        .iter()
        .filter_map(|name| match name.as_str() {
            "curve25519-sha256" => Some(KexName::Curve25519Sha256),
            "ecdh-sha2-nistp384" => Some(KexName::EcdhSha2Nistp384),
            other => {
                warn!(name = other, "unrecognized key-exchange algorithm preference, skipping");
                None
            }
        })
        .collect();
    (!resolved.is_empty()).then_some(resolved)
}

fn resolve_key(names: &[String]) -> Option<Vec<KeyName>> {
    let resolved: Vec<_> = names
        .iter()
        .filter_map(|name| match name.as_str() {
            "ssh-ed25519" => Some(KeyName::Ed25519),
            "ecdsa-sha2-nistp384" => Some(KeyName::EcdsaSha2Nistp384),
            other => {
                warn!(name = other, "unrecognized host-key algorithm preference, skipping");
                None
            }
        })
        .collect();
    (!resolved.is_empty()).then_some(resolved)
}

fn resolve_cipher(names: &[String]) -> Option<Vec<CipherName>> {
    let resolved: Vec<_> = names
        .iter()
        .filter_map(|name| match name.as_str() {
            "aes256-gcm@openssh.com" => Some(CipherName::Aes256Gcm),
            "aes256-ctr" => Some(CipherName::Aes256Ctr),
            other => {
                warn!(name = other, "unrecognized cipher preference, skipping");
                None
            }
        })
        .collect();
    (!resolved.is_empty()).then_some(resolved)
}

fn resolve_mac(names: &[String]) -> Option<Vec<MacName>> {
    let resolved: Vec<_> = names
        .iter()
        .filter_map(|name| match name.as_str() {
            "hmac-sha2-512" => Some(MacName::HmacSha2_512),
            "hmac-sha2-256" => Some(MacName::HmacSha2_256),
            other => {
                warn!(name = other, "unrecognized MAC preference, skipping");
                None
            }
        })
        .collect();
    (!resolved.is_empty()).then_some(resolved)
}

struct Handler {
    verifier: Arc<dyn HostKeyVerifier>,
}

impl client::Handler for Handler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &russh::keys::PublicKey) -> std::result::Result<bool, Self::Error> {
        let blob = server_public_key.to_bytes().unwrap_or_default();
        let trusted = self.verifier.verify(&blob);
        if !trusted {
            warn!("host key rejected by configured verifier");
        }
        Ok(trusted)
    }
}
