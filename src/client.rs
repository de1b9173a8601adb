//! The public client facade: one entry point that owns a session,
//! the concurrency/permit gate, the event tracker, and the background
//! keepalive/health-check/reconnect loop.
//!
//! Every lower-level module (`session`, `channel`, `multiplexer`,
//! `transfer`, `adaptive`, `reconnect`) is built on the discipline that
//! exactly one caller drives its mutating methods. This module is that
//! caller for the reconnect-policy objects, and the one layer that holds
//! a `ClientConfig` a transport can be rebuilt from.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::backend::RusshTransport;
use crate::config::{ClientConfig, HealthCheckMethod, SaturationPolicy};
use crate::events::{Event, OperationKind, Tracker};
use crate::protocol::{DirEntry, FileAttrs, OpenFlags, StatusCode};
use crate::reconnect::{HealthCheck, Keepalive, KeepaliveOutcome, ReconnectManager, ReconnectStep};
use crate::session::{Handle, Session, SessionHandle, SessionStart};
use crate::transfer::{self, ReconnectHook};
use crate::transport::{HostKeyVerifier, Transport, TrustOnFirstUse};
use crate::{Error, Result};

/// A caller-supplied predicate for filtering directory listings, shared
/// across the recursive directory helpers.
pub type DirFilter = Arc<dyn Fn(&DirEntry) -> bool + Send + Sync>;

struct Inner {
    config: ClientConfig,
    host_key_verifier: Arc<dyn HostKeyVerifier>,
    session: RwLock<SessionHandle>,
    tracker: Tracker,
    semaphore: Arc<Semaphore>,
    shutdown: CancellationToken,
}

#[async_trait::async_trait]
impl ReconnectHook for Inner {
    async fn reconnect_for_read(&self, old_handle: &Handle, path: &str) -> Result<(SessionHandle, Handle)> {
        let timeout = self.config.timeouts.operation;
        let old_session = self.session.read().await.clone();
        let _ = old_session.close(old_handle, timeout).await;

        let new_session = establish_session(&self.config, self.host_key_verifier.clone()).await?;
        *self.session.write().await = new_session.clone();

        let new_handle = new_session.open(path, OpenFlags(OpenFlags::READ), &FileAttrs::default(), timeout).await?;
        Ok((new_session, new_handle))
    }
}

/// Adaptive SFTPv3 client. Connect with [`Client::connect`], drive
/// operations through its methods, and release resources with
/// [`Client::end`].
pub struct Client {
    inner: Arc<Inner>,
    background: Option<JoinHandle<()>>,
}

impl Client {
    /// Connect using the given configuration and a trust-on-first-use host
    /// key policy. For production use, prefer [`Client::connect_with_verifier`]
    /// with a verifier backed by a known-hosts store.
    ///
    /// # Errors
    /// Returns `Error::Config` if `config` fails validation or carries no
    /// `auth`, or any connect/handshake/authentication error the transport
    /// reports.
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        Self::connect_with_verifier(config, Arc::new(TrustOnFirstUse)).await
    }

    /// Connect using the given configuration and host-key verifier.
    ///
    /// # Errors
    /// Same as [`Client::connect`].
    pub async fn connect_with_verifier(config: ClientConfig, host_key_verifier: Arc<dyn HostKeyVerifier>) -> Result<Self> {
        config.validate()?;

        let tracker = Tracker::new(crate::events::DEFAULT_PROGRESS_THROTTLE);
        tracker.emit_event(Event::ConnectionStart);
        tracker.emit_event(Event::ConnectionAuthenticating);

        let session = match establish_session(&config, host_key_verifier.clone()).await {
            Ok(session) => session,
            Err(err) => {
                tracker.emit_event(Event::ConnectionError { message: err.to_string() });
                return Err(err);
            }
        };
        tracker.emit_event(Event::ConnectionReady);

        let inner = Arc::new(Inner {
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_ops)),
            session: RwLock::new(session),
            tracker,
            host_key_verifier,
            shutdown: CancellationToken::new(),
            config,
        });

        let background = tokio::spawn(run_background(inner.clone()));

        Ok(Self {
            inner,
            background: Some(background),
        })
    }

    /// Subscribe to the client's event stream.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.tracker.subscribe()
    }

    /// Currently active operations, for a caller building a status display.
    #[must_use]
    pub fn active_operations(&self) -> Vec<crate::events::OperationRecord> {
        self.inner.tracker.active_operations()
    }

    async fn current_session(&self) -> SessionHandle {
        self.inner.session.read().await.clone()
    }

    fn timeout(&self) -> Duration {
        self.inner.config.timeouts.operation
    }

    async fn permit(&self) -> Result<tokio::sync::OwnedSemaphorePermit> {
        acquire_permit(&self.inner).await
    }

    /// List a directory's entries. `.` and `..` are always stripped; `filter`,
    /// if given, is applied on top of that.
    ///
    /// # Errors
    /// Any error the OPENDIR/READDIR exchange reports.
    pub async fn list(&self, path: &str, filter: Option<DirFilter>) -> Result<Vec<DirEntry>> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Readdir, Some(path.to_string()), None, None);

        let result = read_all_entries(&session, path, timeout).await;
        match result {
            Ok(mut entries) => {
                entries.retain(|e| e.filename != "." && e.filename != "..");
                if let Some(filter) = &filter {
                    entries.retain(|e| filter(e));
                }
                self.inner.tracker.complete(id);
                Ok(entries)
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// STAT: attributes by path, following symlinks.
    ///
    /// # Errors
    /// Any error the STAT exchange reports.
    pub async fn stat(&self, path: &str) -> Result<FileAttrs> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Stat, Some(path.to_string()), None, None);
        match session.stat(path, timeout).await {
            Ok(attrs) => {
                self.inner.tracker.complete(id);
                Ok(attrs)
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// Whether `path` exists, treating a `NoSuchFile` status as `false`
    /// rather than an error.
    ///
    /// # Errors
    /// Any STAT error other than `NoSuchFile`.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Stat, Some(path.to_string()), None, None);
        match session.stat(path, timeout).await {
            Ok(_) => {
                self.inner.tracker.complete(id);
                Ok(true)
            }
            Err(Error::SftpStatus { code, .. }) if code == StatusCode::NoSuchFile as u32 => {
                self.inner.tracker.complete(id);
                Ok(false)
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// Download `remote` to `dest`, returning the number of bytes written.
    ///
    /// # Errors
    /// Any error the OPEN/READ exchange reports, or a local filesystem error.
    pub async fn get(&self, remote: &str, dest: &Path) -> Result<u64> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();

        let total_bytes = session.stat(remote, timeout).await.ok().and_then(|a| a.size);
        let id = self
            .inner
            .tracker
            .start(OperationKind::Get, Some(remote.to_string()), Some(dest.display().to_string()), total_bytes);

        let result = async {
            let handle = session.open(remote, OpenFlags(OpenFlags::READ), &FileAttrs::default(), timeout).await?;
            transfer::download(&session, handle, remote, dest, total_bytes, self.inner.as_ref(), &self.inner.tracker, id).await
        }
        .await;

        match result {
            Ok(bytes) => {
                self.inner.tracker.complete(id);
                Ok(bytes)
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// Upload `src` to `remote`, overwriting any existing file, returning
    /// the number of bytes written.
    ///
    /// # Errors
    /// Any error the OPEN/WRITE exchange reports, or a local filesystem error.
    pub async fn put(&self, src: &Path, remote: &str) -> Result<u64> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();

        let total_bytes = tokio::fs::metadata(src).await.ok().map(|m| m.len());
        let id = self
            .inner
            .tracker
            .start(OperationKind::Put, Some(remote.to_string()), Some(src.display().to_string()), total_bytes);

        let result = async {
            let flags = OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC);
            let handle = session.open(remote, flags, &FileAttrs::default(), timeout).await?;
            let written = transfer::upload(&session, &handle, src, 0, timeout, &self.inner.tracker, id).await;
            let _ = session.close(&handle, timeout).await;
            written
        }
        .await;

        match result {
            Ok(bytes) => {
                self.inner.tracker.complete(id);
                Ok(bytes)
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// Append `data` to `remote`, creating it if it does not exist. Learns
    /// the current size via STAT (treating `NoSuchFile` as size 0) before
    /// writing at that offset.
    ///
    /// # Errors
    /// Any error the STAT/OPEN/WRITE exchange reports.
    pub async fn append(&self, remote: &str, data: &[u8]) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self
            .inner
            .tracker
            .start(OperationKind::Append, Some(remote.to_string()), None, Some(data.len() as u64));

        let result = async {
            let current_size = match session.stat(remote, timeout).await {
                Ok(attrs) => attrs.size.unwrap_or(0),
                Err(Error::SftpStatus { code, .. }) if code == StatusCode::NoSuchFile as u32 => 0,
                Err(err) => return Err(err),
            };
            let flags = OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT);
            let handle = session.open(remote, flags, &FileAttrs::default(), timeout).await?;
            let write_result = session.write(&handle, current_size, data, timeout).await;
            let _ = session.close(&handle, timeout).await;
            write_result
        }
        .await;

        match result {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// REMOVE: delete a remote file.
    ///
    /// # Errors
    /// Any error the REMOVE exchange reports.
    pub async fn delete(&self, path: &str) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Remove, Some(path.to_string()), None, None);
        match session.remove(path, timeout).await {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// RENAME: move or rename a remote file or directory.
    ///
    /// # Errors
    /// Any error the RENAME exchange reports.
    pub async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self
            .inner
            .tracker
            .start(OperationKind::Rename, Some(format!("{from} -> {to}")), None, None);
        match session.rename(from, to, timeout).await {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// MKDIR. With `recursive`, creates any missing parent directories and
    /// treats an already-existing directory at the target path as success.
    ///
    /// # Errors
    /// Any error a MKDIR/STAT in the chain reports, or `Error::Server` if a
    /// path component exists and is not a directory.
    pub async fn mkdir(&self, path: &str, recursive: bool) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Mkdir, Some(path.to_string()), None, None);

        let result = if recursive {
            mkdir_recursive(&session, path, timeout).await
        } else {
            session.mkdir(path, &FileAttrs::default(), timeout).await
        };

        match result {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// RMDIR. With `recursive`, removes children first (files via REMOVE,
    /// subdirectories recursively) before removing the now-empty directory.
    /// A missing target is treated as success.
    ///
    /// # Errors
    /// Any error a RMDIR/REMOVE/OPENDIR/READDIR in the chain reports, or
    /// `Error::Server` if the target exists and is not a directory.
    pub async fn rmdir(&self, path: &str, recursive: bool) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Rmdir, Some(path.to_string()), None, None);

        let result = if recursive {
            rmdir_recursive(&session, path, timeout).await
        } else {
            session.rmdir(path, timeout).await
        };

        match result {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// SETSTAT: set `mode`'s permission bits on `path`.
    ///
    /// # Errors
    /// Any error the SETSTAT exchange reports.
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Setstat, Some(path.to_string()), None, None);
        match session.setstat(path, &FileAttrs::with_permissions(mode), timeout).await {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// REALPATH: canonicalize a path against the server's current
    /// directory.
    ///
    /// # Errors
    /// Any error the REALPATH exchange reports.
    pub async fn realpath(&self, path: &str) -> Result<String> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(OperationKind::Realpath, Some(path.to_string()), None, None);
        match session.realpath(path, timeout).await {
            Ok(resolved) => {
                self.inner.tracker.complete(id);
                Ok(resolved)
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// Recursively upload `local_dir`'s contents to `remote_dir`, creating
    /// remote directories as needed. `filter`, if given, is consulted for
    /// every local entry (files and directories) before it is visited.
    ///
    /// # Errors
    /// The first error encountered walking the tree or transferring a file.
    pub async fn upload_dir(&self, local_dir: &Path, remote_dir: &str, filter: Option<DirFilter>) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(
            OperationKind::UploadDir,
            Some(remote_dir.to_string()),
            Some(local_dir.display().to_string()),
            None,
        );

        let result = upload_dir_recursive(&session, local_dir, remote_dir, filter.as_ref(), timeout, &self.inner.tracker, id).await;

        match result {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// Recursively download `remote_dir`'s contents to `local_dir`, creating
    /// local directories as needed. `filter`, if given, is consulted for
    /// every remote entry (files and directories) before it is visited.
    ///
    /// # Errors
    /// The first error encountered walking the tree or transferring a file.
    pub async fn download_dir(&self, remote_dir: &str, local_dir: &Path, filter: Option<DirFilter>) -> Result<()> {
        let _permit = self.permit().await?;
        let session = self.current_session().await;
        let timeout = self.timeout();
        let id = self.inner.tracker.start(
            OperationKind::DownloadDir,
            Some(remote_dir.to_string()),
            Some(local_dir.display().to_string()),
            None,
        );

        let result = download_dir_recursive(
            &session,
            remote_dir,
            local_dir,
            filter.as_ref(),
            timeout,
            self.inner.as_ref(),
            &self.inner.tracker,
            id,
        )
        .await;

        match result {
            Ok(()) => {
                self.inner.tracker.complete(id);
                Ok(())
            }
            Err(err) => {
                self.inner.tracker.error(id, &err);
                Err(err)
            }
        }
    }

    /// Wait up to `graceful_timeout` for active operations to finish, then
    /// stop the background monitor and close the connection.
    ///
    /// # Errors
    /// Any error the transport reports while disconnecting.
    pub async fn end(mut self, graceful_timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + graceful_timeout;
        while self.inner.tracker.active_count() > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.inner.shutdown.cancel();
        if let Some(background) = self.background.take() {
            let _ = background.await;
        }

        let session = self.current_session().await;
        session.shutdown().await
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

async fn establish_session(config: &ClientConfig, host_key_verifier: Arc<dyn HostKeyVerifier>) -> Result<SessionHandle> {
    let transport: Box<dyn Transport> = Box::new(RusshTransport::new(config, host_key_verifier)?);
    let SessionStart { handle, session } = Session::establish(transport, config.timeouts.connect).await?;
    tokio::spawn(session.run());
    Ok(handle)
}

async fn acquire_permit(inner: &Arc<Inner>) -> Result<tokio::sync::OwnedSemaphorePermit> {
    match inner.config.saturation_policy {
        SaturationPolicy::Queue => inner
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::ConnectionLost("client is shutting down".into())),
        SaturationPolicy::FailFast => inner.semaphore.clone().try_acquire_owned().map_err(|_| Error::Saturated),
    }
}

async fn read_all_entries(session: &SessionHandle, path: &str, timeout: Duration) -> Result<Vec<DirEntry>> {
    let handle = session.opendir(path, timeout).await?;
    let mut entries = Vec::new();
    loop {
        match session.readdir(&handle, timeout).await {
            Ok(Some(batch)) => entries.extend(batch),
            Ok(None) => break,
            Err(err) => {
                let _ = session.close(&handle, timeout).await;
                return Err(err);
            }
        }
    }
    session.close(&handle, timeout).await?;
    Ok(entries)
}

fn path_components(path: &str) -> Vec<&str> {
    path.split('/').filter(|c| !c.is_empty()).collect()
}

fn join_child(parent: &str, name: &str) -> String {
    format!("{}/{}", parent.trim_end_matches('/'), name)
}

async fn mkdir_recursive(session: &SessionHandle, path: &str, timeout: Duration) -> Result<()> {
    let absolute = path.starts_with('/');
    let mut prefix = String::new();

    for component in path_components(path) {
        prefix = if prefix.is_empty() {
            if absolute {
                format!("/{component}")
            } else {
                component.to_string()
            }
        } else {
            format!("{prefix}/{component}")
        };

        match session.stat(&prefix, timeout).await {
            Ok(attrs) if attrs.is_directory() => continue,
            Ok(_) => return Err(Error::Server(format!("{prefix} exists and is not a directory"))),
            Err(Error::SftpStatus { code, .. }) if code == StatusCode::NoSuchFile as u32 => {
                session.mkdir(&prefix, &FileAttrs::default(), timeout).await?;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

fn rmdir_recursive<'a>(session: &'a SessionHandle, path: &'a str, timeout: Duration) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        match session.stat(path, timeout).await {
            Err(Error::SftpStatus { code, .. }) if code == StatusCode::NoSuchFile as u32 => return Ok(()),
            Err(err) => return Err(err),
            Ok(attrs) if !attrs.is_directory() => return Err(Error::Server(format!("{path} is not a directory"))),
            Ok(_) => {}
        }

        let entries = read_all_entries(session, path, timeout).await?;
        for entry in entries {
            if entry.filename == "." || entry.filename == ".." {
                continue;
            }
            let child = join_child(path, &entry.filename);
            if entry.attrs.is_directory() {
                rmdir_recursive(session, &child, timeout).await?;
            } else {
                session.remove(&child, timeout).await?;
            }
        }

        session.rmdir(path, timeout).await
    })
}

fn upload_dir_recursive<'a>(
    session: &'a SessionHandle,
    local_dir: &'a Path,
    remote_dir: &'a str,
    filter: Option<&'a DirFilter>,
    timeout: Duration,
    tracker: &'a Tracker,
    operation_id: Uuid,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        mkdir_recursive(session, remote_dir, timeout).await?;

        let mut read_dir = tokio::fs::read_dir(local_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let local_child = entry.path();
            let remote_child = join_child(remote_dir, &name);

            if let Some(filter) = filter {
                let probe_attrs = if file_type.is_dir() {
                    FileAttrs::default()
                } else {
                    FileAttrs::with_size(entry.metadata().await.map(|m| m.len()).unwrap_or(0))
                };
                let probe = DirEntry {
                    filename: name,
                    long_name: String::new(),
                    attrs: probe_attrs,
                };
                if !filter(&probe) {
                    continue;
                }
            }

            if file_type.is_dir() {
                upload_dir_recursive(session, &local_child, &remote_child, filter, timeout, tracker, operation_id).await?;
            } else if file_type.is_file() {
                let flags = OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT | OpenFlags::TRUNC);
                let handle = session.open(&remote_child, flags, &FileAttrs::default(), timeout).await?;
                let upload_result = transfer::upload(session, &handle, &local_child, 0, timeout, tracker, operation_id).await;
                let _ = session.close(&handle, timeout).await;
                upload_result?;
            }
        }
        Ok(())
    })
}

#[allow(clippy::too_many_arguments)]
fn download_dir_recursive<'a>(
    session: &'a SessionHandle,
    remote_dir: &'a str,
    local_dir: &'a Path,
    filter: Option<&'a DirFilter>,
    timeout: Duration,
    hook: &'a dyn ReconnectHook,
    tracker: &'a Tracker,
    operation_id: Uuid,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        tokio::fs::create_dir_all(local_dir).await?;

        let entries = read_all_entries(session, remote_dir, timeout).await?;
        for entry in entries {
            if entry.filename == "." || entry.filename == ".." {
                continue;
            }
            if let Some(filter) = filter {
                if !filter(&entry) {
                    continue;
                }
            }

            let remote_child = join_child(remote_dir, &entry.filename);
            let local_child = local_dir.join(&entry.filename);

            if entry.attrs.is_directory() {
                download_dir_recursive(session, &remote_child, &local_child, filter, timeout, hook, tracker, operation_id).await?;
            } else {
                let total_bytes = entry.attrs.size;
                let handle = session.open(&remote_child, OpenFlags(OpenFlags::READ), &FileAttrs::default(), timeout).await?;
                transfer::download(session, handle, &remote_child, &local_child, total_bytes, hook, tracker, operation_id).await?;
            }
        }
        Ok(())
    })
}

async fn run_background(inner: Arc<Inner>) {
    let mut keepalive = Keepalive::new(inner.config.keepalive.clone());
    let mut health = HealthCheck::new(inner.config.health_check.clone());
    let mut reconnect_mgr = ReconnectManager::new(inner.config.auto_reconnect.clone());

    let mut keepalive_timer = tokio::time::interval(keepalive.interval().max(Duration::from_millis(100)));
    let mut health_timer = tokio::time::interval(health.interval().max(Duration::from_millis(100)));
    keepalive_timer.tick().await;
    health_timer.tick().await;

    loop {
        tokio::select! {
            () = inner.shutdown.cancelled() => break,
            _ = keepalive_timer.tick(), if keepalive.enabled() => {
                let session = inner.session.read().await.clone();
                let ok = session.ping().await.is_ok();
                inner.tracker.emit_event(Event::Keepalive { healthy: ok });
                if keepalive.record(ok) == KeepaliveOutcome::Exhausted {
                    handle_unplanned_close(&inner, &mut reconnect_mgr).await;
                }
            }
            _ = health_timer.tick(), if health.enabled() => {
                let session = inner.session.read().await.clone();
                let ok = match health.method() {
                    HealthCheckMethod::Ping => session.ping().await.is_ok(),
                    HealthCheckMethod::Realpath => session.realpath(".", inner.config.timeouts.operation).await.is_ok(),
                };
                inner.tracker.emit_event(Event::HealthCheck { healthy: ok });
                if health.record(ok) {
                    handle_unplanned_close(&inner, &mut reconnect_mgr).await;
                }
            }
        }
    }
}

async fn handle_unplanned_close(inner: &Arc<Inner>, reconnect_mgr: &mut ReconnectManager) {
    if !reconnect_mgr.enabled() {
        return;
    }
    loop {
        match reconnect_mgr.next_step() {
            ReconnectStep::Attempt { attempt, delay } => {
                inner.tracker.emit_event(Event::ReconnectAttempt { attempt });
                tokio::time::sleep(delay).await;
                match establish_session(&inner.config, inner.host_key_verifier.clone()).await {
                    Ok(new_session) => {
                        *inner.session.write().await = new_session;
                        reconnect_mgr.record_success();
                        inner.tracker.emit_event(Event::ReconnectSuccess);
                        return;
                    }
                    Err(err) => {
                        warn!(attempt, error = %err, "reconnect attempt failed");
                        inner.tracker.emit_event(Event::ReconnectError { message: err.to_string() });
                    }
                }
            }
            ReconnectStep::GiveUp => {
                info!("reconnect attempts exhausted; connection remains down");
                inner.tracker.emit_event(Event::ReconnectFailed);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_components_strips_empty_segments() {
        assert_eq!(path_components("/a/b/c"), vec!["a", "b", "c"]);
        assert_eq!(path_components("a/b/"), vec!["a", "b"]);
    }

    #[test]
    fn join_child_trims_trailing_slash_on_parent() {
        assert_eq!(join_child("/tmp/", "foo"), "/tmp/foo");
        assert_eq!(join_child("/tmp", "foo"), "/tmp/foo");
    }

    #[test]
    fn mkdir_recursive_builds_absolute_prefixes() {
        let absolute = "/a/b".starts_with('/');
        assert!(absolute);
        let mut prefix = String::new();
        for component in path_components("/a/b") {
            prefix = if prefix.is_empty() {
                format!("/{component}")
            } else {
                format!("{prefix}/{component}")
            };
        }
        assert_eq!(prefix, "/a/b");
    }

    #[tokio::test]
    async fn mkdir_recursive_creates_each_missing_prefix_in_order() {
        let fs = crate::test_support::FakeFilesystem::new();
        let session = crate::test_support::spawn(crate::test_support::FakeTransport::new(fs.clone()), Duration::from_secs(5))
            .await
            .unwrap();

        mkdir_recursive(&session, "/a/b/c", Duration::from_secs(5)).await.unwrap();

        assert_eq!(fs.calls(), vec!["MKDIR /a", "MKDIR /a/b", "MKDIR /a/b/c"]);
    }

    #[tokio::test]
    async fn rmdir_recursive_removes_children_before_the_parent() {
        let fs = crate::test_support::FakeFilesystem::new()
            .with_directory(
                "/r",
                vec![
                    (".", FileAttrs::with_permissions(0o040_755)),
                    ("..", FileAttrs::with_permissions(0o040_755)),
                    ("keep.txt", FileAttrs::with_permissions(0o100_644)),
                    ("sub", FileAttrs::with_permissions(0o040_755)),
                ],
            )
            .with_directory(
                "/r/sub",
                vec![
                    (".", FileAttrs::with_permissions(0o040_755)),
                    ("..", FileAttrs::with_permissions(0o040_755)),
                ],
            );
        let session = crate::test_support::spawn(crate::test_support::FakeTransport::new(fs.clone()), Duration::from_secs(5))
            .await
            .unwrap();

        rmdir_recursive(&session, "/r", Duration::from_secs(5)).await.unwrap();

        let calls = fs.calls();
        let sub_index = calls.iter().position(|c| c == "RMDIR /r/sub").unwrap();
        let parent_index = calls.iter().position(|c| c == "RMDIR /r").unwrap();
        assert!(sub_index < parent_index);
        assert!(calls.iter().any(|c| c == "REMOVE /r/keep.txt"));
    }
}
