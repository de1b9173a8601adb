//! Pipelined upload/download engine driven over an already-open file handle.
//!
//! Both directions delegate every sizing, concurrency, timeout, and retry
//! decision to an [`adaptive::Controller`]; this module only sequences the
//! WRITE/READ calls and batches. Uploads pipeline once the total size
//! exceeds [`PIPELINE_THRESHOLD`], since concurrent WRITEs at independent
//! offsets are safe regardless of completion order. Downloads stay
//! sequential: READ replies are unordered but a single file's bytes must
//! land at the right offset locally, and prefetching past a reconnect point
//! would waste the very requests the limit-triggered reconnect is trying to
//! avoid making.

use std::path::Path;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::future::join_all;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adaptive::{Controller, FailureDecision, FailureReason, SizeClass, TimeoutKind};
use crate::events::{Direction, Event, LimitKind, Tracker};
use crate::protocol::FileAttrs;
use crate::session::{ChannelHint, Handle, SessionHandle};
use crate::{Error, Result};

/// Total size above which an upload uses the pipelined, multi-WRITE-in-
/// flight path instead of one outstanding WRITE at a time.
pub const PIPELINE_THRESHOLD: u64 = 64 * 1024;

/// How many successful chunks pass between `performance-metrics` snapshots.
const METRICS_EVERY: u64 = 10;

/// Publish `AdaptiveChange` iff the controller actually moved the chunk
/// size; most calls into the controller are no-ops on a given tick.
fn emit_adaptive_change(tracker: &Tracker, direction: Direction, old_size: u32, new_size: u32, reason: &str) {
    if new_size != old_size {
        tracker.emit_event(Event::AdaptiveChange {
            direction,
            old_chunk_size: old_size,
            new_chunk_size: new_size,
            reason: reason.into(),
        });
    }
}

/// Publish a `performance-metrics` snapshot every [`METRICS_EVERY`]
/// successful chunks.
fn maybe_emit_metrics(controller: &Controller, tracker: &Tracker) {
    let successes = controller.state().successes;
    if successes > 0 && successes % METRICS_EVERY == 0 {
        tracker.emit_event(Event::PerformanceMetrics {
            avg_throughput_mbps: controller.state().avg_throughput_mbps,
            avg_response_ms: controller.state().avg_response_ms,
        });
    }
}

/// How a caller reconnects mid-transfer when the adaptive controller
/// believes the server is about to enforce an operation- or byte-count
/// limit on the current connection. Implemented by the public facade, which
/// is the only layer that owns a `ClientConfig` to rebuild a transport from.
#[async_trait::async_trait]
pub trait ReconnectHook: Send + Sync {
    /// Close `old_handle` (errors ignored), reconnect, and re-`open` `path`
    /// for reading at the same logical position. Returns the new session
    /// handle and file handle to resume from.
    async fn reconnect_for_read(&self, old_handle: &Handle, path: &str) -> Result<(SessionHandle, Handle)>;
}

/// Upload the contents of `local_path` into the already-open remote
/// `handle`, starting at `start_offset` (normally 0; non-zero for append).
/// Returns the total bytes written.
pub async fn upload(
    session: &SessionHandle,
    handle: &Handle,
    local_path: &Path,
    start_offset: u64,
    operation_timeout: Duration,
    tracker: &Tracker,
    operation_id: Uuid,
) -> Result<u64> {
    let mut file = File::open(local_path).await?;
    let total_bytes = file.metadata().await?.len();
    let ChannelHint { max_safe_chunk_size, .. } = session.channel_hint().await;
    let mut controller = Controller::new(Direction::Upload, max_safe_chunk_size);

    let mut offset = start_offset;
    let mut written = 0u64;

    let remote_total = start_offset + total_bytes;
    if total_bytes > PIPELINE_THRESHOLD {
        written += upload_pipelined(session, handle, &mut file, &mut offset, start_offset, remote_total, &mut controller, tracker, operation_id).await?;
    }

    // Either the whole file (small payloads) or whatever pipelined mode left
    // behind after falling back (its own failure exhausted retries).
    written += upload_sequential(session, handle, &mut file, &mut offset, start_offset, remote_total, &mut controller, tracker, operation_id, operation_timeout).await?;

    let _ = session.fsync(handle, operation_timeout).await;
    verify_upload_size(session, handle, written, operation_timeout, tracker, operation_id).await;

    Ok(written)
}

async fn upload_pipelined(
    session: &SessionHandle,
    handle: &Handle,
    file: &mut File,
    offset: &mut u64,
    start_offset: u64,
    remote_total: u64,
    controller: &mut Controller,
    tracker: &Tracker,
    operation_id: Uuid,
) -> Result<u64> {
    let mut written = 0u64;
    let mut retries_at_offset = 0u32;

    while *offset < remote_total {
        let chunk_size = controller.next_chunk_size(written);
        let ChannelHint { send_window, .. } = session.channel_hint().await;
        let concurrency = controller.concurrency(send_window, chunk_size);

        let mut batch = Vec::with_capacity(concurrency as usize);
        let mut batch_offset = *offset;
        for _ in 0..concurrency {
            if batch_offset >= remote_total {
                break;
            }
            let this_size = chunk_size.min((remote_total - batch_offset) as u32) as usize;
            let mut buf = vec![0u8; this_size];
            file.read_exact(&mut buf).await?;
            batch.push((batch_offset, Bytes::from(buf)));
            batch_offset += this_size as u64;
        }
        if batch.is_empty() {
            break;
        }

        let timeout = controller.timeout(TimeoutKind::Data, u64::from(chunk_size));
        let started = Instant::now();
        let futures = batch.iter().map(|(chunk_offset, data)| session.write(handle, *chunk_offset, data, timeout));
        let results = join_all(futures).await;

        if let Some((failed_index, err)) = results.iter().enumerate().find_map(|(i, r)| r.as_ref().err().map(|e| (i, e))) {
            let failed_size = batch.get(failed_index).map_or(chunk_size, |(_, d)| d.len() as u32);
            let reason = if matches!(err, Error::Timeout) { FailureReason::Timeout } else { FailureReason::Other };
            match controller.record_chunk_failure(failed_size, reason) {
                FailureDecision::Retry { retry_size } if retries_at_offset < 2 => {
                    retries_at_offset += 1;
                    emit_adaptive_change(tracker, Direction::Upload, chunk_size, retry_size, "reverted to stable size after a batch failure");
                    file.seek(std::io::SeekFrom::Start(*offset - start_offset)).await?;
                    tracker.retry(operation_id, retries_at_offset, format!("batch write failed at offset {offset}, retrying at {retry_size} bytes"));
                    continue;
                }
                _ => {
                    info!(offset, "pipelined upload exhausted batch retries; falling back to sequential mode");
                    file.seek(std::io::SeekFrom::Start(*offset - start_offset)).await?;
                    return Ok(written);
                }
            }
        }

        let elapsed = started.elapsed();
        let per_chunk = elapsed / u32::try_from(batch.len()).unwrap_or(1);
        for (_, data) in &batch {
            controller.record_chunk_success(data.len() as u32, per_chunk, Some(remote_total - start_offset));
            maybe_emit_metrics(controller, tracker);
        }
        emit_adaptive_change(tracker, Direction::Upload, chunk_size, controller.state().current_chunk_size, "chunk size grew after a successful batch");
        retries_at_offset = 0;
        written += batch.iter().map(|(_, d)| d.len() as u64).sum::<u64>();
        *offset = batch_offset;
        tracker.progress(operation_id, written, Some(remote_total - start_offset));
    }

    Ok(written)
}

async fn upload_sequential(
    session: &SessionHandle,
    handle: &Handle,
    file: &mut File,
    offset: &mut u64,
    start_offset: u64,
    remote_total: u64,
    controller: &mut Controller,
    tracker: &Tracker,
    operation_id: Uuid,
) -> Result<u64> {
    let mut written = 0u64;
    let mut retries_at_offset = 0u32;

    while *offset < remote_total {
        let chunk_size = controller.next_chunk_size(written).min((remote_total - *offset) as u32);
        let mut buf = vec![0u8; chunk_size as usize];
        file.read_exact(&mut buf).await?;

        let timeout = controller.timeout(TimeoutKind::Data, u64::from(chunk_size));
        let started = Instant::now();
        match session.write(handle, *offset, &buf, timeout).await {
            Ok(()) => {
                controller.record_chunk_success(chunk_size, started.elapsed(), Some(remote_total - start_offset));
                emit_adaptive_change(tracker, Direction::Upload, chunk_size, controller.state().current_chunk_size, "chunk size grew after success");
                maybe_emit_metrics(controller, tracker);
                retries_at_offset = 0;
                *offset += u64::from(chunk_size);
                written += u64::from(chunk_size);
                tracker.progress(operation_id, written, Some(remote_total - start_offset));
            }
            Err(err) => {
                let reason = if matches!(err, Error::Timeout) { FailureReason::Timeout } else { FailureReason::Other };
                match controller.record_chunk_failure(chunk_size, reason) {
                    FailureDecision::Retry { retry_size } if retries_at_offset < 2 => {
                        retries_at_offset += 1;
                        emit_adaptive_change(tracker, Direction::Upload, chunk_size, retry_size, "reverted to stable size after a timeout");
                        file.seek(std::io::SeekFrom::Start(*offset - start_offset)).await?;
                        tracker.retry(operation_id, retries_at_offset, format!("write failed at offset {offset}: {err}"));
                    }
                    _ => return Err(err),
                }
            }
        }
    }

    Ok(written)
}

async fn verify_upload_size(session: &SessionHandle, handle: &Handle, written: u64, timeout: Duration, tracker: &Tracker, operation_id: Uuid) {
    match session.fstat(handle, timeout).await {
        Ok(FileAttrs { size: Some(actual), .. }) if actual != written => {
            warn!(expected = written, actual, "post-upload size mismatch");
            tracker.emit_event(Event::VerificationMismatch {
                operation_id,
                expected_bytes: written,
                actual_bytes: actual,
            });
        }
        Ok(_) | Err(_) => {}
    }
}

/// Download the remote file identified by `handle`/`path` into `local_path`,
/// reconnecting via `hook` if the controller detects an approaching
/// server-side limit mid-transfer.
pub async fn download(
    session: &SessionHandle,
    handle: Handle,
    path: &str,
    local_path: &Path,
    total_bytes: Option<u64>,
    hook: &dyn ReconnectHook,
    tracker: &Tracker,
    operation_id: Uuid,
) -> Result<u64> {
    let mut file = File::create(local_path).await?;
    let ChannelHint { max_safe_chunk_size, .. } = session.channel_hint().await;
    let mut controller = Controller::new(Direction::Download, max_safe_chunk_size);

    let mut session = session.clone();
    let mut handle = handle;
    let mut offset = 0u64;
    let mut read = 0u64;

    loop {
        if let Some(kind) = controller.approaching_detected_limit() {
            let reason = match kind {
                LimitKind::OperationCount => "operation_limit",
                LimitKind::ByteCount => "byte_limit",
            };
            info!(offset = read, ?kind, "approaching a previously detected server limit; reconnecting proactively");
            tracker.emit_event(Event::AutoReconnect { reason: reason.into() });
            let (new_session, new_handle) = hook.reconnect_for_read(&handle, path).await?;
            session = new_session;
            handle = new_handle;
            controller.reset_counters_after_reconnect();
        }

        let old_chunk_size = controller.state().current_chunk_size;
        let chunk_size = controller.next_chunk_size(read);
        emit_adaptive_change(tracker, Direction::Download, old_chunk_size, chunk_size, "chunk size grew past a download growth threshold");
        let timeout = controller.timeout(TimeoutKind::Data, u64::from(chunk_size));

        let started = Instant::now();
        match session.read(&handle, offset, chunk_size, timeout).await {
            Ok(Some(data)) if !data.is_empty() => {
                let elapsed = started.elapsed();
                file.write_all(&data).await?;
                controller.record_chunk_success(data.len() as u32, elapsed, total_bytes);
                maybe_emit_metrics(&controller, tracker);
                offset += data.len() as u64;
                read += data.len() as u64;
                tracker.progress(operation_id, read, total_bytes);

                if let Some(delay) = controller.throttle_delay(SizeClass::of(total_bytes.unwrap_or(read))) {
                    tokio::time::sleep(delay).await;
                }
            }
            Ok(Some(_)) | Ok(None) => break,
            Err(Error::Timeout) => {
                controller.record_chunk_failure(chunk_size, FailureReason::Timeout);
                emit_adaptive_change(tracker, Direction::Download, chunk_size, controller.state().current_chunk_size, "reverted to stable size after a timeout");
                // Both dimensions are recorded as candidate explanations for
                // the stall (adaptive.rs's record_server_limit_sample has no
                // way to know which one the server actually enforces).
                tracker.emit_event(Event::ServerLimitDetected {
                    kind: LimitKind::OperationCount,
                    ops: controller.state().successes,
                    bytes: read,
                });
                tracker.emit_event(Event::ServerLimitDetected {
                    kind: LimitKind::ByteCount,
                    ops: controller.state().successes,
                    bytes: read,
                });
                tracker.emit_event(Event::AutoReconnect {
                    reason: "data timeout during download".into(),
                });
                let (new_session, new_handle) = hook.reconnect_for_read(&handle, path).await?;
                session = new_session;
                handle = new_handle;
                debug!(offset, "resuming download at same offset after reconnect");
            }
            Err(other) => return Err(other),
        }
    }

    file.flush().await?;
    Ok(read)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use crate::protocol::{MessageType, OpenFlags};
    use crate::test_support::{spawn, FakeFilesystem, FakeTransport};

    use super::*;

    const TIMEOUT: Duration = Duration::from_secs(5);

    async fn write_local_file(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        tokio::fs::write(&path, bytes).await.unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn small_upload_lands_exactly_as_written() {
        let fs = FakeFilesystem::new();
        let session = spawn(FakeTransport::new(fs.clone()), TIMEOUT).await.unwrap();
        let (_dir, local) = write_local_file(b"hello sftp").await;

        let remote = session.open("/upload.txt", OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT), &FileAttrs::default(), TIMEOUT).await.unwrap();
        let tracker = Tracker::new(Duration::from_millis(1));
        let operation_id = Uuid::new_v4();
        let written = upload(&session, &remote, &local, 0, TIMEOUT, &tracker, operation_id).await.unwrap();

        assert_eq!(written, 10);
        assert_eq!(fs.file("/upload.txt").unwrap(), b"hello sftp");
    }

    #[tokio::test]
    async fn pipelined_upload_above_threshold_reassembles_in_order() {
        let fs = FakeFilesystem::new();
        let session = spawn(FakeTransport::new(fs.clone()), TIMEOUT).await.unwrap();
        let payload: Vec<u8> = (0..PIPELINE_THRESHOLD * 2).map(|i| (i % 251) as u8).collect();
        let (_dir, local) = write_local_file(&payload).await;

        let remote = session.open("/big.bin", OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT), &FileAttrs::default(), TIMEOUT).await.unwrap();
        let tracker = Tracker::new(Duration::from_millis(1));
        let written = upload(&session, &remote, &local, 0, TIMEOUT, &tracker, Uuid::new_v4()).await.unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(fs.file("/big.bin").unwrap(), payload);
    }

    #[tokio::test]
    async fn dropped_write_after_growth_shrinks_and_retries_to_completion() {
        let fs = FakeFilesystem::new();
        // First WRITE (8 KiB, occurrence 0) succeeds and grows the chunk size
        // to 16 KiB; the second WRITE (occurrence 1, now above the still-8-KiB
        // stable size) is dropped, forcing a shrink-and-retry at 8 KiB.
        let transport = FakeTransport::new(fs.clone()).drop_nth(MessageType::Write, 1);
        let session = spawn(transport, TIMEOUT).await.unwrap();
        let payload: Vec<u8> = (0..24 * 1024u32).map(|i| (i % 256) as u8).collect();
        let (_dir, local) = write_local_file(&payload).await;

        let remote = session.open("/retry.bin", OpenFlags(OpenFlags::WRITE | OpenFlags::CREAT), &FileAttrs::default(), TIMEOUT).await.unwrap();
        let tracker = Tracker::new(Duration::from_millis(1));
        let written = upload(&session, &remote, &local, 0, TIMEOUT, &tracker, Uuid::new_v4()).await.unwrap();

        assert_eq!(written, payload.len() as u64);
        assert_eq!(fs.file("/retry.bin").unwrap(), payload);
    }

    struct ReplaceSessionHook {
        fs: FakeFilesystem,
        reconnects: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl ReconnectHook for ReplaceSessionHook {
        async fn reconnect_for_read(&self, old_handle: &Handle, path: &str) -> Result<(SessionHandle, Handle)> {
            let _ = old_handle;
            self.reconnects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            let session = spawn(FakeTransport::new(self.fs.clone()), TIMEOUT).await?;
            let handle = session.open(path, OpenFlags(OpenFlags::READ), &FileAttrs::default(), TIMEOUT).await?;
            Ok((session, handle))
        }
    }

    #[tokio::test]
    async fn download_reconnects_after_induced_timeout_with_no_data_loss() {
        let contents: Vec<u8> = (0..40 * 1024u32).map(|i| (i % 256) as u8).collect();
        let fs = FakeFilesystem::new().with_file("/download.bin", contents.clone());
        // The 3rd READ (0-based occurrence 2) is dropped, forcing a timeout.
        let transport = FakeTransport::new(fs.clone()).drop_nth(MessageType::Read, 2);
        let session = spawn(transport, TIMEOUT).await.unwrap();
        let remote = session.open("/download.bin", OpenFlags(OpenFlags::READ), &FileAttrs::default(), TIMEOUT).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("download.bin");
        let hook = ReplaceSessionHook { fs: fs.clone(), reconnects: std::sync::atomic::AtomicU32::new(0) };
        let tracker = Tracker::new(Duration::from_millis(1));

        let read = download(
            &session,
            remote,
            "/download.bin",
            &local,
            Some(contents.len() as u64),
            &hook,
            &tracker,
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        assert_eq!(read, contents.len() as u64);
        let on_disk = tokio::fs::read(&local).await.unwrap();
        assert_eq!(on_disk, contents);
        assert!(hook.reconnects.load(std::sync::atomic::Ordering::SeqCst) >= 1);
    }

    #[test]
    fn pipeline_threshold_is_64_kib() {
        assert_eq!(PIPELINE_THRESHOLD, 64 * 1024);
    }

    struct LimitedReconnectHook {
        fs: FakeFilesystem,
        op_cap: u32,
        reconnects: std::sync::atomic::AtomicU32,
    }

    #[async_trait::async_trait]
    impl ReconnectHook for LimitedReconnectHook {
        async fn reconnect_for_read(&self, old_handle: &Handle, path: &str) -> Result<(SessionHandle, Handle)> {
            let _ = old_handle;
            self.reconnects.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            // Every reconnected server is still capped the same way, as if
            // the limit is a property of the account/server rather than one
            // connection's lifetime.
            let transport = FakeTransport::new(self.fs.clone()).limit_after(self.op_cap);
            let session = spawn(transport, TIMEOUT).await?;
            let handle = session.open(path, OpenFlags(OpenFlags::READ), &FileAttrs::default(), TIMEOUT).await?;
            Ok((session, handle))
        }
    }

    #[tokio::test]
    async fn download_past_an_operation_cap_reconnects_proactively_with_no_data_loss() {
        let contents: Vec<u8> = (0..200 * 1024u32).map(|i| (i % 256) as u8).collect();
        let fs = FakeFilesystem::new().with_file("/capped.bin", contents.clone());
        let op_cap = 6;
        let transport = FakeTransport::new(fs.clone()).limit_after(op_cap);
        let session = spawn(transport, TIMEOUT).await.unwrap();
        let remote = session.open("/capped.bin", OpenFlags(OpenFlags::READ), &FileAttrs::default(), TIMEOUT).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let local = dir.path().join("capped.bin");
        let hook = LimitedReconnectHook { fs: fs.clone(), op_cap, reconnects: std::sync::atomic::AtomicU32::new(0) };
        let tracker = Tracker::new(Duration::from_millis(1));
        let mut events = tracker.subscribe();

        let read = download(
            &session,
            remote,
            "/capped.bin",
            &local,
            Some(contents.len() as u64),
            &hook,
            &tracker,
            Uuid::new_v4(),
        )
        .await
        .unwrap();

        assert_eq!(read, contents.len() as u64);
        let on_disk = tokio::fs::read(&local).await.unwrap();
        assert_eq!(on_disk, contents);
        // The first brush with the cap is reactive (a real timeout); every
        // later one should be pre-empted proactively before it recurs.
        assert!(hook.reconnects.load(std::sync::atomic::Ordering::SeqCst) >= 2);

        let mut saw_operation_limit_reconnect = false;
        while let Ok(event) = events.try_recv() {
            if let Event::AutoReconnect { reason } = event {
                if reason == "operation_limit" {
                    saw_operation_limit_reconnect = true;
                }
            }
        }
        assert!(saw_operation_limit_reconnect, "expected a proactive reconnect with reason = operation_limit");
    }
}
