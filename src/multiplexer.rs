//! Request multiplexer: assigns monotonically increasing SFTP request ids,
//! tracks the reply each one expects, and routes inbound replies back to the
//! caller awaiting them.
//!
//! This is plain bookkeeping, not a task — [`crate::session`]'s single
//! connection loop is the only caller of [`RequestMultiplexer::register`]
//! and [`RequestMultiplexer::resolve`], which is what lets registration
//! happen strictly before the request bytes are written (closing the race
//! where a reply could otherwise arrive before its waiter exists).

use std::collections::HashMap;
use std::time::Instant;

use tokio::sync::oneshot;

use crate::protocol::{Reply, StatusCode};
use crate::{Error, Result};

/// Which reply variant a pending request expects. A mismatched inbound kind
/// is a protocol error, never silently forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedKind {
    /// Expect STATUS only (CLOSE, WRITE, REMOVE, RENAME, MKDIR, RMDIR,
    /// SETSTAT).
    StatusOnly,
    /// Expect HANDLE (OPEN, OPENDIR).
    Handle,
    /// Expect DATA, or STATUS(EOF) (READ).
    DataOrEof,
    /// Expect ATTRS (STAT, LSTAT, FSTAT).
    Attrs,
    /// Expect NAME, or STATUS(EOF) (READDIR).
    NameOrEof,
    /// Expect NAME with exactly one entry (REALPATH).
    RealpathName,
    /// Expect EXTENDED_REPLY or STATUS (fsync@openssh.com).
    ExtendedOrStatus,
}

struct Pending {
    expected: ExpectedKind,
    deadline: Instant,
    responder: oneshot::Sender<Result<Reply>>,
}

/// Owns the live request table: `request_id -> pending waiter`.
pub struct RequestMultiplexer {
    next_id: u32,
    pending: HashMap<u32, Pending>,
}

impl Default for RequestMultiplexer {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestMultiplexer {
    /// Construct an empty table. Ids start at 1, matching convention (0 is
    /// avoided only by convention, not protocol requirement).
    #[must_use]
    pub fn new() -> Self {
        Self {
            next_id: 1,
            pending: HashMap::new(),
        }
    }

    /// Allocate the next request id, wrapping at 2^32, and skipping any id
    /// that is still live (wraparound colliding with a long-outstanding
    /// request is vanishingly unlikely but must never silently reuse one).
    fn allocate_id(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Allocate an id and register a waiter for it in one step, so the
    /// caller can register before writing the request bytes. Returns the id
    /// and a receiver that resolves once a reply is routed, the deadline
    /// passes, or the table is flushed.
    pub fn begin(&mut self, expected: ExpectedKind, deadline: Instant) -> (u32, oneshot::Receiver<Result<Reply>>) {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id,
            Pending {
                expected,
                deadline,
                responder: tx,
            },
        );
        (id, rx)
    }

    /// Route an inbound, already request-id-tagged reply to its waiter. A
    /// reply whose variant does not match the registration's expected kind
    /// is delivered to the waiter as a protocol error rather than forwarded
    /// as-is. Returns `Ok(())` even when no waiter was found (the id may
    /// have already timed out and been retired) — a late reply for a
    /// retired id is simply dropped.
    pub fn resolve(&mut self, id: u32, reply: Reply) -> Result<()> {
        let Some(pending) = self.pending.remove(&id) else {
            return Ok(());
        };
        let outcome = classify_reply(pending.expected, reply);
        // A send error means the caller already gave up (e.g. cancelled);
        // nothing further to do.
        let _ = pending.responder.send(outcome);
        Ok(())
    }

    /// Fail and retire one specific request id, e.g. on explicit
    /// cancellation.
    pub fn cancel(&mut self, id: u32) {
        if let Some(pending) = self.pending.remove(&id) {
            let _ = pending.responder.send(Err(Error::Cancelled));
        }
    }

    /// Fail every outstanding waiter with a connection-lost error and clear
    /// the table (channel close).
    pub fn fail_all_connection_lost(&mut self, reason: &str) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.responder.send(Err(Error::ConnectionLost(reason.to_string())));
        }
    }

    /// Sweep expired deadlines, failing each with `Error::Timeout` and
    /// retiring the id so a late-arriving reply is dropped rather than
    /// routed.
    pub fn sweep_timeouts(&mut self, now: Instant) {
        let expired: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        for id in expired {
            if let Some(pending) = self.pending.remove(&id) {
                let _ = pending.responder.send(Err(Error::Timeout));
            }
        }
    }

    /// Number of requests currently awaiting a reply.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn classify_reply(expected: ExpectedKind, reply: Reply) -> Result<Reply> {
    match (&expected, &reply) {
        (ExpectedKind::StatusOnly, Reply::Status { code, message, .. }) => {
            status_to_result(*code, message.clone(), reply)
        }
        (ExpectedKind::Handle, Reply::Handle { .. }) => Ok(reply),
        (ExpectedKind::Handle, Reply::Status { code, message, .. }) => {
            Err(Error::from_status(*code, message.clone()))
        }
        (ExpectedKind::DataOrEof, Reply::Data { .. }) => Ok(reply),
        (ExpectedKind::DataOrEof, Reply::Status { code, message, .. }) => {
            status_to_result(*code, message.clone(), reply)
        }
        (ExpectedKind::Attrs, Reply::Attrs { .. }) => Ok(reply),
        (ExpectedKind::Attrs, Reply::Status { code, message, .. }) => {
            Err(Error::from_status(*code, message.clone()))
        }
        (ExpectedKind::NameOrEof, Reply::Name { .. }) => Ok(reply),
        (ExpectedKind::NameOrEof, Reply::Status { code, message, .. }) => {
            status_to_result(*code, message.clone(), reply)
        }
        (ExpectedKind::RealpathName, Reply::Name { entries, .. }) => {
            if entries.len() == 1 {
                Ok(reply)
            } else {
                Err(Error::Protocol(format!(
                    "REALPATH returned {} entries, expected exactly 1",
                    entries.len()
                )))
            }
        }
        (ExpectedKind::RealpathName, Reply::Status { code, message, .. }) => {
            Err(Error::from_status(*code, message.clone()))
        }
        (ExpectedKind::ExtendedOrStatus, Reply::ExtendedReply { .. }) => Ok(reply),
        (ExpectedKind::ExtendedOrStatus, Reply::Status { code, message, .. }) => {
            status_to_result(*code, message.clone(), reply)
        }
        _ => Err(Error::Protocol(format!(
            "unexpected reply kind for this request: {reply:?}"
        ))),
    }
}

/// A STATUS reply resolves as success (and, for read/readdir-shaped
/// requests, EOF is routed back as the original reply so the caller can
/// distinguish it) or as a typed error.
fn status_to_result(code: u32, message: String, original: Reply) -> Result<Reply> {
    if code == StatusCode::Ok as u32 || code == StatusCode::Eof as u32 {
        Ok(original)
    } else {
        Err(Error::from_status(code, message))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn ids_are_monotonic_until_wraparound() {
        let mut mux = RequestMultiplexer::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        let (id1, _rx1) = mux.begin(ExpectedKind::StatusOnly, deadline);
        let (id2, _rx2) = mux.begin(ExpectedKind::StatusOnly, deadline);
        assert_eq!(id2, id1 + 1);
    }

    #[test]
    fn wraparound_skips_still_live_ids() {
        let mut mux = RequestMultiplexer::new();
        mux.next_id = u32::MAX;
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        let (id1, _rx1) = mux.begin(ExpectedKind::StatusOnly, deadline);
        assert_eq!(id1, u32::MAX);
        let (id2, _rx2) = mux.begin(ExpectedKind::StatusOnly, deadline);
        assert_eq!(id2, 0);
        // id 1 is still free since nothing registered it.
        let (id3, _rx3) = mux.begin(ExpectedKind::StatusOnly, deadline);
        assert_eq!(id3, 1);
    }

    #[tokio::test]
    async fn resolve_routes_reply_to_its_own_waiter_only() {
        let mut mux = RequestMultiplexer::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        let (id, rx) = mux.begin(ExpectedKind::Handle, deadline);

        mux.resolve(
            id,
            Reply::Handle {
                id,
                handle: Bytes::from_static(b"h"),
            },
        )
        .unwrap();

        let reply = rx.await.unwrap().unwrap();
        assert!(matches!(reply, Reply::Handle { .. }));
    }

    #[tokio::test]
    async fn mismatched_reply_kind_is_a_protocol_error() {
        let mut mux = RequestMultiplexer::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        let (id, rx) = mux.begin(ExpectedKind::Handle, deadline);

        mux.resolve(id, Reply::Data { id, data: Bytes::new() }).unwrap();

        let result = rx.await.unwrap();
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn timeout_retires_the_id_so_a_late_reply_is_dropped() {
        let mut mux = RequestMultiplexer::new();
        let deadline = Instant::now();
        let (id, rx) = mux.begin(ExpectedKind::StatusOnly, deadline);

        mux.sweep_timeouts(Instant::now());
        assert!(matches!(rx.await.unwrap(), Err(Error::Timeout)));

        // Late reply for the now-retired id is a no-op, not a panic/leak.
        mux.resolve(
            id,
            Reply::Status {
                id,
                code: StatusCode::Ok as u32,
                message: String::new(),
            },
        )
        .unwrap();
        assert_eq!(mux.pending_count(), 0);
    }

    #[tokio::test]
    async fn fail_all_rejects_every_outstanding_waiter() {
        let mut mux = RequestMultiplexer::new();
        let deadline = Instant::now() + std::time::Duration::from_secs(1);
        let (_id1, rx1) = mux.begin(ExpectedKind::StatusOnly, deadline);
        let (_id2, rx2) = mux.begin(ExpectedKind::Handle, deadline);

        mux.fail_all_connection_lost("closed");

        assert!(matches!(rx1.await.unwrap(), Err(Error::ConnectionLost(_))));
        assert!(matches!(rx2.await.unwrap(), Err(Error::ConnectionLost(_))));
    }
}
