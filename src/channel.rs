//! Channel manager: window accounting, outbound fragmentation, and inbound
//! reassembly for the single session channel used by the SFTP subsystem.
//!
//! This struct is pure bookkeeping — it does not own a [`Transport`] and is
//! not itself a task. It is driven by [`crate::session`]'s single connection
//! loop, which is the sole caller of both [`ChannelManager::prepare_send`]
//! and [`ChannelManager::ingest_event`]; that single-caller discipline is
//! what gives the channel write side its "exclusive critical section"
//! property without an explicit lock.

use bytes::{Bytes, BytesMut};
use tracing::{debug, warn};

use crate::transport::TransportEvent;
use crate::{Error, Result};

/// Conservative reservation for SSH + SFTP header overhead (packet length
/// prefix, message type, request id, and room for a typical opaque handle)
/// subtracted when exposing a safe chunk size to upper layers. This is a
/// heuristic, not an exact accounting of wire overhead — callers must still
/// refuse to emit a frame larger than `max_packet_size` regardless of
/// whether this reservation happened to be enough.
const OVERHEAD_RESERVATION: u32 = 66;

/// Below this, `max_safe_chunk_size` logs a warning — the server's declared
/// packet ceiling is unusually tight for efficient transfer.
const LOW_CHUNK_WARNING_THRESHOLD: u32 = 8 * 1024;

/// Proactively ask for more receive-window credit once consumed bytes cross
/// this fraction of the currently granted window.
const RECV_REPLENISH_THRESHOLD_NUM: u32 = 3;
const RECV_REPLENISH_THRESHOLD_DEN: u32 = 4;

/// Outcome of feeding one [`TransportEvent`] to the channel manager.
pub enum ChannelOutcome {
    /// One complete SFTP packet (framing stripped) is ready for the
    /// multiplexer to parse and route.
    Packet(Bytes),
    /// The peer granted more send-window credit; no packet was produced.
    WindowAdjusted,
    /// A `want-reply` request (subsystem open) succeeded.
    SubsystemReady,
    /// A `want-reply` request failed.
    SubsystemRejected,
    /// Nothing actionable for the multiplexer (e.g. a partial frame was
    /// buffered, or we just absorbed a non-data event).
    Nothing,
    /// The channel closed.
    Closed,
}

/// Per-connection channel state: window accounting, fragmentation, and
/// inbound reassembly (spec data model §3, "Channel state").
pub struct ChannelManager {
    send_window: i64,
    max_packet_size: u32,
    peer_initial_window: u32,
    recv_window_capacity: u32,
    recv_window_consumed: u32,
    reassembly: BytesMut,
}

impl ChannelManager {
    /// Construct the channel manager from the peer's CHANNEL_OPEN
    /// confirmation values.
    #[must_use]
    pub fn new(peer_initial_window: u32, max_packet_size: u32, our_recv_window: u32) -> Self {
        Self {
            send_window: i64::from(peer_initial_window),
            max_packet_size,
            peer_initial_window,
            recv_window_capacity: our_recv_window,
            recv_window_consumed: 0,
            reassembly: BytesMut::new(),
        }
    }

    /// The peer's declared ceiling on a single CHANNEL_DATA payload.
    #[must_use]
    pub fn max_packet_size(&self) -> u32 {
        self.max_packet_size
    }

    /// Current outbound window credit. May be read as non-positive; bytes
    /// must never be sent while this is `<= 0`.
    #[must_use]
    pub fn send_window(&self) -> i64 {
        self.send_window
    }

    /// The largest single chunk upper layers should request, after
    /// reserving room for protocol overhead. Logs a warning if the result is
    /// unusually small.
    #[must_use]
    pub fn max_safe_chunk_size(&self) -> u32 {
        let safe = self.max_packet_size.saturating_sub(OVERHEAD_RESERVATION);
        if safe < LOW_CHUNK_WARNING_THRESHOLD {
            warn!(
                max_packet_size = self.max_packet_size,
                safe_chunk_size = safe,
                "server-declared max packet size leaves little room for payload after overhead reservation"
            );
        }
        safe
    }

    /// Split `payload` into segments that each fit within `max_packet_size`,
    /// rejecting the whole request outright if a single segment would still
    /// exceed it regardless of the overhead estimate's accuracy.
    pub fn fragment<'a>(&self, payload: &'a [u8]) -> Result<Vec<&'a [u8]>> {
        if self.max_packet_size == 0 {
            return Err(Error::Protocol("channel has a zero max packet size".into()));
        }
        Ok(payload.chunks(self.max_packet_size as usize).collect())
    }

    /// Account for `len` bytes about to be sent, failing if no window
    /// credit remains. Callers must still wait for a `WindowAdjusted`
    /// outcome before calling this again once credit is exhausted.
    pub fn reserve_send(&mut self, len: u32) -> Result<()> {
        if self.send_window <= 0 {
            return Err(Error::Transport("no send-window credit available".into()));
        }
        if u32::try_from(self.send_window).is_ok_and(|w| len > w) {
            return Err(Error::Protocol(format!(
                "segment of {len} bytes exceeds available send window"
            )));
        }
        self.send_window -= i64::from(len);
        Ok(())
    }

    /// Feed one transport event to the channel manager, producing at most
    /// one packet-worth of outcome. Inbound data may straddle channel-data
    /// boundaries; this drains at most the bytes needed to extract one
    /// frame, leaving any remainder buffered for the next call.
    pub fn ingest_event(&mut self, event: TransportEvent) -> Result<ChannelOutcome> {
        match event {
            TransportEvent::ChannelWindowAdjust(delta) => {
                self.send_window += i64::from(delta);
                debug!(delta, send_window = self.send_window, "window adjusted");
                Ok(ChannelOutcome::WindowAdjusted)
            }
            TransportEvent::ChannelData(data) => {
                self.recv_window_consumed += data.len() as u32;
                self.reassembly.extend_from_slice(&data);
                match crate::protocol::codec::try_decode(&mut self.reassembly)? {
                    Some(packet) => Ok(ChannelOutcome::Packet(packet)),
                    None => Ok(ChannelOutcome::Nothing),
                }
            }
            TransportEvent::ChannelSuccess => Ok(ChannelOutcome::SubsystemReady),
            TransportEvent::ChannelFailure => Ok(ChannelOutcome::SubsystemRejected),
            TransportEvent::ChannelClose | TransportEvent::Close => Ok(ChannelOutcome::Closed),
            TransportEvent::ChannelOpenConfirmation { .. } => Ok(ChannelOutcome::Nothing),
            TransportEvent::Error(msg) => Err(Error::Transport(msg)),
        }
    }

    /// Drain any additional, already-buffered complete frames after the
    /// first (a single `ChannelData` event can carry more than one SFTP
    /// packet's worth of bytes).
    pub fn drain_buffered(&mut self) -> Result<Option<Bytes>> {
        crate::protocol::codec::try_decode(&mut self.reassembly)
    }

    /// Whether the receive window has been consumed past the proactive
    /// replenishment threshold and should be topped up via
    /// `Transport::adjust_window`.
    #[must_use]
    pub fn should_replenish_recv_window(&self) -> bool {
        self.recv_window_consumed.saturating_mul(RECV_REPLENISH_THRESHOLD_DEN)
            >= self.recv_window_capacity.saturating_mul(RECV_REPLENISH_THRESHOLD_NUM)
    }

    /// Credit to request from the peer when replenishing, and reset the
    /// consumed counter accordingly.
    pub fn replenish_recv_window(&mut self) -> u32 {
        let delta = self.recv_window_consumed;
        self.recv_window_consumed = 0;
        delta
    }

    /// The peer's originally declared initial window, used to size
    /// prefetch depth.
    #[must_use]
    pub fn peer_initial_window(&self) -> u32 {
        self.peer_initial_window
    }
}
