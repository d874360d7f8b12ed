//! Engine counters
//!
//! All counters are monotonically increasing `AtomicU64`s updated with
//! `Relaxed` ordering; `snapshot()` is only loosely consistent across
//! fields.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Failed to parse, or an unsupported protocol
    Malformed,
    /// IPv4 fragment
    Fragmented,
    /// Destination out of scope or IPv6 disabled
    Filtered,
    /// No session for a reply or a non-SYN segment
    UnknownSession,
    /// Pull-mode datagram with no pending reader
    NoReader,
    /// Session ports exhausted
    Exhausted,
    /// New TCP connection after the accept loop failed
    RedirectorStopped,
}

/// Shared counters of one `NatEngine`
#[derive(Debug, Default)]
pub struct NatStats {
    packets_read: AtomicU64,
    packets_written: AtomicU64,
    tcp_redirected: AtomicU64,
    tcp_replies: AtomicU64,
    udp_datagrams: AtomicU64,
    udp_replies: AtomicU64,
    icmp_echo_replies: AtomicU64,
    dropped_malformed: AtomicU64,
    dropped_fragmented: AtomicU64,
    dropped_filtered: AtomicU64,
    dropped_unknown_session: AtomicU64,
    dropped_no_reader: AtomicU64,
    dropped_redirector_stopped: AtomicU64,
    sessions_exhausted: AtomicU64,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
}

impl NatStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.packets_read.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_written(&self) {
        self.packets_written.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tcp_redirect(&self) {
        self.tcp_redirected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_tcp_reply(&self) {
        self.tcp_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_udp_datagram(&self) {
        self.udp_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_udp_reply(&self) {
        self.udp_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_icmp_echo(&self) {
        self.icmp_echo_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_accept(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_reject(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drop(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::Malformed => &self.dropped_malformed,
            DropReason::Fragmented => &self.dropped_fragmented,
            DropReason::Filtered => &self.dropped_filtered,
            DropReason::UnknownSession => &self.dropped_unknown_session,
            DropReason::NoReader => &self.dropped_no_reader,
            DropReason::Exhausted => &self.sessions_exhausted,
            DropReason::RedirectorStopped => &self.dropped_redirector_stopped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packets_read(&self) -> u64 {
        self.packets_read.load(Ordering::Relaxed)
    }

    pub fn udp_datagrams(&self) -> u64 {
        self.udp_datagrams.load(Ordering::Relaxed)
    }

    /// Copy every counter
    pub fn snapshot(&self) -> NatStatsSnapshot {
        NatStatsSnapshot {
            packets_read: self.packets_read.load(Ordering::Relaxed),
            packets_written: self.packets_written.load(Ordering::Relaxed),
            tcp_redirected: self.tcp_redirected.load(Ordering::Relaxed),
            tcp_replies: self.tcp_replies.load(Ordering::Relaxed),
            udp_datagrams: self.udp_datagrams.load(Ordering::Relaxed),
            udp_replies: self.udp_replies.load(Ordering::Relaxed),
            icmp_echo_replies: self.icmp_echo_replies.load(Ordering::Relaxed),
            dropped_malformed: self.dropped_malformed.load(Ordering::Relaxed),
            dropped_fragmented: self.dropped_fragmented.load(Ordering::Relaxed),
            dropped_filtered: self.dropped_filtered.load(Ordering::Relaxed),
            dropped_unknown_session: self.dropped_unknown_session.load(Ordering::Relaxed),
            dropped_no_reader: self.dropped_no_reader.load(Ordering::Relaxed),
            dropped_redirector_stopped: self.dropped_redirector_stopped.load(Ordering::Relaxed),
            sessions_exhausted: self.sessions_exhausted.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`NatStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct NatStatsSnapshot {
    pub packets_read: u64,
    pub packets_written: u64,
    pub tcp_redirected: u64,
    pub tcp_replies: u64,
    pub udp_datagrams: u64,
    pub udp_replies: u64,
    pub icmp_echo_replies: u64,
    pub dropped_malformed: u64,
    pub dropped_fragmented: u64,
    pub dropped_filtered: u64,
    pub dropped_unknown_session: u64,
    pub dropped_no_reader: u64,
    pub dropped_redirector_stopped: u64,
    pub sessions_exhausted: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
}

impl NatStatsSnapshot {
    /// Sum of every drop counter
    pub const fn dropped(&self) -> u64 {
        self.dropped_malformed
            + self.dropped_fragmented
            + self.dropped_filtered
            + self.dropped_unknown_session
            + self.dropped_no_reader
            + self.dropped_redirector_stopped
            + self.sessions_exhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_reasons_map_to_counters() {
        let stats = NatStats::new();
        stats.record_drop(DropReason::Fragmented);
        stats.record_drop(DropReason::Fragmented);
        stats.record_drop(DropReason::NoReader);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.dropped_fragmented, 2);
        assert_eq!(snapshot.dropped_no_reader, 1);
        assert_eq!(snapshot.dropped(), 3);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = NatStats::new();
        stats.record_read();
        stats.record_tcp_redirect();
        let json = serde_json::to_value(stats.snapshot()).unwrap();
        assert_eq!(json["packets_read"], 1);
        assert_eq!(json["tcp_redirected"], 1);
    }
}
