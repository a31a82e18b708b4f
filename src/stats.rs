use std::{
    sync::atomic::{AtomicU32, AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::Serialize;
use strum_macros::Display;

use crate::rtp_parameters::MediaKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Display)]
pub enum RtpStreamStatsType {
    #[serde(rename = "inbound-rtp")]
    #[strum(serialize = "inbound-rtp")]
    InboundRtp,
    #[serde(rename = "outbound-rtp")]
    #[strum(serialize = "outbound-rtp")]
    OutboundRtp,
}

/// Counters of one RTP stream, in the shape of a WebRTC stats report entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpStreamStats {
    #[serde(rename = "type")]
    pub typ: RtpStreamStatsType,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub ssrc: u32,
    pub kind: MediaKind,
    pub mime_type: String,
    pub packet_count: u64,
    pub packets_lost: u64,
    pub byte_count: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StreamCounters {
    packet_count: AtomicU64,
    packets_lost: AtomicU64,
    byte_count: AtomicU64,
    // Highest sequence number seen in the low 16 bits, `SEQUENCE_STARTED` once a packet arrived.
    highest_sequence: AtomicU32,
}

const SEQUENCE_STARTED: u32 = 1 << 16;
// Sequence numbers further ahead than this are taken as late packets from before a wrap.
const MAX_SEQUENCE_JUMP: u16 = 0x8000;

impl StreamCounters {
    /// Records one packet. Gaps in the sequence numbers are counted as lost,
    /// following the 16 bit sequence across wraparound. Late and duplicate
    /// packets are not counted.
    pub(crate) fn record(&self, sequence_number: u16, len: usize) {
        self.packet_count.fetch_add(1, Ordering::Relaxed);
        self.byte_count.fetch_add(len as u64, Ordering::Relaxed);

        let mut lost = 0;
        let _ = self
            .highest_sequence
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                lost = 0;
                let next = SEQUENCE_STARTED | sequence_number as u32;
                if current & SEQUENCE_STARTED == 0 {
                    return Some(next);
                }
                let delta = sequence_number.wrapping_sub(current as u16);
                if delta == 0 || delta >= MAX_SEQUENCE_JUMP {
                    return None;
                }
                lost = delta - 1;
                Some(next)
            });
        if lost > 0 {
            self.packets_lost.fetch_add(lost as u64, Ordering::Relaxed);
        }
    }

    pub(crate) fn snapshot(
        &self,
        typ: RtpStreamStatsType,
        ssrc: u32,
        kind: MediaKind,
        mime_type: &str,
    ) -> RtpStreamStats {
        RtpStreamStats {
            typ,
            timestamp: now_millis(),
            ssrc,
            kind,
            mime_type: mime_type.to_owned(),
            packet_count: self.packet_count.load(Ordering::Relaxed),
            packets_lost: self.packets_lost.load(Ordering::Relaxed),
            byte_count: self.byte_count.load(Ordering::Relaxed),
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_gaps_count_as_lost() {
        let counters = StreamCounters::default();
        counters.record(10, 100);
        counters.record(11, 100);
        counters.record(14, 50);

        let stats = counters.snapshot(RtpStreamStatsType::InboundRtp, 1, MediaKind::Video, "video/VP8");
        assert_eq!(stats.packet_count, 3);
        assert_eq!(stats.packets_lost, 2);
        assert_eq!(stats.byte_count, 250);

        let value = serde_json::to_value(&stats).unwrap();
        assert_eq!(value["type"], "inbound-rtp");
        assert_eq!(value["packetsLost"], 2);
    }

    #[test]
    fn loss_follows_sequence_wraparound() {
        let counters = StreamCounters::default();
        counters.record(65534, 10);
        counters.record(65535, 10);
        counters.record(2, 10);
        // Late packets from before the wrap.
        counters.record(0, 10);
        counters.record(65535, 10);
        counters.record(3, 10);

        let stats = counters.snapshot(RtpStreamStatsType::OutboundRtp, 1, MediaKind::Video, "video/VP8");
        assert_eq!(stats.packet_count, 6);
        assert_eq!(stats.packets_lost, 2);
    }

    #[test]
    fn first_packet_sets_the_base() {
        let counters = StreamCounters::default();
        counters.record(40000, 10);
        counters.record(40001, 10);

        let stats = counters.snapshot(RtpStreamStatsType::InboundRtp, 1, MediaKind::Audio, "audio/opus");
        assert_eq!(stats.packets_lost, 0);
    }
}
