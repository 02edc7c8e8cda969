//! Outbound RTP stream owned by a consumer: retransmission buffering, RTCP
//! sender reports, receiver-report ingestion and score keeping.

use std::collections::VecDeque;

use layercast_protocol::{
    media::MediaPacket,
    rtcp::{KeyFrameRequestKind, Nack, ReceiverReport, SdesChunk, SenderReport},
};
use serde_json::{json, Value};

const RETRANSMISSION_BUFFER_SIZE: usize = 600;
const BITRATE_WINDOW_MS: u64 = 1000;
const START_SCORE: u8 = 10;

#[derive(Debug, Clone)]
pub struct SendStreamParams {
    pub ssrc: u32,
    pub payload_type: u8,
    pub clock_rate: u32,
    pub cname: String,
    pub spatial_layers: i16,
    pub temporal_layers: i16,
    pub use_nack: bool,
    pub use_pli: bool,
    pub use_fir: bool,
    pub use_in_band_fec: bool,
    pub use_dtx: bool,
    /// RTX payload type and ssrc, when negotiated.
    pub rtx: Option<(u8, u32)>,
}

pub struct SendStream {
    params: SendStreamParams,
    paused: bool,
    score: u8,
    fraction_lost: u8,
    packet_count: u32,
    octet_count: u32,
    retransmitted_count: u32,
    probation_count: u32,
    nack_count: u32,
    pli_count: u32,
    fir_count: u32,
    last_packet_ms: u64,
    last_rtp_ts: u32,
    buffer: VecDeque<MediaPacket>,
    rate_window_start_ms: u64,
    rate_sum: usize,
    rate_bps: u32,
}

impl SendStream {
    pub fn new(params: SendStreamParams) -> Self {
        let buffer_size = if params.use_nack { RETRANSMISSION_BUFFER_SIZE } else { 0 };
        Self {
            params,
            paused: false,
            score: START_SCORE,
            fraction_lost: 0,
            packet_count: 0,
            octet_count: 0,
            retransmitted_count: 0,
            probation_count: 0,
            nack_count: 0,
            pli_count: 0,
            fir_count: 0,
            last_packet_ms: 0,
            last_rtp_ts: 0,
            buffer: VecDeque::with_capacity(buffer_size),
            rate_window_start_ms: 0,
            rate_sum: 0,
            rate_bps: 0,
        }
    }

    pub fn pause(&mut self) {
        log::info!("[SendStream] pause ssrc {}", self.params.ssrc);
        self.paused = true;
        self.buffer.clear();
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn spatial_layers(&self) -> i16 {
        self.params.spatial_layers
    }

    pub fn temporal_layers(&self) -> i16 {
        self.params.temporal_layers
    }

    pub fn score(&self) -> u8 {
        self.score
    }

    pub fn fraction_lost(&self) -> u8 {
        self.fraction_lost
    }

    /// Remote packet loss as a percentage, from the last receiver report.
    pub fn loss_percentage(&self) -> f32 {
        self.fraction_lost as f32 * 100.0 / 256.0
    }

    /// Accept an outbound packet: account it and keep a copy for
    /// retransmission when NACK is negotiated.
    pub fn receive_packet(&mut self, now_ms: u64, pkt: &MediaPacket) -> bool {
        if self.paused {
            return false;
        }

        self.packet_count = self.packet_count.wrapping_add(1);
        self.octet_count = self.octet_count.wrapping_add(pkt.data.len() as u32);
        self.last_packet_ms = now_ms;
        self.last_rtp_ts = pkt.ts;

        if self.rate_window_start_ms == 0 {
            self.rate_window_start_ms = now_ms;
        }
        self.rate_sum += pkt.data.len();

        if self.params.use_nack {
            if self.buffer.len() >= RETRANSMISSION_BUFFER_SIZE {
                self.buffer.pop_front();
            }
            self.buffer.push_back(pkt.clone());
        }

        true
    }

    /// Look the NACKed sequence numbers up in the retransmission buffer.
    pub fn receive_nack(&mut self, nack: &Nack) -> Vec<MediaPacket> {
        if !self.params.use_nack {
            return Vec::new();
        }

        self.nack_count += 1;

        let mut packets = Vec::new();
        for item in &nack.items {
            for seq in item.lost_sequences() {
                if let Some(pkt) = self.buffer.iter().find(|pkt| pkt.seq == seq) {
                    self.retransmitted_count += 1;
                    packets.push(pkt.clone());
                } else {
                    log::debug!("[SendStream] NACKed seq {} not in buffer", seq);
                }
            }
        }
        packets
    }

    pub fn receive_key_frame_request(&mut self, kind: KeyFrameRequestKind) {
        match kind {
            KeyFrameRequestKind::Pli => self.pli_count += 1,
            KeyFrameRequestKind::Fir => self.fir_count += 1,
        }
    }

    /// Ingest a receiver report. Returns `(new, previous)` when the stream
    /// score changed.
    pub fn receive_receiver_report(&mut self, report: &ReceiverReport) -> Option<(u8, u8)> {
        self.fraction_lost = report.fraction_lost;

        let previous = self.score;
        // 10 at zero loss, 0 from 50% loss up.
        let penalty = ((report.fraction_lost as u32 * 10) / 128).min(10) as u8;
        self.score = 10 - penalty;

        (self.score != previous).then_some((self.score, previous))
    }

    pub fn sender_report(&self, now_ms: u64) -> Option<SenderReport> {
        if self.packet_count == 0 {
            return None;
        }

        let elapsed = now_ms.saturating_sub(self.last_packet_ms);
        let rtp_ts = self.last_rtp_ts.wrapping_add((elapsed * self.params.clock_rate as u64 / 1000) as u32);

        Some(SenderReport {
            ssrc: self.params.ssrc,
            ntp_ms: now_ms,
            rtp_ts,
            packet_count: self.packet_count,
            octet_count: self.octet_count,
        })
    }

    pub fn sdes_chunk(&self) -> SdesChunk {
        SdesChunk {
            ssrc: self.params.ssrc,
            cname: self.params.cname.clone(),
        }
    }

    /// Build a probation packet with the given sequence number. Goes out
    /// over RTX when negotiated so receivers don't see it as media loss.
    pub fn probation_packet(&mut self, seq: u16) -> MediaPacket {
        self.probation_count += 1;
        let (pt, ssrc) = self.params.rtx.unwrap_or((self.params.payload_type, self.params.ssrc));
        MediaPacket {
            pt,
            ssrc,
            seq,
            ts: self.last_rtp_ts,
            marker: false,
            key_frame: false,
            svc: None,
            data: Vec::new(),
        }
    }

    /// Current outbound bitrate in bps over the last full window.
    pub fn bitrate(&mut self, now_ms: u64) -> u32 {
        if self.rate_window_start_ms == 0 {
            return 0;
        }
        let elapsed = now_ms.saturating_sub(self.rate_window_start_ms);
        if elapsed >= BITRATE_WINDOW_MS {
            self.rate_bps = (self.rate_sum as u64 * 8 * 1000 / elapsed) as u32;
            self.rate_sum = 0;
            self.rate_window_start_ms = now_ms;
        }
        self.rate_bps
    }

    pub fn fill_json(&self) -> Value {
        json!({
            "ssrc": self.params.ssrc,
            "payloadType": self.params.payload_type,
            "clockRate": self.params.clock_rate,
            "cname": self.params.cname,
            "spatialLayers": self.params.spatial_layers,
            "temporalLayers": self.params.temporal_layers,
            "rtx": self.params.rtx.map(|(pt, ssrc)| json!({ "payloadType": pt, "ssrc": ssrc })),
            "score": self.score,
        })
    }

    pub fn fill_json_stats(&self) -> Value {
        json!({
            "type": "outbound-rtp",
            "ssrc": self.params.ssrc,
            "packetCount": self.packet_count,
            "byteCount": self.octet_count,
            "retransmittedCount": self.retransmitted_count,
            "probationCount": self.probation_count,
            "nackCount": self.nack_count,
            "pliCount": self.pli_count,
            "firCount": self.fir_count,
            "fractionLost": self.fraction_lost,
            "score": self.score,
        })
    }
}

#[cfg(test)]
mod test {
    use layercast_protocol::{
        media::MediaPacket,
        rtcp::{Nack, NackItem, ReceiverReport},
    };

    use super::{SendStream, SendStreamParams};

    fn params(use_nack: bool) -> SendStreamParams {
        SendStreamParams {
            ssrc: 1000,
            payload_type: 101,
            clock_rate: 90000,
            cname: "cname".to_string(),
            spatial_layers: 3,
            temporal_layers: 3,
            use_nack,
            use_pli: true,
            use_fir: false,
            use_in_band_fec: false,
            use_dtx: false,
            rtx: Some((102, 2000)),
        }
    }

    fn pkt(seq: u16, size: usize) -> MediaPacket {
        MediaPacket {
            pt: 101,
            ssrc: 1000,
            seq,
            ts: seq as u32 * 3000,
            marker: true,
            key_frame: false,
            svc: None,
            data: vec![0; size],
        }
    }

    #[test]
    fn nack_resends_buffered_packets() {
        let mut stream = SendStream::new(params(true));
        for seq in 0..5 {
            assert!(stream.receive_packet(0, &pkt(seq, 100)));
        }

        let resent = stream.receive_nack(&Nack {
            ssrc: 1000,
            items: vec![NackItem { pid: 1, blp: 0b10 }],
        });
        assert_eq!(resent.iter().map(|pkt| pkt.seq).collect::<Vec<_>>(), vec![1, 3]);
    }

    #[test]
    fn nack_without_negotiation_is_ignored() {
        let mut stream = SendStream::new(params(false));
        stream.receive_packet(0, &pkt(0, 100));
        let resent = stream.receive_nack(&Nack {
            ssrc: 1000,
            items: vec![NackItem { pid: 0, blp: 0 }],
        });
        assert!(resent.is_empty());
    }

    #[test]
    fn pause_refuses_and_clears_buffer() {
        let mut stream = SendStream::new(params(true));
        stream.receive_packet(0, &pkt(0, 100));
        stream.pause();
        assert!(stream.is_paused());
        assert!(!stream.receive_packet(0, &pkt(1, 100)));
        let resent = stream.receive_nack(&Nack {
            ssrc: 1000,
            items: vec![NackItem { pid: 0, blp: 0 }],
        });
        assert!(resent.is_empty());
        stream.resume();
        assert!(stream.receive_packet(0, &pkt(2, 100)));
    }

    #[test]
    fn receiver_report_drives_score() {
        let mut stream = SendStream::new(params(true));
        let report = |fraction_lost| ReceiverReport {
            ssrc: 1000,
            fraction_lost,
            total_lost: 0,
            highest_seq: 0,
            jitter: 0,
        };

        assert_eq!(stream.receive_receiver_report(&report(0)), None);
        assert_eq!(stream.score(), 10);
        assert_eq!(stream.receive_receiver_report(&report(128)), Some((0, 10)));
        assert_eq!(stream.score(), 0);
        assert_eq!(stream.loss_percentage(), 50.0);
        assert_eq!(stream.receive_receiver_report(&report(26)), Some((8, 0)));
    }

    #[test]
    fn sender_report_needs_traffic() {
        let mut stream = SendStream::new(params(true));
        assert_eq!(stream.sender_report(1000), None);
        stream.receive_packet(1000, &pkt(7, 100));
        let report = stream.sender_report(2000).expect("report after traffic");
        assert_eq!(report.packet_count, 1);
        assert_eq!(report.octet_count, 100);
        assert_eq!(report.rtp_ts, 7 * 3000 + 90000);
    }

    #[test]
    fn bitrate_measured_over_window() {
        let mut stream = SendStream::new(params(true));
        assert_eq!(stream.bitrate(0), 0);
        stream.receive_packet(1000, &pkt(0, 500));
        stream.receive_packet(1500, &pkt(1, 500));
        assert_eq!(stream.bitrate(1500), 0);
        assert_eq!(stream.bitrate(3000), 1000 * 8 * 1000 / 2000);
    }

    #[test]
    fn probation_goes_over_rtx() {
        let mut stream = SendStream::new(params(true));
        let probation = stream.probation_packet(42);
        assert_eq!(probation.pt, 102);
        assert_eq!(probation.ssrc, 2000);
        assert_eq!(probation.seq, 42);
        assert!(probation.data.is_empty());
    }
}
