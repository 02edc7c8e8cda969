//! In-process RTCP report shapes. Wire encoding/decoding is owned by the
//! external RTP library; the consumer only assembles and consumes these.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SenderReport {
    pub ssrc: u32,
    pub ntp_ms: u64,
    pub rtp_ts: u32,
    pub packet_count: u32,
    pub octet_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SdesChunk {
    pub ssrc: u32,
    pub cname: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiverReport {
    pub ssrc: u32,
    /// Fraction of packets lost since the previous report, in 1/256 units.
    pub fraction_lost: u8,
    pub total_lost: u32,
    pub highest_seq: u32,
    pub jitter: u32,
}

/// One generic-NACK item: a base sequence number plus a 16-packet bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NackItem {
    pub pid: u16,
    pub blp: u16,
}

impl NackItem {
    pub fn lost_sequences(&self) -> impl Iterator<Item = u16> + '_ {
        let pid = self.pid;
        let blp = self.blp;
        std::iter::once(pid).chain((0..16u16).filter(move |bit| blp & (1 << bit) != 0).map(move |bit| pid.wrapping_add(bit + 1)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Nack {
    pub ssrc: u32,
    pub items: Vec<NackItem>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyFrameRequestKind {
    Pli,
    Fir,
}

/// Accumulator for one outgoing compound RTCP packet. The transport owns it
/// and passes it to every consumer in turn before serializing.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CompoundPacket {
    pub sender_reports: Vec<SenderReport>,
    pub sdes_chunks: Vec<SdesChunk>,
}

impl CompoundPacket {
    pub fn add_sender_report(&mut self, report: SenderReport) {
        self.sender_reports.push(report);
    }

    pub fn add_sdes_chunk(&mut self, chunk: SdesChunk) {
        self.sdes_chunks.push(chunk);
    }

    pub fn is_empty(&self) -> bool {
        self.sender_reports.is_empty() && self.sdes_chunks.is_empty()
    }
}
