use serde_json::Value;

/// Read-only view of the producer's incoming RTP stream. The consumer holds
/// a shared handle to the current view; the producer side replaces it on
/// stream changes via the consumer's `on_producer_*` events.
pub trait ProducerStreamView {
    /// Stream health, 0 (dead) to 10.
    fn score(&self) -> u8;

    /// Declared spatial layer count of the stream.
    fn spatial_layers(&self) -> i16;

    /// Declared temporal layer count of the stream.
    fn temporal_layers(&self) -> i16;

    /// Cumulative receive bitrate in bps of the given layer pair and
    /// everything below it. 0 means the layer is not being received.
    fn bitrate(&self, now_ms: u64, spatial: i16, temporal: i16) -> u32;

    /// Aggregate cost in bps of carrying the given temporal layer. For the
    /// SVC codec families handled here this aggregates across spatial
    /// layers, so callers query it at spatial 0.
    fn layer_bitrate(&self, now_ms: u64, spatial: i16, temporal: i16) -> u32;

    /// Whether an RTCP sender report has been observed on this stream.
    fn sender_report_received(&self) -> bool;

    fn fill_json_stats(&self) -> Value;
}
