//! Codec-level payload inspection. An [`EncodingContext`] holds the target
//! layer pair picked by the consumer and the current pair the output stream
//! actually sits on; `process_payload` moves current toward target at the
//! bitstream positions where a receiver can follow (key frames, switching
//! points, frame ends) and accepts or rejects each packet for the current
//! pair.

use layercast_protocol::media::{Layers, MediaCodec, MediaPacket};

mod vp9;

pub use vp9::Vp9SvcContext;

pub trait EncodingContext {
    fn target_layers(&self) -> Layers;

    /// Set the target pair. Both indices must be -1 (paused) or both >= 0.
    fn set_target_layers(&mut self, layers: Layers);

    fn current_layers(&self) -> Layers;

    fn set_current_layers(&mut self, layers: Layers);

    /// Inspect one packet: may advance current layers within the target
    /// envelope and may mutate the packet in place. Returns false to drop.
    fn process_payload(&mut self, pkt: &mut MediaPacket) -> bool;

    /// Undo any in-place mutation `process_payload` made to an accepted
    /// packet, so the caller can hand the same packet to other consumers.
    fn restore_payload(&mut self, pkt: &mut MediaPacket);
}

/// Look up the encoding context implementation for a media codec. SVC
/// consumers can only be created for codecs listed here.
pub fn encoding_context_for(codec: MediaCodec, spatial_layers: i16, temporal_layers: i16, k_svc: bool) -> Option<Box<dyn EncodingContext>> {
    match codec {
        MediaCodec::Vp9 => Some(Box::new(Vp9SvcContext::new(spatial_layers, temporal_layers, k_svc))),
        _ => None,
    }
}
