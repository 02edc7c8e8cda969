//! VP9 SVC encoding context.
//!
//! In an SVC stream every spatial layer shares one seq/ts space, so layer
//! switches are pure filtering decisions; the constraint is where a receiver
//! can follow. Spatial upshifts need a key frame. Temporal upshifts need a
//! switching point right after a frame boundary. Downshifts wait for a frame
//! end, except in k-svc mode where a spatial downshift also needs a key
//! frame.

use layercast_protocol::media::{Layers, MediaPacket, SvcMeta};

use super::EncodingContext;

pub struct Vp9SvcContext {
    temporal_layers: i16,
    k_svc: bool,
    target: Layers,
    current: Layers,
    pre_end_frame: bool,
    forced_marker: bool,
}

impl Vp9SvcContext {
    pub fn new(_spatial_layers: i16, temporal_layers: i16, k_svc: bool) -> Self {
        Self {
            temporal_layers,
            k_svc,
            target: Layers::NONE,
            current: Layers::NONE,
            pre_end_frame: false,
            forced_marker: false,
        }
    }

    fn try_switch(&mut self, key_frame: bool, svc: &SvcMeta) {
        if self.target != self.current {
            if self.current.is_none() {
                // Start or resume, wait for a key frame.
                if key_frame {
                    log::info!("[Vp9SvcContext] resume to {},{} with key frame", self.target.spatial, self.target.temporal);
                    self.current = self.target;
                }
            } else if self.target.spatial == self.current.spatial {
                if self.target.temporal > self.current.temporal {
                    // Up temporal, wait for a switching point on a frame boundary.
                    if i16::from(svc.spatial) == self.current.spatial && i16::from(svc.temporal) > self.current.temporal && svc.switching_point && self.pre_end_frame {
                        log::info!("[Vp9SvcContext] up temporal {} => {}", self.current.temporal, self.target.temporal);
                        self.current.temporal = self.target.temporal;
                    }
                } else if self.target.temporal < self.current.temporal && self.pre_end_frame {
                    log::info!("[Vp9SvcContext] down temporal {} => {}", self.current.temporal, self.target.temporal);
                    self.current.temporal = self.target.temporal;
                }
            } else if self.target.spatial < self.current.spatial {
                // Shed the temporal layers right away while waiting for the
                // spatial switch position.
                if self.current.temporal != 0 && self.pre_end_frame {
                    self.current.temporal = 0;
                }
                if (self.k_svc && key_frame) || (!self.k_svc && self.pre_end_frame) {
                    log::info!(
                        "[Vp9SvcContext] down {},{} => {},{}",
                        self.current.spatial,
                        self.current.temporal,
                        self.target.spatial,
                        self.target.temporal
                    );
                    self.current = self.target;
                }
            } else {
                // Up spatial. Grab extra temporal layers early when the
                // stream offers a switching point.
                let top_temporal = self.temporal_layers - 1;
                if i16::from(svc.spatial) == self.current.spatial
                    && i16::from(svc.temporal) > self.current.temporal
                    && self.current.temporal != top_temporal
                    && svc.switching_point
                    && self.pre_end_frame
                {
                    self.current.temporal = top_temporal;
                }
                if key_frame {
                    log::info!(
                        "[Vp9SvcContext] up {},{} => {},{} with key frame",
                        self.current.spatial,
                        self.current.temporal,
                        self.target.spatial,
                        self.target.temporal
                    );
                    self.current = self.target;
                }
            }
        }

        self.pre_end_frame = svc.end_frame;
    }

    fn is_allow(&mut self, pkt: &mut MediaPacket, svc: SvcMeta) -> bool {
        if !self.current.is_active() {
            return false;
        }

        if i16::from(svc.spatial) <= self.current.spatial && i16::from(svc.temporal) <= self.current.temporal {
            // The receiver's frame ends at the highest forwarded spatial
            // layer; flag it with the marker bit.
            if i16::from(svc.spatial) == self.current.spatial && svc.end_frame && !pkt.marker {
                pkt.marker = true;
                self.forced_marker = true;
            }
            true
        } else {
            log::trace!("[Vp9SvcContext] reject {},{} seq {}", svc.spatial, svc.temporal, pkt.seq);
            false
        }
    }
}

impl EncodingContext for Vp9SvcContext {
    fn target_layers(&self) -> Layers {
        self.target
    }

    fn set_target_layers(&mut self, layers: Layers) {
        assert!(layers.is_none() || layers.is_active(), "target layers must be both unset or both set");
        self.target = layers;
    }

    fn current_layers(&self) -> Layers {
        self.current
    }

    fn set_current_layers(&mut self, layers: Layers) {
        self.current = layers;
    }

    fn process_payload(&mut self, pkt: &mut MediaPacket) -> bool {
        let Some(svc) = pkt.svc else {
            return false;
        };
        if self.target.is_none() {
            return false;
        }

        self.try_switch(pkt.key_frame, &svc);
        self.is_allow(pkt, svc)
    }

    fn restore_payload(&mut self, pkt: &mut MediaPacket) {
        if self.forced_marker {
            pkt.marker = false;
            self.forced_marker = false;
        }
    }
}

#[cfg(test)]
mod test {
    use layercast_protocol::media::{Layers, MediaPacket, SvcMeta};

    use super::super::EncodingContext;
    use super::Vp9SvcContext;

    fn vp9_pkt(seq: u16, key: bool, spatial: u8, temporal: u8, switching_point: bool, end_frame: bool) -> MediaPacket {
        MediaPacket {
            pt: 101,
            ssrc: 1,
            seq,
            ts: seq as u32 * 2700,
            marker: false,
            key_frame: key,
            svc: Some(SvcMeta {
                spatial,
                temporal,
                switching_point,
                begin_frame: false,
                end_frame,
            }),
            data: vec![1, 2, 3],
        }
    }

    #[test]
    fn rejects_everything_while_target_unset() {
        let mut ctx = Vp9SvcContext::new(3, 3, false);
        let mut pkt = vp9_pkt(0, true, 0, 0, true, true);
        assert!(!ctx.process_payload(&mut pkt));
        assert_eq!(ctx.current_layers(), Layers::NONE);
    }

    #[test]
    fn start_waits_for_key_frame() {
        let mut ctx = Vp9SvcContext::new(3, 3, false);
        ctx.set_target_layers(Layers::new(1, 1));

        let mut delta = vp9_pkt(0, false, 0, 0, false, true);
        assert!(!ctx.process_payload(&mut delta));
        assert_eq!(ctx.current_layers(), Layers::NONE);

        let mut key = vp9_pkt(1, true, 0, 0, false, true);
        assert!(ctx.process_payload(&mut key));
        assert_eq!(ctx.current_layers(), Layers::new(1, 1));
    }

    #[test]
    fn accepts_within_current_envelope_only() {
        let mut ctx = Vp9SvcContext::new(3, 3, false);
        ctx.set_target_layers(Layers::new(1, 1));
        assert!(ctx.process_payload(&mut vp9_pkt(0, true, 0, 0, false, true)));

        assert!(ctx.process_payload(&mut vp9_pkt(1, false, 1, 0, false, true)));
        assert!(ctx.process_payload(&mut vp9_pkt(2, false, 0, 1, false, true)));
        assert!(!ctx.process_payload(&mut vp9_pkt(3, false, 2, 0, false, true)));
        assert!(!ctx.process_payload(&mut vp9_pkt(4, false, 1, 2, false, true)));
        assert_eq!(ctx.current_layers(), Layers::new(1, 1));
    }

    #[test]
    fn up_spatial_waits_for_key_frame() {
        let mut ctx = Vp9SvcContext::new(3, 3, false);
        ctx.set_target_layers(Layers::new(0, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(0, true, 0, 0, false, true)));
        assert!(!ctx.process_payload(&mut vp9_pkt(1, false, 1, 0, false, true)));

        ctx.set_target_layers(Layers::new(1, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(2, false, 0, 0, false, true)));
        assert_eq!(ctx.current_layers(), Layers::new(0, 0));
        assert!(!ctx.process_payload(&mut vp9_pkt(3, false, 1, 0, false, true)));

        assert!(ctx.process_payload(&mut vp9_pkt(4, true, 0, 0, false, true)));
        assert_eq!(ctx.current_layers(), Layers::new(1, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(5, true, 1, 0, false, true)));
    }

    #[test]
    fn up_temporal_waits_for_switching_point() {
        let mut ctx = Vp9SvcContext::new(3, 3, false);
        ctx.set_target_layers(Layers::new(0, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(0, true, 0, 0, true, true)));

        ctx.set_target_layers(Layers::new(0, 2));
        // No switching point yet: layer 1/2 packets stay rejected.
        assert!(!ctx.process_payload(&mut vp9_pkt(1, false, 0, 1, false, true)));
        assert!(!ctx.process_payload(&mut vp9_pkt(2, false, 0, 2, false, true)));
        assert!(ctx.process_payload(&mut vp9_pkt(3, false, 0, 0, false, true)));
        assert_eq!(ctx.current_layers(), Layers::new(0, 0));

        // Switching point right after a frame end.
        assert!(ctx.process_payload(&mut vp9_pkt(4, false, 0, 1, true, true)));
        assert_eq!(ctx.current_layers(), Layers::new(0, 2));
        assert!(ctx.process_payload(&mut vp9_pkt(5, false, 0, 2, false, true)));
    }

    #[test]
    fn down_spatial_waits_for_frame_end() {
        let mut ctx = Vp9SvcContext::new(3, 3, false);
        ctx.set_target_layers(Layers::new(1, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(0, true, 0, 0, false, false)));
        assert!(ctx.process_payload(&mut vp9_pkt(1, false, 1, 0, false, true)));

        ctx.set_target_layers(Layers::new(0, 0));
        // Previous packet ended a frame, so the switch happens right away.
        assert!(ctx.process_payload(&mut vp9_pkt(2, false, 0, 0, false, true)));
        assert_eq!(ctx.current_layers(), Layers::new(0, 0));
        assert!(!ctx.process_payload(&mut vp9_pkt(3, false, 1, 0, false, true)));
    }

    #[test]
    fn k_svc_down_spatial_needs_key_frame() {
        let mut ctx = Vp9SvcContext::new(3, 3, true);
        ctx.set_target_layers(Layers::new(1, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(0, true, 0, 0, false, false)));
        assert!(ctx.process_payload(&mut vp9_pkt(1, false, 1, 0, false, true)));

        ctx.set_target_layers(Layers::new(0, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(2, false, 0, 0, false, true)));
        assert_eq!(ctx.current_layers(), Layers::new(1, 0));

        assert!(ctx.process_payload(&mut vp9_pkt(3, true, 0, 0, false, true)));
        assert_eq!(ctx.current_layers(), Layers::new(0, 0));
    }

    #[test]
    fn marker_forced_on_top_layer_frame_end_and_restored() {
        let mut ctx = Vp9SvcContext::new(3, 3, false);
        ctx.set_target_layers(Layers::new(1, 0));
        assert!(ctx.process_payload(&mut vp9_pkt(0, true, 0, 0, false, false)));

        let mut pkt = vp9_pkt(1, true, 1, 0, false, true);
        assert!(ctx.process_payload(&mut pkt));
        assert!(pkt.marker);
        ctx.restore_payload(&mut pkt);
        assert!(!pkt.marker);

        // A lower spatial layer ending its frame is not the receiver frame end.
        let mut low = vp9_pkt(2, false, 0, 0, false, true);
        assert!(ctx.process_payload(&mut low));
        assert!(!low.marker);
    }
}
