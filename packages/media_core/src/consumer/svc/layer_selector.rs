//! Layer selection for one SVC consumer.
//!
//! Two modes. Self-managed: [`recalculate_target_layers`] picks the best
//! pair the producer is actually delivering, up to the receiver preference.
//! Externally managed: a bandwidth allocator drives the choice through a
//! probe/ladder/commit round, carried by a [`LayerAllocation`] transaction
//! so no provisional state survives outside the round.

use layercast_protocol::media::Layers;

use crate::producer::ProducerStreamView;

/// Provisional layer choice for one allocation round. Created by
/// `use_available_bitrate`, upgraded by `increase_layer`, consumed by
/// `apply_layers`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerAllocation {
    layers: Layers,
}

impl LayerAllocation {
    pub(crate) fn new(layers: Layers) -> Self {
        Self { layers }
    }

    pub fn layers(&self) -> Layers {
        self.layers
    }

    pub(crate) fn set_layers(&mut self, layers: Layers) {
        self.layers = layers;
    }

    pub(crate) fn into_layers(self) -> Layers {
        self.layers
    }
}

/// Loss-adjusted budget: inflate a little when the link is clean, deflate
/// when it is losing badly.
pub(crate) fn virtual_bitrate(bitrate: u32, loss_percentage: f32) -> u32 {
    if loss_percentage < 2.0 {
        (1.08 * bitrate as f64) as u32
    } else if loss_percentage > 10.0 {
        ((1.0 - 0.5 * (loss_percentage as f64 / 100.0)) * bitrate as f64) as u32
    } else {
        bitrate
    }
}

/// Required bitrate as reported back to the allocator: the nominal budget
/// stands in when the choice only fits thanks to the virtual inflation.
pub(crate) fn clip_used_bitrate(used: u32, bitrate: u32, virtual_bitrate: u32) -> u32 {
    if used <= bitrate {
        used
    } else if used <= virtual_bitrate {
        bitrate
    } else {
        used
    }
}

/// Self-managed target choice: the highest spatial layer with traffic, up
/// to the preference; the temporal layer follows from how the spatial
/// choice relates to the preference.
pub(crate) fn recalculate_target_layers(now_ms: u64, producer: Option<&dyn ProducerStreamView>, preferred: Layers, stream_temporal_layers: i16) -> Layers {
    let Some(producer) = producer else {
        return Layers::NONE;
    };
    if producer.score() == 0 {
        return Layers::NONE;
    }

    let mut spatial = -1;
    for s in 0..producer.spatial_layers() {
        if producer.bitrate(now_ms, s, 0) > 0 {
            spatial = s;
            if s >= preferred.spatial {
                break;
            }
        }
    }

    if spatial == -1 {
        return Layers::NONE;
    }

    let temporal = if spatial == preferred.spatial {
        preferred.temporal
    } else if spatial < preferred.spatial {
        stream_temporal_layers - 1
    } else {
        0
    };

    Layers::new(spatial, temporal)
}

/// Walk (spatial, temporal) pairs in row-major order and keep the best pair
/// whose cumulative bitrate fits the virtual budget, stopping at the
/// preferred pair. Returns the pair and its required bitrate, or `None`
/// when the producer is absent or unhealthy or nothing fits.
pub(crate) fn probe_floor(now_ms: u64, producer: Option<&dyn ProducerStreamView>, preferred: Layers, virtual_bitrate: u32) -> Option<(Layers, u32)> {
    let producer = producer?;
    if producer.score() < 7 {
        return None;
    }

    let mut chosen = None;
    'spatial: for s in 0..producer.spatial_layers() {
        for t in 0..producer.temporal_layers() {
            let required = producer.bitrate(now_ms, s, t);
            // A silent layer or one over budget ends the walk; keep the
            // previously chosen pair if any.
            if required == 0 || required > virtual_bitrate {
                break 'spatial;
            }

            chosen = Some((Layers::new(s, t), required));
            if s == preferred.spatial && t == preferred.temporal {
                break 'spatial;
            }
        }
        if s >= preferred.spatial {
            break;
        }
    }
    chosen
}

/// One upgrade step for the allocator's surplus ladder: unset layers start
/// at (0,0), then temporal layers fill up, then the next spatial layer
/// starts over at temporal 0. Returns the candidate pair and its cost.
pub(crate) fn increase_step(now_ms: u64, producer: Option<&dyn ProducerStreamView>, provisional: Layers) -> Option<(Layers, u32)> {
    let producer = producer?;

    let (spatial, temporal) = if provisional.spatial == -1 {
        // Take the base pair even from a struggling producer.
        if producer.score() == 0 {
            return None;
        }
        (0, 0)
    } else if provisional.temporal < producer.temporal_layers() - 1 {
        (provisional.spatial, provisional.temporal + 1)
    } else {
        if producer.score() < 7 {
            return None;
        }
        if provisional.spatial + 1 > producer.spatial_layers() - 1 {
            return None;
        }
        (provisional.spatial + 1, 0)
    };

    let required = producer.layer_bitrate(now_ms, 0, temporal);
    Some((Layers::new(spatial, temporal), required))
}

/// Allocator ranking: the maximum spatial layer up to the preferred one,
/// plus one. Zero when the producer is absent or dead.
pub(crate) fn bitrate_priority(producer: Option<&dyn ProducerStreamView>, preferred_spatial: i16) -> i16 {
    let Some(producer) = producer else {
        return 0;
    };
    if producer.score() == 0 {
        return 0;
    }

    let mut priority_spatial = 0;
    for s in 0..producer.spatial_layers() {
        if s > preferred_spatial {
            break;
        }
        priority_spatial = s;
    }
    priority_spatial + 1
}

#[cfg(test)]
mod test {
    use layercast_protocol::media::Layers;
    use serde_json::Value;

    use crate::producer::ProducerStreamView;

    use super::*;

    struct MockProducer {
        score: u8,
        spatial: i16,
        temporal: i16,
        /// Cumulative bitrate per (spatial, temporal), kbps-style numbers.
        bitrates: Vec<((i16, i16), u32)>,
        /// Aggregate temporal step cost, indexed by temporal layer.
        layer_costs: Vec<u32>,
    }

    impl ProducerStreamView for MockProducer {
        fn score(&self) -> u8 {
            self.score
        }

        fn spatial_layers(&self) -> i16 {
            self.spatial
        }

        fn temporal_layers(&self) -> i16 {
            self.temporal
        }

        fn bitrate(&self, _now_ms: u64, spatial: i16, temporal: i16) -> u32 {
            self.bitrates.iter().find(|(key, _)| *key == (spatial, temporal)).map(|(_, bps)| *bps).unwrap_or(0)
        }

        fn layer_bitrate(&self, _now_ms: u64, _spatial: i16, temporal: i16) -> u32 {
            self.layer_costs.get(temporal as usize).copied().unwrap_or(0)
        }

        fn sender_report_received(&self) -> bool {
            true
        }

        fn fill_json_stats(&self) -> Value {
            Value::Null
        }
    }

    fn producer_2x2() -> MockProducer {
        MockProducer {
            score: 8,
            spatial: 2,
            temporal: 2,
            bitrates: vec![((0, 0), 100_000), ((0, 1), 200_000), ((1, 0), 400_000), ((1, 1), 800_000)],
            layer_costs: vec![400_000, 800_000],
        }
    }

    #[test]
    fn virtual_bitrate_follows_loss() {
        assert_eq!(virtual_bitrate(500_000, 0.0), 540_000);
        assert_eq!(virtual_bitrate(500_000, 5.0), 500_000);
        assert_eq!(virtual_bitrate(500_000, 20.0), 450_000);
    }

    #[test]
    fn clip_prefers_nominal_budget() {
        assert_eq!(clip_used_bitrate(400, 500, 540), 400);
        assert_eq!(clip_used_bitrate(520, 500, 540), 500);
        assert_eq!(clip_used_bitrate(600, 500, 540), 600);
    }

    #[test]
    fn probe_floor_stops_over_budget() {
        let producer = producer_2x2();
        let chosen = probe_floor(0, Some(&producer), Layers::new(1, 1), 540_000);
        assert_eq!(chosen, Some((Layers::new(1, 0), 400_000)));
    }

    #[test]
    fn probe_floor_stops_at_preferred_pair() {
        let producer = producer_2x2();
        let chosen = probe_floor(0, Some(&producer), Layers::new(0, 1), 10_000_000);
        assert_eq!(chosen, Some((Layers::new(0, 1), 200_000)));
    }

    #[test]
    fn probe_floor_requires_healthy_producer() {
        let mut producer = producer_2x2();
        producer.score = 6;
        assert_eq!(probe_floor(0, Some(&producer), Layers::new(1, 1), 10_000_000), None);
        assert_eq!(probe_floor(0, None, Layers::new(1, 1), 10_000_000), None);
    }

    #[test]
    fn increase_step_ladders_up() {
        let producer = producer_2x2();
        assert_eq!(increase_step(0, Some(&producer), Layers::NONE), Some((Layers::new(0, 0), 400_000)));
        assert_eq!(increase_step(0, Some(&producer), Layers::new(0, 0)), Some((Layers::new(0, 1), 800_000)));
        assert_eq!(increase_step(0, Some(&producer), Layers::new(0, 1)), Some((Layers::new(1, 0), 400_000)));
        assert_eq!(increase_step(0, Some(&producer), Layers::new(1, 1)), None);
    }

    #[test]
    fn increase_step_spatial_needs_good_score() {
        let mut producer = producer_2x2();
        producer.score = 5;
        assert_eq!(increase_step(0, Some(&producer), Layers::new(0, 1)), None);
        // Temporal upgrades still go through.
        assert_eq!(increase_step(0, Some(&producer), Layers::new(0, 0)), Some((Layers::new(0, 1), 800_000)));
    }

    #[test]
    fn recalculate_skips_silent_layers() {
        let mut producer = producer_2x2();
        producer.score = 10;
        let target = recalculate_target_layers(0, Some(&producer), Layers::new(1, 1), 2);
        assert_eq!(target, Layers::new(1, 1));

        // Preferred layer silent: settle below with max temporal.
        producer.bitrates.retain(|(key, _)| key.0 == 0);
        let target = recalculate_target_layers(0, Some(&producer), Layers::new(1, 1), 2);
        assert_eq!(target, Layers::new(0, 1));

        // Only a layer above the preference carries traffic: take it at
        // temporal 0.
        let producer_high = MockProducer {
            score: 10,
            spatial: 2,
            temporal: 2,
            bitrates: vec![((1, 0), 400_000)],
            layer_costs: vec![],
        };
        let target = recalculate_target_layers(0, Some(&producer_high), Layers::new(0, 0), 2);
        assert_eq!(target, Layers::new(1, 0));
    }

    #[test]
    fn recalculate_pauses_without_producer() {
        assert_eq!(recalculate_target_layers(0, None, Layers::new(1, 1), 2), Layers::NONE);
        let mut producer = producer_2x2();
        producer.score = 0;
        assert_eq!(recalculate_target_layers(0, Some(&producer), Layers::new(1, 1), 2), Layers::NONE);
    }

    #[test]
    fn priority_is_preferred_spatial_plus_one() {
        let producer = producer_2x2();
        assert_eq!(bitrate_priority(Some(&producer), 1), 2);
        assert_eq!(bitrate_priority(Some(&producer), 0), 1);
        // Preference above what the producer declares clamps to the top.
        assert_eq!(bitrate_priority(Some(&producer), 5), 2);
        assert_eq!(bitrate_priority(None, 1), 0);
    }
}
