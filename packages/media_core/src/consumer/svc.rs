//! SVC consumer: forwards one scalable video stream to one receiver.
//!
//! A reactive state machine fed by the event loop: control requests,
//! producer events, inbound RTP, RTCP feedback, transport lifecycle and
//! bandwidth-allocator rounds all arrive as method calls; effects come out
//! of `pop_output()`. Three forwarding states: paused (target layers
//! unset), resyncing (target set, waiting for a key frame) and streaming.

use std::{collections::VecDeque, rc::Rc};

use layercast_protocol::{
    media::{Layers, MediaKind, MediaPacket},
    rtcp::{CompoundPacket, KeyFrameRequestKind, Nack, ReceiverReport},
    rtp::{RtpEncodingParameters, RtpParameters},
    transport::{ChannelRequest, RpcError},
};
use layercast_utils::SeqManager;
use serde_json::{json, Value};

use crate::{errors::ConsumerErrors, producer::ProducerStreamView};

use super::{
    encoding_context::{encoding_context_for, EncodingContext},
    send_stream::{SendStream, SendStreamParams},
    ConsumerId, Notification, Output,
};

pub mod layer_selector;

pub use layer_selector::LayerAllocation;

const SEQ_MAX: u64 = 1 << 16;
const SEQ_DROP_CAPACITY: usize = 1000;

type RtpSeqManager = SeqManager<SEQ_MAX, SEQ_DROP_CAPACITY>;

/// Video RTCP cadence in ms; `get_rtcp` is a no-op until ~87% has elapsed.
const DEFAULT_MAX_RTCP_INTERVAL_MS: u64 = 1000;

const METHOD_REQUEST_KEY_FRAME: &str = "consumer.requestKeyFrame";
const METHOD_SET_PREFERRED_LAYERS: &str = "consumer.setPreferredLayers";

pub struct SvcConsumerConfig {
    pub id: ConsumerId,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub consumable_rtp_encodings: Vec<RtpEncodingParameters>,
    /// Raw `preferredLayers` object from the creation request, if any.
    pub preferred_layers: Option<Value>,
    pub paused: bool,
    pub producer_paused: bool,
}

pub struct SvcConsumer {
    id: ConsumerId,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    consumable_encodings: Vec<RtpEncodingParameters>,
    supported_payload_types: smallmap::Map<u8, ()>,
    producer: Option<Rc<dyn ProducerStreamView>>,
    send_stream: SendStream,
    encoding: Box<dyn EncodingContext>,
    seq: RtpSeqManager,
    preferred: Layers,
    sync_required: bool,
    externally_managed: bool,
    paused: bool,
    producer_paused: bool,
    transport_connected: bool,
    last_rtcp_sent: u64,
    max_rtcp_interval: u64,
    queue: VecDeque<Output>,
}

impl SvcConsumer {
    pub fn new(cfg: SvcConsumerConfig) -> Result<Self, RpcError> {
        if cfg.consumable_rtp_encodings.len() != 1 {
            return Err(RpcError::new(ConsumerErrors::InvalidConsumableEncodings, "invalid consumableRtpEncodings with size != 1"));
        }
        if cfg.rtp_parameters.encodings.len() != 1 {
            return Err(RpcError::new(ConsumerErrors::InvalidEncodings, "invalid encodings with size != 1"));
        }

        let encoding = cfg.rtp_parameters.encodings[0].clone();
        if encoding.spatial_layers < 1 || encoding.temporal_layers < 1 || (encoding.spatial_layers < 2 && encoding.temporal_layers < 2) {
            return Err(RpcError::new(ConsumerErrors::InvalidLayerCount, "invalid number of layers"));
        }

        let preferred = parse_preferred_layers(cfg.preferred_layers.as_ref(), &encoding)?;

        let media_codec = cfg
            .rtp_parameters
            .codec_for_encoding(&encoding)
            .ok_or_else(|| RpcError::new(ConsumerErrors::CodecNotSupported, "no media codec for encoding"))?
            .clone();
        let codec = media_codec
            .codec()
            .ok_or_else(|| RpcError::new(ConsumerErrors::CodecNotSupported, "unknown media codec mime type"))?;

        let k_svc = media_codec.int_parameter("ksvc") == Some(1);
        let encoding_context = encoding_context_for(codec, encoding.spatial_layers, encoding.temporal_layers, k_svc)
            .ok_or_else(|| RpcError::new(ConsumerErrors::CodecNotSupported, "media codec not supported with SVC"))?;

        let mut use_nack = false;
        let mut use_pli = false;
        let mut use_fir = false;
        for fb in &media_codec.rtcp_feedback {
            match (fb.kind.as_str(), fb.parameter.as_str()) {
                ("nack", "") => use_nack = true,
                ("nack", "pli") => use_pli = true,
                ("ccm", "fir") => use_fir = true,
                _ => {}
            }
        }

        let rtx = cfg
            .rtp_parameters
            .rtx_codec_for_encoding(&encoding)
            .and_then(|codec| encoding.rtx.map(|rtx| (codec.payload_type, rtx.ssrc)));

        let mut send_stream = SendStream::new(SendStreamParams {
            ssrc: encoding.ssrc,
            payload_type: media_codec.payload_type,
            clock_rate: media_codec.clock_rate,
            cname: cfg.rtp_parameters.rtcp.cname.clone(),
            spatial_layers: encoding.spatial_layers,
            temporal_layers: encoding.temporal_layers,
            use_nack,
            use_pli,
            use_fir,
            use_in_band_fec: media_codec.int_parameter("useinbandfec") == Some(1),
            use_dtx: media_codec.int_parameter("usedtx") == Some(1) || encoding.dtx,
            rtx,
        });
        if cfg.paused || cfg.producer_paused {
            send_stream.pause();
        }

        let mut supported_payload_types = smallmap::Map::new();
        for pt in cfg.rtp_parameters.media_payload_types() {
            supported_payload_types.insert(pt, ());
        }

        log::info!(
            "[SvcConsumer] create {} with ssrc {} layers {}x{} preferred {},{}",
            cfg.id,
            encoding.ssrc,
            encoding.spatial_layers,
            encoding.temporal_layers,
            preferred.spatial,
            preferred.temporal
        );

        Ok(Self {
            id: cfg.id,
            kind: cfg.kind,
            rtp_parameters: cfg.rtp_parameters,
            consumable_encodings: cfg.consumable_rtp_encodings,
            supported_payload_types,
            producer: None,
            send_stream,
            encoding: encoding_context,
            seq: RtpSeqManager::default(),
            preferred,
            sync_required: false,
            externally_managed: false,
            paused: cfg.paused,
            producer_paused: cfg.producer_paused,
            transport_connected: false,
            last_rtcp_sent: 0,
            max_rtcp_interval: DEFAULT_MAX_RTCP_INTERVAL_MS,
            queue: VecDeque::new(),
        })
    }

    pub fn id(&self) -> &ConsumerId {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.transport_connected && !self.paused && !self.producer_paused
    }

    pub fn preferred_layers(&self) -> Layers {
        self.preferred
    }

    pub fn target_layers(&self) -> Layers {
        self.encoding.target_layers()
    }

    pub fn current_layers(&self) -> Layers {
        self.encoding.current_layers()
    }

    pub fn pop_output(&mut self) -> Option<Output> {
        self.queue.pop_front()
    }
}

/// Control-plane requests.
impl SvcConsumer {
    pub fn handle_request(&mut self, now_ms: u64, req: ChannelRequest) {
        match req.method.as_str() {
            METHOD_REQUEST_KEY_FRAME => {
                if self.is_active() {
                    self.request_key_frame();
                }
                self.queue.push_back(Output::RpcRes(req.id, Ok(Value::Null)));
            }
            METHOD_SET_PREFERRED_LAYERS => self.set_preferred_layers(now_ms, req.id, &req.data),
            _ => self.queue.push_back(Output::Delegated(req)),
        }
    }

    fn set_preferred_layers(&mut self, now_ms: u64, req_id: u64, data: &Value) {
        let previous = self.preferred;

        let Some(spatial) = data.get("spatialLayer").and_then(Value::as_u64) else {
            self.queue
                .push_back(Output::RpcRes(req_id, Err(RpcError::new(ConsumerErrors::MissingSpatialLayer, "missing spatialLayer"))));
            return;
        };

        let spatial = (spatial.min(i16::MAX as u64) as i16).min(self.send_stream.spatial_layers() - 1);
        let temporal = match data.get("temporalLayer").and_then(Value::as_u64) {
            Some(temporal) => (temporal.min(i16::MAX as u64) as i16).min(self.send_stream.temporal_layers() - 1),
            None => self.send_stream.temporal_layers() - 1,
        };
        self.preferred = Layers::new(spatial, temporal);

        log::debug!("[SvcConsumer] {} preferred layers changed to {},{}", self.id, spatial, temporal);

        self.queue.push_back(Output::RpcRes(req_id, Ok(Value::Null)));

        if self.is_active() && self.preferred != previous {
            self.may_change_layers(now_ms, true);
        }
    }
}

/// Producer events and inbound RTCP.
impl SvcConsumer {
    /// Initial stream bind.
    pub fn on_producer_stream(&mut self, producer: Rc<dyn ProducerStreamView>) {
        self.producer = Some(producer);
        self.emit_score();
    }

    /// The producer replaced its stream.
    pub fn on_producer_new_stream(&mut self, now_ms: u64, producer: Rc<dyn ProducerStreamView>) {
        self.producer = Some(producer);
        self.emit_score();

        if self.is_active() {
            self.may_change_layers(now_ms, false);
        }
    }

    pub fn on_producer_score(&mut self, now_ms: u64, score: u8, previous_score: u8) {
        self.emit_score();

        if self.is_active() {
            // When externally managed only a died/reborn stream matters
            // here; the allocator owns everything else.
            if !self.externally_managed || score == 0 || previous_score == 0 {
                self.may_change_layers(now_ms, false);
            }
        }
    }

    /// First sender report seen on the producer stream: switching becomes
    /// possible, so reconsider layers.
    pub fn on_producer_sender_report(&mut self, now_ms: u64, first: bool) {
        if !first {
            return;
        }
        let Some(producer) = &self.producer else {
            return;
        };
        if !producer.sender_report_received() {
            return;
        }

        if self.is_active() {
            self.may_change_layers(now_ms, false);
        }
    }

    pub fn on_rtcp_receiver_report(&mut self, now_ms: u64, report: &ReceiverReport) {
        if let Some((score, previous)) = self.send_stream.receive_receiver_report(report) {
            log::debug!("[SvcConsumer] {} send stream score {} => {}", self.id, previous, score);
            self.emit_score();

            if self.is_active() && !self.externally_managed {
                self.may_change_layers(now_ms, false);
            }
        }
    }

    pub fn on_nack(&mut self, nack: &Nack) {
        if !self.is_active() {
            return;
        }
        for packet in self.send_stream.receive_nack(nack) {
            self.queue.push_back(Output::Retransmit { packet, probation: false });
        }
    }

    pub fn on_key_frame_request(&mut self, kind: KeyFrameRequestKind) {
        self.send_stream.receive_key_frame_request(kind);

        if self.is_active() {
            self.request_key_frame();
        }
    }
}

/// Transport lifecycle.
impl SvcConsumer {
    pub fn on_transport_connected(&mut self, now_ms: u64) {
        log::debug!("[SvcConsumer] {} transport connected", self.id);
        self.transport_connected = true;
        self.sync_required = true;
        self.send_stream.resume();

        if self.is_active() {
            self.may_change_layers(now_ms, false);
        }
    }

    pub fn on_transport_disconnected(&mut self) {
        log::debug!("[SvcConsumer] {} transport disconnected", self.id);
        self.transport_connected = false;
        self.send_stream.pause();
        self.update_target_layers(Layers::NONE);
    }

    pub fn set_paused(&mut self, now_ms: u64, paused: bool) {
        if self.paused == paused {
            return;
        }
        let was_paused = self.effective_paused();
        self.paused = paused;
        self.apply_pause_change(now_ms, was_paused, true);
    }

    pub fn set_producer_paused(&mut self, now_ms: u64, paused: bool) {
        if self.producer_paused == paused {
            return;
        }
        let was_paused = self.effective_paused();
        self.producer_paused = paused;
        self.apply_pause_change(now_ms, was_paused, false);
    }

    fn effective_paused(&self) -> bool {
        self.paused || self.producer_paused
    }

    fn apply_pause_change(&mut self, now_ms: u64, was_paused: bool, by_user: bool) {
        if self.effective_paused() == was_paused {
            return;
        }
        if self.effective_paused() {
            log::debug!("[SvcConsumer] {} paused (user: {})", self.id, by_user);
            self.send_stream.pause();
            self.update_target_layers(Layers::NONE);

            // Free this consumer's share for the others.
            if self.externally_managed {
                self.queue.push_back(Output::NeedBitrateChange);
            }
        } else {
            log::debug!("[SvcConsumer] {} resumed (user: {})", self.id, by_user);
            self.send_stream.resume();
            self.sync_required = true;

            if self.is_active() {
                self.may_change_layers(now_ms, false);
            }
        }
    }
}

/// Bandwidth-allocator protocol: probe floor, ladder up, commit.
impl SvcConsumer {
    pub fn set_externally_managed_bitrate(&mut self) {
        self.externally_managed = true;
    }

    pub fn bitrate_priority(&self) -> i16 {
        if !self.is_active() {
            return 0;
        }
        layer_selector::bitrate_priority(self.producer_view(), self.preferred.spatial)
    }

    /// Probe floor: the minimum bitrate this consumer will consume out of
    /// the given allocation, with the provisional choice it implies.
    pub fn use_available_bitrate(&mut self, now_ms: u64, bitrate: u32) -> (LayerAllocation, u32) {
        assert!(self.externally_managed, "bitrate is not externally managed");

        if !self.is_active() {
            return (LayerAllocation::new(Layers::NONE), 0);
        }

        let virtual_bitrate = layer_selector::virtual_bitrate(bitrate, self.send_stream.loss_percentage());
        let (layers, used) = layer_selector::probe_floor(now_ms, self.producer_view(), self.preferred, virtual_bitrate).unwrap_or((Layers::NONE, 0));

        log::debug!(
            "[SvcConsumer] {} choosing layers {},{} [bitrate: {}, virtualBitrate: {}, usedBitrate: {}]",
            self.id,
            layers.spatial,
            layers.temporal,
            bitrate,
            virtual_bitrate,
            used
        );

        (LayerAllocation::new(layers), layer_selector::clip_used_bitrate(used, bitrate, virtual_bitrate))
    }

    /// Ladder up one step with the allocator's surplus. Returns the
    /// additional bitrate the step costs, 0 when impossible or unaffordable.
    pub fn increase_layer(&mut self, now_ms: u64, allocation: &mut LayerAllocation, bitrate: u32) -> u32 {
        assert!(self.externally_managed, "bitrate is not externally managed");

        if !self.is_active() {
            return 0;
        }
        if allocation.layers() == self.preferred {
            return 0;
        }

        let virtual_bitrate = layer_selector::virtual_bitrate(bitrate, self.send_stream.loss_percentage());
        let Some((layers, required)) = layer_selector::increase_step(now_ms, self.producer_view(), allocation.layers()) else {
            return 0;
        };
        if required > virtual_bitrate {
            return 0;
        }

        log::debug!(
            "[SvcConsumer] {} upgrading to layers {},{} [virtualBitrate: {}, requiredBitrate: {}]",
            self.id,
            layers.spatial,
            layers.temporal,
            virtual_bitrate,
            required
        );

        allocation.set_layers(layers);
        layer_selector::clip_used_bitrate(required, bitrate, virtual_bitrate)
    }

    /// Commit the round: promote the provisional choice into the encoding
    /// context's target layers.
    pub fn apply_layers(&mut self, allocation: LayerAllocation) {
        assert!(self.externally_managed, "bitrate is not externally managed");

        let layers = allocation.into_layers();
        if !self.is_active() {
            return;
        }

        if layers != self.encoding.target_layers() {
            self.update_target_layers(layers);
        }
    }
}

/// Forwarding pipeline and RTCP emission.
impl SvcConsumer {
    pub fn send_rtp_packet(&mut self, now_ms: u64, pkt: &mut MediaPacket) {
        if !self.is_active() {
            return;
        }

        // This consumer may support just some of the producer's codecs.
        if !self.supported_payload_types.contains_key(&pkt.pt) {
            log::debug!("[SvcConsumer] {} payload type {} not supported", self.id, pkt.pt);
            return;
        }

        // Waiting for a key frame to (re)start the output stream.
        if self.sync_required && !pkt.key_frame {
            return;
        }

        let is_sync_packet = self.sync_required;
        if is_sync_packet {
            log::info!("[SvcConsumer] {} sync key frame received, seq {}", self.id, pkt.seq);
            self.seq.sync(pkt.seq.wrapping_sub(1) as u64);
            self.sync_required = false;
        }

        let previous_layers = self.encoding.current_layers();

        if !self.encoding.process_payload(pkt) {
            self.seq.drop_value(pkt.seq as u64);
            return;
        }

        if previous_layers != self.encoding.current_layers() {
            self.emit_layers_change();
        }

        let Some(out_seq) = self.seq.generate(pkt.seq as u64) else {
            self.encoding.restore_payload(pkt);
            return;
        };

        let orig_ssrc = pkt.ssrc;
        let orig_seq = pkt.seq;

        pkt.ssrc = self.rtp_parameters.encodings[0].ssrc;
        pkt.seq = out_seq as u16;

        if self.send_stream.receive_packet(now_ms, pkt) {
            self.queue.push_back(Output::Packet(pkt.clone()));
        } else {
            log::warn!(
                "[SvcConsumer] {} failed to send packet [ssrc: {}, seq: {}] from original [ssrc: {}, seq: {}]",
                self.id,
                pkt.ssrc,
                pkt.seq,
                orig_ssrc,
                orig_seq
            );
        }

        pkt.ssrc = orig_ssrc;
        pkt.seq = orig_seq;
        self.encoding.restore_payload(pkt);
    }

    pub fn send_probation_packet(&mut self, seq: u16) {
        let packet = self.send_stream.probation_packet(seq);
        self.queue.push_back(Output::Retransmit { packet, probation: true });
    }

    pub fn get_rtcp(&mut self, packet: &mut CompoundPacket, now_ms: u64) {
        if ((now_ms.saturating_sub(self.last_rtcp_sent)) as f32 * 1.15) < self.max_rtcp_interval as f32 {
            return;
        }

        let Some(report) = self.send_stream.sender_report(now_ms) else {
            return;
        };
        packet.add_sender_report(report);
        packet.add_sdes_chunk(self.send_stream.sdes_chunk());

        self.last_rtcp_sent = now_ms;
    }

    /// Raise the accumulator to this consumer's remote fraction lost if
    /// worse; feeds the worst-case report sent upstream to the producer.
    pub fn needs_worst_remote_fraction_lost(&self, worst_remote_fraction_lost: &mut u8) {
        if !self.is_active() {
            return;
        }

        let fraction_lost = self.send_stream.fraction_lost();
        if fraction_lost > *worst_remote_fraction_lost {
            *worst_remote_fraction_lost = fraction_lost;
        }
    }

    pub fn transmission_rate(&mut self, now_ms: u64) -> u32 {
        if !self.is_active() {
            return 0;
        }
        self.send_stream.bitrate(now_ms)
    }
}

/// Layer bookkeeping.
impl SvcConsumer {
    fn producer_view(&self) -> Option<&dyn ProducerStreamView> {
        self.producer.as_ref().map(|producer| producer.as_ref())
    }

    fn may_change_layers(&mut self, now_ms: u64, force: bool) {
        let new_target = layer_selector::recalculate_target_layers(now_ms, self.producer_view(), self.preferred, self.send_stream.temporal_layers());

        if new_target == self.encoding.target_layers() {
            return;
        }

        if self.externally_managed {
            // The allocator owns temporal promotion; only bother it when the
            // spatial layer changed or the caller insists.
            if new_target.spatial != self.encoding.target_layers().spatial || force {
                self.queue.push_back(Output::NeedBitrateChange);
            }
        } else {
            self.update_target_layers(new_target);
        }
    }

    fn update_target_layers(&mut self, layers: Layers) {
        if layers.is_none() {
            if self.encoding.target_layers().is_none() && self.encoding.current_layers().is_none() {
                return;
            }
            self.encoding.set_target_layers(Layers::NONE);
            self.encoding.set_current_layers(Layers::NONE);

            log::info!("[SvcConsumer] {} target layers changed to -1,-1", self.id);
            self.emit_layers_change();
            return;
        }

        self.encoding.set_target_layers(layers);
        log::info!("[SvcConsumer] {} target layers changed to {},{}", self.id, layers.spatial, layers.temporal);

        // The receiver cannot decode an upshift until the next key frame.
        if self.encoding.target_layers().spatial > self.encoding.current_layers().spatial {
            self.request_key_frame();
        }
    }

    fn request_key_frame(&mut self) {
        if !self.kind.is_video() {
            return;
        }

        let mapped_ssrc = self.consumable_encodings[0].ssrc;
        self.queue.push_back(Output::KeyFrameRequest(mapped_ssrc));
    }

    fn emit_score(&mut self) {
        let notification = Notification::Score {
            score: self.send_stream.score(),
            producer_score: self.producer.as_ref().map(|producer| producer.score()).unwrap_or(0),
        };
        self.queue.push_back(Output::Notify(notification));
    }

    fn emit_layers_change(&mut self) {
        let current = self.encoding.current_layers();
        let layers = (current.spatial >= 0).then_some(current);
        self.queue.push_back(Output::Notify(Notification::LayersChange(layers)));
    }
}

/// JSON introspection.
impl SvcConsumer {
    pub fn fill_json(&self) -> Value {
        json!({
            "id": self.id.0,
            "kind": self.kind,
            "type": "svc",
            "rtpParameters": self.rtp_parameters,
            "paused": self.paused,
            "producerPaused": self.producer_paused,
            "rtpStream": self.send_stream.fill_json(),
            "preferredSpatialLayer": self.preferred.spatial,
            "preferredTemporalLayer": self.preferred.temporal,
            "targetSpatialLayer": self.encoding.target_layers().spatial,
            "currentSpatialLayer": self.encoding.current_layers().spatial,
            "targetTemporalLayer": self.encoding.target_layers().temporal,
            "currentTemporalLayer": self.encoding.current_layers().temporal,
        })
    }

    pub fn fill_json_stats(&self) -> Value {
        let mut stats = vec![self.send_stream.fill_json_stats()];
        if let Some(producer) = &self.producer {
            stats.push(producer.fill_json_stats());
        }
        Value::Array(stats)
    }

    pub fn fill_json_score(&self) -> Value {
        json!({
            "score": self.send_stream.score(),
            "producerScore": self.producer.as_ref().map(|producer| producer.score()).unwrap_or(0),
        })
    }
}

fn parse_preferred_layers(data: Option<&Value>, encoding: &RtpEncodingParameters) -> Result<Layers, RpcError> {
    let Some(data) = data.filter(|data| data.is_object()) else {
        // Default to the maximum pair.
        return Ok(Layers::new(encoding.spatial_layers - 1, encoding.temporal_layers - 1));
    };

    let Some(spatial) = data.get("spatialLayer").and_then(Value::as_u64) else {
        return Err(RpcError::new(ConsumerErrors::MalformedPreferredLayers, "missing preferredLayers.spatialLayer"));
    };
    let spatial = (spatial.min(i16::MAX as u64) as i16).min(encoding.spatial_layers - 1);

    let temporal = match data.get("temporalLayer").and_then(Value::as_u64) {
        Some(temporal) => (temporal.min(i16::MAX as u64) as i16).min(encoding.temporal_layers - 1),
        None => encoding.temporal_layers - 1,
    };

    Ok(Layers::new(spatial, temporal))
}
