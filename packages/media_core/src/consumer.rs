//! Consumer side: types shared by every consumer flavour plus the SVC
//! specialization. Consumers are sans-io: every input is a method call,
//! every effect is an [`Output`] drained with `pop_output()` by the owner
//! (the transport), which routes packets to the wire, notifications to the
//! event bus and key-frame requests to the producer.

use std::fmt::Display;

use layercast_protocol::{
    media::{Layers, MediaPacket},
    transport::{ChannelRequest, RpcResult},
};
use serde_json::{json, Value};

mod encoding_context;
mod send_stream;
pub mod svc;

pub use encoding_context::{encoding_context_for, EncodingContext};
pub use send_stream::{SendStream, SendStreamParams};
pub use svc::{SvcConsumer, SvcConsumerConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerId(pub String);

impl Display for ConsumerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Event-bus notifications, emitted with the consumer id by the owner.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Score { score: u8, producer_score: u8 },
    LayersChange(Option<Layers>),
}

impl Notification {
    /// Event name and JSON payload as published on the bus.
    pub fn to_event(&self) -> (&'static str, Value) {
        match self {
            Notification::Score { score, producer_score } => ("score", json!({ "score": score, "producerScore": producer_score })),
            Notification::LayersChange(Some(layers)) => ("layerschange", json!(layers)),
            Notification::LayersChange(None) => ("layerschange", Value::Null),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Output {
    /// Forward a rewritten RTP packet to the transport.
    Packet(MediaPacket),
    /// Resend a buffered packet (NACK) or send a probation packet.
    Retransmit { packet: MediaPacket, probation: bool },
    /// Ask the producer for a key frame, addressed by consumable ssrc.
    KeyFrameRequest(u32),
    /// Tell the bandwidth allocator this consumer wants a reallocation.
    NeedBitrateChange,
    Notify(Notification),
    RpcRes(u64, RpcResult<Value>),
    /// Control-plane request this consumer does not handle; the shared base
    /// handler takes it.
    Delegated(ChannelRequest),
}
