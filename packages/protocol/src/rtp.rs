//! RTP parameter model: what the control plane hands to a consumer at
//! creation time. Parsing/serialization of actual RTP packets is done by an
//! external library; these types only describe the negotiated session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::media::MediaCodec;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub parameter: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default)]
    pub rtcp_feedback: Vec<RtcpFeedback>,
    /// Integer fmtp-style parameters (useinbandfec, usedtx, apt, ...).
    #[serde(default)]
    pub parameters: HashMap<String, i64>,
}

impl RtpCodecParameters {
    pub fn codec(&self) -> Option<MediaCodec> {
        MediaCodec::from_mime(&self.mime_type)
    }

    pub fn int_parameter(&self, name: &str) -> Option<i64> {
        self.parameters.get(name).copied()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtxParameters {
    pub ssrc: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpEncodingParameters {
    pub ssrc: u32,
    #[serde(default)]
    pub rtx: Option<RtxParameters>,
    #[serde(default = "default_layers")]
    pub spatial_layers: i16,
    #[serde(default = "default_layers")]
    pub temporal_layers: i16,
    #[serde(default)]
    pub dtx: bool,
}

fn default_layers() -> i16 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtcpParameters {
    pub cname: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RtpParameters {
    pub codecs: Vec<RtpCodecParameters>,
    pub encodings: Vec<RtpEncodingParameters>,
    pub rtcp: RtcpParameters,
}

impl RtpParameters {
    /// The media codec for an encoding: the first non-RTX codec.
    pub fn codec_for_encoding(&self, _encoding: &RtpEncodingParameters) -> Option<&RtpCodecParameters> {
        self.codecs.iter().find(|c| c.codec().map(|c| !c.is_rtx()).unwrap_or(false))
    }

    /// The RTX codec associated to an encoding's media codec via `apt`.
    pub fn rtx_codec_for_encoding(&self, encoding: &RtpEncodingParameters) -> Option<&RtpCodecParameters> {
        let media = self.codec_for_encoding(encoding)?;
        self.codecs
            .iter()
            .find(|c| c.codec().map(|c| c.is_rtx()).unwrap_or(false) && c.int_parameter("apt") == Some(media.payload_type as i64))
    }

    /// Payload types this consumer can forward (media codecs only).
    pub fn media_payload_types(&self) -> impl Iterator<Item = u8> + '_ {
        self.codecs.iter().filter(|c| c.codec().map(|c| !c.is_rtx()).unwrap_or(false)).map(|c| c.payload_type)
    }
}
