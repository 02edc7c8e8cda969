use derivative::Derivative;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn is_audio(&self) -> bool {
        matches!(self, MediaKind::Audio)
    }

    pub fn is_video(&self) -> bool {
        matches!(self, MediaKind::Video)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaCodec {
    Opus,
    H264,
    Vp8,
    Vp9,
    Rtx,
}

impl MediaCodec {
    /// Parse a mime type like "video/VP9". The subtype match is
    /// case-insensitive, SDP implementations disagree on casing.
    pub fn from_mime(mime: &str) -> Option<MediaCodec> {
        let (_kind, name) = mime.split_once('/')?;
        match name.to_ascii_lowercase().as_str() {
            "opus" => Some(MediaCodec::Opus),
            "h264" => Some(MediaCodec::H264),
            "vp8" => Some(MediaCodec::Vp8),
            "vp9" => Some(MediaCodec::Vp9),
            "rtx" => Some(MediaCodec::Rtx),
            _ => None,
        }
    }

    pub fn is_rtx(&self) -> bool {
        matches!(self, MediaCodec::Rtx)
    }
}

/// Spatial/temporal layer pair. Layers are signed: -1 is the sentinel for
/// no layer selected, which pauses forwarding at the layer level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Layers {
    #[serde(rename = "spatialLayer")]
    pub spatial: i16,
    #[serde(rename = "temporalLayer")]
    pub temporal: i16,
}

impl Layers {
    pub const NONE: Layers = Layers { spatial: -1, temporal: -1 };

    pub fn new(spatial: i16, temporal: i16) -> Self {
        Self { spatial, temporal }
    }

    pub fn is_none(&self) -> bool {
        self.spatial == -1
    }

    pub fn is_active(&self) -> bool {
        self.spatial >= 0 && self.temporal >= 0
    }
}

/// Scalability metadata extracted from the codec payload descriptor by the
/// ingest side. The descriptor parser itself lives outside this workspace,
/// packets arrive with this already filled for SVC codecs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SvcMeta {
    pub spatial: u8,
    pub temporal: u8,
    /// Temporal switching point: upper temporal layers may be joined here.
    pub switching_point: bool,
    pub begin_frame: bool,
    pub end_frame: bool,
}

#[derive(Derivative, Clone, PartialEq, Eq)]
#[derivative(Debug)]
pub struct MediaPacket {
    pub pt: u8,
    pub ssrc: u32,
    pub seq: u16,
    pub ts: u32,
    pub marker: bool,
    pub key_frame: bool,
    pub svc: Option<SvcMeta>,
    #[derivative(Debug = "ignore")]
    pub data: Vec<u8>,
}
