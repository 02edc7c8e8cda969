use std::fmt::Display;

#[derive(Debug, Clone, Copy, num_enum::TryFromPrimitive, num_enum::IntoPrimitive)]
#[repr(u16)]
pub enum ConsumerErrors {
    InvalidConsumableEncodings = 0x1001,
    InvalidEncodings = 0x1002,
    InvalidLayerCount = 0x1003,
    MalformedPreferredLayers = 0x1004,
    CodecNotSupported = 0x1005,
    MissingSpatialLayer = 0x1011,
}

impl From<ConsumerErrors> for u32 {
    fn from(value: ConsumerErrors) -> Self {
        u16::from(value) as u32
    }
}

impl Display for ConsumerErrors {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}
