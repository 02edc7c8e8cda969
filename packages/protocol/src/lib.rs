pub mod media;
pub mod rtcp;
pub mod rtp;
pub mod transport;
