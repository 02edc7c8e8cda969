//! Layercast core: the per-receiver side of a media worker.
//!
//! The central piece is [`consumer::SvcConsumer`]: it forwards a single SVC
//! RTP stream to one receiver, picking which spatial/temporal sub-layers to
//! let through based on receiver preference, producer health and an
//! externally supplied bandwidth budget. Everything is single-threaded and
//! sans-io: inputs arrive through `on_*` methods, effects are drained with
//! `pop_output()`.

pub mod consumer;
pub mod errors;
pub mod producer;
