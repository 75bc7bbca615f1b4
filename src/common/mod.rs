//! Common numeric layers shared across models.

pub mod norms;

pub use norms::ChannelLayerNorm;
