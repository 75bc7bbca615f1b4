//! VidTok: a causal 3-D video VAE with continuous (KL) or discrete (FSQ)
//! latent regularization.

pub mod blocks;
pub mod config;
pub mod conv;
pub mod decoder;
pub mod encoder;
pub mod regularizer;
pub mod vae;

pub use config::{AutoencoderVidTokConfig, RegularizerKind};
pub use conv::PadMode;
pub use decoder::VidTokDecoder3d;
pub use encoder::VidTokEncoder3d;
pub use regularizer::{DiagonalGaussianDistribution, FsqRegularizer};
pub use vae::{AutoencoderVidTok, Latent};
