//! Candle-VidTok: the VidTok causal 3-D video VAE for the Candle framework.
//!
//! This crate provides a Rust implementation of the VidTok video tokenizer:
//! an encoder/decoder pair that compresses `(B, C, T, H, W)` video tensors
//! into compact latents and reconstructs video from them, with either a
//! continuous diagonal-Gaussian posterior or a discrete finite-scalar
//! quantizer over the latent space.

pub mod common;
pub mod loader;
pub mod models;

pub use models::vidtok::*;
