//! Construction-time configuration for the autoencoder, deserializable from a
//! diffusers-style `config.json`. Immutable after construction; every derived
//! invariant is checked by [`AutoencoderVidTokConfig::validate`].

use serde::Deserialize;

use candle_core::Result;

/// Latent-space regularizer selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegularizerKind {
    /// Continuous: diagonal Gaussian posterior with KL regularization.
    Kl,
    /// Discrete: finite scalar quantization.
    Fsq,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AutoencoderVidTokConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    /// Base channel count of the pyramid.
    pub ch: usize,
    /// Per-level channel multipliers; the length fixes the pyramid depth and
    /// the spatial compression to `2^(len - 1)`.
    pub ch_mult: Vec<usize>,
    pub z_channels: usize,
    /// Pack mean and log-variance into `2 * z_channels` encoder outputs.
    pub double_z: bool,
    pub num_res_blocks: usize,
    pub dropout: f64,
    pub temporal_compression_ratio: usize,
    pub regularizer: RegularizerKind,
    /// Codebook size for the discrete regularizer; must equal
    /// `8^z_channels`.
    pub codebook_size: usize,
    pub is_causal: bool,
    /// Nominal sample extents; tiling thresholds default to half of these.
    pub sample_height: usize,
    pub sample_width: usize,
}

impl Default for AutoencoderVidTokConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            out_channels: 3,
            ch: 128,
            ch_mult: vec![1, 2, 4, 4],
            z_channels: 4,
            double_z: true,
            num_res_blocks: 2,
            dropout: 0.0,
            temporal_compression_ratio: 4,
            regularizer: RegularizerKind::Kl,
            codebook_size: 262144,
            is_causal: true,
            sample_height: 256,
            sample_width: 256,
        }
    }
}

impl AutoencoderVidTokConfig {
    pub fn num_resolutions(&self) -> usize {
        self.ch_mult.len()
    }

    /// Total spatial downsampling factor, `2^(levels - 1)`.
    pub fn spatial_compression_ratio(&self) -> usize {
        1 << (self.num_resolutions().saturating_sub(1))
    }

    /// Number of temporal halvings, `log2(temporal_compression_ratio)`.
    fn num_temporal_stages(&self) -> Result<usize> {
        let tcr = self.temporal_compression_ratio;
        if tcr == 0 || !tcr.is_power_of_two() {
            candle_core::bail!("temporal_compression_ratio must be a power of two, got {tcr}")
        }
        Ok(tcr.trailing_zeros() as usize)
    }

    /// Encoder levels that temporally downsample: the `n` levels just below
    /// the top of the pyramid, `{L-1-k | k = 1..=n}`.
    pub fn temporal_downsample_levels(&self) -> Result<Vec<usize>> {
        let n = self.num_temporal_stages()?;
        let levels = self.num_resolutions();
        Ok((1..=n).map(|k| levels - 1 - k).collect())
    }

    /// Decoder levels that temporally upsample: `{1..=n}`, the mirror of the
    /// encoder set.
    pub fn temporal_upsample_levels(&self) -> Result<Vec<usize>> {
        let n = self.num_temporal_stages()?;
        Ok((1..=n).collect())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ch_mult.is_empty() {
            candle_core::bail!("ch_mult must not be empty")
        }
        if self.z_channels == 0 {
            candle_core::bail!("z_channels must be positive")
        }

        let n = self.num_temporal_stages()?;
        if n + 1 > self.num_resolutions() {
            candle_core::bail!(
                "temporal_compression_ratio {} needs {} downsampling levels but ch_mult only provides {}",
                self.temporal_compression_ratio,
                n,
                self.num_resolutions().saturating_sub(1),
            )
        }

        if self.regularizer == RegularizerKind::Fsq {
            // discrete latents use 8 quantization levels per channel, so the
            // codebook must factor as 8^z_channels, and the encoder must not
            // emit packed mean/log-variance moments
            let expected = 8usize.pow(self.z_channels as u32);
            if self.codebook_size != expected {
                candle_core::bail!(
                    "fsq regularizer with z_channels {} requires codebook_size {expected}, got {}",
                    self.z_channels,
                    self.codebook_size,
                )
            }
            if self.double_z {
                candle_core::bail!("fsq regularizer is incompatible with double_z")
            }
        }
        Ok(())
    }
}
