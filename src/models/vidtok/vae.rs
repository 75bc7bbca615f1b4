//! Top-level autoencoder: owns the encoder, decoder and regularizer and
//! orchestrates slicing, spatial tiling with seam blending, and the replicate
//! time padding that makes `forward` shape-preserving for arbitrary clip
//! lengths.

use candle_core::{DType, IndexOp, Result, Tensor};
use candle_nn::VarBuilder;
use tracing::debug;

use super::config::{AutoencoderVidTokConfig, RegularizerKind};
use super::conv::{pad_dim, PadMode};
use super::decoder::VidTokDecoder3d;
use super::encoder::VidTokEncoder3d;
use super::regularizer::{DiagonalGaussianDistribution, FsqRegularizer};

/// Number of quantization levels per latent channel in the discrete case.
const FSQ_LEVELS_PER_CHANNEL: usize = 8;

/// Result of encoding: a Gaussian posterior for the continuous regularizer,
/// or the quantized latent tensor for the discrete one.
#[derive(Debug, Clone)]
pub enum Latent {
    Posterior(DiagonalGaussianDistribution),
    Quantized(Tensor),
}

impl Latent {
    /// Stochastic latent: posterior sample, or the quantized tensor itself.
    pub fn sample(&self) -> Result<Tensor> {
        match self {
            Self::Posterior(posterior) => posterior.sample(),
            Self::Quantized(z) => Ok(z.clone()),
        }
    }

    /// Deterministic latent: posterior mean, or the quantized tensor itself.
    pub fn mode(&self) -> Result<Tensor> {
        match self {
            Self::Posterior(posterior) => posterior.mode(),
            Self::Quantized(z) => Ok(z.clone()),
        }
    }
}

#[derive(Debug, Clone)]
enum Regularization {
    Kl,
    Fsq(FsqRegularizer),
}

/// Causal 3-D video VAE with continuous (KL) or discrete (FSQ) latents.
#[derive(Debug, Clone)]
pub struct AutoencoderVidTok {
    pub encoder: VidTokEncoder3d,
    pub decoder: VidTokDecoder3d,
    regularization: Regularization,

    temporal_compression_ratio: usize,
    spatial_compression_ratio: usize,

    use_slicing: bool,
    use_tiling: bool,

    tile_sample_min_height: usize,
    tile_sample_min_width: usize,
    tile_latent_min_height: usize,
    tile_latent_min_width: usize,
    tile_overlap_factor_height: f64,
    tile_overlap_factor_width: f64,

    config: AutoencoderVidTokConfig,
}

impl AutoencoderVidTok {
    pub fn new(config: AutoencoderVidTokConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;

        let encoder = VidTokEncoder3d::new(
            config.in_channels,
            config.ch,
            &config.ch_mult,
            config.num_res_blocks,
            config.dropout,
            config.z_channels,
            config.double_z,
            config.is_causal,
            &config.temporal_downsample_levels()?,
            vb.pp("encoder"),
        )?;
        let decoder = VidTokDecoder3d::new(
            config.ch,
            &config.ch_mult,
            config.num_res_blocks,
            config.dropout,
            config.z_channels,
            config.out_channels,
            config.is_causal,
            &config.temporal_upsample_levels()?,
            vb.pp("decoder"),
        )?;

        let regularization = match config.regularizer {
            RegularizerKind::Kl => Regularization::Kl,
            RegularizerKind::Fsq => Regularization::Fsq(FsqRegularizer::new(vec![
                FSQ_LEVELS_PER_CHANNEL;
                config.z_channels
            ])?),
        };

        let spatial_compression_ratio = config.spatial_compression_ratio();
        // tiling thresholds default to half the nominal sample extents
        let tile_sample_min_height = config.sample_height / 2;
        let tile_sample_min_width = config.sample_width / 2;

        Ok(Self {
            encoder,
            decoder,
            regularization,
            temporal_compression_ratio: config.temporal_compression_ratio,
            spatial_compression_ratio,
            use_slicing: false,
            use_tiling: false,
            tile_sample_min_height,
            tile_sample_min_width,
            tile_latent_min_height: tile_sample_min_height / spatial_compression_ratio,
            tile_latent_min_width: tile_sample_min_width / spatial_compression_ratio,
            tile_overlap_factor_height: 1.0 / 8.0,
            tile_overlap_factor_width: 1.0 / 8.0,
            config,
        })
    }

    pub fn config(&self) -> &AutoencoderVidTokConfig {
        &self.config
    }

    /// Enable tiled encoding/decoding, optionally overriding the tile minima
    /// and overlap fractions. Latent-space minima are re-derived from the
    /// spatial compression ratio.
    pub fn enable_tiling(
        &mut self,
        tile_sample_min_height: Option<usize>,
        tile_sample_min_width: Option<usize>,
        tile_overlap_factor_height: Option<f64>,
        tile_overlap_factor_width: Option<f64>,
    ) {
        self.use_tiling = true;
        self.tile_sample_min_height = tile_sample_min_height.unwrap_or(self.tile_sample_min_height);
        self.tile_sample_min_width = tile_sample_min_width.unwrap_or(self.tile_sample_min_width);
        self.tile_latent_min_height = self.tile_sample_min_height / self.spatial_compression_ratio;
        self.tile_latent_min_width = self.tile_sample_min_width / self.spatial_compression_ratio;
        self.tile_overlap_factor_height =
            tile_overlap_factor_height.unwrap_or(self.tile_overlap_factor_height);
        self.tile_overlap_factor_width =
            tile_overlap_factor_width.unwrap_or(self.tile_overlap_factor_width);
    }

    pub fn disable_tiling(&mut self) {
        self.use_tiling = false;
    }

    /// Process batches one sample at a time to bound peak memory. Numerically
    /// equivalent to batched execution.
    pub fn enable_slicing(&mut self) {
        self.use_slicing = true;
    }

    pub fn disable_slicing(&mut self) {
        self.use_slicing = false;
    }

    fn split_batch(x: &Tensor) -> Result<Vec<Tensor>> {
        let batch = x.dim(0)?;
        let mut slices = Vec::with_capacity(batch);
        for i in 0..batch {
            slices.push(x.narrow(0, i, 1)?);
        }
        Ok(slices)
    }

    fn encode_single(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, _t, height, width) = x.dims5()?;
        if self.use_tiling
            && (width > self.tile_sample_min_width || height > self.tile_sample_min_height)
        {
            return self.tiled_encode(x);
        }
        self.encoder.forward(x)
    }

    /// Encode a batch of videos into a latent.
    pub fn encode(&self, x: &Tensor) -> Result<Latent> {
        let moments = if self.use_slicing && x.dim(0)? > 1 {
            let slices = Self::split_batch(x)?;
            debug!(slices = slices.len(), "sliced encode");
            let mut encoded = Vec::with_capacity(slices.len());
            for slice in slices.iter() {
                encoded.push(self.encode_single(slice)?);
            }
            let refs: Vec<&Tensor> = encoded.iter().collect();
            Tensor::cat(&refs, 0)?
        } else {
            self.encode_single(x)?
        };

        match &self.regularization {
            Regularization::Kl => Ok(Latent::Posterior(DiagonalGaussianDistribution::new(
                &moments,
            )?)),
            Regularization::Fsq(fsq) => Ok(Latent::Quantized(fsq.quantize(&moments)?)),
        }
    }

    fn decode_single(&self, z: &Tensor) -> Result<Tensor> {
        let (_b, _c, _t, height, width) = z.dims5()?;
        if self.use_tiling
            && (width > self.tile_latent_min_width || height > self.tile_latent_min_height)
        {
            return self.tiled_decode(z);
        }
        self.decoder.forward(z)
    }

    /// Decode a batch of latents into videos.
    pub fn decode(&self, z: &Tensor) -> Result<Tensor> {
        if self.use_slicing && z.dim(0)? > 1 {
            let slices = Self::split_batch(z)?;
            debug!(slices = slices.len(), "sliced decode");
            let mut decoded = Vec::with_capacity(slices.len());
            for slice in slices.iter() {
                decoded.push(self.decode_single(slice)?);
            }
            let refs: Vec<&Tensor> = decoded.iter().collect();
            Tensor::cat(&refs, 0)
        } else {
            self.decode_single(z)
        }
    }

    /// Encode then decode, returning a tensor of exactly the input shape.
    ///
    /// The time axis is left-padded (replicate) up to the next multiple of the
    /// temporal compression ratio and the padded frames are stripped from the
    /// reconstruction.
    pub fn forward(&self, sample: &Tensor, sample_posterior: bool) -> Result<Tensor> {
        let frames = sample.dim(2)?;
        let ratio = self.temporal_compression_ratio;
        let time_padding = if frames % ratio != 0 {
            ratio - frames % ratio
        } else {
            0
        };
        let x = if time_padding > 0 {
            pad_dim(sample, 2, time_padding, 0, PadMode::Replicate)?
        } else {
            sample.clone()
        };

        let latent = self.encode(&x)?;
        let z = if sample_posterior {
            latent.sample()?
        } else {
            latent.mode()?
        };
        let decoded = self.decode(&z)?;
        decoded.narrow(2, time_padding, frames)
    }

    /// Linear seam blend along the height axis: the first `blend_extent` rows
    /// of `b` are ramped from `a`'s trailing rows into `b`'s leading rows.
    fn blend_v(&self, a: &Tensor, b: &Tensor, blend_extent: usize) -> Result<Tensor> {
        let blend = blend_extent.min(a.dim(3)?).min(b.dim(3)?);
        if blend == 0 {
            return Ok(b.clone());
        }
        let ramp = Tensor::arange(0u32, blend as u32, b.device())?
            .to_dtype(DType::F32)?
            .affine(1.0 / blend as f64, 0.0)?
            .reshape((1, 1, 1, blend, 1))?
            .to_dtype(b.dtype())?;
        let one_minus = ramp.neg()?.affine(1.0, 1.0)?;

        let b_head = b.narrow(3, 0, blend)?;
        let b_tail = b.narrow(3, blend, b.dim(3)? - blend)?;
        let a_tail = a.narrow(3, a.dim(3)? - blend, blend)?;

        let mixed = a_tail
            .broadcast_mul(&one_minus)?
            .add(&b_head.broadcast_mul(&ramp)?)?;
        Tensor::cat(&[&mixed, &b_tail], 3)
    }

    /// Linear seam blend along the width axis.
    fn blend_h(&self, a: &Tensor, b: &Tensor, blend_extent: usize) -> Result<Tensor> {
        let blend = blend_extent.min(a.dim(4)?).min(b.dim(4)?);
        if blend == 0 {
            return Ok(b.clone());
        }
        let ramp = Tensor::arange(0u32, blend as u32, b.device())?
            .to_dtype(DType::F32)?
            .affine(1.0 / blend as f64, 0.0)?
            .reshape((1, 1, 1, 1, blend))?
            .to_dtype(b.dtype())?;
        let one_minus = ramp.neg()?.affine(1.0, 1.0)?;

        let b_head = b.narrow(4, 0, blend)?;
        let b_tail = b.narrow(4, blend, b.dim(4)? - blend)?;
        let a_tail = a.narrow(4, a.dim(4)? - blend, blend)?;

        let mixed = a_tail
            .broadcast_mul(&one_minus)?
            .add(&b_head.broadcast_mul(&ramp)?)?;
        Tensor::cat(&[&mixed, &b_tail], 4)
    }

    /// Encode by splitting the spatial plane into overlapping tiles, encoding
    /// each independently (time is never tiled), blending each tile with its
    /// top and left neighbors over the blend extent, and concatenating the
    /// non-overlapping remainder.
    pub fn tiled_encode(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, _t, height, width) = x.dims5()?;

        let overlap_height =
            (self.tile_sample_min_height as f64 * (1.0 - self.tile_overlap_factor_height)) as usize;
        let overlap_width =
            (self.tile_sample_min_width as f64 * (1.0 - self.tile_overlap_factor_width)) as usize;
        if overlap_height == 0 || overlap_width == 0 {
            candle_core::bail!(
                "tile overlap factors leave no stride (height {overlap_height}, width {overlap_width})"
            )
        }
        let blend_extent_height =
            (self.tile_latent_min_height as f64 * self.tile_overlap_factor_height) as usize;
        let blend_extent_width =
            (self.tile_latent_min_width as f64 * self.tile_overlap_factor_width) as usize;
        let row_limit_height = self.tile_latent_min_height - blend_extent_height;
        let row_limit_width = self.tile_latent_min_width - blend_extent_width;

        debug!(
            height,
            width, overlap_height, overlap_width, "tiled encode"
        );

        let mut rows: Vec<Vec<Tensor>> = Vec::new();
        for i in (0..height).step_by(overlap_height) {
            let mut row: Vec<Tensor> = Vec::new();
            for j in (0..width).step_by(overlap_width) {
                let h_end = (i + self.tile_sample_min_height).min(height);
                let w_end = (j + self.tile_sample_min_width).min(width);
                let tile = x.i((.., .., .., i..h_end, j..w_end))?;
                row.push(self.encoder.forward(&tile)?);
            }
            rows.push(row);
        }

        let mut result_rows: Vec<Tensor> = Vec::with_capacity(rows.len());
        for (ri, row) in rows.iter().enumerate() {
            let mut result_row: Vec<Tensor> = Vec::with_capacity(row.len());
            for (cj, tile) in row.iter().enumerate() {
                let mut tile = tile.clone();
                if ri > 0 {
                    tile = self.blend_v(&rows[ri - 1][cj], &tile, blend_extent_height)?;
                }
                if cj > 0 {
                    tile = self.blend_h(&row[cj - 1], &tile, blend_extent_width)?;
                }
                let h_keep = row_limit_height.min(tile.dim(3)?);
                let w_keep = row_limit_width.min(tile.dim(4)?);
                result_row.push(tile.i((.., .., .., 0..h_keep, 0..w_keep))?);
            }
            let refs: Vec<&Tensor> = result_row.iter().collect();
            result_rows.push(Tensor::cat(&refs, 4)?);
        }
        let refs: Vec<&Tensor> = result_rows.iter().collect();
        Tensor::cat(&refs, 3)
    }

    /// Tiled counterpart of [`Self::decode`]: steps in latent space, blends
    /// and crops in sample space.
    pub fn tiled_decode(&self, z: &Tensor) -> Result<Tensor> {
        let (_b, _c, _t, height, width) = z.dims5()?;

        let overlap_height =
            (self.tile_latent_min_height as f64 * (1.0 - self.tile_overlap_factor_height)) as usize;
        let overlap_width =
            (self.tile_latent_min_width as f64 * (1.0 - self.tile_overlap_factor_width)) as usize;
        if overlap_height == 0 || overlap_width == 0 {
            candle_core::bail!(
                "tile overlap factors leave no stride (height {overlap_height}, width {overlap_width})"
            )
        }
        let blend_extent_height =
            (self.tile_sample_min_height as f64 * self.tile_overlap_factor_height) as usize;
        let blend_extent_width =
            (self.tile_sample_min_width as f64 * self.tile_overlap_factor_width) as usize;
        let row_limit_height = self.tile_sample_min_height - blend_extent_height;
        let row_limit_width = self.tile_sample_min_width - blend_extent_width;

        debug!(
            height,
            width, overlap_height, overlap_width, "tiled decode"
        );

        let mut rows: Vec<Vec<Tensor>> = Vec::new();
        for i in (0..height).step_by(overlap_height) {
            let mut row: Vec<Tensor> = Vec::new();
            for j in (0..width).step_by(overlap_width) {
                let h_end = (i + self.tile_latent_min_height).min(height);
                let w_end = (j + self.tile_latent_min_width).min(width);
                let tile = z.i((.., .., .., i..h_end, j..w_end))?;
                row.push(self.decoder.forward(&tile)?);
            }
            rows.push(row);
        }

        let mut result_rows: Vec<Tensor> = Vec::with_capacity(rows.len());
        for (ri, row) in rows.iter().enumerate() {
            let mut result_row: Vec<Tensor> = Vec::with_capacity(row.len());
            for (cj, tile) in row.iter().enumerate() {
                let mut tile = tile.clone();
                if ri > 0 {
                    tile = self.blend_v(&rows[ri - 1][cj], &tile, blend_extent_height)?;
                }
                if cj > 0 {
                    tile = self.blend_h(&row[cj - 1], &tile, blend_extent_width)?;
                }
                let h_keep = row_limit_height.min(tile.dim(3)?);
                let w_keep = row_limit_width.min(tile.dim(4)?);
                result_row.push(tile.i((.., .., .., 0..h_keep, 0..w_keep))?);
            }
            let refs: Vec<&Tensor> = result_row.iter().collect();
            result_rows.push(Tensor::cat(&refs, 4)?);
        }
        let refs: Vec<&Tensor> = result_rows.iter().collect();
        Tensor::cat(&refs, 3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use candle_nn::{VarBuilder, VarMap};

    fn small_config() -> AutoencoderVidTokConfig {
        AutoencoderVidTokConfig {
            ch: 8,
            ch_mult: vec![1, 2],
            z_channels: 4,
            double_z: true,
            num_res_blocks: 1,
            temporal_compression_ratio: 2,
            sample_height: 16,
            sample_width: 16,
            ..Default::default()
        }
    }

    fn build(config: AutoencoderVidTokConfig, device: &Device) -> Result<(VarMap, AutoencoderVidTok)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let vae = AutoencoderVidTok::new(config, vb)?;
        Ok((varmap, vae))
    }

    fn randomize(varmap: &VarMap) -> Result<()> {
        for var in varmap.all_vars() {
            let r = Tensor::randn(0f32, 0.1f32, var.shape(), var.device())?;
            var.set(&r)?;
        }
        Ok(())
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_forward_preserves_shape_with_unaligned_time() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vae) = build(small_config(), &device)?;
        randomize(&varmap)?;

        // 5 frames is not a multiple of the compression ratio 2
        let x = Tensor::randn(0f32, 1f32, (1, 3, 5, 16, 16), &device)?;
        let y = vae.forward(&x, false)?;
        assert_eq!(y.dims(), x.dims());
        assert!(y.mean_all()?.to_scalar::<f32>()?.is_finite());

        let x = Tensor::randn(0f32, 1f32, (1, 3, 4, 16, 16), &device)?;
        let y = vae.forward(&x, false)?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn test_slicing_is_numerically_invariant() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, mut vae) = build(small_config(), &device)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (3, 3, 4, 8, 8), &device)?;
        let batched = vae.encode(&x)?.mode()?;

        vae.enable_slicing();
        let sliced = vae.encode(&x)?.mode()?;
        assert_eq!(sliced.dims(), batched.dims());
        let diff = max_abs_diff(&batched, &sliced)?;
        assert!(diff < 1e-5, "slicing changed the encoding by {diff}");

        vae.disable_slicing();
        Ok(())
    }

    #[test]
    fn test_fsq_latent_is_discrete() -> Result<()> {
        let device = Device::Cpu;
        let config = AutoencoderVidTokConfig {
            regularizer: RegularizerKind::Fsq,
            double_z: false,
            z_channels: 2,
            codebook_size: 64,
            ..small_config()
        };
        let (varmap, vae) = build(config, &device)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (1, 3, 2, 8, 8), &device)?;
        let latent = vae.encode(&x)?;
        let q = match latent {
            Latent::Quantized(q) => q,
            Latent::Posterior(_) => panic!("fsq config produced a posterior"),
        };
        assert_eq!(q.dims(), &[1, 2, 1, 4, 4]);

        // all values land on the 8-level grid (integers after scaling by 4)
        let scaled = (&q * 4.0)?;
        let frac = (&scaled - &scaled.round()?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(frac < 1e-5, "off-grid quantized latent, frac {frac}");
        Ok(())
    }

    #[test]
    fn test_fsq_forward_round_trip_shape() -> Result<()> {
        let device = Device::Cpu;
        let config = AutoencoderVidTokConfig {
            regularizer: RegularizerKind::Fsq,
            double_z: false,
            z_channels: 2,
            codebook_size: 64,
            ..small_config()
        };
        let (varmap, vae) = build(config, &device)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (1, 3, 3, 8, 8), &device)?;
        let y = vae.forward(&x, true)?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn test_invalid_regularizer_combination_is_rejected() {
        let device = Device::Cpu;
        let config = AutoencoderVidTokConfig {
            regularizer: RegularizerKind::Fsq,
            double_z: true,
            ..small_config()
        };
        assert!(build(config, &device).is_err());
    }

    #[test]
    fn test_tiled_encode_geometry() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, mut vae) = build(small_config(), &device)?;
        randomize(&varmap)?;

        // 8x8 tiles with 25% overlap: stride 6, latent blend 1, row limit 3;
        // a 16x16 input stitches to the full 8x8 latent plane
        vae.enable_tiling(Some(8), Some(8), Some(0.25), Some(0.25));
        let x = Tensor::randn(0f32, 1f32, (1, 3, 2, 16, 16), &device)?;
        let z = vae.encode(&x)?.mode()?;
        assert_eq!(z.dims(), &[1, 4, 1, 8, 8]);
        assert!(z.mean_all()?.to_scalar::<f32>()?.is_finite());

        // at or below the tile threshold, tiling is bypassed entirely
        let small = Tensor::randn(0f32, 1f32, (1, 3, 2, 8, 8), &device)?;
        let z_direct = vae.encode(&small)?.mode()?;
        vae.disable_tiling();
        let z_plain = vae.encode(&small)?.mode()?;
        assert!(max_abs_diff(&z_direct, &z_plain)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_tiled_decode_geometry() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, mut vae) = build(small_config(), &device)?;
        randomize(&varmap)?;

        vae.enable_tiling(Some(8), Some(8), Some(0.25), Some(0.25));
        // latent plane 8x8 exceeds the 4x4 latent tile minimum
        let z = Tensor::randn(0f32, 1f32, (1, 4, 1, 8, 8), &device)?;
        let y = vae.decode(&z)?;
        assert_eq!(y.dims(), &[1, 3, 2, 16, 16]);
        assert!(y.mean_all()?.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn test_blend_ramp_is_linear() -> Result<()> {
        let device = Device::Cpu;
        let (_varmap, vae) = build(small_config(), &device)?;

        let a = Tensor::ones((1, 1, 1, 8, 2), DType::F32, &device)?;
        let b = Tensor::zeros((1, 1, 1, 8, 2), DType::F32, &device)?;
        let blended = vae.blend_v(&a, &b, 4)?;
        assert_eq!(blended.dims(), &[1, 1, 1, 8, 2]);

        let col = blended.i((0, 0, 0, .., 0))?.to_vec1::<f32>()?;
        let expected = [1.0, 0.75, 0.5, 0.25, 0.0, 0.0, 0.0, 0.0];
        for (got, want) in col.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-6, "ramp {col:?}");
        }
        Ok(())
    }

    #[test]
    fn test_forward_large_input_with_tiling_and_slicing() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, mut vae) = build(small_config(), &device)?;
        randomize(&varmap)?;

        vae.enable_tiling(Some(8), Some(8), Some(0.25), Some(0.25));
        vae.enable_slicing();
        let x = Tensor::randn(0f32, 1f32, (2, 3, 3, 16, 16), &device)?;
        let y = vae.forward(&x, false)?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }
}
