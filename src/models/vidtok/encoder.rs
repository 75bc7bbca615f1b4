//! Encoder pyramid: per-level spatial/temporal resnet pairs, spatial
//! downsampling on every level but the last, temporal downsampling on the
//! derived level set, then a full-3-D middle block and the latent projection.

use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};

use crate::common::ChannelLayerNorm;

use super::blocks::{
    spatial_temporal_resblock, BlockType, VidTokDownsample2d, VidTokDownsample3d, VidTokMidBlock,
    VidTokResnetBlock,
};
use super::conv::{PadMode, VidTokCausalConv3d};

const NORM_EPS: f64 = 1e-6;

/// One resolution level of the encoder.
#[derive(Debug, Clone)]
struct EncoderLevel {
    blocks: Vec<VidTokResnetBlock>,
    temporal_blocks: Vec<VidTokResnetBlock>,
    downsample: Option<VidTokDownsample2d>,
    temporal_downsample: Option<VidTokDownsample3d>,
}

/// Maps `(B, in_channels, T, H, W)` video to
/// `(B, z, T / 2^n, H / 2^(L-1), W / 2^(L-1))` latents, where `z` is
/// `2 * z_channels` when `double_z` packs mean and log-variance.
#[derive(Debug, Clone)]
pub struct VidTokEncoder3d {
    conv_in: VidTokCausalConv3d,
    levels: Vec<EncoderLevel>,
    mid: VidTokMidBlock,
    norm_out: ChannelLayerNorm,
    conv_out: VidTokCausalConv3d,
}

impl VidTokEncoder3d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        ch: usize,
        ch_mult: &[usize],
        num_res_blocks: usize,
        dropout: f64,
        z_channels: usize,
        double_z: bool,
        is_causal: bool,
        temporal_downsample_levels: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_resolutions = ch_mult.len();
        if num_resolutions == 0 {
            candle_core::bail!("ch_mult must not be empty")
        }

        let conv_in = VidTokCausalConv3d::new(
            in_channels,
            ch,
            (3, 3, 3),
            (1, 1, 1),
            1,
            is_causal,
            PadMode::Zeros,
            vb.pp("conv_in"),
        )?;

        let mut levels = Vec::with_capacity(num_resolutions);
        let mut block_in = ch;
        for i_level in 0..num_resolutions {
            let block_out = ch * ch_mult[i_level];
            let vb_s = vb.pp(format!("down.{i_level}"));
            let vb_t = vb.pp(format!("down_temporal.{i_level}"));

            let mut blocks = Vec::with_capacity(num_res_blocks);
            let mut temporal_blocks = Vec::with_capacity(num_res_blocks);
            for i_block in 0..num_res_blocks {
                blocks.push(VidTokResnetBlock::new(
                    block_in,
                    Some(block_out),
                    false,
                    dropout,
                    BlockType::Spatial2d,
                    is_causal,
                    vb_s.pp(format!("block.{i_block}")),
                )?);
                temporal_blocks.push(VidTokResnetBlock::new(
                    block_out,
                    Some(block_out),
                    false,
                    dropout,
                    BlockType::Temporal1d,
                    is_causal,
                    vb_t.pp(format!("block.{i_block}")),
                )?);
                block_in = block_out;
            }

            let (downsample, temporal_downsample) = if i_level != num_resolutions - 1 {
                let downsample = VidTokDownsample2d::new(block_in, vb_s.pp("downsample"))?;
                let temporal_downsample = if temporal_downsample_levels.contains(&i_level) {
                    Some(VidTokDownsample3d::new(
                        block_in,
                        block_in,
                        is_causal,
                        vb_t.pp("downsample"),
                    )?)
                } else {
                    None
                };
                (Some(downsample), temporal_downsample)
            } else {
                (None, None)
            };

            levels.push(EncoderLevel {
                blocks,
                temporal_blocks,
                downsample,
                temporal_downsample,
            });
        }

        let mid = VidTokMidBlock::new(block_in, dropout, is_causal, vb.pp("mid"))?;
        let norm_out = ChannelLayerNorm::new(block_in, NORM_EPS, vb.pp("norm_out"))?;
        let out_ch = if double_z { 2 * z_channels } else { z_channels };
        let conv_out = VidTokCausalConv3d::new(
            block_in,
            out_ch,
            (3, 3, 3),
            (1, 1, 1),
            1,
            is_causal,
            PadMode::Zeros,
            vb.pp("conv_out"),
        )?;

        Ok(Self {
            conv_in,
            levels,
            mid,
            norm_out,
            conv_out,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(x)?;

        for level in self.levels.iter() {
            for (block_s, block_t) in level.blocks.iter().zip(level.temporal_blocks.iter()) {
                h = spatial_temporal_resblock(&h, block_s, block_t)?;
            }
            if let Some(downsample) = &level.downsample {
                let (b, c, t, hh, ww) = h.dims5()?;
                let frames = h.permute((0, 2, 1, 3, 4))?.reshape((b * t, c, hh, ww))?;
                let frames = downsample.forward(&frames)?;
                let (_, c2, h2, w2) = frames.dims4()?;
                h = frames
                    .reshape((b, t, c2, h2, w2))?
                    .permute((0, 2, 1, 3, 4))?;
                if let Some(temporal_downsample) = &level.temporal_downsample {
                    h = temporal_downsample.forward(&h)?;
                }
            }
        }

        let h = self.mid.forward(&h)?;
        let h = self.norm_out.forward(&h)?;
        let h = ops::silu(&h)?;
        self.conv_out.forward(&h)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn randomize(varmap: &VarMap) -> Result<()> {
        for var in varmap.all_vars() {
            let r = Tensor::randn(0f32, 0.1f32, var.shape(), var.device())?;
            var.set(&r)?;
        }
        Ok(())
    }

    #[test]
    fn test_encoder_output_shape() -> Result<()> {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        // two levels: spatial /2, temporal /2 at level 0
        let enc = VidTokEncoder3d::new(3, 8, &[1, 2], 1, 0.0, 4, true, true, &[0], vb)?;

        let x = Tensor::randn(0f32, 1f32, (1, 3, 4, 16, 16), &device)?;
        let z = enc.forward(&x)?;
        assert_eq!(z.dims(), &[1, 8, 2, 8, 8]);
        Ok(())
    }

    #[test]
    fn test_encoder_is_temporally_causal() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let enc = VidTokEncoder3d::new(3, 4, &[1, 2], 1, 0.0, 2, true, true, &[0], vb)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (1, 3, 8, 8, 8), &device)?;
        let z = enc.forward(&x)?;
        assert_eq!(z.dims(), &[1, 4, 4, 4, 4]);

        // bump input frame 6; latent frames 0..=2 depend only on inputs <= 5
        let len = x.dim(2)?;
        let bumped = Tensor::cat(
            &[
                &x.narrow(2, 0, 6)?,
                &(x.narrow(2, 6, 1)? + 1.0)?,
                &x.narrow(2, 7, len - 7)?,
            ],
            2,
        )?;
        let z2 = enc.forward(&bumped)?;
        let prefix = (z.narrow(2, 0, 3)? - z2.narrow(2, 0, 3)?)?
            .abs()?
            .flatten_all()?
            .max(0)?
            .to_scalar::<f32>()?;
        assert!(prefix < 1e-5, "encoder leaked future frames: {prefix}");
        Ok(())
    }
}
