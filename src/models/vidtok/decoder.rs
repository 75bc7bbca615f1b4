//! Decoder pyramid: middle block first, then per-level resnet pairs with
//! spatial upsampling on all but the lowest level and temporal upsampling on
//! the derived level set, finishing with norm, silu and the output
//! projection.

use candle_core::{Result, Tensor};
use candle_nn::{ops, VarBuilder};

use crate::common::ChannelLayerNorm;

use super::blocks::{
    spatial_temporal_resblock, BlockType, VidTokMidBlock, VidTokResnetBlock, VidTokUpsample2d,
    VidTokUpsample3d,
};
use super::conv::{PadMode, VidTokCausalConv3d};

const NORM_EPS: f64 = 1e-6;

/// One resolution level of the decoder.
#[derive(Debug, Clone)]
struct DecoderLevel {
    blocks: Vec<VidTokResnetBlock>,
    temporal_blocks: Vec<VidTokResnetBlock>,
    upsample: Option<VidTokUpsample2d>,
    temporal_upsample: Option<VidTokUpsample3d>,
}

/// Maps `(B, z_channels, T, H, W)` latents back to
/// `(B, out_channels, T * 2^n, H * 2^(L-1), W * 2^(L-1))` video.
#[derive(Debug, Clone)]
pub struct VidTokDecoder3d {
    conv_in: VidTokCausalConv3d,
    mid: VidTokMidBlock,
    levels: Vec<DecoderLevel>,
    norm_out: ChannelLayerNorm,
    conv_out: VidTokCausalConv3d,
}

impl VidTokDecoder3d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ch: usize,
        ch_mult: &[usize],
        num_res_blocks: usize,
        dropout: f64,
        z_channels: usize,
        out_channels: usize,
        is_causal: bool,
        temporal_upsample_levels: &[usize],
        vb: VarBuilder,
    ) -> Result<Self> {
        let num_resolutions = ch_mult.len();
        if num_resolutions == 0 {
            candle_core::bail!("ch_mult must not be empty")
        }
        if temporal_upsample_levels.contains(&0) {
            candle_core::bail!("temporal upsampling on level 0 is unsupported")
        }

        let mut block_in = ch * ch_mult[num_resolutions - 1];

        let conv_in = VidTokCausalConv3d::new(
            z_channels,
            block_in,
            (3, 3, 3),
            (1, 1, 1),
            1,
            is_causal,
            PadMode::Zeros,
            vb.pp("conv_in"),
        )?;

        let mid = VidTokMidBlock::new(block_in, dropout, is_causal, vb.pp("mid"))?;

        // built highest level first, mirroring the channel hand-off of the
        // encoder, then reversed into index order
        let mut levels_rev = Vec::with_capacity(num_resolutions);
        for i_level in (0..num_resolutions).rev() {
            let block_out = ch * ch_mult[i_level];
            let vb_s = vb.pp(format!("up.{i_level}"));
            let vb_t = vb.pp(format!("up_temporal.{i_level}"));

            let mut blocks = Vec::with_capacity(num_res_blocks + 1);
            let mut temporal_blocks = Vec::with_capacity(num_res_blocks + 1);
            for i_block in 0..=num_res_blocks {
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

            let upsample = if i_level != 0 {
                Some(VidTokUpsample2d::new(block_in, vb_s.pp("upsample"))?)
            } else {
                None
            };
            let temporal_upsample = if temporal_upsample_levels.contains(&i_level) {
                Some(VidTokUpsample3d::new(
                    block_in,
                    block_in,
                    is_causal,
                    vb_t.pp("upsample"),
                )?)
            } else {
                None
            };

            levels_rev.push(DecoderLevel {
                blocks,
                temporal_blocks,
                upsample,
                temporal_upsample,
            });
        }
        let mut levels = levels_rev;
        levels.reverse();

        let norm_out = ChannelLayerNorm::new(block_in, NORM_EPS, vb.pp("norm_out"))?;
        let conv_out = VidTokCausalConv3d::new(
            block_in,
            out_channels,
            (3, 3, 3),
            (1, 1, 1),
            1,
            is_causal,
            PadMode::Zeros,
            vb.pp("conv_out"),
        )?;

        Ok(Self {
            conv_in,
            mid,
            levels,
            norm_out,
            conv_out,
        })
    }

    pub fn forward(&self, z: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(z)?;
        h = self.mid.forward(&h)?;

        for level in self.levels.iter().rev() {
            for (block_s, block_t) in level.blocks.iter().zip(level.temporal_blocks.iter()) {
                h = spatial_temporal_resblock(&h, block_s, block_t)?;
            }
            if let Some(upsample) = &level.upsample {
                let (b, c, t, hh, ww) = h.dims5()?;
                let frames = h.permute((0, 2, 1, 3, 4))?.reshape((b * t, c, hh, ww))?;
                let frames = upsample.forward(&frames)?;
                let (_, c2, h2, w2) = frames.dims4()?;
                h = frames
                    .reshape((b, t, c2, h2, w2))?
                    .permute((0, 2, 1, 3, 4))?;
                if let Some(temporal_upsample) = &level.temporal_upsample {
                    h = temporal_upsample.forward(&h)?;
                }
            }
        }

        let h = self.norm_out.forward(&h)?;
        let h = ops::silu(&h)?;
        self.conv_out.forward(&h)
    }
}
