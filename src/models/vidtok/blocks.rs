//! Building blocks for the encoder/decoder pyramids: resnet blocks in 1-D,
//! 2-D and 3-D flavors, spatial self-attention, and the mixed
//! downsample/upsample stages with a learned blend weight.

use candle_core::{Module, Result, Tensor};
use candle_nn::ops;
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder};

use crate::common::ChannelLayerNorm;

use super::conv::{PadMode, VidTokCausalConv1d, VidTokCausalConv3d};

const NORM_EPS: f64 = 1e-6;

/// Which domain a resnet block convolves over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    /// 1-D over time, applied per pixel column.
    Temporal1d,
    /// 2-D over space, applied per frame.
    Spatial2d,
    /// Full 3-D.
    Volumetric3d,
}

#[derive(Debug, Clone)]
enum ResnetConv {
    Temporal(VidTokCausalConv1d),
    Spatial(Conv2d),
    Volumetric(VidTokCausalConv3d),
}

impl ResnetConv {
    fn new(
        btype: BlockType,
        is_causal: bool,
        in_channels: usize,
        out_channels: usize,
        kernel: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        match btype {
            BlockType::Spatial2d => {
                let cfg = Conv2dConfig {
                    padding: kernel / 2,
                    ..Default::default()
                };
                Ok(Self::Spatial(candle_nn::conv2d(
                    in_channels,
                    out_channels,
                    kernel,
                    cfg,
                    vb,
                )?))
            }
            BlockType::Temporal1d => Ok(Self::Temporal(VidTokCausalConv1d::new(
                in_channels,
                out_channels,
                kernel,
                1,
                1,
                is_causal,
                PadMode::Zeros,
                vb,
            )?)),
            BlockType::Volumetric3d => Ok(Self::Volumetric(VidTokCausalConv3d::new(
                in_channels,
                out_channels,
                (kernel, kernel, kernel),
                (1, 1, 1),
                1,
                is_causal,
                PadMode::Zeros,
                vb,
            )?)),
        }
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match self {
            Self::Temporal(conv) => conv.forward(x),
            Self::Spatial(conv) => conv.forward(x),
            Self::Volumetric(conv) => conv.forward(x),
        }
    }
}

/// Two-convolution residual block: norm, silu, conv, norm, silu, conv, plus a
/// shortcut. The shortcut is the identity when channel counts match, a 3x3
/// convolution when `conv_shortcut` is set, and a 1x1 projection otherwise.
///
/// Spatial extents are preserved; only the channel count may change.
#[derive(Debug, Clone)]
pub struct VidTokResnetBlock {
    norm1: ChannelLayerNorm,
    conv1: ResnetConv,
    norm2: ChannelLayerNorm,
    conv2: ResnetConv,
    shortcut: Option<ResnetConv>,
    _dropout: f64,
}

impl VidTokResnetBlock {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: Option<usize>,
        conv_shortcut: bool,
        dropout: f64,
        btype: BlockType,
        is_causal: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let out_channels = out_channels.unwrap_or(in_channels);

        let norm1 = ChannelLayerNorm::new(in_channels, NORM_EPS, vb.pp("norm1"))?;
        let conv1 = ResnetConv::new(btype, is_causal, in_channels, out_channels, 3, vb.pp("conv1"))?;
        let norm2 = ChannelLayerNorm::new(out_channels, NORM_EPS, vb.pp("norm2"))?;
        let conv2 = ResnetConv::new(btype, is_causal, out_channels, out_channels, 3, vb.pp("conv2"))?;

        let shortcut = if in_channels != out_channels {
            let (name, kernel) = if conv_shortcut {
                ("conv_shortcut", 3)
            } else {
                ("nin_shortcut", 1)
            };
            Some(ResnetConv::new(
                btype,
                is_causal,
                in_channels,
                out_channels,
                kernel,
                vb.pp(name),
            )?)
        } else {
            None
        };

        Ok(Self {
            norm1,
            conv1,
            norm2,
            conv2,
            shortcut,
            _dropout: dropout,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let mut h = self.norm1.forward(x)?;
        h = ops::silu(&h)?;
        h = self.conv1.forward(&h)?;

        h = self.norm2.forward(&h)?;
        h = ops::silu(&h)?;
        // dropout is inert at inference
        h = self.conv2.forward(&h)?;

        let x = match &self.shortcut {
            Some(conv) => conv.forward(x)?,
            None => x.clone(),
        };
        x.add(&h)
    }
}

/// Single-head scaled dot-product attention over a `(N, L, C)` sequence.
fn spatial_attention(q: &Tensor, k: &Tensor, v: &Tensor) -> Result<Tensor> {
    let channels = q.dim(2)?;
    let scale = (channels as f64).powf(-0.5);
    let attn = (q.matmul(&k.transpose(1, 2)?.contiguous()?)? * scale)?;
    let attn = ops::softmax_last_dim(&attn)?;
    attn.matmul(v)
}

/// 2-D self-attention block over the flattened spatial grid of a
/// `(B, C, H, W)` tensor. Single head, residual output.
#[derive(Debug, Clone)]
pub struct VidTokAttnBlock {
    norm: ChannelLayerNorm,
    q: Conv2d,
    k: Conv2d,
    v: Conv2d,
    proj_out: Conv2d,
}

impl VidTokAttnBlock {
    pub fn new(in_channels: usize, vb: VarBuilder) -> Result<Self> {
        let proj = |name: &str| {
            candle_nn::conv2d(
                in_channels,
                in_channels,
                1,
                Conv2dConfig::default(),
                vb.pp(name),
            )
        };
        Ok(Self {
            norm: ChannelLayerNorm::new(in_channels, NORM_EPS, vb.pp("norm"))?,
            q: proj("q")?,
            k: proj("k")?,
            v: proj("v")?,
            proj_out: proj("proj_out")?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, h, w) = x.dims4()?;

        let hidden = self.norm.forward(x)?.contiguous()?;
        let q = self.q.forward(&hidden)?;
        let k = self.k.forward(&hidden)?;
        let v = self.v.forward(&hidden)?;

        let seq = |y: Tensor| y.reshape((b, c, h * w))?.transpose(1, 2)?.contiguous();
        let out = spatial_attention(&seq(q)?, &seq(k)?, &seq(v)?)?;
        let out = out.transpose(1, 2)?.reshape((b, c, h, w))?;

        let out = self.proj_out.forward(&out)?;
        x.add(&out)
    }
}

/// 3-D variant of the attention block: 1x1x1 causal (or plain) convolution
/// projections, attending over the flattened spatial grid of each time step
/// independently. Attention never mixes time.
#[derive(Debug, Clone)]
pub struct VidTokAttnBlock3d {
    norm: ChannelLayerNorm,
    q: VidTokCausalConv3d,
    k: VidTokCausalConv3d,
    v: VidTokCausalConv3d,
    proj_out: VidTokCausalConv3d,
}

impl VidTokAttnBlock3d {
    pub fn new(in_channels: usize, is_causal: bool, vb: VarBuilder) -> Result<Self> {
        let proj = |name: &str| {
            VidTokCausalConv3d::new(
                in_channels,
                in_channels,
                (1, 1, 1),
                (1, 1, 1),
                1,
                is_causal,
                PadMode::Zeros,
                vb.pp(name),
            )
        };
        Ok(Self {
            norm: ChannelLayerNorm::new(in_channels, NORM_EPS, vb.pp("norm"))?,
            q: proj("q")?,
            k: proj("k")?,
            v: proj("v")?,
            proj_out: proj("proj_out")?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (b, c, t, h, w) = x.dims5()?;

        let hidden = self.norm.forward(x)?;
        let q = self.q.forward(&hidden)?;
        let k = self.k.forward(&hidden)?;
        let v = self.v.forward(&hidden)?;

        // (B, C, T, H, W) -> (B*T, H*W, C): time folds into the batch axis
        let seq = |y: Tensor| y.permute((0, 2, 3, 4, 1))?.reshape((b * t, h * w, c))?.contiguous();
        let out = spatial_attention(&seq(q)?, &seq(k)?, &seq(v)?)?;
        let out = out
            .reshape((b, t, h, w, c))?
            .permute((0, 4, 1, 2, 3))?
            .contiguous()?;

        let out = self.proj_out.forward(&out)?;
        x.add(&out)
    }
}

/// Blend two paths with the sigmoid of a learned scalar:
/// `sigmoid(mix) * a + (1 - sigmoid(mix)) * b`.
fn mix_blend(mix_factor: &Tensor, a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let alpha = ops::sigmoid(mix_factor)?;
    let one_minus = alpha.neg()?.affine(1.0, 1.0)?;
    a.broadcast_mul(&alpha)?.add(&b.broadcast_mul(&one_minus)?)
}

/// Average consecutive triples of frames with temporal stride 2.
fn avg_pool_time3(x: &Tensor) -> Result<Tensor> {
    let t = x.dim(2)?;
    if t < 3 {
        candle_core::bail!("temporal average pool needs at least 3 frames, got {t}")
    }
    let t_out = (t - 3) / 2 + 1;
    let mut frames = Vec::with_capacity(t_out);
    for to in 0..t_out {
        let window = x.narrow(2, to * 2, 3)?;
        frames.push((window.sum_keepdim(2)? / 3.0)?);
    }
    let refs: Vec<&Tensor> = frames.iter().collect();
    Tensor::cat(&refs, 2)
}

/// Duplicate every frame of a `(B, C, T, H, W)` tensor: nearest-neighbor
/// temporal upsampling by a factor of 2.
fn repeat_time_nearest(x: &Tensor) -> Result<Tensor> {
    let (b, c, t, h, w) = x.dims5()?;
    let y = x.unsqueeze(3)?;
    let y = Tensor::cat(&[&y, &y], 3)?;
    y.reshape((b, c, 2 * t, h, w))
}

/// Spatial downsampling by 2: trailing-edge zero pad then a stride-2 3x3
/// convolution, applied per frame.
#[derive(Debug, Clone)]
pub struct VidTokDownsample2d {
    conv: Conv2d,
}

impl VidTokDownsample2d {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            stride: 2,
            padding: 0,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = x.pad_with_zeros(2, 0, 1)?.pad_with_zeros(3, 0, 1)?;
        self.conv.forward(&x)
    }
}

/// Spatial upsampling by 2: nearest-neighbor interpolation then a 3x3
/// convolution, applied per frame.
#[derive(Debug, Clone)]
pub struct VidTokUpsample2d {
    conv: Conv2d,
}

impl VidTokUpsample2d {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        let cfg = Conv2dConfig {
            padding: 1,
            ..Default::default()
        };
        Ok(Self {
            conv: candle_nn::conv2d(channels, channels, 3, cfg, vb.pp("conv"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (_b, _c, h, w) = x.dims4()?;
        let x = x.upsample_nearest2d(2 * h, 2 * w)?;
        self.conv.forward(&x)
    }
}

/// Temporal downsampling by 2 as a learned convex blend of an average-pool
/// path and a strided-convolution path. The blend weight is the sigmoid of a
/// single learned scalar.
#[derive(Debug, Clone)]
pub struct VidTokDownsample3d {
    conv: VidTokCausalConv3d,
    mix_factor: Tensor,
    is_causal: bool,
}

impl VidTokDownsample3d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        is_causal: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = VidTokCausalConv3d::new(
            in_channels,
            out_channels,
            (3, 3, 3),
            (2, 1, 1),
            1,
            is_causal,
            PadMode::Zeros,
            vb.pp("conv"),
        )?;
        let mix_factor = vb.get(1, "mix_factor")?;
        Ok(Self {
            conv,
            mix_factor,
            is_causal,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (pooled, conv_input) = if self.is_causal {
            // leading zero frame for the pool; the conv pads itself causally
            (avg_pool_time3(&x.pad_with_zeros(2, 1, 0)?)?, x.clone())
        } else {
            // trailing zero frame feeds both paths
            let padded = x.pad_with_zeros(2, 0, 1)?;
            (avg_pool_time3(&padded)?, padded)
        };
        let hidden = self.conv.forward(&conv_input)?;
        mix_blend(&self.mix_factor, &pooled, &hidden)
    }
}

/// Temporal upsampling by 2 as a learned convex blend of nearest-neighbor
/// interpolation and a convolution of the interpolated tensor.
#[derive(Debug, Clone)]
pub struct VidTokUpsample3d {
    conv: VidTokCausalConv3d,
    mix_factor: Tensor,
}

impl VidTokUpsample3d {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        is_causal: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let conv = VidTokCausalConv3d::new(
            in_channels,
            out_channels,
            (3, 3, 3),
            (1, 1, 1),
            1,
            is_causal,
            PadMode::Zeros,
            vb.pp("conv"),
        )?;
        let mix_factor = vb.get(1, "mix_factor")?;
        Ok(Self { conv, mix_factor })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // interpolate each sample independently, then reassemble the batch
        let batch = x.dim(0)?;
        let mut upsampled = Vec::with_capacity(batch);
        for i in 0..batch {
            upsampled.push(repeat_time_nearest(&x.narrow(0, i, 1)?)?);
        }
        let refs: Vec<&Tensor> = upsampled.iter().collect();
        let x = Tensor::cat(&refs, 0)?;

        let hidden = self.conv.forward(&x)?;
        mix_blend(&self.mix_factor, &x, &hidden)
    }
}

/// Middle block shared by encoder and decoder: resnet, 3-D causal spatial
/// attention, resnet, all operating on the full 5-D tensor.
#[derive(Debug, Clone)]
pub struct VidTokMidBlock {
    block_1: VidTokResnetBlock,
    attn_1: VidTokAttnBlock3d,
    block_2: VidTokResnetBlock,
}

impl VidTokMidBlock {
    pub fn new(channels: usize, dropout: f64, is_causal: bool, vb: VarBuilder) -> Result<Self> {
        let block = |name: &str| {
            VidTokResnetBlock::new(
                channels,
                Some(channels),
                false,
                dropout,
                BlockType::Volumetric3d,
                is_causal,
                vb.pp(name),
            )
        };
        Ok(Self {
            block_1: block("block_1")?,
            attn_1: VidTokAttnBlock3d::new(channels, is_causal, vb.pp("attn_1"))?,
            block_2: block("block_2")?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let h = self.block_1.forward(x)?;
        let h = self.attn_1.forward(&h)?;
        self.block_2.forward(&h)
    }
}

/// Apply a spatial block per frame, then a temporal block per pixel column.
///
/// The ordering is load-bearing: swapping it changes how receptive fields
/// compose and breaks parity with reference checkpoints.
pub fn spatial_temporal_resblock(
    x: &Tensor,
    block_s: &VidTokResnetBlock,
    block_t: &VidTokResnetBlock,
) -> Result<Tensor> {
    let (b, c, t, h, w) = x.dims5()?;

    // (B, C, T, H, W) -> (B*T, C, H, W)
    let y = x.permute((0, 2, 1, 3, 4))?.reshape((b * t, c, h, w))?;
    let y = block_s.forward(&y)?;
    let (_, c2, h2, w2) = y.dims4()?;
    let y = y.reshape((b, t, c2, h2, w2))?.permute((0, 2, 1, 3, 4))?;

    // (B, C, T, H, W) -> (B*H*W, C, T)
    let y = y.permute((0, 3, 4, 1, 2))?.reshape((b * h2 * w2, c2, t))?;
    let y = block_t.forward(&y)?;
    y.reshape((b, h2, w2, c2, t))?.permute((0, 3, 4, 1, 2))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};
    use std::collections::HashMap;

    fn make_vb(device: &Device) -> (VarMap, VarBuilder<'static>) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        (varmap, vb)
    }

    fn randomize(varmap: &VarMap) -> Result<()> {
        for var in varmap.all_vars() {
            let r = Tensor::randn(0f32, 0.2f32, var.shape(), var.device())?;
            var.set(&r)?;
        }
        Ok(())
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        (a - b)?.abs()?.flatten_all()?.max(0)?.to_scalar::<f32>()
    }

    #[test]
    fn test_resnet_2d_changes_channels_only() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let block =
            VidTokResnetBlock::new(8, Some(16), false, 0.0, BlockType::Spatial2d, true, vb)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (2, 8, 6, 6), &device)?;
        let y = block.forward(&x)?;
        assert_eq!(y.dims(), &[2, 16, 6, 6]);
        Ok(())
    }

    #[test]
    fn test_resnet_1d_causality() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let block =
            VidTokResnetBlock::new(4, None, false, 0.0, BlockType::Temporal1d, true, vb)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (3, 4, 8), &device)?;
        let y = block.forward(&x)?;

        let len = x.dim(2)?;
        let bumped = Tensor::cat(
            &[
                &x.narrow(2, 0, 5)?,
                &(x.narrow(2, 5, 1)? + 1.0)?,
                &x.narrow(2, 6, len - 6)?,
            ],
            2,
        )?;
        let y2 = block.forward(&bumped)?;
        let prefix = max_abs_diff(&y.narrow(2, 0, 5)?, &y2.narrow(2, 0, 5)?)?;
        assert!(prefix < 1e-5, "causal resnet leaked backwards: {prefix}");
        Ok(())
    }

    #[test]
    fn test_attn_block_2d_is_residual() -> Result<()> {
        let device = Device::Cpu;
        let channels = 8;

        // zeroed projections make the attention branch vanish, leaving the
        // residual path only
        let mut ws = HashMap::new();
        ws.insert("norm.weight".to_string(), Tensor::ones(channels, DType::F32, &device)?);
        ws.insert("norm.bias".to_string(), Tensor::zeros(channels, DType::F32, &device)?);
        for name in ["q", "k", "v", "proj_out"] {
            ws.insert(
                format!("{name}.weight"),
                Tensor::zeros((channels, channels, 1, 1), DType::F32, &device)?,
            );
            ws.insert(
                format!("{name}.bias"),
                Tensor::zeros(channels, DType::F32, &device)?,
            );
        }
        let vb = VarBuilder::from_tensors(ws, DType::F32, &device);
        let attn = VidTokAttnBlock::new(channels, vb)?;

        let x = Tensor::randn(0f32, 1f32, (2, channels, 4, 4), &device)?;
        let y = attn.forward(&x)?;
        assert_eq!(y.dims(), x.dims());
        assert!(max_abs_diff(&x, &y)? < 1e-6);
        Ok(())
    }

    #[test]
    fn test_attn_block_2d_shape_with_random_weights() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let attn = VidTokAttnBlock::new(8, vb)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (2, 8, 4, 4), &device)?;
        let y = attn.forward(&x)?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn test_attn_block_3d_does_not_mix_time() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let attn = VidTokAttnBlock3d::new(4, true, vb)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (1, 4, 5, 3, 3), &device)?;
        let y = attn.forward(&x)?;
        assert_eq!(y.dims(), x.dims());

        let len = x.dim(2)?;
        let bumped = Tensor::cat(
            &[
                &x.narrow(2, 0, 2)?,
                &(x.narrow(2, 2, 1)? + 1.0)?,
                &x.narrow(2, 3, len - 3)?,
            ],
            2,
        )?;
        let y2 = attn.forward(&bumped)?;
        // every frame except the perturbed one is untouched
        let before = max_abs_diff(&y.narrow(2, 0, 2)?, &y2.narrow(2, 0, 2)?)?;
        let after = max_abs_diff(&y.narrow(2, 3, 2)?, &y2.narrow(2, 3, 2)?)?;
        assert!(before < 1e-5 && after < 1e-5, "attention mixed across time");
        Ok(())
    }

    #[test]
    fn test_downsample2d_halves_spatial() -> Result<()> {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let down = VidTokDownsample2d::new(4, vb)?;
        let x = Tensor::randn(0f32, 1f32, (2, 4, 8, 8), &device)?;
        assert_eq!(down.forward(&x)?.dims(), &[2, 4, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_upsample2d_doubles_spatial() -> Result<()> {
        let device = Device::Cpu;
        let (_varmap, vb) = make_vb(&device);
        let up = VidTokUpsample2d::new(4, vb)?;
        let x = Tensor::randn(0f32, 1f32, (2, 4, 4, 4), &device)?;
        assert_eq!(up.forward(&x)?.dims(), &[2, 4, 8, 8]);
        Ok(())
    }

    fn downsample3d_with_mix(mix: f32, device: &Device) -> Result<VidTokDownsample3d> {
        let mut ws = HashMap::new();
        ws.insert(
            "conv.conv.weight".to_string(),
            Tensor::randn(0f32, 0.5f32, (4, 4, 3, 3, 3), device)?,
        );
        ws.insert(
            "conv.conv.bias".to_string(),
            Tensor::randn(0f32, 0.5f32, (4,), device)?,
        );
        ws.insert("mix_factor".to_string(), Tensor::new(&[mix], device)?);
        let vb = VarBuilder::from_tensors(ws, DType::F32, device);
        VidTokDownsample3d::new(4, 4, true, vb)
    }

    #[test]
    fn test_downsample3d_halves_time() -> Result<()> {
        let device = Device::Cpu;
        let down = downsample3d_with_mix(2.0, &device)?;
        let x = Tensor::randn(0f32, 1f32, (1, 4, 6, 5, 5), &device)?;
        assert_eq!(down.forward(&x)?.dims(), &[1, 4, 3, 5, 5]);
        Ok(())
    }

    #[test]
    fn test_downsample3d_mix_extremes() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (1, 4, 4, 5, 5), &device)?;

        // mix -> +inf: pure averaging path
        let down = downsample3d_with_mix(40.0, &device)?;
        let pooled = avg_pool_time3(&x.pad_with_zeros(2, 1, 0)?)?;
        assert!(max_abs_diff(&down.forward(&x)?, &pooled)? < 1e-5);

        // mix -> -inf: pure convolution path
        let down = downsample3d_with_mix(-40.0, &device)?;
        let hidden = down.conv.forward(&x)?;
        assert!(max_abs_diff(&down.forward(&x)?, &hidden)? < 1e-5);
        Ok(())
    }

    #[test]
    fn test_upsample3d_mix_extreme_is_nearest_interpolation() -> Result<()> {
        let device = Device::Cpu;
        let mut ws = HashMap::new();
        ws.insert(
            "conv.conv.weight".to_string(),
            Tensor::randn(0f32, 0.5f32, (4, 4, 3, 3, 3), &device)?,
        );
        ws.insert(
            "conv.conv.bias".to_string(),
            Tensor::randn(0f32, 0.5f32, (4,), &device)?,
        );
        ws.insert("mix_factor".to_string(), Tensor::new(&[40f32], &device)?);
        let vb = VarBuilder::from_tensors(ws, DType::F32, &device);
        let up = VidTokUpsample3d::new(4, 4, true, vb)?;

        let x = Tensor::randn(0f32, 1f32, (2, 4, 3, 4, 4), &device)?;
        let y = up.forward(&x)?;
        assert_eq!(y.dims(), &[2, 4, 6, 4, 4]);
        // each source frame appears twice
        for t in 0..3 {
            let src = x.narrow(2, t, 1)?;
            assert!(max_abs_diff(&y.narrow(2, 2 * t, 1)?, &src)? < 1e-5);
            assert!(max_abs_diff(&y.narrow(2, 2 * t + 1, 1)?, &src)? < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_spatial_temporal_resblock_shapes() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let block_s =
            VidTokResnetBlock::new(4, Some(8), false, 0.0, BlockType::Spatial2d, true, vb.pp("s"))?;
        let block_t =
            VidTokResnetBlock::new(8, Some(8), false, 0.0, BlockType::Temporal1d, true, vb.pp("t"))?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (2, 4, 3, 6, 6), &device)?;
        let y = spatial_temporal_resblock(&x, &block_s, &block_t)?;
        assert_eq!(y.dims(), &[2, 8, 3, 6, 6]);

        // non-5D input is a contract violation
        let bad = Tensor::randn(0f32, 1f32, (2, 4, 6, 6), &device)?;
        assert!(spatial_temporal_resblock(&bad, &block_s, &block_t).is_err());
        Ok(())
    }

    #[test]
    fn test_mid_block_preserves_shape() -> Result<()> {
        let device = Device::Cpu;
        let (varmap, vb) = make_vb(&device);
        let mid = VidTokMidBlock::new(8, 0.0, true, vb)?;
        randomize(&varmap)?;

        let x = Tensor::randn(0f32, 1f32, (1, 8, 3, 4, 4), &device)?;
        let y = mid.forward(&x)?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }
}
