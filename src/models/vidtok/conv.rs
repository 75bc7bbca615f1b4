//! Causal convolution primitives.
//!
//! Causality is enforced per call by padding the time axis on the leading
//! side by `dilation * (kernel - 1) + (1 - stride)` before convolving, so the
//! output at time `t` only sees inputs at times `<= t`. No state is kept
//! across calls. The 3-D convolution is realized as `kt` 2-D convolutions
//! summed over a strided temporal window, which keeps everything on Candle's
//! well-trodden `Conv2d` path.

use candle_core::{IndexOp, Module, Result, Tensor};
use candle_nn::{Conv1d, Conv1dConfig, Conv2d, Conv2dConfig, VarBuilder};

/// How the time axis is padded before a causal convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadMode {
    /// Constant zero padding.
    #[default]
    Zeros,
    /// Repeat the edge frame.
    Replicate,
    /// Mirror interior frames (edge frame not repeated).
    Reflect,
}

/// Pad `dim` of `x` by `left`/`right` elements.
///
/// Replicate repeats the edge element and accepts any pad length; reflect
/// mirrors interior elements and requires the pad to be shorter than the
/// axis.
pub(crate) fn pad_dim(
    x: &Tensor,
    dim: usize,
    left: usize,
    right: usize,
    mode: PadMode,
) -> Result<Tensor> {
    if left == 0 && right == 0 {
        return Ok(x.clone());
    }
    let len = x.dim(dim)?;
    if mode == PadMode::Reflect && (left >= len || right >= len) {
        candle_core::bail!("reflect pad ({left}, {right}) too large for axis of length {len}")
    }
    match mode {
        PadMode::Zeros => x.pad_with_zeros(dim, left, right),
        PadMode::Replicate => {
            let mut parts: Vec<Tensor> = Vec::with_capacity(left + right + 1);
            let first = x.narrow(dim, 0, 1)?;
            for _ in 0..left {
                parts.push(first.clone());
            }
            parts.push(x.clone());
            let last = x.narrow(dim, len - 1, 1)?;
            for _ in 0..right {
                parts.push(last.clone());
            }
            let refs: Vec<&Tensor> = parts.iter().collect();
            Tensor::cat(&refs, dim)
        }
        PadMode::Reflect => {
            let mut parts: Vec<Tensor> = Vec::with_capacity(left + right + 1);
            for i in (1..=left).rev() {
                parts.push(x.narrow(dim, i, 1)?);
            }
            parts.push(x.clone());
            for i in 1..=right {
                parts.push(x.narrow(dim, len - 1 - i, 1)?);
            }
            let refs: Vec<&Tensor> = parts.iter().collect();
            Tensor::cat(&refs, dim)
        }
    }
}

/// Temporal (left, right) padding for a convolution along time.
///
/// Causal: `dilation * (kernel - 1) + (1 - stride)` on the leading side only.
/// Non-causal strided convolutions get no temporal padding (callers pre-pad
/// the trailing side); non-causal unit-stride convolutions pad symmetrically.
fn temporal_padding(kernel: usize, stride: usize, dilation: usize, is_causal: bool) -> (usize, usize) {
    if is_causal {
        ((dilation * (kernel - 1) + 1).saturating_sub(stride), 0)
    } else if stride > 1 {
        (0, 0)
    } else {
        let total = dilation * (kernel - 1);
        (total / 2, total - total / 2)
    }
}

/// 1-D convolution over `(B, C, T)` with causal (or symmetric) time padding.
///
/// When causal, the inner convolution lives under a `conv` sub-path so that
/// checkpoints exported from the reference module tree load unchanged.
#[derive(Debug, Clone)]
pub struct VidTokCausalConv1d {
    conv: Conv1d,
    time_pad: (usize, usize),
    pad_mode: PadMode,
}

impl VidTokCausalConv1d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        stride: usize,
        dilation: usize,
        is_causal: bool,
        pad_mode: PadMode,
        vb: VarBuilder,
    ) -> Result<Self> {
        let wvb = if is_causal { vb.pp("conv") } else { vb };
        let weight = wvb.get((out_channels, in_channels, kernel_size), "weight")?;
        let bias = wvb.get(out_channels, "bias")?;
        let cfg = Conv1dConfig {
            padding: 0,
            stride,
            dilation,
            ..Default::default()
        };
        Ok(Self {
            conv: Conv1d::new(weight, Some(bias), cfg),
            time_pad: temporal_padding(kernel_size, stride, dilation, is_causal),
            pad_mode,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // short sequences fall back to constant padding
        let mode = if self.time_pad.0 < x.dim(2)? {
            self.pad_mode
        } else {
            PadMode::Zeros
        };
        let x = pad_dim(x, 2, self.time_pad.0, self.time_pad.1, mode)?;
        self.conv.forward(&x)
    }
}

/// 3-D convolution over `(B, C, T, H, W)` with causal (or symmetric) time
/// padding and symmetric spatial padding.
///
/// The `(out, in, kt, kh, kw)` kernel is split into `kt` 2-D slices; each
/// output frame is the sum of the slices applied to its strided temporal
/// window, with the bias added once after the sum.
#[derive(Debug, Clone)]
pub struct VidTokCausalConv3d {
    conv2d_slices: Vec<Conv2d>,
    bias: Tensor,
    kt: usize,
    stride_t: usize,
    dilation_t: usize,
    time_pad: (usize, usize),
    pad_mode: PadMode,
}

impl VidTokCausalConv3d {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize, usize),
        stride: (usize, usize, usize),
        dilation: usize,
        is_causal: bool,
        pad_mode: PadMode,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (kt, kh, kw) = kernel_size;
        let (st, sh, sw) = stride;
        if sh != sw {
            candle_core::bail!("anisotropic spatial strides are unsupported: ({sh}, {sw})")
        }
        let wvb = if is_causal { vb.pp("conv") } else { vb };
        let weight = wvb.get((out_channels, in_channels, kt, kh, kw), "weight")?;
        let bias = wvb.get(out_channels, "bias")?;

        let mut conv2d_slices = Vec::with_capacity(kt);
        for ti in 0..kt {
            let w2 = weight.i((.., .., ti, .., ..))?.contiguous()?;
            let cfg = Conv2dConfig {
                padding: kh / 2,
                stride: sh,
                dilation,
                ..Default::default()
            };
            conv2d_slices.push(Conv2d::new(w2, None, cfg));
        }

        Ok(Self {
            conv2d_slices,
            bias,
            kt,
            stride_t: st,
            dilation_t: dilation,
            time_pad: temporal_padding(kt, st, dilation, is_causal),
            pad_mode,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        // short sequences fall back to constant padding
        let mode = if self.time_pad.0 < x.dim(2)? {
            self.pad_mode
        } else {
            PadMode::Zeros
        };
        let x = pad_dim(x, 2, self.time_pad.0, self.time_pad.1, mode)?;
        let (_b, _c, t_pad, _h, _w) = x.dims5()?;

        let needed = (self.kt - 1) * self.dilation_t + 1;
        if t_pad < needed {
            candle_core::bail!("time dim too small after padding: {t_pad} < {needed}")
        }
        let t_out = (t_pad - needed) / self.stride_t + 1;

        let mut frames: Vec<Tensor> = Vec::with_capacity(t_out);
        for to in 0..t_out {
            let base = to * self.stride_t;
            let mut acc: Option<Tensor> = None;
            for (ki, conv) in self.conv2d_slices.iter().enumerate() {
                let xt = x.i((.., .., base + ki * self.dilation_t, .., ..))?.contiguous()?;
                let yt = conv.forward(&xt)?;
                acc = Some(match acc {
                    None => yt,
                    Some(prev) => prev.add(&yt)?,
                });
            }
            let yt = match acc {
                Some(y) => y,
                None => candle_core::bail!("empty temporal kernel"),
            };
            frames.push(yt.unsqueeze(2)?);
        }

        let refs: Vec<&Tensor> = frames.iter().collect();
        let y = Tensor::cat(&refs, 2)?;
        let bias = self.bias.reshape((1, self.bias.dims1()?, 1, 1, 1))?;
        y.broadcast_add(&bias)
    }
}
