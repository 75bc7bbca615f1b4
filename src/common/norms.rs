//! Normalization layers shared across model families.

use candle_core::{Result, Tensor};
use candle_nn::{LayerNorm, LayerNormConfig, VarBuilder};

/// Learned layer normalization over the channel axis of a channels-first
/// tensor.
///
/// Candle's `LayerNorm` normalizes the trailing axis, so the channel axis
/// (dim 1) is moved last, normalized, and moved back. Accepts 3-D `(B, C, T)`,
/// 4-D `(B, C, H, W)` and 5-D `(B, C, T, H, W)` inputs.
#[derive(Debug, Clone)]
pub struct ChannelLayerNorm {
    inner: LayerNorm,
}

impl ChannelLayerNorm {
    pub fn new(dim: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let cfg = LayerNormConfig {
            eps,
            ..Default::default()
        };
        let inner = candle_nn::layer_norm(dim, cfg, vb)?;
        Ok(Self { inner })
    }

    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        match x.rank() {
            3 => x
                .permute((0, 2, 1))?
                .apply(&self.inner)?
                .permute((0, 2, 1)),
            4 => x
                .permute((0, 2, 3, 1))?
                .apply(&self.inner)?
                .permute((0, 3, 1, 2)),
            5 => x
                .permute((0, 2, 3, 4, 1))?
                .apply(&self.inner)?
                .permute((0, 4, 1, 2, 3)),
            rank => candle_core::bail!(
                "ChannelLayerNorm expects a 3/4/5-D channels-first tensor, got rank {rank}"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::{VarBuilder, VarMap};

    #[test]
    fn test_channel_norm_shapes() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = ChannelLayerNorm::new(8, 1e-6, vb)?;

        for dims in [vec![2, 8, 5], vec![2, 8, 4, 4], vec![2, 8, 3, 4, 4]] {
            let x = Tensor::randn(0f32, 1f32, dims.clone(), &device)?;
            let y = norm.forward(&x)?;
            assert_eq!(y.dims(), dims.as_slice());
        }
        Ok(())
    }

    #[test]
    fn test_normalizes_channel_axis() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        // default init: weight = ones, bias = zeros
        let norm = ChannelLayerNorm::new(16, 1e-6, vb)?;

        let x = Tensor::randn(1f32, 2f32, (2, 16, 3, 4, 4), &device)?;
        let y = norm.forward(&x)?;

        // per-position mean over channels should be ~0 after normalization
        let mean = y.mean(1)?.abs()?.mean_all()?.to_scalar::<f32>()?;
        assert!(mean < 1e-4, "channel mean after norm: {mean}");
        Ok(())
    }

    #[test]
    fn test_rejects_bad_rank() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let norm = ChannelLayerNorm::new(4, 1e-6, vb)?;
        let x = Tensor::randn(0f32, 1f32, (4, 4), &device)?;
        assert!(norm.forward(&x).is_err());
        Ok(())
    }
}
