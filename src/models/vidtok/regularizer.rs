//! Latent-space regularizers: a diagonal Gaussian posterior for the
//! continuous case and a finite-scalar quantizer for the discrete case.

use candle_core::{Result, Tensor};

/// Diagonal Gaussian over the latent, with mean and log-variance packed along
/// the channel axis of the encoder output.
#[derive(Debug, Clone)]
pub struct DiagonalGaussianDistribution {
    pub mean: Tensor,
    pub logvar: Tensor,
}

impl DiagonalGaussianDistribution {
    /// Split `(B, 2*C, T, H, W)` moments into mean and clamped log-variance.
    pub fn new(moments: &Tensor) -> Result<Self> {
        let ch2 = moments.dim(1)?;
        if ch2 % 2 != 0 {
            candle_core::bail!("moments channel dim must be even, got {ch2}")
        }
        let ch = ch2 / 2;
        let mean = moments.narrow(1, 0, ch)?;
        let logvar = moments.narrow(1, ch, ch)?.clamp(-30.0, 20.0)?;
        Ok(Self { mean, logvar })
    }

    /// The distribution mode, i.e. the mean.
    pub fn mode(&self) -> Result<Tensor> {
        Ok(self.mean.clone())
    }

    /// Draw `mean + exp(0.5 * logvar) * eps` with `eps ~ N(0, 1)`.
    pub fn sample(&self) -> Result<Tensor> {
        let eps = Tensor::randn(0f32, 1f32, self.mean.shape(), self.mean.device())?
            .to_dtype(self.mean.dtype())?;
        let std = self.logvar.affine(0.5, 0.)?.exp()?;
        self.mean.add(&std.mul(&eps)?)
    }
}

/// Bound-tightening slack applied before rounding, so values on the outer
/// edge of the tanh range still round into the code range.
const BOUND_EPS: f64 = 1e-3;

/// Finite-scalar quantizer: each latent channel is squashed into a fixed
/// range and rounded onto `levels[c]` evenly spaced codes, normalized to
/// roughly `[-1, 1]`. The implied codebook size is the product of the levels.
#[derive(Debug, Clone)]
pub struct FsqRegularizer {
    levels: Vec<usize>,
}

impl FsqRegularizer {
    pub fn new(levels: Vec<usize>) -> Result<Self> {
        if levels.is_empty() {
            candle_core::bail!("FSQ needs at least one level entry")
        }
        if levels.iter().any(|&l| l < 2) {
            candle_core::bail!("FSQ levels must all be >= 2, got {levels:?}")
        }
        Ok(Self { levels })
    }

    pub fn codebook_size(&self) -> usize {
        self.levels.iter().product()
    }

    /// Quantize a `(B, C, T, H, W)` latent, channel `c` onto `levels[c]`
    /// discrete values.
    pub fn quantize(&self, z: &Tensor) -> Result<Tensor> {
        let channels = z.dim(1)?;
        if channels != self.levels.len() {
            candle_core::bail!(
                "latent has {channels} channels but FSQ was built for {}",
                self.levels.len()
            )
        }

        let mut quantized = Vec::with_capacity(channels);
        for (c, &level) in self.levels.iter().enumerate() {
            let l = level as f64;
            let half_l = (l - 1.0) * (1.0 + BOUND_EPS) / 2.0;
            let offset = if level % 2 == 0 { 0.5 } else { 0.0 };
            let shift = (offset / half_l).atanh();
            let half_width = (level / 2) as f64;

            let zc = z.narrow(1, c, 1)?;
            let bounded = (((zc + shift)?.tanh()? * half_l)? - offset)?;
            quantized.push((bounded.round()? / half_width)?);
        }
        let refs: Vec<&Tensor> = quantized.iter().collect();
        Tensor::cat(&refs, 1)
    }
}
