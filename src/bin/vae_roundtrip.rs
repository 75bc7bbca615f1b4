//! Round-trip a synthetic clip through the VidTok VAE and report the
//! reconstruction error.
//!
//! With `--weights` (or `--hf-repo`) the model runs with real checkpoint
//! weights; without either it runs as a shape/finiteness smoke test on
//! zero-initialized weights.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;

use candle_vidtok::loader::{load_json_config, WeightLoader};
use candle_vidtok::{AutoencoderVidTok, AutoencoderVidTokConfig};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to a diffusers-style config.json (defaults to the published
    /// VidTok configuration)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Path to a local safetensors checkpoint
    #[arg(long)]
    weights: Option<PathBuf>,

    /// Hugging Face repo to fetch config.json and weights from
    #[arg(long)]
    hf_repo: Option<String>,

    /// Weights filename inside the Hugging Face repo
    #[arg(long, default_value = "diffusion_pytorch_model.safetensors")]
    hf_weights_file: String,

    /// Number of input frames
    #[arg(long, default_value_t = 17)]
    frames: usize,

    /// Input height
    #[arg(long, default_value_t = 256)]
    height: usize,

    /// Input width
    #[arg(long, default_value_t = 256)]
    width: usize,

    /// Sample the posterior instead of taking its mode
    #[arg(long)]
    sample: bool,

    /// Enable tiled encode/decode
    #[arg(long)]
    tiling: bool,

    /// Enable sliced (per-sample) encode/decode
    #[arg(long)]
    slicing: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("candle_vidtok=debug".parse()?)
                .add_directive("vae_roundtrip=info".parse()?),
        )
        .init();

    let args = Args::parse();
    let device = Device::Cpu;

    let (config_path, weights_path) = match &args.hf_repo {
        Some(repo) => {
            info!("fetching {repo} from the Hugging Face hub");
            let api = hf_hub::api::sync::Api::new()?;
            let repo = api.model(repo.clone());
            let config = repo.get("config.json").context("fetch config.json")?;
            let weights = repo
                .get(&args.hf_weights_file)
                .context("fetch checkpoint")?;
            (Some(config), Some(weights))
        }
        None => (args.config.clone(), args.weights.clone()),
    };

    let config: AutoencoderVidTokConfig = match &config_path {
        Some(path) => load_json_config(path).context("load model config")?,
        None => AutoencoderVidTokConfig::default(),
    };
    info!(
        "model: ch {} ch_mult {:?} z_channels {} regularizer {:?}",
        config.ch, config.ch_mult, config.z_channels, config.regularizer
    );

    let vb = match &weights_path {
        Some(path) => {
            info!("loading weights from {}", path.display());
            WeightLoader::new(device.clone(), DType::F32)
                .load(path)
                .context("load checkpoint")?
        }
        None => {
            info!("no weights given, running a zero-weight smoke test");
            VarBuilder::zeros(DType::F32, &device)
        }
    };

    let mut vae = AutoencoderVidTok::new(config, vb)?;
    if args.tiling {
        vae.enable_tiling(None, None, None, None);
    }
    if args.slicing {
        vae.enable_slicing();
    }

    info!(
        "round-tripping a {}x{}x{} clip",
        args.frames, args.height, args.width
    );
    let x = Tensor::randn(0f32, 1f32, (1, 3, args.frames, args.height, args.width), &device)?;
    let y = vae.forward(&x, args.sample)?;

    anyhow::ensure!(
        y.dims() == x.dims(),
        "shape mismatch: {:?} vs {:?}",
        y.dims(),
        x.dims()
    );

    let mse = (&y - &x)?.sqr()?.mean_all()?.to_scalar::<f32>()?;
    info!("output shape {:?}, reconstruction mse {mse:.6}", y.dims());
    Ok(())
}
