//! asl_signs: ASL 指文字分類器の学習・推論・エクスポート
#![recursion_limit = "256"]

use std::path::{Path, PathBuf};

use anyhow::Context;
use burn::tensor::backend::AutodiffBackend;
use burn_autodiff::Autodiff;
use burn_ndarray::{NdArray, NdArrayDevice};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use asl_signs_lib::ml::{
    export_model, run_training, ExportOptions, ExportPrecision, InferenceEngine, RuntimeProfile,
};
use asl_signs_lib::model::{AppConfig, DeviceType};

/// ASL hand-gesture letter classifier.
#[derive(Parser)]
#[command(name = "asl_signs", version, about)]
struct Cli {
    /// Path to the JSON config file.
    #[arg(long, global = true, default_value = "config.json")]
    config: PathBuf,
    /// Override the compute device from the config file.
    #[arg(long, global = true, value_enum)]
    device: Option<DeviceArg>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Cpu,
    Wgpu,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => DeviceType::Cpu,
            DeviceArg::Wgpu => DeviceType::Wgpu,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Train the classifier and write a checkpoint.
    Train {
        /// Training images, one subdirectory per class.
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Validation images with the same class subdirectories.
        #[arg(long)]
        val_dir: Option<PathBuf>,
        /// Skip the validation phase even if the config names a val_dir.
        #[arg(long)]
        no_val: bool,
        /// Number of epochs to run.
        #[arg(long)]
        epochs: Option<usize>,
        #[arg(long)]
        batch_size: Option<usize>,
        /// Adam learning rate.
        #[arg(long)]
        lr: Option<f64>,
        /// Input resolution as WIDTHxHEIGHT (e.g. 128x128).
        #[arg(long, value_parser = parse_image_size)]
        image_size: Option<(usize, usize)>,
        /// Image decoding threads per batch (0 = decode on the main thread).
        #[arg(long)]
        workers: Option<usize>,
        #[arg(long)]
        seed: Option<u64>,
        /// Resume from this checkpoint (weights, optimizer state, epoch count).
        #[arg(long)]
        checkpoint_in: Option<PathBuf>,
        /// Where to write the checkpoint when training completes.
        #[arg(long)]
        checkpoint_out: Option<PathBuf>,
        /// Named record (.mpk) with pretrained backbone weights.
        #[arg(long)]
        pretrained_backbone: Option<PathBuf>,
        /// Train only the linear head.
        #[arg(long)]
        freeze_backbone: bool,
    },
    /// Classify every image in a directory (sorted by file name).
    Predict {
        /// Checkpoint written by `train`.
        #[arg(long)]
        checkpoint: PathBuf,
        /// Directory of images.
        images: PathBuf,
    },
    /// Export a checkpoint as a self-contained mobile artifact.
    Export {
        #[arg(long)]
        checkpoint: PathBuf,
        #[arg(long)]
        output: PathBuf,
        /// Store weights as f16.
        #[arg(long)]
        half: bool,
    },
    /// Write the effective configuration to the config path.
    InitConfig,
}

fn parse_image_size(s: &str) -> Result<(usize, usize), String> {
    let (w, h) = s
        .split_once(['x', 'X'])
        .ok_or_else(|| format!("expected WIDTHxHEIGHT, got `{s}`"))?;
    let w: usize = w.trim().parse().map_err(|e| format!("invalid width: {e}"))?;
    let h: usize = h.trim().parse().map_err(|e| format!("invalid height: {e}"))?;
    if w == 0 || h == 0 {
        return Err("width and height must be positive".to_string());
    }
    Ok((w, h))
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = AppConfig::load_or_default(&cli.config);
    if let Some(device) = cli.device {
        config.device_type = device.into();
    }

    if let Command::InitConfig = cli.command {
        config
            .save(&cli.config)
            .with_context(|| format!("failed to write {}", cli.config.display()))?;
        info!(path = %cli.config.display(), "設定ファイルを保存しました");
        return Ok(());
    }

    info!(device = %config.device_type, "計算デバイス");
    match config.device_type {
        DeviceType::Cpu => run::<Autodiff<NdArray<f32>>>(cli.command, config, NdArrayDevice::Cpu),
        DeviceType::Wgpu => run_wgpu(cli.command, config),
    }
}

#[cfg(feature = "wgpu")]
fn run_wgpu(command: Command, config: AppConfig) -> anyhow::Result<()> {
    use burn_wgpu::{Wgpu, WgpuDevice};
    run::<Autodiff<Wgpu>>(command, config, WgpuDevice::default())
}

#[cfg(not(feature = "wgpu"))]
fn run_wgpu(command: Command, config: AppConfig) -> anyhow::Result<()> {
    warn!("wgpu 機能が無効なため CPU で実行します");
    run::<Autodiff<NdArray<f32>>>(command, config, NdArrayDevice::Cpu)
}

fn run<B: AutodiffBackend>(
    command: Command,
    mut config: AppConfig,
    device: B::Device,
) -> anyhow::Result<()> {
    match command {
        Command::Train {
            data_dir,
            val_dir,
            no_val,
            epochs,
            batch_size,
            lr,
            image_size,
            workers,
            seed,
            checkpoint_in,
            checkpoint_out,
            pretrained_backbone,
            freeze_backbone,
        } => {
            let t = &mut config.training;
            if let Some(v) = data_dir {
                t.data_dir = v;
            }
            if val_dir.is_some() {
                t.val_dir = val_dir;
            }
            if no_val {
                t.val_dir = None;
            }
            if let Some(v) = epochs {
                t.num_epochs = v;
            }
            if let Some(v) = batch_size {
                t.batch_size = v;
            }
            if let Some(v) = lr {
                t.learning_rate = v;
            }
            if let Some((w, h)) = image_size {
                t.image_width = w;
                t.image_height = h;
            }
            if let Some(v) = workers {
                t.num_workers = v;
            }
            if let Some(v) = seed {
                t.seed = v;
            }
            if checkpoint_in.is_some() {
                t.checkpoint_in = checkpoint_in;
            }
            if let Some(v) = checkpoint_out {
                t.checkpoint_out = v;
            }
            if pretrained_backbone.is_some() {
                config.model.pretrained_backbone = pretrained_backbone;
            }
            config.model.freeze_backbone |= freeze_backbone;

            config.log_summary();
            let report = run_training::<B, _>(&config.training, &config.model, device, |summary| {
                info!("{summary}");
            })
            .context("training failed")?;

            println!("Saved checkpoint: {}", report.checkpoint.display());
            Ok(())
        }
        Command::Predict { checkpoint, images } => {
            predict::<B::InnerBackend>(&checkpoint, &images, &device)
        }
        Command::Export {
            checkpoint,
            output,
            half,
        } => {
            let engine = InferenceEngine::<B::InnerBackend>::load(&checkpoint, &device)
                .with_context(|| format!("failed to load {}", checkpoint.display()))?;
            let options = ExportOptions {
                runtime: RuntimeProfile::mobile(),
                precision: if half {
                    ExportPrecision::Half
                } else {
                    ExportPrecision::Full
                },
            };
            let metadata = engine.metadata();
            let path = export_model(
                engine.model(),
                &metadata.classifier,
                &metadata.labels,
                &options,
                &output,
            )
            .context("export failed")?;

            println!("Exported: {}", path.display());
            Ok(())
        }
        Command::InitConfig => Ok(()),
    }
}

fn predict<B: burn::tensor::backend::Backend>(
    checkpoint: &Path,
    images: &Path,
    device: &B::Device,
) -> anyhow::Result<()> {
    let engine = InferenceEngine::<B>::load(checkpoint, device)
        .with_context(|| format!("failed to load {}", checkpoint.display()))?;
    let results = engine
        .classify_dir(images)
        .with_context(|| format!("failed to list {}", images.display()))?;

    let mut skipped = 0;
    for (path, result) in results {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        match result {
            Ok(prediction) => {
                println!("{file_name}");
                println!("\tTensor Index : {}", prediction.index);
                println!("\tPredicted Letter : {}", prediction.letter);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "画像をスキップしました");
                skipped += 1;
            }
        }
    }

    if skipped > 0 {
        warn!(skipped, "一部の画像を分類できませんでした");
    }
    Ok(())
}
