use anyhow::Result;
use candle_core::Device;
use clap::{Parser, Subcommand};
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use varseq::config::{Config, TrainingConfig};
use varseq::data::{DataLoader, PairDataset};
use varseq::generate::SequenceGenerator;
use varseq::training::{Trainer, evaluate};

#[derive(Parser)]
#[command(name = "varseq")]
#[command(about = "Train sequence-to-sequence models with a variational latent bottleneck")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Train a new model from scratch
    Train {
        /// Path to training pairs (JSONL with "source"/"target" id arrays)
        #[arg(short, long)]
        data: String,

        /// Path to validation pairs (held out from --data if not provided)
        #[arg(long)]
        valid_data: Option<String>,

        /// Model configuration preset (tiny, base, conv)
        #[arg(short, long, default_value = "tiny")]
        model: String,

        /// Path to a JSON model config (overrides --model)
        #[arg(long)]
        config: Option<String>,

        /// Output directory for checkpoints
        #[arg(short, long, default_value = "checkpoints")]
        output: String,

        /// Learning rate
        #[arg(long, default_value = "3e-4")]
        lr: f64,

        /// Batch size
        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        /// Number of epochs
        #[arg(short, long, default_value = "10")]
        epochs: usize,

        /// Override the latent operating mode
        #[arg(long)]
        latent_mode: Option<u32>,

        /// Override the latent dimension
        #[arg(long)]
        latent_dim: Option<usize>,

        /// Override the moment-matching prior variance
        #[arg(long)]
        z_var: Option<f64>,

        /// Resume weights from a checkpoint
        #[arg(long)]
        resume: Option<String>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,

        /// GPU device index (for multi-GPU systems)
        #[arg(long, default_value = "0")]
        gpu_id: usize,
    },

    /// Report held-out loss for a trained model
    Eval {
        /// Path to model checkpoint
        #[arg(short, long)]
        checkpoint: String,

        /// Path to model config
        #[arg(long)]
        config: String,

        /// Path to evaluation pairs
        #[arg(short, long)]
        data: String,

        /// Batch size
        #[arg(short, long, default_value = "32")]
        batch_size: usize,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,
    },

    /// Decode a target sequence from a trained model
    Generate {
        /// Path to model checkpoint
        #[arg(short, long)]
        checkpoint: String,

        /// Path to model config
        #[arg(long)]
        config: String,

        /// Comma-separated source token ids
        #[arg(short, long)]
        source: String,

        /// Maximum number of tokens to generate
        #[arg(short, long, default_value = "100")]
        max_tokens: usize,

        /// Sampling temperature (0 decodes greedily)
        #[arg(long, default_value = "0.8")]
        temperature: f64,

        /// Top-k sampling
        #[arg(long)]
        top_k: Option<usize>,

        /// Use GPU (Metal on macOS, CUDA on Linux/Windows)
        #[arg(long, default_value = "true")]
        gpu: bool,
    },

    /// Show model info
    Info {
        /// Model configuration preset
        #[arg(short, long, default_value = "base")]
        model: String,
    },
}

#[allow(unused_variables)]
fn get_device(use_gpu: bool, gpu_id: usize) -> Result<Device> {
    if use_gpu {
        #[cfg(feature = "metal")]
        {
            return Ok(Device::new_metal(gpu_id)?);
        }
        #[cfg(feature = "cuda")]
        {
            return Ok(Device::new_cuda(gpu_id)?);
        }
        #[cfg(not(any(feature = "metal", feature = "cuda")))]
        {
            tracing::warn!(
                "No GPU feature enabled, using CPU. Build with --features metal or --features cuda"
            );
            return Ok(Device::Cpu);
        }
    }
    Ok(Device::Cpu)
}

fn get_config(name: &str) -> Config {
    match name {
        "tiny" => Config::tiny(),
        "base" => Config::base(),
        "conv" => Config::conv(),
        _ => {
            eprintln!("Unknown model config '{}', using tiny", name);
            Config::tiny()
        }
    }
}

fn load_model(
    config: &Config,
    checkpoint: &str,
    device: &Device,
) -> Result<varseq::Seq2SeqTransformer> {
    let mut var_map = candle_nn::VarMap::new();
    let vb = candle_nn::VarBuilder::from_varmap(&var_map, candle_core::DType::F32, device);
    let model = varseq::Seq2SeqTransformer::new(config, vb)?;
    var_map.load(checkpoint)?;
    info!("Loaded model from {}", checkpoint);
    Ok(model)
}

fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Train {
            data,
            valid_data,
            model,
            config: config_path,
            output,
            lr,
            batch_size,
            epochs,
            latent_mode,
            latent_dim,
            z_var,
            resume,
            gpu,
            gpu_id,
        } => {
            let device = get_device(gpu, gpu_id)?;
            info!("Using device: {:?}", device);

            let mut config = match &config_path {
                Some(path) => Config::from_json(path)?,
                None => get_config(&model),
            };
            if let Some(mode) = latent_mode {
                config.latent_mode = mode;
            }
            if let Some(dim) = latent_dim {
                config.latent_dim = dim;
            }
            if let Some(variance) = z_var {
                config.z_var = variance;
            }
            info!("Model config: {:?}", config);

            let dataset = PairDataset::from_file(
                &data,
                config.src_max_len,
                config.trg_max_len,
                config.pad_id,
            )?;
            info!("Loaded {} training pairs from {}", dataset.len(), data);

            let training_config = TrainingConfig {
                learning_rate: lr,
                batch_size,
                epochs,
                ..Default::default()
            };

            let (train_set, valid_set) = match &valid_data {
                Some(path) => {
                    let valid = PairDataset::from_file(
                        path,
                        config.src_max_len,
                        config.trg_max_len,
                        config.pad_id,
                    )?;
                    info!("Loaded {} validation pairs from {}", valid.len(), path);
                    (dataset, valid)
                }
                None => {
                    let (train, valid) = dataset.split(training_config.valid_ratio);
                    info!("Held out {} pairs for validation", valid.len());
                    (train, valid)
                }
            };

            let mut train_loader = DataLoader::new(train_set, batch_size, true);
            info!("Number of batches: {}", train_loader.num_batches());

            let mut valid_loader = if valid_set.len() >= batch_size {
                Some(DataLoader::new(valid_set, batch_size, false))
            } else {
                None
            };

            std::fs::create_dir_all(&output)?;

            let mut trainer = Trainer::new(config.clone(), training_config, device)?;
            if let Some(path) = &resume {
                trainer.load_checkpoint(path)?;
                info!("Resumed weights from {}", path);
            }

            config.save_json(&format!("{}/config.json", output))?;
            info!("Saved config to {}/config.json", output);

            trainer.train(&mut train_loader, valid_loader.as_mut(), Some(&output))?;
            info!("Training complete!");
        }

        Commands::Eval {
            checkpoint,
            config: config_path,
            data,
            batch_size,
            gpu,
        } => {
            let device = get_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let config = Config::from_json(&config_path)?;
            let dataset = PairDataset::from_file(
                &data,
                config.src_max_len,
                config.trg_max_len,
                config.pad_id,
            )?;
            info!("Loaded {} evaluation pairs from {}", dataset.len(), data);
            let mut loader = DataLoader::new(dataset, batch_size, false);

            let model = load_model(&config, &checkpoint, &device)?;
            let (task_loss, latent_loss) = evaluate(&model, &mut loader, &device)?;

            println!("task loss: {:.4}", task_loss);
            println!("latent loss: {:.4}", latent_loss);
            println!("perplexity: {:.2}", task_loss.exp());
        }

        Commands::Generate {
            checkpoint,
            config: config_path,
            source,
            max_tokens,
            temperature,
            top_k,
            gpu,
        } => {
            let device = get_device(gpu, 0)?;
            info!("Using device: {:?}", device);

            let config = Config::from_json(&config_path)?;
            let model = load_model(&config, &checkpoint, &device)?;

            let source_ids = source
                .split(',')
                .map(|s| s.trim().parse::<u32>())
                .collect::<std::result::Result<Vec<u32>, _>>()?;
            info!("Source tokens: {:?}", source_ids);

            let generator = SequenceGenerator::new(&model, &device);
            let output_tokens = generator.generate(&source_ids, max_tokens, temperature, top_k)?;

            let rendered: Vec<String> = output_tokens.iter().map(|t| t.to_string()).collect();
            println!("{}", rendered.join(" "));
        }

        Commands::Info { model } => {
            let config = get_config(&model);
            println!("Model: {}", model);
            println!("  Vocab size: {}", config.vocab_size);
            println!("  Model dimension: {}", config.model_dim);
            println!("  Encoder layers: {}", config.num_encoder_layers);
            println!("  Decoder layers: {}", config.num_decoder_layers);
            println!("  Num heads: {}", config.num_heads);
            println!("  FFN size: {}", config.ff_dim);
            println!("  Head dimension: {}", config.head_dim());
            println!("  Latent mode: {}", config.latent_mode);
            println!("  Latent dimension: {}", config.latent_dim);
            println!("  Source/target length: {}/{}", config.src_max_len, config.trg_max_len);

            let d = config.model_dim;
            let l = config.latent_dim;
            let embed_params = config.vocab_size * d;
            let attn_params = 4 * (d * d + d);
            let ff_params = d * config.ff_dim + config.ff_dim + config.ff_dim * d + d;
            let norm_params = 2 * d;
            let encoder_layer = attn_params + ff_params + 2 * norm_params;
            let decoder_layer = 2 * attn_params + ff_params + 3 * norm_params;
            let head_params = d * config.vocab_size;
            let conv_stack = 1024 * 512 * 5
                + 512
                + 512 * 256 * 3
                + 256
                + 256 * 128 * 10
                + 128
                + 128 * 256 * 10
                + 256
                + 256 * 512 * 5
                + 512
                + 512 * 1024 * 7
                + 1024;
            let latent_params = match config.latent_mode {
                1..=4 => 2 * (d * l + l) + (l * d + d),
                5 => (d * l + l) + (l * d + d),
                6 | 7 => conv_stack + 2 * (128 * 128 + 128),
                _ => 0,
            };
            let total = embed_params
                + config.num_encoder_layers * encoder_layer
                + config.num_decoder_layers * decoder_layer
                + 2 * norm_params
                + head_params
                + latent_params;
            println!(
                "  Estimated parameters: {} ({:.2}M)",
                total,
                total as f64 / 1_000_000.0
            );
        }
    }

    Ok(())
}
