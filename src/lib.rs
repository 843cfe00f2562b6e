pub mod config;
pub mod data;
pub mod error;
pub mod generate;
pub mod io;
pub mod latent;
pub mod loss;
pub mod model;
pub mod training;

pub use config::{Config, TrainingConfig};
pub use error::{Error, Result};
pub use generate::SequenceGenerator;
pub use latent::{LatentBottleneck, reparameterize};
pub use loss::{KlReduction, cross_entropy_loss, gaussian_kl, label_smoothing_loss, mmd};
pub use model::Seq2SeqTransformer;
pub use training::{Trainer, evaluate, get_lr_with_warmup};
