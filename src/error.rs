//! Error types for varseq

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Unsupported latent mode {0}: 1-7 select a latent path, 8 or above disables it")]
    UnsupportedMode(u32),

    #[error("Latent mode {mode} requires a target representation")]
    MissingTarget { mode: u32 },

    #[error("Shape mismatch in {context}: expected {expected}, got {got}")]
    ShapeMismatch {
        context: &'static str,
        expected: String,
        got: String,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Non-finite loss: {0}")]
    NonFiniteLoss(f64),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
