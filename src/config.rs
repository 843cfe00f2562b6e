use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Joint source/target vocabulary size
    pub vocab_size: usize,
    /// Padding token id
    pub pad_id: u32,
    /// Beginning-of-sequence token id
    pub bos_id: u32,
    /// End-of-sequence token id
    pub eos_id: u32,
    /// Model (embedding) dimension
    pub model_dim: usize,
    /// Number of attention heads
    pub num_heads: usize,
    /// Number of encoder layers
    pub num_encoder_layers: usize,
    /// Number of decoder layers
    pub num_decoder_layers: usize,
    /// Intermediate size in FFN
    pub ff_dim: usize,
    /// Dropout probability
    pub dropout: f64,
    /// Layer norm epsilon
    pub layer_norm_eps: f64,
    /// Source sequences are padded/truncated to this length
    pub src_max_len: usize,
    /// Target sequences are padded/truncated to this length
    pub trg_max_len: usize,
    /// Width of the latent code in modes 1-5
    pub latent_dim: usize,
    /// Latent operating mode (1-7 active, 8+ disabled)
    pub latent_mode: u32,
    /// Prior variance scale for the moment-matching kernel
    pub z_var: f64,
}

impl Config {
    /// Tiny configuration for testing/debugging
    pub fn tiny() -> Self {
        Self {
            vocab_size: 1000,
            pad_id: 0,
            bos_id: 1,
            eos_id: 2,
            model_dim: 64,
            num_heads: 4,
            num_encoder_layers: 2,
            num_decoder_layers: 2,
            ff_dim: 256,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
            src_max_len: 32,
            trg_max_len: 32,
            latent_dim: 16,
            latent_mode: 1,
            z_var: 2.0,
        }
    }

    /// Base translation configuration (~60M parameters)
    pub fn base() -> Self {
        Self {
            vocab_size: 32000,
            pad_id: 0,
            bos_id: 1,
            eos_id: 2,
            model_dim: 512,
            num_heads: 8,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            ff_dim: 2048,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
            src_max_len: 300,
            trg_max_len: 300,
            latent_dim: 32,
            latent_mode: 1,
            z_var: 2.0,
        }
    }

    /// Wide configuration for the convolutional latent modes. The conv stack
    /// expects 1024 channels and a 100-step sequence that collapses to a
    /// single latent position.
    pub fn conv() -> Self {
        Self {
            vocab_size: 32000,
            pad_id: 0,
            bos_id: 1,
            eos_id: 2,
            model_dim: 1024,
            num_heads: 8,
            num_encoder_layers: 6,
            num_decoder_layers: 6,
            ff_dim: 4096,
            dropout: 0.1,
            layer_norm_eps: 1e-5,
            src_max_len: 100,
            trg_max_len: 100,
            latent_dim: 128,
            latent_mode: 6,
            z_var: 2.0,
        }
    }

    pub fn head_dim(&self) -> usize {
        self.model_dim / self.num_heads
    }

    pub fn from_json(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save_json(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Peak learning rate
    pub learning_rate: f64,
    /// Floor the cosine decay ends at
    pub min_learning_rate: f64,
    /// Weight decay for AdamW
    pub weight_decay: f64,
    /// Adam beta1
    pub beta1: f64,
    /// Adam beta2
    pub beta2: f64,
    /// Gradient clipping max norm (0 disables clipping)
    pub grad_clip: f64,
    /// Batch size
    pub batch_size: usize,
    /// Number of training epochs
    pub epochs: usize,
    /// Warmup steps for learning rate scheduler
    pub warmup_steps: usize,
    /// Label smoothing factor for the task loss (0 disables smoothing)
    pub label_smoothing: f64,
    /// Log every N steps
    pub log_every: usize,
    /// Fraction of pairs held out when no validation file is given
    pub valid_ratio: f64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            learning_rate: 3e-4,
            min_learning_rate: 3e-5,
            weight_decay: 0.1,
            beta1: 0.9,
            beta2: 0.95,
            grad_clip: 1.0,
            batch_size: 32,
            epochs: 10,
            warmup_steps: 1000,
            label_smoothing: 0.1,
            log_every: 10,
            valid_ratio: 0.1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_have_even_head_split() {
        for config in [Config::tiny(), Config::base(), Config::conv()] {
            assert_eq!(config.model_dim % config.num_heads, 0);
            assert!(config.head_dim() > 0);
        }
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let path = path.to_str().unwrap();

        let config = Config::tiny();
        config.save_json(path).unwrap();
        let loaded = Config::from_json(path).unwrap();

        assert_eq!(loaded.vocab_size, config.vocab_size);
        assert_eq!(loaded.model_dim, config.model_dim);
        assert_eq!(loaded.latent_mode, config.latent_mode);
        assert_eq!(loaded.trg_max_len, config.trg_max_len);
    }
}
