//! Autoregressive decoding from a trained model.

use anyhow::Result;
use candle_core::{D, DType, Device, Tensor};

use crate::model::Seq2SeqTransformer;

pub struct SequenceGenerator<'a> {
    model: &'a Seq2SeqTransformer,
    device: &'a Device,
}

impl<'a> SequenceGenerator<'a> {
    pub fn new(model: &'a Seq2SeqTransformer, device: &'a Device) -> Self {
        Self { model, device }
    }

    /// Decode a target sequence for `source_ids`, starting from the begin
    /// marker and stopping at the end marker, `max_new_tokens`, or the
    /// configured target length, whichever comes first. A temperature of 0
    /// decodes greedily; otherwise tokens are sampled after temperature and
    /// optional top-k filtering.
    pub fn generate(
        &self,
        source_ids: &[u32],
        max_new_tokens: usize,
        temperature: f64,
        top_k: Option<usize>,
    ) -> Result<Vec<u32>> {
        use rand::Rng;

        let config = self.model.config();
        let src = Tensor::new(source_ids, self.device)?
            .unsqueeze(0)?
            .to_dtype(DType::U32)?;
        let memory = self.model.encode_for_decoding(&src)?;

        let mut tokens = vec![config.bos_id];
        let mut rng = rand::rng();

        for _ in 0..max_new_tokens {
            if tokens.len() >= config.trg_max_len {
                break;
            }

            let input = Tensor::new(tokens.as_slice(), self.device)?
                .unsqueeze(0)?
                .to_dtype(DType::U32)?;
            let logits = self.model.decode(&input, &memory, false)?;
            let logits = logits
                .narrow(1, tokens.len() - 1, 1)?
                .squeeze(1)?
                .squeeze(0)?;

            let next_token = if temperature <= 0.0 {
                logits.argmax(D::Minus1)?.to_scalar::<u32>()?
            } else {
                let logits = logits.affine(1.0 / temperature, 0.0)?;

                let logits = if let Some(k) = top_k {
                    let logits_vec: Vec<f32> = logits.to_vec1()?;
                    let mut indexed: Vec<(usize, f32)> =
                        logits_vec.iter().copied().enumerate().collect();
                    indexed.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
                    let mut masked = vec![f32::NEG_INFINITY; logits_vec.len()];
                    for i in 0..k.min(indexed.len()) {
                        masked[indexed[i].0] = indexed[i].1;
                    }
                    Tensor::new(masked, self.device)?
                } else {
                    logits
                };

                let probs = candle_nn::ops::softmax_last_dim(&logits)?;
                let probs_vec: Vec<f32> = probs.to_vec1()?;

                let cumsum: Vec<f32> = probs_vec
                    .iter()
                    .scan(0.0, |acc, &x| {
                        *acc += x;
                        Some(*acc)
                    })
                    .collect();

                let r: f32 = rng.random();
                cumsum.iter().position(|&p| p > r).unwrap_or(0) as u32
            };

            tokens.push(next_token);
            if next_token == config.eos_id {
                break;
            }
        }

        Ok(tokens)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use candle_nn::{VarBuilder, VarMap};

    fn build(config: &Config) -> Seq2SeqTransformer {
        let var_map = VarMap::new();
        let vb = VarBuilder::from_varmap(&var_map, DType::F32, &Device::Cpu);
        Seq2SeqTransformer::new(config, vb).unwrap()
    }

    fn small_config(latent_mode: u32) -> Config {
        let mut config = Config::tiny();
        config.model_dim = 32;
        config.num_heads = 4;
        config.num_encoder_layers = 1;
        config.num_decoder_layers = 1;
        config.ff_dim = 64;
        config.src_max_len = 8;
        config.trg_max_len = 8;
        config.latent_dim = 8;
        config.latent_mode = latent_mode;
        config
    }

    #[test]
    fn test_greedy_decode_is_deterministic() {
        let config = small_config(8);
        let model = build(&config);
        let device = Device::Cpu;
        let generator = SequenceGenerator::new(&model, &device);

        let source = [5u32, 6, 7, 8];
        let first = generator.generate(&source, 6, 0.0, None).unwrap();
        let second = generator.generate(&source, 6, 0.0, None).unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0], config.bos_id);
        assert!(first.len() <= config.trg_max_len);
    }

    #[test]
    fn test_sampled_decode_stays_in_bounds() {
        let config = small_config(3);
        let model = build(&config);
        let device = Device::Cpu;
        let generator = SequenceGenerator::new(&model, &device);

        let tokens = generator.generate(&[5u32, 6, 7], 6, 1.0, Some(5)).unwrap();
        assert_eq!(tokens[0], config.bos_id);
        assert!(tokens.len() <= config.trg_max_len);
        assert!(tokens.iter().all(|&id| id < config.vocab_size as u32));
    }
}
