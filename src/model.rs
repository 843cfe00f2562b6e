use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Dropout, Embedding, Linear, VarBuilder, embedding, linear, linear_no_bias};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::latent::LatentBottleneck;

fn masked_fill(on_false: &Tensor, mask: &Tensor, on_true: f32) -> candle_core::Result<Tensor> {
    let shape = on_false.shape();
    let mask = mask.broadcast_as(shape.dims())?;
    let on_true = Tensor::new(on_true, on_false.device())?.broadcast_as(shape.dims())?;
    let m = mask.where_cond(&on_true, on_false)?;
    Ok(m)
}

#[derive(Debug, Clone)]
pub struct LayerNorm {
    weight: Tensor,
    bias: Tensor,
    eps: f64,
}

impl LayerNorm {
    pub fn new(size: usize, eps: f64, vb: VarBuilder) -> Result<Self> {
        let weight = vb.get_with_hints(size, "weight", candle_nn::Init::Const(1.0))?;
        let bias = vb.get_with_hints(size, "bias", candle_nn::Init::Const(0.0))?;
        Ok(Self { weight, bias, eps })
    }
}

impl Module for LayerNorm {
    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let dtype = x.dtype();
        let x = x.to_dtype(DType::F32)?;
        let mean = x.mean_keepdim(candle_core::D::Minus1)?;
        let x = x.broadcast_sub(&mean)?;
        let variance = x.sqr()?.mean_keepdim(candle_core::D::Minus1)?;
        let x = x.broadcast_div(&(variance + self.eps)?.sqrt()?)?;
        let x = x.to_dtype(dtype)?;
        let x = x.broadcast_mul(&self.weight)?;
        x.broadcast_add(&self.bias)
    }
}

/// Sinusoidal position table of shape `(1, max_len, dim)`.
fn positional_encoding(max_len: usize, dim: usize, device: &Device) -> Result<Tensor> {
    let mut data = vec![0f32; max_len * dim];
    for pos in 0..max_len {
        for i in 0..dim / 2 {
            let angle = pos as f32 / 10000f32.powf(2.0 * i as f32 / dim as f32);
            data[pos * dim + 2 * i] = angle.sin();
            data[pos * dim + 2 * i + 1] = angle.cos();
        }
    }
    Ok(Tensor::from_vec(data, (1, max_len, dim), device)?)
}

/// Upper-triangular mask that blocks attention to future positions.
fn causal_mask(seq_len: usize, device: &Device) -> Result<Option<Tensor>> {
    if seq_len <= 1 {
        return Ok(None);
    }
    let mut mask_data = vec![0u8; seq_len * seq_len];
    for i in 0..seq_len {
        for j in (i + 1)..seq_len {
            mask_data[i * seq_len + j] = 1;
        }
    }
    let mask = Tensor::from_vec(mask_data, (seq_len, seq_len), device)?
        .unsqueeze(0)?
        .unsqueeze(0)?;
    Ok(Some(mask))
}

pub struct MultiHeadAttention {
    q_proj: Linear,
    k_proj: Linear,
    v_proj: Linear,
    o_proj: Linear,
    num_heads: usize,
    head_dim: usize,
    dropout: Dropout,
}

impl MultiHeadAttention {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let head_dim = config.head_dim();
        let q_proj = linear(config.model_dim, config.model_dim, vb.pp("q_proj"))?;
        let k_proj = linear(config.model_dim, config.model_dim, vb.pp("k_proj"))?;
        let v_proj = linear(config.model_dim, config.model_dim, vb.pp("v_proj"))?;
        let o_proj = linear(config.model_dim, config.model_dim, vb.pp("o_proj"))?;
        let dropout = Dropout::new(config.dropout as f32);
        Ok(Self {
            q_proj,
            k_proj,
            v_proj,
            o_proj,
            num_heads: config.num_heads,
            head_dim,
            dropout,
        })
    }

    /// Attend `query` over `key_value`. Self-attention passes the same tensor
    /// for both; cross-attention passes the encoder memory as `key_value`.
    pub fn forward(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, q_len, _) = query.dims3()?;
        let (_, kv_len, _) = key_value.dims3()?;

        let q = self.q_proj.forward(query)?;
        let k = self.k_proj.forward(key_value)?;
        let v = self.v_proj.forward(key_value)?;

        let q = q
            .reshape((batch_size, q_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let k = k
            .reshape((batch_size, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;
        let v = v
            .reshape((batch_size, kv_len, self.num_heads, self.head_dim))?
            .transpose(1, 2)?
            .contiguous()?;

        let scale = (self.head_dim as f64).sqrt();
        let k_t = k.transpose(2, 3)?.contiguous()?;
        let attn_weights = q.matmul(&k_t)?.affine(1.0 / scale, 0.0)?;

        let attn_weights = match mask {
            Some(m) => masked_fill(&attn_weights, m, f32::NEG_INFINITY)?,
            None => attn_weights,
        };

        let attn_weights = candle_nn::ops::softmax_last_dim(&attn_weights)?;
        let attn_weights = if train {
            self.dropout.forward(&attn_weights, train)?
        } else {
            attn_weights
        };

        let output = attn_weights.matmul(&v)?;
        let output = output.transpose(1, 2)?.contiguous()?;
        let output = output.reshape((batch_size, q_len, self.num_heads * self.head_dim))?;

        Ok(self.o_proj.forward(&output)?)
    }
}

pub struct FeedForward {
    fc1: Linear,
    fc2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        let fc1 = linear(config.model_dim, config.ff_dim, vb.pp("fc1"))?;
        let fc2 = linear(config.ff_dim, config.model_dim, vb.pp("fc2"))?;
        let dropout = Dropout::new(config.dropout as f32);
        Ok(Self { fc1, fc2, dropout })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let hidden = self.fc1.forward(x)?.gelu_erf()?;
        let hidden = self.dropout.forward(&hidden, train)?;
        Ok(self.fc2.forward(&hidden)?)
    }
}

pub struct EncoderBlock {
    self_attn: MultiHeadAttention,
    feed_forward: FeedForward,
    attn_norm: LayerNorm,
    ff_norm: LayerNorm,
}

impl EncoderBlock {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(config, vb.pp("self_attn"))?,
            feed_forward: FeedForward::new(config, vb.pp("feed_forward"))?,
            attn_norm: LayerNorm::new(config.model_dim, config.layer_norm_eps, vb.pp("attn_norm"))?,
            ff_norm: LayerNorm::new(config.model_dim, config.layer_norm_eps, vb.pp("ff_norm"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let residual = x;
        let x = self.attn_norm.forward(x)?;
        let x = self.self_attn.forward(&x, &x, None, train)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.ff_norm.forward(&x)?;
        let x = self.feed_forward.forward(&x, train)?;
        Ok((residual + x)?)
    }
}

pub struct DecoderBlock {
    self_attn: MultiHeadAttention,
    cross_attn: MultiHeadAttention,
    feed_forward: FeedForward,
    self_norm: LayerNorm,
    cross_norm: LayerNorm,
    ff_norm: LayerNorm,
}

impl DecoderBlock {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            self_attn: MultiHeadAttention::new(config, vb.pp("self_attn"))?,
            cross_attn: MultiHeadAttention::new(config, vb.pp("cross_attn"))?,
            feed_forward: FeedForward::new(config, vb.pp("feed_forward"))?,
            self_norm: LayerNorm::new(config.model_dim, config.layer_norm_eps, vb.pp("self_norm"))?,
            cross_norm: LayerNorm::new(
                config.model_dim,
                config.layer_norm_eps,
                vb.pp("cross_norm"),
            )?,
            ff_norm: LayerNorm::new(config.model_dim, config.layer_norm_eps, vb.pp("ff_norm"))?,
        })
    }

    pub fn forward(
        &self,
        x: &Tensor,
        memory: &Tensor,
        mask: Option<&Tensor>,
        train: bool,
    ) -> Result<Tensor> {
        let residual = x;
        let x = self.self_norm.forward(x)?;
        let x = self.self_attn.forward(&x, &x, mask, train)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.cross_norm.forward(&x)?;
        let x = self.cross_attn.forward(&x, memory, None, train)?;
        let x = (residual + x)?;

        let residual = &x;
        let x = self.ff_norm.forward(&x)?;
        let x = self.feed_forward.forward(&x, train)?;
        Ok((residual + x)?)
    }
}

/// Encoder/decoder transformer with a latent bottleneck between the encoder
/// memory and the decoder. Source and target share one embedding table, and
/// the target representation fed to the bottleneck comes from running the
/// full target sequence through the same encoder stack.
pub struct Seq2SeqTransformer {
    embedding: Embedding,
    pos_encoding: Tensor,
    encoder_layers: Vec<EncoderBlock>,
    encoder_norm: LayerNorm,
    decoder_layers: Vec<DecoderBlock>,
    decoder_norm: LayerNorm,
    lm_head: Linear,
    latent: LatentBottleneck,
    dropout: Dropout,
    config: Config,
}

impl Seq2SeqTransformer {
    pub fn new(config: &Config, vb: VarBuilder) -> Result<Self> {
        if config.num_heads == 0 || config.model_dim % config.num_heads != 0 {
            return Err(Error::InvalidConfig(format!(
                "model_dim {} must split evenly over {} heads",
                config.model_dim, config.num_heads
            )));
        }

        let embedding = embedding(config.vocab_size, config.model_dim, vb.pp("embedding"))?;
        let max_len = config.src_max_len.max(config.trg_max_len);
        let pos_encoding = positional_encoding(max_len, config.model_dim, vb.device())?;

        let mut encoder_layers = Vec::with_capacity(config.num_encoder_layers);
        for i in 0..config.num_encoder_layers {
            encoder_layers.push(EncoderBlock::new(config, vb.pp(format!("encoder.{}", i)))?);
        }
        let encoder_norm = LayerNorm::new(
            config.model_dim,
            config.layer_norm_eps,
            vb.pp("encoder_norm"),
        )?;

        let mut decoder_layers = Vec::with_capacity(config.num_decoder_layers);
        for i in 0..config.num_decoder_layers {
            decoder_layers.push(DecoderBlock::new(config, vb.pp(format!("decoder.{}", i)))?);
        }
        let decoder_norm = LayerNorm::new(
            config.model_dim,
            config.layer_norm_eps,
            vb.pp("decoder_norm"),
        )?;

        let lm_head = linear_no_bias(config.model_dim, config.vocab_size, vb.pp("lm_head"))?;
        let latent = LatentBottleneck::new(
            config.model_dim,
            config.latent_dim,
            config.latent_mode,
            config.z_var,
            vb.pp("latent"),
        )?;
        let dropout = Dropout::new(config.dropout as f32);

        Ok(Self {
            embedding,
            pos_encoding,
            encoder_layers,
            encoder_norm,
            decoder_layers,
            decoder_norm,
            lm_head,
            latent,
            dropout,
            config: config.clone(),
        })
    }

    fn embed(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq_len) = ids.dims2()?;
        let max_len = self.pos_encoding.dim(1)?;
        if seq_len > max_len {
            return Err(Error::ShapeMismatch {
                context: "positional encoding",
                expected: format!("at most {max_len} positions"),
                got: format!("{seq_len}"),
            });
        }

        let scale = (self.config.model_dim as f64).sqrt();
        let x = self.embedding.forward(ids)?.affine(scale, 0.0)?;
        let pe = self.pos_encoding.narrow(1, 0, seq_len)?;
        let x = x.broadcast_add(&pe)?;
        Ok(self.dropout.forward(&x, train)?)
    }

    /// Run the encoder stack over a `(batch, seq)` id tensor.
    pub fn encode(&self, ids: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = self.embed(ids, train)?;
        for layer in &self.encoder_layers {
            x = layer.forward(&x, train)?;
        }
        Ok(self.encoder_norm.forward(&x)?)
    }

    /// Run the decoder stack over shifted target ids against `memory`,
    /// returning logits of shape `(batch, seq, vocab)`.
    pub fn decode(&self, trg_ids: &Tensor, memory: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq_len) = trg_ids.dims2()?;
        let mask = causal_mask(seq_len, trg_ids.device())?;

        let mut x = self.embed(trg_ids, train)?;
        for layer in &self.decoder_layers {
            x = layer.forward(&x, memory, mask.as_ref(), train)?;
        }
        let x = self.decoder_norm.forward(&x)?;
        Ok(self.lm_head.forward(&x)?)
    }

    /// Full training pass. `trg_input_ids` is the shifted decoder input;
    /// `trg_full_ids` is the unshifted target sequence the bottleneck encodes
    /// when its mode needs a target representation. Returns decoder logits
    /// and the scalar latent loss.
    pub fn forward(
        &self,
        src_ids: &Tensor,
        trg_input_ids: &Tensor,
        trg_full_ids: Option<&Tensor>,
        train: bool,
    ) -> Result<(Tensor, Tensor)> {
        let memory = self.encode(src_ids, train)?;
        let src_context = memory.transpose(0, 1)?.contiguous()?;

        let trg_context = if self.latent.requires_target() {
            match trg_full_ids {
                Some(ids) => Some(self.encode(ids, train)?.transpose(0, 1)?.contiguous()?),
                None => None,
            }
        } else {
            None
        };

        let (fused, latent_loss) = self.latent.forward(&src_context, trg_context.as_ref())?;
        let memory = fused.transpose(0, 1)?.contiguous()?;

        let logits = self.decode(trg_input_ids, &memory, train)?;
        Ok((logits, latent_loss))
    }

    /// Encoder memory for generation. Modes that work from the source alone
    /// still pass through the bottleneck; paired modes decode from the plain
    /// encoder memory since no target exists yet.
    pub fn encode_for_decoding(&self, src_ids: &Tensor) -> Result<Tensor> {
        let memory = self.encode(src_ids, false)?;
        if self.latent.requires_target() {
            return Ok(memory);
        }
        let src_context = memory.transpose(0, 1)?.contiguous()?;
        let (fused, _) = self.latent.forward(&src_context, None)?;
        Ok(fused.transpose(0, 1)?.contiguous()?)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn latent_mode(&self) -> u32 {
        self.latent.mode()
    }

    pub fn num_parameters(&self) -> usize {
        let c = &self.config;
        let d = c.model_dim;
        let embed_params = c.vocab_size * d;
        let attn_params = 4 * (d * d + d);
        let ff_params = d * c.ff_dim + c.ff_dim + c.ff_dim * d + d;
        let norm_params = 2 * d;
        let encoder_layer = attn_params + ff_params + 2 * norm_params;
        let decoder_layer = 2 * attn_params + ff_params + 3 * norm_params;
        let head_params = d * c.vocab_size;
        embed_params
            + c.num_encoder_layers * encoder_layer
            + c.num_decoder_layers * decoder_layer
            + 2 * norm_params
            + head_params
            + self.latent.num_parameters()
    }
}
