//! Latent bottleneck between encoder and decoder representations.
//!
//! The bottleneck is built once for a fixed operating mode and maps a
//! token-major representation `(seq, batch, model_dim)` through a latent
//! code, returning the fused representation together with a scalar
//! regularization loss. Modes 1-4 are Gaussian (KL-regularized) paths,
//! mode 5 matches moments against a standard-normal prior, modes 6-7 run
//! a convolutional encoder/decoder over the sequence axis, and any mode
//! of 8 or above disables the bottleneck entirely.

use candle_core::{Module, Tensor};
use candle_nn::{
    Conv1d, Conv1dConfig, ConvTranspose1d, ConvTranspose1dConfig, Linear, VarBuilder, conv1d,
    conv_transpose1d, linear,
};

use crate::error::{Error, Result};
use crate::loss::{KlReduction, gaussian_kl, mmd};

/// Reference draws per kernel estimate in the moment-matching modes.
const MMD_PRIOR_SAMPLES: usize = 100;
/// The convolutional stack is fixed to 1024 input channels.
const CONV_CHANNELS: usize = 1024;
/// Channel width of the convolutional latent code.
const CONV_LATENT_CHANNELS: usize = 128;

/// Draw `z = mu + eps * exp(0.5 * logvar)` with fresh standard-normal noise.
/// The noise is sampled per call and carries no gradient.
pub fn reparameterize(mu: &Tensor, logvar: &Tensor) -> Result<Tensor> {
    let std = (logvar * 0.5)?.exp()?;
    let eps = std.randn_like(0.0, 1.0)?;
    Ok((mu + (eps * std)?)?)
}

struct GaussianNets {
    context_to_mu: Linear,
    context_to_logvar: Linear,
    z_to_context: Linear,
}

impl GaussianNets {
    fn new(model_dim: usize, latent_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            context_to_mu: linear(model_dim, latent_dim, vb.pp("context_to_mu"))?,
            context_to_logvar: linear(model_dim, latent_dim, vb.pp("context_to_logvar"))?,
            z_to_context: linear(latent_dim, model_dim, vb.pp("z_to_context"))?,
        })
    }

    fn params(&self, x: &Tensor) -> Result<(Tensor, Tensor)> {
        let mu = self.context_to_mu.forward(x)?;
        let logvar = self.context_to_logvar.forward(x)?;
        Ok((mu, logvar))
    }
}

struct WaeNets {
    context_to_latent: Linear,
    latent_to_context: Linear,
}

impl WaeNets {
    fn new(model_dim: usize, latent_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            context_to_latent: linear(model_dim, latent_dim, vb.pp("context_to_latent"))?,
            latent_to_context: linear(latent_dim, model_dim, vb.pp("latent_to_context"))?,
        })
    }
}

struct ConvNets {
    encoder: Vec<Conv1d>,
    latent_to_mu: Linear,
    latent_to_logvar: Linear,
    decoder: Vec<ConvTranspose1d>,
}

impl ConvNets {
    fn new(vb: VarBuilder) -> Result<Self> {
        let encoder = vec![
            conv1d(
                CONV_CHANNELS,
                512,
                5,
                Conv1dConfig {
                    stride: 3,
                    ..Default::default()
                },
                vb.pp("encoder.0"),
            )?,
            conv1d(
                512,
                256,
                3,
                Conv1dConfig {
                    stride: 3,
                    ..Default::default()
                },
                vb.pp("encoder.1"),
            )?,
            conv1d(
                256,
                CONV_LATENT_CHANNELS,
                10,
                Conv1dConfig::default(),
                vb.pp("encoder.2"),
            )?,
        ];
        let latent_to_mu = linear(
            CONV_LATENT_CHANNELS,
            CONV_LATENT_CHANNELS,
            vb.pp("latent_to_mu"),
        )?;
        let latent_to_logvar = linear(
            CONV_LATENT_CHANNELS,
            CONV_LATENT_CHANNELS,
            vb.pp("latent_to_logvar"),
        )?;
        let decoder = vec![
            conv_transpose1d(
                CONV_LATENT_CHANNELS,
                256,
                10,
                ConvTranspose1dConfig::default(),
                vb.pp("decoder.0"),
            )?,
            conv_transpose1d(
                256,
                512,
                5,
                ConvTranspose1dConfig {
                    stride: 3,
                    ..Default::default()
                },
                vb.pp("decoder.1"),
            )?,
            // Kernel 7 on the last stage so a 100-step input restores exactly.
            conv_transpose1d(
                512,
                CONV_CHANNELS,
                7,
                ConvTranspose1dConfig {
                    stride: 3,
                    ..Default::default()
                },
                vb.pp("decoder.2"),
            )?,
        ];
        Ok(Self {
            encoder,
            latent_to_mu,
            latent_to_logvar,
            decoder,
        })
    }

    /// Conv stack over `(batch, channels, seq)`, GELU after every layer.
    fn encode(&self, x: &Tensor) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in &self.encoder {
            x = conv.forward(&x)?.gelu_erf()?;
        }
        Ok(x)
    }

    fn decode(&self, latent: &Tensor) -> Result<Tensor> {
        let mut x = latent.clone();
        for deconv in &self.decoder {
            x = deconv.forward(&x)?.gelu_erf()?;
        }
        Ok(x)
    }

    fn conv_parameters(&self) -> usize {
        let encoder: usize = self
            .encoder
            .iter()
            .map(|c| c.weight().elem_count() + c.bias().map_or(0, Tensor::elem_count))
            .sum();
        let decoder: usize = self
            .decoder
            .iter()
            .map(|c| c.weight().elem_count() + c.bias().map_or(0, Tensor::elem_count))
            .sum();
        encoder + decoder
    }
}

fn linear_params(layer: &Linear) -> usize {
    layer.weight().elem_count() + layer.bias().map_or(0, Tensor::elem_count)
}

/// One variant per operating mode, each holding only the sub-networks that
/// mode uses. The mode is fixed when the bottleneck is built.
enum LatentPath {
    /// Mode 1: KL between sequence-pooled src/trg posteriors, residual fusion.
    PooledGaussian(GaussianNets),
    /// Mode 2: KL over per-item flattened posteriors, residual fusion.
    FlatGaussian(GaussianNets),
    /// Mode 3: KL against the standard normal, source only, substitution.
    StandardPrior(GaussianNets),
    /// Mode 4: KL over raw (unpooled) posteriors, substitution.
    PairedGaussian(GaussianNets),
    /// Mode 5: MMD between sequence-pooled deterministic codes.
    MomentMatching(WaeNets),
    /// Mode 6: convolutional code with a KL head.
    ConvGaussian(ConvNets),
    /// Mode 7: convolutional code matched by MMD.
    ConvMomentMatching(ConvNets),
    /// Mode 8 and above: identity representation, zero loss.
    Disabled,
}

pub struct LatentBottleneck {
    path: LatentPath,
    mode: u32,
    model_dim: usize,
    z_var: f64,
}

impl LatentBottleneck {
    pub fn new(
        model_dim: usize,
        latent_dim: usize,
        mode: u32,
        z_var: f64,
        vb: VarBuilder,
    ) -> Result<Self> {
        if mode == 0 {
            return Err(Error::UnsupportedMode(mode));
        }
        if mode <= 5 && (model_dim == 0 || latent_dim == 0) {
            return Err(Error::InvalidConfig(format!(
                "latent projections need non-zero dims, got model_dim={model_dim} latent_dim={latent_dim}"
            )));
        }
        let path = match mode {
            1 => LatentPath::PooledGaussian(GaussianNets::new(model_dim, latent_dim, vb)?),
            2 => LatentPath::FlatGaussian(GaussianNets::new(model_dim, latent_dim, vb)?),
            3 => LatentPath::StandardPrior(GaussianNets::new(model_dim, latent_dim, vb)?),
            4 => LatentPath::PairedGaussian(GaussianNets::new(model_dim, latent_dim, vb)?),
            5 => LatentPath::MomentMatching(WaeNets::new(model_dim, latent_dim, vb)?),
            6 => LatentPath::ConvGaussian(ConvNets::new(vb)?),
            7 => LatentPath::ConvMomentMatching(ConvNets::new(vb)?),
            _ => LatentPath::Disabled,
        };
        Ok(Self {
            path,
            mode,
            model_dim,
            z_var,
        })
    }

    pub fn mode(&self) -> u32 {
        self.mode
    }

    /// Whether forward needs the target representation.
    pub fn requires_target(&self) -> bool {
        !matches!(
            self.path,
            LatentPath::StandardPrior(_) | LatentPath::Disabled
        )
    }

    /// Map a token-major `(seq, batch, model_dim)` source representation (and,
    /// for most modes, its target counterpart) to the fused representation and
    /// the scalar regularization loss.
    pub fn forward(&self, src: &Tensor, trg: Option<&Tensor>) -> Result<(Tensor, Tensor)> {
        match &self.path {
            LatentPath::Disabled => {
                let loss = Tensor::zeros((), src.dtype(), src.device())?;
                Ok((src.clone(), loss))
            }
            LatentPath::PooledGaussian(nets) => {
                let trg = self.require_target(trg)?;
                self.check_width(src, "source representation")?;
                self.check_width(trg, "target representation")?;
                let (src_mu, src_logvar) = nets.params(src)?;
                let (trg_mu, trg_logvar) = nets.params(trg)?;
                let loss = gaussian_kl(
                    &src_mu.mean(0)?,
                    &src_logvar.mean(0)?,
                    &trg_mu.mean(0)?,
                    &trg_logvar.mean(0)?,
                    KlReduction::SumThenMean,
                )?;
                let z = reparameterize(&src_mu, &src_logvar)?;
                let fused = (src + nets.z_to_context.forward(&z)?)?;
                Ok((fused, loss))
            }
            LatentPath::FlatGaussian(nets) => {
                let trg = self.require_target(trg)?;
                self.check_width(src, "source representation")?;
                self.check_width(trg, "target representation")?;
                let (src_mu, src_logvar) = nets.params(src)?;
                let (trg_mu, trg_logvar) = nets.params(trg)?;
                let loss = gaussian_kl(
                    &flatten_per_item(&src_mu)?,
                    &flatten_per_item(&src_logvar)?,
                    &flatten_per_item(&trg_mu)?,
                    &flatten_per_item(&trg_logvar)?,
                    KlReduction::SumThenMean,
                )?;
                let z = reparameterize(&src_mu, &src_logvar)?;
                let fused = (src + nets.z_to_context.forward(&z)?)?;
                Ok((fused, loss))
            }
            LatentPath::StandardPrior(nets) => {
                self.check_width(src, "source representation")?;
                let (mu, logvar) = nets.params(src)?;
                let loss = gaussian_kl(
                    &mu,
                    &logvar,
                    &mu.zeros_like()?,
                    &logvar.zeros_like()?,
                    KlReduction::Sum,
                )?;
                let z = reparameterize(&mu, &logvar)?;
                let fused = nets.z_to_context.forward(&z)?;
                Ok((fused, loss))
            }
            LatentPath::PairedGaussian(nets) => {
                let trg = self.require_target(trg)?;
                self.check_width(src, "source representation")?;
                self.check_width(trg, "target representation")?;
                let (src_mu, src_logvar) = nets.params(src)?;
                let (trg_mu, trg_logvar) = nets.params(trg)?;
                let loss = gaussian_kl(
                    &src_mu,
                    &src_logvar,
                    &trg_mu,
                    &trg_logvar,
                    KlReduction::SumThenMean,
                )?;
                let z = reparameterize(&src_mu, &src_logvar)?;
                let fused = nets.z_to_context.forward(&z)?;
                Ok((fused, loss))
            }
            LatentPath::MomentMatching(nets) => {
                let trg = self.require_target(trg)?;
                self.check_width(src, "source representation")?;
                self.check_width(trg, "target representation")?;
                let src_latent = nets.context_to_latent.forward(src)?;
                let trg_latent = nets.context_to_latent.forward(trg)?;
                let loss = mmd(
                    &src_latent.mean(0)?,
                    &trg_latent.mean(0)?,
                    self.z_var,
                    MMD_PRIOR_SAMPLES,
                )?;
                let fused = (src + nets.latent_to_context.forward(&src_latent)?)?;
                Ok((fused, loss))
            }
            LatentPath::ConvGaussian(nets) => {
                let trg = self.require_target(trg)?;
                self.check_width(src, "source representation")?;
                self.check_width(trg, "target representation")?;
                let src_latent = nets.encode(&to_channel_major(src)?)?;
                let trg_latent = nets.encode(&to_channel_major(trg)?)?;
                let src_code = conv_code(&src_latent)?;
                let trg_code = conv_code(&trg_latent)?;
                let loss = gaussian_kl(
                    &nets.latent_to_mu.forward(&src_code)?,
                    &nets.latent_to_logvar.forward(&src_code)?,
                    &nets.latent_to_mu.forward(&trg_code)?,
                    &nets.latent_to_logvar.forward(&trg_code)?,
                    KlReduction::SumThenMean,
                )?;
                let fused = self.fuse_decoded(nets, &src_latent, src)?;
                Ok((fused, loss))
            }
            LatentPath::ConvMomentMatching(nets) => {
                let trg = self.require_target(trg)?;
                self.check_width(src, "source representation")?;
                self.check_width(trg, "target representation")?;
                let src_latent = nets.encode(&to_channel_major(src)?)?;
                let trg_latent = nets.encode(&to_channel_major(trg)?)?;
                let src_code = conv_code(&src_latent)?;
                let trg_code = conv_code(&trg_latent)?;
                let loss = mmd(&src_code, &trg_code, self.z_var, MMD_PRIOR_SAMPLES)?;
                let fused = self.fuse_decoded(nets, &src_latent, src)?;
                Ok((fused, loss))
            }
        }
    }

    fn fuse_decoded(&self, nets: &ConvNets, latent: &Tensor, src: &Tensor) -> Result<Tensor> {
        let decoded = nets.decode(latent)?;
        let restored = decoded.permute((2, 0, 1))?.contiguous()?;
        if restored.dims() != src.dims() {
            return Err(Error::ShapeMismatch {
                context: "decoded convolutional context",
                expected: format!("{:?}", src.dims()),
                got: format!("{:?}", restored.dims()),
            });
        }
        Ok((src + restored)?)
    }

    fn require_target<'a>(&self, trg: Option<&'a Tensor>) -> Result<&'a Tensor> {
        trg.ok_or(Error::MissingTarget { mode: self.mode })
    }

    pub fn num_parameters(&self) -> usize {
        match &self.path {
            LatentPath::Disabled => 0,
            LatentPath::PooledGaussian(nets)
            | LatentPath::FlatGaussian(nets)
            | LatentPath::StandardPrior(nets)
            | LatentPath::PairedGaussian(nets) => {
                linear_params(&nets.context_to_mu)
                    + linear_params(&nets.context_to_logvar)
                    + linear_params(&nets.z_to_context)
            }
            LatentPath::MomentMatching(nets) => {
                linear_params(&nets.context_to_latent) + linear_params(&nets.latent_to_context)
            }
            LatentPath::ConvGaussian(nets) | LatentPath::ConvMomentMatching(nets) => {
                nets.conv_parameters()
                    + linear_params(&nets.latent_to_mu)
                    + linear_params(&nets.latent_to_logvar)
            }
        }
    }

    fn check_width(&self, x: &Tensor, context: &'static str) -> Result<()> {
        let (_, _, width) = x.dims3()?;
        let expected = match self.path {
            LatentPath::ConvGaussian(_) | LatentPath::ConvMomentMatching(_) => CONV_CHANNELS,
            _ => self.model_dim,
        };
        if width != expected {
            return Err(Error::ShapeMismatch {
                context,
                expected: format!("(seq, batch, {expected})"),
                got: format!("{:?}", x.dims()),
            });
        }
        Ok(())
    }
}

/// `(seq, batch, dim)` -> `(batch, dim, seq)` for the convolutional stack.
fn to_channel_major(x: &Tensor) -> Result<Tensor> {
    Ok(x.permute((1, 2, 0))?.contiguous()?)
}

/// `(seq, batch, latent)` -> `(batch, seq * latent)`.
fn flatten_per_item(x: &Tensor) -> Result<Tensor> {
    let (seq, batch, latent) = x.dims3()?;
    Ok(x.transpose(0, 1)?.contiguous()?.reshape((batch, seq * latent))?)
}

/// Collapse a `(batch, channels, 1)` conv code to `(batch, channels)`.
fn conv_code(latent: &Tensor) -> Result<Tensor> {
    let (batch, channels, len) = latent.dims3()?;
    if len != 1 {
        return Err(Error::ShapeMismatch {
            context: "convolutional latent code",
            expected: format!("({batch}, {channels}, 1)"),
            got: format!("{:?}", latent.dims()),
        });
    }
    Ok(latent.reshape((batch, channels))?)
}
