//! Loss criteria: analytic Gaussian KL, kernel MMD, and task losses.
//!
//! The criteria are free functions so trainers and tests can call them
//! directly, independent of the latent module that normally drives them.

use candle_core::{D, Tensor};

use crate::error::Result;

/// Log-variances are clamped to this range before exponentiation so the
/// divergence stays finite for badly scaled inputs.
const LOGVAR_MIN: f64 = -30.0;
const LOGVAR_MAX: f64 = 20.0;

/// How `gaussian_kl` collapses the elementwise divergence to a scalar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlReduction {
    /// Sum over the last axis, then mean over all remaining axes.
    SumThenMean,
    /// Sum over every element, no averaging.
    Sum,
}

/// Analytic KL divergence between two diagonal Gaussians given as
/// `(mu, logvar)` pairs. Shapes must match; the trailing axis is the
/// distribution dimension.
///
/// Elementwise: `0.5 * (logvar_p - logvar_q + (exp(logvar_q) + (mu_q - mu_p)^2)
/// / exp(logvar_p) - 1)`. Zero when both distributions coincide.
pub fn gaussian_kl(
    mu_q: &Tensor,
    logvar_q: &Tensor,
    mu_p: &Tensor,
    logvar_p: &Tensor,
    reduction: KlReduction,
) -> Result<Tensor> {
    let logvar_q = logvar_q.clamp(LOGVAR_MIN, LOGVAR_MAX)?;
    let logvar_p = logvar_p.clamp(LOGVAR_MIN, LOGVAR_MAX)?;
    let var_q = logvar_q.exp()?;
    let var_p = logvar_p.exp()?;
    let mean_diff = (mu_q - mu_p)?;
    let fraction = (var_q + mean_diff.sqr()?)?.div(&var_p)?;
    let elementwise = ((((&logvar_p - &logvar_q)? + fraction)? - 1.0)? * 0.5)?;
    let reduced = match reduction {
        KlReduction::SumThenMean => elementwise.sum(D::Minus1)?.mean_all()?,
        KlReduction::Sum => elementwise.sum_all()?,
    };
    Ok(reduced)
}

/// Mean of the Gaussian kernel matrix between two samples.
/// `k(a, b) = exp(-|a - b|^2 / (2 * z_var * dim))`.
fn kernel_mean(a: &Tensor, b: &Tensor, z_var: f64) -> Result<Tensor> {
    let (_, dim) = a.dims2()?;
    let diffs = a.unsqueeze(1)?.broadcast_sub(&b.unsqueeze(0)?)?;
    let sq_dist = diffs.sqr()?.sum(D::Minus1)?;
    let scaled = sq_dist.affine(-1.0 / (2.0 * z_var * dim as f64), 0.0)?;
    Ok(scaled.exp()?.mean_all()?)
}

/// Kernel MMD between two samples `x: (n, d)` and `y: (m, d)`, each measured
/// against a fresh standard-normal reference draw of `num_samples` rows, then
/// summed. Near zero when both samples follow the standard normal; grows as
/// either drifts away. Differentiable in `x` and `y`; the reference draws
/// carry no gradient.
pub fn mmd(x: &Tensor, y: &Tensor, z_var: f64, num_samples: usize) -> Result<Tensor> {
    let (_, dim_x) = x.dims2()?;
    let (_, dim_y) = y.dims2()?;
    let reference_x =
        Tensor::randn(0f32, 1f32, (num_samples, dim_x), x.device())?.to_dtype(x.dtype())?;
    let reference_y =
        Tensor::randn(0f32, 1f32, (num_samples, dim_y), y.device())?.to_dtype(y.dtype())?;

    let mmd_x = ((kernel_mean(&reference_x, &reference_x, z_var)? + kernel_mean(x, x, z_var)?)?
        - (kernel_mean(&reference_x, x, z_var)? * 2.0)?)?;
    let mmd_y = ((kernel_mean(&reference_y, &reference_y, z_var)? + kernel_mean(y, y, z_var)?)?
        - (kernel_mean(&reference_y, y, z_var)? * 2.0)?)?;
    Ok((mmd_x + mmd_y)?)
}

/// Cross entropy over `(batch, seq, vocab)` logits and `(batch, seq)` targets,
/// averaged over the positions whose target is not `pad_id`. Pad positions
/// contribute neither to the sum nor to the denominator.
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor, pad_id: u32) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits.reshape((batch_size * seq_len, vocab_size))?;
    let targets = targets.reshape((batch_size * seq_len,))?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let mask = targets.ne(pad_id)?.to_dtype(log_probs.dtype())?;
    let count = mask.sum_all()?;
    Ok(((nll * mask)?.sum_all()? / count)?)
}

/// Label-smoothed cross entropy: per position `(1 - eps) * nll + eps * uniform`,
/// where the uniform term is the mean negative log-probability over the
/// vocabulary; averaged over non-pad positions like `cross_entropy_loss`.
/// With `smoothing = 0` this equals plain cross entropy.
pub fn label_smoothing_loss(
    logits: &Tensor,
    targets: &Tensor,
    pad_id: u32,
    smoothing: f64,
) -> Result<Tensor> {
    let (batch_size, seq_len, vocab_size) = logits.dims3()?;
    let logits = logits.reshape((batch_size * seq_len, vocab_size))?;
    let targets = targets.reshape((batch_size * seq_len,))?;

    let log_probs = candle_nn::ops::log_softmax(&logits, D::Minus1)?;
    let nll = log_probs
        .gather(&targets.unsqueeze(1)?, 1)?
        .squeeze(1)?
        .neg()?;
    let uniform = log_probs.mean(D::Minus1)?.neg()?;
    let smoothed = ((nll * (1.0 - smoothing))? + (uniform * smoothing)?)?;

    let mask = targets.ne(pad_id)?.to_dtype(log_probs.dtype())?;
    let count = mask.sum_all()?;
    Ok(((smoothed * mask)?.sum_all()? / count)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_self_kl_is_zero() {
        let device = Device::Cpu;
        let mu = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();
        let logvar = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();

        let kl = gaussian_kl(&mu, &logvar, &mu, &logvar, KlReduction::SumThenMean).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap().abs() < 1e-6);

        let kl = gaussian_kl(&mu, &logvar, &mu, &logvar, KlReduction::Sum).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap().abs() < 1e-6);
    }

    #[test]
    fn test_kl_is_non_negative() {
        let device = Device::Cpu;
        let mu_q = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();
        let logvar_q = Tensor::randn(0f32, 0.5f32, (4, 8), &device).unwrap();
        let mu_p = Tensor::randn(0f32, 1f32, (4, 8), &device).unwrap();
        let logvar_p = Tensor::randn(0f32, 0.5f32, (4, 8), &device).unwrap();

        let kl = gaussian_kl(&mu_q, &logvar_q, &mu_p, &logvar_p, KlReduction::SumThenMean).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap() >= -1e-5);
    }

    #[test]
    fn test_kl_against_standard_normal_closed_form() {
        let device = Device::Cpu;
        // KL(N(1, 1) || N(0, 1)) = 0.5 per dimension.
        let mu = Tensor::ones((2, 4), candle_core::DType::F32, &device).unwrap();
        let logvar = mu.zeros_like().unwrap();
        let zeros_mu = mu.zeros_like().unwrap();
        let zeros_logvar = mu.zeros_like().unwrap();

        let kl = gaussian_kl(&mu, &logvar, &zeros_mu, &zeros_logvar, KlReduction::Sum).unwrap();
        assert!((kl.to_scalar::<f32>().unwrap() - 4.0).abs() < 1e-5);

        let kl =
            gaussian_kl(&mu, &logvar, &zeros_mu, &zeros_logvar, KlReduction::SumThenMean).unwrap();
        assert!((kl.to_scalar::<f32>().unwrap() - 2.0).abs() < 1e-5);
    }

    #[test]
    fn test_sum_reduction_scales_with_batch() {
        let device = Device::Cpu;
        let mu_q = Tensor::randn(0f32, 1f32, (6, 8), &device).unwrap();
        let logvar_q = Tensor::randn(0f32, 0.5f32, (6, 8), &device).unwrap();
        let mu_p = mu_q.zeros_like().unwrap();
        let logvar_p = mu_q.zeros_like().unwrap();

        let summed = gaussian_kl(&mu_q, &logvar_q, &mu_p, &logvar_p, KlReduction::Sum)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let averaged = gaussian_kl(&mu_q, &logvar_q, &mu_p, &logvar_p, KlReduction::SumThenMean)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((summed - averaged * 6.0).abs() < summed.abs() * 1e-4 + 1e-4);
    }

    #[test]
    fn test_kl_extreme_logvar_stays_finite() {
        let device = Device::Cpu;
        let mu = Tensor::randn(0f32, 1f32, (2, 4), &device).unwrap();
        let huge = Tensor::full(1000f32, (2, 4), &device).unwrap();
        let tiny = Tensor::full(-1000f32, (2, 4), &device).unwrap();

        let kl = gaussian_kl(&mu, &huge, &mu, &tiny, KlReduction::SumThenMean).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap().is_finite());

        let kl = gaussian_kl(&mu, &tiny, &mu, &huge, KlReduction::Sum).unwrap();
        assert!(kl.to_scalar::<f32>().unwrap().is_finite());
    }

    #[test]
    fn test_mmd_matching_samples_near_zero() {
        let device = Device::Cpu;
        // Standard-normal samples match the reference distribution, so both
        // one-sample estimates should hover around zero.
        let x = Tensor::randn(0f32, 1f32, (512, 16), &device).unwrap();
        let loss = mmd(&x, &x, 2.0, 512).unwrap().to_scalar::<f32>().unwrap();
        assert!(loss.abs() < 0.05, "mmd of matching samples was {}", loss);
    }

    #[test]
    fn test_mmd_separated_samples_positive() {
        let device = Device::Cpu;
        let x = Tensor::randn(0f32, 1f32, (256, 16), &device).unwrap();
        let y = x.affine(1.0, 5.0).unwrap();

        let near = mmd(&x, &x, 2.0, 256).unwrap().to_scalar::<f32>().unwrap();
        let far = mmd(&x, &y, 2.0, 256).unwrap().to_scalar::<f32>().unwrap();
        assert!(far > 0.5, "shifted sample should be far from the prior: {}", far);
        assert!(far > near);
    }

    #[test]
    fn test_label_smoothing_zero_matches_cross_entropy() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1f32, (2, 5, 11), &device).unwrap();
        let targets = Tensor::ones((2, 5), candle_core::DType::U32, &device).unwrap();

        let ce = cross_entropy_loss(&logits, &targets, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let ls = label_smoothing_loss(&logits, &targets, 0, 0.0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((ce - ls).abs() < 1e-5);
    }

    #[test]
    fn test_label_smoothing_is_finite_and_positive() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1f32, (3, 4, 7), &device).unwrap();
        let targets = Tensor::ones((3, 4), candle_core::DType::U32, &device).unwrap();

        let loss = label_smoothing_loss(&logits, &targets, 0, 0.1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!(loss.is_finite());
        assert!(loss > 0.0);
    }

    #[test]
    fn test_cross_entropy_ignores_pad_positions() {
        let device = Device::Cpu;
        // One real token the model gets maximally wrong, three pads it gets
        // right. A mean over all four positions would dilute the loss 4x.
        let logits = Tensor::new(
            &[[
                [10f32, 0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0, 0.0],
                [10.0, 0.0, 0.0, 0.0],
            ]],
            &device,
        )
        .unwrap();
        let targets = Tensor::new(&[[2u32, 0, 0, 0]], &device).unwrap();

        let loss = cross_entropy_loss(&logits, &targets, 0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 10.0).abs() < 0.05, "pad rows leaked into the mean: {}", loss);
    }

    #[test]
    fn test_label_smoothing_ignores_pad_positions() {
        let device = Device::Cpu;
        let logits = Tensor::randn(0f32, 1f32, (2, 6, 9), &device).unwrap();
        // Real tokens only in the first two positions of each row.
        let targets = Tensor::new(&[[3u32, 4, 0, 0, 0, 0], [5u32, 6, 0, 0, 0, 0]], &device).unwrap();
        let real_logits = logits.narrow(1, 0, 2).unwrap();
        let real_targets = targets.narrow(1, 0, 2).unwrap();

        let full = label_smoothing_loss(&logits, &targets, 0, 0.1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        let real_only = label_smoothing_loss(&real_logits, &real_targets, 0, 0.1)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((full - real_only).abs() < 1e-5);
    }
}
