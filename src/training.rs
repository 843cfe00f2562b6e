use anyhow::Result;
use candle_core::backprop::GradStore;
use candle_core::{DType, Device};
use candle_nn::VarMap;
use candle_nn::optim::{AdamW, Optimizer, ParamsAdamW};
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::info;

use crate::config::{Config, TrainingConfig};
use crate::data::DataLoader;
use crate::error::Error;
use crate::loss::{cross_entropy_loss, label_smoothing_loss};
use crate::model::Seq2SeqTransformer;

pub struct Trainer {
    model: Seq2SeqTransformer,
    optimizer: AdamW,
    var_map: VarMap,
    training_config: TrainingConfig,
    device: Device,
    global_step: usize,
    total_steps: usize,
}

impl Trainer {
    pub fn new(config: Config, training_config: TrainingConfig, device: Device) -> Result<Self> {
        let var_map = VarMap::new();
        let vb = candle_nn::VarBuilder::from_varmap(&var_map, DType::F32, &device);
        let model = Seq2SeqTransformer::new(&config, vb)?;

        let params = ParamsAdamW {
            lr: training_config.learning_rate,
            beta1: training_config.beta1,
            beta2: training_config.beta2,
            weight_decay: training_config.weight_decay,
            eps: 1e-8,
        };
        let optimizer = AdamW::new(var_map.all_vars(), params)?;

        info!(
            "Initialized model with {} parameters (latent mode {})",
            model.num_parameters(),
            model.latent_mode()
        );

        Ok(Self {
            model,
            optimizer,
            var_map,
            training_config,
            device,
            global_step: 0,
            total_steps: 0,
        })
    }

    /// One pass over the loader. Returns the mean task and latent losses.
    pub fn train_epoch(&mut self, train_loader: &mut DataLoader) -> Result<(f64, f64)> {
        let num_batches = train_loader.num_batches();
        if self.total_steps == 0 {
            self.total_steps = num_batches * self.training_config.epochs;
        }

        let pb = ProgressBar::new(num_batches as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss: {msg}")
                .unwrap()
                .progress_chars("##-"),
        );

        let mut task_sum = 0.0;
        let mut latent_sum = 0.0;
        let mut num_steps = 0;

        train_loader.reset();

        while let Some((src, trg)) = train_loader.next_batch(&self.device)? {
            let trg_len = trg.dim(1)?;
            let trg_in = trg.narrow(1, 0, trg_len - 1)?;
            let trg_out = trg.narrow(1, 1, trg_len - 1)?;

            let (logits, latent_loss) = self.model.forward(&src, &trg_in, Some(&trg), true)?;
            let pad_id = self.model.config().pad_id;
            let task_loss = if self.training_config.label_smoothing > 0.0 {
                label_smoothing_loss(
                    &logits,
                    &trg_out,
                    pad_id,
                    self.training_config.label_smoothing,
                )?
            } else {
                cross_entropy_loss(&logits, &trg_out, pad_id)?
            };
            let total = (&task_loss + &latent_loss)?;

            let task_value = task_loss.to_scalar::<f32>()? as f64;
            let latent_value = latent_loss.to_scalar::<f32>()? as f64;
            if !task_value.is_finite() || !latent_value.is_finite() {
                return Err(Error::NonFiniteLoss(task_value + latent_value).into());
            }

            let lr = get_lr_with_warmup(
                self.global_step,
                self.training_config.warmup_steps,
                self.training_config.learning_rate,
                self.training_config.min_learning_rate,
                self.total_steps,
            );
            self.optimizer.set_learning_rate(lr);

            let mut grads = total.backward()?;
            if self.training_config.grad_clip > 0.0 {
                self.clip_gradients(&mut grads)?;
            }
            self.optimizer.step(&grads)?;

            task_sum += task_value;
            latent_sum += latent_value;
            num_steps += 1;
            self.global_step += 1;

            if self
                .global_step
                .is_multiple_of(self.training_config.log_every)
            {
                pb.set_message(format!("task {:.4} latent {:.4}", task_value, latent_value));
            }
            pb.inc(1);
        }

        pb.finish_with_message("done");

        if num_steps > 0 {
            Ok((
                task_sum / num_steps as f64,
                latent_sum / num_steps as f64,
            ))
        } else {
            Ok((0.0, 0.0))
        }
    }

    /// Scale all gradients so the global norm stays within `grad_clip`.
    fn clip_gradients(&self, grads: &mut GradStore) -> Result<()> {
        let max_norm = self.training_config.grad_clip;

        let mut total_sq = 0f64;
        for var in self.var_map.all_vars() {
            if let Some(grad) = grads.get(var.as_tensor()) {
                total_sq += grad.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
            }
        }

        let total_norm = total_sq.sqrt();
        if total_norm > max_norm {
            let scale = max_norm / total_norm;
            for var in self.var_map.all_vars() {
                if let Some(grad) = grads.remove(var.as_tensor()) {
                    grads.insert(var.as_tensor(), grad.affine(scale, 0.0)?);
                }
            }
        }
        Ok(())
    }

    pub fn evaluate(&self, eval_loader: &mut DataLoader) -> Result<(f64, f64)> {
        evaluate(&self.model, eval_loader, &self.device)
    }

    pub fn train(
        &mut self,
        train_loader: &mut DataLoader,
        mut eval_loader: Option<&mut DataLoader>,
        checkpoint_dir: Option<&str>,
    ) -> Result<()> {
        self.total_steps = train_loader.num_batches() * self.training_config.epochs;

        info!(
            "Starting training for {} epochs ({} steps)",
            self.training_config.epochs, self.total_steps
        );

        let mut best_eval = f64::INFINITY;
        for epoch in 0..self.training_config.epochs {
            info!("Epoch {}/{}", epoch + 1, self.training_config.epochs);

            let (task_loss, latent_loss) = self.train_epoch(train_loader)?;
            info!(
                "Epoch {} train loss: task {:.4} latent {:.4}",
                epoch + 1,
                task_loss,
                latent_loss
            );

            if let Some(ref mut eval) = eval_loader {
                let (eval_task, eval_latent) = self.evaluate(eval)?;
                info!(
                    "Epoch {} eval loss: task {:.4} latent {:.4}",
                    epoch + 1,
                    eval_task,
                    eval_latent
                );

                let eval_total = eval_task + eval_latent;
                if let Some(dir) = checkpoint_dir
                    && eval_total < best_eval
                {
                    best_eval = eval_total;
                    let path = format!("{}/best.safetensors", dir);
                    self.save_checkpoint(&path)?;
                    info!("Saved best checkpoint to {}", path);
                }
            }

            if let Some(dir) = checkpoint_dir {
                let path = format!("{}/checkpoint_epoch_{}.safetensors", dir, epoch + 1);
                self.save_checkpoint(&path)?;
                info!("Saved checkpoint to {}", path);
            }
        }

        Ok(())
    }

    pub fn save_checkpoint<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.var_map.save(path)?;
        Ok(())
    }

    pub fn load_checkpoint<P: AsRef<Path>>(&mut self, path: P) -> Result<()> {
        self.var_map.load(path)?;
        Ok(())
    }

    pub fn model(&self) -> &Seq2SeqTransformer {
        &self.model
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn global_step(&self) -> usize {
        self.global_step
    }
}

/// Held-out loss without gradient updates. Returns mean task and latent losses.
/// The task loss is plain cross entropy over non-pad positions regardless of
/// the training objective.
pub fn evaluate(
    model: &Seq2SeqTransformer,
    eval_loader: &mut DataLoader,
    device: &Device,
) -> Result<(f64, f64)> {
    let pad_id = model.config().pad_id;
    let mut task_sum = 0.0;
    let mut latent_sum = 0.0;
    let mut num_batches = 0;

    eval_loader.reset();

    while let Some((src, trg)) = eval_loader.next_batch(device)? {
        let trg_len = trg.dim(1)?;
        let trg_in = trg.narrow(1, 0, trg_len - 1)?;
        let trg_out = trg.narrow(1, 1, trg_len - 1)?;

        let (logits, latent_loss) = model.forward(&src, &trg_in, Some(&trg), false)?;
        let task_loss = cross_entropy_loss(&logits, &trg_out, pad_id)?;

        task_sum += task_loss.to_scalar::<f32>()? as f64;
        latent_sum += latent_loss.to_scalar::<f32>()? as f64;
        num_batches += 1;
    }

    if num_batches > 0 {
        Ok((
            task_sum / num_batches as f64,
            latent_sum / num_batches as f64,
        ))
    } else {
        Ok((0.0, 0.0))
    }
}

pub fn get_lr_with_warmup(
    step: usize,
    warmup_steps: usize,
    max_lr: f64,
    min_lr: f64,
    total_steps: usize,
) -> f64 {
    if step < warmup_steps {
        max_lr * (step as f64 / warmup_steps as f64)
    } else if total_steps <= warmup_steps {
        max_lr
    } else {
        let decay_ratio =
            ((step - warmup_steps) as f64 / (total_steps - warmup_steps) as f64).min(1.0);
        let coeff = 0.5 * (1.0 + (std::f64::consts::PI * decay_ratio).cos());
        min_lr + coeff * (max_lr - min_lr)
    }
}
