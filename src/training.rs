//! # 训练与评估循环
//!
//! 每个 epoch：
//!
//! ```text
//! epoch-start ──▶ training-pass ──▶ validation-pass ──▶ epoch-end
//!     │               │                   │                 │
//!   构建掩码      前向/反向/Adam         不累加梯度       记录困惑度
//!                 (可选 SGDR)          dropout 关闭
//! ```
//!
//! 一个 batch 内的窗口逐个 forward → backward，参数梯度累加；输出层梯度按
//! `1 / (B · (L-1))` 缩放，累加结果等于整个 batch 平均交叉熵的梯度。每个 batch 一次 Adam 更新。
//!
//! 困惑度按 token 加权的全局平均计算：`exp(Σ loss·tokens / Σ tokens)`，与 batch 的划分方式无关。

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::{
    config::TrainingConfig,
    dataset::{split_window, BatchLoader},
    error::{LmError, Result},
    linear::Parameterized,
    llm::{cross_entropy_loss, cross_entropy_with_grad, Transformer},
    lr_scheduler::CosineWithRestarts,
    mask::CausalMask,
};

/// 一次遍历中的损失累加器
#[derive(Clone, Debug)]
pub struct LossAccumulator {
    pass: &'static str,
    weighted_loss: f64,
    tokens: usize,
}

impl LossAccumulator {
    pub fn new(pass: &'static str) -> Self {
        Self {
            pass,
            weighted_loss: 0.0,
            tokens: 0,
        }
    }

    /// `loss` 是该 batch 的平均交叉熵，`tokens` 是参与计算的目标 token 数
    pub fn add(&mut self, loss: f64, tokens: usize) {
        self.weighted_loss += loss * tokens as f64;
        self.tokens += tokens;
    }

    pub fn tokens(&self) -> usize {
        self.tokens
    }

    pub fn mean_loss(&self) -> Result<f64> {
        if self.tokens == 0 {
            return Err(LmError::EmptyPass(self.pass));
        }
        Ok(self.weighted_loss / self.tokens as f64)
    }

    /// `exp(Σ loss·tokens / Σ tokens)`；没有任何 token 时报错而不是返回 NaN
    pub fn perplexity(&self) -> Result<f64> {
        Ok(self.mean_loss()?.exp())
    }
}

/// 训练过程记录，由调用方持有
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingHistory {
    pub train_perplexity: Vec<f64>,
    pub valid_perplexity: Vec<f64>,
    /// 每个 epoch 最后一个 batch 使用的学习率
    pub learning_rates: Vec<f32>,
}

fn check_windows(windows: &Array2<usize>, mask: &CausalMask) -> Result<()> {
    if windows.nrows() > 0 && windows.ncols() != mask.size() + 1 {
        return Err(LmError::ShapeMismatch {
            name: "window".to_string(),
            expected: vec![mask.size() + 1],
            found: vec![windows.ncols()],
        });
    }
    Ok(())
}

/// 一个训练 batch：清零梯度，逐窗口 forward/backward 累加梯度，返回 (平均损失, token 数)
fn train_batch(
    model: &mut Transformer,
    loader: &BatchLoader,
    batch: &[usize],
    mask: &CausalMask,
) -> Result<(f64, usize)> {
    model.zero_grad();

    let tokens = batch.len() * mask.size();
    let grad_scale = 1.0 / tokens.max(1) as f32;
    let mut loss_sum = 0.0;

    for &index in batch {
        let (inputs, targets) = split_window(loader.window(index));
        let logits = model.forward(&inputs, mask)?;
        let (window_loss, grads) = cross_entropy_with_grad(&logits, &targets, grad_scale);
        model.backward(&grads);
        loss_sum += window_loss;
    }

    Ok((loss_sum / tokens.max(1) as f64, tokens))
}

/// **评估**：关闭 dropout、不累加梯度，返回困惑度；结束后恢复原来的训练模式
pub fn evaluate(
    model: &mut Transformer,
    loader: &mut BatchLoader,
    mask: &CausalMask,
    pass: &'static str,
) -> Result<f64> {
    let was_training = model.is_training();
    model.set_training_mode(false);

    let result = evaluate_inner(model, loader, mask, pass);

    model.set_training_mode(was_training);
    result
}

fn evaluate_inner(
    model: &mut Transformer,
    loader: &mut BatchLoader,
    mask: &CausalMask,
    pass: &'static str,
) -> Result<f64> {
    let mut accumulator = LossAccumulator::new(pass);

    for batch in loader.batches() {
        let mut batch_loss = 0.0;
        for &index in &batch {
            let (inputs, targets) = split_window(loader.window(index));
            let logits = model.forward(&inputs, mask)?;
            batch_loss += cross_entropy_loss(&logits, &targets);
        }
        let tokens = batch.len() * mask.size();
        accumulator.add(batch_loss / batch.len().max(1) as f64, tokens);
    }

    accumulator.perplexity()
}

/// **训练主循环**
///
/// 掩码按配置的窗口长度构建一次（`seqlen - 1`），训练和验证复用。
pub fn train_model(
    model: &mut Transformer,
    config: &TrainingConfig,
    train: &Array2<usize>,
    valid: &Array2<usize>,
) -> Result<TrainingHistory> {
    config.validate()?;

    let mask = CausalMask::new(config.context_len());
    check_windows(train, &mask)?;
    check_windows(valid, &mask)?;

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut train_loader =
        BatchLoader::new(train.clone(), config.batch_size, true, true, rng.random());
    let mut valid_loader =
        BatchLoader::new(valid.clone(), config.batch_size, true, true, rng.random());

    if train_loader.num_batches() == 0 {
        log::warn!(
            "训练窗口数 ({}) 小于 batch_size ({})",
            train_loader.num_windows(),
            config.batch_size
        );
    }

    let mut scheduler = config.sgdr.then(|| {
        CosineWithRestarts::new(
            vec![config.learning_rate],
            train_loader.num_batches(),
            config.eta_min,
            config.cycle_factor,
        )
    });

    log::info!(
        "开始训练: {} epochs, {} 个训练窗口, {} 个验证窗口, batch_size={}",
        config.epochs,
        train_loader.num_windows(),
        valid_loader.num_windows(),
        config.batch_size
    );

    let mut history = TrainingHistory::default();
    model.set_training_mode(true);

    for epoch in 0..config.epochs {
        let mut accumulator = LossAccumulator::new("train");
        let mut lr = config.learning_rate;

        for (batch_idx, batch) in train_loader.batches().iter().enumerate() {
            let (loss, tokens) = train_batch(model, &train_loader, batch, &mask)?;

            lr = scheduler
                .as_ref()
                .map_or(config.learning_rate, CosineWithRestarts::current_lr);
            model.apply_gradients(lr);
            if let Some(scheduler) = scheduler.as_mut() {
                scheduler.step();
            }

            accumulator.add(loss, tokens);
            log::debug!("epoch {} batch {}: loss={:.4}, lr={:.3e}", epoch, batch_idx, loss, lr);

            if config.printevery > 0 && (batch_idx + 1) % config.printevery == 0 {
                log::info!(
                    "epoch {} batch {}: 训练困惑度 {:.4}",
                    epoch,
                    batch_idx + 1,
                    accumulator.perplexity()?
                );
            }
        }

        let train_perplexity = accumulator.perplexity()?;
        log::info!("epoch {}: 训练困惑度 {:.4}", epoch, train_perplexity);
        history.train_perplexity.push(train_perplexity);

        let valid_perplexity = evaluate(model, &mut valid_loader, &mask, "validation")?;
        log::info!("epoch {}: 验证困惑度 {:.4}", epoch, valid_perplexity);
        history.valid_perplexity.push(valid_perplexity);
        history.learning_rates.push(lr);
    }

    Ok(history)
}

/// **测试**：所有 epoch 结束后在测试集上评估一次，掩码同样按配置的窗口长度构建
pub fn test_model(
    model: &mut Transformer,
    config: &TrainingConfig,
    test: &Array2<usize>,
) -> Result<f64> {
    let mask = CausalMask::new(config.context_len());
    check_windows(test, &mask)?;

    let seed = StdRng::seed_from_u64(config.seed.wrapping_add(1)).random();
    let mut loader = BatchLoader::new(test.clone(), config.batch_size, true, true, seed);

    let perplexity = evaluate(model, &mut loader, &mask, "test")?;
    log::info!("测试困惑度 {:.4}", perplexity);
    Ok(perplexity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_accumulator_is_error() {
        let acc = LossAccumulator::new("validation");
        assert!(matches!(acc.perplexity(), Err(LmError::EmptyPass("validation"))));
    }

    #[test]
    fn test_weighted_average() {
        let mut acc = LossAccumulator::new("train");
        acc.add(1.0, 2);
        acc.add(4.0, 1);
        assert!((acc.mean_loss().unwrap() - 2.0).abs() < 1e-12);
    }
}
