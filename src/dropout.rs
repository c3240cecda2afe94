//! # Dropout 正则化层
//!
//! **训练时**：以概率 p 随机将元素置零，其余元素放大 1/(1-p)（Inverted Dropout）
//! **评估时**：恒等映射
//!
//! ```text
//! 训练时: output = input * mask / (1 - p)
//! 评估时: output = input
//! ```
//!
//! 每个 Dropout 层持有自己的 `StdRng`，由模型的主随机数生成器派生，
//! 因此同一个种子下两次训练得到完全相同的掩码序列。

use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::llm::Layer;

/// **Dropout 正则化层**
pub struct Dropout {
    /// **丢弃率**: [0, 1)
    pub dropout_rate: f32,

    /// **掩码矩阵**: 前向传播时生成（已包含 1/(1-p) 缩放），反向传播时复用
    mask: Option<Array2<f32>>,

    training: bool,

    rng: StdRng,
}

impl Dropout {
    pub fn new(dropout_rate: f32, seed: u64) -> Self {
        Self {
            dropout_rate,
            mask: None,
            training: true,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// 从主随机数生成器派生一个独立种子
    pub fn from_rng<R: Rng>(dropout_rate: f32, rng: &mut R) -> Self {
        Self::new(dropout_rate, rng.random::<u64>())
    }

    pub fn is_active(&self) -> bool {
        self.training && self.dropout_rate > 0.0
    }

    /// **生成缩放后的随机掩码**：保留概率 1 - p，保留的元素取值 1/(1-p)
    fn create_mask(&mut self, shape: (usize, usize)) -> Array2<f32> {
        let keep = 1.0 / (1.0 - self.dropout_rate);
        let rate = self.dropout_rate;
        let rng = &mut self.rng;
        Array2::from_shape_fn(shape, |_| {
            if rng.random::<f32>() >= rate { keep } else { 0.0 }
        })
    }
}

impl Layer for Dropout {
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        if self.is_active() {
            let mask = self.create_mask(input.dim());
            let result = input * &mask;
            self.mask = Some(mask);
            result
        } else {
            self.mask = None;
            input.clone()
        }
    }

    fn backward(&mut self, grads: &Array2<f32>) -> Array2<f32> {
        match self.mask.as_ref() {
            Some(mask) => grads * mask,
            None => grads.clone(),
        }
    }

    fn set_training_mode(&mut self, training: bool) {
        self.training = training;
    }
}
