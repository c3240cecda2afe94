//! # 输出投影层（Output Projection Layer）
//!
//! 语言模型的最后一层，把解码器每个位置的隐藏状态映射为词表上的未归一化分数：
//!
//! ```text
//! 输入: (seq_len, d_model) - 解码器最终归一化后的隐藏状态
//! 输出: (seq_len, vocab_size) - logits
//! ```
//!
//! 权重 (d_model, vocab_size) 使用 Xavier 均匀初始化，偏置为零。
//! 未实现与词嵌入的权重共享。

use ndarray::Array2;
use rand::Rng;

use crate::{
    linear::{Linear, Param, Parameterized},
    llm::Layer,
};

/// **输出投影层结构体**
pub struct OutputProjection {
    pub linear: Linear,
}

impl OutputProjection {
    pub fn new<R: Rng>(d_model: usize, vocab_size: usize, rng: &mut R) -> Self {
        Self {
            linear: Linear::new(d_model, vocab_size, rng),
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.linear.out_features()
    }
}

impl Layer for OutputProjection {
    /// `logits = input · W + b`
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        self.linear.forward(input)
    }

    fn backward(&mut self, grads: &Array2<f32>) -> Array2<f32> {
        self.linear.backward(grads)
    }
}

/// 参数名直接挂在前缀下（`out.weight` / `out.bias`）
impl Parameterized for OutputProjection {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        self.linear.visit_parameters(prefix, f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        self.linear.visit_parameters_mut(prefix, f);
    }
}
