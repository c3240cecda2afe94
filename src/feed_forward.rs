//! # 前馈神经网络（Feed-Forward Network, FFN）
//!
//! 每个位置独立地经过一个两层全连接网络：
//!
//! ```text
//! FFN(x) = Dropout(ReLU(x · W₁ + b₁)) · W₂ + b₂
//! ```
//!
//! 其中：
//! - `W₁`: (d_model, d_ff)，d_ff 默认 2048
//! - `W₂`: (d_ff, d_model)
//! - Dropout 只在训练模式下生效

use ndarray::Array2;
use rand::Rng;

use crate::{
    dropout::Dropout,
    linear::{join, Linear, Param, Parameterized},
    llm::Layer,
};

/// **前馈神经网络结构体**
pub struct FeedForward {
    /// **第一层** linear_1: d_model → d_ff
    pub linear_1: Linear,

    /// **隐藏层 Dropout**
    pub dropout: Dropout,

    /// **第二层** linear_2: d_ff → d_model
    pub linear_2: Linear,

    /// **ReLU 激活前的隐藏层** (seq_len, d_ff)，反向传播时计算 ReLU 梯度
    hidden_pre_activation: Option<Array2<f32>>,
}

impl FeedForward {
    pub fn new<R: Rng>(d_model: usize, d_ff: usize, dropout: f32, rng: &mut R) -> Self {
        FeedForward {
            linear_1: Linear::new(d_model, d_ff, rng),
            dropout: Dropout::from_rng(dropout, rng),
            linear_2: Linear::new(d_ff, d_model, rng),
            hidden_pre_activation: None,
        }
    }
}

impl Layer for FeedForward {
    /// **前向传播**
    ///
    /// 1. h = x·W₁ + b₁
    /// 2. h_activated = Dropout(max(0, h))
    /// 3. output = h_activated·W₂ + b₂
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let hidden_pre_activation = self.linear_1.forward(input);

        let mut hidden_post_activation = hidden_pre_activation.clone();
        hidden_post_activation.par_map_inplace(|x| {
            *x = x.max(0.0);
        });
        let hidden_dropped = self.dropout.forward(&hidden_post_activation);

        self.hidden_pre_activation = Some(hidden_pre_activation);

        self.linear_2.forward(&hidden_dropped)
    }

    /// **反向传播**
    ///
    /// ```text
    /// grad_h_dropped = linear_2.backward(grads)
    /// grad_h_act     = dropout.backward(grad_h_dropped)
    /// grad_h         = grad_h_act * ReLU'(h)
    /// grad_input     = linear_1.backward(grad_h)
    /// ```
    fn backward(&mut self, grads: &Array2<f32>) -> Array2<f32> {
        let grad_hidden_dropped = self.linear_2.backward(grads);
        let grad_hidden_post_activation = self.dropout.backward(&grad_hidden_dropped);

        let Some(hidden_pre_activation) = self.hidden_pre_activation.as_ref() else {
            log::warn!("FeedForward.backward 在未执行 forward 的情况下被调用");
            return self.linear_1.backward(&grad_hidden_post_activation);
        };

        // ReLU 的导数：x > 0 ? 1 : 0
        let mut relu_grad = hidden_pre_activation.clone();
        relu_grad.par_map_inplace(|x| {
            *x = if *x > 0.0 { 1.0 } else { 0.0 };
        });

        let grad_hidden_pre_activation = grad_hidden_post_activation * relu_grad;

        self.linear_1.backward(&grad_hidden_pre_activation)
    }

    fn set_training_mode(&mut self, training: bool) {
        self.dropout.set_training_mode(training);
    }
}

impl Parameterized for FeedForward {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        self.linear_1.visit_parameters(&join(prefix, "linear_1"), f);
        self.linear_2.visit_parameters(&join(prefix, "linear_2"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        self.linear_1.visit_parameters_mut(&join(prefix, "linear_1"), f);
        self.linear_2.visit_parameters_mut(&join(prefix, "linear_2"), f);
    }
}
