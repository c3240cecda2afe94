//! # 多头注意力机制（Multi-Head Attention）
//!
//! ## 缩放点积注意力（Scaled Dot-Product Attention）
//!
//! ```text
//! Attention(Q, K, V) = Dropout(softmax(mask(QK^T / √d_k))) · V
//! ```
//!
//! 1. **计算相似度**: `Q·K^T`，再除以 `√d_k`
//! 2. **应用掩码**: 掩码为 false 的位置填充 -1e9（softmax 后概率严格为 0）
//! 3. **归一化**: 逐行稳定 softmax（先减去行最大值）
//! 4. **Dropout**: 仅训练模式下作用于注意力权重
//! 5. **加权求和**: `· V`
//!
//! ## 多头机制
//!
//! 输入经过 q/k/v 三个独立的线性映射，按列切分成 `heads` 个 `d_k = d_model / heads`
//! 维的子空间，各头共享同一个掩码独立计算注意力，拼接后再经过输出投影 `out`。
//! `d_model` 不能被 `heads` 整除的配置直接拒绝。
//!
//! ## 反向传播
//!
//! 记 P 为 softmax 权重，D 为 dropout 之后的权重：
//!
//! ```text
//! ∂L/∂D = ∂L/∂O · V^T        ∂L/∂V = D^T · ∂L/∂O
//! ∂L/∂P = dropout'(∂L/∂D)
//! ∂L/∂S = P ⊙ (∂L/∂P - rowsum(P ⊙ ∂L/∂P)) / √d_k
//! ∂L/∂Q = ∂L/∂S · K          ∂L/∂K = ∂L/∂S^T · Q
//! ```

use ndarray::linalg::general_mat_mul;
use ndarray::{s, Array2, ArrayView2};
use rand::Rng;

use crate::{
    MASK_FILL,
    dropout::Dropout,
    error::{LmError, Result},
    linear::{join, Linear, Param, Parameterized},
    llm::Layer,
    mask::CausalMask,
    utils::softmax,
};

/// 单个注意力头的计算结果
pub struct AttentionOutput {
    /// (seq_len, d_v)
    pub output: Array2<f32>,
    /// softmax 之后、dropout 之前的权重 (seq_len, seq_len)
    pub weights: Array2<f32>,
    /// dropout 之后真正参与加权求和的权重
    pub dropped_weights: Array2<f32>,
}

/// **缩放点积注意力**
///
/// `mask` 中被屏蔽（以及越界）的位置填充 [`MASK_FILL`]；`dropout` 为 `None` 时不做正则化。
pub fn scaled_dot_product_attention(
    q: ArrayView2<f32>,
    k: ArrayView2<f32>,
    v: ArrayView2<f32>,
    mask: Option<&CausalMask>,
    dropout: Option<&mut Dropout>,
) -> AttentionOutput {
    let scale = 1.0 / (q.ncols() as f32).sqrt();

    let mut scores = Array2::zeros((q.nrows(), k.nrows()));
    general_mat_mul(scale, &q, &k.t(), 0.0, &mut scores);

    if let Some(mask) = mask {
        for ((i, j), score) in scores.indexed_iter_mut() {
            if !mask.is_allowed(i, j) {
                *score = MASK_FILL;
            }
        }
    }

    let weights = softmax(&scores);
    let dropped_weights = match dropout {
        Some(dropout) => dropout.forward(&weights),
        None => weights.clone(),
    };

    let mut output = Array2::zeros((dropped_weights.nrows(), v.ncols()));
    general_mat_mul(1.0, &dropped_weights, &v, 0.0, &mut output);

    AttentionOutput {
        output,
        weights,
        dropped_weights,
    }
}

/// **Softmax 梯度**
///
/// `∂L/∂x_i = y_i * (∂L/∂y_i - Σ_j y_j * ∂L/∂y_j)`
pub fn softmax_backward(softmax_output: &Array2<f32>, grad_output: &Array2<f32>) -> Array2<f32> {
    let mut grad_input = Array2::zeros(softmax_output.dim());

    for ((sm_row, grad_row), mut out_row) in softmax_output
        .rows()
        .into_iter()
        .zip(grad_output.rows())
        .zip(grad_input.rows_mut())
    {
        let dot_product: f32 = sm_row.iter().zip(grad_row.iter()).map(|(&y, &g)| y * g).sum();

        for ((o, &y), &g) in out_row.iter_mut().zip(sm_row.iter()).zip(grad_row.iter()) {
            *o = y * (g - dot_product);
        }
    }

    grad_input
}

/// 前向传播时每个头缓存的中间结果
struct HeadCache {
    q: Array2<f32>,
    k: Array2<f32>,
    v: Array2<f32>,
    weights: Array2<f32>,
    dropped_weights: Array2<f32>,
}

/// **多头注意力结构体**
pub struct MultiHeadAttention {
    pub d_model: usize,
    pub heads: usize,
    /// **每个头的维度**: d_model / heads
    pub d_k: usize,

    pub q_linear: Linear,
    pub k_linear: Linear,
    pub v_linear: Linear,
    /// **输出投影** W_O: (d_model, d_model)
    pub out: Linear,

    /// 每个头一个注意力权重 Dropout，反向传播时各自复用自己的掩码
    dropouts: Vec<Dropout>,

    cached_heads: Vec<HeadCache>,
}

impl MultiHeadAttention {
    pub fn new<R: Rng>(d_model: usize, heads: usize, dropout: f32, rng: &mut R) -> Result<Self> {
        if heads == 0 || d_model % heads != 0 {
            return Err(LmError::Config(format!(
                "d_model ({d_model}) must be divisible by heads ({heads})"
            )));
        }

        Ok(Self {
            d_model,
            heads,
            d_k: d_model / heads,
            q_linear: Linear::new(d_model, d_model, rng),
            k_linear: Linear::new(d_model, d_model, rng),
            v_linear: Linear::new(d_model, d_model, rng),
            out: Linear::new(d_model, d_model, rng),
            dropouts: (0..heads).map(|_| Dropout::from_rng(dropout, rng)).collect(),
            cached_heads: Vec::new(),
        })
    }

    /// **前向传播**
    ///
    /// `query`/`key`/`value`: (seq_len, d_model)，自注意力时三者相同。
    pub fn forward(
        &mut self,
        query: &Array2<f32>,
        key: &Array2<f32>,
        value: &Array2<f32>,
        mask: Option<&CausalMask>,
    ) -> Array2<f32> {
        let q = self.q_linear.forward(query);
        let k = self.k_linear.forward(key);
        let v = self.v_linear.forward(value);

        let mut concat = Array2::zeros((q.nrows(), self.d_model));
        self.cached_heads.clear();

        for (head, dropout) in self.dropouts.iter_mut().enumerate() {
            let cols = s![.., head * self.d_k..(head + 1) * self.d_k];
            let (q_h, k_h, v_h) = (q.slice(cols), k.slice(cols), v.slice(cols));

            let attention = scaled_dot_product_attention(q_h, k_h, v_h, mask, Some(dropout));
            concat.slice_mut(cols).assign(&attention.output);

            self.cached_heads.push(HeadCache {
                q: q_h.to_owned(),
                k: k_h.to_owned(),
                v: v_h.to_owned(),
                weights: attention.weights,
                dropped_weights: attention.dropped_weights,
            });
        }

        self.out.forward(&concat)
    }

    /// **反向传播**
    ///
    /// 返回对 (query, key, value) 三个输入的梯度；自注意力调用方需要把三者相加。
    pub fn backward(&mut self, grads: &Array2<f32>) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let grad_concat = self.out.backward(grads);
        let seq_len = grad_concat.nrows();

        if self.cached_heads.len() != self.heads {
            log::warn!("MultiHeadAttention.backward 在未执行 forward 的情况下被调用");
            let zeros = Array2::zeros((seq_len, self.d_model));
            return (zeros.clone(), zeros.clone(), zeros);
        }

        let mut grad_q = Array2::zeros((seq_len, self.d_model));
        let mut grad_k = Array2::zeros((seq_len, self.d_model));
        let mut grad_v = Array2::zeros((seq_len, self.d_model));
        let scale = 1.0 / (self.d_k as f32).sqrt();

        for (head, (cache, dropout)) in self
            .cached_heads
            .iter()
            .zip(self.dropouts.iter_mut())
            .enumerate()
        {
            let cols = s![.., head * self.d_k..(head + 1) * self.d_k];
            let grad_out = grad_concat.slice(cols);

            let grad_dropped = grad_out.dot(&cache.v.t());
            grad_v
                .slice_mut(cols)
                .assign(&cache.dropped_weights.t().dot(&grad_out));

            let grad_weights = dropout.backward(&grad_dropped);
            let grad_scores = softmax_backward(&cache.weights, &grad_weights) * scale;

            grad_q.slice_mut(cols).assign(&grad_scores.dot(&cache.k));
            grad_k.slice_mut(cols).assign(&grad_scores.t().dot(&cache.q));
        }

        (
            self.q_linear.backward(&grad_q),
            self.k_linear.backward(&grad_k),
            self.v_linear.backward(&grad_v),
        )
    }

    pub fn set_training_mode(&mut self, training: bool) {
        for dropout in &mut self.dropouts {
            dropout.set_training_mode(training);
        }
    }
}

impl Parameterized for MultiHeadAttention {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        self.q_linear.visit_parameters(&join(prefix, "q_linear"), f);
        self.k_linear.visit_parameters(&join(prefix, "k_linear"), f);
        self.v_linear.visit_parameters(&join(prefix, "v_linear"), f);
        self.out.visit_parameters(&join(prefix, "out"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        self.q_linear.visit_parameters_mut(&join(prefix, "q_linear"), f);
        self.k_linear.visit_parameters_mut(&join(prefix, "k_linear"), f);
        self.v_linear.visit_parameters_mut(&join(prefix, "v_linear"), f);
        self.out.visit_parameters_mut(&join(prefix, "out"), f);
    }
}
