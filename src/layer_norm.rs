//! # 归一化层（Norm）
//!
//! 对每个位置沿特征维度做可学习的仿射归一化：
//!
//! ```text
//! 1. 计算均值和标准差（对特征维度，标准差使用 N-1 的无偏估计）:
//!    μ = mean(x)
//!    σ = sqrt(Σ(x - μ)² / (N - 1))
//!
//! 2. 标准化并缩放/偏移:
//!    y = α * (x - μ) / (σ + ε) + β
//! ```
//!
//! 其中：
//! - `ε (epsilon)`: 防止除零的小常数（1e-6），加在 σ 上而不是方差上
//! - `α (alpha)`: 可学习的缩放参数（初始化为1）
//! - `β (bias)`: 可学习的偏移参数（初始化为0）
//!
//! ## 反向传播
//!
//! 记 c = x - μ，s = σ + ε，g = α ⊙ ∂L/∂y，则对每一行：
//!
//! ```text
//! ∂L/∂x_k = g_k / s - (1/N) Σ_j g_j / s - (Σ_j g_j c_j / s²) · c_k / ((N - 1) σ)
//! ```
//!
//! 当 σ = 0（整行取值相同）时最后一项的极限为 0。

use ndarray::{Array2, Axis, Zip};

use crate::{
    NORM_EPSILON,
    linear::{join, Param, Parameterized},
    llm::Layer,
};

/// **归一化层结构体**
pub struct LayerNorm {
    /// **数值稳定性常数**: 1e-6
    pub epsilon: f32,

    /// **缩放参数 α**: (1, d_model)，初始化为1
    pub alpha: Param,

    /// **偏移参数 β**: (1, d_model)，初始化为0
    pub bias: Param,

    // ========== 前向传播缓存（用于反向传播） ==========
    /// **缓存 x - μ**
    cached_centered: Option<Array2<f32>>,

    /// **缓存标准差**: (seq_len, 1)
    cached_std: Option<Array2<f32>>,
}

impl LayerNorm {
    pub fn new(d_model: usize) -> Self {
        LayerNorm {
            epsilon: NORM_EPSILON,
            alpha: Param::ones((1, d_model)),
            bias: Param::zeros((1, d_model)),
            cached_centered: None,
            cached_std: None,
        }
    }

    fn statistics(input: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
        let n = input.ncols();
        let mean = input
            .mean_axis(Axis(1))
            .unwrap_or_else(|| ndarray::Array1::zeros(input.nrows()))
            .insert_axis(Axis(1));
        let centered = input - &mean;
        let ddof = if n > 1 { 1.0 } else { 0.0 };
        let std = centered
            .mapv(|x| x * x)
            .sum_axis(Axis(1))
            .mapv(|s| (s / (n as f32 - ddof)).sqrt())
            .insert_axis(Axis(1));
        (centered, std)
    }

    /// **执行归一化**
    ///
    /// # 参数
    /// - `input`: (seq_len, d_model) 输入张量
    ///
    /// # 返回值
    /// (seq_len, d_model) 归一化后的张量
    pub fn normalize(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let (centered, std) = Self::statistics(input);
        let output = &self.alpha.value * &(&centered / &(&std + self.epsilon)) + &self.bias.value;

        self.cached_centered = Some(centered);
        self.cached_std = Some(std);

        output
    }
}

impl Layer for LayerNorm {
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        self.normalize(input)
    }

    fn backward(&mut self, grads: &Array2<f32>) -> Array2<f32> {
        let (Some(centered), Some(std)) = (self.cached_centered.as_ref(), self.cached_std.as_ref())
        else {
            log::warn!("LayerNorm.backward 在未执行 forward 的情况下被调用，直接传递梯度");
            return grads.clone();
        };

        let n = centered.ncols() as f32;
        let denom = std + self.epsilon;
        let normalized = centered / &denom;

        self.alpha
            .accumulate(&(&normalized * grads).sum_axis(Axis(0)).insert_axis(Axis(0)));
        self.bias
            .accumulate(&grads.sum_axis(Axis(0)).insert_axis(Axis(0)));

        let g = &self.alpha.value * grads;
        let eps = self.epsilon;
        let mut grad_input = Array2::zeros(g.dim());

        Zip::from(grad_input.rows_mut())
            .and(g.rows())
            .and(centered.rows())
            .and(std.rows())
            .for_each(|mut out, g_row, c_row, sigma| {
                let sigma = sigma[0];
                let s = sigma + eps;
                let g_sum: f32 = g_row.sum();
                let gc_sum: f32 = g_row.iter().zip(c_row.iter()).map(|(a, b)| a * b).sum();
                let std_term = if sigma > 0.0 && n > 1.0 {
                    gc_sum / (s * s) / ((n - 1.0) * sigma)
                } else {
                    0.0
                };
                for ((o, &gk), &ck) in out.iter_mut().zip(g_row.iter()).zip(c_row.iter()) {
                    *o = gk / s - g_sum / (n * s) - std_term * ck;
                }
            });

        grad_input
    }
}

impl Parameterized for LayerNorm {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        f(join(prefix, "alpha"), &self.alpha);
        f(join(prefix, "bias"), &self.bias);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        f(join(prefix, "alpha"), &mut self.alpha);
        f(join(prefix, "bias"), &mut self.bias);
    }
}
