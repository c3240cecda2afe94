//! # Adam 优化器
//!
//! 每个可训练矩阵拥有一个独立的 `Adam` 状态（一阶动量 m、二阶动量 v、时间步）。
//!
//! ```text
//! m_t = β1 · m_{t-1} + (1 - β1) · g
//! v_t = β2 · v_{t-1} + (1 - β2) · g²
//! m̂  = m_t / (1 - β1^t)
//! v̂  = v_t / (1 - β2^t)
//! θ  = θ - lr · m̂ / (√v̂ + ε)
//! ```
//!
//! 默认超参数 β = (0.9, 0.98)、ε = 1e-9，与 Transformer 原论文的设置一致。

use ndarray::{Array2, Zip};

pub const ADAM_BETA1: f32 = 0.9;
pub const ADAM_BETA2: f32 = 0.98;
pub const ADAM_EPSILON: f32 = 1e-9;

#[derive(Clone, Debug)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    pub timestep: usize,
    pub m: Array2<f32>,
    pub v: Array2<f32>,
}

impl Adam {
    pub fn new(shape: (usize, usize)) -> Self {
        Self::with_hyperparams(shape, ADAM_BETA1, ADAM_BETA2, ADAM_EPSILON)
    }

    pub fn with_hyperparams(shape: (usize, usize), beta1: f32, beta2: f32, epsilon: f32) -> Self {
        Self {
            beta1,
            beta2,
            epsilon,
            timestep: 0,
            m: Array2::zeros(shape),
            v: Array2::zeros(shape),
        }
    }

    /// 用梯度 `grads` 更新参数 `params`（原地修改）
    pub fn step(&mut self, params: &mut Array2<f32>, grads: &Array2<f32>, lr: f32) {
        self.timestep += 1;
        let (beta1, beta2, epsilon) = (self.beta1, self.beta2, self.epsilon);
        let bias1 = 1.0 - beta1.powi(self.timestep as i32);
        let bias2 = 1.0 - beta2.powi(self.timestep as i32);

        Zip::from(params)
            .and(grads)
            .and(&mut self.m)
            .and(&mut self.v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m / bias1;
                let v_hat = *v / bias2;
                *p -= lr * m_hat / (v_hat.sqrt() + epsilon);
            });
    }

    pub fn reset(&mut self) {
        self.timestep = 0;
        self.m.fill(0.0);
        self.v.fill(0.0);
    }
}
