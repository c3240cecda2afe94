//! # 全连接层与可训练参数
//!
//! `Param` 把一个可训练矩阵、它的梯度累加器和它专属的 Adam 状态绑在一起；
//! `Linear` 是 `y = x · W + b` 的仿射变换，注意力投影、前馈网络和输出投影都由它组成。
//!
//! 梯度采用**累加**语义：一个 batch 中的每个窗口依次 forward → backward，
//! 参数梯度累加到 `grad` 中，整个 batch 结束后调用一次 `step` 再清零。

use ndarray::{Array2, Axis};
use rand::Rng;

use crate::{adam::Adam, utils::xavier_uniform};

/// 可训练参数：数值 + 梯度累加器 + Adam 状态
#[derive(Clone, Debug)]
pub struct Param {
    pub value: Array2<f32>,
    pub grad: Array2<f32>,
    pub optimizer: Adam,
}

impl Param {
    pub fn new(value: Array2<f32>) -> Self {
        let shape = value.dim();
        Self {
            value,
            grad: Array2::zeros(shape),
            optimizer: Adam::new(shape),
        }
    }

    pub fn zeros(shape: (usize, usize)) -> Self {
        Self::new(Array2::zeros(shape))
    }

    pub fn ones(shape: (usize, usize)) -> Self {
        Self::new(Array2::ones(shape))
    }

    pub fn accumulate(&mut self, grad: &Array2<f32>) {
        self.grad += grad;
    }

    /// 用累加的梯度执行一次 Adam 更新，然后清零梯度
    pub fn step(&mut self, lr: f32) {
        self.optimizer.step(&mut self.value, &self.grad, lr);
        self.grad.fill(0.0);
    }

    pub fn zero_grad(&mut self) {
        self.grad.fill(0.0);
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// 访问带名字的参数，供检查点保存/加载使用
pub trait Parameterized {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param));

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param));

    /// 对所有参数执行一次优化器更新并清零梯度
    fn apply_gradients(&mut self, lr: f32) {
        self.visit_parameters_mut("", &mut |_, param| param.step(lr));
    }

    fn zero_grad(&mut self) {
        self.visit_parameters_mut("", &mut |_, param| param.zero_grad());
    }

    fn parameter_count(&self) -> usize {
        let mut total = 0;
        self.visit_parameters("", &mut |_, param| total += param.len());
        total
    }
}

/// 拼接参数路径：`join("decoder", "norm")` → `decoder.norm`
pub fn join(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}.{name}")
    }
}

/// **仿射变换** `y = x · W + b`
///
/// - `weight`: (in_features, out_features)，Xavier 均匀初始化
/// - `bias`: (1, out_features)，零初始化
pub struct Linear {
    pub weight: Param,
    pub bias: Param,
    cached_input: Option<Array2<f32>>,
}

impl Linear {
    pub fn new<R: Rng>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: Param::new(xavier_uniform(rng, in_features, out_features)),
            bias: Param::zeros((1, out_features)),
            cached_input: None,
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.value.ncols()
    }

    pub fn forward(&mut self, input: &Array2<f32>) -> Array2<f32> {
        let output = self.project(input);
        self.cached_input = Some(input.clone());
        output
    }

    /// 不缓存输入的前向计算（评估时使用）
    pub fn project(&self, input: &Array2<f32>) -> Array2<f32> {
        input.dot(&self.weight.value) + &self.bias.value
    }

    /// ```text
    /// grad_W     = x^T · grads
    /// grad_b     = sum(grads, axis=0)
    /// grad_input = grads · W^T
    /// ```
    pub fn backward(&mut self, grads: &Array2<f32>) -> Array2<f32> {
        let Some(input) = self.cached_input.as_ref() else {
            log::warn!("Linear.backward 在未执行 forward 的情况下被调用，返回零梯度");
            return Array2::zeros((grads.nrows(), self.in_features()));
        };

        self.weight.accumulate(&input.t().dot(grads));
        self.bias
            .accumulate(&grads.sum_axis(Axis(0)).insert_axis(Axis(0)));

        grads.dot(&self.weight.value.t())
    }
}

impl Parameterized for Linear {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        f(join(prefix, "weight"), &self.weight);
        f(join(prefix, "bias"), &self.bias);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        f(join(prefix, "weight"), &mut self.weight);
        f(join(prefix, "bias"), &mut self.bias);
    }
}
