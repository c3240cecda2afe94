//! # 词嵌入层（Embeddings Layer）
//!
//! 将离散的 token ID 转换为连续向量，并注入位置信息：
//!
//! ```text
//! output = Dropout(E[token_ids] · √d_model + PE[0..seq_len])
//! ```
//!
//! - `E`: (vocab_size, d_model) 可学习的词嵌入矩阵，Xavier 均匀初始化
//! - `√d_model`: 放大词嵌入，使其量级与位置编码（取值在 [-1, 1]）相当
//! - `PE`: 固定的正弦/余弦位置编码，预先计算到 `max_seq_len`，按实际长度切片
//! - Dropout 只在训练模式下生效
//!
//! **前置条件**：token ID 必须位于 `[0, vocab_size)`，并且序列长度不超过位置编码表长度。
//! 嵌入层不做越界检查（越界会 panic）。

use ndarray::{Array2, Zip};
use rand::Rng;

use crate::{
    dropout::Dropout,
    linear::{join, Param, Parameterized},
    llm::Layer,
    position_encoding::PositionEncoding,
    utils::xavier_uniform,
};

/// **嵌入层结构体**
pub struct Embeddings {
    /// **词嵌入矩阵** (vocab_size × d_model)
    pub weight: Param,

    /// **位置编码器**（固定，不参与训练）
    pub position_encoder: PositionEncoding,

    pub dropout: Dropout,

    /// **缓存的 token ID**：反向传播时需要知道累加到哪些行
    cached_ids: Option<Vec<usize>>,
}

impl Embeddings {
    pub fn new<R: Rng>(
        vocab_size: usize,
        d_model: usize,
        max_seq_len: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Self {
        Self {
            weight: Param::new(xavier_uniform(rng, vocab_size, d_model)),
            position_encoder: PositionEncoding::new(max_seq_len, d_model),
            dropout: Dropout::from_rng(dropout, rng),
            cached_ids: None,
        }
    }

    pub fn vocab_size(&self) -> usize {
        self.weight.value.nrows()
    }

    pub fn d_model(&self) -> usize {
        self.weight.value.ncols()
    }

    fn scale(&self) -> f32 {
        (self.d_model() as f32).sqrt()
    }

    /// 查询词嵌入并乘以 √d_model（不加位置编码）
    fn lookup(&self, token_ids: &[usize]) -> Array2<f32> {
        let scale = self.scale();
        let table = &self.weight.value;
        let mut token_embeds = Array2::<f32>::zeros((token_ids.len(), self.d_model()));

        Zip::indexed(&mut token_embeds).for_each(|(i, j), value| {
            *value = table[[token_ids[i], j]] * scale;
        });

        token_embeds
    }

    /// **生成完整的嵌入**
    ///
    /// # 参数
    /// - `token_ids`: 长度为 seq_len 的 token ID 序列
    ///
    /// # 返回值
    /// (seq_len, d_model) 的嵌入矩阵
    pub fn embed(&mut self, token_ids: &[usize]) -> Array2<f32> {
        let mut embeds = self.lookup(token_ids);
        self.position_encoder.apply_to_input(&mut embeds);
        self.cached_ids = Some(token_ids.to_vec());
        self.dropout.forward(&embeds)
    }

    /// **反向传播：累加词嵌入梯度**
    ///
    /// 同一个 token 在序列中出现多次时梯度累加；位置编码固定，不需要梯度。
    /// 嵌入层是网络的第一层，对 token ID 没有梯度可返回。
    ///
    /// ```text
    /// grad_E[token_ids[i]] += dropout'(grads)[i] · √d_model
    /// ```
    pub fn backward(&mut self, grads: &Array2<f32>) {
        let grads = self.dropout.backward(grads);

        let Some(token_ids) = self.cached_ids.as_ref() else {
            log::warn!("Embeddings.backward 在未执行 forward 的情况下被调用，跳过梯度累加");
            return;
        };

        let scale = (self.weight.value.ncols() as f32).sqrt();
        for (i, &token_id) in token_ids.iter().enumerate() {
            let mut token_row = self.weight.grad.row_mut(token_id);
            token_row.scaled_add(scale, &grads.row(i));
        }
    }

    pub fn set_training_mode(&mut self, training: bool) {
        self.dropout.set_training_mode(training);
    }
}

impl Parameterized for Embeddings {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        f(join(prefix, "weight"), &self.weight);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        f(join(prefix, "weight"), &mut self.weight);
    }
}
