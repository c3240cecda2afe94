use ndarray::Array2;
use rand::Rng;
use rand::SeedableRng;
use rand::rngs::StdRng;

use crate::{
    config::TrainingConfig,
    error::{LmError, Result},
    linear::{join, Param, Parameterized},
    mask::CausalMask,
    model_serialization::load_snapshot_auto,
    output_projection::OutputProjection,
    transformer::{DecoderOnlyStack, StackShape},
    utils::log_softmax,
};

/// 逐位置（seq_len, dim）→（seq_len, dim'）的层。
///
/// `backward` 只累加参数梯度并返回对输入的梯度，参数更新统一由 `apply_gradients` 完成。
pub trait Layer {
    fn forward(&mut self, input: &Array2<f32>) -> Array2<f32>;

    fn backward(&mut self, grads: &Array2<f32>) -> Array2<f32>;

    fn set_training_mode(&mut self, _training: bool) {}
}

/// 仅解码器的 Transformer 语言模型：解码器栈 + 输出投影
pub struct Transformer {
    pub decoder: DecoderOnlyStack,
    pub out: OutputProjection,
    training: bool,
}

impl Transformer {
    pub fn new<R: Rng>(config: &TrainingConfig, vocab_size: usize, rng: &mut R) -> Result<Self> {
        let shape = StackShape {
            vocab_size,
            d_model: config.d_model,
            n_layers: config.n_layers,
            heads: config.heads,
            d_ff: config.d_ff,
            dropout: config.dropout,
            max_seq_len: config.max_seq_len,
        };

        Ok(Self {
            decoder: DecoderOnlyStack::new(&shape, rng)?,
            out: OutputProjection::new(config.d_model, vocab_size, rng),
            training: true,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.out.vocab_size()
    }

    pub fn d_model(&self) -> usize {
        self.decoder.embed.d_model()
    }

    pub fn max_seq_len(&self) -> usize {
        self.decoder.embed.position_encoder.max_seq_len()
    }

    /// **前向传播**：token ID 序列 → (seq_len, vocab_size) logits
    ///
    /// 掩码尺寸必须等于序列长度；token ID 必须小于 `vocab_size`。
    pub fn forward(&mut self, token_ids: &[usize], mask: &CausalMask) -> Result<Array2<f32>> {
        if mask.size() != token_ids.len() {
            return Err(LmError::ShapeMismatch {
                name: "causal_mask".to_string(),
                expected: vec![token_ids.len(), token_ids.len()],
                found: vec![mask.size(), mask.size()],
            });
        }
        if token_ids.len() > self.max_seq_len() {
            return Err(LmError::ShapeMismatch {
                name: "sequence".to_string(),
                expected: vec![self.max_seq_len()],
                found: vec![token_ids.len()],
            });
        }

        let hidden = self.decoder.forward(token_ids, mask);
        Ok(self.out.forward(&hidden))
    }

    /// 反向传播，梯度累加到各参数的 `grad` 中
    pub fn backward(&mut self, grad_logits: &Array2<f32>) {
        let grad_hidden = self.out.backward(grad_logits);
        self.decoder.backward(&grad_hidden);
    }

    pub fn set_training_mode(&mut self, training: bool) {
        self.training = training;
        self.decoder.set_training_mode(training);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn total_parameters(&self) -> usize {
        self.parameter_count()
    }

    /// 所有参数的名字和形状，按模块树顺序
    pub fn named_parameters(&self) -> Vec<(String, Vec<usize>)> {
        let mut named = Vec::new();
        self.visit_parameters("", &mut |name, param| {
            named.push((name, param.value.shape().to_vec()));
        });
        named
    }
}

impl Parameterized for Transformer {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        self.decoder.visit_parameters(&join(prefix, "decoder"), f);
        self.out.visit_parameters(&join(prefix, "out"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        self.decoder.visit_parameters_mut(&join(prefix, "decoder"), f);
        self.out.visit_parameters_mut(&join(prefix, "out"), f);
    }
}

/// 校验配置后构建模型；配置了 `loadname` 时整体加载快照，否则用 `seed` 随机初始化
pub fn get_model(config: &TrainingConfig, vocab_size: usize) -> Result<Transformer> {
    config.validate()?;
    if vocab_size == 0 {
        return Err(LmError::Config("vocab_size must be positive".to_string()));
    }

    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut model = Transformer::new(config, vocab_size, &mut rng)?;

    if let Some(path) = config.loadname.as_ref() {
        log::info!("从 {} 加载预训练参数", path.display());
        let snapshot = load_snapshot_auto(path)?;
        snapshot.load_into(&mut model)?;
    }

    log::info!(
        "模型构建完成: d_model={}, N={}, heads={}, vocab={}, 参数量={}",
        config.d_model,
        config.n_layers,
        config.heads,
        vocab_size,
        model.total_parameters()
    );

    Ok(model)
}

/// **交叉熵损失及其梯度**
///
/// ```text
/// loss_i = -log_softmax(logits)_i[target_i]
/// grad   = (softmax(logits) - one_hot(target)) · grad_scale
/// ```
///
/// 返回所有位置损失之和（不取平均）与缩放后的梯度。
pub fn cross_entropy_with_grad(
    logits: &Array2<f32>,
    targets: &[usize],
    grad_scale: f32,
) -> (f64, Array2<f32>) {
    let log_probs = log_softmax(logits);
    let mut grads = log_probs.mapv(f32::exp);
    let mut loss_sum = 0.0f64;

    for (row_idx, &target_idx) in targets.iter().enumerate() {
        loss_sum -= log_probs[[row_idx, target_idx]] as f64;
        grads[[row_idx, target_idx]] -= 1.0;
    }

    grads.mapv_inplace(|x| x * grad_scale);
    (loss_sum, grads)
}

/// 平均交叉熵（不计算梯度）
pub fn cross_entropy_loss(logits: &Array2<f32>, targets: &[usize]) -> f64 {
    if targets.is_empty() {
        return 0.0;
    }
    let log_probs = log_softmax(logits);
    let total: f64 = targets
        .iter()
        .enumerate()
        .map(|(row_idx, &target_idx)| -(log_probs[[row_idx, target_idx]] as f64))
        .sum();
    total / targets.len() as f64
}
