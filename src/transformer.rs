use ndarray::Array2;
use rand::Rng;

use crate::{
    attention::MultiHeadAttention,
    dropout::Dropout,
    embeddings::Embeddings,
    error::Result,
    feed_forward::FeedForward,
    layer_norm::LayerNorm,
    linear::{join, Param, Parameterized},
    llm::Layer,
    mask::CausalMask,
};

/// One pre-norm decoder block: three `norm -> sublayer -> dropout -> residual` steps.
///
/// The second attention sublayer attends over the block's own hidden state, exactly like
/// the first one. There is no encoder, so nothing else could feed it; this keeps the
/// encoder-decoder layout (self-attention, "cross"-attention, feed-forward) on purpose
/// and should not be replaced by a single attention without also changing saved weights.
pub struct DecoderOnlyBlock {
    pub norm_1: LayerNorm,
    pub norm_2: LayerNorm,
    pub norm_3: LayerNorm,
    pub attn_1: MultiHeadAttention,
    pub attn_2: MultiHeadAttention,
    pub ff: FeedForward,
    dropout_1: Dropout,
    dropout_2: Dropout,
    dropout_3: Dropout,
}

impl DecoderOnlyBlock {
    pub fn new<R: Rng>(
        d_model: usize,
        heads: usize,
        d_ff: usize,
        dropout: f32,
        rng: &mut R,
    ) -> Result<Self> {
        Ok(Self {
            norm_1: LayerNorm::new(d_model),
            norm_2: LayerNorm::new(d_model),
            norm_3: LayerNorm::new(d_model),
            attn_1: MultiHeadAttention::new(d_model, heads, dropout, rng)?,
            attn_2: MultiHeadAttention::new(d_model, heads, dropout, rng)?,
            ff: FeedForward::new(d_model, d_ff, dropout, rng),
            dropout_1: Dropout::from_rng(dropout, rng),
            dropout_2: Dropout::from_rng(dropout, rng),
            dropout_3: Dropout::from_rng(dropout, rng),
        })
    }

    pub fn forward(&mut self, input: &Array2<f32>, mask: &CausalMask) -> Array2<f32> {
        let x2 = self.norm_1.normalize(input);
        let attn = self.attn_1.forward(&x2, &x2, &x2, Some(mask));
        let x = input + &self.dropout_1.forward(&attn);

        let x2 = self.norm_2.normalize(&x);
        let attn = self.attn_2.forward(&x2, &x2, &x2, Some(mask));
        let x = x + self.dropout_2.forward(&attn);

        let x2 = self.norm_3.normalize(&x);
        let ff = self.ff.forward(&x2);
        x + self.dropout_3.forward(&ff)
    }

    /// Gradient w.r.t. the block input. Each residual branch adds its own contribution.
    pub fn backward(&mut self, grads: &Array2<f32>) -> Array2<f32> {
        let mut grad_x = grads.clone();

        let grad_ff = self.dropout_3.backward(&grad_x);
        let grad_x2 = self.ff.backward(&grad_ff);
        grad_x += &self.norm_3.backward(&grad_x2);

        let grad_attn = self.dropout_2.backward(&grad_x);
        let (gq, gk, gv) = self.attn_2.backward(&grad_attn);
        grad_x += &self.norm_2.backward(&(gq + gk + gv));

        let grad_attn = self.dropout_1.backward(&grad_x);
        let (gq, gk, gv) = self.attn_1.backward(&grad_attn);
        grad_x += &self.norm_1.backward(&(gq + gk + gv));

        grad_x
    }

    pub fn set_training_mode(&mut self, training: bool) {
        self.attn_1.set_training_mode(training);
        self.attn_2.set_training_mode(training);
        self.ff.set_training_mode(training);
        self.dropout_1.set_training_mode(training);
        self.dropout_2.set_training_mode(training);
        self.dropout_3.set_training_mode(training);
    }
}

impl Parameterized for DecoderOnlyBlock {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        self.norm_1.visit_parameters(&join(prefix, "norm_1"), f);
        self.norm_2.visit_parameters(&join(prefix, "norm_2"), f);
        self.norm_3.visit_parameters(&join(prefix, "norm_3"), f);
        self.attn_1.visit_parameters(&join(prefix, "attn_1"), f);
        self.attn_2.visit_parameters(&join(prefix, "attn_2"), f);
        self.ff.visit_parameters(&join(prefix, "ff"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        self.norm_1.visit_parameters_mut(&join(prefix, "norm_1"), f);
        self.norm_2.visit_parameters_mut(&join(prefix, "norm_2"), f);
        self.norm_3.visit_parameters_mut(&join(prefix, "norm_3"), f);
        self.attn_1.visit_parameters_mut(&join(prefix, "attn_1"), f);
        self.attn_2.visit_parameters_mut(&join(prefix, "attn_2"), f);
        self.ff.visit_parameters_mut(&join(prefix, "ff"), f);
    }
}

/// Builds `n` blocks, each with its own freshly initialised weights.
pub fn get_clones<T, F>(n: usize, mut factory: F) -> Result<Vec<T>>
where
    F: FnMut() -> Result<T>,
{
    (0..n).map(|_| factory()).collect()
}

/// Hyperparameters shared by every block of a stack.
#[derive(Clone, Copy, Debug)]
pub struct StackShape {
    pub vocab_size: usize,
    pub d_model: usize,
    pub n_layers: usize,
    pub heads: usize,
    pub d_ff: usize,
    pub dropout: f32,
    pub max_seq_len: usize,
}

/// Embedding + positional encoding, `n_layers` decoder blocks, final norm.
pub struct DecoderOnlyStack {
    pub embed: Embeddings,
    pub layers: Vec<DecoderOnlyBlock>,
    pub norm: LayerNorm,
}

impl DecoderOnlyStack {
    pub fn new<R: Rng>(shape: &StackShape, rng: &mut R) -> Result<Self> {
        let embed = Embeddings::new(
            shape.vocab_size,
            shape.d_model,
            shape.max_seq_len,
            shape.dropout,
            rng,
        );
        let layers = get_clones(shape.n_layers, || {
            DecoderOnlyBlock::new(shape.d_model, shape.heads, shape.d_ff, shape.dropout, rng)
        })?;

        Ok(Self {
            embed,
            layers,
            norm: LayerNorm::new(shape.d_model),
        })
    }

    pub fn forward(&mut self, token_ids: &[usize], mask: &CausalMask) -> Array2<f32> {
        let mut x = self.embed.embed(token_ids);
        for layer in &mut self.layers {
            x = layer.forward(&x, mask);
        }
        self.norm.normalize(&x)
    }

    pub fn backward(&mut self, grads: &Array2<f32>) {
        let mut grad = self.norm.backward(grads);
        for layer in self.layers.iter_mut().rev() {
            grad = layer.backward(&grad);
        }
        self.embed.backward(&grad);
    }

    pub fn set_training_mode(&mut self, training: bool) {
        self.embed.set_training_mode(training);
        for layer in &mut self.layers {
            layer.set_training_mode(training);
        }
    }
}

impl Parameterized for DecoderOnlyStack {
    fn visit_parameters(&self, prefix: &str, f: &mut dyn FnMut(String, &Param)) {
        self.embed.visit_parameters(&join(prefix, "embed"), f);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.visit_parameters(&join(prefix, &format!("layers.{i}")), f);
        }
        self.norm.visit_parameters(&join(prefix, "norm"), f);
    }

    fn visit_parameters_mut(&mut self, prefix: &str, f: &mut dyn FnMut(String, &mut Param)) {
        self.embed.visit_parameters_mut(&join(prefix, "embed"), f);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.visit_parameters_mut(&join(prefix, &format!("layers.{i}")), f);
        }
        self.norm.visit_parameters_mut(&join(prefix, "norm"), f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_clones_do_not_share_weights() {
        let mut rng = StdRng::seed_from_u64(1);
        let blocks = get_clones(2, || DecoderOnlyBlock::new(8, 2, 16, 0.0, &mut rng)).unwrap();
        assert_ne!(
            blocks[0].attn_1.q_linear.weight.value,
            blocks[1].attn_1.q_linear.weight.value
        );
    }
}
