/// 手写反向传播与中心差分的对比
use decoder_lm::{
    feed_forward::FeedForward,
    layer_norm::LayerNorm,
    llm::{cross_entropy_loss, cross_entropy_with_grad},
    CausalMask, Layer, Parameterized, Transformer, TrainingConfig,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const EPSILON: f32 = 1e-3;

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.random_range(-1.0..1.0))
}

/// 损失 L = Σ (y ⊙ w)，w 固定，因此 ∂L/∂y = w
fn weighted_sum(output: &Array2<f32>, weights: &Array2<f32>) -> f32 {
    (output * weights).sum()
}

fn assert_close(numerical: f32, analytical: f32, what: &str) {
    let abs_err = (numerical - analytical).abs();
    assert!(
        abs_err < 2e-3 + 0.05 * numerical.abs(),
        "{}: 数值梯度={:.6} 解析梯度={:.6}",
        what,
        numerical,
        analytical
    );
}

#[test]
fn test_layer_norm_input_gradient() {
    let mut rng = StdRng::seed_from_u64(1);
    let mut norm = LayerNorm::new(6);
    // 非平凡的 alpha/bias
    norm.alpha.value = random_matrix(&mut rng, 1, 6) + 1.0;
    norm.bias.value = random_matrix(&mut rng, 1, 6);

    let input = random_matrix(&mut rng, 3, 6) * 2.0;
    let weights = random_matrix(&mut rng, 3, 6);

    norm.forward(&input);
    let grad_input = norm.backward(&weights);

    for (i, j) in [(0, 0), (1, 3), (2, 5)] {
        let mut plus = input.clone();
        plus[[i, j]] += EPSILON;
        let mut minus = input.clone();
        minus[[i, j]] -= EPSILON;
        let numerical = (weighted_sum(&norm.forward(&plus), &weights)
            - weighted_sum(&norm.forward(&minus), &weights))
            / (2.0 * EPSILON);
        assert_close(numerical, grad_input[[i, j]], &format!("LayerNorm x[{},{}]", i, j));
    }
}

#[test]
fn test_layer_norm_uses_unbiased_std() {
    let mut norm = LayerNorm::new(4);
    let input = Array2::from_shape_vec((1, 4), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
    let out = norm.forward(&input);

    // 均值 2.5，无偏标准差 sqrt(5/3)
    let std = (5.0f32 / 3.0).sqrt();
    assert!((out[[0, 0]] - (-1.5 / (std + 1e-6))).abs() < 1e-5);
    assert!((out[[0, 3]] - (1.5 / (std + 1e-6))).abs() < 1e-5);
}

#[test]
fn test_layer_norm_constant_row_is_finite() {
    let mut norm = LayerNorm::new(4);
    let input = Array2::from_elem((2, 4), 3.0);
    let out = norm.forward(&input);
    let grad = norm.backward(&Array2::ones((2, 4)));
    assert!(out.iter().all(|v| v.abs() < 1e-6));
    assert!(grad.iter().all(|v| v.is_finite()));
}

#[test]
fn test_feed_forward_gradients() {
    let mut rng = StdRng::seed_from_u64(2);
    let mut ff = FeedForward::new(4, 8, 0.0, &mut rng);
    let input = random_matrix(&mut rng, 3, 4);
    let weights = random_matrix(&mut rng, 3, 4);

    ff.forward(&input);
    let grad_input = ff.backward(&weights);
    let analytical_w1 = ff.linear_1.weight.grad[[2, 5]];

    for (i, j) in [(0, 1), (2, 3)] {
        let mut plus = input.clone();
        plus[[i, j]] += EPSILON;
        let mut minus = input.clone();
        minus[[i, j]] -= EPSILON;
        let numerical = (weighted_sum(&ff.forward(&plus), &weights)
            - weighted_sum(&ff.forward(&minus), &weights))
            / (2.0 * EPSILON);
        assert_close(numerical, grad_input[[i, j]], &format!("FeedForward x[{},{}]", i, j));
    }

    let original = ff.linear_1.weight.value[[2, 5]];
    ff.linear_1.weight.value[[2, 5]] = original + EPSILON;
    let loss_plus = weighted_sum(&ff.forward(&input), &weights);
    ff.linear_1.weight.value[[2, 5]] = original - EPSILON;
    let loss_minus = weighted_sum(&ff.forward(&input), &weights);
    assert_close(
        (loss_plus - loss_minus) / (2.0 * EPSILON),
        analytical_w1,
        "FeedForward W1[2,5]",
    );
}

fn tiny_config() -> TrainingConfig {
    TrainingConfig {
        d_model: 8,
        n_layers: 2,
        heads: 2,
        d_ff: 16,
        dropout: 0.0,
        seqlen: 5,
        max_seq_len: 16,
        vocab_size: 12,
        ..TrainingConfig::default()
    }
}

fn perturb(model: &mut Transformer, name: &str, index: (usize, usize), delta: f32) {
    model.visit_parameters_mut("", &mut |param_name, param| {
        if param_name == name {
            param.value[[index.0, index.1]] += delta;
        }
    });
}

fn grad_of(model: &Transformer, name: &str, index: (usize, usize)) -> f32 {
    let mut value = f32::NAN;
    model.visit_parameters("", &mut |param_name, param| {
        if param_name == name {
            value = param.grad[[index.0, index.1]];
        }
    });
    value
}

#[test]
fn test_full_model_parameter_gradients() {
    let config = tiny_config();
    let mut rng = StdRng::seed_from_u64(config.seed);
    let mut model = Transformer::new(&config, config.vocab_size, &mut rng).unwrap();

    let inputs = [3usize, 7, 1, 7];
    let targets = [7usize, 1, 7, 0];
    let mask = CausalMask::new(inputs.len());

    model.zero_grad();
    let logits = model.forward(&inputs, &mask).unwrap();
    let (_, grads) = cross_entropy_with_grad(&logits, &targets, 1.0 / targets.len() as f32);
    model.backward(&grads);

    let checks = [
        ("out.weight", (2, 7)),
        ("decoder.norm.alpha", (0, 3)),
        ("decoder.layers.1.ff.linear_2.weight", (4, 1)),
        ("decoder.layers.0.attn_2.v_linear.weight", (0, 5)),
        ("decoder.layers.0.attn_1.q_linear.bias", (0, 2)),
        ("decoder.layers.0.norm_1.bias", (0, 6)),
        ("decoder.embed.weight", (7, 4)),
    ];

    for (name, index) in checks {
        let analytical = grad_of(&model, name, index);

        perturb(&mut model, name, index, EPSILON);
        let loss_plus = cross_entropy_loss(&model.forward(&inputs, &mask).unwrap(), &targets);
        perturb(&mut model, name, index, -2.0 * EPSILON);
        let loss_minus = cross_entropy_loss(&model.forward(&inputs, &mask).unwrap(), &targets);
        perturb(&mut model, name, index, EPSILON);

        let numerical = ((loss_plus - loss_minus) / (2.0 * EPSILON as f64)) as f32;
        assert_close(numerical, analytical, name);
    }
}
