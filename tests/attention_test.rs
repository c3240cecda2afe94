/// 注意力机制测试
///
/// 1. softmax 权重每行和为 1，被屏蔽位置权重严格为 0
/// 2. d_model 不能被 heads 整除时拒绝构建
/// 3. 与数值梯度对比验证多头注意力的反向传播
/// 4. 大数值输入下的数值稳定性
use approx::assert_abs_diff_eq;
use decoder_lm::{
    attention::{scaled_dot_product_attention, MultiHeadAttention},
    CausalMask, LmError,
};
use ndarray::Array2;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// 数值梯度检查使用的扰动大小
const EPSILON: f32 = 1e-3;
/// 相对误差允许范围
const REL_TOLERANCE: f32 = 0.05;

fn random_matrix(rng: &mut StdRng, rows: usize, cols: usize, scale: f32) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| rng.random_range(-scale..scale))
}

#[test]
fn test_masked_softmax_rows_sum_to_one() {
    let mut rng = StdRng::seed_from_u64(42);
    let (seq_len, d_k) = (6, 4);
    let q = random_matrix(&mut rng, seq_len, d_k, 2.0);
    let k = random_matrix(&mut rng, seq_len, d_k, 2.0);
    let v = random_matrix(&mut rng, seq_len, d_k, 2.0);
    let mask = CausalMask::new(seq_len);

    let attention = scaled_dot_product_attention(q.view(), k.view(), v.view(), Some(&mask), None);

    for (i, row) in attention.weights.rows().into_iter().enumerate() {
        assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-5);
        for j in (i + 1)..seq_len {
            assert_eq!(row[j], 0.0, "位置 ({}, {}) 应被屏蔽", i, j);
        }
    }

    // 第一个位置只能看到自己
    for c in 0..d_k {
        assert_abs_diff_eq!(attention.output[[0, c]], v[[0, c]], epsilon = 1e-6);
    }
}

#[test]
fn test_unmasked_attention_matches_formula() {
    let q = Array2::from_shape_vec((2, 2), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
    let k = q.clone();
    let v = Array2::from_shape_vec((2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();

    let attention = scaled_dot_product_attention(q.view(), k.view(), v.view(), None, None);

    let s = 1.0 / 2f32.sqrt();
    let p = s.exp() / (s.exp() + 1.0);
    assert_abs_diff_eq!(attention.weights[[0, 0]], p, epsilon = 1e-6);
    assert_abs_diff_eq!(attention.output[[0, 0]], p * 1.0 + (1.0 - p) * 3.0, epsilon = 1e-5);
}

#[test]
fn test_rejects_indivisible_heads() {
    let mut rng = StdRng::seed_from_u64(0);
    assert!(matches!(
        MultiHeadAttention::new(10, 3, 0.0, &mut rng),
        Err(LmError::Config(_))
    ));
    assert!(matches!(
        MultiHeadAttention::new(8, 0, 0.0, &mut rng),
        Err(LmError::Config(_))
    ));
    assert!(MultiHeadAttention::new(8, 2, 0.0, &mut rng).is_ok());
}

#[test]
fn test_multi_head_output_shape_and_causality() {
    let mut rng = StdRng::seed_from_u64(5);
    let mut attention = MultiHeadAttention::new(8, 2, 0.0, &mut rng).unwrap();
    let mask = CausalMask::new(4);
    let x = random_matrix(&mut rng, 4, 8, 1.0);

    let out = attention.forward(&x, &x, &x, Some(&mask));
    assert_eq!(out.dim(), (4, 8));

    // 修改最后一个位置不影响前面位置的输出
    let mut x_changed = x.clone();
    x_changed.row_mut(3).fill(5.0);
    let out_changed = attention.forward(&x_changed, &x_changed, &x_changed, Some(&mask));
    for i in 0..3 {
        for c in 0..8 {
            assert_abs_diff_eq!(out[[i, c]], out_changed[[i, c]], epsilon = 1e-5);
        }
    }
}

/// 基于均方误差的简易损失函数
fn compute_mse_loss(output: &Array2<f32>, target: &Array2<f32>) -> f32 {
    let diff = output - target;
    diff.mapv(|x| x * x).sum() / (output.len() as f32)
}

fn self_attention_loss(
    attention: &mut MultiHeadAttention,
    input: &Array2<f32>,
    target: &Array2<f32>,
    mask: &CausalMask,
) -> f32 {
    let output = attention.forward(input, input, input, Some(mask));
    compute_mse_loss(&output, target)
}

#[test]
fn test_gradient_matches_numerical_estimate() {
    let (seq_len, d_model) = (4, 8);
    let mut rng = StdRng::seed_from_u64(11);
    let mut attention = MultiHeadAttention::new(d_model, 2, 0.0, &mut rng).unwrap();
    let mask = CausalMask::new(seq_len);

    let input = random_matrix(&mut rng, seq_len, d_model, 1.0);
    let target = Array2::ones((seq_len, d_model)) * 0.5;

    let output = attention.forward(&input, &input, &input, Some(&mask));
    let grad_output = (&output - &target) * (2.0 / output.len() as f32);
    let (gq, gk, gv) = attention.backward(&grad_output);
    let grad_input = gq + gk + gv;

    for (i, j) in [(0, 0), (1, d_model / 2), (seq_len - 1, d_model - 1), (2, 3)] {
        let mut plus = input.clone();
        plus[[i, j]] += EPSILON;
        let mut minus = input.clone();
        minus[[i, j]] -= EPSILON;
        let numerical = (self_attention_loss(&mut attention, &plus, &target, &mask)
            - self_attention_loss(&mut attention, &minus, &target, &mask))
            / (2.0 * EPSILON);
        let analytical = grad_input[[i, j]];

        let abs_err = (numerical - analytical).abs();
        let rel_err = abs_err / numerical.abs().max(1e-5);
        assert!(
            rel_err <= REL_TOLERANCE || abs_err < 1e-3,
            "梯度验证失败: idx=({},{}) 数值梯度={:.6} 解析梯度={:.6}",
            i,
            j,
            numerical,
            analytical
        );
    }
}

#[test]
fn test_weight_gradient_matches_numerical_estimate() {
    let (seq_len, d_model) = (3, 4);
    let mut rng = StdRng::seed_from_u64(23);
    let mut attention = MultiHeadAttention::new(d_model, 2, 0.0, &mut rng).unwrap();
    let mask = CausalMask::new(seq_len);

    let input = random_matrix(&mut rng, seq_len, d_model, 1.0);
    let target = Array2::zeros((seq_len, d_model));

    let output = attention.forward(&input, &input, &input, Some(&mask));
    let grad_output = (&output - &target) * (2.0 / output.len() as f32);
    attention.backward(&grad_output);
    let analytical = attention.q_linear.weight.grad[[1, 2]];

    let original = attention.q_linear.weight.value[[1, 2]];
    attention.q_linear.weight.value[[1, 2]] = original + EPSILON;
    let loss_plus = self_attention_loss(&mut attention, &input, &target, &mask);
    attention.q_linear.weight.value[[1, 2]] = original - EPSILON;
    let loss_minus = self_attention_loss(&mut attention, &input, &target, &mask);
    let numerical = (loss_plus - loss_minus) / (2.0 * EPSILON);

    assert!(
        (numerical - analytical).abs() < 1e-3 + REL_TOLERANCE * numerical.abs(),
        "W_q 梯度: 数值={:.6} 解析={:.6}",
        numerical,
        analytical
    );
}

#[test]
fn test_gradient_stability_large_values() {
    let (seq_len, d_model) = (4, 16);
    let mut rng = StdRng::seed_from_u64(3);
    let mut attention = MultiHeadAttention::new(d_model, 4, 0.0, &mut rng).unwrap();
    let mask = CausalMask::new(seq_len);

    let input = Array2::from_shape_fn((seq_len, d_model), |(i, j)| {
        200.0 + (i as f32) * 10.0 + (j as f32) * 0.1
    });

    let output = attention.forward(&input, &input, &input, Some(&mask));
    let (gq, gk, gv) = attention.backward(&Array2::ones(output.dim()));

    assert!(output.iter().all(|v| v.is_finite()), "前向输出出现非有限值");
    for grad in [gq, gk, gv] {
        assert!(grad.iter().all(|v| v.is_finite()), "梯度出现非有限值");
    }
}
