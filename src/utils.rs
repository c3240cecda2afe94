/// 工具函数模块
///
/// 包含 softmax、log-softmax 与参数初始化等通用工具
use ndarray::Array2;
use rand::Rng;
use rand_distr::{Distribution, Uniform};

// Softmax专用的epsilon常量（避免除零）
const SOFTMAX_EPS: f32 = 1e-12;

/// Softmax激活函数
///
/// 对输入张量的每一行应用softmax，将数值转换为概率分布。
/// 使用数值稳定的实现（减去最大值避免溢出）。
///
/// # 参数
/// - `logits`: 输入张量，形状为 (rows, num_classes)
///
/// # 返回
/// Softmax输出，形状与输入相同，每行元素和为1
pub fn softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();

    for mut row in result.rows_mut() {
        // 找到该行的最大值（用于数值稳定）
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        // 计算exp(x - max)
        row.mapv_inplace(|x| (x - max_val).exp());

        // 归一化
        let sum_exp: f32 = row.sum();
        row.mapv_inplace(|x| x / sum_exp.max(SOFTMAX_EPS));
    }

    result
}

/// 逐行 log-softmax：`x - max - ln(Σ exp(x - max))`
///
/// 交叉熵直接使用它，避免对接近 0 的概率取对数。
pub fn log_softmax(logits: &Array2<f32>) -> Array2<f32> {
    let mut result = logits.clone();

    for mut row in result.rows_mut() {
        let max_val = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let log_sum_exp = row.iter().map(|&x| (x - max_val).exp()).sum::<f32>().ln();
        row.mapv_inplace(|x| x - max_val - log_sum_exp);
    }

    result
}

/// Xavier（Glorot）均匀初始化：U(-a, a)，a = sqrt(6 / (fan_in + fan_out))
///
/// 矩阵形状为 (fan_in, fan_out)，与本项目 `x · W` 的乘法方向一致。
pub fn xavier_uniform<R: Rng>(rng: &mut R, fan_in: usize, fan_out: usize) -> Array2<f32> {
    let bound = (6.0 / (fan_in + fan_out) as f32).sqrt();
    match Uniform::new_inclusive(-bound, bound) {
        Ok(dist) => Array2::from_shape_fn((fan_in, fan_out), |_| dist.sample(rng)),
        Err(e) => {
            log::warn!("Xavier 初始化分布构建失败（{}），改用 random_range", e);
            Array2::from_shape_fn((fan_in, fan_out), |_| rng.random_range(-bound..=bound))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    #[test]
    fn test_softmax_basic() {
        let input = Array2::from_shape_vec((2, 3), vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let output = softmax(&input);

        // 检查每行和为1
        for row in output.rows() {
            let sum: f32 = row.sum();
            assert!(
                (sum - 1.0).abs() < 1e-6,
                "Row sum should be 1.0, got {}",
                sum
            );
        }

        for &val in output.iter() {
            assert!((0.0..=1.0).contains(&val), "Value should be in [0, 1], got {}", val);
        }
    }

    #[test]
    fn test_softmax_numerical_stability() {
        // 测试大数值的稳定性
        let input = Array2::from_shape_vec((1, 3), vec![1000.0, 1001.0, 1002.0]).unwrap();
        let output = softmax(&input);

        for &val in output.iter() {
            assert!(val.is_finite(), "Value should be finite, got {}", val);
        }
    }

    #[test]
    fn test_log_softmax_matches_ln_of_softmax() {
        let input = Array2::from_shape_vec((1, 4), vec![0.5, -1.0, 2.0, 0.0]).unwrap();
        let log_probs = log_softmax(&input);
        let probs = softmax(&input);
        for (lp, p) in log_probs.iter().zip(probs.iter()) {
            assert!((lp - p.ln()).abs() < 1e-5);
        }
    }

    #[test]
    fn test_xavier_uniform_bounds() {
        let mut rng = StdRng::seed_from_u64(7);
        let w = xavier_uniform(&mut rng, 8, 24);
        let bound = (6.0f32 / 32.0).sqrt();
        assert_eq!(w.dim(), (8, 24));
        assert!(w.iter().all(|&x| x.abs() <= bound));
    }
}
