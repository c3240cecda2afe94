//! # 因果掩码（Causal Mask）
//!
//! 生成文本时模型不能看到未来的词：位置 i 只能关注 j ≤ i 的位置。
//!
//! ```text
//!    位置0 位置1 位置2 位置3
//! 0  [  √    ×    ×    ×  ]
//! 1  [  √    √    ×    ×  ]
//! 2  [  √    √    √    ×  ]
//! 3  [  √    √    √    √  ]
//! ```
//!
//! 掩码在每个训练/评估循环开始时按固定尺寸（窗口长度 - 1）构建一次，之后复用。

use ndarray::Array2;

#[derive(Clone, Debug, PartialEq)]
pub struct CausalMask {
    allowed: Array2<bool>,
}

impl CausalMask {
    pub fn new(size: usize) -> Self {
        Self {
            allowed: Array2::from_shape_fn((size, size), |(i, j)| j <= i),
        }
    }

    pub fn size(&self) -> usize {
        self.allowed.nrows()
    }

    /// 越界位置视为被屏蔽
    pub fn is_allowed(&self, i: usize, j: usize) -> bool {
        self.allowed.get([i, j]).copied().unwrap_or(false)
    }

    /// 允许的位置数，应等于 n(n+1)/2
    pub fn allowed_count(&self) -> usize {
        self.allowed.iter().filter(|&&a| a).count()
    }

    pub fn as_array(&self) -> &Array2<bool> {
        &self.allowed
    }
}
