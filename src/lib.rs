//! # decoder-lm - 从零实现的仅解码器 Transformer 语言模型训练器
//!
//! 纯 Rust 实现：不依赖深度学习框架，只使用 `ndarray` 做矩阵运算，
//! 所有组件（多头注意力、位置编码、归一化、前馈网络）的前向和反向传播都手工实现。
//!
//! ## 数据流
//!
//! ```text
//! token 序列 → 定长窗口 → 词嵌入 + 位置编码 → N 个解码器块（因果自注意力 + 前馈）
//!            → 最终归一化 → 输出投影 → logits → 交叉熵 → 困惑度
//! ```
//!
//! ## 模块组织
//!
//! ### 核心模型组件
//! - `llm`: 语言模型（解码器栈 + 输出投影）、`Layer` 接口与交叉熵
//! - `transformer`: 解码器块与解码器栈
//! - `attention`: 缩放点积注意力与多头注意力
//! - `mask`: 因果掩码
//!
//! ### 神经网络层
//! - `embeddings`: 词嵌入层（token embedding × √d_model + 位置编码 + dropout）
//! - `feed_forward`: 前馈神经网络（FFN）
//! - `layer_norm`: 可学习的归一化层
//! - `dropout`: Dropout 正则化层
//! - `linear`: 全连接层与可训练参数
//! - `output_projection`: 输出投影层（映射到词汇表）
//!
//! ### 训练
//! - `training`: 训练/验证/测试循环与困惑度统计
//! - `lr_scheduler`: 余弦退火 + 热重启学习率
//! - `adam`: Adam 优化器
//!
//! ### 工具模块
//! - `config`: 训练配置与校验
//! - `dataset`: 语料读取、定长切分与批次加载
//! - `vocab`: 分词接口与词级词表
//! - `position_encoding`: 正弦位置编码
//! - `model_serialization`: 参数快照的保存和加载
//! - `error`: 错误类型
//! - `utils`: 通用工具函数

// ============================================================================
// 模块声明
// ============================================================================

pub mod adam; // Adam 优化器
pub mod attention; // 缩放点积注意力与多头注意力
pub mod config; // 训练配置
pub mod dataset; // 语料读取与批次加载
pub mod dropout; // Dropout层：随机丢弃神经元，防止过拟合
pub mod embeddings; // 嵌入层：将token ID转换为稠密向量表示
pub mod error; // 错误类型
pub mod feed_forward; // 前馈网络
pub mod layer_norm; // 归一化层
pub mod linear; // 全连接层与可训练参数
pub mod llm; // 语言模型主类
pub mod lr_scheduler; // 学习率调度
pub mod mask; // 因果掩码
pub mod model_serialization; // 参数快照
pub mod output_projection; // 输出投影层
pub mod position_encoding; // 位置编码：为序列注入位置信息
pub mod training; // 训练/评估循环
pub mod transformer; // 解码器块与解码器栈
pub mod utils; // 工具函数
pub mod vocab; // 分词接口与词表

// ============================================================================
// 重导出核心类型（简化外部使用）
// ============================================================================

pub use attention::{scaled_dot_product_attention, MultiHeadAttention};
pub use config::{load_config, Device, TrainingConfig};
pub use dataset::{create_fixed_length_sequences, read_corpus, read_token_file, BatchLoader};
pub use embeddings::Embeddings;
pub use error::{LmError, Result};
pub use linear::Parameterized;
pub use llm::{get_model, Layer, Transformer};
pub use lr_scheduler::CosineWithRestarts;
pub use mask::CausalMask;
pub use model_serialization::{
    check_writable, load_snapshot_auto, save_snapshot_auto, ParameterSnapshot,
};
pub use output_projection::OutputProjection;
pub use training::{evaluate, test_model, train_model, LossAccumulator, TrainingHistory};
pub use transformer::{DecoderOnlyBlock, DecoderOnlyStack};
pub use vocab::{Tokenizer, Vocab};

// ============================================================================
// 模型超参数默认值
// ============================================================================

/// **前馈网络隐藏层维度**：d_model → 2048 → d_model
pub const DEFAULT_D_FF: usize = 2048;

/// **默认词汇表大小**：GPT-2 BPE 的词表大小
pub const DEFAULT_VOCAB_SIZE: usize = 50257;

/// **位置编码支持的最大长度**
///
/// 位置编码在初始化时预计算 0..MAX_POSITIONAL_LEN-1 的所有位置值，前向传播时按实际长度切片。
pub const MAX_POSITIONAL_LEN: usize = 4096;

// ============================================================================
// 数值稳定性常量 (Numerical Stability Constants)
// ============================================================================

/// **归一化层常量**：加在标准差上，避免整行取值相同时除零
pub const NORM_EPSILON: f32 = 1e-6;

/// **注意力掩码填充值**
///
/// 被屏蔽位置的分数设为 -1e9 而不是 -∞：整行都被屏蔽时 softmax 仍然有限，
/// 正常情况下 `exp(-1e9 - max)` 在 f32 中恰好下溢为 0。
pub const MASK_FILL: f32 = -1e9;
