//! # 错误类型
//!
//! 训练脚本中所有失败都是致命的：配置错误、设备不可用、空数据导致的困惑度无法计算、
//! 以及文件读写失败。它们统一为 [`LmError`]，沿调用链向上传播，不做任何重试。

use std::path::PathBuf;

use thiserror::Error;

/// 训练/评估过程中的错误
#[derive(Debug, Error)]
pub enum LmError {
    /// 配置非法（d_model 不能被 heads 整除、dropout ≥ 1 等），必须在训练开始前终止
    #[error("configuration error: {0}")]
    Config(String),

    /// 参数快照与模型形状不一致
    #[error("shape mismatch for `{name}`: expected {expected:?}, found {found:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    /// 快照中缺少模型需要的参数
    #[error("snapshot is missing parameter `{0}`")]
    MissingParameter(String),

    /// 快照中包含模型不存在的参数
    #[error("snapshot contains unexpected parameter `{0}`")]
    UnexpectedParameter(String),

    /// 请求的加速设备不可用
    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    /// 一次遍历中没有任何 token，困惑度无定义
    #[error("{0} pass contains zero tokens; perplexity is undefined")]
    EmptyPass(&'static str),

    /// 语料中出现无法解析的 token
    #[error("invalid token `{token}` at {path}:{line}")]
    InvalidToken {
        path: PathBuf,
        line: usize,
        token: String,
    },

    /// 文件读写失败，携带出错路径
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 序列化/反序列化失败（bincode 或 JSON）
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl LmError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        LmError::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LmError>;
