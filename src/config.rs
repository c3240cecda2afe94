//! # 训练配置
//!
//! 所有超参数集中在 [`TrainingConfig`]，可以从 JSON 文件加载（缺省字段取默认值），
//! 再由命令行 `--key=value` 覆盖。构建模型之前必须先调用 [`TrainingConfig::validate`]。

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_D_FF, DEFAULT_VOCAB_SIZE, MAX_POSITIONAL_LEN,
    error::{LmError, Result},
};

/// 计算设备。张量后端只支持 CPU，请求加速器会在启动时报错。
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub epochs: usize,
    pub d_model: usize,
    /// 解码器块数 N
    pub n_layers: usize,
    pub heads: usize,
    pub dropout: f32,
    pub batch_size: usize,
    pub learning_rate: f32,
    /// 窗口长度 L，模型实际看到 L - 1 个位置
    pub seqlen: usize,
    /// 是否启用余弦重启学习率调度
    pub sgdr: bool,
    pub loadname: Option<PathBuf>,
    pub savename: Option<PathBuf>,
    pub device: Device,

    pub d_ff: usize,
    pub seed: u64,
    pub vocab_size: usize,
    /// 位置编码表长度
    pub max_seq_len: usize,
    pub eta_min: f32,
    pub cycle_factor: f32,
    /// 每隔多少个 batch 打印一次训练困惑度
    pub printevery: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 20,
            d_model: 512,
            n_layers: 6,
            heads: 8,
            dropout: 0.1,
            batch_size: 3,
            learning_rate: 1e-5,
            seqlen: 512,
            sgdr: false,
            loadname: None,
            savename: None,
            device: Device::Cpu,
            d_ff: DEFAULT_D_FF,
            seed: 10,
            vocab_size: DEFAULT_VOCAB_SIZE,
            max_seq_len: MAX_POSITIONAL_LEN,
            eta_min: 0.0,
            cycle_factor: 1.0,
            printevery: 100,
        }
    }
}

impl TrainingConfig {
    /// 启动时校验，任何一项不满足都是致命错误
    pub fn validate(&self) -> Result<()> {
        let require = |ok: bool, msg: String| if ok { Ok(()) } else { Err(LmError::Config(msg)) };

        require(self.heads > 0, "heads must be positive".to_string())?;
        require(
            self.d_model > 0 && self.d_model % self.heads == 0,
            format!(
                "d_model ({}) must be divisible by heads ({})",
                self.d_model, self.heads
            ),
        )?;
        require(
            self.d_model % 2 == 0,
            format!("d_model ({}) must be even for sinusoidal encoding", self.d_model),
        )?;
        require(
            (0.0..1.0).contains(&self.dropout),
            format!("dropout ({}) must be in [0, 1)", self.dropout),
        )?;
        require(self.epochs > 0, "epochs must be positive".to_string())?;
        require(self.batch_size > 0, "batch_size must be positive".to_string())?;
        require(self.n_layers > 0, "n_layers must be positive".to_string())?;
        require(self.d_ff > 0, "d_ff must be positive".to_string())?;
        require(self.vocab_size > 0, "vocab_size must be positive".to_string())?;
        require(
            self.seqlen >= 2,
            format!("seqlen ({}) must be at least 2", self.seqlen),
        )?;
        require(
            self.seqlen - 1 <= self.max_seq_len,
            format!(
                "seqlen - 1 ({}) exceeds the positional table ({})",
                self.seqlen - 1,
                self.max_seq_len
            ),
        )?;
        require(
            self.learning_rate.is_finite() && self.learning_rate > 0.0,
            format!("learning_rate ({}) must be positive", self.learning_rate),
        )?;
        require(
            self.cycle_factor.is_finite() && self.cycle_factor > 0.0,
            format!("cycle_factor ({}) must be positive", self.cycle_factor),
        )?;

        match self.device {
            Device::Cpu => Ok(()),
            Device::Accelerator(index) => Err(LmError::DeviceUnavailable(format!(
                "accelerator {index} requested but only the CPU backend is available"
            ))),
        }
    }

    /// 模型每次前向传播的序列长度（窗口长度减一）
    pub fn context_len(&self) -> usize {
        self.seqlen.saturating_sub(1)
    }
}

/// 从 JSON 文件读取配置
pub fn load_config(path: impl AsRef<Path>) -> Result<TrainingConfig> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| LmError::io(path, e))?;
    serde_json::from_str(&text).map_err(|e| LmError::Serialization(format!("{}: {e}", path.display())))
}
