// ============================================================================
// 参数快照序列化 - 支持二进制和 JSON 两种格式
// ============================================================================
//
// 快照只包含按名字索引的可训练参数（不含优化器状态），可以加载进一个
// 结构完全相同（vocab_size、d_model、N、heads、d_ff）的新模型:
//
// 1. **二进制格式** (默认):
//    - 使用 bincode 序列化,文件小、速度快
//    - 文件扩展名: .bin
//
// 2. **JSON 格式** (调试用):
//    - 人类可读,方便检查权重
//    - 文件扩展名: .json
//
// 保存路径的父目录由调用方负责创建。
// ============================================================================

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter};
use std::path::Path;

use bincode::{Decode, Encode};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

use crate::{
    error::{LmError, Result},
    linear::Parameterized,
};

pub const SNAPSHOT_VERSION: u32 = 1;

/// 单个参数矩阵：形状 + 行优先数据
#[derive(Clone, Debug, PartialEq, Encode, Decode, Serialize, Deserialize)]
pub struct SerializedTensor {
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl SerializedTensor {
    pub fn from_array(array: &Array2<f32>) -> Self {
        Self {
            shape: array.shape().to_vec(),
            data: array.iter().copied().collect(),
        }
    }

    pub fn to_array(&self) -> Result<Array2<f32>> {
        let (rows, cols) = match self.shape.as_slice() {
            [rows, cols] => (*rows, *cols),
            _ => {
                return Err(LmError::Serialization(format!(
                    "expected a 2-D tensor, found shape {:?}",
                    self.shape
                )));
            }
        };
        Array2::from_shape_vec((rows, cols), self.data.clone())
            .map_err(|e| LmError::Serialization(e.to_string()))
    }
}

/// 模型参数快照（相当于 state dict）
#[derive(Clone, Debug, Encode, Decode, Serialize, Deserialize)]
pub struct ParameterSnapshot {
    pub version: u32,
    /// RFC 3339 时间戳
    pub saved_at: String,
    pub tensors: BTreeMap<String, SerializedTensor>,
}

impl ParameterSnapshot {
    pub fn from_model<M: Parameterized>(model: &M) -> Self {
        let mut tensors = BTreeMap::new();
        model.visit_parameters("", &mut |name, param| {
            tensors.insert(name, SerializedTensor::from_array(&param.value));
        });

        Self {
            version: SNAPSHOT_VERSION,
            saved_at: chrono::Local::now().to_rfc3339(),
            tensors,
        }
    }

    pub fn parameter_count(&self) -> usize {
        self.tensors.values().map(|t| t.data.len()).sum()
    }

    /// **严格加载**：每个模型参数都必须存在且形状一致，快照中也不能有多余参数。
    ///
    /// 先完整校验再写入，校验失败时模型保持不变。
    pub fn load_into<M: Parameterized>(&self, model: &mut M) -> Result<()> {
        let mut expected: Vec<(String, Vec<usize>)> = Vec::new();
        model.visit_parameters("", &mut |name, param| {
            expected.push((name, param.value.shape().to_vec()));
        });

        for (name, shape) in &expected {
            let tensor = self
                .tensors
                .get(name)
                .ok_or_else(|| LmError::MissingParameter(name.clone()))?;
            if &tensor.shape != shape || tensor.data.len() != shape.iter().product::<usize>() {
                return Err(LmError::ShapeMismatch {
                    name: name.clone(),
                    expected: shape.clone(),
                    found: tensor.shape.clone(),
                });
            }
        }

        if let Some(extra) = self
            .tensors
            .keys()
            .find(|key| !expected.iter().any(|(name, _)| name == *key))
        {
            return Err(LmError::UnexpectedParameter(extra.clone()));
        }

        let mut arrays = BTreeMap::new();
        for (name, _) in &expected {
            if let Some(tensor) = self.tensors.get(name) {
                arrays.insert(name.clone(), tensor.to_array()?);
            }
        }

        model.visit_parameters_mut("", &mut |name, param| {
            if let Some(array) = arrays.remove(&name) {
                param.value = array;
                param.zero_grad();
                param.optimizer.reset();
            }
        });

        Ok(())
    }
}

// ============================================================================
// 主要 API
// ============================================================================

/// 保存快照到二进制文件
pub fn save_binary<P: AsRef<Path>>(snapshot: &ParameterSnapshot, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| LmError::io(path, e))?;
    let mut writer = BufWriter::new(file);

    let config = bincode::config::standard();
    bincode::encode_into_std_write(snapshot, &mut writer, config)
        .map_err(|e| LmError::Serialization(e.to_string()))?;

    log::info!(
        "参数快照已保存: {} ({} 个张量, {} 个参数)",
        path.display(),
        snapshot.tensors.len(),
        snapshot.parameter_count()
    );
    Ok(())
}

/// 从二进制文件加载快照
pub fn load_binary<P: AsRef<Path>>(path: P) -> Result<ParameterSnapshot> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| LmError::io(path, e))?;
    let mut reader = BufReader::new(file);

    let config = bincode::config::standard();
    let snapshot: ParameterSnapshot = bincode::decode_from_std_read(&mut reader, config)
        .map_err(|e| LmError::Serialization(format!("{}: {e}", path.display())))?;

    log::info!(
        "参数快照已加载: {} (版本 {}, 保存于 {})",
        path.display(),
        snapshot.version,
        snapshot.saved_at
    );
    Ok(snapshot)
}

/// 保存快照到 JSON 文件
pub fn save_json<P: AsRef<Path>>(snapshot: &ParameterSnapshot, path: P) -> Result<()> {
    let path = path.as_ref();
    let file = File::create(path).map_err(|e| LmError::io(path, e))?;
    let writer = BufWriter::new(file);

    serde_json::to_writer_pretty(writer, snapshot)
        .map_err(|e| LmError::Serialization(e.to_string()))?;

    log::info!("参数快照已保存: {}", path.display());
    Ok(())
}

/// 从 JSON 文件加载快照
pub fn load_json<P: AsRef<Path>>(path: P) -> Result<ParameterSnapshot> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| LmError::io(path, e))?;
    let reader = BufReader::new(file);

    let snapshot: ParameterSnapshot = serde_json::from_reader(reader)
        .map_err(|e| LmError::Serialization(format!("{}: {e}", path.display())))?;

    log::info!("参数快照已加载: {}", path.display());
    Ok(snapshot)
}

/// 训练开始前确认快照路径可写，避免训练结束后才发现无法保存。
///
/// 已存在的文件以追加方式打开（不截断内容）；不存在时创建后立即删除。
pub fn check_writable<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    if path.exists() {
        OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| LmError::io(path, e))?;
    } else {
        File::create(path).map_err(|e| LmError::io(path, e))?;
        fs::remove_file(path).map_err(|e| LmError::io(path, e))?;
    }
    Ok(())
}

/// `.json` 后缀按 JSON 处理，其余按二进制处理
pub fn save_snapshot_auto<P: AsRef<Path>>(snapshot: &ParameterSnapshot, path: P) -> Result<()> {
    if is_json(path.as_ref()) {
        save_json(snapshot, path)
    } else {
        save_binary(snapshot, path)
    }
}

/// 自动选择加载方法
pub fn load_snapshot_auto<P: AsRef<Path>>(path: P) -> Result<ParameterSnapshot> {
    if is_json(path.as_ref()) {
        load_json(path)
    } else {
        load_binary(path)
    }
}

fn is_json(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "json")
}
