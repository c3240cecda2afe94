//! # 语料读取、定长切分与批次加载
//!
//! ```text
//! 文本文件 ──Tokenizer──▶ 扁平 token 序列 ──切分──▶ (窗口数, L) ──BatchLoader──▶ 批次
//! ```
//!
//! - 切分：`floor(len / L)` 个不重叠的长度为 L 的窗口，余数丢弃
//! - 每个窗口拆成 `input = w[0..L-1]`、`target = w[1..L]`
//! - 批次：每轮完全打乱（无放回），最后不足一个 batch 的部分丢弃

use std::fs;
use std::path::Path;

use ndarray::{Array2, ArrayView1};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;

use crate::{
    error::{LmError, Result},
    vocab::Tokenizer,
};

/// 逐行读取文本文件（去掉换行符）
pub fn read_lines<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| LmError::io(path, e))?;
    Ok(text.lines().map(str::to_string).collect())
}

/// 读取语料并用 `tokenizer` 逐行编码，拼接成一个扁平序列
pub fn read_corpus<P, T>(path: P, tokenizer: &T) -> Result<Vec<usize>>
where
    P: AsRef<Path>,
    T: Tokenizer + ?Sized,
{
    let path = path.as_ref();
    let mut seq = Vec::new();
    for line in read_lines(path)? {
        seq.extend(tokenizer.encode(&line));
    }
    log::info!("读取语料 {}: {} 个 token", path.display(), seq.len());
    Ok(seq)
}

/// 读取预先分词好的语料：以空白分隔的整数 token ID
pub fn read_token_file<P: AsRef<Path>>(path: P) -> Result<Vec<usize>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path).map_err(|e| LmError::io(path, e))?;

    let mut seq = Vec::new();
    for (line_idx, line) in text.lines().enumerate() {
        for token in line.split_whitespace() {
            let id = token.parse::<usize>().map_err(|_| LmError::InvalidToken {
                path: path.to_path_buf(),
                line: line_idx + 1,
                token: token.to_string(),
            })?;
            seq.push(id);
        }
    }
    log::info!("读取 token 文件 {}: {} 个 token", path.display(), seq.len());
    Ok(seq)
}

/// 切分成 `(len / seq_len, seq_len)` 的窗口矩阵（行优先，余数丢弃）
pub fn create_fixed_length_sequences(tokens: &[usize], seq_len: usize) -> Array2<usize> {
    if seq_len == 0 {
        return Array2::zeros((0, 0));
    }
    let num_windows = tokens.len() / seq_len;
    Array2::from_shape_fn((num_windows, seq_len), |(i, j)| tokens[i * seq_len + j])
}

/// 一个窗口按一位偏移拆成 (input, target)
pub fn split_window(window: ArrayView1<usize>) -> (Vec<usize>, Vec<usize>) {
    let len = window.len();
    if len < 2 {
        return (Vec::new(), Vec::new());
    }
    let tokens: Vec<usize> = window.iter().copied().collect();
    (tokens[..len - 1].to_vec(), tokens[1..].to_vec())
}

/// 按批次提供窗口索引
pub struct BatchLoader {
    windows: Array2<usize>,
    batch_size: usize,
    shuffle: bool,
    drop_last: bool,
    rng: StdRng,
}

impl BatchLoader {
    pub fn new(
        windows: Array2<usize>,
        batch_size: usize,
        shuffle: bool,
        drop_last: bool,
        seed: u64,
    ) -> Self {
        Self {
            windows,
            batch_size: batch_size.max(1),
            shuffle,
            drop_last,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn num_windows(&self) -> usize {
        self.windows.nrows()
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// 每轮产生的批次数
    pub fn num_batches(&self) -> usize {
        if self.drop_last {
            self.num_windows() / self.batch_size
        } else {
            self.num_windows().div_ceil(self.batch_size)
        }
    }

    pub fn window(&self, index: usize) -> ArrayView1<'_, usize> {
        self.windows.row(index)
    }

    /// 生成一轮的批次（窗口索引列表）。开启 `shuffle` 时每次调用都重新打乱。
    pub fn batches(&mut self) -> Vec<Vec<usize>> {
        let mut indices: Vec<usize> = (0..self.num_windows()).collect();
        if self.shuffle {
            indices.shuffle(&mut self.rng);
        }

        let dropped = if self.drop_last {
            self.num_windows() % self.batch_size
        } else {
            0
        };
        if dropped > 0 {
            log::warn!(
                "{} 个窗口不足一个 batch（batch_size={}），本轮丢弃",
                dropped,
                self.batch_size
            );
        }

        indices
            .chunks(self.batch_size)
            .filter(|chunk| !self.drop_last || chunk.len() == self.batch_size)
            .map(<[usize]>::to_vec)
            .collect()
    }
}
