//! # 余弦退火 + 热重启学习率调度（SGDR）
//!
//! 每个周期内学习率从基础值沿余弦曲线降到 `eta_min`：
//!
//! ```text
//! lr = eta_min + (base_lr - eta_min) / 2 · (cos(π · (t mod T) / T) + 1)
//! t  = step - last_restart
//! ```
//!
//! 当 `t mod T == 0` 时触发重启：周期长度乘以 `factor`（`T = ⌊cycle_factor · T_max⌋`，至少为 1），
//! 并把当前步记为新的重启点。
//!
//! 构造时会先查询一次学习率，这一次直接返回基础学习率；之后每次 [`CosineWithRestarts::step`]
//! 使用 `step = last_epoch + 1` 计算。调度器在每次优化器更新之后调用一次。

/// 单个周期位置上的学习率
pub fn cosine_annealing(base_lr: f32, eta_min: f32, cycle_counter: usize, cycle_len: usize) -> f32 {
    let cycle_len = cycle_len.max(1);
    let phase = std::f64::consts::PI * (cycle_counter % cycle_len) as f64 / cycle_len as f64;
    (eta_min as f64 + (base_lr as f64 - eta_min as f64) / 2.0 * (phase.cos() + 1.0)) as f32
}

#[derive(Clone, Debug)]
pub struct CosineWithRestarts {
    base_lrs: Vec<f32>,
    t_max: usize,
    eta_min: f32,
    factor: f32,
    last_epoch: i64,
    last_restart: usize,
    cycle_counter: usize,
    cycle_factor: f32,
    updated_cycle_len: usize,
    initialized: bool,
    current_lrs: Vec<f32>,
    last_step: usize,
}

impl CosineWithRestarts {
    /// `t_max`: 第一个周期的步数（本项目取每个 epoch 的训练 batch 数）
    pub fn new(base_lrs: Vec<f32>, t_max: usize, eta_min: f32, factor: f32) -> Self {
        let t_max = t_max.max(1);
        let mut scheduler = Self {
            current_lrs: base_lrs.clone(),
            base_lrs,
            t_max,
            eta_min,
            factor,
            last_epoch: -1,
            last_restart: 0,
            cycle_counter: 0,
            cycle_factor: 1.0,
            updated_cycle_len: t_max,
            initialized: false,
            last_step: 0,
        };
        scheduler.step();
        scheduler
    }

    pub fn step(&mut self) -> &[f32] {
        self.last_epoch += 1;
        self.current_lrs = self.get_lr();
        &self.current_lrs
    }

    fn get_lr(&mut self) -> Vec<f32> {
        if !self.initialized {
            self.initialized = true;
            return self.base_lrs.clone();
        }

        let step = (self.last_epoch + 1) as usize;
        self.last_step = step;
        self.cycle_counter = step - self.last_restart;

        let lrs = self
            .base_lrs
            .iter()
            .map(|&lr| cosine_annealing(lr, self.eta_min, self.cycle_counter, self.updated_cycle_len))
            .collect();

        if self.cycle_counter % self.updated_cycle_len == 0 {
            self.cycle_factor *= self.factor;
            self.cycle_counter = 0;
            self.updated_cycle_len = ((self.cycle_factor * self.t_max as f32) as usize).max(1);
            self.last_restart = step;
            log::debug!(
                "SGDR 重启于第 {} 步，新周期长度 {}",
                step,
                self.updated_cycle_len
            );
        }

        lrs
    }

    pub fn current_lrs(&self) -> &[f32] {
        &self.current_lrs
    }

    /// 第一组参数的当前学习率
    pub fn current_lr(&self) -> f32 {
        self.current_lrs.first().copied().unwrap_or(0.0)
    }

    /// 最近一次计算学习率时使用的步数（构造时的初始查询记为 0）
    pub fn last_step(&self) -> usize {
        self.last_step
    }

    pub fn cycle_len(&self) -> usize {
        self.updated_cycle_len
    }
}
