// 分片吞吐统计
//
// 每个上传会话内嵌一个 SpeedTracker：
// - 每个分片写入完成后记录一次样本（Mbps）
// - 滑动窗口（最近 10 个样本）计算平均速度
// - 至少 5 个样本后才计算波动率，之前保持未知
// - 根据平均速度和波动率给出网络状况分级

use serde::{Deserialize, Serialize};
use std::fmt;

use super::chunk::{
    CHUNK_SIZE_EXCELLENT, CHUNK_SIZE_FAIR, CHUNK_SIZE_GOOD, CHUNK_SIZE_POOR, CHUNK_SIZE_UNSTABLE,
    UNSTABLE_VARIANCE_PERCENT,
};

/// 滑动窗口大小
pub const SPEED_WINDOW: usize = 10;

/// 计算波动率所需的最少样本数
pub const MIN_VARIANCE_SAMPLES: usize = 5;

/// 网络状况分级
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum NetworkCondition {
    /// ≥ 100 Mbps
    Excellent,
    /// ≥ 50 Mbps
    Good,
    /// ≥ 20 Mbps
    Fair,
    /// < 20 Mbps
    Poor,
    /// 波动率 > 30%
    Unstable,
    /// 尚无样本
    Unknown,
}

impl NetworkCondition {
    /// 根据平均速度与波动率分级
    ///
    /// 波动率优先于速度：波动率 > 30% 时无论速度多高都判定为不稳定。
    /// 波动率未知时只按速度分级。
    pub fn from_metrics(average_mbps: Option<f64>, variance_percent: Option<f64>) -> Self {
        let Some(avg) = average_mbps else {
            return Self::Unknown;
        };

        if matches!(variance_percent, Some(v) if v > UNSTABLE_VARIANCE_PERCENT) {
            return Self::Unstable;
        }

        if avg >= 100.0 {
            Self::Excellent
        } else if avg >= 50.0 {
            Self::Good
        } else if avg >= 20.0 {
            Self::Fair
        } else {
            Self::Poor
        }
    }

    /// 无实时测量时的推荐分片大小（字节）
    pub fn recommended_chunk_size(&self) -> u64 {
        match self {
            Self::Excellent => CHUNK_SIZE_EXCELLENT,
            Self::Good => CHUNK_SIZE_GOOD,
            Self::Fair | Self::Unknown => CHUNK_SIZE_FAIR,
            Self::Poor => CHUNK_SIZE_POOR,
            Self::Unstable => CHUNK_SIZE_UNSTABLE,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Excellent => "EXCELLENT",
            Self::Good => "GOOD",
            Self::Fair => "FAIR",
            Self::Poor => "POOR",
            Self::Unstable => "UNSTABLE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for NetworkCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 速度统计快照
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SpeedStats {
    pub current_speed_mbps: Option<f64>,
    pub average_speed_mbps: Option<f64>,
    pub min_speed_mbps: Option<f64>,
    pub max_speed_mbps: Option<f64>,
    pub speed_variance_percent: Option<f64>,
    pub network_condition: NetworkCondition,
    pub sample_count: usize,
}

/// 单会话吞吐统计
#[derive(Debug, Clone, Default)]
pub struct SpeedTracker {
    /// 全部样本（只追加）
    samples: Vec<f64>,
    current: Option<f64>,
    min: Option<f64>,
    max: Option<f64>,
    average: Option<f64>,
    variance: Option<f64>,
}

impl SpeedTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录一个分片的传输样本
    ///
    /// `duration_ms` 为 0 时忽略（避免除零和时钟回拨），返回 None。
    /// 否则返回本次瞬时速度（Mbps）。
    pub fn record_sample(&mut self, bytes: u64, duration_ms: u64) -> Option<f64> {
        if duration_ms == 0 {
            return None;
        }

        let mbps = (bytes as f64 * 8.0) / (duration_ms as f64 * 1000.0);

        self.samples.push(mbps);
        self.current = Some(mbps);
        self.min = Some(self.min.map_or(mbps, |m| m.min(mbps)));
        self.max = Some(self.max.map_or(mbps, |m| m.max(mbps)));

        self.recompute_window();
        Some(mbps)
    }

    fn recompute_window(&mut self) {
        let start = self.samples.len().saturating_sub(SPEED_WINDOW);
        let window = &self.samples[start..];
        if window.is_empty() {
            return;
        }

        let avg = window.iter().sum::<f64>() / window.len() as f64;
        self.average = Some(avg);

        // 样本不足时波动率保持未知
        if self.samples.len() >= MIN_VARIANCE_SAMPLES && avg > 0.0 {
            let var = window.iter().map(|s| (s - avg).powi(2)).sum::<f64>() / window.len() as f64;
            self.variance = Some(var.sqrt() / avg * 100.0);
        }
    }

    pub fn current(&self) -> Option<f64> {
        self.current
    }

    pub fn average(&self) -> Option<f64> {
        self.average
    }

    pub fn min(&self) -> Option<f64> {
        self.min
    }

    pub fn max(&self) -> Option<f64> {
        self.max
    }

    /// 波动率百分比，None 表示稳定性未知（不是 0）
    pub fn variance_percent(&self) -> Option<f64> {
        self.variance
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn condition(&self) -> NetworkCondition {
        NetworkCondition::from_metrics(self.average, self.variance)
    }

    pub fn stats(&self) -> SpeedStats {
        SpeedStats {
            current_speed_mbps: self.current,
            average_speed_mbps: self.average,
            min_speed_mbps: self.min,
            max_speed_mbps: self.max,
            speed_variance_percent: self.variance,
            network_condition: self.condition(),
            sample_count: self.samples.len(),
        }
    }
}
