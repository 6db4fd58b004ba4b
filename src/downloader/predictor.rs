// 下载参数预测
//
// 外部预测服务可以根据历史统计给出窗口大小与压缩级别；
// 默认实现直接复用上传侧的分片大小计算

use async_trait::async_trait;
use serde::Serialize;

use crate::uploader::{calculate_optimal_chunk_size, DeviceType, NetworkCondition};

/// 高延迟阈值（毫秒），超过视为不稳定
pub const HIGH_LATENCY_MS: u64 = 200;

/// 低延迟阈值（毫秒），低于视为稳定
pub const LOW_LATENCY_MS: u64 = 50;

/// 预测结果
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictedParameters {
    /// 下载窗口大小（字节）
    pub chunk_size: u64,
    /// 建议压缩级别（1-9）
    pub compression_level: u32,
    /// 网络状况
    pub network_condition: NetworkCondition,
}

/// 参数预测器
#[async_trait]
pub trait ParameterPredictor: Send + Sync {
    async fn predict(
        &self,
        network_speed_mbps: Option<f64>,
        latency_ms: Option<u64>,
    ) -> PredictedParameters;
}

/// 基于分片大小计算器的默认预测器
#[derive(Debug, Clone, Copy, Default)]
pub struct CalculatorPredictor {
    pub device: DeviceType,
}

impl CalculatorPredictor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 用延迟近似速度波动率
    fn variance_from_latency(latency_ms: Option<u64>) -> Option<f64> {
        latency_ms.map(|ms| {
            if ms > HIGH_LATENCY_MS {
                35.0
            } else if ms < LOW_LATENCY_MS {
                0.0
            } else {
                20.0
            }
        })
    }

    fn compression_level(condition: NetworkCondition) -> u32 {
        match condition {
            NetworkCondition::Excellent => 1,
            NetworkCondition::Good => 3,
            NetworkCondition::Fair | NetworkCondition::Unknown => 6,
            NetworkCondition::Poor | NetworkCondition::Unstable => 9,
        }
    }
}

#[async_trait]
impl ParameterPredictor for CalculatorPredictor {
    async fn predict(
        &self,
        network_speed_mbps: Option<f64>,
        latency_ms: Option<u64>,
    ) -> PredictedParameters {
        let variance = Self::variance_from_latency(latency_ms);
        let speed = network_speed_mbps.filter(|s| s.is_finite() && *s > 0.0);
        let condition = NetworkCondition::from_metrics(speed, variance);

        PredictedParameters {
            chunk_size: calculate_optimal_chunk_size(speed, variance, self.device),
            compression_level: Self::compression_level(condition),
            network_condition: condition,
        }
    }
}
