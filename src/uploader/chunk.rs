// 分片大小计算
//
// 目标：每个分片在实测带宽下约 2.5 秒传完
// - 分片过小：HTTP 请求过多，开销大
// - 分片过大：超时风险高，重试浪费带宽
//
// 计算步骤：
// 1. 基础大小 = speed_mbps × 2.5 × 1024 × 1024 / 8
// 2. 稳定性系数：波动率 < 10% ×1.2，> 30% ×0.6，其余 ×1.0
// 3. 设备系数：MOBILE ×0.7，TABLET ×0.85，DESKTOP ×1.0
// 4. 限制在 [256KB, 5MB]
// 5. 向下对齐到 64KB

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::speed::NetworkCondition;

/// 最小分片大小: 256KB
pub const MIN_CHUNK_SIZE: u64 = 256 * 1024;

/// 最大分片大小: 5MB
pub const MAX_CHUNK_SIZE: u64 = 5 * 1024 * 1024;

/// 默认分片大小: 640KB（没有测速数据时使用）
pub const DEFAULT_CHUNK_SIZE: u64 = 640 * 1024;

/// 对齐粒度: 64KB
pub const CHUNK_ALIGNMENT: u64 = 64 * 1024;

/// 单个分片的目标传输时间（秒）
pub const TARGET_CHUNK_SECONDS: f64 = 2.5;

/// 波动率低于该值视为稳定
pub const STABLE_VARIANCE_PERCENT: f64 = 10.0;

/// 波动率高于该值视为不稳定
pub const UNSTABLE_VARIANCE_PERCENT: f64 = 30.0;

/// 推荐值与当前值相差超过该比例才调整（%）
pub const ADAPT_THRESHOLD_PERCENT: f64 = 25.0;

// 各网络状况下的固定推荐分片大小
pub const CHUNK_SIZE_EXCELLENT: u64 = 5 * 1024 * 1024;
pub const CHUNK_SIZE_GOOD: u64 = 2 * 1024 * 1024;
pub const CHUNK_SIZE_FAIR: u64 = 640 * 1024;
pub const CHUNK_SIZE_POOR: u64 = 384 * 1024;
pub const CHUNK_SIZE_UNSTABLE: u64 = 256 * 1024;

/// 客户端设备类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeviceType {
    #[default]
    Desktop,
    Mobile,
    Tablet,
}

impl DeviceType {
    /// 宽松解析，无法识别时按 DESKTOP 处理
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_uppercase().as_str() {
            "MOBILE" => Self::Mobile,
            "TABLET" => Self::Tablet,
            _ => Self::Desktop,
        }
    }

    fn factor(&self) -> f64 {
        match self {
            Self::Desktop => 1.0,
            Self::Mobile => 0.7,
            Self::Tablet => 0.85,
        }
    }
}

fn stability_factor(variance_percent: f64) -> f64 {
    if variance_percent < STABLE_VARIANCE_PERCENT {
        1.2
    } else if variance_percent > UNSTABLE_VARIANCE_PERCENT {
        0.6
    } else {
        1.0
    }
}

/// 计算最优分片大小（字节）
///
/// # 参数
/// * `speed_mbps` - 网络速度，缺失或非正数时直接返回默认 640KB
/// * `variance_percent` - 速度波动率，缺失时按 0（稳定）处理
/// * `device` - 设备类型
///
/// # 返回
/// 64KB 的整数倍，且位于 [256KB, 5MB]
pub fn calculate_optimal_chunk_size(
    speed_mbps: Option<f64>,
    variance_percent: Option<f64>,
    device: DeviceType,
) -> u64 {
    let speed = match speed_mbps {
        Some(s) if s.is_finite() && s > 0.0 => s,
        _ => {
            debug!("未提供网络速度，使用默认分片大小: {} KB", DEFAULT_CHUNK_SIZE / 1024);
            return DEFAULT_CHUNK_SIZE;
        }
    };
    let variance = variance_percent.filter(|v| v.is_finite()).unwrap_or(0.0);

    let base = speed * TARGET_CHUNK_SECONDS * 1024.0 * 1024.0 / 8.0;
    let adjusted = base * stability_factor(variance) * device.factor();

    // f64 -> u64 在溢出时饱和
    let clamped = (adjusted as u64).clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
    let size = clamped / CHUNK_ALIGNMENT * CHUNK_ALIGNMENT;

    debug!(
        "分片大小计算: speed={:.2} Mbps, variance={:.1}%, device={:?}, size={} KB",
        speed,
        variance,
        device,
        size / 1024
    );

    size
}

/// 是否需要调整分片大小
///
/// 只有相对差异超过 25% 才调整，避免每个分片都来回抖动
pub fn should_adapt(current: u64, recommended: u64) -> bool {
    if current == 0 {
        return recommended > 0;
    }
    let diff = current.abs_diff(recommended) as f64;
    diff / current as f64 * 100.0 > ADAPT_THRESHOLD_PERCENT
}

/// 网络状况对应的固定推荐值
pub fn recommended_for_condition(condition: NetworkCondition) -> u64 {
    condition.recommended_chunk_size()
}

/// 按给定速度传输 `bytes` 所需的秒数，速度非正时返回 None
pub fn estimate_upload_seconds(bytes: u64, speed_mbps: f64) -> Option<f64> {
    if speed_mbps.is_nan() || speed_mbps <= 0.0 {
        return None;
    }
    let bytes_per_second = speed_mbps * 1024.0 * 1024.0 / 8.0;
    Some(bytes as f64 / bytes_per_second)
}

/// 分片总数 = ceil(file_size / chunk_size)
pub fn total_chunks_for(file_size: u64, chunk_size: u64) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    file_size.div_ceil(chunk_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_without_speed() {
        assert_eq!(
            calculate_optimal_chunk_size(None, None, DeviceType::Desktop),
            DEFAULT_CHUNK_SIZE
        );
        assert_eq!(
            calculate_optimal_chunk_size(Some(0.0), Some(50.0), DeviceType::Mobile),
            DEFAULT_CHUNK_SIZE
        );
    }

    #[test]
    fn test_unstable_mobile() {
        // 3,276,800 × 0.6 × 0.7 = 1,376,256 = 21 × 64KB
        let size = calculate_optimal_chunk_size(Some(10.0), Some(35.0), DeviceType::Mobile);
        assert_eq!(size, 1_376_256);
        assert_eq!(size % CHUNK_ALIGNMENT, 0);
    }

    #[test]
    fn test_clamping() {
        // 极慢网络 → 最小值
        assert_eq!(
            calculate_optimal_chunk_size(Some(0.1), None, DeviceType::Desktop),
            MIN_CHUNK_SIZE
        );
        // 极快网络 → 最大值
        assert_eq!(
            calculate_optimal_chunk_size(Some(10_000.0), Some(0.0), DeviceType::Desktop),
            MAX_CHUNK_SIZE
        );
    }

    #[test]
    fn test_stable_desktop_grows() {
        // 10 Mbps 稳定：3,276,800 × 1.2 = 3,932,160 = 60 × 64KB
        let size = calculate_optimal_chunk_size(Some(10.0), None, DeviceType::Desktop);
        assert_eq!(size, 3_932_160);
    }

    #[test]
    fn test_should_adapt_threshold() {
        assert!(!should_adapt(1_000_000, 1_250_000));
        assert!(should_adapt(1_000_000, 1_250_001));
        assert!(should_adapt(1_000_000, 700_000));
        assert!(!should_adapt(640 * 1024, 640 * 1024));
    }

    #[test]
    fn test_condition_table() {
        assert_eq!(recommended_for_condition(NetworkCondition::Excellent), 5 * 1024 * 1024);
        assert_eq!(recommended_for_condition(NetworkCondition::Poor), 384 * 1024);
        assert_eq!(recommended_for_condition(NetworkCondition::Unstable), 256 * 1024);
    }

    #[test]
    fn test_total_chunks_and_estimate() {
        assert_eq!(total_chunks_for(10 * 1024 * 1024, DEFAULT_CHUNK_SIZE), 16);
        assert_eq!(total_chunks_for(10 * 1024 * 1024 + 1, DEFAULT_CHUNK_SIZE), 17);
        assert_eq!(estimate_upload_seconds(1024 * 1024, 8.0), Some(1.0));
        assert_eq!(estimate_upload_seconds(1024, 0.0), None);
    }

    #[test]
    fn test_device_parse() {
        assert_eq!(DeviceType::parse("mobile"), DeviceType::Mobile);
        assert_eq!(DeviceType::parse(" Tablet "), DeviceType::Tablet);
        assert_eq!(DeviceType::parse("toaster"), DeviceType::Desktop);
    }

    fn device_strategy() -> impl Strategy<Value = DeviceType> {
        prop_oneof![
            Just(DeviceType::Desktop),
            Just(DeviceType::Mobile),
            Just(DeviceType::Tablet),
        ]
    }

    proptest! {
        #[test]
        fn prop_size_bounded_and_aligned(
            speed in 0.001f64..100_000.0,
            variance in proptest::option::of(0.0f64..200.0),
            device in device_strategy(),
        ) {
            let size = calculate_optimal_chunk_size(Some(speed), variance, device);
            prop_assert!(size >= MIN_CHUNK_SIZE);
            prop_assert!(size <= MAX_CHUNK_SIZE);
            prop_assert_eq!(size % CHUNK_ALIGNMENT, 0);
        }

        #[test]
        fn prop_monotonic_in_speed(
            a in 0.001f64..10_000.0,
            b in 0.001f64..10_000.0,
            variance in proptest::option::of(0.0f64..200.0),
            device in device_strategy(),
        ) {
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let small = calculate_optimal_chunk_size(Some(lo), variance, device);
            let large = calculate_optimal_chunk_size(Some(hi), variance, device);
            prop_assert!(small <= large);
        }
    }
}
