// Adaptive Chunk Transfer Library
// 自适应分片传输引擎核心库

// 配置管理模块
pub mod config;

// 🔥 日志系统
pub mod logging;

// 公共工具（格式化、MIME 推断）
pub mod common;

// 分片上传引擎模块
pub mod uploader;

// 自适应下载模块
pub mod downloader;

// Web服务器模块
pub mod server;

// 导出常用类型
pub use config::AppConfig;
pub use downloader::{AdaptiveStreamer, CalculatorPredictor, ParameterPredictor};
pub use server::{build_router, AppState};
pub use uploader::{
    calculate_optimal_chunk_size, NetworkCondition, SpeedTracker, UploadCoordinator, UploadError,
    UploadSession, UploadStatus,
};
