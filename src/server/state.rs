// 应用状态

use crate::config::AppConfig;
use crate::downloader::{CalculatorPredictor, ParameterPredictor};
use crate::uploader::{InMemorySessionStore, UploadCoordinator};
use std::sync::Arc;

/// 应用全局状态
#[derive(Clone)]
pub struct AppState {
    /// 应用配置
    pub config: Arc<AppConfig>,
    /// 分片上传协调器
    pub coordinator: Arc<UploadCoordinator>,
    /// 下载参数预测器
    pub predictor: Arc<dyn ParameterPredictor>,
}

impl AppState {
    /// 根据配置创建应用状态（内存会话存储 + 默认预测器）
    pub fn new(config: AppConfig) -> Self {
        let store = Arc::new(InMemorySessionStore::new());
        let coordinator = Arc::new(UploadCoordinator::from_config(store, &config.upload));

        Self {
            config: Arc::new(config),
            coordinator,
            predictor: Arc::new(CalculatorPredictor::new()),
        }
    }

    /// 替换下载参数预测器
    pub fn with_predictor(mut self, predictor: Arc<dyn ParameterPredictor>) -> Self {
        self.predictor = predictor;
        self
    }
}
