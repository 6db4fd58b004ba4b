use adaptive_chunk_transfer::{
    build_router,
    config::{AppConfig, LogConfig, DEFAULT_CONFIG_PATH},
    logging, AppState, UploadCoordinator,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;

/// 加载日志配置
///
/// 日志系统初始化之前调用，失败时静默返回默认配置
async fn load_log_config() -> LogConfig {
    if let Ok(content) = tokio::fs::read_to_string(DEFAULT_CONFIG_PATH).await {
        if let Ok(config) = toml::from_str::<toml::Value>(&content) {
            if let Some(log_table) = config.get("log") {
                if let Ok(log_config) = log_table.clone().try_into::<LogConfig>() {
                    return log_config;
                }
            }
        }
    }

    LogConfig::default()
}

/// 启动闲置会话清理任务
fn spawn_expiry_sweeper(
    coordinator: Arc<UploadCoordinator>,
    interval: Duration,
    timeout: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // 第一次 tick 立即返回
        ticker.tick().await;
        loop {
            ticker.tick().await;
            coordinator.expire_idle(timeout).await;
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 🔥 先尝试加载日志配置，失败时使用默认配置
    let log_config = load_log_config().await;

    // 🔥 初始化日志系统（必须保持 _log_guard 存活）
    let _log_guard = logging::init_logging(&log_config);

    info!("Adaptive Chunk Transfer v{} 启动中...", env!("CARGO_PKG_VERSION"));

    let config = AppConfig::load_or_default(DEFAULT_CONFIG_PATH).await;
    config.upload.validate()?;

    tokio::fs::create_dir_all(&config.upload.temp_dir).await?;
    tokio::fs::create_dir_all(&config.upload.final_dir).await?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let cleanup_interval = config.upload.cleanup_interval();
    let session_timeout = config.upload.session_timeout();

    // 创建应用状态
    let app_state = AppState::new(config);
    info!("应用状态初始化完成");

    let sweeper = spawn_expiry_sweeper(
        Arc::clone(&app_state.coordinator),
        cleanup_interval,
        session_timeout,
    );

    let app = build_router(app_state);

    // 启动服务器
    info!("服务器启动在: http://{}", addr);
    info!("API 基础路径: http://{}/api/v1", addr);
    info!("健康检查: http://{}/api/v1/health", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    );

    // 🔥 使用 select! 监听关闭信号
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!("服务器错误: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("收到 Ctrl+C，开始关闭...");
        }
    }

    sweeper.abort();
    info!("应用已安全退出");

    Ok(())
}
