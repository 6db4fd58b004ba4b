// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::uploader::{MAX_CHUNK_SIZE, MULTIPART_OVERHEAD_BYTES};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/app.toml";

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 分片上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 下载配置
    #[serde(default)]
    pub download: DownloadConfig,
    /// 🔥 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_host")]
    pub host: String,
    /// 监听端口
    #[serde(default = "default_port")]
    pub port: u16,
    /// CORS允许的源（空表示任意）
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    18888
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: Vec::new(),
        }
    }
}

/// 分片上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片临时目录
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
    /// 合并后文件目录
    #[serde(default = "default_final_dir")]
    pub final_dir: PathBuf,
    /// 单文件大小上限（字节，默认 10GB）
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,
    /// 合并时的拷贝缓冲区（字节，默认 32KB）
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    /// 会话闲置超时（秒，默认 24 小时）
    #[serde(default = "default_session_timeout_secs")]
    pub session_timeout_secs: u64,
    /// 闲置清理间隔（秒，默认 1 小时）
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
    /// 单个上传请求体上限（字节，默认 16MB）
    #[serde(default = "default_max_request_bytes")]
    pub max_request_bytes: usize,
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("./uploads/temp-chunks")
}

fn default_final_dir() -> PathBuf {
    PathBuf::from("./uploads/files")
}

fn default_max_file_size() -> u64 {
    10 * 1024 * 1024 * 1024 // 10GB
}

fn default_buffer_size() -> usize {
    32 * 1024
}

fn default_session_timeout_secs() -> u64 {
    24 * 60 * 60
}

fn default_cleanup_interval_secs() -> u64 {
    60 * 60
}

fn default_max_request_bytes() -> usize {
    16 * 1024 * 1024
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            temp_dir: default_temp_dir(),
            final_dir: default_final_dir(),
            max_file_size: default_max_file_size(),
            buffer_size: default_buffer_size(),
            session_timeout_secs: default_session_timeout_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            max_request_bytes: default_max_request_bytes(),
        }
    }
}

impl UploadConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            anyhow::bail!("upload.buffer_size 必须大于 0");
        }
        if self.max_file_size == 0 {
            anyhow::bail!("upload.max_file_size 必须大于 0");
        }
        if self.cleanup_interval_secs == 0 {
            anyhow::bail!("upload.cleanup_interval_secs 必须大于 0");
        }
        let min_request = MAX_CHUNK_SIZE + MULTIPART_OVERHEAD_BYTES;
        if (self.max_request_bytes as u64) < min_request {
            anyhow::bail!(
                "upload.max_request_bytes 不能小于 {} (最大分片 + multipart 开销)",
                min_request
            );
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// 下载配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// 可供下载的文件目录
    #[serde(default = "default_final_dir")]
    pub files_dir: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            files_dir: default_final_dir(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;

        config
            .upload
            .validate()
            .context("配置文件中的上传配置验证失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();

                // 首次启动：写出默认配置，已有但无法解析的文件不覆盖
                if !std::path::Path::new(path).exists() {
                    if let Err(e) = default_config.save_to_file(path).await {
                        tracing::error!("保存默认配置失败: {}", e);
                    }
                }

                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 18888);
        assert_eq!(config.upload.max_file_size, 10_737_418_240);
        assert_eq!(config.upload.buffer_size, 32 * 1024);
        assert_eq!(config.upload.temp_dir, PathBuf::from("./uploads/temp-chunks"));
        assert!(config.log.enabled);
        assert_eq!(config.log.level, "info");
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config").join("app.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.server.port = 9000;
        config.upload.buffer_size = 64 * 1024;
        config.save_to_file(path).await.unwrap();

        let loaded = AppConfig::load_from_file(path).await.unwrap();
        assert_eq!(loaded.server.port, 9000);
        assert_eq!(loaded.upload.buffer_size, 64 * 1024);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            max_file_size = 1024
            "#,
        )
        .unwrap();
        assert_eq!(config.upload.max_file_size, 1024);
        assert_eq!(config.upload.final_dir, PathBuf::from("./uploads/files"));
        assert_eq!(config.server.host, "127.0.0.1");
    }

    #[tokio::test]
    async fn test_invalid_upload_config_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[upload]\nbuffer_size = 0\n").unwrap();

        assert!(AppConfig::load_from_file(path.to_str().unwrap()).await.is_err());

        let config = AppConfig::load_or_default(path.to_str().unwrap()).await;
        assert_eq!(config.upload.buffer_size, 32 * 1024);
        // 无法解析的文件保持原样
        assert!(std::fs::read_to_string(&path).unwrap().contains("buffer_size = 0"));
    }

    #[test]
    fn test_request_limit_must_fit_largest_chunk() {
        let mut upload = UploadConfig::default();
        assert!(upload.validate().is_ok());

        upload.max_request_bytes = 1024 * 1024;
        assert!(upload.validate().is_err());
    }

    #[tokio::test]
    async fn test_load_or_default_writes_missing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.toml");
        let config = AppConfig::load_or_default(path.to_str().unwrap()).await;
        assert_eq!(config.server.port, 18888);
        assert!(path.exists());
    }
}
