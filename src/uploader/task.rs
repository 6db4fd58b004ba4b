// 上传会话定义
//
// 状态机：
//   INITIALIZED → UPLOADING → ASSEMBLING → COMPLETED
//   任一非终态 → FAILED / CANCELLED / EXPIRED
// 只有 INITIALIZED 和 UPLOADING 接受分片写入

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Instant;

use super::chunk::DeviceType;
use super::error::{UploadError, UploadResult};
use super::speed::SpeedTracker;

/// 单会话默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 上传会话状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum UploadStatus {
    /// 已创建，尚未收到分片
    Initialized,
    /// 接收分片中
    Uploading,
    /// 合并中
    Assembling,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
    /// 闲置超时
    Expired,
}

impl UploadStatus {
    /// 是否接受分片写入
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Initialized | Self::Uploading)
    }

    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Cancelled | Self::Expired
        )
    }

    /// 状态迁移是否合法（只能前进，终态不可离开）
    pub fn can_transition_to(&self, next: UploadStatus) -> bool {
        use UploadStatus::*;
        match (self, next) {
            (Initialized, Uploading) => true,
            (Uploading, Assembling) => true,
            (Assembling, Completed) => true,
            (from, Failed | Cancelled | Expired) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Initialized => "INITIALIZED",
            Self::Uploading => "UPLOADING",
            Self::Assembling => "ASSEMBLING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 创建会话所需的参数
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: String,
    pub client_addr: Option<String>,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub total_chunks: u32,
    pub chunk_size: u64,
    pub temp_dir: PathBuf,
}

/// 上传会话
#[derive(Debug, Clone)]
pub struct UploadSession {
    /// 会话ID
    pub id: String,
    /// 所属用户
    pub user_id: String,
    /// 客户端地址
    pub client_addr: Option<String>,
    /// 原始文件名
    pub file_name: String,
    /// 声明的文件大小
    pub file_size: u64,
    /// MIME 类型
    pub file_type: String,
    /// 总分片数
    pub total_chunks: u32,
    /// 分片大小（字节）
    pub chunk_size: u64,
    /// 客户端设备类型（用于分片大小建议）
    pub device: DeviceType,
    /// 已接收的分片索引
    received: HashSet<u32>,
    /// 当前状态
    status: UploadStatus,
    /// 吞吐统计
    pub speed: SpeedTracker,
    /// 创建时间
    pub created_at: DateTime<Utc>,
    /// 最近一次收到分片的时间
    pub last_chunk_at: Option<DateTime<Utc>>,
    /// 完成时间
    pub completed_at: Option<DateTime<Utc>>,
    /// 单调时钟起点（耗时与 ETA）
    pub started: Instant,
    /// 最近活动（闲置过期判断）
    pub last_activity: Instant,
    /// 分片临时目录
    pub temp_dir: PathBuf,
    /// 合并后的文件路径
    pub final_path: Option<PathBuf>,
    /// 最近一次错误
    pub error_message: Option<String>,
    /// 重复提交次数
    pub retry_count: u32,
    /// 重试上限（仅用于展示）
    pub max_retries: u32,
}

impl UploadSession {
    /// 创建新会话，ID 使用 UUID v4
    pub fn new(params: NewSession) -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string(), params)
    }

    pub fn with_id(id: String, params: NewSession) -> Self {
        let now = Instant::now();
        Self {
            id,
            user_id: params.user_id,
            client_addr: params.client_addr,
            file_name: params.file_name,
            file_size: params.file_size,
            file_type: params.file_type,
            total_chunks: params.total_chunks,
            chunk_size: params.chunk_size,
            device: DeviceType::default(),
            received: HashSet::with_capacity(params.total_chunks.min(4096) as usize),
            status: UploadStatus::Initialized,
            speed: SpeedTracker::new(),
            created_at: Utc::now(),
            last_chunk_at: None,
            completed_at: None,
            started: now,
            last_activity: now,
            temp_dir: params.temp_dir,
            final_path: None,
            error_message: None,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    /// 状态迁移，非法迁移返回 InvalidState
    pub fn transition_to(&mut self, next: UploadStatus) -> UploadResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(UploadError::InvalidState(format!(
                "非法状态迁移: {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        self.last_activity = Instant::now();
        if next == UploadStatus::Completed {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// 标记失败并记录原因
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.error_message = Some(message.into());
        if self.status.can_transition_to(UploadStatus::Failed) {
            self.status = UploadStatus::Failed;
        }
    }

    pub fn is_received(&self, index: u32) -> bool {
        self.received.contains(&index)
    }

    /// 标记分片已接收，重复索引返回 false
    pub fn mark_received(&mut self, index: u32) -> bool {
        let inserted = self.received.insert(index);
        if inserted {
            self.last_chunk_at = Some(Utc::now());
            self.last_activity = Instant::now();
        }
        inserted
    }

    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    pub fn is_complete(&self) -> bool {
        self.total_chunks > 0 && self.received_count() >= self.total_chunks
    }

    /// 进度百分比（由已接收分片数推导）
    pub fn progress(&self) -> f64 {
        if self.total_chunks == 0 {
            return 0.0;
        }
        self.received_count() as f64 / self.total_chunks as f64 * 100.0
    }

    /// 尚未收到的分片索引（升序）
    pub fn missing_chunks(&self) -> Vec<u32> {
        (0..self.total_chunks)
            .filter(|i| !self.received.contains(i))
            .collect()
    }

    /// 预计剩余秒数，没有速度样本时为 None
    pub fn eta_seconds(&self) -> Option<u64> {
        let avg = self.speed.average().filter(|a| *a > 0.0)?;
        let remaining = self.total_chunks.saturating_sub(self.received_count()) as u64;
        let bytes_per_second = avg * 1024.0 * 1024.0 / 8.0;
        Some((remaining as f64 * self.chunk_size as f64 / bytes_per_second) as u64)
    }

    pub fn elapsed_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}
