// 分片上传错误定义

use std::io;
use thiserror::Error;

/// Linux ENOSPC
const ENOSPC: i32 = 28;

/// 分片传输引擎错误
#[derive(Debug, Error)]
pub enum UploadError {
    /// 请求参数错误（文件名、大小、分片范围、总数不一致）
    #[error("{0}")]
    Validation(String),

    /// 会话不存在
    #[error("上传会话不存在: {0}")]
    NotFound(String),

    /// 会话状态不接受该操作
    #[error("{0}")]
    InvalidState(String),

    /// 磁盘空间不足
    #[error("磁盘空间不足: {0}")]
    StorageFull(String),

    /// 写入/读取失败
    #[error("存储错误: {0}")]
    Storage(String),

    /// 合并时分片文件缺失
    #[error("分片文件缺失: chunk {index}")]
    MissingChunk { index: u32 },

    /// 合并后文件大小不一致
    #[error("文件大小不一致: 期望 {expected} 字节, 实际 {actual} 字节 (差异 {percent:.2}%)")]
    SizeMismatch {
        expected: u64,
        actual: u64,
        percent: f64,
    },

    /// 分片校验和不一致
    #[error("分片 {index} 校验失败: 期望 {expected}, 实际 {actual}")]
    ChecksumMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    /// 未分类错误
    #[error("内部错误: {0}")]
    Internal(String),
}

impl UploadError {
    /// 机器可读的错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "SESSION_NOT_FOUND",
            Self::InvalidState(_) => "INVALID_STATE",
            Self::StorageFull(_) => "DISK_FULL",
            Self::Storage(_) => "CHUNK_SAVE_FAILED",
            Self::MissingChunk { .. } => "MISSING_CHUNK",
            Self::SizeMismatch { .. } => "SIZE_MISMATCH",
            Self::ChecksumMismatch { .. } => "CHECKSUM_MISMATCH",
            Self::Internal(_) => "UNEXPECTED_ERROR",
        }
    }

    /// 调用方是否可以重试
    ///
    /// - 写入失败可重发该分片（幂等）
    /// - 校验失败可重发该分片
    /// - 状态错误需先查询状态再决定
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::InvalidState(_)
                | Self::Storage(_)
                | Self::ChecksumMismatch { .. }
                | Self::Internal(_)
        )
    }

    /// 建议的重试等待时间（秒）
    pub fn retry_after_secs(&self) -> Option<u64> {
        match self {
            Self::InvalidState(_) => Some(3),
            Self::Storage(_) => Some(5),
            Self::ChecksumMismatch { .. } => Some(1),
            _ => None,
        }
    }

    /// 给调用方的处理建议
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Validation(_) => Some("Check the request parameters and try again"),
            Self::NotFound(_) => Some("The upload session may have expired. Start a new upload"),
            Self::InvalidState(_) => Some("Query the upload status before sending more chunks"),
            Self::StorageFull(_) => Some("Server storage is full. Contact the administrator"),
            Self::Storage(_) => Some("Resend this chunk"),
            Self::MissingChunk { .. } | Self::SizeMismatch { .. } => {
                Some("The transfer is corrupt. Start a new upload")
            }
            Self::ChecksumMismatch { .. } => Some("The chunk was damaged in transit. Resend it"),
            Self::Internal(_) => None,
        }
    }

    /// 是否为完整性错误（合并阶段）
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::MissingChunk { .. } | Self::SizeMismatch { .. })
    }
}

impl From<io::Error> for UploadError {
    fn from(e: io::Error) -> Self {
        if e.raw_os_error() == Some(ENOSPC) {
            Self::StorageFull(e.to_string())
        } else {
            Self::Storage(e.to_string())
        }
    }
}

pub type UploadResult<T> = std::result::Result<T, UploadError>;
