// 上传响应快照

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::speed::SpeedStats;
use super::task::{UploadSession, UploadStatus};
use crate::common::{format_bytes, format_eta};

/// 会话进度快照
///
/// 初始化、分片上传、状态查询共用同一结构；缺失分片列表只在状态查询中返回
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSnapshot {
    pub success: bool,
    pub message: String,
    pub upload_id: String,
    pub status: UploadStatus,
    pub file_name: String,
    pub file_size: u64,
    pub formatted_file_size: String,
    pub file_type: String,
    pub total_chunks: u32,
    pub uploaded_chunks: u32,
    pub chunk_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_number: Option<u32>,
    pub progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<u32>>,
    pub missing_chunk_count: u32,
    #[serde(flatten)]
    pub speed: SpeedStats,
    pub estimated_time_remaining: Option<u64>,
    pub formatted_time_remaining: String,
    pub elapsed_time_seconds: u64,
    pub recommended_chunk_size: u64,
    pub adapted_in_this_request: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_recommended_chunk_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub adaptation_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expected_upload_seconds: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_file_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl UploadSnapshot {
    /// 从会话生成快照（调用方持有会话锁）
    pub fn from_session(session: &UploadSession, message: impl Into<String>) -> Self {
        let eta = session.eta_seconds();
        Self {
            success: !matches!(
                session.status(),
                UploadStatus::Failed | UploadStatus::Cancelled | UploadStatus::Expired
            ),
            message: message.into(),
            upload_id: session.id.clone(),
            status: session.status(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            formatted_file_size: format_bytes(session.file_size),
            file_type: session.file_type.clone(),
            total_chunks: session.total_chunks,
            uploaded_chunks: session.received_count(),
            chunk_size: session.chunk_size,
            chunk_number: None,
            progress: session.progress(),
            missing_chunks: None,
            missing_chunk_count: session.total_chunks.saturating_sub(session.received_count()),
            speed: session.speed.stats(),
            estimated_time_remaining: eta,
            formatted_time_remaining: format_eta(eta),
            elapsed_time_seconds: session.elapsed_secs(),
            recommended_chunk_size: session.chunk_size,
            adapted_in_this_request: false,
            new_recommended_chunk_size: None,
            adaptation_reason: None,
            expected_upload_seconds: None,
            final_file_path: session
                .final_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            error_message: session.error_message.clone(),
            retry_count: session.retry_count,
            max_retries: session.max_retries,
            created_at: session.created_at,
            completed_at: session.completed_at,
        }
    }

    /// 附带完整的缺失分片列表
    pub fn with_missing_chunks(mut self, session: &UploadSession) -> Self {
        self.missing_chunks = Some(session.missing_chunks());
        self
    }

    pub fn with_chunk_number(mut self, chunk_number: u32) -> Self {
        self.chunk_number = Some(chunk_number);
        self
    }
}

/// 会话列表项
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub id: String,
    pub file_name: String,
    pub status: UploadStatus,
    pub progress: f64,
    pub uploaded_chunks: u32,
    pub total_chunks: u32,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

impl From<&UploadSession> for SessionSummary {
    fn from(session: &UploadSession) -> Self {
        Self {
            id: session.id.clone(),
            file_name: session.file_name.clone(),
            status: session.status(),
            progress: session.progress(),
            uploaded_chunks: session.received_count(),
            total_chunks: session.total_chunks,
            user_id: session.user_id.clone(),
            created_at: session.created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::task::NewSession;
    use std::path::PathBuf;

    #[test]
    fn test_snapshot_json_shape() {
        let mut session = UploadSession::new(NewSession {
            user_id: "bob".to_string(),
            client_addr: None,
            file_name: "movie.mp4".to_string(),
            file_size: 3 * 1024,
            file_type: "video/mp4".to_string(),
            total_chunks: 3,
            chunk_size: 1024,
            temp_dir: PathBuf::from("/tmp/t"),
        });
        session.mark_received(1);

        let snapshot = UploadSnapshot::from_session(&session, "ok").with_chunk_number(1);
        let json = serde_json::to_value(&snapshot).unwrap();

        assert_eq!(json["status"], "INITIALIZED");
        assert_eq!(json["uploadedChunks"], 1);
        assert_eq!(json["missingChunkCount"], 2);
        assert!(json.get("missingChunks").is_none());
        assert_eq!(json["networkCondition"], "UNKNOWN");
        assert_eq!(json["formattedTimeRemaining"], "Calculating...");
        assert!(json["estimatedTimeRemaining"].is_null());
        assert_eq!(json["chunkNumber"], 1);
        assert!(json.get("finalFilePath").is_none());
    }

    #[test]
    fn test_missing_chunks_only_on_request() {
        let mut session = UploadSession::new(NewSession {
            user_id: "bob".to_string(),
            client_addr: None,
            file_name: "big.iso".to_string(),
            file_size: 4 * 1024,
            file_type: "application/x-iso9660-image".to_string(),
            total_chunks: 4,
            chunk_size: 1024,
            temp_dir: PathBuf::from("/tmp/t"),
        });
        session.mark_received(0);
        session.mark_received(2);

        let snapshot = UploadSnapshot::from_session(&session, "ok").with_missing_chunks(&session);
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["missingChunks"], serde_json::json!([1, 3]));
        assert_eq!(json["missingChunkCount"], 2);
    }

    #[test]
    fn test_summary_from_session() {
        let session = UploadSession::new(NewSession {
            user_id: "carol".to_string(),
            client_addr: None,
            file_name: "a.txt".to_string(),
            file_size: 1,
            file_type: "text/plain".to_string(),
            total_chunks: 1,
            chunk_size: 1,
            temp_dir: PathBuf::from("/tmp/t"),
        });
        let summary = SessionSummary::from(&session);
        assert_eq!(summary.user_id, "carol");
        assert_eq!(summary.progress, 0.0);
    }
}
