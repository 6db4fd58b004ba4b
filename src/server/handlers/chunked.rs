// 分片上传API处理器

use crate::server::{ApiError, ApiResult, AppState};
use crate::uploader::{ChunkUpload, DeviceType, InitUpload, SessionSummary, UploadSnapshot};
use axum::{
    extract::{ConnectInfo, Multipart, Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{debug, info};

use super::ApiResponse;

/// 用户标识请求头，由外部认证层注入
pub const USER_ID_HEADER: &str = "x-user-id";

const ANONYMOUS_USER: &str = "anonymous";

/// 初始化上传请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: Option<u32>,
    pub chunk_size: Option<u64>,
    /// 客户端测得的网络速度（Mbps）
    pub network_speed: Option<f64>,
    /// DESKTOP / MOBILE / TABLET
    pub device_type: Option<String>,
}

/// 取消结果
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub upload_id: String,
    /// 会话在取消前是否存在
    pub existed: bool,
}

/// 会话列表
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionListResponse {
    pub sessions: Vec<SessionSummary>,
    pub total_sessions: usize,
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS_USER)
        .to_string()
}

/// X-Forwarded-For 的第一项，否则取连接对端地址
fn client_addr(headers: &HeaderMap, peer: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
}

/// POST /api/v1/chunked/init
/// 初始化分片上传会话
pub async fn init_upload(
    State(state): State<AppState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(req): Json<InitUploadRequest>,
) -> ApiResult<Json<UploadSnapshot>> {
    let user = user_id(&headers);
    info!(
        "API: 初始化分片上传: 文件={}, 大小={}, 用户={}",
        req.file_name, req.file_size, user
    );

    let snapshot = state
        .coordinator
        .init(InitUpload {
            file_name: req.file_name,
            file_size: req.file_size,
            total_chunks: req.total_chunks,
            chunk_size: req.chunk_size,
            network_speed_mbps: req.network_speed,
            device: req
                .device_type
                .as_deref()
                .map(DeviceType::parse)
                .unwrap_or_default(),
            user_id: user,
            client_addr: client_addr(&headers, peer.map(|ConnectInfo(addr)| addr)),
        })
        .await
        .map_err(|e| ApiError::from(e).with_path("/api/v1/chunked/init"))?;

    Ok(Json(snapshot))
}

/// 从 multipart 中解析出的分片
#[derive(Debug, Default)]
struct ChunkForm {
    upload_id: Option<String>,
    chunk_number: Option<u32>,
    total_chunks: Option<u32>,
    checksum: Option<String>,
    data: Option<Vec<u8>>,
}

fn parse_number(field: &str, value: &str) -> ApiResult<u32> {
    value
        .trim()
        .parse()
        .map_err(|_| ApiError::bad_request(format!("字段 {} 不是有效的非负整数: {}", field, value)))
}

async fn read_chunk_form(mut multipart: Multipart) -> ApiResult<ChunkForm> {
    let mut form = ChunkForm::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("multipart 解析失败: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => {
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("读取分片数据失败: {}", e)))?;
                form.data = Some(bytes.to_vec());
            }
            "uploadId" | "chunkNumber" | "totalChunks" | "checksum" => {
                let text = field
                    .text()
                    .await
                    .map_err(|e| ApiError::bad_request(format!("读取字段 {} 失败: {}", name, e)))?;
                match name.as_str() {
                    "uploadId" => form.upload_id = Some(text.trim().to_string()),
                    "chunkNumber" => form.chunk_number = Some(parse_number(&name, &text)?),
                    "totalChunks" => form.total_chunks = Some(parse_number(&name, &text)?),
                    _ => {
                        let text = text.trim();
                        if !text.is_empty() {
                            form.checksum = Some(text.to_string());
                        }
                    }
                }
            }
            other => debug!("忽略未知的 multipart 字段: {}", other),
        }
    }

    Ok(form)
}

/// POST /api/v1/chunked/upload
/// 上传一个分片（multipart: uploadId, chunkNumber, totalChunks, chunk, checksum?）
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> ApiResult<Json<UploadSnapshot>> {
    const PATH: &str = "/api/v1/chunked/upload";

    let form = read_chunk_form(multipart)
        .await
        .map_err(|e| e.with_path(PATH))?;

    let upload_id = form
        .upload_id
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("缺少字段 uploadId").with_path(PATH))?;
    let chunk_number = form.chunk_number.ok_or_else(|| {
        ApiError::bad_request("缺少字段 chunkNumber")
            .with_path(PATH)
            .with_upload_id(&upload_id)
    })?;
    let total_chunks = form.total_chunks.ok_or_else(|| {
        ApiError::bad_request("缺少字段 totalChunks")
            .with_path(PATH)
            .with_upload_id(&upload_id)
            .with_chunk_number(chunk_number)
    })?;
    let data = form.data.ok_or_else(|| {
        ApiError::bad_request("缺少字段 chunk")
            .with_path(PATH)
            .with_upload_id(&upload_id)
            .with_chunk_number(chunk_number)
    })?;

    debug!(
        "API: 接收分片: uploadId={}, chunk={}/{}, 大小={}",
        upload_id,
        chunk_number,
        total_chunks,
        data.len()
    );

    let snapshot = state
        .coordinator
        .accept_chunk(ChunkUpload {
            upload_id: &upload_id,
            chunk_index: chunk_number,
            total_chunks,
            data: &data,
            checksum: form.checksum.as_deref(),
        })
        .await
        .map_err(|e| {
            ApiError::from(e)
                .with_path(PATH)
                .with_upload_id(&upload_id)
                .with_chunk_number(chunk_number)
        })?;

    Ok(Json(snapshot))
}

/// GET /api/v1/chunked/status/:upload_id
/// 查询上传状态
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<UploadSnapshot>> {
    let snapshot = state.coordinator.status(&upload_id).map_err(|e| {
        ApiError::from(e)
            .with_path(format!("/api/v1/chunked/status/{}", upload_id))
            .with_upload_id(&upload_id)
    })?;
    Ok(Json(snapshot))
}

/// DELETE /api/v1/chunked/cancel/:upload_id
/// 取消上传，会话不存在时同样返回成功
pub async fn cancel_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> ApiResult<Json<ApiResponse<CancelResponse>>> {
    info!("API: 取消上传: uploadId={}", upload_id);

    let existed = state.coordinator.cancel(&upload_id).await.map_err(|e| {
        ApiError::from(e)
            .with_path(format!("/api/v1/chunked/cancel/{}", upload_id))
            .with_upload_id(&upload_id)
    })?;

    let message = if existed {
        "上传已取消"
    } else {
        "上传会话不存在或已清理"
    };
    Ok(Json(ApiResponse::success_with_message(
        CancelResponse { upload_id, existed },
        message,
    )))
}

/// GET /api/v1/chunked/sessions
/// 列出当前会话
pub async fn list_sessions(
    State(state): State<AppState>,
) -> Json<ApiResponse<SessionListResponse>> {
    let sessions = state.coordinator.list_active();
    let total_sessions = sessions.len();
    Json(ApiResponse::success(SessionListResponse {
        sessions,
        total_sessions,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_user_id_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("  "));
        assert_eq!(user_id(&headers), "anonymous");

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("alice"));
        assert_eq!(user_id(&headers), "alice");
    }

    #[test]
    fn test_client_addr_prefers_forwarded_for() {
        let peer: SocketAddr = "10.0.0.9:5000".parse().unwrap();
        let mut headers = HeaderMap::new();
        assert_eq!(client_addr(&headers, Some(peer)).as_deref(), Some("10.0.0.9"));
        assert_eq!(client_addr(&headers, None), None);

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(
            client_addr(&headers, Some(peer)).as_deref(),
            Some("203.0.113.7")
        );
    }

    #[test]
    fn test_parse_number_rejects_negative() {
        assert_eq!(parse_number("chunkNumber", " 12 ").unwrap(), 12);
        let err = parse_number("chunkNumber", "-1").unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }
}
