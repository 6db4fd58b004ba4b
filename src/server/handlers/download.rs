// 自适应下载API处理器

use crate::downloader::AdaptiveStreamer;
use crate::server::{ApiError, ApiResult, AppState};
use crate::uploader::DEFAULT_CHUNK_SIZE;
use axum::{
    body::Body,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use std::io;
use tokio_util::io::ReaderStream;
use tracing::{error, info};

/// 下载查询参数
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    pub network_speed_mbps: Option<f64>,
    pub latency_ms: Option<u64>,
}

/// 文件名只能是单个路径分量
pub fn is_safe_download_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains('/')
        && !name.contains('\\')
        && !name.contains("..")
        && !name.contains('\0')
}

fn header_value(value: impl ToString) -> HeaderValue {
    HeaderValue::from_str(&value.to_string()).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// `filename` 只放 ASCII 兜底名，完整文件名走 RFC 5987 的 `filename*`
fn content_disposition(name: &str) -> HeaderValue {
    let fallback: String = name
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| match c {
            '"' => '\'',
            c if c.is_ascii() => c,
            _ => '_',
        })
        .collect();
    header_value(format!(
        "attachment; filename=\"{}\"; filename*=UTF-8''{}",
        fallback,
        urlencoding::encode(name)
    ))
}

/// GET /api/v1/files/:name/download
/// 按网络状况选择窗口大小下载文件，gzip 文件透明解压
pub async fn download_file(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Query(query): Query<DownloadQuery>,
) -> ApiResult<Response> {
    let path_label = format!("/api/v1/files/{}/download", name);

    if !is_safe_download_name(&name) {
        return Err(ApiError::bad_request(format!("非法的文件名: {}", name)).with_path(path_label));
    }

    let path = state.config.download.files_dir.join(&name);
    let not_found = || ApiError::not_found(format!("文件不存在: {}", name)).with_path(&path_label);

    match tokio::fs::metadata(&path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Err(not_found()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => {
            error!("读取文件信息失败: {:?}, 错误: {}", path, e);
            return Err(ApiError::internal(format!("读取文件失败: {}", e)).with_path(&path_label));
        }
    }

    let params = state
        .predictor
        .predict(query.network_speed_mbps, query.latency_ms)
        .await;
    let window = usize::try_from(params.chunk_size).unwrap_or(DEFAULT_CHUNK_SIZE as usize);

    let (streamer, source) = match AdaptiveStreamer::open(&path, window).await {
        Ok(opened) => opened,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
        Err(e) => {
            error!("打开下载文件失败: {:?}, 错误: {}", path, e);
            return Err(ApiError::internal(format!("打开文件失败: {}", e)).with_path(&path_label));
        }
    };

    info!(
        "API: 下载文件: {}, 窗口={} 字节, 网络={}, 压缩={}, 原始大小={}",
        name, window, params.network_condition, source.is_compressed, source.original_size
    );

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/octet-stream"),
    );
    headers.insert(header::CONTENT_DISPOSITION, content_disposition(&name));
    headers.insert(
        HeaderName::from_static("x-chunk-size"),
        header_value(params.chunk_size),
    );
    headers.insert(
        HeaderName::from_static("x-network-condition"),
        HeaderValue::from_static(params.network_condition.as_str()),
    );
    headers.insert(
        HeaderName::from_static("x-is-compressed"),
        header_value(source.is_compressed),
    );
    headers.insert(
        HeaderName::from_static("x-original-size"),
        header_value(source.original_size),
    );
    // 压缩文件解压后的长度未知，只给原样输出的文件设置 Content-Length
    if source.is_compressed {
        headers.insert(
            HeaderName::from_static("x-compressed-size"),
            header_value(source.stored_size),
        );
    } else {
        headers.insert(header::CONTENT_LENGTH, header_value(source.stored_size));
    }

    let body = Body::from_stream(ReaderStream::with_capacity(streamer, window));
    Ok((StatusCode::OK, headers, body).into_response())
}
