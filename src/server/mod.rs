// Web服务器模块

pub mod error;
pub mod handlers;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    extract::DefaultBodyLimit,
    http::HeaderValue,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

/// CORS 配置，未配置来源时允许任意来源
fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| match HeaderValue::from_str(o) {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("忽略无效的 CORS 来源: {}", o);
                None
            }
        })
        .collect();

    let origin = if parsed.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(parsed)
    };

    CorsLayer::new()
        .allow_origin(origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

/// 构建 API 路由
pub fn build_router(state: AppState) -> Router {
    let max_request_bytes = state.config.upload.max_request_bytes;

    // 配置中间件层
    let middleware = ServiceBuilder::new()
        .layer(TraceLayer::new_for_http()) // HTTP 请求日志
        .layer(cors_layer(&state.config.server.cors_origins));

    let api_routes = Router::new()
        // 分片上传API
        .route("/chunked/init", post(handlers::init_upload))
        .route(
            "/chunked/upload",
            post(handlers::upload_chunk).layer(DefaultBodyLimit::max(max_request_bytes)),
        )
        .route("/chunked/status/:upload_id", get(handlers::upload_status))
        .route("/chunked/cancel/:upload_id", delete(handlers::cancel_upload))
        .route("/chunked/sessions", get(handlers::list_sessions))
        // 下载API
        .route("/files/:name/download", get(handlers::download_file))
        // 健康检查
        .route("/health", get(handlers::health));

    Router::new()
        .nest("/api/v1", api_routes)
        .layer(middleware)
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use async_compression::tokio::write::GzipEncoder;
    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
        response::Response,
    };
    use serde_json::{json, Value};
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;
    use tower::ServiceExt;

    const BOUNDARY: &str = "chunk-transfer-test-boundary";

    fn test_app(tmp: &TempDir) -> Router {
        let mut config = AppConfig::default();
        config.upload.temp_dir = tmp.path().join("temp");
        config.upload.final_dir = tmp.path().join("files");
        config.download.files_dir = tmp.path().join("files");
        build_router(AppState::new(config))
    }

    async fn body_json(resp: Response) -> Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn multipart_body(fields: &[(&str, &str)], chunk: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        for (name, value) in fields {
            body.extend_from_slice(
                format!(
                    "--{}\r\nContent-Disposition: form-data; name=\"{}\"\r\n\r\n{}\r\n",
                    BOUNDARY, name, value
                )
                .as_bytes(),
            );
        }
        body.extend_from_slice(
            format!(
                "--{}\r\nContent-Disposition: form-data; name=\"chunk\"; filename=\"blob\"\r\n\
                 Content-Type: application/octet-stream\r\n\r\n",
                BOUNDARY
            )
            .as_bytes(),
        );
        body.extend_from_slice(chunk);
        body.extend_from_slice(format!("\r\n--{}--\r\n", BOUNDARY).as_bytes());
        body
    }

    fn upload_request(fields: &[(&str, &str)], chunk: &[u8]) -> Request<Body> {
        Request::post("/api/v1/chunked/upload")
            .header(
                "content-type",
                format!("multipart/form-data; boundary={}", BOUNDARY),
            )
            .body(Body::from(multipart_body(fields, chunk)))
            .unwrap()
    }

    fn init_request(body: Value) -> Request<Body> {
        Request::post("/api/v1/chunked/init")
            .header("content-type", "application/json")
            .header("x-user-id", "alice")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let tmp = TempDir::new().unwrap();
        let resp = test_app(&tmp)
            .oneshot(Request::get("/api/v1/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["code"], 0);
        assert_eq!(body["data"]["status"], "UP");
    }

    #[tokio::test]
    async fn test_upload_flow_over_http() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);
        let content = b"hello chunked world".repeat(100);

        let resp = app
            .clone()
            .oneshot(init_request(json!({
                "fileName": "greeting.txt",
                "fileSize": content.len(),
            })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let init = body_json(resp).await;
        assert_eq!(init["status"], "INITIALIZED");
        assert_eq!(init["totalChunks"], 1);
        assert_eq!(init["fileType"], "text/plain");
        let upload_id = init["uploadId"].as_str().unwrap().to_string();

        let resp = app
            .clone()
            .oneshot(upload_request(
                &[
                    ("uploadId", upload_id.as_str()),
                    ("chunkNumber", "0"),
                    ("totalChunks", "1"),
                ],
                &content,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let chunk = body_json(resp).await;
        assert_eq!(chunk["status"], "COMPLETED");
        assert_eq!(chunk["chunkNumber"], 0);
        assert_eq!(chunk["progress"], 100.0);

        let final_path = chunk["finalFilePath"].as_str().unwrap();
        assert_eq!(std::fs::read(final_path).unwrap(), content);

        let resp = app
            .clone()
            .oneshot(
                Request::get(format!("/api/v1/chunked/status/{}", upload_id))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["uploadedChunks"], 1);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/chunked/sessions")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let list = body_json(resp).await;
        assert_eq!(list["data"]["totalSessions"], 1);
        assert_eq!(list["data"]["sessions"][0]["userId"], "alice");
    }

    #[tokio::test]
    async fn test_upload_errors_are_structured() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/chunked/status/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let body = body_json(resp).await;
        assert_eq!(body["errorCode"], "SESSION_NOT_FOUND");
        assert_eq!(body["uploadId"], "nope");

        let resp = app
            .clone()
            .oneshot(upload_request(&[("uploadId", "nope")], b"data"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(resp).await["errorCode"], "VALIDATION_ERROR");

        let resp = app
            .clone()
            .oneshot(init_request(json!({ "fileName": "", "fileSize": 10 })))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_cancel_unknown_is_success() {
        let tmp = TempDir::new().unwrap();
        let resp = test_app(&tmp)
            .oneshot(
                Request::delete("/api/v1/chunked/cancel/unknown")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["existed"], false);
    }

    #[tokio::test]
    async fn test_download_gzip_file() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);
        let files = tmp.path().join("files");
        std::fs::create_dir_all(&files).unwrap();

        let data = b"adaptive download ".repeat(5000);
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(&data).await.unwrap();
        encoder.shutdown().await.unwrap();
        let compressed = encoder.into_inner();
        std::fs::write(files.join("log.txt.gz"), &compressed).unwrap();

        let resp = app
            .oneshot(
                Request::get("/api/v1/files/log.txt.gz/download?networkSpeedMbps=150&latencyMs=10")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers().clone();
        assert_eq!(headers["x-is-compressed"], "true");
        assert_eq!(headers["x-network-condition"], "EXCELLENT");
        assert_eq!(headers["x-chunk-size"], (5 * 1024 * 1024).to_string().as_str());
        assert_eq!(headers["x-original-size"], data.len().to_string().as_str());
        assert_eq!(
            headers["x-compressed-size"],
            compressed.len().to_string().as_str()
        );

        let body = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body.as_ref(), data.as_slice());
    }

    #[tokio::test]
    async fn test_download_rejects_bad_names() {
        let tmp = TempDir::new().unwrap();
        let app = test_app(&tmp);

        let resp = app
            .clone()
            .oneshot(
                Request::get("/api/v1/files/..%2Fsecret/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = app
            .oneshot(
                Request::get("/api/v1/files/missing.bin/download")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
