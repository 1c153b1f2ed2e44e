// 转换服务器客户端
//
// UploadTransport 是上传引擎与网络之间的接缝：
// - HttpUploadClient 基于 reqwest 实现真实协议
// - 测试中使用脚本化的内存实现

use crate::api::{
    ChunkAck, ChunkPayload, ChunkedCompleteRequest, ChunkedInitRequest, ChunkedInitResponse,
    UnifiedUpload, UploadError, UploadErrorKind, UploadJobResponse,
};
use crate::config::{ServerConfig, UploadConfig};
use async_trait::async_trait;
use reqwest::multipart;
use reqwest::{Body, Client, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::{debug, error, info};

const INIT_PATH: &str = "upload/chunked/init";
const CHUNK_PATH: &str = "upload/chunked/chunk";
const COMPLETE_PATH: &str = "upload/chunked/complete";
const UNIFIED_PATH: &str = "upload/unified";

/// 错误日志中响应体最多保留的字符数
const MAX_LOGGED_BODY: usize = 512;

/// 上传传输层
///
/// 每个方法对应一次原子请求；重试与并发控制由上层负责
#[async_trait]
pub trait UploadTransport: Send + Sync {
    /// 初始化分片上传会话
    async fn init_chunked(
        &self,
        request: &ChunkedInitRequest,
    ) -> Result<ChunkedInitResponse, UploadError>;

    /// 上传单个分片
    async fn upload_chunk(&self, payload: ChunkPayload) -> Result<ChunkAck, UploadError>;

    /// 完成分片上传会话，创建转换任务
    async fn complete_chunked(
        &self,
        request: &ChunkedCompleteRequest,
    ) -> Result<UploadJobResponse, UploadError>;

    /// 小文件一次性流式上传
    async fn upload_unified(&self, upload: UnifiedUpload)
        -> Result<UploadJobResponse, UploadError>;
}

/// 基于 reqwest 的转换服务器客户端
#[derive(Debug, Clone)]
pub struct HttpUploadClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    chunk_timeout: Duration,
    direct_timeout: Duration,
}

impl HttpUploadClient {
    pub fn new(server: &ServerConfig, upload: &UploadConfig) -> Result<Self, UploadError> {
        let client = Client::builder()
            .connect_timeout(server.connect_timeout())
            .user_agent(concat!("video-convert-uploader/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| UploadError::InvalidConfig(format!("创建 HTTP 客户端失败: {}", e)))?;

        info!("初始化转换服务器客户端: base_url={}", server.base_url);

        Ok(Self {
            client,
            base_url: server.base_url.trim_end_matches('/').to_string(),
            request_timeout: server.request_timeout(),
            chunk_timeout: upload.chunk_timeout(),
            direct_timeout: upload.direct_timeout(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    /// 检查状态码并解析 JSON 响应
    async fn read_json<T: DeserializeOwned>(
        response: Response,
        what: &str,
    ) -> Result<T, UploadError> {
        let status = response.status();
        let body = response.text().await?;

        debug!("{}响应: status={}, body={}", what, status, truncate(&body));

        if !status.is_success() {
            let kind = UploadErrorKind::from_status(status.as_u16());
            error!(
                "{}失败: status={}, retriable={}, body={}",
                what,
                status,
                kind.is_retriable(),
                truncate(&body)
            );
            return Err(UploadError::http(
                kind,
                Some(status.as_u16()),
                format!("{}: HTTP {} {}", what, status, truncate(&body)),
            ));
        }

        serde_json::from_str(&body).map_err(|e| {
            UploadError::malformed(format!(
                "解析{}响应失败: {}, body={}",
                what,
                e,
                truncate(&body)
            ))
        })
    }
}

#[async_trait]
impl UploadTransport for HttpUploadClient {
    async fn init_chunked(
        &self,
        request: &ChunkedInitRequest,
    ) -> Result<ChunkedInitResponse, UploadError> {
        info!(
            "初始化分片会话: file={}, size={}, chunk_size={}, chunks={}",
            request.file_name, request.file_size, request.chunk_size, request.total_chunks
        );

        let response = self
            .client
            .post(self.endpoint(INIT_PATH))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        let init: ChunkedInitResponse = Self::read_json(response, "初始化分片会话").await?;
        if init.session_id.trim().is_empty() {
            return Err(UploadError::malformed("初始化分片会话失败：未获取到 sessionId"));
        }
        Ok(init)
    }

    async fn upload_chunk(&self, payload: ChunkPayload) -> Result<ChunkAck, UploadError> {
        let index = payload.index;
        debug!(
            "上传分片: session={}..., index={}, size={}",
            payload.session_id.chars().take(8).collect::<String>(),
            index,
            payload.size
        );

        let part = multipart::Part::stream_with_length(Body::from(payload.data), payload.size)
            .file_name(format!("chunk_{}", index))
            .mime_str("application/octet-stream")?;

        let mut form = multipart::Form::new()
            .text("sessionId", payload.session_id)
            .text("chunkIndex", index.to_string())
            .text("chunkSize", payload.size.to_string());
        if let Some(hash) = payload.hash {
            form = form.text("chunkHash", hash);
        }
        let form = form.part("chunk", part);

        let response = self
            .client
            .post(self.endpoint(CHUNK_PATH))
            .timeout(self.chunk_timeout)
            .multipart(form)
            .send()
            .await?;

        // success=false 原样返回，由上传引擎判定是否重试
        let ack: ChunkAck = Self::read_json(response, "上传分片").await?;
        if !ack.success {
            debug!(
                "分片 #{} 未被确认: {}",
                index,
                ack.message.as_deref().unwrap_or("未知原因")
            );
        }
        Ok(ack)
    }

    async fn complete_chunked(
        &self,
        request: &ChunkedCompleteRequest,
    ) -> Result<UploadJobResponse, UploadError> {
        info!("完成分片会话: session={}", request.session_id);

        let response = self
            .client
            .post(self.endpoint(COMPLETE_PATH))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        Self::read_json(response, "完成分片会话").await
    }

    async fn upload_unified(
        &self,
        upload: UnifiedUpload,
    ) -> Result<UploadJobResponse, UploadError> {
        info!(
            "直传文件: file={}, size={}",
            upload.file_name, upload.file_size
        );

        let request_json = serde_json::to_string(&upload.request)
            .map_err(|e| UploadError::InvalidConfig(format!("序列化转换参数失败: {}", e)))?;

        let part =
            multipart::Part::stream_with_length(Body::wrap_stream(upload.body), upload.file_size)
                .file_name(upload.file_name)
                .mime_str("application/octet-stream")?;

        let form = multipart::Form::new()
            .text("request", request_json)
            .part("file", part);

        let response = self
            .client
            .post(self.endpoint(UNIFIED_PATH))
            .timeout(self.direct_timeout)
            .multipart(form)
            .send()
            .await?;

        Self::read_json(response, "直传文件").await
    }
}

fn truncate(body: &str) -> &str {
    match body.char_indices().nth(MAX_LOGGED_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}
