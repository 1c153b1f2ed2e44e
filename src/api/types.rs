// 转换服务器 API 数据类型
//
// 包含：
// - 分片上传协议的请求/响应结构（init / chunk / complete）
// - 小文件一次性上传（unified）的请求结构
// - 上传错误分类与统一错误类型

use bytes::Bytes;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::pin::Pin;

/// 上传请求体字节流（直传路径使用）
///
/// reqwest 的 `Body::wrap_stream` 要求 Send + Sync
pub type ByteStream = Pin<Box<dyn Stream<Item = std::io::Result<Bytes>> + Send + Sync>>;

// =====================================================
// 转换任务参数
// =====================================================

/// 转换任务请求（随上传一起提交给服务器）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversionJobRequest {
    /// 目标容器格式，如 "mp4"、"webm"
    pub output_format: String,
    /// 视频编码器
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_codec: Option<String>,
    /// 音频编码器
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_codec: Option<String>,
    /// 目标分辨率，如 "1920x1080"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    /// 视频码率 (kbps)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_bitrate_kbps: Option<u32>,
    /// 其他透传参数
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub extra_options: HashMap<String, String>,
}

impl ConversionJobRequest {
    pub fn new(output_format: impl Into<String>) -> Self {
        Self {
            output_format: output_format.into(),
            ..Default::default()
        }
    }
}

// =====================================================
// 分片上传协议
// =====================================================

/// POST /upload/chunked/init 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedInitRequest {
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: usize,
    /// 整文件 SHA-256（默认关闭，大文件计算开销高）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_hash: Option<String>,
    pub request: ConversionJobRequest,
}

/// POST /upload/chunked/init 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedInitResponse {
    /// 服务器签发的会话 ID（不透明令牌）
    pub session_id: String,
}

/// 单个分片的上传载荷
#[derive(Debug, Clone)]
pub struct ChunkPayload {
    pub session_id: String,
    pub index: usize,
    pub size: u64,
    pub data: Bytes,
    /// 分片 MD5（可选）
    pub hash: Option<String>,
}

/// POST /upload/chunked/chunk 响应（分片确认）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub chunk_index: Option<usize>,
    #[serde(default)]
    pub message: Option<String>,
}

fn default_true() -> bool {
    true
}

/// POST /upload/chunked/complete 请求体
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkedCompleteRequest {
    pub session_id: String,
    pub request: ConversionJobRequest,
}

/// 创建转换任务的响应（complete 与 unified 共用）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadJobResponse {
    pub success: bool,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl UploadJobResponse {
    /// 提取任务 ID，服务器拒绝或缺失 ID 时返回错误
    pub fn into_job_id(self) -> Result<String, UploadError> {
        if !self.success {
            return Err(UploadError::http(
                UploadErrorKind::Rejected,
                None,
                self.message.unwrap_or_else(|| "服务器拒绝创建转换任务".to_string()),
            ));
        }
        match self.job_id {
            Some(id) if !id.is_empty() => Ok(id),
            _ => Err(UploadError::malformed("响应中缺少 jobId")),
        }
    }
}

/// POST /upload/unified 请求（小文件一次性上传）
pub struct UnifiedUpload {
    pub file_name: String,
    pub file_size: u64,
    pub request: ConversionJobRequest,
    pub body: ByteStream,
}

// =====================================================
// 错误分类
// =====================================================

/// 上传错误类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadErrorKind {
    /// 网络错误（可重试）
    Network,
    /// 超时（可重试）
    Timeout,
    /// 服务器错误（可重试）
    ServerError,
    /// 限流（可重试）
    RateLimited,
    /// 会话或资源不存在（不可重试）
    NotFound,
    /// 权限不足（不可重试）
    Forbidden,
    /// 参数错误（不可重试）
    BadRequest,
    /// 响应格式错误（不可重试）
    MalformedResponse,
    /// 服务器明确拒绝（不可重试）
    Rejected,
    /// 未知错误
    Unknown,
}

impl UploadErrorKind {
    /// 是否可重试
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            UploadErrorKind::Network
                | UploadErrorKind::Timeout
                | UploadErrorKind::ServerError
                | UploadErrorKind::RateLimited
        )
    }

    /// 从 HTTP 状态码转换
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => UploadErrorKind::Timeout,
            429 => UploadErrorKind::RateLimited,
            404 | 410 => UploadErrorKind::NotFound,
            401 | 403 => UploadErrorKind::Forbidden,
            400..=499 => UploadErrorKind::BadRequest,
            500..=599 => UploadErrorKind::ServerError,
            _ => UploadErrorKind::Unknown,
        }
    }
}

/// 上传引擎统一错误
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// 调用方取消（不是失败）
    #[error("操作已取消")]
    Cancelled,

    #[error("请求失败 [{kind:?}]: {message}")]
    Http {
        kind: UploadErrorKind,
        status: Option<u16>,
        message: String,
    },

    #[error("读取本地文件失败: {0}")]
    Io(#[from] std::io::Error),

    #[error("重试 {attempts} 次后仍失败: {last}")]
    RetriesExhausted {
        attempts: u32,
        #[source]
        last: Box<UploadError>,
    },

    #[error("分片 #{index} 上传失败: {source}")]
    ChunkFailed {
        index: usize,
        #[source]
        source: Box<UploadError>,
    },

    #[error("会话未完成: 仅 {completed}/{total} 个分片已确认")]
    IncompleteSession { completed: usize, total: usize },

    #[error("配置无效: {0}")]
    InvalidConfig(String),

    #[error("任务异常退出: {0}")]
    TaskAborted(String),
}

impl UploadError {
    pub fn http(kind: UploadErrorKind, status: Option<u16>, message: impl Into<String>) -> Self {
        UploadError::Http {
            kind,
            status,
            message: message.into(),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::http(UploadErrorKind::MalformedResponse, None, message)
    }

    /// 是否为取消
    pub fn is_cancelled(&self) -> bool {
        match self {
            UploadError::Cancelled => true,
            UploadError::ChunkFailed { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// 是否可重试（只有瞬时网络类错误可以重试）
    pub fn is_retriable(&self) -> bool {
        match self {
            UploadError::Http { kind, .. } => kind.is_retriable(),
            _ => false,
        }
    }

    /// 错误分类（非 HTTP 错误返回 None）
    pub fn kind(&self) -> Option<UploadErrorKind> {
        match self {
            UploadError::Http { kind, .. } => Some(*kind),
            UploadError::RetriesExhausted { last, .. } => last.kind(),
            UploadError::ChunkFailed { source, .. } => source.kind(),
            _ => None,
        }
    }

    /// 面向用户的错误描述：展开包装，保留最后一个底层错误
    pub fn user_message(&self) -> String {
        match self {
            UploadError::RetriesExhausted { last, .. } => last.user_message(),
            UploadError::ChunkFailed { index, source } => {
                format!("分片 #{}: {}", index, source.user_message())
            }
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for UploadError {
    fn from(e: reqwest::Error) -> Self {
        let status = e.status().map(|s| s.as_u16());
        let kind = if e.is_timeout() {
            UploadErrorKind::Timeout
        } else if let Some(code) = status {
            UploadErrorKind::from_status(code)
        } else if e.is_decode() {
            UploadErrorKind::MalformedResponse
        } else if e.is_connect() || e.is_request() || e.is_body() {
            UploadErrorKind::Network
        } else {
            UploadErrorKind::Unknown
        };

        UploadError::Http {
            kind,
            status,
            message: e.to_string(),
        }
    }
}
