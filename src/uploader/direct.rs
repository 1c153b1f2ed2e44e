// 小文件直传
//
// 整个文件作为一个 multipart 请求流式发送（POST /upload/unified）。
// 每次尝试都重新打开文件从头发送；失败时把本次已计入的字节从进度中回退，
// 可见进度保持在高水位不倒退。

use crate::api::{
    ConversionJobRequest, UnifiedUpload, UploadError, UploadJobResponse, UploadTransport,
};
use crate::config::UploadConfig;
use crate::uploader::engine::file_name_of;
use crate::uploader::progress::ProgressAggregator;
use crate::uploader::retry::RetryExecutor;
use futures::StreamExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 读取缓冲: 256KB
const STREAM_BUFFER_SIZE: usize = 256 * 1024;

/// 直传上传器
pub struct DirectUploader {
    transport: Arc<dyn UploadTransport>,
    retry: RetryExecutor,
}

impl DirectUploader {
    pub fn new(transport: Arc<dyn UploadTransport>, config: &UploadConfig) -> Self {
        Self {
            transport,
            retry: RetryExecutor::new(config.retry_policy()),
        }
    }

    /// 直传一个文件，成功返回转换任务 ID
    pub async fn upload(
        &self,
        operation_id: &str,
        path: &Path,
        file_size: u64,
        request: &ConversionJobRequest,
        progress: Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let file_name = file_name_of(path);
        info!(
            "[{}] 开始直传: {} ({} bytes)",
            operation_id, file_name, file_size
        );
        progress.begin();

        let response = self
            .retry
            .execute(operation_id, cancel, |attempt| {
                self.send_once(attempt, path, &file_name, file_size, request, &progress, cancel)
            })
            .await?;
        let job_id = response.into_job_id()?;

        progress.finish();
        info!("[{}] 直传完成: job={}", operation_id, job_id);
        Ok(job_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn send_once(
        &self,
        attempt: u32,
        path: &Path,
        file_name: &str,
        file_size: u64,
        request: &ConversionJobRequest,
        progress: &Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> Result<UploadJobResponse, UploadError> {
        let file = tokio::fs::File::open(path).await?;
        let sent = Arc::new(AtomicU64::new(0));

        let body = {
            let progress = progress.clone();
            let sent = sent.clone();
            ReaderStream::with_capacity(file, STREAM_BUFFER_SIZE).map(move |item| {
                if let Ok(bytes) = &item {
                    let n = bytes.len() as u64;
                    sent.fetch_add(n, Ordering::Relaxed);
                    progress.update(n);
                }
                item
            })
        };

        debug!("直传第 {} 次尝试: {}", attempt, file_name);
        let upload = UnifiedUpload {
            file_name: file_name.to_string(),
            file_size,
            request: request.clone(),
            body: Box::pin(body),
        };

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            result = self.transport.upload_unified(upload) => result,
        };

        if result.is_err() {
            progress.rewind(sent.load(Ordering::Relaxed));
        }
        result
    }
}
