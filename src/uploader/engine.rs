// 分片上传引擎
//
// 一个文件的分片上传协议：
// 1. init：创建服务端会话，拿到 session id（失败直接返回，不在本层重试）
// 2. 分片：每个分片一个并发任务，经 chunk 类准入控制 + 重试执行器发送
// 3. complete：所有分片都被确认后才调用，返回转换任务 ID
//
// 任一分片重试耗尽即整个会话失败：通知其余分片停止，等待已启动的
// 任务全部退出后再返回错误，complete 永远不会被调用。

use crate::api::{
    ChunkAck, ChunkPayload, ChunkedCompleteRequest, ChunkedInitRequest, ConversionJobRequest,
    UploadError, UploadErrorKind, UploadTransport,
};
use crate::concurrency::ConcurrencyManager;
use crate::config::UploadConfig;
use crate::uploader::chunk::{ChunkDescriptor, ChunkPlan, SharedFileReader, UploadSession};
use crate::uploader::hash;
use crate::uploader::progress::ProgressAggregator;
use crate::uploader::retry::RetryExecutor;
use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片上传编排器
pub struct ChunkUploadOrchestrator {
    transport: Arc<dyn UploadTransport>,
    concurrency: Arc<ConcurrencyManager>,
    retry: RetryExecutor,
    chunk_size: u64,
    compute_file_hash: bool,
    compute_chunk_hash: bool,
}

impl ChunkUploadOrchestrator {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        concurrency: Arc<ConcurrencyManager>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            transport,
            concurrency,
            retry: RetryExecutor::new(config.retry_policy()),
            chunk_size: config.chunk_size,
            compute_file_hash: config.compute_file_hash,
            compute_chunk_hash: config.compute_chunk_hash,
        }
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 分片上传一个文件，成功返回转换任务 ID
    ///
    /// # 参数
    /// * `operation_id` - 上层操作 ID，分片在 chunk 类中登记为 `<id>#<index>`
    /// * `progress` - 调用方分配好区间的进度聚合器
    pub async fn upload(
        &self,
        operation_id: &str,
        path: &Path,
        file_size: u64,
        request: &ConversionJobRequest,
        progress: Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let plan = ChunkPlan::new(file_size, self.chunk_size)?;
        let file_name = file_name_of(path);

        info!(
            "[{}] 开始分片上传: {} ({} bytes, {} 个分片, 分片大小 {} bytes)",
            operation_id,
            file_name,
            file_size,
            plan.chunk_count(),
            plan.chunk_size()
        );

        let file_hash = if self.compute_file_hash {
            let digest = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                result = hash::file_sha256(path, cancel) => result?,
            };
            Some(digest)
        } else {
            None
        };

        // 1. init
        let init_request = ChunkedInitRequest {
            file_name: file_name.clone(),
            file_size,
            chunk_size: plan.chunk_size(),
            total_chunks: plan.chunk_count(),
            file_hash,
            request: request.clone(),
        };
        let init = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = self.transport.init_chunked(&init_request) => result,
        }
        .map_err(|e| {
            error!("[{}] 初始化上传会话失败: {}", operation_id, e);
            e
        })?;

        if init.session_id.is_empty() {
            return Err(UploadError::malformed("init 响应中 sessionId 为空"));
        }
        let session = Arc::new(UploadSession::new(init.session_id, plan.chunk_count()));
        info!(
            "[{}] 上传会话已创建: session={}",
            operation_id,
            session.session_id()
        );
        progress.begin();

        // 2. 分片
        let reader = Arc::new(SharedFileReader::open(path).await?);
        self.upload_chunks(operation_id, &plan, &session, &reader, &progress, cancel)
            .await?;

        if !session.is_complete() {
            return Err(UploadError::IncompleteSession {
                completed: session.completed_count(),
                total: session.total_chunks(),
            });
        }

        // 3. complete
        let complete_request = ChunkedCompleteRequest {
            session_id: session.session_id().to_string(),
            request: request.clone(),
        };
        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            result = self.transport.complete_chunked(&complete_request) => result,
        }?;
        let job_id = response.into_job_id()?;

        progress.finish();
        info!(
            "[{}] 分片上传完成: session={}, job={}",
            operation_id,
            session.session_id(),
            job_id
        );
        Ok(job_id)
    }

    /// 并发上传全部分片
    ///
    /// 返回前保证所有已启动的分片任务都已结束
    async fn upload_chunks(
        &self,
        operation_id: &str,
        plan: &ChunkPlan,
        session: &Arc<UploadSession>,
        reader: &Arc<SharedFileReader>,
        progress: &Arc<ProgressAggregator>,
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        // 首个致命错误出现后用它通知其余分片停止
        let halt = cancel.child_token();
        let mut join_set: JoinSet<(usize, Result<(), UploadError>)> = JoinSet::new();

        for chunk in plan.chunks().iter().copied() {
            let task = ChunkTask {
                operation_id: format!("{}#{}", operation_id, chunk.index),
                transport: self.transport.clone(),
                concurrency: self.concurrency.clone(),
                retry: self.retry,
                session: session.clone(),
                reader: reader.clone(),
                progress: progress.clone(),
                halt: halt.clone(),
                compute_hash: self.compute_chunk_hash,
            };
            join_set.spawn(async move { (chunk.index, task.run(chunk).await) });
        }

        let mut first_error: Option<UploadError> = None;
        while let Some(joined) = join_set.join_next().await {
            let failure = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((_, Err(e))) if e.is_cancelled() => UploadError::Cancelled,
                Ok((index, Err(e))) => {
                    if first_error.is_none() {
                        error!("[{}][分片#{}] 上传失败: {}", operation_id, index, e);
                    }
                    UploadError::ChunkFailed {
                        index,
                        source: Box::new(e),
                    }
                }
                Err(e) => {
                    error!("[{}] 分片任务异常: {}", operation_id, e);
                    UploadError::TaskAborted(e.to_string())
                }
            };

            if first_error.is_none() {
                if !failure.is_cancelled() {
                    warn!(
                        "[{}] 会话放弃，等待其余 {} 个分片任务退出",
                        operation_id,
                        join_set.len()
                    );
                }
                halt.cancel();
                first_error = Some(failure);
            }
        }

        if cancel.is_cancelled() {
            info!("[{}] 分片上传已取消", operation_id);
            return Err(UploadError::Cancelled);
        }
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(
                    "[{}] 所有 {} 个分片上传完成",
                    operation_id,
                    plan.chunk_count()
                );
                Ok(())
            }
        }
    }
}

/// 单个分片任务，拥有发送所需的全部共享状态
struct ChunkTask {
    operation_id: String,
    transport: Arc<dyn UploadTransport>,
    concurrency: Arc<ConcurrencyManager>,
    retry: RetryExecutor,
    session: Arc<UploadSession>,
    reader: Arc<SharedFileReader>,
    progress: Arc<ProgressAggregator>,
    halt: CancellationToken,
    compute_hash: bool,
}

impl ChunkTask {
    async fn run(self, chunk: ChunkDescriptor) -> Result<(), UploadError> {
        let concurrency = self.concurrency.clone();
        let operation_id = self.operation_id.clone();
        let halt = self.halt.clone();

        concurrency
            .run_chunk(&operation_id, &halt, move |token| async move {
                self.transmit(chunk, &token).await
            })
            .await
    }

    async fn transmit(
        &self,
        chunk: ChunkDescriptor,
        token: &CancellationToken,
    ) -> Result<(), UploadError> {
        let label = format!("分片#{}", chunk.index);
        let this = self;
        self.retry
            .execute(&label, token, move |attempt| {
                this.send_once(chunk, attempt, token)
            })
            .await?;

        let completed = self.session.mark_acknowledged(chunk.index);
        self.progress.update(chunk.length);
        debug!(
            "[分片#{}] 已确认 ({}/{})",
            chunk.index,
            completed,
            self.session.total_chunks()
        );
        Ok(())
    }

    /// 一次发送尝试：每次都从原偏移重新读取整段字节
    async fn send_once(
        &self,
        chunk: ChunkDescriptor,
        attempt: u32,
        token: &CancellationToken,
    ) -> Result<ChunkAck, UploadError> {
        let data = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(UploadError::Cancelled),
            result = self.reader.read_chunk(&chunk) => result?,
        };
        let hash = self.compute_hash.then(|| hash::chunk_md5(&data));

        debug!(
            "[分片#{}] 第 {} 次发送, {} bytes",
            chunk.index, attempt, chunk.length
        );
        let payload = ChunkPayload {
            session_id: self.session.session_id().to_string(),
            index: chunk.index,
            size: chunk.length,
            data,
            hash,
        };

        // 取消时直接丢弃进行中的请求
        let ack = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(UploadError::Cancelled),
            result = self.transport.upload_chunk(payload) => result?,
        };

        if !ack.success {
            return Err(UploadError::http(
                UploadErrorKind::ServerError,
                None,
                ack.message
                    .clone()
                    .unwrap_or_else(|| format!("服务器未确认分片 #{}", chunk.index)),
            ));
        }
        if let Some(acked) = ack.chunk_index {
            if acked != chunk.index {
                return Err(UploadError::malformed(format!(
                    "分片确认索引不符: 期望 {}, 实际 {}",
                    chunk.index, acked
                )));
            }
        }
        Ok(ack)
    }
}

pub(crate) fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
