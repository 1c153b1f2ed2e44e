// 上传方式选择
//
// - 文件 > 阈值（默认 100MB）：分片上传
// - 文件 <= 阈值：一次性流式直传
//
// 两种方式都在 upload 类准入控制下执行，都经过同一个进度聚合器，
// 调用方只能看到进度流和最终结果（完成 / 暂停 / 错误）。

use crate::api::{ConversionJobRequest, UploadError, UploadTransport};
use crate::concurrency::ConcurrencyManager;
use crate::config::UploadConfig;
use crate::disk::DiskSpaceChecker;
use crate::uploader::chunk::CHUNKED_UPLOAD_THRESHOLD;
use crate::uploader::direct::DirectUploader;
use crate::uploader::engine::ChunkUploadOrchestrator;
use crate::uploader::progress::{ProgressAggregator, ProgressBand, ProgressSink, ProgressSnapshot};
use crate::uploader::task::{UploadTask, UploadTaskStatus};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// 上传方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStrategy {
    /// 单个请求流式直传
    Direct,
    /// 分片上传
    Chunked,
}

impl UploadStrategy {
    /// 严格大于阈值才分片
    pub fn select(file_size: u64, threshold: u64) -> Self {
        if file_size > threshold {
            UploadStrategy::Chunked
        } else {
            UploadStrategy::Direct
        }
    }

    /// 按默认阈值选择
    pub fn for_size(file_size: u64) -> Self {
        Self::select(file_size, CHUNKED_UPLOAD_THRESHOLD)
    }
}

/// 一次上传请求
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// 操作 ID，用于取消和查询
    pub id: String,
    pub path: PathBuf,
    pub job: ConversionJobRequest,
}

impl UploadRequest {
    pub fn new(path: impl Into<PathBuf>, job: ConversionJobRequest) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            path: path.into(),
            job,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }
}

/// 上传结果（错误走 Err）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed {
        job_id: String,
        strategy: UploadStrategy,
    },
    /// 磁盘空间不足，未开始传输，稍后可重新发起
    Paused { required_bytes: u64 },
}

/// 把进度同时写入任务记录和调用方的接收端
struct TaskProgressSink {
    tasks: Arc<DashMap<String, UploadTask>>,
    id: String,
    inner: Arc<dyn ProgressSink>,
}

impl ProgressSink for TaskProgressSink {
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        if let Some(mut task) = self.tasks.get_mut(&self.id) {
            task.apply_progress(&snapshot);
        }
        self.inner.on_progress(snapshot);
    }
}

/// 上传方式选择器（上传入口）
pub struct UploadStrategySelector {
    concurrency: Arc<ConcurrencyManager>,
    chunked: ChunkUploadOrchestrator,
    direct: DirectUploader,
    disk: Arc<dyn DiskSpaceChecker>,
    threshold: u64,
    band: ProgressBand,
    progress_interval: Duration,
    tasks: Arc<DashMap<String, UploadTask>>,
}

impl UploadStrategySelector {
    pub fn new(
        transport: Arc<dyn UploadTransport>,
        concurrency: Arc<ConcurrencyManager>,
        disk: Arc<dyn DiskSpaceChecker>,
        config: &UploadConfig,
    ) -> Self {
        Self {
            chunked: ChunkUploadOrchestrator::new(transport.clone(), concurrency.clone(), config),
            direct: DirectUploader::new(transport, config),
            concurrency,
            disk,
            threshold: config.chunked_threshold,
            band: config.transfer_band(),
            progress_interval: config.progress_interval(),
            tasks: Arc::new(DashMap::new()),
        }
    }

    pub fn concurrency(&self) -> &Arc<ConcurrencyManager> {
        &self.concurrency
    }

    /// 上传一个文件
    ///
    /// 空间不足返回 `Ok(Paused)`；取消返回 `Err(Cancelled)`
    pub async fn upload(
        &self,
        request: UploadRequest,
        sink: Arc<dyn ProgressSink>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome, UploadError> {
        let file_size = tokio::fs::metadata(&request.path).await?.len();
        let strategy = UploadStrategy::select(file_size, self.threshold);
        let id = request.id.clone();

        info!(
            "[{}] 上传 {:?} ({} bytes)，方式: {:?}",
            id, request.path, file_size, strategy
        );
        // 重新发起的上传取代同一文件此前暂停留下的记录
        self.tasks.retain(|task_id, t| {
            let superseded = t.status == UploadTaskStatus::Paused && t.local_path == request.path;
            if superseded {
                debug!("[{}] 取代暂停的任务记录 {}", id, task_id);
            }
            !superseded
        });
        self.tasks.insert(
            id.clone(),
            UploadTask::new(id.clone(), request.path.clone(), file_size, strategy),
        );

        if !self.disk.has_space(file_size) {
            warn!("[{}] 磁盘空间不足，上传暂停 (需要 {} bytes)", id, file_size);
            self.update_task(&id, |t| {
                t.mark_paused(format!("磁盘空间不足，需要 {} bytes", file_size))
            });
            return Ok(UploadOutcome::Paused {
                required_bytes: file_size,
            });
        }

        let task_sink = Arc::new(TaskProgressSink {
            tasks: self.tasks.clone(),
            id: id.clone(),
            inner: sink,
        });
        let progress = Arc::new(
            ProgressAggregator::new(id.clone(), file_size, task_sink)
                .with_band(self.band)
                .with_interval(self.progress_interval),
        );

        let path = &request.path;
        let job = &request.job;
        let op_id = id.as_str();
        let result = self
            .concurrency
            .run_upload(op_id, cancel, |token| async move {
                self.update_task(op_id, |t| t.mark_uploading());
                match strategy {
                    UploadStrategy::Direct => {
                        self.direct
                            .upload(op_id, path, file_size, job, progress, &token)
                            .await
                    }
                    UploadStrategy::Chunked => {
                        self.chunked
                            .upload(op_id, path, file_size, job, progress, &token)
                            .await
                    }
                }
            })
            .await;

        match result {
            Ok(job_id) => {
                self.update_task(&id, |t| t.mark_completed(job_id.clone()));
                Ok(UploadOutcome::Completed { job_id, strategy })
            }
            Err(e) if e.is_cancelled() => {
                info!("[{}] 上传已取消", id);
                self.update_task(&id, |t| t.mark_cancelled());
                Err(UploadError::Cancelled)
            }
            Err(e) => {
                error!("[{}] 上传失败: {}", id, e);
                let message = e.user_message();
                self.update_task(&id, |t| t.mark_failed(message));
                Err(e)
            }
        }
    }

    /// 按 ID 取消上传（包括其所有分片）
    pub fn cancel(&self, id: &str) -> bool {
        self.concurrency.cancel(id)
    }

    pub fn task(&self, id: &str) -> Option<UploadTask> {
        self.tasks.get(id).map(|t| t.clone())
    }

    pub fn tasks(&self) -> Vec<UploadTask> {
        self.tasks.iter().map(|t| t.value().clone()).collect()
    }

    /// 移除已进入终态的任务记录，返回移除数量
    pub fn clear_finished(&self) -> usize {
        let before = self.tasks.len();
        self.tasks.retain(|_, t| !t.status.is_terminal());
        before - self.tasks.len()
    }

    fn update_task(&self, id: &str, f: impl FnOnce(&mut UploadTask)) {
        if let Some(mut task) = self.tasks.get_mut(id) {
            f(&mut task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConcurrencyLimits;
    use crate::disk::AlwaysSufficient;
    use crate::testutil::{write_source_file, FixedDiskChecker, MockTransport};
    use crate::uploader::progress::NoopProgressSink;
    use tokio::sync::mpsc;

    const MB: u64 = 1024 * 1024;

    fn selector(
        transport: Arc<MockTransport>,
        disk: Arc<dyn DiskSpaceChecker>,
        config: &UploadConfig,
    ) -> UploadStrategySelector {
        let concurrency = Arc::new(ConcurrencyManager::new(ConcurrencyLimits::default()));
        UploadStrategySelector::new(transport, concurrency, disk, config)
    }

    fn fast_config() -> UploadConfig {
        UploadConfig {
            retry_base_delay_ms: 5,
            progress_interval_ms: 0,
            ..UploadConfig::default()
        }
    }

    #[test]
    fn test_threshold_boundary() {
        assert_eq!(UploadStrategy::for_size(100 * MB), UploadStrategy::Direct);
        assert_eq!(UploadStrategy::for_size(100 * MB + 1), UploadStrategy::Chunked);
        assert_eq!(UploadStrategy::for_size(0), UploadStrategy::Direct);
        assert_eq!(UploadStrategy::select(10, 9), UploadStrategy::Chunked);
    }

    #[tokio::test]
    async fn test_ten_mib_file_uses_direct_path_with_retries() {
        let (_dir, path, data) = write_source_file(10 * MB);
        let transport = Arc::new(MockTransport::builder().unified_failures(2).build());
        let selector = selector(transport.clone(), Arc::new(AlwaysSufficient), &fast_config());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let request = UploadRequest::new(&path, ConversionJobRequest::new("mp4")).with_id("small");
        let outcome = selector
            .upload(request, Arc::new(tx), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            UploadOutcome::Completed {
                job_id: transport.job_id(),
                strategy: UploadStrategy::Direct,
            }
        );
        assert_eq!(transport.unified_attempts(), 3);
        assert_eq!(transport.init_calls(), 0);
        assert_eq!(transport.unified_body().map(|b| b.len()), Some(data.len()));

        let mut last = 0.0;
        while let Ok(s) = rx.try_recv() {
            assert!(s.percentage >= last);
            last = s.percentage;
        }
        assert_eq!(last, 100.0);

        let task = selector.task("small").unwrap();
        assert_eq!(task.status, UploadTaskStatus::Completed);
        assert_eq!(task.strategy, UploadStrategy::Direct);
        assert_eq!(task.job_id, Some(transport.job_id()));
    }

    #[tokio::test]
    async fn test_large_file_uses_chunked_path() {
        let (_dir, path, data) = write_source_file(64 * 1024);
        let transport = Arc::new(MockTransport::builder().build());
        let config = UploadConfig {
            chunk_size: 16 * 1024,
            chunked_threshold: 32 * 1024,
            ..fast_config()
        };
        let selector = selector(transport.clone(), Arc::new(AlwaysSufficient), &config);
        let (tx, mut rx) = mpsc::unbounded_channel();

        let request = UploadRequest::new(&path, ConversionJobRequest::new("mkv")).with_id("large");
        let outcome = selector
            .upload(request, Arc::new(tx), &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            UploadOutcome::Completed {
                strategy: UploadStrategy::Chunked,
                ..
            }
        ));
        assert_eq!(transport.unified_attempts(), 0);
        assert_eq!(transport.received_indices(), vec![0, 1, 2, 3]);
        assert_eq!(transport.reassemble(), data);

        let mut snapshots = Vec::new();
        while let Ok(s) = rx.try_recv() {
            snapshots.push(s);
        }
        assert_eq!(snapshots.first().unwrap().percentage, 5.0);
        assert_eq!(snapshots.last().unwrap().percentage, 100.0);

        let stats = selector.concurrency().stats();
        assert_eq!(stats.upload.active, 0);
        assert_eq!(stats.chunk.active, 0);
    }

    #[tokio::test]
    async fn test_disk_veto_pauses_without_transfer() {
        let (_dir, path, data) = write_source_file(4096);
        let transport = Arc::new(MockTransport::builder().build());
        let selector = selector(transport.clone(), Arc::new(FixedDiskChecker::new(false)), &fast_config());

        let request = UploadRequest::new(&path, ConversionJobRequest::new("mp4")).with_id("full-disk");
        let outcome = selector
            .upload(request, Arc::new(NoopProgressSink), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            outcome,
            UploadOutcome::Paused {
                required_bytes: data.len() as u64
            }
        );
        assert_eq!(transport.unified_attempts(), 0);
        assert_eq!(transport.init_calls(), 0);

        let task = selector.task("full-disk").unwrap();
        assert_eq!(task.status, UploadTaskStatus::Paused);
        assert!(task.error.is_some());
    }

    #[tokio::test]
    async fn test_resubmit_replaces_paused_record() {
        let (_dir, path, _data) = write_source_file(4096);
        let transport = Arc::new(MockTransport::builder().build());
        let disk = Arc::new(FixedDiskChecker::new(false));
        let selector = selector(transport.clone(), disk.clone(), &fast_config());

        let first = selector
            .upload(
                UploadRequest::new(&path, ConversionJobRequest::new("mp4")),
                Arc::new(NoopProgressSink),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(matches!(first, UploadOutcome::Paused { .. }));
        assert_eq!(selector.tasks().len(), 1);

        disk.set(true);
        let request = UploadRequest::new(&path, ConversionJobRequest::new("mp4")).with_id("resumed");
        selector
            .upload(request, Arc::new(NoopProgressSink), &CancellationToken::new())
            .await
            .unwrap();

        let tasks = selector.tasks();
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].id, "resumed");
        assert_eq!(tasks[0].status, UploadTaskStatus::Completed);
        assert_eq!(selector.clear_finished(), 1);
    }

    #[tokio::test]
    async fn test_cancel_by_id_stops_chunked_upload() {
        let (_dir, path, _data) = write_source_file(64 * 1024);
        let transport = Arc::new(MockTransport::builder().hold_chunks().build());
        let config = UploadConfig {
            chunk_size: 8 * 1024,
            chunked_threshold: 16 * 1024,
            ..fast_config()
        };
        let selector = Arc::new(selector(transport.clone(), Arc::new(AlwaysSufficient), &config));

        let handle = {
            let selector = selector.clone();
            tokio::spawn(async move {
                let request =
                    UploadRequest::new(&path, ConversionJobRequest::new("mp4")).with_id("to-cancel");
                selector
                    .upload(request, Arc::new(NoopProgressSink), &CancellationToken::new())
                    .await
            })
        };

        transport.wait_for_in_flight(4).await;
        let stats = selector.concurrency().stats();
        assert_eq!(stats.upload.active, 1);
        assert_eq!(stats.chunk.active, 4);

        assert!(selector.cancel("to-cancel"));
        let result = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        assert!(matches!(result, Err(UploadError::Cancelled)));
        assert_eq!(transport.complete_calls(), 0);
        assert_eq!(
            selector.task("to-cancel").unwrap().status,
            UploadTaskStatus::Cancelled
        );

        let stats = selector.concurrency().stats();
        assert_eq!(stats.upload.active, 0);
        assert_eq!(stats.chunk.active, 0);
        assert_eq!(selector.clear_finished(), 1);
        assert!(selector.tasks().is_empty());
    }

    #[tokio::test]
    async fn test_failure_records_user_message() {
        let (_dir, path, _data) = write_source_file(2048);
        let transport = Arc::new(MockTransport::builder().unified_failures(5).build());
        let selector = selector(transport.clone(), Arc::new(AlwaysSufficient), &fast_config());

        let request = UploadRequest::new(&path, ConversionJobRequest::new("mp4")).with_id("broken");
        let err = selector
            .upload(request, Arc::new(NoopProgressSink), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::RetriesExhausted { attempts: 3, .. }));
        let task = selector.task("broken").unwrap();
        assert_eq!(task.status, UploadTaskStatus::Failed);
        assert!(task
            .error
            .unwrap()
            .contains("scripted unified failure"));
    }
}
