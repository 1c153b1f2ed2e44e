// 并发管理器
//
// 进程级唯一实例（显式构造、显式注入），负责：
// - 每类操作（上传 / 下载 / 分片）一个准入控制器
// - 活跃操作登记表（统计、按 ID 取消）
// - 订阅配置源，整体应用新的并发上限

use crate::api::UploadError;
use crate::concurrency::{AdmissionController, AdmissionPermit};
use crate::config::ConcurrencyLimits;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 操作类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationClass {
    Upload,
    Download,
    Chunk,
}

impl OperationClass {
    pub fn name(&self) -> &'static str {
        match self {
            OperationClass::Upload => "upload",
            OperationClass::Download => "download",
            OperationClass::Chunk => "chunk",
        }
    }
}

/// 登记表中的活跃操作
#[derive(Debug)]
struct ActiveOperation {
    class: OperationClass,
    token: CancellationToken,
    started_at: Instant,
    /// 持有的许可；cancel() 可提前释放
    permit: Mutex<Option<AdmissionPermit>>,
}

/// 单个类别的统计
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ClassStats {
    /// 当前容量
    pub capacity: usize,
    /// 正在运行的持有者数
    pub active: usize,
    /// 可立即准入的数量
    pub available: usize,
    /// 登记表中的操作数（含等待准入的）
    pub registered: usize,
}

/// 并发统计快照（最终一致）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStats {
    pub upload: ClassStats,
    pub download: ClassStats,
    pub chunk: ClassStats,
}

/// 并发管理器
#[derive(Debug)]
pub struct ConcurrencyManager {
    upload: AdmissionController,
    download: AdmissionController,
    chunk: AdmissionController,
    operations: DashMap<String, Arc<ActiveOperation>>,
    limits: Mutex<ConcurrencyLimits>,
}

/// 操作结束时从登记表移除并释放许可
struct RegistrationGuard<'a> {
    operations: &'a DashMap<String, Arc<ActiveOperation>>,
    id: &'a str,
    op: Arc<ActiveOperation>,
}

impl Drop for RegistrationGuard<'_> {
    fn drop(&mut self) {
        self.operations
            .remove_if(self.id, |_, registered| Arc::ptr_eq(registered, &self.op));
        drop(self.op.permit.lock().take());
        debug!(
            "[{}] 操作 {} 结束，耗时 {:?}",
            self.op.class.name(),
            self.id,
            self.op.started_at.elapsed()
        );
    }
}

impl ConcurrencyManager {
    pub fn new(limits: ConcurrencyLimits) -> Self {
        info!(
            "创建并发管理器: 上传={}, 下载={}, 分片={}",
            limits.max_concurrent_uploads,
            limits.max_concurrent_downloads,
            limits.max_concurrent_chunks
        );

        Self {
            upload: AdmissionController::new("upload", limits.max_concurrent_uploads),
            download: AdmissionController::new("download", limits.max_concurrent_downloads),
            chunk: AdmissionController::new("chunk", limits.max_concurrent_chunks),
            operations: DashMap::new(),
            limits: Mutex::new(limits),
        }
    }

    /// 获取类别对应的准入控制器
    pub fn controller(&self, class: OperationClass) -> &AdmissionController {
        match class {
            OperationClass::Upload => &self.upload,
            OperationClass::Download => &self.download,
            OperationClass::Chunk => &self.chunk,
        }
    }

    pub async fn run_upload<T, F, Fut>(
        &self,
        id: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, UploadError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        self.run(OperationClass::Upload, id, cancel, work).await
    }

    pub async fn run_download<T, F, Fut>(
        &self,
        id: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, UploadError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        self.run(OperationClass::Download, id, cancel, work).await
    }

    pub async fn run_chunk<T, F, Fut>(
        &self,
        id: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, UploadError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        self.run(OperationClass::Chunk, id, cancel, work).await
    }

    /// 在准入控制下执行一个操作
    ///
    /// `work` 收到的令牌是 `cancel` 的子令牌，`cancel(id)` 也会触发它
    pub async fn run<T, F, Fut>(
        &self,
        class: OperationClass,
        id: &str,
        cancel: &CancellationToken,
        work: F,
    ) -> Result<T, UploadError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let token = cancel.child_token();
        let op = Arc::new(ActiveOperation {
            class,
            token: token.clone(),
            started_at: Instant::now(),
            permit: Mutex::new(None),
        });

        if self
            .operations
            .insert(id.to_string(), op.clone())
            .is_some()
        {
            warn!("[{}] 操作 ID 重复，旧登记被覆盖: {}", class.name(), id);
        }
        let _guard = RegistrationGuard {
            operations: &self.operations,
            id,
            op: op.clone(),
        };

        let permit = self.controller(class).acquire(&token).await?;
        *op.permit.lock() = Some(permit);

        // 取消可能发生在许可写入之前
        if token.is_cancelled() {
            return Err(UploadError::Cancelled);
        }

        debug!("[{}] 操作 {} 已准入", class.name(), id);
        work(token).await
    }

    /// 取消操作并释放其许可
    ///
    /// 操作本身需要协作式地观察取消令牌
    pub fn cancel(&self, id: &str) -> bool {
        match self.operations.remove(id) {
            Some((_, op)) => {
                op.token.cancel();
                let released = op.permit.lock().take().is_some();
                info!(
                    "[{}] 已取消操作 {} (释放许可: {})",
                    op.class.name(),
                    id,
                    released
                );
                true
            }
            None => {
                debug!("取消操作失败，未找到: {}", id);
                false
            }
        }
    }

    /// 操作是否仍在登记表中
    pub fn is_active(&self, id: &str) -> bool {
        self.operations.contains_key(id)
    }

    /// 应用新的并发上限
    ///
    /// 只替换发生变化的类别
    pub fn update_limits(&self, limits: ConcurrencyLimits) {
        let mut current = self.limits.lock();
        if *current == limits {
            debug!("并发上限未变化");
            return;
        }

        if current.max_concurrent_uploads != limits.max_concurrent_uploads {
            self.upload.resize(limits.max_concurrent_uploads);
        }
        if current.max_concurrent_downloads != limits.max_concurrent_downloads {
            self.download.resize(limits.max_concurrent_downloads);
        }
        if current.max_concurrent_chunks != limits.max_concurrent_chunks {
            self.chunk.resize(limits.max_concurrent_chunks);
        }

        *current = limits;
        info!(
            "🔧 并发上限已更新: 上传={}, 下载={}, 分片={}",
            limits.max_concurrent_uploads,
            limits.max_concurrent_downloads,
            limits.max_concurrent_chunks
        );
    }

    pub fn limits(&self) -> ConcurrencyLimits {
        *self.limits.lock()
    }

    /// 统计快照
    pub fn stats(&self) -> ConcurrencyStats {
        ConcurrencyStats {
            upload: self.class_stats(OperationClass::Upload),
            download: self.class_stats(OperationClass::Download),
            chunk: self.class_stats(OperationClass::Chunk),
        }
    }

    fn class_stats(&self, class: OperationClass) -> ClassStats {
        let controller = self.controller(class);
        ClassStats {
            capacity: controller.capacity(),
            active: controller.holders(),
            available: controller.available(),
            registered: self
                .operations
                .iter()
                .filter(|entry| entry.value().class == class)
                .count(),
        }
    }

    /// 启动配置监听任务
    ///
    /// 发布者被丢弃后任务退出
    pub fn spawn_limits_watcher(
        self: &Arc<Self>,
        mut rx: watch::Receiver<ConcurrencyLimits>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let initial = *rx.borrow_and_update();
            manager.update_limits(initial);

            while rx.changed().await.is_ok() {
                let limits = *rx.borrow_and_update();
                if let Err(e) = limits.validate() {
                    warn!("忽略无效的并发上限: {}", e);
                    continue;
                }
                manager.update_limits(limits);
            }
            debug!("并发配置源已关闭，监听任务退出");
        })
    }
}
