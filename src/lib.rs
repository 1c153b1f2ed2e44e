// Video Convert Uploader Library
// 视频转换服务上传客户端核心库

// 转换服务器 API 模块
pub mod api;

// 并发控制模块
pub mod concurrency;

// 配置管理模块
pub mod config;

// 磁盘空间预检
pub mod disk;

// 日志系统
pub mod logging;

// 上传引擎模块
pub mod uploader;

#[cfg(test)]
pub(crate) mod testutil;

// 导出常用类型
pub use api::{ConversionJobRequest, HttpUploadClient, UploadError, UploadErrorKind, UploadTransport};
pub use concurrency::{AdmissionController, ConcurrencyManager, OperationClass};
pub use config::{AppConfig, ConcurrencyLimits, LimitsPublisher};
pub use disk::DiskSpaceChecker;
pub use uploader::{
    ChunkUploadOrchestrator, DirectUploader, ProgressAggregator, ProgressSink, ProgressSnapshot,
    RetryExecutor, RetryPolicy, UploadOutcome, UploadRequest, UploadStrategy,
    UploadStrategySelector, UploadTask, UploadTaskStatus,
};
