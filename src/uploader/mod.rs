// 上传引擎模块
//
// - chunk：分片计划、上传会话、共享文件读取
// - retry：线性退避重试
// - progress：多任务进度聚合与节流
// - engine：分片上传编排（init → 分片 → complete）
// - direct：小文件流式直传
// - strategy：按文件大小选择上传方式，上传入口

pub mod chunk;
pub mod direct;
pub mod engine;
pub mod hash;
pub mod progress;
pub mod retry;
pub mod strategy;
pub mod task;

pub use chunk::{
    ChunkDescriptor, ChunkPlan, SharedFileReader, UploadSession, CHUNKED_UPLOAD_THRESHOLD,
    DEFAULT_CHUNK_SIZE,
};
pub use direct::DirectUploader;
pub use engine::ChunkUploadOrchestrator;
pub use progress::{
    LoggingProgressSink, NoopProgressSink, ProgressAggregator, ProgressBand, ProgressSink,
    ProgressSnapshot, ProgressThrottler,
};
pub use retry::{RetryExecutor, RetryPolicy};
pub use strategy::{UploadOutcome, UploadRequest, UploadStrategy, UploadStrategySelector};
pub use task::{UploadTask, UploadTaskStatus};
