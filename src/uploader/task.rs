// 上传任务记录
//
// 供 UI 层展示：状态、进度、速度、结果 job ID 或错误信息

use crate::uploader::progress::ProgressSnapshot;
use crate::uploader::strategy::UploadStrategy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// 上传任务状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum UploadTaskStatus {
    /// 等待中
    Pending,
    /// 上传中
    Uploading,
    /// 磁盘空间不足，已暂停
    Paused,
    /// 已完成
    Completed,
    /// 失败
    Failed,
    /// 已取消
    Cancelled,
}

impl UploadTaskStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadTaskStatus::Completed | UploadTaskStatus::Failed | UploadTaskStatus::Cancelled
        )
    }
}

/// 上传任务
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadTask {
    /// 任务ID
    pub id: String,
    /// 本地文件路径
    pub local_path: PathBuf,
    /// 文件大小
    pub total_size: u64,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 整体进度百分比（0-100）
    #[serde(default)]
    pub percentage: f64,
    /// 选用的上传方式
    pub strategy: UploadStrategy,
    /// 任务状态
    pub status: UploadTaskStatus,
    /// 上传速度 (bytes/s)
    pub speed: u64,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
    /// 服务器返回的转换任务 ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// 错误信息
    pub error: Option<String>,
}

impl UploadTask {
    /// 创建新的上传任务
    pub fn new(
        id: impl Into<String>,
        local_path: PathBuf,
        total_size: u64,
        strategy: UploadStrategy,
    ) -> Self {
        Self {
            id: id.into(),
            local_path,
            total_size,
            uploaded_size: 0,
            percentage: 0.0,
            strategy,
            status: UploadTaskStatus::Pending,
            speed: 0,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
            job_id: None,
            error: None,
        }
    }

    /// 计算字节进度百分比
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.uploaded_size as f64 / self.total_size as f64) * 100.0
    }

    /// 估算剩余时间 (秒)
    pub fn eta(&self) -> Option<u64> {
        if self.speed == 0 || self.uploaded_size >= self.total_size {
            return None;
        }
        let remaining = self.total_size - self.uploaded_size;
        Some(remaining / self.speed)
    }

    pub fn mark_uploading(&mut self) {
        self.status = UploadTaskStatus::Uploading;
        self.started_at = Some(chrono::Utc::now().timestamp());
    }

    /// 应用一次进度快照（终态后忽略）
    pub fn apply_progress(&mut self, snapshot: &ProgressSnapshot) {
        if self.status.is_terminal() {
            return;
        }
        self.uploaded_size = snapshot.bytes_transferred;
        self.percentage = snapshot.percentage;
        self.speed = snapshot.speed_bps;
    }

    pub fn mark_completed(&mut self, job_id: String) {
        self.status = UploadTaskStatus::Completed;
        self.uploaded_size = self.total_size;
        self.percentage = 100.0;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.job_id = Some(job_id);
        self.error = None;
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = UploadTaskStatus::Failed;
        self.error = Some(error);
    }

    pub fn mark_paused(&mut self, reason: String) {
        self.status = UploadTaskStatus::Paused;
        self.error = Some(reason);
    }

    pub fn mark_cancelled(&mut self) {
        self.status = UploadTaskStatus::Cancelled;
    }
}
