// 重试执行器
//
// 对单个幂等操作（一个分片 / 一次整文件直传）做有限次重试：
// - 只重试瞬时错误（网络、超时、5xx、限流）
// - 尝试本身返回的取消不重试
// - 退避等待期间可被取消，立即返回 Cancelled 而不是 RetriesExhausted

use crate::api::UploadError;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 默认最大尝试次数
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// 默认退避基数
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// 重试策略（线性退避）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 最大尝试次数（含第一次）
    pub max_attempts: u32,
    /// 第 n 次失败后等待 base_delay * n
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// 计算线性退避延迟
    ///
    /// # 延迟序列（base=1s）
    /// - 第 1 次失败后: 1s
    /// - 第 2 次失败后: 2s
    pub fn backoff_delay(&self, failed_attempt: u32) -> Duration {
        self.base_delay * failed_attempt
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ATTEMPTS, DEFAULT_BASE_DELAY)
    }
}

/// 重试执行器
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// 执行操作，失败时按策略重试
    ///
    /// `attempt_fn` 收到从 1 开始的尝试序号
    pub async fn execute<T, F, Fut>(
        &self,
        label: &str,
        cancel: &CancellationToken,
        mut attempt_fn: F,
    ) -> Result<T, UploadError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, UploadError>>,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt = 1;

        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            match attempt_fn(attempt).await {
                Ok(value) => {
                    if attempt > 1 {
                        info!("[{}] 第 {}/{} 次尝试成功", label, attempt, max_attempts);
                    }
                    return Ok(value);
                }
                Err(e) if e.is_cancelled() => {
                    debug!("[{}] 第 {} 次尝试被取消", label, attempt);
                    return Err(e);
                }
                Err(e) if !e.is_retriable() => {
                    error!("[{}] 失败（不可重试）: {}", label, e);
                    return Err(e);
                }
                Err(e) => {
                    if attempt >= max_attempts {
                        error!("[{}] 失败，已达最大尝试次数 ({}): {}", label, max_attempts, e);
                        return Err(UploadError::RetriesExhausted {
                            attempts: attempt,
                            last: Box::new(e),
                        });
                    }

                    let delay = self.policy.backoff_delay(attempt);
                    warn!(
                        "[{}] 失败，等待 {:?} 后重试 ({}/{}): {}",
                        label, delay, attempt, max_attempts, e
                    );

                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!("[{}] 退避期间被取消", label);
                            return Err(UploadError::Cancelled);
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }

                    attempt += 1;
                }
            }
        }
    }
}
