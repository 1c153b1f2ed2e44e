//! 并发上限配置源
//!
//! 设置界面修改并发上限后，通过 watch channel 发布新值；
//! ConcurrencyManager 的监听任务消费并应用。

use super::ConcurrencyLimits;
use tokio::sync::watch;
use tracing::{debug, info};

/// 并发上限发布者
#[derive(Debug)]
pub struct LimitsPublisher {
    tx: watch::Sender<ConcurrencyLimits>,
}

impl LimitsPublisher {
    pub fn new(initial: ConcurrencyLimits) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    /// 订阅变更
    pub fn subscribe(&self) -> watch::Receiver<ConcurrencyLimits> {
        self.tx.subscribe()
    }

    /// 当前值
    pub fn current(&self) -> ConcurrencyLimits {
        *self.tx.borrow()
    }

    /// 发布新值，与当前值相同时不通知
    ///
    /// 返回是否发生了变更
    pub fn publish(&self, limits: ConcurrencyLimits) -> bool {
        let changed = self.tx.send_if_modified(|current| {
            if *current == limits {
                false
            } else {
                *current = limits;
                true
            }
        });

        if changed {
            info!(
                "发布并发上限: 上传={}, 下载={}, 分片={}",
                limits.max_concurrent_uploads,
                limits.max_concurrent_downloads,
                limits.max_concurrent_chunks
            );
        } else {
            debug!("并发上限未变化，跳过发布");
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_notifies_subscribers() {
        let publisher = LimitsPublisher::new(ConcurrencyLimits::default());
        let mut rx = publisher.subscribe();

        assert!(publisher.publish(ConcurrencyLimits::new(3, 2, 1)));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().max_concurrent_chunks, 1);
        assert_eq!(publisher.current().max_concurrent_chunks, 1);
    }

    #[test]
    fn test_publish_same_value_is_noop() {
        let publisher = LimitsPublisher::new(ConcurrencyLimits::default());
        let rx = publisher.subscribe();

        assert!(!publisher.publish(ConcurrencyLimits::default()));
        assert!(!rx.has_changed().unwrap());
    }
}
