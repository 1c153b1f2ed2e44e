//! 准入控制器
//!
//! 可动态调整容量的计数信号量，限制某一类操作的并发数。
//!
//! # 调整容量
//! 不修改正在使用的信号量，而是整体替换为新的闸门（Gate）：
//! - 旧闸门立即关闭，排队中的等待者自动转入新闸门
//! - 已持有旧许可的操作继续运行，不会被驱逐
//! - 新闸门的初始许可 = 新容量 - 仍在运行的持有者数，
//!   差额在旧持有者释放时逐个补回，最终收敛到新容量
//!
//! 因此任意时刻新准入的持有者数都不会让总数超过当前容量。

use crate::api::UploadError;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 新闸门对旧持有者的"欠账"
#[derive(Debug, Default)]
struct GateDebt {
    /// 超出新容量的旧持有者数：它们释放时不补许可
    excess: usize,
    /// 被扣留的许可数：旧持有者释放时逐个补回
    withheld: usize,
}

/// 某一代容量对应的闸门
#[derive(Debug)]
struct Gate {
    generation: u64,
    capacity: usize,
    semaphore: Arc<Semaphore>,
    debt: Mutex<GateDebt>,
}

impl Gate {
    fn new(generation: u64, capacity: usize, in_flight: usize) -> Self {
        let initial = capacity.saturating_sub(in_flight);
        Self {
            generation,
            capacity,
            semaphore: Arc::new(Semaphore::new(initial)),
            debt: Mutex::new(GateDebt {
                excess: in_flight.saturating_sub(capacity),
                withheld: capacity - initial,
            }),
        }
    }

    /// 旧闸门的持有者释放时调用
    fn absorb_retired_release(&self) {
        let mut debt = self.debt.lock();
        if debt.excess > 0 {
            debt.excess -= 1;
        } else if debt.withheld > 0 {
            debt.withheld -= 1;
            self.semaphore.add_permits(1);
        }
    }
}

struct ControllerInner {
    name: &'static str,
    current: RwLock<Arc<Gate>>,
    /// 所有闸门上仍在运行的持有者总数
    holders: AtomicUsize,
    next_generation: AtomicU64,
}

/// 准入控制器
///
/// 克隆后共享同一组状态
#[derive(Clone)]
pub struct AdmissionController {
    inner: Arc<ControllerInner>,
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("name", &self.inner.name)
            .field("capacity", &self.capacity())
            .field("holders", &self.holders())
            .finish()
    }
}

impl AdmissionController {
    /// 创建准入控制器（容量至少为 1）
    pub fn new(name: &'static str, capacity: usize) -> Self {
        let capacity = normalize_capacity(name, capacity);
        debug!("创建准入控制器: {} 容量={}", name, capacity);

        Self {
            inner: Arc::new(ControllerInner {
                name,
                current: RwLock::new(Arc::new(Gate::new(0, capacity, 0))),
                holders: AtomicUsize::new(0),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    pub fn name(&self) -> &'static str {
        self.inner.name
    }

    /// 当前容量
    pub fn capacity(&self) -> usize {
        self.inner.current.read().capacity
    }

    /// 仍在运行的持有者数（含旧闸门上的）
    pub fn holders(&self) -> usize {
        self.inner.holders.load(Ordering::SeqCst)
    }

    /// 当前闸门可立即发放的许可数
    pub fn available(&self) -> usize {
        self.inner.current.read().semaphore.available_permits()
    }

    /// 获取许可
    ///
    /// 阻塞直到有空位或取消令牌触发；只会因取消而失败
    pub async fn acquire(
        &self,
        cancel: &CancellationToken,
    ) -> Result<AdmissionPermit, UploadError> {
        loop {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }

            let gate = self.inner.current.read().clone();

            let acquired = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(UploadError::Cancelled),
                acquired = gate.semaphore.clone().acquire_owned() => acquired,
            };

            let permit = match acquired {
                Ok(permit) => permit,
                Err(_) => {
                    // 闸门在等待期间被替换
                    debug!("{} 闸门已替换，转入新闸门等待", self.inner.name);
                    continue;
                }
            };

            // 与 resize 互斥登记，保证 holders 与闸门代数一致
            let registered = {
                let current = self.inner.current.read();
                if current.generation == gate.generation {
                    self.inner.holders.fetch_add(1, Ordering::SeqCst);
                    true
                } else {
                    false
                }
            };

            if registered {
                return Ok(AdmissionPermit {
                    inner: self.inner.clone(),
                    generation: gate.generation,
                    permit: Some(permit),
                });
            }
            drop(permit);
        }
    }

    /// 调整容量
    ///
    /// 安装新闸门并关闭旧闸门；不中断任何已准入的操作
    pub fn resize(&self, new_capacity: usize) {
        let new_capacity = normalize_capacity(self.inner.name, new_capacity);
        let mut current = self.inner.current.write();

        let old_capacity = current.capacity;
        if old_capacity == new_capacity {
            debug!("{} 容量无需调整: {}", self.inner.name, old_capacity);
            return;
        }

        let in_flight = self.inner.holders.load(Ordering::SeqCst);
        let generation = self.inner.next_generation.fetch_add(1, Ordering::SeqCst);
        let gate = Arc::new(Gate::new(generation, new_capacity, in_flight));
        let initial = gate.semaphore.available_permits();

        let old = std::mem::replace(&mut *current, gate);
        old.semaphore.close();
        drop(current);

        if in_flight > new_capacity {
            warn!(
                "{} 缩容: {} -> {} (有 {} 个操作仍在运行，将继续运行至完成)",
                self.inner.name, old_capacity, new_capacity, in_flight
            );
        } else {
            info!(
                "{} 容量调整: {} -> {} (运行中 {}, 立即可用 {})",
                self.inner.name, old_capacity, new_capacity, in_flight, initial
            );
        }
    }
}

fn normalize_capacity(name: &str, capacity: usize) -> usize {
    if capacity == 0 {
        warn!("{} 容量为 0，按 1 处理", name);
        1
    } else {
        capacity
    }
}

/// 准入许可
///
/// Drop 时释放，保证所有退出路径（成功、失败、取消、panic）都只释放一次
pub struct AdmissionPermit {
    inner: Arc<ControllerInner>,
    generation: u64,
    permit: Option<OwnedSemaphorePermit>,
}

impl fmt::Debug for AdmissionPermit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionPermit")
            .field("controller", &self.inner.name)
            .field("generation", &self.generation)
            .finish()
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        let current = self.inner.current.read();
        self.inner.holders.fetch_sub(1, Ordering::SeqCst);

        if current.generation == self.generation {
            drop(self.permit.take());
        } else {
            // 旧闸门已关闭，许可作废，改为向当前闸门补位
            current.absorb_retired_release();
        }
    }
}
