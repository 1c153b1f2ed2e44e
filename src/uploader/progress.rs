//! 上传进度聚合
//!
//! 多个并发分片任务各自汇报字节增量，聚合器把它们合并成单条
//! 单调递增、限频的进度流，交给外部的 [`ProgressSink`]（UI 层）。

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 100;

// =====================================================
// 节流器
// =====================================================

/// 进度事件节流器
///
/// 每个实例有自己的时间原点，第一次调用 `should_emit()` 总是放行
#[derive(Debug)]
pub struct ProgressThrottler {
    origin: Instant,
    /// 上次发布距 origin 的纳秒数，NEVER 表示从未发布
    last_emit_nanos: AtomicU64,
    interval_nanos: u64,
}

const NEVER: u64 = u64::MAX;

impl ProgressThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            origin: Instant::now(),
            last_emit_nanos: AtomicU64::new(NEVER),
            interval_nanos: interval.as_nanos().min(u64::MAX as u128) as u64,
        }
    }

    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 距上次发布已超过间隔时返回 true 并更新时间戳
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if last != NEVER && now.saturating_sub(last) < self.interval_nanos {
            return false;
        }

        // 被其他线程抢先更新时本次不发布
        self.last_emit_nanos
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }

    /// 强制发布（阶段切换或完成时）
    pub fn force_emit(&self) -> bool {
        self.last_emit_nanos
            .store(self.now_nanos(), Ordering::Relaxed);
        true
    }

    pub fn reset(&self) {
        self.last_emit_nanos.store(NEVER, Ordering::Relaxed);
    }

    fn now_nanos(&self) -> u64 {
        // NEVER 保留给哨兵
        (self.origin.elapsed().as_nanos().min((NEVER - 1) as u128)) as u64
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

// =====================================================
// 进度区间
// =====================================================

/// 把某一阶段的 0–100% 映射到整体进度的 [start, end] 区间
///
/// 分片上传把传输阶段放在 5%–90%，其余留给初始化和合并
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressBand {
    start: f64,
    end: f64,
}

impl ProgressBand {
    pub fn new(start: f64, end: f64) -> Self {
        let start = clamp_percent(start);
        let end = clamp_percent(end).max(start);
        Self { start, end }
    }

    /// 整个 0–100% 区间
    pub fn full() -> Self {
        Self::new(0.0, 100.0)
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn scale(&self, raw_percent: f64) -> f64 {
        self.start + clamp_percent(raw_percent) / 100.0 * (self.end - self.start)
    }
}

impl Default for ProgressBand {
    fn default() -> Self {
        Self::full()
    }
}

fn clamp_percent(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

// =====================================================
// 快照与接收端
// =====================================================

/// 某一时刻的传输进度
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub bytes_transferred: u64,
    pub total_bytes: u64,
    /// 0–100
    pub percentage: f64,
    /// 累计平均速度 (bytes/s)
    pub speed_bps: u64,
    /// 预计剩余秒数，速度为 0 时为 None
    pub eta_secs: Option<u64>,
    pub elapsed_ms: u64,
}

impl ProgressSnapshot {
    pub fn is_complete(&self) -> bool {
        self.percentage >= 100.0
    }
}

/// 进度接收端（由 UI 层实现）
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, snapshot: ProgressSnapshot);
}

impl ProgressSink for mpsc::UnboundedSender<ProgressSnapshot> {
    fn on_progress(&self, snapshot: ProgressSnapshot) {
        // 接收端已关闭时丢弃
        let _ = self.send(snapshot);
    }
}

/// 丢弃所有进度
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgressSink;

impl ProgressSink for NoopProgressSink {
    fn on_progress(&self, _snapshot: ProgressSnapshot) {}
}

/// 把进度写到日志，CLI 使用
#[derive(Debug, Clone)]
pub struct LoggingProgressSink {
    label: String,
}

impl LoggingProgressSink {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

impl ProgressSink for LoggingProgressSink {
    fn on_progress(&self, s: ProgressSnapshot) {
        info!(
            "[{}] 进度 {:.1}% ({}/{} bytes), 速度 {} KB/s, 剩余 {}",
            self.label,
            s.percentage,
            s.bytes_transferred,
            s.total_bytes,
            s.speed_bps / 1024,
            s.eta_secs
                .map(|secs| format!("{}s", secs))
                .unwrap_or_else(|| "-".to_string())
        );
    }
}

// =====================================================
// 聚合器
// =====================================================

#[derive(Debug, Default)]
struct AggregatorState {
    /// 实际累计的字节数，失败重传前会被回退
    counted: u64,
    /// 对外可见的字节数（高水位，只增不减）
    visible: u64,
    /// 最后一次发出的百分比
    last_percent: f64,
    finished: bool,
}

/// 进度聚合器
///
/// `update` 可从任意任务并发调用。快照在锁内生成并发出，
/// 接收端看到的百分比严格单调不减。
pub struct ProgressAggregator {
    label: String,
    total: u64,
    band: ProgressBand,
    sink: Arc<dyn ProgressSink>,
    throttler: ProgressThrottler,
    started_at: Instant,
    state: Mutex<AggregatorState>,
}

impl ProgressAggregator {
    pub fn new(label: impl Into<String>, total: u64, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            label: label.into(),
            total,
            band: ProgressBand::full(),
            sink,
            throttler: ProgressThrottler::default(),
            started_at: Instant::now(),
            state: Mutex::new(AggregatorState::default()),
        }
    }

    /// 设置本次传输在整体进度中占的区间
    pub fn with_band(mut self, band: ProgressBand) -> Self {
        self.band = band;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.throttler = ProgressThrottler::new(interval);
        self
    }

    /// 累加已传输字节，被节流时返回 None
    pub fn update(&self, delta: u64) -> Option<ProgressSnapshot> {
        let mut state = self.state.lock();
        if state.finished {
            return None;
        }

        let next = state.counted.saturating_add(delta);
        if next > self.total {
            warn!(
                "[{}] 进度溢出: 已计 {} + 增量 {} > 总大小 {}，已截断",
                self.label, state.counted, delta, self.total
            );
        }
        state.counted = next.min(self.total);
        state.visible = state.visible.max(state.counted);

        if !self.throttler.should_emit() {
            return None;
        }
        Some(self.emit_locked(&mut state))
    }

    /// 回退失败尝试已计入的字节
    ///
    /// 只影响内部计数，可见进度保持不变，直到重传追上原来的高水位
    pub fn rewind(&self, bytes: u64) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.counted = state.counted.saturating_sub(bytes);
        debug!(
            "[{}] 回退 {} bytes，内部计数 {}，可见 {}",
            self.label, bytes, state.counted, state.visible
        );
    }

    /// 阶段开始：不受节流限制，发出区间起点
    pub fn begin(&self) -> ProgressSnapshot {
        let mut state = self.state.lock();
        self.throttler.force_emit();
        self.emit_locked(&mut state)
    }

    /// 传输完成：强制发出 100%，之后的更新全部忽略
    pub fn finish(&self) -> ProgressSnapshot {
        let mut state = self.state.lock();
        state.counted = self.total;
        state.visible = self.total;
        state.finished = true;

        let mut snapshot = self.compute(&state);
        snapshot.percentage = 100.0;
        snapshot.eta_secs = Some(0);
        state.last_percent = 100.0;

        self.throttler.force_emit();
        self.sink.on_progress(snapshot.clone());
        snapshot
    }

    /// 当前快照（不发出）
    pub fn snapshot(&self) -> ProgressSnapshot {
        let state = self.state.lock();
        self.compute(&state)
    }

    fn emit_locked(&self, state: &mut AggregatorState) -> ProgressSnapshot {
        let snapshot = self.compute(state);
        state.last_percent = snapshot.percentage;
        self.sink.on_progress(snapshot.clone());
        snapshot
    }

    fn compute(&self, state: &AggregatorState) -> ProgressSnapshot {
        let raw_percent = if self.total == 0 {
            100.0
        } else {
            state.visible as f64 / self.total as f64 * 100.0
        };
        let percentage = if state.finished {
            100.0
        } else {
            self.band.scale(raw_percent).max(state.last_percent)
        };

        let elapsed = self.started_at.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        let speed_bps = if elapsed_secs > 0.0 {
            (state.visible as f64 / elapsed_secs) as u64
        } else {
            0
        };
        let eta_secs = if speed_bps > 0 {
            Some((self.total - state.visible) / speed_bps)
        } else {
            None
        };

        ProgressSnapshot {
            bytes_transferred: state.visible,
            total_bytes: self.total,
            percentage: percentage.min(100.0),
            speed_bps,
            eta_secs,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

impl std::fmt::Debug for ProgressAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAggregator")
            .field("label", &self.label)
            .field("total", &self.total)
            .field("band", &self.band)
            .finish()
    }
}
