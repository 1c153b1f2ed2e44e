//! 日志系统配置
//!
//! 控制台 + 文件两路输出。文件按启动时间命名，超过大小上限时滚动到
//! `video-uploader.<启动时间>_N.log`，启动时清理超过保留天数的旧文件。

use crate::config::LogConfig;
use chrono::Local;
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, time::ChronoLocal},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter,
};

const LOG_FILE_PREFIX: &str = "video-uploader.";
const LOG_FILE_SUFFIX: &str = ".log";
const LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// 按大小滚动的日志文件
struct RollingFile {
    /// 启动时间戳（YYYY-MM-DD-HHMMSS）
    started: String,
    dir: PathBuf,
    file: Option<File>,
    /// 0 是首个文件，之后每次滚动加 1
    index: u32,
    max_size: u64,
    written: u64,
}

impl RollingFile {
    fn open(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        let mut rolling = Self {
            started: Local::now().format("%Y-%m-%d-%H%M%S").to_string(),
            dir,
            file: None,
            index: 0,
            max_size,
            written: 0,
        };
        rolling.open_current()?;
        Ok(rolling)
    }

    fn path_for(&self, index: u32) -> PathBuf {
        let name = if index == 0 {
            format!("{}{}{}", LOG_FILE_PREFIX, self.started, LOG_FILE_SUFFIX)
        } else {
            format!(
                "{}{}_{}{}",
                LOG_FILE_PREFIX, self.started, index, LOG_FILE_SUFFIX
            )
        };
        self.dir.join(name)
    }

    fn open_current(&mut self) -> io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path_for(self.index))?;
        self.file = Some(file);
        self.written = 0;
        Ok(())
    }

    fn write_record(&mut self, buf: &[u8]) -> io::Result<usize> {
        // 空文件总是接收，单条超大记录不会无限滚动
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            if let Some(mut old) = self.file.take() {
                old.flush()?;
            }
            self.index += 1;
            self.open_current()?;
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "日志文件未打开"))?;
        let n = file.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// 日志文件写入器，可克隆，交给 tracing-appender 的后台线程使用
#[derive(Clone)]
pub struct LogFileWriter {
    inner: Arc<Mutex<RollingFile>>,
}

impl LogFileWriter {
    pub fn new(dir: PathBuf, max_size: u64) -> io::Result<Self> {
        Ok(Self {
            inner: Arc::new(Mutex::new(RollingFile::open(dir, max_size)?)),
        })
    }

    /// 当前正在写入的文件
    pub fn current_path(&self) -> PathBuf {
        let inner = self.inner.lock();
        inner.path_for(inner.index)
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.lock().write_record(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.lock().flush()
    }
}

/// 日志系统守卫
/// 必须保持存活，否则后台写入线程会退出并丢失缓冲中的日志
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// 初始化日志系统
///
/// `RUST_LOG` 优先于配置中的级别；日志目录不可用时回退到仅控制台输出
pub fn init_logging(config: &LogConfig) -> LogGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let console_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(true);

    let writer = if config.enabled {
        match open_log_writer(config) {
            Ok(writer) => Some(writer),
            Err(e) => {
                eprintln!(
                    "初始化日志文件失败: {:?}, 错误: {}，回退到仅控制台输出",
                    config.log_dir, e
                );
                None
            }
        }
    } else {
        None
    };

    let Some(writer) = writer else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();
        info!("日志系统初始化完成（仅控制台输出）");
        return LogGuard { _file_guard: None };
    };

    let current = writer.current_path();
    let (non_blocking, file_guard) = tracing_appender::non_blocking(writer);
    let file_layer = fmt::layer()
        .with_target(true)
        .with_timer(ChronoLocal::new(LOG_TIME_FORMAT.to_string()))
        .with_ansi(false)
        .with_writer(non_blocking);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .init();

    info!(
        "日志系统初始化完成: 文件={:?}, 保留天数={}, 级别={}, 单文件最大={:.1}MB",
        current,
        config.retention_days,
        config.level,
        config.max_file_size as f64 / 1024.0 / 1024.0
    );

    let removed = cleanup_old_logs(&config.log_dir, config.retention_days);
    if removed > 0 {
        info!("已清理 {} 个过期日志文件", removed);
    }

    LogGuard {
        _file_guard: Some(file_guard),
    }
}

fn open_log_writer(config: &LogConfig) -> io::Result<LogFileWriter> {
    fs::create_dir_all(&config.log_dir)?;
    LogFileWriter::new(config.log_dir.clone(), config.max_file_size)
}

/// 删除超过保留天数的日志文件，返回删除数量
///
/// 优先按文件名中的日期判断，解析不出日期时按修改时间判断
fn cleanup_old_logs(log_dir: &Path, retention_days: u32) -> usize {
    let today = Local::now().date_naive();
    let retention = chrono::Duration::days(retention_days as i64);

    let entries = match fs::read_dir(log_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("读取日志目录失败: {:?}, 错误: {}", log_dir, e);
            return 0;
        }
    };

    let mut removed = 0;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
            continue;
        };
        if !path.is_file() || !name.starts_with(LOG_FILE_PREFIX) || !name.ends_with(LOG_FILE_SUFFIX)
        {
            continue;
        }

        let expired = match date_from_file_name(name) {
            Some(date) => today.signed_duration_since(date) > retention,
            None => expired_by_mtime(&entry, retention),
        };
        if !expired {
            continue;
        }

        match fs::remove_file(&path) {
            Ok(()) => {
                removed += 1;
                debug!("已删除过期日志文件: {:?}", path);
            }
            Err(e) => warn!("删除过期日志文件失败: {:?}, 错误: {}", path, e),
        }
    }
    removed
}

/// `video-uploader.YYYY-MM-DD-HHMMSS[_N].log` -> YYYY-MM-DD
fn date_from_file_name(name: &str) -> Option<chrono::NaiveDate> {
    let stem = name
        .strip_prefix(LOG_FILE_PREFIX)?
        .strip_suffix(LOG_FILE_SUFFIX)?;
    let date = stem.get(..10)?;
    chrono::NaiveDate::parse_from_str(date, "%Y-%m-%d").ok()
}

fn expired_by_mtime(entry: &fs::DirEntry, retention: chrono::Duration) -> bool {
    let modified = entry.metadata().and_then(|m| m.modified());
    match modified {
        Ok(modified) => {
            let modified: chrono::DateTime<chrono::Utc> = modified.into();
            chrono::Utc::now().signed_duration_since(modified) > retention
        }
        Err(_) => false,
    }
}
