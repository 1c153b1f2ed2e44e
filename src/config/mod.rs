// 配置管理模块

pub mod limits;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

pub use limits::LimitsPublisher;

use crate::uploader::progress::ProgressBand;
use crate::uploader::retry::RetryPolicy;

/// 1 MiB
pub const MIB: u64 = 1024 * 1024;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 转换服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 并发配置
    #[serde(default)]
    pub concurrency: ConcurrencyLimits,
    /// 磁盘空间预检配置
    #[serde(default)]
    pub disk: DiskConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    true
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * MIB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 转换服务器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// API 根地址，如 http://127.0.0.1:5000/api
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// 建立连接超时（秒）
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// init / complete 等控制请求的超时（秒）
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://127.0.0.1:5000/api".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl ServerConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 分片大小（字节），默认 50MB
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 分片上传阈值（字节）：大于该值走分片上传，默认 100MB
    #[serde(default = "default_chunked_threshold")]
    pub chunked_threshold: u64,
    /// 单个分片 / 单次直传的最大尝试次数
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// 线性退避基数（毫秒）
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    /// 单个分片请求超时（秒）
    #[serde(default = "default_chunk_timeout_secs")]
    pub chunk_timeout_secs: u64,
    /// 直传整体超时（秒）
    #[serde(default = "default_direct_timeout_secs")]
    pub direct_timeout_secs: u64,
    /// 进度回调最小间隔（毫秒）
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,
    /// 传输阶段在整体进度中的起点（百分比），之前留给会话初始化
    #[serde(default = "default_transfer_band_start")]
    pub transfer_band_start: f64,
    /// 传输阶段在整体进度中的终点（百分比），之后留给完成请求
    #[serde(default = "default_transfer_band_end")]
    pub transfer_band_end: f64,
    /// 初始化会话时是否附带整文件 SHA-256
    #[serde(default)]
    pub compute_file_hash: bool,
    /// 每个分片是否附带 MD5
    #[serde(default)]
    pub compute_chunk_hash: bool,
}

fn default_chunk_size() -> u64 {
    50 * MIB
}

fn default_chunked_threshold() -> u64 {
    100 * MIB
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_base_delay_ms() -> u64 {
    1000
}

fn default_chunk_timeout_secs() -> u64 {
    5 * 60
}

fn default_direct_timeout_secs() -> u64 {
    60 * 60
}

fn default_progress_interval_ms() -> u64 {
    100
}

fn default_transfer_band_start() -> f64 {
    5.0
}

fn default_transfer_band_end() -> f64 {
    90.0
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            chunked_threshold: default_chunked_threshold(),
            max_attempts: default_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
            chunk_timeout_secs: default_chunk_timeout_secs(),
            direct_timeout_secs: default_direct_timeout_secs(),
            progress_interval_ms: default_progress_interval_ms(),
            transfer_band_start: default_transfer_band_start(),
            transfer_band_end: default_transfer_band_end(),
            compute_file_hash: false,
            compute_chunk_hash: false,
        }
    }
}

impl UploadConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.retry_base_delay_ms),
        )
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.chunk_timeout_secs)
    }

    pub fn direct_timeout(&self) -> Duration {
        Duration::from_secs(self.direct_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn transfer_band(&self) -> ProgressBand {
        ProgressBand::new(self.transfer_band_start, self.transfer_band_end)
    }

    /// 校验上传参数
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.max_attempts == 0 {
            anyhow::bail!("最大尝试次数必须大于 0");
        }
        if !(0.0..=100.0).contains(&self.transfer_band_start)
            || !(0.0..=100.0).contains(&self.transfer_band_end)
            || self.transfer_band_start > self.transfer_band_end
        {
            anyhow::bail!(
                "传输阶段进度区间无效: {}% - {}%",
                self.transfer_band_start,
                self.transfer_band_end
            );
        }
        Ok(())
    }
}

/// 各类操作的并发上限
///
/// 配置源发布这组值，ConcurrencyManager 订阅后整体应用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConcurrencyLimits {
    /// 同时上传的文件数
    #[serde(default = "default_max_concurrent_uploads")]
    pub max_concurrent_uploads: usize,
    /// 同时下载的文件数
    #[serde(default = "default_max_concurrent_downloads")]
    pub max_concurrent_downloads: usize,
    /// 同时上传的分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
}

fn default_max_concurrent_uploads() -> usize {
    3
}

fn default_max_concurrent_downloads() -> usize {
    2
}

fn default_max_concurrent_chunks() -> usize {
    4
}

impl Default for ConcurrencyLimits {
    fn default() -> Self {
        Self {
            max_concurrent_uploads: default_max_concurrent_uploads(),
            max_concurrent_downloads: default_max_concurrent_downloads(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
        }
    }
}

impl ConcurrencyLimits {
    pub fn new(uploads: usize, downloads: usize, chunks: usize) -> Self {
        Self {
            max_concurrent_uploads: uploads,
            max_concurrent_downloads: downloads,
            max_concurrent_chunks: chunks,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_uploads == 0
            || self.max_concurrent_downloads == 0
            || self.max_concurrent_chunks == 0
        {
            anyhow::bail!("并发上限必须大于 0: {:?}", self);
        }
        Ok(())
    }
}

/// 磁盘空间预检配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// 是否在传输前检查磁盘空间
    #[serde(default = "default_disk_check_enabled")]
    pub enabled: bool,
    /// 检查哪个目录所在的磁盘
    #[serde(default = "default_disk_working_dir")]
    pub working_dir: PathBuf,
    /// 额外保留空间（字节）
    #[serde(default)]
    pub reserve_bytes: u64,
}

fn default_disk_check_enabled() -> bool {
    true
}

fn default_disk_working_dir() -> PathBuf {
    PathBuf::from(".")
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            enabled: default_disk_check_enabled(),
            working_dir: default_disk_working_dir(),
            reserve_bytes: 0,
        }
    }
}

impl AppConfig {
    /// 从文件加载配置
    pub async fn load_from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .await
            .with_context(|| format!("读取配置文件失败: {:?}", path))?;

        let config: AppConfig = toml::from_str(&content).context("解析配置文件失败")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 加载配置，文件不存在时使用默认配置
    pub async fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if fs::try_exists(path).await.unwrap_or(false) {
            Self::load_from_file(path).await
        } else {
            tracing::info!("配置文件不存在，使用默认配置: {:?}", path);
            Ok(Self::default())
        }
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        self.validate().context("保存配置失败")?;

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("创建配置目录失败: {:?}", parent))?;
            }
        }

        let content = toml::to_string_pretty(self).context("序列化配置失败")?;
        fs::write(path, content)
            .await
            .with_context(|| format!("写入配置文件失败: {:?}", path))?;

        tracing::info!("配置已保存: {:?}", path);
        Ok(())
    }

    /// 校验整体配置
    pub fn validate(&self) -> Result<()> {
        if self.server.base_url.trim().is_empty() {
            anyhow::bail!("服务器地址不能为空");
        }
        self.upload.validate()?;
        self.concurrency.validate()?;
        Ok(())
    }
}
