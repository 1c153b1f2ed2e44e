use anyhow::{Context, Result};
use clap::{Args, Parser};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use video_convert_uploader::{
    api::{ConversionJobRequest, HttpUploadClient},
    concurrency::ConcurrencyManager,
    config::{AppConfig, LimitsPublisher},
    disk, logging,
    uploader::{LoggingProgressSink, UploadOutcome, UploadRequest, UploadStrategySelector},
    UploadError,
};

/// 配置文件轮询间隔
const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(2);

#[derive(Debug, Parser)]
#[command(name = "video-uploader", version)]
enum Cli {
    /// 上传视频文件到转换服务器
    Upload(UploadArgs),
    /// 写出默认配置文件
    InitConfig {
        /// 配置文件路径
        #[arg(long, default_value = "config/app.toml")]
        config: PathBuf,
    },
}

#[derive(Debug, Args)]
struct UploadArgs {
    /// 要上传的视频文件
    file: PathBuf,
    /// 目标格式，如 mp4、webm
    #[arg(long)]
    format: String,
    /// 视频编码器
    #[arg(long)]
    video_codec: Option<String>,
    /// 音频编码器
    #[arg(long)]
    audio_codec: Option<String>,
    /// 目标分辨率，如 1920x1080
    #[arg(long)]
    resolution: Option<String>,
    /// 配置文件路径（不存在时使用默认配置）
    #[arg(long, default_value = "config/app.toml")]
    config: PathBuf,
    /// 覆盖配置中的服务器地址
    #[arg(long)]
    server: Option<String>,
    /// 上传过程中轮询配置文件，并发上限变化时实时生效
    #[arg(long)]
    watch_config: bool,
}

impl UploadArgs {
    fn job_request(&self) -> ConversionJobRequest {
        ConversionJobRequest {
            video_codec: self.video_codec.clone(),
            audio_codec: self.audio_codec.clone(),
            resolution: self.resolution.clone(),
            ..ConversionJobRequest::new(&self.format)
        }
    }

    async fn run(self) -> Result<()> {
        let mut config = AppConfig::load_or_default(&self.config).await?;
        if let Some(url) = &self.server {
            config.server.base_url = url.clone();
        }
        config.validate().context("配置校验失败")?;

        // 必须保持 _log_guard 存活
        let _log_guard = logging::init_logging(&config.log);
        info!("video-uploader v{} 启动", env!("CARGO_PKG_VERSION"));
        debug!("当前配置: {:?}", config);

        let publisher = Arc::new(LimitsPublisher::new(config.concurrency));
        let concurrency = Arc::new(ConcurrencyManager::new(config.concurrency));
        let watcher = concurrency.spawn_limits_watcher(publisher.subscribe());

        let cancel = CancellationToken::new();
        let poller = self.watch_config.then(|| {
            tokio::spawn(poll_config_file(
                self.config.clone(),
                publisher.clone(),
                cancel.clone(),
            ))
        });

        let transport = Arc::new(HttpUploadClient::new(&config.server, &config.upload)?);
        let selector = UploadStrategySelector::new(
            transport,
            concurrency,
            disk::checker_from_config(&config.disk),
            &config.upload,
        );

        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("收到 Ctrl+C，正在取消上传...");
                    cancel.cancel();
                }
            });
        }

        let label = self
            .file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let request = UploadRequest::new(&self.file, self.job_request());
        let result = selector
            .upload(request, Arc::new(LoggingProgressSink::new(label)), &cancel)
            .await;

        // 关闭配置源，监听任务随之退出
        cancel.cancel();
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        drop(publisher);
        let _ = watcher.await;

        match result {
            Ok(UploadOutcome::Completed { job_id, strategy }) => {
                info!("上传完成 ({:?})，转换任务: {}", strategy, job_id);
                println!("{}", job_id);
                Ok(())
            }
            Ok(UploadOutcome::Paused { required_bytes }) => {
                warn!("磁盘空间不足，上传已暂停 (需要 {} bytes)", required_bytes);
                anyhow::bail!("上传已暂停: 磁盘空间不足")
            }
            Err(UploadError::Cancelled) => {
                info!("上传已取消");
                anyhow::bail!("上传已取消")
            }
            Err(e) => {
                error!("上传失败: {}", e);
                anyhow::bail!("上传失败: {}", e.user_message())
            }
        }
    }
}

/// 轮询配置文件，把并发上限的变化发布出去
async fn poll_config_file(path: PathBuf, publisher: Arc<LimitsPublisher>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(CONFIG_POLL_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {}
        }

        match AppConfig::load_from_file(&path).await {
            Ok(config) => {
                publisher.publish(config.concurrency);
            }
            Err(e) => debug!("读取配置文件失败，保持当前并发上限: {:#}", e),
        }
    }
}

async fn init_config(path: &Path) -> Result<()> {
    if tokio::fs::try_exists(path).await.unwrap_or(false) {
        anyhow::bail!("配置文件已存在: {:?}", path);
    }
    AppConfig::default().save_to_file(path).await?;
    println!("已写入默认配置: {:?}", path);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    match Cli::parse() {
        Cli::Upload(args) => args.run().await,
        Cli::InitConfig { config } => init_config(&config).await,
    }
}
