// 磁盘空间预检
//
// 传输开始前调用一次；空间不足时上传进入"暂停"状态而不是失败

use crate::config::DiskConfig;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tracing::{debug, warn};

/// 磁盘空间检查器
pub trait DiskSpaceChecker: Send + Sync {
    fn has_space(&self, required_bytes: u64) -> bool;
}

/// 总是返回空间充足（检查关闭时使用）
#[derive(Debug, Default, Clone, Copy)]
pub struct AlwaysSufficient;

impl DiskSpaceChecker for AlwaysSufficient {
    fn has_space(&self, _required_bytes: u64) -> bool {
        true
    }
}

/// 基于 sysinfo 的检查器
///
/// 找到挂载点为工作目录最长前缀的磁盘，要求可用空间 >= 需要 + 预留
#[derive(Debug, Clone)]
pub struct SysinfoDiskChecker {
    working_dir: PathBuf,
    reserve_bytes: u64,
}

impl SysinfoDiskChecker {
    pub fn new(working_dir: impl Into<PathBuf>, reserve_bytes: u64) -> Self {
        let working_dir = working_dir.into();
        let working_dir = std::fs::canonicalize(&working_dir).unwrap_or(working_dir);
        Self {
            working_dir,
            reserve_bytes,
        }
    }

    /// 工作目录所在磁盘的可用空间，找不到磁盘时返回 None
    pub fn available_space(&self) -> Option<u64> {
        let disks = Disks::new_with_refreshed_list();
        let mounts = disks
            .list()
            .iter()
            .map(|d| (d.mount_point(), d.available_space()));
        select_disk(&self.working_dir, mounts)
    }
}

impl DiskSpaceChecker for SysinfoDiskChecker {
    fn has_space(&self, required_bytes: u64) -> bool {
        let Some(available) = self.available_space() else {
            // 无法确定时不阻止上传
            warn!("未找到 {:?} 所在磁盘，跳过空间检查", self.working_dir);
            return true;
        };

        let needed = required_bytes.saturating_add(self.reserve_bytes);
        debug!(
            "磁盘空间检查: 可用={} bytes, 需要={} bytes (含预留 {})",
            available, needed, self.reserve_bytes
        );
        available >= needed
    }
}

/// 挑选挂载点是 `path` 最长前缀的磁盘，返回其可用空间
fn select_disk<'a>(
    path: &Path,
    mounts: impl Iterator<Item = (&'a Path, u64)>,
) -> Option<u64> {
    mounts
        .filter(|(mount, _)| path.starts_with(mount))
        .max_by_key(|(mount, _)| mount.components().count())
        .map(|(_, available)| available)
}

/// 根据配置构造检查器
pub fn checker_from_config(config: &DiskConfig) -> Arc<dyn DiskSpaceChecker> {
    if config.enabled {
        Arc::new(SysinfoDiskChecker::new(
            config.working_dir.clone(),
            config.reserve_bytes,
        ))
    } else {
        Arc::new(AlwaysSufficient)
    }
}
