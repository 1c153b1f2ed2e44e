// 完整性校验哈希
//
// - 整文件 SHA-256：随 init 请求发送，默认关闭（大文件计算耗时）
// - 分片 MD5：随每个分片发送，默认关闭

use crate::api::UploadError;
use md5::Context as Md5Context;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// 读取缓冲区: 1MB
const READ_BUFFER_SIZE: usize = 1024 * 1024;

/// 计算整文件 SHA-256（十六进制小写）
///
/// 在阻塞线程池中执行文件 I/O，每读一块检查一次取消令牌
pub async fn file_sha256(path: &Path, cancel: &CancellationToken) -> Result<String, UploadError> {
    let path = path.to_path_buf();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || file_sha256_sync(&path, &cancel))
        .await
        .map_err(|e| UploadError::TaskAborted(format!("计算文件哈希任务失败: {}", e)))?
}

fn file_sha256_sync(path: &Path, cancel: &CancellationToken) -> Result<String, UploadError> {
    let file = std::fs::File::open(path)?;
    let mut reader = std::io::BufReader::with_capacity(READ_BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];

    loop {
        if cancel.is_cancelled() {
            debug!("文件哈希计算已取消: path={:?}", path);
            return Err(UploadError::Cancelled);
        }
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    let digest = hex::encode(hasher.finalize());
    debug!("文件哈希计算完成: path={:?}, sha256={}", path, digest);
    Ok(digest)
}

/// 计算分片 MD5（十六进制小写）
pub fn chunk_md5(data: &[u8]) -> String {
    let mut ctx = Md5Context::new();
    ctx.consume(data);
    format!("{:x}", ctx.compute())
}
