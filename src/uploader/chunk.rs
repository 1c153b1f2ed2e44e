// 上传分片管理
//
// 分片规则：
// - 分片大小固定（默认 50MB），最后一片可以更小
// - 分片数 = ceil(文件大小 / 分片大小)
// - 分片索引从 0 开始连续编号，覆盖 [0, 文件大小) 无重叠无空洞

use crate::api::UploadError;
use bit_set::BitSet;
use bytes::Bytes;
use parking_lot::Mutex;
use std::io::SeekFrom;
use std::ops::Range;
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info};

/// 默认分片大小: 50MB
pub const DEFAULT_CHUNK_SIZE: u64 = 50 * 1024 * 1024;

/// 超过该大小（严格大于）的文件走分片上传: 100MB
pub const CHUNKED_UPLOAD_THRESHOLD: u64 = 100 * 1024 * 1024;

/// 一个分片：源文件中连续的一段字节
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub index: usize,
    pub offset: u64,
    pub length: u64,
}

impl ChunkDescriptor {
    pub fn range(&self) -> Range<u64> {
        self.offset..self.offset + self.length
    }
}

/// 分片计划
#[derive(Debug, Clone)]
pub struct ChunkPlan {
    total_size: u64,
    chunk_size: u64,
    chunks: Vec<ChunkDescriptor>,
}

impl ChunkPlan {
    /// 根据文件大小和分片大小计算分片
    pub fn new(total_size: u64, chunk_size: u64) -> Result<Self, UploadError> {
        if chunk_size == 0 {
            return Err(UploadError::InvalidConfig("分片大小必须大于 0".to_string()));
        }

        let count = total_size.div_ceil(chunk_size) as usize;
        let chunks = (0..count)
            .map(|index| {
                let offset = index as u64 * chunk_size;
                ChunkDescriptor {
                    index,
                    offset,
                    length: chunk_size.min(total_size - offset),
                }
            })
            .collect::<Vec<_>>();

        debug!(
            "分片计划: 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            total_size,
            chunk_size,
            chunks.len()
        );

        Ok(Self {
            total_size,
            chunk_size,
            chunks,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }
}

/// 服务端上传会话
///
/// 由 init 接口创建，只有分片确认会修改它，不跨文件复用
#[derive(Debug)]
pub struct UploadSession {
    session_id: String,
    total_chunks: usize,
    /// 已被服务端确认的分片
    acknowledged: Mutex<BitSet>,
}

impl UploadSession {
    pub fn new(session_id: impl Into<String>, total_chunks: usize) -> Self {
        Self {
            session_id: session_id.into(),
            total_chunks,
            acknowledged: Mutex::new(BitSet::with_capacity(total_chunks)),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn total_chunks(&self) -> usize {
        self.total_chunks
    }

    /// 记录分片确认，返回当前已确认数量
    ///
    /// 越界索引被忽略，重复确认不会重复计数
    pub fn mark_acknowledged(&self, index: usize) -> usize {
        let mut acked = self.acknowledged.lock();
        if index < self.total_chunks {
            acked.insert(index);
        }
        acked.len()
    }

    pub fn is_acknowledged(&self, index: usize) -> bool {
        self.acknowledged.lock().contains(index)
    }

    pub fn completed_count(&self) -> usize {
        self.acknowledged.lock().len()
    }

    pub fn is_complete(&self) -> bool {
        self.completed_count() == self.total_chunks
    }
}

/// 多个分片任务共享的源文件句柄
///
/// 文件游标是共享的，seek + read 必须互斥；读完即释放锁，网络发送不在锁内
#[derive(Debug)]
pub struct SharedFileReader {
    file: tokio::sync::Mutex<File>,
}

impl SharedFileReader {
    pub async fn open(path: &Path) -> Result<Self, UploadError> {
        let file = File::open(path).await?;
        info!("打开上传源文件: {:?}", path);
        Ok(Self {
            file: tokio::sync::Mutex::new(file),
        })
    }

    /// 读取一个分片的全部字节
    pub async fn read_chunk(&self, chunk: &ChunkDescriptor) -> Result<Bytes, UploadError> {
        let mut buffer = vec![0u8; chunk.length as usize];
        {
            let mut file = self.file.lock().await;
            file.seek(SeekFrom::Start(chunk.offset)).await?;
            file.read_exact(&mut buffer).await?;
        }

        debug!(
            "[分片#{}] 读取 bytes={}..{}, 大小={} bytes",
            chunk.index,
            chunk.offset,
            chunk.offset + chunk.length,
            chunk.length
        );
        Ok(Bytes::from(buffer))
    }
}
