// 测试辅助：脚本化的内存传输层、本地 HTTP 桩服务器
//
// 记录每次调用，按配置注入失败，统计分片在途并发数

use crate::api::{
    ChunkAck, ChunkPayload, ChunkedCompleteRequest, ChunkedInitRequest, ChunkedInitResponse,
    UnifiedUpload, UploadError, UploadErrorKind, UploadJobResponse, UploadTransport,
};
use crate::disk::DiskSpaceChecker;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// 在临时目录中写入一个内容可辨认的源文件
pub fn write_source_file(size: u64) -> (tempfile::TempDir, PathBuf, Vec<u8>) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("source.mp4");
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&data).unwrap();
    file.flush().unwrap();
    (dir, path, data)
}

#[derive(Debug, Clone)]
struct MockConfig {
    session_id: String,
    job_id: String,
    chunk_failure_rate: f64,
    /// 随机失败时每个分片最多失败的次数，保证最终能成功
    max_random_failures: u32,
    fail_chunk_always: Option<(usize, UploadErrorKind)>,
    init_error: Option<UploadErrorKind>,
    unified_failures: u32,
    chunk_delay: Duration,
    hold_chunks: bool,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            session_id: "session-test".to_string(),
            job_id: "job-test".to_string(),
            chunk_failure_rate: 0.0,
            max_random_failures: 2,
            fail_chunk_always: None,
            init_error: None,
            unified_failures: 0,
            chunk_delay: Duration::ZERO,
            hold_chunks: false,
        }
    }
}

#[derive(Debug, Default)]
pub struct MockTransportBuilder {
    config: MockConfig,
}

impl MockTransportBuilder {
    pub fn chunk_failure_rate(mut self, rate: f64) -> Self {
        self.config.chunk_failure_rate = rate;
        self
    }

    pub fn fail_chunk_always(mut self, index: usize, kind: UploadErrorKind) -> Self {
        self.config.fail_chunk_always = Some((index, kind));
        self
    }

    pub fn init_error(mut self, kind: UploadErrorKind) -> Self {
        self.config.init_error = Some(kind);
        self
    }

    pub fn unified_failures(mut self, count: u32) -> Self {
        self.config.unified_failures = count;
        self
    }

    pub fn chunk_delay(mut self, delay: Duration) -> Self {
        self.config.chunk_delay = delay;
        self
    }

    /// 分片请求挂起，直到 `release_chunks` 放行
    pub fn hold_chunks(mut self) -> Self {
        self.config.hold_chunks = true;
        self
    }

    pub fn build(self) -> MockTransport {
        MockTransport {
            hold: Arc::new(Semaphore::new(0)),
            config: self.config,
            state: Mutex::new(MockState::default()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    init_calls: usize,
    init_request: Option<ChunkedInitRequest>,
    chunk_attempts: HashMap<usize, u32>,
    random_failures: HashMap<usize, u32>,
    received: BTreeMap<usize, Bytes>,
    chunk_hashes: HashMap<usize, String>,
    entry_concurrency: Vec<usize>,
    complete_calls: usize,
    unified_attempts: u32,
    unified_body: Option<Vec<u8>>,
}

pub struct MockTransport {
    config: MockConfig,
    state: Mutex<MockState>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    hold: Arc<Semaphore>,
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl MockTransport {
    pub fn builder() -> MockTransportBuilder {
        MockTransportBuilder::default()
    }

    pub fn job_id(&self) -> String {
        self.config.job_id.clone()
    }

    pub fn init_calls(&self) -> usize {
        self.state.lock().init_calls
    }

    pub fn init_request(&self) -> Option<ChunkedInitRequest> {
        self.state.lock().init_request.clone()
    }

    pub fn complete_calls(&self) -> usize {
        self.state.lock().complete_calls
    }

    pub fn chunk_attempts(&self, index: usize) -> u32 {
        self.state
            .lock()
            .chunk_attempts
            .get(&index)
            .copied()
            .unwrap_or(0)
    }

    pub fn chunk_hash(&self, index: usize) -> Option<String> {
        self.state.lock().chunk_hashes.get(&index).cloned()
    }

    /// 已成功接收的分片索引（升序）
    pub fn received_indices(&self) -> Vec<usize> {
        self.state.lock().received.keys().copied().collect()
    }

    /// 按索引拼接已接收的分片
    pub fn reassemble(&self) -> Vec<u8> {
        self.state
            .lock()
            .received
            .values()
            .flat_map(|b| b.iter().copied())
            .collect()
    }

    /// 每个分片请求进入时（含自身）的在途数
    pub fn entry_concurrency(&self) -> Vec<usize> {
        self.state.lock().entry_concurrency.clone()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn unified_attempts(&self) -> u32 {
        self.state.lock().unified_attempts
    }

    pub fn unified_body(&self) -> Option<Vec<u8>> {
        self.state.lock().unified_body.clone()
    }

    pub fn release_chunks(&self, count: usize) {
        self.hold.add_permits(count);
    }

    pub async fn wait_for_in_flight(&self, expected: usize) {
        let wait = async {
            while self.in_flight() < expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("等待在途分片超时");
    }

    fn job_response(&self) -> UploadJobResponse {
        UploadJobResponse {
            success: true,
            job_id: Some(self.config.job_id.clone()),
            message: None,
        }
    }
}

#[async_trait]
impl UploadTransport for MockTransport {
    async fn init_chunked(
        &self,
        request: &ChunkedInitRequest,
    ) -> Result<ChunkedInitResponse, UploadError> {
        {
            let mut state = self.state.lock();
            state.init_calls += 1;
            state.init_request = Some(request.clone());
        }
        if let Some(kind) = self.config.init_error {
            return Err(UploadError::http(kind, Some(500), "init failed"));
        }
        Ok(ChunkedInitResponse {
            session_id: self.config.session_id.clone(),
        })
    }

    async fn upload_chunk(&self, payload: ChunkPayload) -> Result<ChunkAck, UploadError> {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _guard = InFlightGuard(&self.in_flight);
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);

        let fail_randomly = {
            let mut state = self.state.lock();
            state.entry_concurrency.push(current);
            *state.chunk_attempts.entry(payload.index).or_insert(0) += 1;

            let failures = state.random_failures.entry(payload.index).or_insert(0);
            let fail = *failures < self.config.max_random_failures
                && self.config.chunk_failure_rate > 0.0
                && rand::thread_rng().gen_bool(self.config.chunk_failure_rate);
            if fail {
                *failures += 1;
            }
            fail
        };

        if self.config.hold_chunks {
            if let Ok(permit) = self.hold.acquire().await {
                permit.forget();
            }
        }
        if !self.config.chunk_delay.is_zero() {
            tokio::time::sleep(self.config.chunk_delay).await;
        }

        if let Some((index, kind)) = self.config.fail_chunk_always {
            if index == payload.index {
                return Err(UploadError::http(kind, None, "scripted chunk failure"));
            }
        }
        if fail_randomly {
            return Err(UploadError::http(
                UploadErrorKind::Network,
                None,
                "simulated connection reset",
            ));
        }
        assert_eq!(payload.session_id, self.config.session_id);
        assert_eq!(payload.data.len() as u64, payload.size);

        let mut state = self.state.lock();
        if let Some(hash) = payload.hash {
            state.chunk_hashes.insert(payload.index, hash);
        }
        state.received.insert(payload.index, payload.data);
        Ok(ChunkAck {
            success: true,
            chunk_index: Some(payload.index),
            message: None,
        })
    }

    async fn complete_chunked(
        &self,
        request: &ChunkedCompleteRequest,
    ) -> Result<UploadJobResponse, UploadError> {
        assert_eq!(request.session_id, self.config.session_id);
        self.state.lock().complete_calls += 1;
        Ok(self.job_response())
    }

    async fn upload_unified(
        &self,
        mut upload: UnifiedUpload,
    ) -> Result<UploadJobResponse, UploadError> {
        let attempt = {
            let mut state = self.state.lock();
            state.unified_attempts += 1;
            state.unified_attempts
        };

        // 像真实请求一样读完整个请求体
        let mut body = Vec::with_capacity(upload.file_size as usize);
        while let Some(item) = upload.body.next().await {
            body.extend_from_slice(&item?);
        }

        if attempt <= self.config.unified_failures {
            return Err(UploadError::http(
                UploadErrorKind::ServerError,
                Some(503),
                "scripted unified failure",
            ));
        }

        self.state.lock().unified_body = Some(body);
        Ok(self.job_response())
    }
}

/// 结果可切换的磁盘空间检查器
pub struct FixedDiskChecker(AtomicBool);

impl FixedDiskChecker {
    pub fn new(has_space: bool) -> Self {
        Self(AtomicBool::new(has_space))
    }

    pub fn set(&self, has_space: bool) {
        self.0.store(has_space, Ordering::SeqCst);
    }
}

impl DiskSpaceChecker for FixedDiskChecker {
    fn has_space(&self, _required_bytes: u64) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =====================================================
// 本地 HTTP 桩服务器（驱动真实 HttpUploadClient）
// =====================================================

/// 桩服务器收到的一次请求
#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl RecordedRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// 按字段名取 multipart 表单的原始内容
    pub fn form_field(&self, name: &str) -> Option<Vec<u8>> {
        let content_type = self.header("content-type")?;
        let boundary = content_type.split("boundary=").nth(1)?.trim_matches('"');
        let delimiter = format!("\r\n--{}", boundary);

        let mut body = b"\r\n".to_vec();
        body.extend_from_slice(&self.body);

        let wanted = format!("name=\"{}\"", name);
        split_bytes(&body, delimiter.as_bytes())
            .into_iter()
            .skip(1)
            .take_while(|part| !part.starts_with(b"--"))
            .find_map(|part| {
                let part = part.strip_prefix(b"\r\n").unwrap_or(part);
                let split = find_bytes(part, b"\r\n\r\n")?;
                let head = String::from_utf8_lossy(&part[..split]);
                head.contains(&wanted).then(|| part[split + 4..].to_vec())
            })
    }

    pub fn form_text(&self, name: &str) -> Option<String> {
        self.form_field(name)
            .map(|raw| String::from_utf8_lossy(&raw).into_owned())
    }
}

fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn split_bytes<'a>(mut haystack: &'a [u8], delimiter: &[u8]) -> Vec<&'a [u8]> {
    let mut parts = Vec::new();
    while let Some(pos) = find_bytes(haystack, delimiter) {
        parts.push(&haystack[..pos]);
        haystack = &haystack[pos + delimiter.len()..];
    }
    parts.push(haystack);
    parts
}

/// 按顺序回放脚本化响应的 HTTP 服务器，最后一条响应重复使用
///
/// 每个连接只处理一个请求（`Connection: close`）
pub struct HttpStub {
    base_url: String,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    handle: tokio::task::JoinHandle<()>,
}

impl HttpStub {
    pub async fn start(responses: Vec<(u16, &str)>) -> Self {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let responses: Vec<(u16, String)> = responses
            .into_iter()
            .map(|(status, body)| (status, body.to_string()))
            .collect();
        let requests = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let requests = requests.clone();
            tokio::spawn(async move {
                let mut served = 0usize;
                while let Ok((mut stream, _)) = listener.accept().await {
                    let Some(request) = read_request(&mut stream).await else {
                        continue;
                    };
                    requests.lock().push(request);

                    let (status, body) = &responses[served.min(responses.len() - 1)];
                    served += 1;
                    let resp = format!(
                        "HTTP/1.1 {} Stub\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        status,
                        body.len(),
                        body
                    );
                    let _ = stream.write_all(resp.as_bytes()).await;
                    let _ = stream.shutdown().await;
                }
            })
        };

        Self {
            base_url: format!("http://127.0.0.1:{}/api", port),
            requests,
            handle,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }
}

impl Drop for HttpStub {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// 读取一个完整请求（支持 Content-Length 与 chunked 两种请求体）
async fn read_request(stream: &mut tokio::net::TcpStream) -> Option<RecordedRequest> {
    use tokio::io::AsyncReadExt;

    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];
    let head_end = loop {
        if let Some(pos) = find_bytes(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut tmp).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&tmp[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let path = request_line.next()?.to_string();
    let headers: Vec<(String, String)> = lines
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect();
    let header = |name: &str| {
        headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.clone())
    };

    let mut rest = buf[head_end + 4..].to_vec();
    let body = if let Some(len) = header("content-length").and_then(|v| v.parse::<usize>().ok()) {
        while rest.len() < len {
            let n = stream.read(&mut tmp).await.ok()?;
            if n == 0 {
                return None;
            }
            rest.extend_from_slice(&tmp[..n]);
        }
        rest.truncate(len);
        rest
    } else if header("transfer-encoding").is_some_and(|v| v.eq_ignore_ascii_case("chunked")) {
        while find_bytes(&rest, b"0\r\n\r\n").is_none() {
            let n = stream.read(&mut tmp).await.ok()?;
            if n == 0 {
                break;
            }
            rest.extend_from_slice(&tmp[..n]);
        }
        decode_chunked(&rest)
    } else {
        Vec::new()
    };

    Some(RecordedRequest {
        method,
        path,
        headers,
        body,
    })
}

fn decode_chunked(mut raw: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    while let Some(line_end) = find_bytes(raw, b"\r\n") {
        let size_field = String::from_utf8_lossy(&raw[..line_end]);
        let size_hex = size_field.split(';').next().unwrap_or("").trim();
        let Ok(size) = usize::from_str_radix(size_hex, 16) else {
            break;
        };
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let end = (start + size).min(raw.len());
        body.extend_from_slice(&raw[start..end]);
        raw = raw.get(end + 2..).unwrap_or(&[]);
    }
    body
}
