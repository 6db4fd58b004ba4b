// 自适应下载流
//
// - 文件以 gzip 魔数 0x1f 0x8b 开头时透明解压，调用方只看到解压后的字节
// - 每次读取不超过窗口大小，内存占用以一个窗口为上限
// - 每秒最多输出一次实时速度，结束（EOF 或提前关闭）时输出平均速度

use async_compression::tokio::bufread::GzipDecoder;
use std::io::{self, SeekFrom};
use std::path::Path;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, BufReader, ReadBuf};
use tracing::{debug, info};

/// gzip 魔数
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// 实时速度输出间隔
const REPORT_INTERVAL: Duration = Duration::from_secs(1);

/// 文件的原始信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceInfo {
    /// 是否为 gzip 压缩
    pub is_compressed: bool,
    /// 磁盘上的字节数
    pub stored_size: u64,
    /// 解压后的字节数（gzip 取 ISIZE，即模 2^32）
    pub original_size: u64,
}

/// 传输统计
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamStats {
    pub bytes: u64,
    pub elapsed: Duration,
    pub interim_reports: u32,
}

impl StreamStats {
    /// 平均速度（MB/s）
    pub fn average_mb_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs <= 0.0 {
            return 0.0;
        }
        self.bytes as f64 / 1024.0 / 1024.0 / secs
    }
}

/// 检测 gzip 并读取 ISIZE
///
/// 读完后文件位置复位到开头
pub async fn inspect_source(file: &mut File) -> io::Result<SourceInfo> {
    let stored_size = file.metadata().await?.len();

    let mut magic = [0u8; 2];
    let mut filled = 0;
    while filled < magic.len() {
        let n = file.read(&mut magic[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    let is_compressed = filled == 2 && magic == GZIP_MAGIC;
    let original_size = if is_compressed && stored_size >= 18 {
        // gzip 尾部最后 4 字节为小端的原始长度
        file.seek(SeekFrom::End(-4)).await?;
        let mut trailer = [0u8; 4];
        file.read_exact(&mut trailer).await?;
        u32::from_le_bytes(trailer) as u64
    } else {
        stored_size
    };

    file.seek(SeekFrom::Start(0)).await?;

    Ok(SourceInfo {
        is_compressed,
        stored_size,
        original_size,
    })
}

/// 自适应下载流
pub struct AdaptiveStreamer {
    inner: Pin<Box<dyn AsyncRead + Send>>,
    /// 读取窗口（同时也是内部缓冲区大小）
    window: Vec<u8>,
    label: String,
    total: u64,
    started: Instant,
    last_report: Instant,
    bytes_since_report: u64,
    interim_reports: u32,
    finished: bool,
}

impl AdaptiveStreamer {
    /// 包装任意读取源
    pub fn new(
        inner: impl AsyncRead + Send + 'static,
        window_size: usize,
        label: impl Into<String>,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner: Box::pin(inner),
            window: vec![0u8; window_size.max(1)],
            label: label.into(),
            total: 0,
            started: now,
            last_report: now,
            bytes_since_report: 0,
            interim_reports: 0,
            finished: false,
        }
    }

    /// 打开文件，gzip 文件自动插入解压层
    pub async fn open(path: &Path, window_size: usize) -> io::Result<(Self, SourceInfo)> {
        let mut file = File::open(path).await?;
        let info = inspect_source(&mut file).await?;
        let label = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        let streamer = if info.is_compressed {
            let mut decoder = GzipDecoder::new(BufReader::new(file));
            decoder.multiple_members(true);
            debug!("[{}] 检测到 gzip，启用透明解压", label);
            Self::new(decoder, window_size, label)
        } else {
            Self::new(file, window_size, label)
        };

        Ok((streamer, info))
    }

    pub fn window_size(&self) -> usize {
        self.window.len()
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            bytes: self.total,
            elapsed: self.started.elapsed(),
            interim_reports: self.interim_reports,
        }
    }

    fn maybe_report(&mut self) {
        let since = self.last_report.elapsed();
        if since < REPORT_INTERVAL {
            return;
        }
        let mbps = self.bytes_since_report as f64 / 1024.0 / 1024.0 / since.as_secs_f64();
        debug!(
            "[{}] 下载中: 已发送 {} 字节, 当前速度 {:.2} MB/s",
            self.label, self.total, mbps
        );
        self.interim_reports += 1;
        self.bytes_since_report = 0;
        self.last_report = Instant::now();
    }

    fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        let stats = self.stats();
        info!(
            "[{}] 下载结束: 共 {} 字节, 耗时 {:.2}s, 平均 {:.2} MB/s",
            self.label,
            stats.bytes,
            stats.elapsed.as_secs_f64(),
            stats.average_mb_per_sec()
        );
    }
}

impl AsyncRead for AdaptiveStreamer {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.finished || buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let want = buf.remaining().min(this.window.len());
        let mut window = ReadBuf::new(&mut this.window[..want]);
        ready!(this.inner.as_mut().poll_read(cx, &mut window))?;

        let n = window.filled().len();
        if n == 0 {
            this.finish();
            return Poll::Ready(Ok(()));
        }

        buf.put_slice(window.filled());
        this.total += n as u64;
        this.bytes_since_report += n as u64;
        this.maybe_report();
        Poll::Ready(Ok(()))
    }
}

impl Drop for AdaptiveStreamer {
    fn drop(&mut self) {
        // 客户端提前断开
        self.finish();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_compression::tokio::write::GzipEncoder;
    use tempfile::TempDir;
    use tokio::io::AsyncWriteExt;

    struct MemReader {
        data: Vec<u8>,
        pos: usize,
    }

    impl AsyncRead for MemReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            let this = self.get_mut();
            let n = buf.remaining().min(this.data.len() - this.pos);
            buf.put_slice(&this.data[this.pos..this.pos + n]);
            this.pos += n;
            Poll::Ready(Ok(()))
        }
    }

    async fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzipEncoder::new(Vec::new());
        encoder.write_all(data).await.unwrap();
        encoder.shutdown().await.unwrap();
        encoder.into_inner()
    }

    #[tokio::test]
    async fn test_plain_file_passthrough() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("plain.bin");
        let data: Vec<u8> = (0..100_000u32).map(|i| (i % 256) as u8).collect();
        std::fs::write(&path, &data).unwrap();

        let (mut streamer, info) = AdaptiveStreamer::open(&path, 4096).await.unwrap();
        assert!(!info.is_compressed);
        assert_eq!(info.original_size, data.len() as u64);

        let mut out = Vec::new();
        streamer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
        assert_eq!(streamer.stats().bytes, data.len() as u64);
    }

    #[tokio::test]
    async fn test_gzip_transparently_decompressed() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.txt.gz");
        let data = b"adaptive chunked transfer ".repeat(2000);
        let compressed = gzip(&data).await;
        std::fs::write(&path, &compressed).unwrap();

        let (mut streamer, info) = AdaptiveStreamer::open(&path, 1024).await.unwrap();
        assert!(info.is_compressed);
        assert_eq!(info.stored_size, compressed.len() as u64);
        assert_eq!(info.original_size, data.len() as u64);

        let mut out = Vec::new();
        streamer.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn test_reads_capped_to_window() {
        let inner = MemReader {
            data: vec![7u8; 10_000],
            pos: 0,
        };
        let mut streamer = AdaptiveStreamer::new(inner, 256, "mem");

        let mut buf = vec![0u8; 8192];
        let n = streamer.read(&mut buf).await.unwrap();
        assert_eq!(n, 256);

        let mut rest = Vec::new();
        streamer.read_to_end(&mut rest).await.unwrap();
        assert_eq!(n + rest.len(), 10_000);
        assert_eq!(streamer.window_size(), 256);
    }

    #[tokio::test]
    async fn test_short_file_not_gzip() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("one.bin");
        std::fs::write(&path, [0x1fu8]).unwrap();

        let mut file = File::open(&path).await.unwrap();
        let info = inspect_source(&mut file).await.unwrap();
        assert!(!info.is_compressed);
        assert_eq!(info.original_size, 1);
    }
}
