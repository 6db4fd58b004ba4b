// 分片合并
//
// 流程：
// 1. 检查 0..total_chunks 每个分片文件都存在，缺一个就在写任何字节之前失败
// 2. 创建目标目录
// 3. 按索引升序把分片流式拷贝到临时文件（有界缓冲区，不整体加载）
// 4. 比较总字节数与声明的文件大小，不一致则删除临时文件并报错
// 5. 校验通过后 rename 为最终文件名，再删除分片临时目录

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tracing::{debug, info, warn};

use super::error::{UploadError, UploadResult};
use super::storage::{chunk_file_name, ChunkStorage};

/// 文件名最大长度（字符）
pub const MAX_FILE_NAME_LEN: usize = 200;

/// 清洗后为空时使用的文件名
pub const DEFAULT_FILE_NAME: &str = "unnamed_file";

/// 默认拷贝缓冲区: 32KB
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

/// 清洗文件名
///
/// - 路径分隔符、`..`、Windows 非法字符、控制字符替换为 `_`
/// - 连续空白折叠为一个 `_`
/// - 超过 200 字符时截断并保留扩展名
/// - 结果为空时使用 `unnamed_file`
pub fn sanitize_file_name(name: &str) -> String {
    if name.trim().is_empty() {
        return DEFAULT_FILE_NAME.to_string();
    }

    let replaced = name.replace(['/', '\\'], "_").replace("..", "_");

    let mut sanitized = String::with_capacity(replaced.len());
    let mut in_whitespace = false;
    for c in replaced.chars() {
        if c.is_whitespace() {
            if !in_whitespace {
                sanitized.push('_');
            }
            in_whitespace = true;
            continue;
        }
        in_whitespace = false;
        if matches!(c, '<' | '>' | ':' | '"' | '|' | '?' | '*') || (c as u32) < 0x20 {
            sanitized.push('_');
        } else {
            sanitized.push(c);
        }
    }

    let char_count = sanitized.chars().count();
    if char_count > MAX_FILE_NAME_LEN {
        // 扩展名本身过长时整体截断
        let dot = sanitized
            .rfind('.')
            .filter(|&i| i > 0 && sanitized[i..].chars().count() < MAX_FILE_NAME_LEN);
        sanitized = match dot {
            Some(dot) => {
                let ext = sanitized[dot..].to_string();
                let keep = MAX_FILE_NAME_LEN - ext.chars().count();
                let stem: String = sanitized.chars().take(keep).collect();
                format!("{}{}", stem, ext)
            }
            None => sanitized.chars().take(MAX_FILE_NAME_LEN).collect(),
        };
    }

    if sanitized.is_empty() {
        DEFAULT_FILE_NAME.to_string()
    } else {
        sanitized
    }
}

/// 一次合并任务的输入
#[derive(Debug, Clone)]
pub struct AssemblyJob {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub temp_dir: PathBuf,
}

/// 合并结果
#[derive(Debug, Clone)]
pub struct AssembledFile {
    pub path: PathBuf,
    pub bytes: u64,
    pub duration: Duration,
}

/// 分片合并器
#[derive(Debug, Clone)]
pub struct ChunkAssembler {
    final_dir: PathBuf,
    buffer_size: usize,
}

impl ChunkAssembler {
    pub fn new(final_dir: impl Into<PathBuf>, buffer_size: usize) -> Self {
        Self {
            final_dir: final_dir.into(),
            buffer_size: buffer_size.max(1),
        }
    }

    pub fn final_dir(&self) -> &Path {
        &self.final_dir
    }

    /// 最终文件路径：<final_dir>/<session_id>_<清洗后的文件名>
    pub fn final_path_for(&self, session_id: &str, file_name: &str) -> PathBuf {
        self.final_dir
            .join(format!("{}_{}", session_id, sanitize_file_name(file_name)))
    }

    /// 执行合并
    pub async fn assemble(&self, job: &AssemblyJob) -> UploadResult<AssembledFile> {
        let start = Instant::now();
        info!(
            "[{}] 开始合并: {} 个分片, 期望大小 {} 字节",
            job.session_id, job.total_chunks, job.file_size
        );

        self.verify_all_present(job).await?;

        fs::create_dir_all(&self.final_dir).await?;

        let final_path = self.final_path_for(&job.session_id, &job.file_name);
        let staging_path = self.final_dir.join(format!(
            ".{}.{}.assembling",
            job.session_id,
            uuid::Uuid::new_v4().simple()
        ));

        let written = match self.copy_chunks(job, &staging_path).await {
            Ok(n) => n,
            Err(e) => {
                let _ = fs::remove_file(&staging_path).await;
                return Err(e);
            }
        };

        // 以磁盘上的实际长度为准
        let actual = match fs::metadata(&staging_path).await {
            Ok(meta) => meta.len(),
            Err(_) => written,
        };

        if actual != job.file_size {
            let _ = fs::remove_file(&staging_path).await;
            let percent = if job.file_size == 0 {
                100.0
            } else {
                job.file_size.abs_diff(actual) as f64 / job.file_size as f64 * 100.0
            };
            warn!(
                "[{}] 合并后大小不一致: 期望 {} 实际 {} ({:.2}%)，已删除输出文件",
                job.session_id, job.file_size, actual, percent
            );
            return Err(UploadError::SizeMismatch {
                expected: job.file_size,
                actual,
                percent,
            });
        }

        if let Err(e) = fs::rename(&staging_path, &final_path).await {
            let _ = fs::remove_file(&staging_path).await;
            return Err(e.into());
        }

        if let Err(e) = ChunkStorage::remove_dir(&job.temp_dir).await {
            // 最终文件已就绪，临时目录留给过期清理
            warn!("[{}] 清理分片临时目录失败: {}", job.session_id, e);
        }

        let duration = start.elapsed();
        info!(
            "[{}] 合并完成: {:?} ({} 字节, 耗时 {:.2}s)",
            job.session_id,
            final_path,
            actual,
            duration.as_secs_f64()
        );

        Ok(AssembledFile {
            path: final_path,
            bytes: actual,
            duration,
        })
    }

    async fn verify_all_present(&self, job: &AssemblyJob) -> UploadResult<()> {
        for index in 0..job.total_chunks {
            let path = job.temp_dir.join(chunk_file_name(index));
            if !fs::try_exists(&path).await.unwrap_or(false) {
                warn!("[{}] 分片文件缺失: {:?}", job.session_id, path);
                return Err(UploadError::MissingChunk { index });
            }
        }
        Ok(())
    }

    async fn copy_chunks(&self, job: &AssemblyJob, target: &Path) -> UploadResult<u64> {
        let out = File::create(target).await?;
        let mut writer = BufWriter::with_capacity(self.buffer_size, out);
        let mut buffer = vec![0u8; self.buffer_size];
        let mut total: u64 = 0;

        for index in 0..job.total_chunks {
            let path = job.temp_dir.join(chunk_file_name(index));
            let mut chunk = match File::open(&path).await {
                Ok(f) => f,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    return Err(UploadError::MissingChunk { index });
                }
                Err(e) => return Err(e.into()),
            };

            loop {
                let n = chunk.read(&mut buffer).await?;
                if n == 0 {
                    break;
                }
                writer.write_all(&buffer[..n]).await?;
                total += n as u64;
            }

            let done = index + 1;
            if done % 100 == 0 || done == job.total_chunks {
                debug!(
                    "[{}] 合并进度: {}/{} ({:.1}%)",
                    job.session_id,
                    done,
                    job.total_chunks,
                    done as f64 * 100.0 / job.total_chunks as f64
                );
            }
        }

        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        Ok(total)
    }
}
