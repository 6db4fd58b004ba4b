// 分片临时存储
//
// 布局：<temp_root>/<session_id>/chunk_<index>
// 写入先落到唯一的 .part 文件再 rename，读者永远看不到半个分片

use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use super::error::UploadResult;

/// 分片文件名
pub fn chunk_file_name(index: u32) -> String {
    format!("chunk_{}", index)
}

/// 分片内容的 SHA-256（十六进制小写）
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// 分片临时存储
#[derive(Debug, Clone)]
pub struct ChunkStorage {
    temp_root: PathBuf,
}

impl ChunkStorage {
    pub fn new(temp_root: impl Into<PathBuf>) -> Self {
        Self {
            temp_root: temp_root.into(),
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    /// 会话临时目录路径（不创建）
    pub fn session_dir(&self, session_id: &str) -> PathBuf {
        self.temp_root.join(session_id)
    }

    /// 创建会话临时目录
    pub async fn create_session_dir(&self, session_id: &str) -> UploadResult<PathBuf> {
        let dir = self.session_dir(session_id);
        fs::create_dir_all(&dir).await?;
        debug!("创建分片临时目录: {:?}", dir);
        Ok(dir)
    }

    /// 保存一个分片，返回写入字节数
    ///
    /// 不会创建缺失的目录：会话被取消后目录已删除，迟到的写入直接失败
    pub async fn save_chunk(dir: &Path, index: u32, data: &[u8]) -> UploadResult<u64> {
        let final_path = dir.join(chunk_file_name(index));
        let part_path = dir.join(format!(
            "{}.{}.part",
            chunk_file_name(index),
            uuid::Uuid::new_v4().simple()
        ));

        let result = async {
            let mut file = fs::File::create(&part_path).await?;
            file.write_all(data).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&part_path, &final_path).await
        }
        .await;

        if let Err(e) = result {
            let _ = fs::remove_file(&part_path).await;
            return Err(e.into());
        }

        debug!("分片已保存: {:?} ({} bytes)", final_path, data.len());
        Ok(data.len() as u64)
    }

    /// 删除会话临时目录，目录不存在时视为成功
    pub async fn remove_dir(dir: &Path) -> io::Result<()> {
        match fs::remove_dir_all(dir).await {
            Ok(()) => {
                debug!("已删除分片临时目录: {:?}", dir);
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!("删除分片临时目录失败: {:?}, 错误: {}", dir, e);
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_chunk_layout() {
        let tmp = TempDir::new().unwrap();
        let storage = ChunkStorage::new(tmp.path());
        let dir = storage.create_session_dir("s1").await.unwrap();

        let written = ChunkStorage::save_chunk(&dir, 3, b"hello").await.unwrap();
        assert_eq!(written, 5);

        let content = std::fs::read(dir.join("chunk_3")).unwrap();
        assert_eq!(content, b"hello");

        // 不残留 .part 文件
        let names: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["chunk_3".to_string()]);
    }

    #[tokio::test]
    async fn test_save_into_removed_dir_fails() {
        let tmp = TempDir::new().unwrap();
        let storage = ChunkStorage::new(tmp.path());
        let dir = storage.create_session_dir("gone").await.unwrap();
        ChunkStorage::remove_dir(&dir).await.unwrap();

        assert!(ChunkStorage::save_chunk(&dir, 0, b"x").await.is_err());
        assert!(!dir.exists());
        // 重复删除是幂等的
        ChunkStorage::remove_dir(&dir).await.unwrap();
    }

    #[test]
    fn test_checksum_bytes() {
        assert_eq!(
            checksum_bytes(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
