// 分片上传协调器
//
// 对外提供 init / accept_chunk / status / cancel / list_active / expire_idle
//
// 并发模型：
// - 不同会话之间没有共享锁
// - 同一会话的字段修改在该会话自己的锁内完成，锁内不做任何 IO
// - 分片写盘在锁外进行（不同索引写入不同文件，互不冲突）
// - UPLOADING → ASSEMBLING 的迁移在锁内完成，保证每个会话只合并一次

use futures::future::join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use super::assembler::{AssembledFile, AssemblyJob, ChunkAssembler};
use super::chunk::{
    calculate_optimal_chunk_size, estimate_upload_seconds, should_adapt, total_chunks_for,
    DeviceType,
};
use super::error::{UploadError, UploadResult};
use super::response::{SessionSummary, UploadSnapshot};
use super::storage::{checksum_bytes, ChunkStorage};
use super::store::{SessionHandle, SessionStore};
use super::task::{NewSession, UploadSession, UploadStatus};
use crate::common::infer_mime_type;
use crate::config::UploadConfig;

/// 为 multipart 字段头预留的请求体空间
pub const MULTIPART_OVERHEAD_BYTES: u64 = 64 * 1024;

/// 初始化上传的参数
#[derive(Debug, Clone, Default)]
pub struct InitUpload {
    pub file_name: String,
    pub file_size: u64,
    /// 客户端给出的分片总数（仅作参考）
    pub total_chunks: Option<u32>,
    /// 客户端指定的分片大小
    pub chunk_size: Option<u64>,
    /// 客户端测得的网络速度
    pub network_speed_mbps: Option<f64>,
    pub device: DeviceType,
    pub user_id: String,
    pub client_addr: Option<String>,
}

/// 一个分片的上传请求
#[derive(Debug, Clone, Copy)]
pub struct ChunkUpload<'a> {
    pub upload_id: &'a str,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub data: &'a [u8],
    /// 可选的 SHA-256（十六进制）
    pub checksum: Option<&'a str>,
}

/// 分片大小调整建议
#[derive(Debug, Clone)]
struct Adaptation {
    recommended: u64,
    reason: String,
}

/// 分片落盘后的记账结果
enum Recorded {
    /// 会话已结束，分片被丢弃
    Dropped(UploadSnapshot),
    Progress(UploadSnapshot),
    /// 所有分片到齐，由当前请求负责合并
    Assemble(AssemblyJob),
}

/// 闲置清理结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpirySweep {
    /// 本次标记为 EXPIRED 的会话数
    pub expired: usize,
    /// 本次从存储中移除的终态会话数
    pub removed: usize,
}

/// 分片上传协调器
pub struct UploadCoordinator {
    store: Arc<dyn SessionStore>,
    storage: ChunkStorage,
    assembler: ChunkAssembler,
    max_file_size: u64,
    /// 单个分片上限，受请求体大小限制
    max_chunk_size: u64,
}

impl UploadCoordinator {
    pub fn new(
        store: Arc<dyn SessionStore>,
        storage: ChunkStorage,
        assembler: ChunkAssembler,
        max_file_size: u64,
    ) -> Self {
        Self {
            store,
            storage,
            assembler,
            max_file_size,
            max_chunk_size: u64::MAX,
        }
    }

    pub fn with_max_chunk_size(mut self, max_chunk_size: u64) -> Self {
        self.max_chunk_size = max_chunk_size;
        self
    }

    /// 从上传配置创建
    pub fn from_config(store: Arc<dyn SessionStore>, config: &UploadConfig) -> Self {
        Self::new(
            store,
            ChunkStorage::new(&config.temp_dir),
            ChunkAssembler::new(&config.final_dir, config.buffer_size),
            config.max_file_size,
        )
        .with_max_chunk_size(
            (config.max_request_bytes as u64).saturating_sub(MULTIPART_OVERHEAD_BYTES),
        )
    }

    pub fn max_file_size(&self) -> u64 {
        self.max_file_size
    }

    /// 初始化上传会话
    pub async fn init(&self, req: InitUpload) -> UploadResult<UploadSnapshot> {
        let file_name = req.file_name.trim().to_string();
        if file_name.is_empty() {
            return Err(UploadError::Validation("文件名不能为空".to_string()));
        }
        if req.file_size == 0 {
            return Err(UploadError::Validation("文件大小必须大于 0".to_string()));
        }
        if req.file_size > self.max_file_size {
            return Err(UploadError::Validation(format!(
                "文件大小 {} 超过上限 {}",
                req.file_size, self.max_file_size
            )));
        }

        let chunk_size = match req.chunk_size {
            Some(0) => {
                return Err(UploadError::Validation("分片大小必须大于 0".to_string()));
            }
            Some(size) => size,
            None => calculate_optimal_chunk_size(req.network_speed_mbps, Some(0.0), req.device),
        };
        if chunk_size > self.max_chunk_size {
            return Err(UploadError::Validation(format!(
                "分片大小 {} 超过单次请求上限 {}",
                chunk_size, self.max_chunk_size
            )));
        }

        let derived = u32::try_from(total_chunks_for(req.file_size, chunk_size)).map_err(|_| {
            UploadError::Validation(format!("分片大小 {} 过小，分片数量超出上限", chunk_size))
        })?;

        // 与计算值相差不超过 1 时保留客户端的值
        let total_chunks = match req.total_chunks {
            Some(hint) if hint > 0 && hint.abs_diff(derived) <= 1 => hint,
            Some(hint) => {
                warn!(
                    "客户端提供的分片总数 ({}) 与计算值 ({}) 不一致，使用计算值",
                    hint, derived
                );
                derived
            }
            None => derived,
        };

        let mut session = UploadSession::new(NewSession {
            user_id: req.user_id,
            client_addr: req.client_addr,
            file_type: infer_mime_type(&file_name).to_string(),
            file_name,
            file_size: req.file_size,
            total_chunks,
            chunk_size,
            temp_dir: PathBuf::new(),
        });
        session.device = req.device;
        let upload_id = session.id.clone();
        session.temp_dir = self.storage.session_dir(&upload_id);

        let handle = self.store.insert(session)?;

        if let Err(e) = self.storage.create_session_dir(&upload_id).await {
            error!("[{}] 创建分片临时目录失败: {}", upload_id, e);
            self.store.remove(&upload_id);
            return Err(e);
        }

        let s = handle.lock();
        info!(
            "[{}] 上传会话已创建: 文件={}, 大小={}, 分片={} x {} 字节, 用户={}",
            upload_id, s.file_name, s.file_size, s.total_chunks, s.chunk_size, s.user_id
        );

        let mut snapshot = UploadSnapshot::from_session(&s, "上传会话已创建");
        snapshot.expected_upload_seconds = req
            .network_speed_mbps
            .and_then(|speed| estimate_upload_seconds(s.file_size, speed));
        Ok(snapshot)
    }

    /// 接收一个分片
    pub async fn accept_chunk(&self, chunk: ChunkUpload<'_>) -> UploadResult<UploadSnapshot> {
        let started = Instant::now();
        let upload_id = chunk.upload_id;
        let index = chunk.chunk_index;
        let handle = self.handle(upload_id)?;

        // 1. 锁内校验
        let temp_dir = {
            let s = handle.lock();
            if !s.status().is_active() {
                return Err(UploadError::InvalidState(format!(
                    "会话 {} 状态为 {}，不接受分片",
                    upload_id,
                    s.status()
                )));
            }
            if chunk.total_chunks != s.total_chunks {
                return Err(UploadError::Validation(format!(
                    "分片总数不一致: 会话为 {}，请求为 {}",
                    s.total_chunks, chunk.total_chunks
                )));
            }
            if index >= chunk.total_chunks {
                return Err(UploadError::Validation(format!(
                    "分片索引 {} 超出范围 [0, {})",
                    index, chunk.total_chunks
                )));
            }
            if chunk.data.is_empty() {
                return Err(UploadError::Validation(format!("分片 {} 内容为空", index)));
            }
            if s.is_received(index) {
                // 幂等重试：只返回当前进度，不修改会话
                debug!("[{}] 分片 {} 已接收，忽略重复提交", upload_id, index);
                return Ok(UploadSnapshot::from_session(&s, "分片已接收").with_chunk_number(index));
            }
            s.temp_dir.clone()
        };

        if let Some(expected) = chunk.checksum {
            let actual = checksum_bytes(chunk.data);
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                return Err(UploadError::ChecksumMismatch {
                    index,
                    expected: expected.trim().to_string(),
                    actual,
                });
            }
        }

        // 2. 锁外写盘
        let write_result = ChunkStorage::save_chunk(&temp_dir, index, chunk.data).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;
        if let Err(e) = write_result {
            return Self::settle_write_error(&handle, upload_id, index, e);
        }

        // 3. 锁内记账，必要时切换到 ASSEMBLING
        let recorded = Self::record_chunk(
            &handle,
            upload_id,
            index,
            chunk.data.len() as u64,
            elapsed_ms,
        )?;
        let job = match recorded {
            Recorded::Dropped(snapshot) => {
                debug!("[{}] 会话已结束，丢弃迟到的分片 {}", upload_id, index);
                let _ = ChunkStorage::remove_dir(&temp_dir).await;
                return Ok(snapshot);
            }
            Recorded::Progress(snapshot) => return Ok(snapshot),
            Recorded::Assemble(job) => job,
        };

        // 4. 锁外合并
        info!("[{}] 所有分片已接收，开始合并", upload_id);
        let result = self.assembler.assemble(&job).await;

        // 5. 锁内写回结果
        Self::finish_assembly(&handle, upload_id, index, result).await
    }

    /// 写盘失败：会话已结束（取消/过期）时丢弃错误，否则返回错误
    fn settle_write_error(
        handle: &SessionHandle,
        upload_id: &str,
        index: u32,
        err: UploadError,
    ) -> UploadResult<UploadSnapshot> {
        let s = handle.lock();
        if s.status().is_active() {
            warn!("[{}] 分片 {} 写入失败: {}", upload_id, index, err);
            return Err(err);
        }
        debug!("[{}] 会话已结束，丢弃分片 {} 的写入错误", upload_id, index);
        Ok(UploadSnapshot::from_session(&s, "会话已结束").with_chunk_number(index))
    }

    /// 分片落盘后的记账
    fn record_chunk(
        handle: &SessionHandle,
        upload_id: &str,
        index: u32,
        bytes: u64,
        elapsed_ms: u64,
    ) -> UploadResult<Recorded> {
        let mut s = handle.lock();
        if !s.status().is_active() {
            return Ok(Recorded::Dropped(
                UploadSnapshot::from_session(&s, "会话已结束").with_chunk_number(index),
            ));
        }
        if !s.mark_received(index) {
            return Ok(Recorded::Progress(
                UploadSnapshot::from_session(&s, "分片已接收").with_chunk_number(index),
            ));
        }

        s.speed.record_sample(bytes, elapsed_ms);
        if s.status() == UploadStatus::Initialized {
            s.transition_to(UploadStatus::Uploading)?;
        }
        debug!(
            "[{}] 分片 {}/{} 已接收 ({:.1}%)",
            upload_id,
            index + 1,
            s.total_chunks,
            s.progress()
        );

        if s.is_complete() && s.status() == UploadStatus::Uploading {
            s.transition_to(UploadStatus::Assembling)?;
            return Ok(Recorded::Assemble(AssemblyJob {
                session_id: s.id.clone(),
                file_name: s.file_name.clone(),
                file_size: s.file_size,
                total_chunks: s.total_chunks,
                temp_dir: s.temp_dir.clone(),
            }));
        }

        let mut snapshot =
            UploadSnapshot::from_session(&s, "分片上传成功").with_chunk_number(index);
        if let Some(adaptation) = Self::adaptation_for(&s) {
            snapshot.adapted_in_this_request = true;
            snapshot.new_recommended_chunk_size = Some(adaptation.recommended);
            snapshot.adaptation_reason = Some(adaptation.reason);
        }
        Ok(Recorded::Progress(snapshot))
    }

    /// 写回合并结果；合并期间会话被取消时删除生成的文件
    async fn finish_assembly(
        handle: &SessionHandle,
        upload_id: &str,
        index: u32,
        result: UploadResult<AssembledFile>,
    ) -> UploadResult<UploadSnapshot> {
        let (snapshot, orphan) = {
            let mut s = handle.lock();
            match result {
                Ok(file) if s.status() == UploadStatus::Assembling => {
                    s.final_path = Some(file.path);
                    s.transition_to(UploadStatus::Completed)?;
                    (
                        UploadSnapshot::from_session(&s, "上传完成").with_chunk_number(index),
                        None,
                    )
                }
                Ok(file) => (
                    UploadSnapshot::from_session(&s, "会话已结束").with_chunk_number(index),
                    Some(file.path),
                ),
                Err(e) => {
                    error!("[{}] 合并失败: {}", upload_id, e);
                    s.mark_failed(e.to_string());
                    return Err(e);
                }
            }
        };

        if let Some(path) = orphan {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                warn!("[{}] 删除已取消会话的合并文件失败: {}", upload_id, e);
            }
        } else {
            info!(
                "[{}] 上传完成: {:?}",
                upload_id,
                snapshot.final_file_path.as_deref().unwrap_or_default()
            );
        }

        Ok(snapshot)
    }

    /// 查询会话状态
    pub fn status(&self, upload_id: &str) -> UploadResult<UploadSnapshot> {
        let handle = self.handle(upload_id)?;
        let s = handle.lock();
        Ok(UploadSnapshot::from_session(&s, "查询成功").with_missing_chunks(&s))
    }

    /// 取消会话：移除记录并删除临时目录，会话不存在时也返回成功
    ///
    /// 返回会话是否存在
    pub async fn cancel(&self, upload_id: &str) -> UploadResult<bool> {
        let Some(handle) = self.store.remove(upload_id) else {
            debug!("[{}] 取消的会话不存在，忽略", upload_id);
            return Ok(false);
        };

        let temp_dir = {
            let mut s = handle.lock();
            if !s.status().is_terminal() {
                s.transition_to(UploadStatus::Cancelled)?;
            }
            s.temp_dir.clone()
        };

        if let Err(e) = ChunkStorage::remove_dir(&temp_dir).await {
            // 迟到的写入会在自己完成后再次清理
            warn!("[{}] 取消时清理临时目录失败: {}", upload_id, e);
        }
        info!("[{}] 上传会话已取消", upload_id);
        Ok(true)
    }

    /// 当前所有会话的摘要（按创建时间倒序）
    pub fn list_active(&self) -> Vec<SessionSummary> {
        let mut list: Vec<SessionSummary> = self
            .store
            .list()
            .iter()
            .map(|h| SessionSummary::from(&*h.lock()))
            .collect();
        list.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        list
    }

    /// 清理闲置会话
    ///
    /// - 非终态且超过 `timeout` 无活动：标记 EXPIRED 并删除临时目录
    /// - 终态且超过 `timeout` 无活动：从存储中移除
    /// - 合并中的会话不处理
    pub async fn expire_idle(&self, timeout: Duration) -> ExpirySweep {
        let mut sweep = ExpirySweep::default();
        let mut dirs = Vec::new();

        for handle in self.store.list() {
            let (id, remove) = {
                let mut s = handle.lock();
                if s.last_activity.elapsed() <= timeout || s.status() == UploadStatus::Assembling
                {
                    continue;
                }
                if s.status().is_terminal() {
                    dirs.push(s.temp_dir.clone());
                    (s.id.clone(), true)
                } else {
                    if s.transition_to(UploadStatus::Expired).is_err() {
                        continue;
                    }
                    s.error_message = Some("上传会话闲置超时".to_string());
                    dirs.push(s.temp_dir.clone());
                    sweep.expired += 1;
                    (s.id.clone(), false)
                }
            };
            if remove && self.store.remove(&id).is_some() {
                sweep.removed += 1;
            }
        }

        let results = join_all(dirs.iter().map(|dir| ChunkStorage::remove_dir(dir))).await;
        for (dir, result) in dirs.iter().zip(results) {
            if let Err(e) = result {
                warn!("清理过期会话目录失败: {:?}, 错误: {}", dir, e);
            }
        }

        if sweep.expired > 0 || sweep.removed > 0 {
            info!(
                "闲置会话清理完成: 过期 {} 个, 移除 {} 个",
                sweep.expired, sweep.removed
            );
        }
        sweep
    }

    /// 存储中的会话数量（含终态）
    pub fn session_count(&self) -> usize {
        self.store.len()
    }

    fn handle(&self, upload_id: &str) -> UploadResult<SessionHandle> {
        self.store
            .get(upload_id)
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
    }

    /// 波动率已知后，根据实测速度给出分片大小建议
    ///
    /// 会话自身的分片大小不变（已上传分片的边界必须保持一致）
    fn adaptation_for(session: &UploadSession) -> Option<Adaptation> {
        let variance = session.speed.variance_percent()?;
        let average = session.speed.average()?;
        let recommended =
            calculate_optimal_chunk_size(Some(average), Some(variance), session.device);
        if !should_adapt(session.chunk_size, recommended) {
            return None;
        }
        Some(Adaptation {
            recommended,
            reason: format!(
                "网络状况 {}: 平均 {:.2} Mbps, 波动 {:.1}%",
                session.speed.condition(),
                average,
                variance
            ),
        })
    }
}
