// 自适应分片上传模块
//
// 组件（自底向上）：
// - speed: 单会话吞吐统计与网络状况分级
// - chunk: 分片大小计算
// - task: 上传会话与状态机
// - store: 会话存储
// - storage: 分片临时文件
// - assembler: 分片合并与完整性校验
// - coordinator: 对外操作入口

pub mod assembler;
pub mod chunk;
pub mod coordinator;
pub mod error;
pub mod response;
pub mod speed;
pub mod storage;
pub mod store;
pub mod task;

pub use assembler::{sanitize_file_name, AssembledFile, AssemblyJob, ChunkAssembler};
pub use chunk::{
    calculate_optimal_chunk_size, estimate_upload_seconds, recommended_for_condition,
    should_adapt, DeviceType, DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE,
};
pub use coordinator::{
    ChunkUpload, ExpirySweep, InitUpload, UploadCoordinator, MULTIPART_OVERHEAD_BYTES,
};
pub use error::{UploadError, UploadResult};
pub use response::{SessionSummary, UploadSnapshot};
pub use speed::{NetworkCondition, SpeedStats, SpeedTracker};
pub use storage::ChunkStorage;
pub use store::{InMemorySessionStore, SessionHandle, SessionStore};
pub use task::{UploadSession, UploadStatus};
