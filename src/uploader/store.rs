// 上传会话存储
//
// 存储本身只保证插入/查询/删除的原子性；
// 单个会话字段的修改由调用方持有该会话自己的锁完成

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;

use super::error::{UploadError, UploadResult};
use super::task::UploadSession;

/// 会话句柄：每个会话一把独立的锁
pub type SessionHandle = Arc<Mutex<UploadSession>>;

/// 会话存储抽象
pub trait SessionStore: Send + Sync {
    /// 插入新会话，ID 冲突时失败
    fn insert(&self, session: UploadSession) -> UploadResult<SessionHandle>;

    fn get(&self, id: &str) -> Option<SessionHandle>;

    /// 删除会话，返回被删除的句柄
    fn remove(&self, id: &str) -> Option<SessionHandle>;

    /// 当前所有会话的句柄快照
    fn list(&self) -> Vec<SessionHandle>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// 基于 DashMap 的内存存储（进程重启后丢失）
#[derive(Debug, Default)]
pub struct InMemorySessionStore {
    sessions: DashMap<String, SessionHandle>,
}

impl InMemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for InMemorySessionStore {
    fn insert(&self, session: UploadSession) -> UploadResult<SessionHandle> {
        match self.sessions.entry(session.id.clone()) {
            Entry::Occupied(e) => Err(UploadError::Internal(format!(
                "会话ID冲突: {}",
                e.key()
            ))),
            Entry::Vacant(e) => {
                let handle = Arc::new(Mutex::new(session));
                e.insert(handle.clone());
                Ok(handle)
            }
        }
    }

    fn get(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.get(id).map(|r| r.value().clone())
    }

    fn remove(&self, id: &str) -> Option<SessionHandle> {
        self.sessions.remove(id).map(|(_, handle)| handle)
    }

    fn list(&self) -> Vec<SessionHandle> {
        self.sessions.iter().map(|r| r.value().clone()).collect()
    }

    fn len(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::task::NewSession;
    use std::path::PathBuf;

    fn params() -> NewSession {
        NewSession {
            user_id: "u".to_string(),
            client_addr: Some("127.0.0.1".to_string()),
            file_name: "f.txt".to_string(),
            file_size: 10,
            file_type: "text/plain".to_string(),
            total_chunks: 1,
            chunk_size: 10,
            temp_dir: PathBuf::from("/tmp/x"),
        }
    }

    #[test]
    fn test_insert_get_remove() {
        let store = InMemorySessionStore::new();
        let session = UploadSession::new(params());
        let id = session.id.clone();

        store.insert(session).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get(&id).unwrap().lock().file_name, "f.txt");

        assert!(store.remove(&id).is_some());
        assert!(store.get(&id).is_none());
        assert!(store.remove(&id).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_id_collision_rejected() {
        let store = InMemorySessionStore::new();
        store
            .insert(UploadSession::with_id("dup".to_string(), params()))
            .unwrap();
        let err = store
            .insert(UploadSession::with_id("dup".to_string(), params()))
            .unwrap_err();
        assert!(matches!(err, UploadError::Internal(_)));
        assert_eq!(store.len(), 1);
    }
}
